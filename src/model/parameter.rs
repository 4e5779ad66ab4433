//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use serde::{Deserialize, Serialize};

/// Whether a task-sourced input draws from the referenced task's inputs or
/// outputs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskSourceType {
    Input,
    Output,
}

/// Provenance of one parameter data index.
///
/// A source, once recorded against a data index, is never rewritten.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ParameterSource {
    /// Literal value supplied with the task.
    Local,
    /// Default value from the task schema.
    Default,
    /// Produced or consumed by another task.
    Task {
        task_insert_id: u64,
        task_source_type: TaskSourceType,
    },
    /// Imported from a file.
    File { path: String },
}

impl ParameterSource {
    pub fn task_output(task_insert_id: u64) -> Self {
        ParameterSource::Task {
            task_insert_id,
            task_source_type: TaskSourceType::Output,
        }
    }

    pub fn task_input(task_insert_id: u64) -> Self {
        ParameterSource::Task {
            task_insert_id,
            task_source_type: TaskSourceType::Input,
        }
    }

    /// True for sources that refer to another task's output, i.e. those that
    /// create an inter-task dependency edge.
    pub fn is_task_output(&self) -> bool {
        matches!(
            self,
            ParameterSource::Task {
                task_source_type: TaskSourceType::Output,
                ..
            }
        )
    }
}
