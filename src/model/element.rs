//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::resources::ElementResources;

/// Exit code recorded for a run aborted via the control endpoint.
pub const ABORT_EXIT_CODE: i32 = 64;
/// Exit code recorded for a run skipped after an upstream failure in the same
/// element.
pub const SKIPPED_EXIT_CODE: i32 = 65;

/// Lifecycle state of an element-action-run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EarStatus {
    Pending,
    Prepared,
    Submitted,
    Running,
    Success,
    Error,
    Skipped,
    Aborted,
}

impl EarStatus {
    /// Legal next states per the run lifecycle. Anything else is rejected by
    /// the store.
    pub fn can_transition_to(self, next: EarStatus) -> bool {
        use EarStatus::*;
        match self {
            Pending => matches!(next, Prepared | Submitted | Skipped | Aborted),
            Prepared => matches!(next, Submitted | Skipped | Aborted),
            Submitted => matches!(next, Running | Skipped | Aborted),
            Running => matches!(next, Success | Error | Skipped | Aborted),
            Success | Error | Skipped | Aborted => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EarStatus::Success | EarStatus::Error | EarStatus::Skipped | EarStatus::Aborted
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            EarStatus::Pending => "pending",
            EarStatus::Prepared => "prepared",
            EarStatus::Submitted => "submitted",
            EarStatus::Running => "running",
            EarStatus::Success => "success",
            EarStatus::Error => "error",
            EarStatus::Skipped => "skipped",
            EarStatus::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for EarStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The atomic execution unit: one run of one action of one element iteration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ear {
    /// Globally unique, monotonically increasing, never reused.
    pub id: u64,
    pub task_insert_id: u64,
    pub element_idx: usize,
    pub iteration_idx: usize,
    pub action_idx: usize,
    pub run_idx: usize,
    pub resources: ElementResources,
    pub status: EarStatus,
    pub exit_code: Option<i32>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub skip: bool,
    /// Data indices the commands of this run read from, keyed by input path.
    pub data_in: BTreeMap<String, usize>,
    /// Data indices the commands of this run write to, keyed by output name.
    pub data_out: BTreeMap<String, usize>,
    /// EAR ids this run depends on (producers of its task-sourced inputs).
    pub dependencies: Vec<u64>,
}

/// One iteration of an element under zero or more loops.
///
/// Iteration 0 always exists; later iterations are initialised lazily when a
/// loop advances.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ElementIteration {
    pub iteration_idx: usize,
    /// {loop name -> iteration number}; empty when no loop overlays the task.
    pub loop_idx: BTreeMap<String, usize>,
    /// {action idx -> EAR ids of its runs}.
    pub actions: BTreeMap<usize, Vec<u64>>,
}

/// A single parametrisation of a task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Element {
    pub element_idx: usize,
    /// {input/output path -> parameter data index}.
    pub data_index: BTreeMap<String, usize>,
    pub iterations: Vec<ElementIteration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        assert!(EarStatus::Pending.can_transition_to(EarStatus::Submitted));
        assert!(EarStatus::Submitted.can_transition_to(EarStatus::Running));
        assert!(EarStatus::Running.can_transition_to(EarStatus::Success));
        assert!(EarStatus::Running.can_transition_to(EarStatus::Error));
        assert!(EarStatus::Pending.can_transition_to(EarStatus::Skipped));
        assert!(EarStatus::Running.can_transition_to(EarStatus::Aborted));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!EarStatus::Pending.can_transition_to(EarStatus::Running));
        assert!(!EarStatus::Success.can_transition_to(EarStatus::Running));
        assert!(!EarStatus::Skipped.can_transition_to(EarStatus::Pending));
        assert!(!EarStatus::Error.can_transition_to(EarStatus::Success));
    }
}
