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

use crate::model::element::{Ear, EarStatus, Element, ElementIteration};
use crate::model::parameter::ParameterSource;
use crate::model::task::TaskTemplate;
use crate::store::{StoreTask, SubmissionRecord};

/// Partial update to a persisted EAR, applied on commit.
#[derive(Clone, Debug, Default)]
pub struct EarUpdate {
    pub status: Option<EarStatus>,
    pub exit_code: Option<i32>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub skip: Option<bool>,
}

/// Submit-time jobscript metadata recorded against (sub_idx, js_idx).
#[derive(Clone, Debug, Default)]
pub struct JobscriptMetadataUpdate {
    pub sub_idx: usize,
    pub js_idx: usize,
    pub submit_time: Option<DateTime<Utc>>,
    pub submit_hostname: Option<String>,
    pub submit_machine: Option<String>,
    pub submit_cmdline: Option<Vec<String>>,
    pub scheduler_job_id: Option<String>,
    pub process_id: Option<u32>,
    pub version_info: Option<BTreeMap<String, String>>,
    pub os_name: Option<String>,
    pub shell_name: Option<String>,
    pub scheduler_name: Option<String>,
}

/// Buffered mutations awaiting `commit_pending`.
///
/// All store writers accumulate here; the on-disk image only ever changes in
/// one atomic step when the buffer is flushed.
#[derive(Debug, Default)]
pub struct Pending {
    pub template_tasks: BTreeMap<usize, TaskTemplate>,
    pub tasks: BTreeMap<usize, StoreTask>,
    pub elements: BTreeMap<(usize, u64), Vec<Element>>,
    pub element_iterations: BTreeMap<(usize, u64, usize), Vec<ElementIteration>>,
    /// Keyed by (task_idx, task_insert_id, element_idx, iteration_idx).
    pub loop_idx: BTreeMap<(usize, u64, usize, usize), BTreeMap<String, usize>>,
    pub loops: Vec<serde_json::Value>,
    pub parameter_data: BTreeMap<usize, Option<serde_json::Value>>,
    pub parameter_sources: BTreeMap<usize, ParameterSource>,
    pub ears: BTreeMap<u64, Ear>,
    pub ear_updates: BTreeMap<u64, EarUpdate>,
    pub submissions: Vec<SubmissionRecord>,
    pub jobscript_metadata: Vec<JobscriptMetadataUpdate>,
    pub submitted_jobscripts: Vec<(usize, usize)>,
    pub remove_replaced_file_record: bool,
}

impl Pending {
    pub fn is_empty(&self) -> bool {
        self.template_tasks.is_empty()
            && self.tasks.is_empty()
            && self.elements.is_empty()
            && self.element_iterations.is_empty()
            && self.loop_idx.is_empty()
            && self.loops.is_empty()
            && self.parameter_data.is_empty()
            && self.parameter_sources.is_empty()
            && self.ears.is_empty()
            && self.ear_updates.is_empty()
            && self.submissions.is_empty()
            && self.jobscript_metadata.is_empty()
            && self.submitted_jobscripts.is_empty()
            && !self.remove_replaced_file_record
    }

    pub fn clear(&mut self) {
        *self = Pending::default();
    }
}
