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
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::resources::ElementResources;
use crate::plan::deps::{ResolvedBlock, ResolvedJobscript};
use crate::store::pending::JobscriptMetadataUpdate;

/// Delimiter between per-action EAR ids in the EAR-ID file.
pub const EAR_FILES_DELIMITER: char = ':';

/// Dependency of one block on an earlier `(jobscript, block)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockDependency {
    pub js_idx: usize,
    pub block_idx: usize,
    /// {dependent js-element -> upstream js-elements}.
    pub js_element_mapping: BTreeMap<usize, Vec<usize>>,
    pub is_array: bool,
}

/// Rectangular `(actions x elements)` grid of EAR ids within a jobscript.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobscriptBlockRecord {
    pub task_insert_ids: Vec<u64>,
    /// (task insert ID, action_idx, index into `task_loop_idx`) per row.
    pub task_actions: Vec<(u64, usize, usize)>,
    /// {js-element idx -> task-element idx per task}.
    pub task_elements: BTreeMap<usize, Vec<usize>>,
    pub task_loop_idx: Vec<BTreeMap<String, usize>>,
    /// `-1` cells mean "skip this action" for that element.
    pub ear_ids: Vec<Vec<i64>>,
    pub dependencies: Vec<BlockDependency>,
}

impl JobscriptBlockRecord {
    pub fn num_actions(&self) -> usize {
        self.ear_ids.len()
    }

    pub fn num_elements(&self) -> usize {
        self.ear_ids.first().map(|r| r.len()).unwrap_or(0)
    }

    pub fn all_ear_ids(&self) -> Vec<u64> {
        self.ear_ids
            .iter()
            .flatten()
            .filter(|v| **v >= 0)
            .map(|v| *v as u64)
            .collect()
    }

    /// One line per js-element: the `:`-delimited EAR id per action.
    pub fn format_ear_id_lines(&self) -> String {
        let mut out = String::new();
        for elem in 0..self.num_elements() {
            let line = self
                .ear_ids
                .iter()
                .map(|row| row[elem].to_string())
                .collect::<Vec<_>>()
                .join(&EAR_FILES_DELIMITER.to_string());
            let _ = writeln!(out, "{}", line);
        }
        out
    }
}

impl From<ResolvedBlock> for JobscriptBlockRecord {
    fn from(block: ResolvedBlock) -> Self {
        JobscriptBlockRecord {
            task_insert_ids: block.task_insert_ids,
            task_actions: block.task_actions,
            task_elements: block.task_elements,
            task_loop_idx: block.task_loop_idx,
            ear_ids: block.ear_ids,
            dependencies: block
                .dependencies
                .into_iter()
                .map(|((js_idx, block_idx), dep)| BlockDependency {
                    js_idx,
                    block_idx,
                    js_element_mapping: dep.js_element_mapping,
                    is_array: dep.is_array,
                })
                .collect(),
        }
    }
}

/// One submittable unit: a resource record plus one or more blocks, and the
/// submit-time metadata captured when it goes out.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobscriptRecord {
    pub index: usize,
    pub is_array: bool,
    pub resources: ElementResources,
    pub blocks: Vec<JobscriptBlockRecord>,
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

impl JobscriptRecord {
    pub fn from_resolved(index: usize, resolved: ResolvedJobscript) -> Self {
        JobscriptRecord {
            index,
            is_array: resolved.is_array,
            resources: resolved.resources,
            blocks: resolved.blocks.into_iter().map(Into::into).collect(),
            submit_time: None,
            submit_hostname: None,
            submit_machine: None,
            submit_cmdline: None,
            scheduler_job_id: None,
            process_id: None,
            version_info: None,
            os_name: None,
            shell_name: None,
            scheduler_name: None,
        }
    }

    pub fn os_name(&self) -> &str {
        self.os_name
            .as_deref()
            .unwrap_or_else(|| self.resources.os_name())
    }

    pub fn shell_name(&self) -> &str {
        self.shell_name
            .as_deref()
            .unwrap_or_else(|| self.resources.shell_name())
    }

    pub fn scheduler_name(&self) -> &str {
        self.scheduler_name
            .as_deref()
            .unwrap_or_else(|| self.resources.scheduler_name())
    }

    pub fn is_scheduled(&self) -> bool {
        !matches!(self.scheduler_name(), "direct" | "direct_posix")
    }

    pub fn all_ear_ids(&self) -> Vec<u64> {
        self.blocks.iter().flat_map(|b| b.all_ear_ids()).collect()
    }

    /// Dependencies on other jobscripts: internal block-to-block edges are
    /// dropped, array-ness is kept per edge.
    pub fn external_dependencies(&self) -> BTreeMap<usize, bool> {
        let mut out = BTreeMap::new();
        for block in &self.blocks {
            for dep in &block.dependencies {
                if dep.js_idx == self.index {
                    continue;
                }
                out.insert(dep.js_idx, dep.is_array);
            }
        }
        out
    }

    pub fn apply_metadata(&mut self, update: &JobscriptMetadataUpdate) {
        if update.submit_time.is_some() {
            self.submit_time = update.submit_time;
        }
        if let Some(v) = &update.submit_hostname {
            self.submit_hostname = Some(v.clone());
        }
        if let Some(v) = &update.submit_machine {
            self.submit_machine = Some(v.clone());
        }
        if let Some(v) = &update.submit_cmdline {
            self.submit_cmdline = Some(v.clone());
        }
        if let Some(v) = &update.scheduler_job_id {
            self.scheduler_job_id = Some(v.clone());
        }
        if update.process_id.is_some() {
            self.process_id = update.process_id;
        }
        if let Some(v) = &update.version_info {
            self.version_info = Some(v.clone());
        }
        if let Some(v) = &update.os_name {
            self.os_name = Some(v.clone());
        }
        if let Some(v) = &update.shell_name {
            self.shell_name = Some(v.clone());
        }
        if let Some(v) = &update.scheduler_name {
            self.scheduler_name = Some(v.clone());
        }
    }

    // file names within the submission directory

    pub fn ear_id_file_name(&self) -> String {
        format!("js_{}_EAR_IDs.txt", self.index)
    }

    pub fn jobscript_file_name(&self, ext: &str) -> String {
        format!("js_{}{}", self.index, ext)
    }

    pub fn functions_file_name(&self, ext: &str) -> String {
        format!("js_funcs_{}{}", self.index, ext)
    }

    pub fn direct_stdout_file_name(&self) -> String {
        format!("js_{}_stdout.log", self.index)
    }

    pub fn direct_stderr_file_name(&self) -> String {
        format!("js_{}_stderr.log", self.index)
    }

    pub fn direct_std_out_err_file_name(&self) -> String {
        format!("js_{}_std.log", self.index)
    }
}

/// An ordered list of jobscripts sharing one submission directory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub index: usize,
    pub jobscripts: Vec<JobscriptRecord>,
    pub submitted_jobscripts: Vec<usize>,
}

impl SubmissionRecord {
    pub fn new(index: usize, jobscripts: Vec<JobscriptRecord>) -> Self {
        SubmissionRecord {
            index,
            jobscripts,
            submitted_jobscripts: Vec::new(),
        }
    }

    pub fn outstanding_jobscripts(&self) -> Vec<usize> {
        (0..self.jobscripts.len())
            .filter(|i| !self.submitted_jobscripts.contains(i))
            .collect()
    }

    pub fn needs_submit(&self) -> bool {
        !self.outstanding_jobscripts().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(ear_ids: Vec<Vec<i64>>) -> JobscriptBlockRecord {
        JobscriptBlockRecord {
            task_insert_ids: vec![0],
            task_actions: (0..ear_ids.len()).map(|a| (0, a, 0)).collect(),
            task_elements: BTreeMap::new(),
            task_loop_idx: vec![BTreeMap::new()],
            ear_ids,
            dependencies: vec![],
        }
    }

    #[test]
    fn test_ear_id_file_lines_are_transposed() {
        let b = block(vec![vec![10, 11, 12], vec![20, -1, 22]]);
        assert_eq!(b.format_ear_id_lines(), "10:20\n11:-1\n12:22\n");
    }

    #[test]
    fn test_external_dependencies_skip_internal() {
        let mut b0 = block(vec![vec![0]]);
        b0.dependencies.push(BlockDependency {
            js_idx: 2,
            block_idx: 0,
            js_element_mapping: BTreeMap::new(),
            is_array: true,
        });
        let mut b1 = block(vec![vec![1]]);
        b1.dependencies.push(BlockDependency {
            js_idx: 3,
            block_idx: 0,
            js_element_mapping: BTreeMap::new(),
            is_array: false,
        });

        let mut js = JobscriptRecord::from_resolved(
            3,
            ResolvedJobscript {
                resources: ElementResources::default(),
                is_array: false,
                blocks: vec![],
            },
        );
        js.blocks = vec![b0, b1];

        let deps = js.external_dependencies();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[&2], true);
    }

    #[test]
    fn test_roundtrip_record() {
        let js = JobscriptRecord::from_resolved(
            0,
            ResolvedJobscript {
                resources: ElementResources::default(),
                is_array: true,
                blocks: vec![],
            },
        );
        let sub = SubmissionRecord::new(0, vec![js]);
        let text = serde_json::to_string(&sub).unwrap();
        let back: SubmissionRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(back.jobscripts.len(), 1);
        assert!(back.jobscripts[0].is_array);
        assert!(back.needs_submit());
    }
}
