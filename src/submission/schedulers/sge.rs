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
use std::path::Path;

use crate::error::{Error, Result};
use crate::model::resources::ElementResources;
use crate::submission::schedulers::{JobState, Scheduler};
use crate::submission::JobscriptElementState;

/// SGE adapter (`qsub`/`qstat`/`qdel`). Jobs run serially by default; the
/// `-cwd` switch keeps them in the submission working directory.
#[derive(Clone, Debug)]
pub struct SgePosix {
    submit_cmd: String,
    show_cmd: String,
    del_cmd: String,
    parallel_env: String,
}

impl Default for SgePosix {
    fn default() -> Self {
        SgePosix {
            submit_cmd: String::from("qsub"),
            show_cmd: String::from("qstat"),
            del_cmd: String::from("qdel"),
            parallel_env: String::from("smp.pe"),
        }
    }
}

impl SgePosix {
    pub fn del_command(&self, job_id: &str) -> Vec<String> {
        vec![self.del_cmd.clone(), job_id.to_string()]
    }

    fn state_from_code(code: &str) -> JobscriptElementState {
        match code {
            "qw" | "hqw" => JobscriptElementState::Pending,
            "r" | "t" | "sr" => JobscriptElementState::Running,
            "dr" | "dt" => JobscriptElementState::Cancelled,
            code if code.starts_with('E') => JobscriptElementState::Errored,
            _ => JobscriptElementState::Waiting,
        }
    }
}

impl Scheduler for SgePosix {
    fn name(&self) -> &'static str {
        "sge"
    }

    fn js_directive_prefix(&self) -> &'static str {
        "#$"
    }

    fn array_item_var(&self) -> &'static str {
        "SGE_TASK_ID"
    }

    fn format_directives(
        &self,
        resources: &ElementResources,
        num_elements: usize,
        is_array: bool,
    ) -> String {
        let prefix = self.js_directive_prefix();
        let num_cores = resources.num_cores.unwrap_or(1);

        let mut lines = vec![format!("{} -cwd", prefix)];
        if num_cores > 1 {
            lines.push(format!("{} -pe {} {}", prefix, self.parallel_env, num_cores));
        }
        if is_array {
            lines.push(format!("{} -t 1-{}", prefix, num_elements));
        }
        for (key, value) in &resources.scheduler_args {
            lines.push(format!("{} -{} {}", prefix, key, value));
        }
        lines.join("\n")
    }

    fn get_submit_command(&self, js_path: &Path, deps: &[(String, bool)]) -> Vec<String> {
        let mut cmd = vec![self.submit_cmd.clone(), String::from("-terse")];

        let mut hold_ids = Vec::new();
        let mut hold_ids_array = Vec::new();
        for (job_id, is_array_dep) in deps {
            if *is_array_dep {
                hold_ids_array.push(job_id.clone());
            } else {
                hold_ids.push(job_id.clone());
            }
        }
        if !hold_ids.is_empty() {
            cmd.push(String::from("-hold_jid"));
            cmd.push(hold_ids.join(","));
        }
        if !hold_ids_array.is_empty() {
            cmd.push(String::from("-hold_jid_ad"));
            cmd.push(hold_ids_array.join(","));
        }

        cmd.push(js_path.display().to_string());
        cmd
    }

    fn parse_submission_output(&self, stdout: &str, _stderr: &str) -> Result<String> {
        // submitted with -terse: stdout is the job id (array form "<id>.lo-hi")
        let job_id = stdout.trim().split('.').next().unwrap_or("").to_string();
        if job_id.is_empty() || !job_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::Runtime(format!(
                "Cannot parse SGE job ID from stdout: {:?}",
                stdout
            )));
        }
        Ok(job_id)
    }

    fn version_command(&self) -> Vec<String> {
        vec![self.show_cmd.clone(), String::from("-help")]
    }

    fn parse_version_info(&self, stdout: &str) -> Result<BTreeMap<String, String>> {
        let first_line = stdout.lines().next().unwrap_or("").trim();
        let mut parts = first_line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(name), Some(version)) => {
                let mut out = BTreeMap::new();
                out.insert(String::from("scheduler_name"), name.to_string());
                out.insert(String::from("scheduler_version"), version.to_string());
                Ok(out)
            }
            _ => Err(Error::Runtime(format!(
                "Failed to parse SGE version information from: {:?}",
                stdout
            ))),
        }
    }

    fn state_query_command(&self, _js_refs: &[String]) -> Vec<String> {
        vec![self.show_cmd.clone()]
    }

    fn parse_state_output(
        &self,
        stdout: &str,
        js_refs: &[String],
    ) -> BTreeMap<String, JobState> {
        // qstat table: job-ID prior name user state ... ja-task-ID
        let mut out: BTreeMap<String, JobState> = BTreeMap::new();
        for line in stdout.lines().skip(2) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 5 {
                continue;
            }
            let job_id = fields[0].to_string();
            if !js_refs.contains(&job_id) {
                continue;
            }
            let state = Self::state_from_code(fields[4]);
            match fields.last().and_then(|f| f.parse::<usize>().ok()) {
                Some(task_id) if task_id >= 1 => {
                    let entry = out
                        .entry(job_id)
                        .or_insert_with(|| JobState::Array(BTreeMap::new()));
                    if let JobState::Array(map) = entry {
                        map.insert(task_id - 1, state);
                    }
                }
                _ => {
                    out.insert(job_id, JobState::Single(state));
                }
            }
        }
        out
    }
}
