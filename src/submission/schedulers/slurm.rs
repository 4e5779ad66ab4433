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

/// Slurm adapter (`sbatch`/`squeue`/`scancel`).
///
/// Jobs run in the submission working directory by default.
#[derive(Clone, Debug)]
pub struct SlurmPosix {
    submit_cmd: String,
    show_cmd: Vec<String>,
    del_cmd: String,
}

impl Default for SlurmPosix {
    fn default() -> Self {
        SlurmPosix {
            submit_cmd: String::from("sbatch"),
            show_cmd: vec![String::from("squeue"), String::from("--me")],
            del_cmd: String::from("scancel"),
        }
    }
}

impl SlurmPosix {
    pub fn del_command(&self, job_id: &str) -> Vec<String> {
        vec![self.del_cmd.clone(), job_id.to_string()]
    }

    /// Parse a job reference like `"123"`, `"123_10"` or `"49203_[3-5,9-11]"`
    /// into the base job id and 0-based array item indices.
    pub fn parse_job_ids(job_ref: &str) -> Result<(String, Option<Vec<usize>>)> {
        let (base, arr) = match job_ref.split_once('_') {
            None => return Ok((job_ref.to_string(), None)),
            Some((base, arr)) => (base, arr),
        };

        let parse_item = |s: &str| -> Result<usize> {
            s.trim().parse::<usize>().map_err(|_| {
                Error::Runtime(format!("Cannot parse Slurm array item: {:?}", job_ref))
            })
        };

        let items = match arr.strip_prefix('[').and_then(|a| a.strip_suffix(']')) {
            None => vec![parse_item(arr)? - 1],
            Some(ranges) => {
                let mut items = Vec::new();
                for part in ranges.split(',') {
                    match part.split_once('-') {
                        Some((lo, hi)) => {
                            let lo = parse_item(lo)?;
                            let hi = parse_item(hi)?;
                            items.extend((lo..=hi).map(|i| i - 1));
                        }
                        None => items.push(parse_item(part)? - 1),
                    }
                }
                items
            }
        };
        Ok((base.to_string(), Some(items)))
    }

    fn state_from_code(code: &str) -> JobscriptElementState {
        match code {
            "PD" => JobscriptElementState::Pending,
            "R" | "CG" => JobscriptElementState::Running,
            "CD" => JobscriptElementState::Finished,
            "CA" => JobscriptElementState::Cancelled,
            "F" | "TO" | "NF" | "OOM" => JobscriptElementState::Errored,
            _ => JobscriptElementState::Waiting,
        }
    }
}

impl Scheduler for SlurmPosix {
    fn name(&self) -> &'static str {
        "slurm"
    }

    fn js_directive_prefix(&self) -> &'static str {
        "#SBATCH"
    }

    fn array_item_var(&self) -> &'static str {
        "SLURM_ARRAY_TASK_ID"
    }

    fn format_directives(
        &self,
        resources: &ElementResources,
        num_elements: usize,
        is_array: bool,
    ) -> String {
        let prefix = self.js_directive_prefix();
        let num_cores = resources.num_cores.unwrap_or(1);
        let num_nodes = resources.num_nodes.unwrap_or(1);

        let mut lines = Vec::new();
        if num_cores == 1 {
            lines.push(format!("{} --partition serial", prefix));
        } else if num_nodes == 1 {
            lines.push(format!("{} --partition multicore", prefix));
        } else {
            lines.push(format!("{} --partition multinode", prefix));
            lines.push(format!("{} --nodes {}", prefix, num_nodes));
        }
        lines.push(format!("{} --ntasks {}", prefix, num_cores));
        if is_array {
            lines.push(format!("{} --array 1-{}", prefix, num_elements));
        }
        for (key, value) in &resources.scheduler_args {
            lines.push(format!("{} --{} {}", prefix, key, value));
        }
        lines.join("\n")
    }

    fn get_submit_command(&self, js_path: &Path, deps: &[(String, bool)]) -> Vec<String> {
        let mut cmd = vec![self.submit_cmd.clone(), String::from("--parsable")];

        let dep_specs: Vec<String> = deps
            .iter()
            .map(|(job_id, is_array_dep)| {
                if *is_array_dep {
                    format!("aftercorr:{}", job_id)
                } else {
                    format!("afterany:{}", job_id)
                }
            })
            .collect();
        if !dep_specs.is_empty() {
            cmd.push(String::from("--dependency"));
            cmd.push(dep_specs.join(","));
        }

        cmd.push(js_path.display().to_string());
        cmd
    }

    fn parse_submission_output(&self, stdout: &str, _stderr: &str) -> Result<String> {
        // submitted with --parsable: "<job id>[;<cluster>]"
        let job_id = stdout.trim().split(';').next().unwrap_or("").to_string();
        if job_id.is_empty() || !job_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::Runtime(format!(
                "Cannot parse Slurm job ID from stdout: {:?}",
                stdout
            )));
        }
        Ok(job_id)
    }

    fn version_command(&self) -> Vec<String> {
        vec![self.submit_cmd.clone(), String::from("--version")]
    }

    fn parse_version_info(&self, stdout: &str) -> Result<BTreeMap<String, String>> {
        let mut parts = stdout.trim().split_whitespace();
        let name = parts.next();
        let version = parts.next();
        match (name, version) {
            (Some(name), Some(version)) => {
                let mut out = BTreeMap::new();
                out.insert(String::from("scheduler_name"), name.to_string());
                out.insert(String::from("scheduler_version"), version.to_string());
                Ok(out)
            }
            _ => Err(Error::Runtime(format!(
                "Failed to parse Slurm version information from: {:?}",
                stdout
            ))),
        }
    }

    fn state_query_command(&self, js_refs: &[String]) -> Vec<String> {
        let mut cmd = self.show_cmd.clone();
        cmd.push(String::from("--noheader"));
        cmd.push(String::from("--format"));
        cmd.push(String::from("%i %t"));
        cmd.push(String::from("--jobs"));
        cmd.push(js_refs.join(","));
        cmd
    }

    fn parse_state_output(
        &self,
        stdout: &str,
        js_refs: &[String],
    ) -> BTreeMap<String, JobState> {
        let mut out: BTreeMap<String, JobState> = BTreeMap::new();
        for line in stdout.lines() {
            let mut fields = line.split_whitespace();
            let (job_ref, code) = match (fields.next(), fields.next()) {
                (Some(r), Some(c)) => (r, c),
                _ => continue,
            };
            let state = Self::state_from_code(code);
            let (base, arr_idx) = match Self::parse_job_ids(job_ref) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if !js_refs.contains(&base) {
                continue;
            }
            match arr_idx {
                None => {
                    out.insert(base, JobState::Single(state));
                }
                Some(indices) => {
                    let entry = out
                        .entry(base)
                        .or_insert_with(|| JobState::Array(BTreeMap::new()));
                    if let JobState::Array(map) = entry {
                        for idx in indices {
                            map.insert(idx, state);
                        }
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_job_id_simple() {
        assert_eq!(
            SlurmPosix::parse_job_ids("123").unwrap(),
            (String::from("123"), None)
        );
    }

    #[test]
    fn test_parse_job_id_simple_array_item() {
        assert_eq!(
            SlurmPosix::parse_job_ids("123_10").unwrap(),
            (String::from("123"), Some(vec![9]))
        );
    }

    #[test]
    fn test_parse_job_id_array_simple_range() {
        assert_eq!(
            SlurmPosix::parse_job_ids("3397752_[9-11]").unwrap(),
            (String::from("3397752"), Some(vec![8, 9, 10]))
        );
    }

    #[test]
    fn test_parse_job_id_array_multiple_range() {
        assert_eq!(
            SlurmPosix::parse_job_ids("49203_[3-5,9-11]").unwrap(),
            (String::from("49203"), Some(vec![2, 3, 4, 8, 9, 10]))
        );
    }

    #[test]
    fn test_parse_job_id_array_mixed_range() {
        assert_eq!(
            SlurmPosix::parse_job_ids("30627658_[5,8-10]").unwrap(),
            (String::from("30627658"), Some(vec![4, 7, 8, 9]))
        );
    }

    #[test]
    fn test_submit_command_with_deps() {
        let slurm = SlurmPosix::default();
        let cmd = slurm.get_submit_command(
            Path::new("/wk/submissions/0/js_2.sh"),
            &[
                (String::from("100"), false),
                (String::from("101"), true),
            ],
        );
        assert_eq!(
            cmd,
            vec![
                "sbatch",
                "--parsable",
                "--dependency",
                "afterany:100,aftercorr:101",
                "/wk/submissions/0/js_2.sh",
            ]
        );
    }

    #[test]
    fn test_parse_submission_output() {
        let slurm = SlurmPosix::default();
        assert_eq!(slurm.parse_submission_output("123;cluster\n", "").unwrap(), "123");
        assert_eq!(slurm.parse_submission_output("456\n", "").unwrap(), "456");
        assert!(slurm.parse_submission_output("garbage out", "").is_err());
    }

    #[test]
    fn test_directives_with_array() {
        let slurm = SlurmPosix::default();
        let mut res = ElementResources::default();
        res.set_defaults();
        let directives = slurm.format_directives(&res, 3, true);
        assert!(directives.contains("#SBATCH --partition serial"));
        assert!(directives.contains("#SBATCH --ntasks 1"));
        assert!(directives.contains("#SBATCH --array 1-3"));
    }

    #[test]
    fn test_parse_state_output_array() {
        let slurm = SlurmPosix::default();
        let refs = vec![String::from("88")];
        let states = slurm.parse_state_output("88_1 R\n88_2 PD\n", &refs);
        match &states["88"] {
            JobState::Array(map) => {
                assert_eq!(map[&0], JobscriptElementState::Running);
                assert_eq!(map[&1], JobscriptElementState::Pending);
            }
            other => panic!("expected array state, got {:?}", other),
        }
    }
}
