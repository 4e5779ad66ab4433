//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

pub mod direct;
pub mod sge;
pub mod slurm;

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::model::resources::ElementResources;
use crate::submission::JobscriptElementState;

pub use direct::Direct;
pub use sge::SgePosix;
pub use slurm::SlurmPosix;

/// Job state as reported by a scheduler query: whole-job, or per array item.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum JobState {
    Single(JobscriptElementState),
    Array(BTreeMap<usize, JobscriptElementState>),
}

/// Scheduler adapter: formats directives and submit commands, and parses the
/// scheduler's outputs. Adapters are pure; subprocesses are spawned by the
/// submission layer.
pub trait Scheduler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Directive prefix within a jobscript, e.g. `#SBATCH`.
    fn js_directive_prefix(&self) -> &'static str;

    fn shebang_args(&self) -> &'static str {
        ""
    }

    /// Variable expanded by the scheduler to the (1-based) array item index.
    fn array_item_var(&self) -> &'static str;

    /// Scheduler directive lines for the jobscript header.
    fn format_directives(
        &self,
        resources: &ElementResources,
        num_elements: usize,
        is_array: bool,
    ) -> String;

    /// Submit argv including dependency holds. `deps` pairs a job reference
    /// with whether the dependency is an array (one-to-one) dependency.
    fn get_submit_command(&self, js_path: &Path, deps: &[(String, bool)]) -> Vec<String>;

    /// Extract the scheduler job reference from a successful submission.
    fn parse_submission_output(&self, stdout: &str, stderr: &str) -> Result<String>;

    fn version_command(&self) -> Vec<String>;

    fn parse_version_info(&self, stdout: &str) -> Result<BTreeMap<String, String>>;

    /// Command querying the state of the given job references.
    fn state_query_command(&self, js_refs: &[String]) -> Vec<String>;

    fn parse_state_output(&self, stdout: &str, js_refs: &[String])
        -> BTreeMap<String, JobState>;
}

/// Look up the adapter for a scheduler name.
pub fn get_scheduler(name: &str) -> Result<Box<dyn Scheduler>> {
    match name {
        "direct" | "direct_posix" => Ok(Box::new(Direct::new(name == "direct_posix"))),
        "sge" => Ok(Box::new(SgePosix::default())),
        "slurm" => Ok(Box::new(SlurmPosix::default())),
        other => Err(Error::Runtime(format!("Unknown scheduler: {:?}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_scheduler_known_names() {
        for name in ["direct", "direct_posix", "sge", "slurm"] {
            assert_eq!(get_scheduler(name).unwrap().name(), name);
        }
        assert!(get_scheduler("pbs").is_err());
    }
}
