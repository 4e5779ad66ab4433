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

use crate::error::Result;
use crate::model::resources::ElementResources;
use crate::submission::schedulers::{JobState, Scheduler};

/// Direct execution: no batch system. The "submit command" is the jobscript
/// itself, run by the executor as a supervised child process.
#[derive(Clone, Debug)]
pub struct Direct {
    posix_only: bool,
}

impl Direct {
    pub fn new(posix_only: bool) -> Self {
        Direct { posix_only }
    }
}

impl Scheduler for Direct {
    fn name(&self) -> &'static str {
        if self.posix_only {
            "direct_posix"
        } else {
            "direct"
        }
    }

    fn js_directive_prefix(&self) -> &'static str {
        ""
    }

    fn array_item_var(&self) -> &'static str {
        ""
    }

    fn format_directives(
        &self,
        _resources: &ElementResources,
        _num_elements: usize,
        _is_array: bool,
    ) -> String {
        String::new()
    }

    fn get_submit_command(&self, js_path: &Path, _deps: &[(String, bool)]) -> Vec<String> {
        vec![js_path.display().to_string()]
    }

    fn parse_submission_output(&self, _stdout: &str, _stderr: &str) -> Result<String> {
        // direct submissions are identified by process ID, not parsed output
        Ok(String::new())
    }

    fn version_command(&self) -> Vec<String> {
        Vec::new()
    }

    fn parse_version_info(&self, _stdout: &str) -> Result<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }

    fn state_query_command(&self, _js_refs: &[String]) -> Vec<String> {
        Vec::new()
    }

    fn parse_state_output(
        &self,
        _stdout: &str,
        _js_refs: &[String],
    ) -> BTreeMap<String, JobState> {
        BTreeMap::new()
    }
}
