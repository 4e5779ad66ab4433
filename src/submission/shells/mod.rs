//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Shell adapters: per-(shell, OS) jobscript and functions-file composition.

pub mod bash;
pub mod os_version;
pub mod powershell;

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::submission::jobscript::JobscriptBlockRecord;

pub use bash::{Bash, WslBash};
pub use powershell::WindowsPowerShell;

/// Environment variable prefix used in generated scripts.
pub const APP_CAPS: &str = "GANTRY";
/// Shell function name invoking the application from generated scripts.
pub const APP_ALIAS: &str = "gantry_app";

/// Everything a shell needs to compose one jobscript file.
pub struct JobscriptComposeContext<'a> {
    pub sub_idx: usize,
    pub js_idx: usize,
    pub blocks: &'a [JobscriptBlockRecord],
    pub is_array: bool,
    pub is_scheduled: bool,
    /// Scheduler directive lines; empty for direct execution.
    pub scheduler_directives: String,
    pub scheduler_shebang_args: &'a str,
    /// Scheduler variable holding the 1-based array item index.
    pub array_item_var: &'a str,
    pub ear_id_file_name: String,
    pub functions_file_name: String,
    /// Direct execution: process ids of jobscripts to wait for first.
    pub direct_wait_pids: Vec<u32>,
}

/// A shell/OS combination that can render jobscripts.
pub trait Shell: Send + Sync {
    fn name(&self) -> &'static str;

    fn js_ext(&self) -> &'static str;

    /// argv prefix that runs a script file with this shell.
    fn executable(&self) -> Vec<String>;

    fn compose_jobscript(&self, ctx: &JobscriptComposeContext) -> String;

    /// The sourced functions file: app alias, line-indexed file read, path
    /// join.
    fn compose_functions_file(&self, env_setup: Option<&str>, app_invocation: &str) -> String;

    /// Assign a command's captured stream to a shell variable.
    fn format_stream_assignment(&self, var: &str, command: &str) -> String;

    /// Line saving a shell variable back as a workflow parameter.
    fn format_save_parameter(&self, param_name: &str, var: &str) -> String;

    fn version_command(&self) -> Vec<String>;

    fn parse_version_info(&self, stdout: &str) -> Result<BTreeMap<String, String>>;

    fn prepare_js_path(&self, path: &Path) -> String {
        path.display().to_string()
    }
}

/// Look up a shell adapter for a (shell, OS) pair; fails with
/// `UnsupportedShell` when no adapter exists for the combination.
pub fn get_shell(shell_name: &str, os_name: &str) -> Result<Box<dyn Shell>> {
    match (shell_name, os_name) {
        ("bash", "posix") => Ok(Box::new(Bash::default())),
        ("powershell", "nt") => Ok(Box::new(WindowsPowerShell::default())),
        ("wsl+bash", "nt") | ("wsl", "nt") => Ok(Box::new(WslBash::default())),
        _ => Err(Error::UnsupportedShell {
            shell: shell_name.to_string(),
            os: os_name.to_string(),
        }),
    }
}

pub const DEFAULT_SHELL_NAMES: &[(&str, &str)] = &[("posix", "bash"), ("nt", "powershell")];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_shell_known_pairs() {
        assert_eq!(get_shell("bash", "posix").unwrap().name(), "bash");
        assert_eq!(get_shell("powershell", "nt").unwrap().name(), "powershell");
        assert_eq!(get_shell("wsl+bash", "nt").unwrap().name(), "wsl+bash");
        assert_eq!(get_shell("wsl", "nt").unwrap().name(), "wsl+bash");
    }

    #[test]
    fn test_get_shell_unsupported_pair() {
        match get_shell("bash", "nt") {
            Err(err) => assert!(matches!(err, Error::UnsupportedShell { .. })),
            Ok(_) => panic!("expected UnsupportedShell error"),
        }
    }
}
