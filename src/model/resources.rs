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
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Action scope a resource record applies to.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionScope {
    Any,
    Main,
    InputFileGenerator { file: Option<String> },
    OutputFileParser { file: Option<String> },
}

impl ActionScope {
    pub fn any() -> Self {
        ActionScope::Any
    }

    pub fn input_file_generator(file: impl Into<String>) -> Self {
        ActionScope::InputFileGenerator {
            file: Some(file.into()),
        }
    }
}

impl fmt::Display for ActionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionScope::Any => write!(f, "any"),
            ActionScope::Main => write!(f, "main"),
            ActionScope::InputFileGenerator { file: Some(file) } => {
                write!(f, "input_file_generator[file={}]", file)
            }
            ActionScope::InputFileGenerator { file: None } => {
                write!(f, "input_file_generator")
            }
            ActionScope::OutputFileParser { file: Some(file) } => {
                write!(f, "output_file_parser[file={}]", file)
            }
            ActionScope::OutputFileParser { file: None } => write!(f, "output_file_parser"),
        }
    }
}

impl FromStr for ActionScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (name, arg) = match s.split_once('[') {
            Some((name, rest)) => {
                let inner = rest
                    .strip_suffix(']')
                    .ok_or_else(|| Error::Runtime(format!("Invalid action scope: {:?}", s)))?;
                let file = inner
                    .strip_prefix("file=")
                    .ok_or_else(|| Error::Runtime(format!("Invalid action scope: {:?}", s)))?;
                (name, Some(file.to_string()))
            }
            None => (s, None),
        };

        match name {
            "any" => Ok(ActionScope::Any),
            "main" => Ok(ActionScope::Main),
            "input_file_generator" => Ok(ActionScope::InputFileGenerator { file: arg }),
            "output_file_parser" => Ok(ActionScope::OutputFileParser { file: arg }),
            other => Err(Error::Runtime(format!("Unknown action scope: {:?}", other))),
        }
    }
}

/// Resource requirements for a set of runs.
///
/// The hash over the full (default-filled, validated) field set is the packing
/// key used by the jobscript planner.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElementResources {
    pub scope: ActionScope,
    pub num_cores: Option<u32>,
    pub num_nodes: Option<u32>,
    pub scheduler: Option<String>,
    pub shell: Option<String>,
    pub os_name: Option<String>,
    pub use_job_array: Option<bool>,
    pub combine_jobscript_std: Option<bool>,
    pub environment_setup: Option<String>,
    #[serde(default)]
    pub scheduler_args: BTreeMap<String, String>,
    #[serde(default)]
    pub shell_args: BTreeMap<String, String>,
}

impl Default for ElementResources {
    fn default() -> Self {
        ElementResources {
            scope: ActionScope::Any,
            num_cores: None,
            num_nodes: None,
            scheduler: None,
            shell: None,
            os_name: None,
            use_job_array: None,
            combine_jobscript_std: None,
            environment_setup: None,
            scheduler_args: BTreeMap::new(),
            shell_args: BTreeMap::new(),
        }
    }
}

impl ElementResources {
    /// Fill unset fields from machine defaults.
    pub fn set_defaults(&mut self) {
        let os_name = self.os_name.get_or_insert_with(default_os_name);
        self.shell
            .get_or_insert_with(|| default_shell_name(os_name));
        self.scheduler.get_or_insert_with(|| String::from("direct"));
        self.num_cores.get_or_insert(1);
        self.num_nodes.get_or_insert(1);
        if self.combine_jobscript_std.is_none() {
            self.combine_jobscript_std = Some(false);
        }
    }

    /// Check the (default-filled) record is satisfiable on this machine.
    pub fn validate_against_machine(&self) -> Result<()> {
        let scheduler = self.scheduler_name();
        if !SCHEDULER_CAPABILITIES.iter().any(|c| c.name == scheduler) {
            return Err(Error::Runtime(format!(
                "Unknown scheduler: {:?}",
                scheduler
            )));
        }
        if self.use_job_array == Some(true) && !scheduler_supports_arrays(scheduler) {
            return Err(Error::JobArrayUnsupported(scheduler.to_string()));
        }
        Ok(())
    }

    pub fn scheduler_name(&self) -> &str {
        self.scheduler.as_deref().unwrap_or("direct")
    }

    pub fn shell_name(&self) -> &str {
        self.shell.as_deref().unwrap_or("bash")
    }

    pub fn os_name(&self) -> &str {
        self.os_name.as_deref().unwrap_or("posix")
    }

    pub fn is_direct(&self) -> bool {
        matches!(self.scheduler_name(), "direct" | "direct_posix")
    }

    /// Order-invariant digest over the full field set.
    ///
    /// Fields are serialised through a sorted key map so two records that
    /// differ only in construction order hash identically.
    pub fn jobscript_hash(&self) -> String {
        let value = serde_json::to_value(self).expect("resource record serialises");
        let canonical = canonicalise(&value);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let digest = hasher.finalize();
        format!("{:x}", digest)
    }
}

fn canonicalise(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let entries: BTreeMap<&String, String> =
                map.iter().map(|(k, v)| (k, canonicalise(v))).collect();
            let inner = entries
                .into_iter()
                .map(|(k, v)| format!("{:?}:{}", k, v))
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{}}}", inner)
        }
        serde_json::Value::Array(items) => {
            let inner = items
                .iter()
                .map(canonicalise)
                .collect::<Vec<_>>()
                .join(",");
            format!("[{}]", inner)
        }
        other => other.to_string(),
    }
}

pub fn default_os_name() -> String {
    if cfg!(windows) {
        String::from("nt")
    } else {
        String::from("posix")
    }
}

pub fn default_shell_name(os_name: &str) -> String {
    match os_name {
        "nt" => String::from("powershell"),
        _ => String::from("bash"),
    }
}

/// What each supported scheduler can do.
pub struct SchedulerCapability {
    pub name: &'static str,
    pub array_jobs: bool,
    pub run_parallelism: bool,
    pub array_dep_switch: Option<&'static str>,
}

pub const SCHEDULER_CAPABILITIES: &[SchedulerCapability] = &[
    SchedulerCapability {
        name: "direct",
        array_jobs: false,
        run_parallelism: false,
        array_dep_switch: None,
    },
    SchedulerCapability {
        name: "direct_posix",
        array_jobs: false,
        run_parallelism: false,
        array_dep_switch: None,
    },
    SchedulerCapability {
        name: "sge",
        array_jobs: true,
        run_parallelism: true,
        array_dep_switch: Some("-hold_jid_ad"),
    },
    SchedulerCapability {
        name: "slurm",
        array_jobs: true,
        run_parallelism: true,
        array_dep_switch: Some("aftercorr"),
    },
];

pub fn scheduler_supports_arrays(name: &str) -> bool {
    SCHEDULER_CAPABILITIES
        .iter()
        .any(|c| c.name == name && c.array_jobs)
}

pub fn scheduler_supports_run_parallelism(name: &str) -> bool {
    SCHEDULER_CAPABILITIES
        .iter()
        .any(|c| c.name == name && c.run_parallelism)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_string_equivalence() {
        let a = ActionScope::any();
        let b: ActionScope = "any".parse().unwrap();
        assert_eq!(a, b);

        let a = ActionScope::input_file_generator("my_file");
        let b: ActionScope = "input_file_generator[file=my_file]".parse().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_hash_field_order_invariance() {
        let mut a = ElementResources::default();
        a.scheduler_args.insert("q".into(), "short".into());
        a.scheduler_args.insert("p".into(), "serial".into());

        let mut b = ElementResources::default();
        b.scheduler_args.insert("p".into(), "serial".into());
        b.scheduler_args.insert("q".into(), "short".into());

        assert_eq!(a.jobscript_hash(), b.jobscript_hash());
    }

    #[test]
    fn test_hash_differs_on_cores() {
        let mut a = ElementResources::default();
        let mut b = ElementResources::default();
        a.set_defaults();
        b.set_defaults();
        b.num_cores = Some(8);
        assert_ne!(a.jobscript_hash(), b.jobscript_hash());
    }

    #[test]
    fn test_array_on_direct_rejected() {
        let mut res = ElementResources {
            use_job_array: Some(true),
            ..Default::default()
        };
        res.set_defaults();
        assert!(matches!(
            res.validate_against_machine(),
            Err(Error::JobArrayUnsupported(_))
        ));
    }
}
