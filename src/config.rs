//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use std::path::{Path, PathBuf};

use getset::Getters;
use serde::Deserialize;

use crate::error::{Error, Result};

pub const DEFAULT_LINUX_RELEASE_FILE: &str = "/etc/os-release";

/// Application configuration.
///
/// Passed explicitly into every top-level operation; there is no process-wide
/// configuration state.
#[derive(Clone, Debug, Deserialize, Getters)]
pub struct Configuration {
    /// Name identifying this machine; compared against the submit machine
    /// recorded in jobscript metadata before scheduler queries.
    #[getset(get = "pub")]
    machine: String,

    /// Shell text sourced at the top of every functions file.
    #[getset(get = "pub")]
    environment_setup: Option<String>,

    /// Command used by generated jobscripts to invoke this application.
    #[getset(get = "pub")]
    app_invocation: String,

    #[getset(get = "pub")]
    linux_release_file: String,

    /// Default scheduler name used when a resource record leaves it unset.
    #[getset(get = "pub")]
    default_scheduler: String,

    /// File to which workflow directories are appended for the external
    /// watcher.
    #[getset(get = "pub")]
    watch_file: Option<PathBuf>,
}

impl Configuration {
    /// Load configuration, layering an optional TOML file over built-in
    /// defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::new();

        builder
            .set_default("machine", default_machine())
            .and_then(|c| c.set_default("app_invocation", String::from("gantry")))
            .and_then(|c| {
                c.set_default("linux_release_file", String::from(DEFAULT_LINUX_RELEASE_FILE))
            })
            .and_then(|c| c.set_default("default_scheduler", String::from("direct")))
            .map_err(|e| Error::Config(e.to_string()))?;

        if let Some(path) = path {
            builder
                .merge(config::File::from(path).required(true))
                .map_err(|e| Error::Config(e.to_string()))?;
        }

        builder
            .try_into()
            .map_err(|e: config::ConfigError| Error::Config(e.to_string()))
    }
}

fn default_machine() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| String::from("localhost"))
}
