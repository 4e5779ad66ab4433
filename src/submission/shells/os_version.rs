//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Operating system information discovery.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{Error, Result};

/// Basic OS version info from `uname` output fields (`-s`, `-r`, `-v`).
pub fn parse_uname_info(stdout: &str) -> BTreeMap<String, String> {
    let mut fields = stdout.trim().splitn(3, char::is_whitespace);
    let mut out = BTreeMap::new();
    if let Some(name) = fields.next() {
        out.insert(String::from("OS_name"), name.to_string());
    }
    if let Some(release) = fields.next() {
        out.insert(String::from("OS_release"), release.to_string());
    }
    if let Some(version) = fields.next() {
        out.insert(String::from("OS_version"), version.trim().to_string());
    }
    out
}

pub fn uname_command() -> Vec<String> {
    vec![
        String::from("uname"),
        String::from("-s"),
        String::from("-r"),
        String::from("-v"),
    ]
}

/// Distribution name and version from an os-release style file (`NAME="..."`
/// and `VERSION="..."` lines).
pub fn parse_linux_release(text: &str) -> Result<(String, String)> {
    let field = |key: &str| -> Option<String> {
        text.lines().find_map(|line| {
            line.strip_prefix(key)
                .and_then(|rest| rest.strip_prefix('='))
                .map(|v| v.trim().trim_matches('"').to_string())
        })
    };
    let name = field("NAME").ok_or_else(|| {
        Error::Runtime(String::from(
            "Failed to get Linux distribution name from release file",
        ))
    })?;
    let version = field("VERSION").ok_or_else(|| {
        Error::Runtime(String::from(
            "Failed to get Linux distribution version from release file",
        ))
    })?;
    Ok((name, version))
}

/// OS info for the current machine, reading the release file on Linux.
pub fn get_os_info(linux_release_file: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    out.insert(
        String::from("OS_name"),
        String::from(std::env::consts::OS),
    );
    out.insert(
        String::from("OS_arch"),
        String::from(std::env::consts::ARCH),
    );
    if std::env::consts::OS == "linux" {
        if let Ok(text) = std::fs::read_to_string(Path::new(linux_release_file)) {
            if let Ok((name, version)) = parse_linux_release(&text) {
                out.insert(String::from("linux_release_file"), linux_release_file.into());
                out.insert(String::from("linux_distribution_name"), name);
                out.insert(String::from("linux_distribution_version"), version);
            }
        }
    }
    out
}
