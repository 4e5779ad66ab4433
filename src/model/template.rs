//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::task::TaskTemplate;

pub const ALL_TEMPLATE_FORMATS: &[&str] = &["yaml", "json"];
pub const DEFAULT_TEMPLATE_FORMAT: &str = "yaml";

/// Initial parametrisation of a workflow, with limited validation logic.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub name: String,
    #[serde(default)]
    pub tasks: Vec<TaskTemplate>,
}

impl WorkflowTemplate {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        serde_yaml::from_str(s).map_err(|e| Error::Config(format!("Invalid YAML template: {}", e)))
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| Error::Config(format!("Invalid JSON template: {}", e)))
    }

    pub fn from_str(s: &str, format: &str) -> Result<Self> {
        match format {
            "yaml" => Self::from_yaml_str(s),
            "json" => Self::from_json_str(s),
            other => Err(Error::Config(format!(
                "Unknown template format: {:?}",
                other
            ))),
        }
    }

    /// Load a template from a file; the format is taken from the extension
    /// unless forced.
    pub fn from_file(path: &Path, format: Option<&str>) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Cannot read template {}: {}", path.display(), e)))?;
        let format = format.map(str::to_string).unwrap_or_else(|| {
            match path.extension().and_then(|e| e.to_str()) {
                Some("json") => String::from("json"),
                _ => String::from(DEFAULT_TEMPLATE_FORMAT),
            }
        });
        Self::from_str(&text, &format)
    }
}
