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

use serde::{Deserialize, Serialize};

use crate::model::parameter::TaskSourceType;
use crate::model::resources::ElementResources;

/// A command line plus optional stream captures bound to output parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Command {
    pub command: String,
    /// Output parameter receiving the command's stdout.
    pub stdout: Option<String>,
    /// Output parameter receiving the command's stderr.
    pub stderr: Option<String>,
}

impl Command {
    pub fn new(command: impl Into<String>) -> Self {
        Command {
            command: command.into(),
            stdout: None,
            stderr: None,
        }
    }
}

/// Condition attached to an action; the action only produces runs when every
/// rule matches the run's resource record.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ActionRule {
    /// Resource attribute path, e.g. `os_name`.
    pub attribute: String,
    pub value: String,
}

impl ActionRule {
    pub fn matches(&self, resources: &ElementResources) -> bool {
        match self.attribute.as_str() {
            "os_name" => resources.os_name() == self.value,
            "shell" => resources.shell_name() == self.value,
            "scheduler" => resources.scheduler_name() == self.value,
            _ => false,
        }
    }
}

/// An ordered list of commands with optional environment references and
/// conditional rules.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Action {
    pub commands: Vec<Command>,
    #[serde(default)]
    pub environments: Vec<String>,
    #[serde(default)]
    pub rules: Vec<ActionRule>,
}

impl Action {
    pub fn applies_to(&self, resources: &ElementResources) -> bool {
        self.rules.iter().all(|r| r.matches(resources))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchemaInput {
    pub parameter: String,
    pub default_value: Option<serde_json::Value>,
}

impl SchemaInput {
    pub fn new(parameter: impl Into<String>) -> Self {
        SchemaInput {
            parameter: parameter.into(),
            default_value: None,
        }
    }

    pub fn with_default(parameter: impl Into<String>, value: serde_json::Value) -> Self {
        SchemaInput {
            parameter: parameter.into(),
            default_value: Some(value),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchemaOutput {
    pub parameter: String,
}

impl SchemaOutput {
    pub fn new(parameter: impl Into<String>) -> Self {
        SchemaOutput {
            parameter: parameter.into(),
        }
    }
}

/// Declares a task's inputs, outputs and actions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskSchema {
    pub objective: String,
    #[serde(default)]
    pub inputs: Vec<SchemaInput>,
    #[serde(default)]
    pub outputs: Vec<SchemaOutput>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

/// Where one task input draws its value from.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source_type", rename_all = "lowercase")]
pub enum InputSource {
    Local,
    Default,
    Task {
        /// Insert ID of the referenced task once resolved; templates may name
        /// tasks instead, resolved during `add_task`.
        task_ref: u64,
        task_source_type: TaskSourceType,
    },
}

impl InputSource {
    pub fn local() -> Self {
        InputSource::Local
    }

    pub fn task_output(task_ref: u64) -> Self {
        InputSource::Task {
            task_ref,
            task_source_type: TaskSourceType::Output,
        }
    }
}

/// One parameter sequence: `multiplicity` values spread over elements
/// according to `nesting_order`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValueSequence {
    /// Input path, e.g. `inputs.p1`.
    pub path: String,
    pub values: Vec<serde_json::Value>,
    pub nesting_order: i64,
}

/// A task as declared in a workflow template.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub schema: TaskSchema,
    /// Literal input values keyed by parameter name.
    #[serde(default)]
    pub inputs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub sequences: Vec<ValueSequence>,
    /// Element replication factor, composed with sequences.
    pub repeats: Option<usize>,
    /// Explicitly specified sources per input parameter.
    #[serde(default)]
    pub input_sources: BTreeMap<String, Vec<InputSource>>,
    /// Scope-tagged resource records.
    #[serde(default)]
    pub resources: Vec<ElementResources>,
    /// Assigned by the workflow on addition; stable across reorderings.
    pub insert_id: Option<u64>,
}

impl TaskTemplate {
    pub fn new(schema: TaskSchema) -> Self {
        TaskTemplate {
            schema,
            inputs: BTreeMap::new(),
            sequences: Vec::new(),
            repeats: None,
            input_sources: BTreeMap::new(),
            resources: Vec::new(),
            insert_id: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.schema.objective
    }

    /// The resource record governing this task's runs, default-scoped if the
    /// template supplies none.
    pub fn run_resources(&self) -> ElementResources {
        self.resources
            .first()
            .cloned()
            .unwrap_or_default()
    }

    /// Inputs for which neither the template nor `input_sources` provides a
    /// source.
    pub fn unsourced_inputs(&self) -> Vec<String> {
        self.schema
            .inputs
            .iter()
            .filter(|inp| !self.input_sources.contains_key(&inp.parameter))
            .filter(|inp| !self.has_local_value(&inp.parameter))
            .filter(|inp| inp.default_value.is_none())
            .map(|inp| inp.parameter.clone())
            .collect()
    }

    fn has_local_value(&self, parameter: &str) -> bool {
        self.inputs.contains_key(parameter)
            || self
                .sequences
                .iter()
                .any(|s| s.path == format!("inputs.{}", parameter))
    }

    /// Sources available for each schema input, most preferred first: output
    /// of the most recent upstream task producing the parameter, then earlier
    /// outputs, then a local value, then the schema default.
    pub fn available_input_sources(
        &self,
        upstream: &[&TaskTemplate],
    ) -> BTreeMap<String, Vec<InputSource>> {
        let mut out = BTreeMap::new();
        for input in &self.schema.inputs {
            let mut sources = Vec::new();

            for task in upstream.iter().rev() {
                let produces = task
                    .schema
                    .outputs
                    .iter()
                    .any(|o| o.parameter == input.parameter);
                if produces {
                    if let Some(insert_id) = task.insert_id {
                        sources.push(InputSource::task_output(insert_id));
                    }
                }
            }

            if self.has_local_value(&input.parameter) {
                sources.push(InputSource::Local);
            }
            if input.default_value.is_some() {
                sources.push(InputSource::Default);
            }

            out.insert(input.parameter.clone(), sources);
        }
        out
    }
}

/// Unique display names for a list of tasks: repeated objectives get `_1`,
/// `_2`, ... suffixes in insertion order.
pub fn get_task_unique_names(tasks: &[TaskTemplate]) -> Vec<String> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for task in tasks {
        *counts.entry(task.name()).or_insert(0) += 1;
    }

    let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
    tasks
        .iter()
        .map(|task| {
            let name = task.name();
            if counts[name] > 1 {
                let n = seen.entry(name).or_insert(0);
                *n += 1;
                format!("{}_{}", name, n)
            } else {
                name.to_string()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(name: &str, inputs: &[&str], outputs: &[&str]) -> TaskSchema {
        TaskSchema {
            objective: name.to_string(),
            inputs: inputs.iter().map(|p| SchemaInput::new(*p)).collect(),
            outputs: outputs.iter().map(|p| SchemaOutput::new(*p)).collect(),
            actions: vec![],
        }
    }

    #[test]
    fn test_unique_names_no_repeats() {
        let t1 = TaskTemplate::new(schema("ts1", &[], &[]));
        let t2 = TaskTemplate::new(schema("ts2", &[], &[]));
        assert_eq!(get_task_unique_names(&[t1, t2]), vec!["ts1", "ts2"]);
    }

    #[test]
    fn test_unique_names_with_repeat() {
        let t1 = TaskTemplate::new(schema("ts1", &[], &[]));
        let t2 = TaskTemplate::new(schema("ts1", &[], &[]));
        assert_eq!(get_task_unique_names(&[t1, t2]), vec!["ts1_1", "ts1_2"]);
    }

    #[test]
    fn test_available_sources_local_only() {
        let mut t1 = TaskTemplate::new(schema("ts1", &["p1"], &[]));
        t1.inputs.insert("p1".into(), serde_json::json!(101));
        let available = t1.available_input_sources(&[]);
        assert_eq!(available["p1"], vec![InputSource::Local]);
    }

    #[test]
    fn test_available_sources_default_only() {
        let mut s = schema("ts1", &[], &[]);
        s.inputs
            .push(SchemaInput::with_default("p1", serde_json::json!(101)));
        let t1 = TaskTemplate::new(s);
        let available = t1.available_input_sources(&[]);
        assert_eq!(available["p1"], vec![InputSource::Default]);
    }

    #[test]
    fn test_available_sources_upstream_output_preferred() {
        let mut t1 = TaskTemplate::new(schema("ts1", &["p1"], &["p2"]));
        t1.insert_id = Some(0);
        let mut t2 = TaskTemplate::new(schema("ts2", &["p2"], &[]));
        t2.inputs.insert("p2".into(), serde_json::json!(202));

        let available = t2.available_input_sources(&[&t1]);
        assert_eq!(
            available["p2"],
            vec![InputSource::task_output(0), InputSource::Local]
        );
    }

    #[test]
    fn test_available_sources_recent_output_first() {
        let mut t1 = TaskTemplate::new(schema("ts1", &[], &["p3"]));
        t1.insert_id = Some(0);
        let mut t2 = TaskTemplate::new(schema("ts2", &[], &["p3"]));
        t2.insert_id = Some(1);
        let t3 = TaskTemplate::new(schema("ts3", &["p3"], &[]));

        let available = t3.available_input_sources(&[&t1, &t2]);
        assert_eq!(
            available["p3"],
            vec![InputSource::task_output(1), InputSource::task_output(0)]
        );
    }

    #[test]
    fn test_unsourced_inputs() {
        let t = TaskTemplate::new(schema("ts1", &["p1", "p2"], &[]));
        assert_eq!(t.unsourced_inputs(), vec!["p1", "p2"]);

        let mut t = t;
        t.inputs.insert("p1".into(), serde_json::json!(1));
        assert_eq!(t.unsourced_inputs(), vec!["p2"]);
    }
}
