//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The public workflow API: template loading, task addition (element
//! expansion and EAR creation), submission, parameter queries, and the
//! internal callbacks invoked from running jobscripts.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info};

use crate::config::Configuration;
use crate::error::{Error, Result};
use crate::expand::{generate_new_elements, resolve_element_data_indices, SequenceSpec};
use crate::model::element::{
    Ear, EarStatus, Element, ElementIteration, ABORT_EXIT_CODE, SKIPPED_EXIT_CODE,
};
use crate::model::parameter::ParameterSource;
use crate::model::task::{get_task_unique_names, InputSource, TaskTemplate};
use crate::model::template::WorkflowTemplate;
use crate::plan::{plan_jobscripts, TaskPlanInput};
use crate::store::{Store, StoreMode, StoreTask};
use crate::submission::jobscript::{JobscriptRecord, SubmissionRecord};
use crate::submission::schedulers::{get_scheduler, JobState};
use crate::submission::shells::get_shell;
use crate::submission::{
    self, build_submission, JobscriptElementState, ABORT_EARS_FILE_NAME, SCRIPTS_DIR_NAME,
};

pub const TS_NAME_FMT: &str = "%Y-%m-%d_%H%M%S";

/// A persistent workflow and the operations on it.
pub struct Workflow {
    path: PathBuf,
    config: Configuration,
    store: Store,
}

impl Workflow {
    /// Load an existing workflow.
    pub fn open(config: Configuration, path: &Path, mode: StoreMode) -> Result<Self> {
        let store = Store::open(path, mode)?;
        Ok(Workflow {
            path: path.to_path_buf(),
            config,
            store,
        })
    }

    /// Create a workflow directory from a template and add its tasks.
    pub fn from_template(
        config: Configuration,
        mut template: WorkflowTemplate,
        path: Option<&Path>,
        name: Option<&str>,
        overwrite: bool,
    ) -> Result<Self> {
        let tasks = std::mem::take(&mut template.tasks);
        let dir_name = name.map(String::from).unwrap_or_else(|| {
            format!("{}_{}", template.name, Utc::now().format(TS_NAME_FMT))
        });
        let wk_path = path.unwrap_or_else(|| Path::new(".")).join(dir_name);

        let store = Store::write_empty(&wk_path, template, overwrite)?;
        let mut workflow = Workflow {
            path: wk_path,
            config,
            store,
        };
        for task in tasks {
            workflow.add_task(task, None)?;
        }
        info!(path = %workflow.path.display(), "created workflow");
        Ok(workflow)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn num_tasks(&self) -> Result<usize> {
        self.store.get_num_added_tasks()
    }

    /// Unique task names, optionally mapped to insert IDs.
    pub fn get_task_unique_names(&self) -> Result<Vec<String>> {
        let template = self.store.get_template()?;
        Ok(get_task_unique_names(&template.tasks))
    }

    pub fn get_task_unique_names_to_insert_ids(&self) -> Result<BTreeMap<String, u64>> {
        let template = self.store.get_template()?;
        let names = get_task_unique_names(&template.tasks);
        Ok(names
            .into_iter()
            .zip(template.tasks.iter())
            .filter_map(|(name, task)| task.insert_id.map(|id| (name, id)))
            .collect())
    }

    // ------------------------------------------------------------------
    // add_task

    /// Add a task: resolve its input sources, expand its elements, allocate
    /// parameters and create its pending EARs. Everything is committed in
    /// one step; validation failures leave the store untouched.
    pub fn add_task(&mut self, task: TaskTemplate, new_index: Option<usize>) -> Result<u64> {
        let result = self.add_task_inner(task, new_index);
        if result.is_err() {
            self.store.discard_pending();
        }
        result
    }

    fn add_task_inner(&mut self, mut task: TaskTemplate, new_index: Option<usize>) -> Result<u64> {
        let template = self.store.get_template()?;
        let new_index = new_index.unwrap_or(template.tasks.len());
        let insert_id = self.store.get_num_added_tasks()? as u64;
        task.insert_id = Some(insert_id);

        let upstream: Vec<&TaskTemplate> = template.tasks[..new_index.min(template.tasks.len())]
            .iter()
            .collect();
        self.ensure_input_sources(&mut task, &upstream)?;

        // element multiplicity resolution: sequences, repeats and
        // upstream-sourced inputs all contribute
        let mut input_data: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        let mut specs: Vec<SequenceSpec> = Vec::new();

        for seq in &task.sequences {
            let indices = seq
                .values
                .iter()
                .map(|value| {
                    self.store
                        .add_parameter_data(Some(value.clone()), ParameterSource::Local)
                })
                .collect::<Result<Vec<_>>>()?;
            input_data.insert(seq.path.clone(), indices);
            specs.push(SequenceSpec {
                path: seq.path.clone(),
                multiplicity: seq.values.len(),
                nesting_order: seq.nesting_order,
            });
        }

        for input in &task.schema.inputs {
            let path = format!("inputs.{}", input.parameter);
            if input_data.contains_key(&path) {
                continue;
            }
            let sources = task
                .input_sources
                .get(&input.parameter)
                .cloned()
                .unwrap_or_default();
            let source = sources.first().cloned().unwrap_or(InputSource::Local);

            match source {
                InputSource::Local => {
                    let value = task.inputs.get(&input.parameter).cloned();
                    if let Some(value) = value {
                        let idx = self
                            .store
                            .add_parameter_data(Some(value), ParameterSource::Local)?;
                        input_data.insert(path, vec![idx]);
                    }
                }
                InputSource::Default => {
                    let value = input.default_value.clone().ok_or_else(|| {
                        Error::MissingInputs(vec![input.parameter.clone()])
                    })?;
                    let idx = self
                        .store
                        .add_parameter_data(Some(value), ParameterSource::Default)?;
                    input_data.insert(path, vec![idx]);
                }
                InputSource::Task { task_ref, .. } => {
                    let indices =
                        self.upstream_output_indices(task_ref, &input.parameter)?;
                    if indices.is_empty() {
                        return Err(Error::MissingInputs(vec![input.parameter.clone()]));
                    }
                    if indices.len() > 1 {
                        specs.push(SequenceSpec {
                            path: path.clone(),
                            multiplicity: indices.len(),
                            nesting_order: 0,
                        });
                    }
                    input_data.insert(path, indices);
                }
            }
        }

        if let Some(repeats) = task.repeats.filter(|r| *r > 1) {
            specs.push(SequenceSpec {
                path: String::from("repeats"),
                multiplicity: repeats,
                nesting_order: i64::MIN,
            });
        }

        let rows = resolve_element_data_indices(&specs)?;
        let num_elements = rows.len();

        // outputs are pre-allocated unset, one per element
        let mut output_data: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for output in &task.schema.outputs {
            let indices = (0..num_elements)
                .map(|_| {
                    self.store
                        .add_parameter_data(None, ParameterSource::task_output(insert_id))
                })
                .collect::<Result<Vec<_>>>()?;
            output_data.insert(output.parameter.clone(), indices);
        }

        let element_data = generate_new_elements(&input_data, &output_data, &rows);

        // producer lookup for dependency edges on upstream runs
        let mut producers: BTreeMap<usize, u64> = BTreeMap::new();
        for ear in self.store.get_all_ears()? {
            for idx in ear.data_out.values() {
                producers.insert(*idx, ear.id);
            }
        }

        let resources = task.run_resources();
        let mut ears: Vec<Ear> = Vec::new();
        let mut ear_layout: Vec<Vec<(usize, usize)>> = Vec::new(); // per element: (action_idx, ear offset)
        for (element_idx, data_index) in element_data.iter().enumerate() {
            let mut row = Vec::new();
            for (action_idx, action) in task.schema.actions.iter().enumerate() {
                if !action.applies_to(&resources) {
                    continue;
                }
                let data_in: BTreeMap<String, usize> = data_index
                    .iter()
                    .filter(|(k, _)| k.starts_with("inputs."))
                    .map(|(k, v)| (k.clone(), *v))
                    .collect();
                let data_out: BTreeMap<String, usize> = data_index
                    .iter()
                    .filter(|(k, _)| k.starts_with("outputs."))
                    .map(|(k, v)| {
                        (k.trim_start_matches("outputs.").to_string(), *v)
                    })
                    .collect();
                let dependencies: Vec<u64> = data_in
                    .values()
                    .filter_map(|idx| producers.get(idx).copied())
                    .collect();

                row.push((action_idx, ears.len()));
                ears.push(Ear {
                    id: 0, // assigned by the store
                    task_insert_id: insert_id,
                    element_idx,
                    iteration_idx: 0,
                    action_idx,
                    run_idx: 0,
                    resources: resources.clone(),
                    status: EarStatus::Pending,
                    exit_code: None,
                    start_time: None,
                    end_time: None,
                    skip: false,
                    data_in,
                    data_out,
                    dependencies,
                });
            }
            ear_layout.push(row);
        }

        let ear_ids = self.store.add_ears(ears)?;

        let elements: Vec<Element> = element_data
            .into_iter()
            .enumerate()
            .map(|(element_idx, data_index)| {
                let actions: BTreeMap<usize, Vec<u64>> = ear_layout[element_idx]
                    .iter()
                    .map(|(action_idx, offset)| (*action_idx, vec![ear_ids[*offset]]))
                    .collect();
                Element {
                    element_idx,
                    data_index,
                    iterations: vec![ElementIteration {
                        iteration_idx: 0,
                        loop_idx: BTreeMap::new(),
                        actions,
                    }],
                }
            })
            .collect();

        self.store.add_template_task(new_index, task)?;
        self.store.add_workflow_task(
            new_index,
            StoreTask {
                insert_id,
                elements,
            },
        )?;
        self.store.commit_pending()?;

        debug!(insert_id, num_elements, "added task");
        Ok(insert_id)
    }

    fn ensure_input_sources(
        &self,
        task: &mut TaskTemplate,
        upstream: &[&TaskTemplate],
    ) -> Result<()> {
        let available = task.available_input_sources(upstream);

        // validate explicitly specified sources
        for (param, sources) in &task.input_sources {
            for source in sources {
                if let InputSource::Task { task_ref, .. } = source {
                    if Some(*task_ref) == task.insert_id {
                        return Err(Error::InvalidInputSourceTaskReference(format!(
                            "Input source for {:?} cannot refer to the outputs of its own task",
                            param
                        )));
                    }
                    if !upstream.iter().any(|t| t.insert_id == Some(*task_ref)) {
                        return Err(Error::InvalidInputSourceTaskReference(format!(
                            "Input source for {:?} refers to a missing or inaccessible task: {}",
                            param, task_ref
                        )));
                    }
                }
            }
        }

        // set the first available source for any unsourced input
        let mut missing = Vec::new();
        for param in task.unsourced_inputs() {
            match available.get(&param).and_then(|s| s.first()) {
                Some(source) => {
                    task.input_sources
                        .insert(param.clone(), vec![source.clone()]);
                }
                None => missing.push(param),
            }
        }
        if !missing.is_empty() {
            return Err(Error::MissingInputs(missing));
        }
        Ok(())
    }

    /// Per-element output data indices of an upstream task, in element
    /// order.
    fn upstream_output_indices(&self, task_ref: u64, parameter: &str) -> Result<Vec<usize>> {
        let template = self.store.get_template()?;
        let task_idx = template
            .tasks
            .iter()
            .position(|t| t.insert_id == Some(task_ref))
            .ok_or_else(|| {
                Error::InvalidInputSourceTaskReference(format!(
                    "Unknown task reference: {}",
                    task_ref
                ))
            })?;
        let metadata = self.store.get_all_tasks_metadata()?;
        let elements = self
            .store
            .get_task_elements(task_idx, 0..metadata[task_idx].num_elements)?;
        let path = format!("outputs.{}", parameter);
        Ok(elements
            .iter()
            .filter_map(|e| e.data_index.get(&path).copied())
            .collect())
    }

    // ------------------------------------------------------------------
    // submission

    /// Plan all pending EARs into jobscripts, persist the submission and
    /// submit each jobscript in topological order. Returns the submission
    /// index, or `None` when there is nothing to submit.
    pub async fn submit(
        &mut self,
        js_parallelism: Option<bool>,
        wait: bool,
    ) -> Result<Option<usize>> {
        let resolved = {
            let _snapshot = self.store.cached_load()?;
            let template = self.store.get_template()?;
            let metadata = self.store.get_all_tasks_metadata()?;

            let mut tasks = Vec::new();
            for (task_idx, task) in template.tasks.iter().enumerate() {
                let insert_id = task.insert_id.ok_or_else(|| {
                    Error::Runtime(format!("Task at index {} has no insert ID", task_idx))
                })?;
                let elements = self
                    .store
                    .get_task_elements(task_idx, 0..metadata[task_idx].num_elements)?;
                tasks.push(TaskPlanInput {
                    insert_id,
                    num_actions: task.schema.actions.len(),
                    elements,
                });
            }

            let ears: BTreeMap<u64, Ear> = self
                .store
                .get_all_ears()?
                .into_iter()
                .map(|e| (e.id, e))
                .collect();
            plan_jobscripts(&tasks, &ears)?
        };

        if resolved.is_empty() {
            return Ok(None);
        }

        let sub_idx = self.store.get_submissions()?.len();
        self.store
            .add_submission(build_submission(sub_idx, resolved))?;
        self.store.commit_pending()?;

        self.append_to_watch_file();

        let outcome = submission::submit_jobscripts(
            &mut self.store,
            &self.config,
            sub_idx,
            js_parallelism,
            wait,
        )
        .await?;

        if let Some(failure) = outcome.failure {
            return Err(failure);
        }
        info!(sub_idx, num_jobscripts = outcome.submitted.len(), "submitted");
        Ok(Some(sub_idx))
    }

    fn append_to_watch_file(&self) {
        if let Some(watch_file) = self.config.watch_file() {
            let result = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(watch_file)
                .and_then(|mut f| writeln!(f, "{}", self.path.display()));
            if let Err(e) = result {
                debug!("cannot append to watch file: {}", e);
            }
        }
    }

    pub fn get_submissions(&self) -> Result<Vec<SubmissionRecord>> {
        self.store.get_submissions()
    }

    // ------------------------------------------------------------------
    // parameter and EAR queries

    pub fn get_parameter_data(&self, index: usize) -> Result<Option<serde_json::Value>> {
        self.store.get_parameter_data(index)
    }

    pub fn get_parameter_source(&self, index: usize) -> Result<ParameterSource> {
        self.store.get_parameter_source(index)
    }

    pub fn is_parameter_set(&self, index: usize) -> Result<bool> {
        self.store.is_parameter_set(index)
    }

    pub fn get_all_parameter_data(&self) -> Result<BTreeMap<usize, Option<serde_json::Value>>> {
        let _snapshot = self.store.cached_load()?;
        let mut out = BTreeMap::new();
        let mut index = 0;
        while let Ok(value) = self.store.get_parameter_data(index) {
            out.insert(index, value);
            index += 1;
        }
        Ok(out)
    }

    pub fn get_ears_from_ids(&self, ids: &[u64]) -> Result<Vec<Ear>> {
        self.store.get_ears_from_ids(ids)
    }

    // ------------------------------------------------------------------
    // jobscript state queries

    /// Active scheduler state of a jobscript, keyed by block then element.
    ///
    /// EAR statuses are consulted first; the scheduler is only queried when
    /// some run may be active, and only on the machine the jobscript was
    /// submitted from.
    pub async fn get_active_jobscript_states(
        &self,
        sub_idx: usize,
        js_idx: usize,
    ) -> Result<BTreeMap<usize, BTreeMap<usize, JobscriptElementState>>> {
        let submissions = self.store.get_submissions()?;
        let js = submissions
            .get(sub_idx)
            .and_then(|s| s.jobscripts.get(js_idx))
            .ok_or_else(|| Error::Runtime(format!("No jobscript ({}, {})", sub_idx, js_idx)))?;

        let ears = self.store.get_ears_from_ids(&js.all_ear_ids())?;
        if ears.iter().all(|e| e.status.is_terminal()) {
            return Ok(BTreeMap::new());
        }

        let submit_machine = match &js.submit_machine {
            Some(machine) => machine.clone(),
            None => return Ok(BTreeMap::new()),
        };
        if &submit_machine != self.config.machine() {
            return Err(Error::NotSubmitMachine {
                current: self.config.machine().clone(),
                submit: submit_machine,
            });
        }

        let job_ref = match (&js.scheduler_job_id, js.process_id) {
            (Some(job_id), _) => job_id.clone(),
            (None, Some(pid)) => pid.to_string(),
            (None, None) => return Ok(BTreeMap::new()),
        };

        let scheduler = get_scheduler(js.scheduler_name())?;
        let refs = vec![job_ref.clone()];
        let query = scheduler.state_query_command(&refs);
        if query.is_empty() {
            return Ok(BTreeMap::new());
        }
        let output = tokio::process::Command::new(&query[0])
            .args(&query[1..])
            .output()
            .await
            .map_err(|e| Error::Runtime(format!("Scheduler query failed: {}", e)))?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let states = scheduler.parse_state_output(&stdout, &refs);

        let mut out = BTreeMap::new();
        match states.get(&job_ref) {
            None => {}
            Some(JobState::Array(map)) => {
                // an array jobscript has exactly one block
                out.insert(0, map.clone());
            }
            Some(JobState::Single(state)) => {
                for (block_idx, block) in js.blocks.iter().enumerate() {
                    out.insert(
                        block_idx,
                        (0..block.num_elements()).map(|e| (e, *state)).collect(),
                    );
                }
            }
        }
        Ok(out)
    }

    /// Poll the scheduler until none of the given jobscripts is active.
    pub async fn wait_for_jobscripts(&self, sub_idx: usize, js_indices: &[usize]) -> Result<()> {
        let mut outstanding: Vec<usize> = js_indices.to_vec();
        while !outstanding.is_empty() {
            let mut still_active = Vec::new();
            for js_idx in outstanding {
                let states = self.get_active_jobscript_states(sub_idx, js_idx).await?;
                if !states.is_empty() {
                    still_active.push(js_idx);
                }
            }
            outstanding = still_active;
            if !outstanding.is_empty() {
                tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // internal callbacks (invoked from running jobscripts)

    fn locate_jobscript(&self, sub_idx: usize, js_idx: usize) -> Result<JobscriptRecord> {
        self.store
            .get_submissions()?
            .get(sub_idx)
            .and_then(|s| s.jobscripts.get(js_idx).cloned())
            .ok_or_else(|| Error::Runtime(format!("No jobscript ({}, {})", sub_idx, js_idx)))
    }

    /// Resolve (jobscript element, jobscript action) to the owning block and
    /// EAR id; the element index is global across the jobscript's blocks.
    fn locate_ear(
        &self,
        sub_idx: usize,
        js_idx: usize,
        js_elem_idx: usize,
        js_act_idx: usize,
    ) -> Result<(usize, u64)> {
        let js = self.locate_jobscript(sub_idx, js_idx)?;
        let mut start = 0;
        for (block_idx, block) in js.blocks.iter().enumerate() {
            if js_elem_idx < start + block.num_elements() {
                let local_elem = js_elem_idx - start;
                let cell = block
                    .ear_ids
                    .get(js_act_idx)
                    .and_then(|row| row.get(local_elem))
                    .copied()
                    .ok_or_else(|| {
                        Error::Runtime(format!(
                            "No run at action {} element {} of jobscript ({}, {})",
                            js_act_idx, js_elem_idx, sub_idx, js_idx
                        ))
                    })?;
                if cell < 0 {
                    return Err(Error::Runtime(format!(
                        "Run at action {} element {} is not scheduled",
                        js_act_idx, js_elem_idx
                    )));
                }
                return Ok((block_idx, cell as u64));
            }
            start += block.num_elements();
        }
        Err(Error::Runtime(format!(
            "No element {} in jobscript ({}, {})",
            js_elem_idx, sub_idx, js_idx
        )))
    }

    /// Write the commands file for one run; a run whose element saw an
    /// earlier failure is marked skipped and gets an empty commands file.
    pub fn write_commands(
        &mut self,
        sub_idx: usize,
        js_idx: usize,
        js_elem_idx: usize,
        js_act_idx: usize,
    ) -> Result<()> {
        let (block_idx, ear_id) = self.locate_ear(sub_idx, js_idx, js_elem_idx, js_act_idx)?;
        let ear = self.store.get_ears_from_ids(&[ear_id])?.remove(0);
        let js = self.locate_jobscript(sub_idx, js_idx)?;

        let shell = get_shell(js.shell_name(), js.os_name())?;
        let cmd_path = submission::submission_path(&self.path, sub_idx)
            .join(SCRIPTS_DIR_NAME)
            .join(format!(
                "js_{}_block_{}_act_{}_elem_{}{}",
                js_idx,
                block_idx,
                js_act_idx,
                js_elem_idx,
                shell.js_ext()
            ));

        // skip propagation: an upstream action of the same element failed
        let block = &js.blocks[block_idx];
        let local_elem = {
            let start: usize = js.blocks[..block_idx].iter().map(|b| b.num_elements()).sum();
            js_elem_idx - start
        };
        let mut upstream_failed = false;
        for row in block.ear_ids[..js_act_idx].iter() {
            let cell = row[local_elem];
            if cell < 0 {
                continue;
            }
            let upstream = self.store.get_ears_from_ids(&[cell as u64])?.remove(0);
            if matches!(upstream.status, EarStatus::Error | EarStatus::Aborted) {
                upstream_failed = true;
                break;
            }
        }
        if upstream_failed {
            self.store.update_ear(
                ear_id,
                EarStatus::Skipped,
                Some(SKIPPED_EXIT_CODE),
                None,
                Some(Utc::now()),
                Some(true),
            )?;
            self.store.commit_pending()?;
            std::fs::write(&cmd_path, b"")
                .map_err(|e| Error::Runtime(format!("Cannot write {}: {}", cmd_path.display(), e)))?;
            return Ok(());
        }

        // abort requested through the abort file
        if self.abort_requested(sub_idx, ear_id)? {
            self.store.update_ear(
                ear_id,
                EarStatus::Aborted,
                Some(ABORT_EXIT_CODE),
                None,
                Some(Utc::now()),
                None,
            )?;
            self.store.commit_pending()?;
            std::fs::write(&cmd_path, b"")
                .map_err(|e| Error::Runtime(format!("Cannot write {}: {}", cmd_path.display(), e)))?;
            return Ok(());
        }

        let template = self.store.get_template()?;
        let task = template
            .tasks
            .iter()
            .find(|t| t.insert_id == Some(ear.task_insert_id))
            .ok_or_else(|| {
                Error::Runtime(format!("No task with insert ID {}", ear.task_insert_id))
            })?;
        let action = task.schema.actions.get(ear.action_idx).ok_or_else(|| {
            Error::Runtime(format!(
                "No action {} in task {}",
                ear.action_idx, ear.task_insert_id
            ))
        })?;

        let mut text = String::new();
        for command in &action.commands {
            let mut line = command.command.clone();
            for (path, idx) in &ear.data_in {
                let name = path.trim_start_matches("inputs.");
                let value = self
                    .store
                    .get_parameter_data(*idx)?
                    .map(format_parameter_value)
                    .unwrap_or_default();
                line = line.replace(&format!("<<parameter:{}>>", name), &value);
            }
            if let Some(stdout_param) = &command.stdout {
                let var = format!("{}_out", stdout_param);
                text.push_str(&shell.format_stream_assignment(&var, &line));
                text.push('\n');
                text.push_str(&shell.format_save_parameter(stdout_param, &var));
            } else {
                text.push_str(&line);
                text.push('\n');
            }
        }
        std::fs::write(&cmd_path, text.as_bytes())
            .map_err(|e| Error::Runtime(format!("Cannot write {}: {}", cmd_path.display(), e)))?;
        Ok(())
    }

    fn abort_requested(&self, sub_idx: usize, ear_id: u64) -> Result<bool> {
        let submissions = self.store.get_submissions()?;
        let submission = match submissions.get(sub_idx) {
            Some(s) => s,
            None => return Ok(false),
        };
        let mut ear_ids: Vec<u64> = submission
            .jobscripts
            .iter()
            .flat_map(|js| js.all_ear_ids())
            .collect();
        ear_ids.sort_unstable();
        let line_idx = match ear_ids.iter().position(|id| *id == ear_id) {
            Some(i) => i,
            None => return Ok(false),
        };

        let abort_path =
            submission::submission_path(&self.path, sub_idx).join(ABORT_EARS_FILE_NAME);
        let text = match std::fs::read_to_string(&abort_path) {
            Ok(t) => t,
            Err(_) => return Ok(false),
        };
        Ok(text.lines().nth(line_idx).map(str::trim) == Some("1"))
    }

    /// Record the start of a run. Skipped and aborted runs are left alone.
    pub fn set_ear_start(
        &mut self,
        sub_idx: usize,
        js_idx: usize,
        js_elem_idx: usize,
        js_act_idx: usize,
    ) -> Result<()> {
        let (_, ear_id) = self.locate_ear(sub_idx, js_idx, js_elem_idx, js_act_idx)?;
        let ear = self.store.get_ears_from_ids(&[ear_id])?.remove(0);
        if ear.status.is_terminal() {
            return Ok(());
        }
        self.store
            .update_ear(ear_id, EarStatus::Running, None, Some(Utc::now()), None, None)?;
        self.store.commit_pending()
    }

    /// Finalise a run with its exit code.
    pub fn set_ear_end(
        &mut self,
        sub_idx: usize,
        js_idx: usize,
        js_elem_idx: usize,
        js_act_idx: usize,
        exit_code: i32,
    ) -> Result<()> {
        let (_, ear_id) = self.locate_ear(sub_idx, js_idx, js_elem_idx, js_act_idx)?;
        let ear = self.store.get_ears_from_ids(&[ear_id])?.remove(0);
        if ear.status.is_terminal() {
            return Ok(());
        }
        let status = if exit_code == 0 {
            EarStatus::Success
        } else {
            EarStatus::Error
        };
        self.store.update_ear(
            ear_id,
            status,
            Some(exit_code),
            None,
            Some(Utc::now()),
            None,
        )?;
        self.store.commit_pending()
    }

    /// Save a command's captured output as the run's named output parameter.
    pub fn save_parameter(
        &mut self,
        name: &str,
        value: &str,
        sub_idx: usize,
        js_idx: usize,
        js_elem_idx: usize,
        js_act_idx: usize,
    ) -> Result<()> {
        let (_, ear_id) = self.locate_ear(sub_idx, js_idx, js_elem_idx, js_act_idx)?;
        let ear = self.store.get_ears_from_ids(&[ear_id])?.remove(0);
        let idx = ear.data_out.get(name).copied().ok_or_else(|| {
            Error::Runtime(format!("Run {} has no output parameter {:?}", ear_id, name))
        })?;
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        self.store.set_parameter(idx, value)?;
        self.store.commit_pending()
    }
}

fn format_parameter_value(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}
