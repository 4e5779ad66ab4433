//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Crash-consistent persistence for workflow metadata, parameters, EARs and
//! submissions.
//!
//! All mutation goes through a pending buffer; `commit_pending` computes the
//! next on-disk image and installs it atomically (write to temp, rename).
//! Readers always see the last committed image, except inside a pinned
//! snapshot (`cached_load`) or via the pending overlay of the writing store.

pub mod pending;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::model::element::{Ear, EarStatus, Element, ElementIteration};
use crate::model::parameter::ParameterSource;
use crate::model::task::TaskTemplate;
use crate::model::template::WorkflowTemplate;
pub use crate::submission::jobscript::SubmissionRecord;

use pending::{EarUpdate, JobscriptMetadataUpdate, Pending};

pub const METADATA_FILE_NAME: &str = "metadata.json";
pub const PARAMETER_DATA_DIR_NAME: &str = "parameter_data";
pub const SUBMISSIONS_DIR_NAME: &str = "submissions";
pub const ARTIFACTS_DIR_NAME: &str = "artifacts";
const LOCK_FILE_NAME: &str = ".gantry-lock";
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-task persisted state: its elements, iterations and the EAR ids hung
/// off them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreTask {
    pub insert_id: u64,
    pub elements: Vec<Element>,
}

#[derive(Clone, Debug)]
pub struct TaskMetadata {
    pub num_elements: usize,
}

/// The complete committed image, excluding parameter payloads (which live in
/// one file per data index under `parameter_data/`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowImage {
    pub template: WorkflowTemplate,
    pub tasks: Vec<StoreTask>,
    pub num_added_tasks: usize,
    pub loops: Vec<serde_json::Value>,
    pub parameter_sources: BTreeMap<usize, ParameterSource>,
    pub num_parameters: usize,
    pub ears: BTreeMap<u64, Ear>,
    pub next_ear_id: u64,
    pub submissions: Vec<SubmissionRecord>,
    pub replaced_file: Option<String>,
}

impl WorkflowImage {
    fn empty(template: WorkflowTemplate) -> Self {
        WorkflowImage {
            template,
            tasks: Vec::new(),
            num_added_tasks: 0,
            loops: Vec::new(),
            parameter_sources: BTreeMap::new(),
            num_parameters: 0,
            ears: BTreeMap::new(),
            next_ear_id: 0,
            submissions: Vec::new(),
            replaced_file: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StoreMode {
    ReadOnly,
    ReadWrite,
}

/// Filesystem lock enforcing the single-writer discipline.
#[derive(Debug)]
struct StoreLock {
    path: PathBuf,
}

impl StoreLock {
    fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE_NAME);
        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Ok(StoreLock { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(Error::Runtime(format!(
                            "Workflow store is locked by another writer: {}",
                            path.display()
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    return Err(Error::Runtime(format!(
                        "Cannot acquire store lock {}: {}",
                        path.display(),
                        e
                    )))
                }
            }
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[derive(Debug, Default)]
struct SnapshotCell {
    image: Option<WorkflowImage>,
    refs: usize,
}

/// Handle pinning a read snapshot; released on drop on every exit path.
/// Nested pins share the same snapshot.
pub struct CachedLoad<'s> {
    store: &'s Store,
}

impl Drop for CachedLoad<'_> {
    fn drop(&mut self) {
        let mut cell = self.store.snapshot.borrow_mut();
        cell.refs -= 1;
        if cell.refs == 0 {
            cell.image = None;
        }
    }
}

/// The persistent workflow store.
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    mode: StoreMode,
    _lock: Option<StoreLock>,
    pending: Pending,
    snapshot: RefCell<SnapshotCell>,
}

impl Store {
    /// Open an existing store. Fails with `WorkflowNotFound` when no store
    /// signature is present at `path`.
    pub fn open(path: &Path, mode: StoreMode) -> Result<Self> {
        if !path.join(METADATA_FILE_NAME).is_file() {
            return Err(Error::WorkflowNotFound(path.to_path_buf()));
        }
        let lock = match mode {
            StoreMode::ReadWrite => Some(StoreLock::acquire(path)?),
            StoreMode::ReadOnly => None,
        };
        Ok(Store {
            path: path.to_path_buf(),
            mode,
            _lock: lock,
            pending: Pending::default(),
            snapshot: RefCell::new(SnapshotCell::default()),
        })
    }

    /// Create a new empty workflow store at `path`.
    ///
    /// With `overwrite`, an existing directory is first renamed away with a
    /// random suffix so it can be recovered or discarded later.
    pub fn write_empty(path: &Path, template: WorkflowTemplate, overwrite: bool) -> Result<Self> {
        let mut replaced_file = None;
        if path.exists() {
            if !overwrite {
                return Err(Error::WorkflowExists(path.to_path_buf()));
            }
            let replaced = rename_existing(path)?;
            replaced_file = Some(
                replaced
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            );
        }

        std::fs::create_dir_all(path.join(PARAMETER_DATA_DIR_NAME)).map_err(io_err(path))?;
        std::fs::create_dir_all(path.join(SUBMISSIONS_DIR_NAME)).map_err(io_err(path))?;
        std::fs::create_dir_all(path.join(ARTIFACTS_DIR_NAME)).map_err(io_err(path))?;

        let mut image = WorkflowImage::empty(template);
        image.replaced_file = replaced_file;
        dump_image(path, &image)?;

        debug!(path = %path.display(), "created empty workflow store");
        Self::open(path, StoreMode::ReadWrite)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> StoreMode {
        self.mode
    }

    pub fn submissions_path(&self) -> PathBuf {
        self.path.join(SUBMISSIONS_DIR_NAME)
    }

    pub fn artifacts_path(&self) -> PathBuf {
        self.path.join(ARTIFACTS_DIR_NAME)
    }

    // ------------------------------------------------------------------
    // snapshot reads

    /// Pin a read snapshot for the lifetime of the returned guard. All reads
    /// through this store observe the same committed image until release.
    pub fn cached_load(&self) -> Result<CachedLoad<'_>> {
        {
            let mut cell = self.snapshot.borrow_mut();
            if cell.refs == 0 {
                cell.image = Some(self.load_disk_image()?);
            }
            cell.refs += 1;
        }
        Ok(CachedLoad { store: self })
    }

    /// Compare the pinned snapshot against the current on-disk image.
    pub fn is_modified_on_disk(&self) -> Result<bool> {
        let cell = self.snapshot.borrow();
        match cell.image.as_ref() {
            None => Ok(false),
            Some(snapshot) => {
                let disk = self.load_disk_image()?;
                Ok(image_digest(&disk)? != image_digest(snapshot)?)
            }
        }
    }

    fn load_disk_image(&self) -> Result<WorkflowImage> {
        load_image(&self.path)
    }

    fn with_image<R>(&self, f: impl FnOnce(&WorkflowImage) -> Result<R>) -> Result<R> {
        let cell = self.snapshot.borrow();
        if let Some(image) = cell.image.as_ref() {
            return f(image);
        }
        drop(cell);
        let image = self.load_disk_image()?;
        f(&image)
    }

    // ------------------------------------------------------------------
    // readers

    pub fn get_template(&self) -> Result<WorkflowTemplate> {
        self.with_image(|image| Ok(image.template.clone()))
    }

    pub fn get_loops(&self) -> Result<Vec<serde_json::Value>> {
        self.with_image(|image| Ok(image.loops.clone()))
    }

    pub fn get_num_added_tasks(&self) -> Result<usize> {
        self.with_image(|image| Ok(image.num_added_tasks + self.pending.tasks.len()))
    }

    pub fn get_all_tasks_metadata(&self) -> Result<Vec<TaskMetadata>> {
        self.with_image(|image| {
            let mut out: Vec<TaskMetadata> = image
                .tasks
                .iter()
                .map(|t| TaskMetadata {
                    num_elements: t.elements.len(),
                })
                .collect();
            for (idx, task) in &self.pending.tasks {
                let meta = TaskMetadata {
                    num_elements: task.elements.len(),
                };
                if *idx >= out.len() {
                    out.push(meta);
                } else {
                    out.insert(*idx, meta);
                }
            }
            for ((task_idx, _), elements) in &self.pending.elements {
                if let Some(meta) = out.get_mut(*task_idx) {
                    meta.num_elements += elements.len();
                }
            }
            Ok(out)
        })
    }

    /// Elements of one task in the given range, with the pending overlay
    /// (appended elements, iterations and loop indices) applied.
    pub fn get_task_elements(&self, task_idx: usize, selection: Range<usize>) -> Result<Vec<Element>> {
        self.with_image(|image| {
            let mut elements: Vec<Element> = Vec::new();
            let mut insert_id = None;

            if let Some(task) = image.tasks.get(task_idx) {
                elements.extend(task.elements.iter().cloned());
                insert_id = Some(task.insert_id);
            }
            if let Some(task) = self.pending.tasks.get(&task_idx) {
                elements.extend(task.elements.iter().cloned());
                insert_id = Some(task.insert_id);
            }
            let insert_id = insert_id
                .ok_or_else(|| Error::Runtime(format!("No task at index {}", task_idx)))?;

            if let Some(appended) = self.pending.elements.get(&(task_idx, insert_id)) {
                elements.extend(appended.iter().cloned());
            }

            for element in &mut elements {
                let key = (task_idx, insert_id, element.element_idx);
                if let Some(iters) = self.pending.element_iterations.get(&key) {
                    element.iterations.extend(iters.iter().cloned());
                }
                for iteration in &mut element.iterations {
                    let loop_key =
                        (task_idx, insert_id, element.element_idx, iteration.iteration_idx);
                    if let Some(loop_idx) = self.pending.loop_idx.get(&loop_key) {
                        iteration.loop_idx.extend(loop_idx.clone());
                    }
                }
            }

            let end = selection.end.min(elements.len());
            let start = selection.start.min(end);
            Ok(elements[start..end].to_vec())
        })
    }

    pub fn get_parameter_data(&self, index: usize) -> Result<Option<serde_json::Value>> {
        if let Some(data) = self.pending.parameter_data.get(&index) {
            return Ok(data.clone());
        }
        self.with_image(|image| {
            if index >= image.num_parameters {
                return Err(Error::UnknownParameter(index));
            }
            read_parameter_file(&self.path, index)
        })
    }

    pub fn get_parameter_source(&self, index: usize) -> Result<ParameterSource> {
        if let Some(source) = self.pending.parameter_sources.get(&index) {
            return Ok(source.clone());
        }
        self.with_image(|image| {
            image
                .parameter_sources
                .get(&index)
                .cloned()
                .ok_or(Error::UnknownParameter(index))
        })
    }

    pub fn is_parameter_set(&self, index: usize) -> Result<bool> {
        Ok(self.get_parameter_data(index)?.is_some())
    }

    pub fn check_parameters_exist(&self, indices: &[usize]) -> Result<Vec<bool>> {
        self.with_image(|image| {
            Ok(indices
                .iter()
                .map(|i| {
                    *i < image.num_parameters || self.pending.parameter_data.contains_key(i)
                })
                .collect())
        })
    }

    /// Constant-time EAR lookup by id, with the pending overlay applied.
    pub fn get_ears_from_ids(&self, ids: &[u64]) -> Result<Vec<Ear>> {
        self.with_image(|image| {
            ids.iter()
                .map(|id| {
                    let mut ear = self
                        .pending
                        .ears
                        .get(id)
                        .or_else(|| image.ears.get(id))
                        .cloned()
                        .ok_or_else(|| Error::Runtime(format!("Unknown EAR id: {}", id)))?;
                    if let Some(update) = self.pending.ear_updates.get(id) {
                        apply_ear_update(&mut ear, update);
                    }
                    Ok(ear)
                })
                .collect()
        })
    }

    pub fn get_all_ears(&self) -> Result<Vec<Ear>> {
        self.with_image(|image| {
            let mut ears: Vec<Ear> = image.ears.values().cloned().collect();
            ears.extend(self.pending.ears.values().cloned());
            for ear in &mut ears {
                if let Some(update) = self.pending.ear_updates.get(&ear.id) {
                    apply_ear_update(ear, update);
                }
            }
            Ok(ears)
        })
    }

    pub fn get_submissions(&self) -> Result<Vec<SubmissionRecord>> {
        self.with_image(|image| {
            let mut subs = image.submissions.clone();
            subs.extend(self.pending.submissions.iter().cloned());
            for update in &self.pending.jobscript_metadata {
                if let Some(js) = subs
                    .get_mut(update.sub_idx)
                    .and_then(|s| s.jobscripts.get_mut(update.js_idx))
                {
                    js.apply_metadata(update);
                }
            }
            for (sub_idx, js_idx) in &self.pending.submitted_jobscripts {
                if let Some(sub) = subs.get_mut(*sub_idx) {
                    if !sub.submitted_jobscripts.contains(js_idx) {
                        sub.submitted_jobscripts.push(*js_idx);
                    }
                }
            }
            Ok(subs)
        })
    }

    // ------------------------------------------------------------------
    // writers (buffered)

    fn assert_writable(&self) -> Result<()> {
        if self.mode != StoreMode::ReadWrite {
            return Err(Error::Runtime(String::from(
                "Workflow store was opened read-only",
            )));
        }
        Ok(())
    }

    /// Allocate a new parameter data index. `data` of `None` pre-allocates an
    /// unset slot to be filled by a run.
    pub fn add_parameter_data(
        &mut self,
        data: Option<serde_json::Value>,
        source: ParameterSource,
    ) -> Result<usize> {
        self.assert_writable()?;
        let index = self.with_image(|image| {
            Ok(image.num_parameters + self.pending.parameter_data.len())
        })?;
        self.pending.parameter_data.insert(index, data);
        self.pending.parameter_sources.insert(index, source);
        trace!(index, "buffered new parameter");
        Ok(index)
    }

    /// Set the value of a pre-allocated parameter. Fails if already set; a
    /// parameter value, once written, is never rewritten.
    pub fn set_parameter(&mut self, index: usize, data: serde_json::Value) -> Result<()> {
        self.assert_writable()?;
        if self.is_parameter_set(index)? {
            return Err(Error::ParameterAlreadySet(index));
        }
        self.pending.parameter_data.insert(index, Some(data));
        Ok(())
    }

    pub fn add_template_task(&mut self, new_index: usize, task: TaskTemplate) -> Result<()> {
        self.assert_writable()?;
        self.pending.template_tasks.insert(new_index, task);
        Ok(())
    }

    pub fn add_workflow_task(&mut self, new_index: usize, task: StoreTask) -> Result<()> {
        self.assert_writable()?;
        self.pending.tasks.insert(new_index, task);
        Ok(())
    }

    pub fn add_elements(
        &mut self,
        task_idx: usize,
        task_insert_id: u64,
        elements: Vec<Element>,
    ) -> Result<()> {
        self.assert_writable()?;
        self.pending
            .elements
            .entry((task_idx, task_insert_id))
            .or_default()
            .extend(elements);
        Ok(())
    }

    pub fn append_element_iterations(
        &mut self,
        task_idx: usize,
        task_insert_id: u64,
        element_idx: usize,
        iterations: Vec<ElementIteration>,
    ) -> Result<()> {
        self.assert_writable()?;
        self.pending
            .element_iterations
            .entry((task_idx, task_insert_id, element_idx))
            .or_default()
            .extend(iterations);
        Ok(())
    }

    pub fn add_loop_idx(
        &mut self,
        task_idx: usize,
        task_insert_id: u64,
        element_idx: usize,
        iteration_idx: usize,
        loop_idx: BTreeMap<String, usize>,
    ) -> Result<()> {
        self.assert_writable()?;
        self.pending
            .loop_idx
            .entry((task_idx, task_insert_id, element_idx, iteration_idx))
            .or_default()
            .extend(loop_idx);
        Ok(())
    }

    pub fn add_loop(&mut self, loop_js: serde_json::Value) -> Result<()> {
        self.assert_writable()?;
        self.pending.loops.push(loop_js);
        Ok(())
    }

    /// Register new EARs, assigning ids from the monotonic counter. Ids are
    /// never reused.
    pub fn add_ears(&mut self, mut ears: Vec<Ear>) -> Result<Vec<u64>> {
        self.assert_writable()?;
        let base = self.with_image(|image| Ok(image.next_ear_id))?
            + self.pending.ears.len() as u64;
        let mut ids = Vec::with_capacity(ears.len());
        for (offset, ear) in ears.iter_mut().enumerate() {
            ear.id = base + offset as u64;
            ids.push(ear.id);
        }
        for ear in ears {
            self.pending.ears.insert(ear.id, ear);
        }
        Ok(ids)
    }

    /// Advance an EAR through its lifecycle, rejecting transitions outside
    /// the legal state machine.
    pub fn update_ear(
        &mut self,
        ear_id: u64,
        status: EarStatus,
        exit_code: Option<i32>,
        start_time: Option<chrono::DateTime<chrono::Utc>>,
        end_time: Option<chrono::DateTime<chrono::Utc>>,
        skip: Option<bool>,
    ) -> Result<()> {
        self.assert_writable()?;
        let current = self.get_ears_from_ids(&[ear_id])?.remove(0).status;
        if !current.can_transition_to(status) {
            return Err(Error::InvalidEarTransition {
                ear_id,
                from: current.to_string(),
                to: status.to_string(),
            });
        }
        let update = self.pending.ear_updates.entry(ear_id).or_default();
        update.status = Some(status);
        if exit_code.is_some() {
            update.exit_code = exit_code;
        }
        if start_time.is_some() {
            update.start_time = start_time;
        }
        if end_time.is_some() {
            update.end_time = end_time;
        }
        if skip.is_some() {
            update.skip = skip;
        }
        Ok(())
    }

    pub fn add_submission(&mut self, submission: SubmissionRecord) -> Result<usize> {
        self.assert_writable()?;
        let index = self.with_image(|image| Ok(image.submissions.len()))?
            + self.pending.submissions.len();
        self.pending.submissions.push(submission);
        Ok(index)
    }

    pub fn set_jobscript_metadata(&mut self, update: JobscriptMetadataUpdate) -> Result<()> {
        self.assert_writable()?;
        self.pending.jobscript_metadata.push(update);
        Ok(())
    }

    pub fn mark_jobscript_submitted(&mut self, sub_idx: usize, js_idx: usize) -> Result<()> {
        self.assert_writable()?;
        self.pending.submitted_jobscripts.push((sub_idx, js_idx));
        Ok(())
    }

    pub fn remove_replaced_file_record(&mut self) -> Result<()> {
        self.assert_writable()?;
        self.pending.remove_replaced_file_record = true;
        Ok(())
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Drop all buffered changes without touching the on-disk image.
    pub fn discard_pending(&mut self) {
        self.pending.clear();
    }

    // ------------------------------------------------------------------
    // commit

    /// Flush the pending buffer: compute the next image and install it
    /// atomically. Parameter payloads are written first; the metadata rename
    /// is the commit point, so a crash mid-commit leaves the previous image
    /// served and the pending changes lost.
    pub fn commit_pending(&mut self) -> Result<()> {
        self.assert_writable()?;
        if self.pending.is_empty() {
            return Ok(());
        }

        let mut image = self.load_disk_image()?;

        for (new_index, task) in std::mem::take(&mut self.pending.template_tasks) {
            let at = new_index.min(image.template.tasks.len());
            image.template.tasks.insert(at, task);
        }

        for (new_index, task) in std::mem::take(&mut self.pending.tasks) {
            let at = new_index.min(image.tasks.len());
            image.tasks.insert(at, task);
            image.num_added_tasks += 1;
        }

        for ((task_idx, _), elements) in std::mem::take(&mut self.pending.elements) {
            let task = image
                .tasks
                .get_mut(task_idx)
                .ok_or_else(|| Error::Runtime(format!("No task at index {}", task_idx)))?;
            task.elements.extend(elements);
        }

        for ((task_idx, _, element_idx), iterations) in
            std::mem::take(&mut self.pending.element_iterations)
        {
            let element = image
                .tasks
                .get_mut(task_idx)
                .and_then(|t| t.elements.get_mut(element_idx))
                .ok_or_else(|| {
                    Error::Runtime(format!(
                        "No element {} in task {}",
                        element_idx, task_idx
                    ))
                })?;
            element.iterations.extend(iterations);
        }

        for ((task_idx, _, element_idx, iteration_idx), loop_idx) in
            std::mem::take(&mut self.pending.loop_idx)
        {
            let iteration = image
                .tasks
                .get_mut(task_idx)
                .and_then(|t| t.elements.get_mut(element_idx))
                .and_then(|e| {
                    e.iterations
                        .iter_mut()
                        .find(|i| i.iteration_idx == iteration_idx)
                })
                .ok_or_else(|| {
                    Error::Runtime(format!(
                        "No iteration {} of element {} in task {}",
                        iteration_idx, element_idx, task_idx
                    ))
                })?;
            iteration.loop_idx.extend(loop_idx);
        }

        image.loops.extend(std::mem::take(&mut self.pending.loops));

        let parameter_data = std::mem::take(&mut self.pending.parameter_data);
        for (index, source) in std::mem::take(&mut self.pending.parameter_sources) {
            image.parameter_sources.entry(index).or_insert(source);
            image.num_parameters = image.num_parameters.max(index + 1);
        }
        for index in parameter_data.keys() {
            image.num_parameters = image.num_parameters.max(index + 1);
        }

        for (id, ear) in std::mem::take(&mut self.pending.ears) {
            image.next_ear_id = image.next_ear_id.max(id + 1);
            image.ears.insert(id, ear);
        }
        for (id, update) in std::mem::take(&mut self.pending.ear_updates) {
            let ear = image
                .ears
                .get_mut(&id)
                .ok_or_else(|| Error::Runtime(format!("Unknown EAR id: {}", id)))?;
            apply_ear_update(ear, &update);
        }

        image
            .submissions
            .extend(std::mem::take(&mut self.pending.submissions));
        for update in std::mem::take(&mut self.pending.jobscript_metadata) {
            let js = image
                .submissions
                .get_mut(update.sub_idx)
                .and_then(|s| s.jobscripts.get_mut(update.js_idx))
                .ok_or_else(|| {
                    Error::Runtime(format!(
                        "No jobscript ({}, {})",
                        update.sub_idx, update.js_idx
                    ))
                })?;
            js.apply_metadata(&update);
        }

        for (sub_idx, js_idx) in std::mem::take(&mut self.pending.submitted_jobscripts) {
            let sub = image.submissions.get_mut(sub_idx).ok_or_else(|| {
                Error::Runtime(format!("No submission at index {}", sub_idx))
            })?;
            if !sub.submitted_jobscripts.contains(&js_idx) {
                sub.submitted_jobscripts.push(js_idx);
            }
        }

        if self.pending.remove_replaced_file_record {
            image.replaced_file = None;
        }

        // payloads first; the metadata rename below is the commit point
        for (index, data) in &parameter_data {
            write_parameter_file(&self.path, *index, data.as_ref())?;
        }
        dump_image(&self.path, &image)?;

        self.pending.clear();

        // keep a pinned snapshot coherent with what was just committed
        let mut cell = self.snapshot.borrow_mut();
        if cell.refs > 0 {
            cell.image = Some(image);
        }

        debug!(path = %self.path.display(), "committed pending changes");
        Ok(())
    }

    /// Rename the previously replaced store back into place, discarding the
    /// current one.
    pub fn reinstate_replaced_file(&self) -> Result<()> {
        let image = self.load_disk_image()?;
        if let Some(name) = image.replaced_file {
            let replaced = self
                .path
                .parent()
                .map(|p| p.join(&name))
                .unwrap_or_else(|| PathBuf::from(&name));
            std::fs::remove_dir_all(&self.path).map_err(io_err(&self.path))?;
            std::fs::rename(&replaced, &self.path).map_err(io_err(&replaced))?;
        }
        Ok(())
    }
}

fn apply_ear_update(ear: &mut Ear, update: &EarUpdate) {
    if let Some(status) = update.status {
        ear.status = status;
    }
    if update.exit_code.is_some() {
        ear.exit_code = update.exit_code;
    }
    if update.start_time.is_some() {
        ear.start_time = update.start_time;
    }
    if update.end_time.is_some() {
        ear.end_time = update.end_time;
    }
    if let Some(skip) = update.skip {
        ear.skip = skip;
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> Error + '_ {
    move |e| Error::Runtime(format!("I/O error at {}: {}", path.display(), e))
}

fn load_image(dir: &Path) -> Result<WorkflowImage> {
    let path = dir.join(METADATA_FILE_NAME);
    let bytes = std::fs::read(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::WorkflowNotFound(dir.to_path_buf())
        } else {
            Error::Runtime(format!("Cannot read {}: {}", path.display(), e))
        }
    })?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::Runtime(format!("Corrupt store at {}: {}", path.display(), e)))
}

/// Write the metadata image via a temp file and rename, so a crash leaves
/// either the old or the new image, never a torn one.
fn dump_image(dir: &Path, image: &WorkflowImage) -> Result<()> {
    let target = dir.join(METADATA_FILE_NAME);
    let tmp = dir.join(format!("{}.tmp", METADATA_FILE_NAME));
    let bytes = serde_json::to_vec_pretty(image)
        .map_err(|e| Error::Runtime(format!("Cannot serialise store image: {}", e)))?;
    std::fs::write(&tmp, bytes).map_err(io_err(&tmp))?;
    std::fs::rename(&tmp, &target).map_err(io_err(&target))?;
    Ok(())
}

fn parameter_file_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(PARAMETER_DATA_DIR_NAME).join(index.to_string())
}

fn write_parameter_file(dir: &Path, index: usize, data: Option<&serde_json::Value>) -> Result<()> {
    let target = parameter_file_path(dir, index);
    let tmp = target.with_extension("tmp");
    let value = match data {
        Some(v) => v.clone(),
        None => serde_json::Value::Null,
    };
    let bytes = serde_json::to_vec(&value)
        .map_err(|e| Error::Runtime(format!("Cannot serialise parameter {}: {}", index, e)))?;
    std::fs::write(&tmp, bytes).map_err(io_err(&tmp))?;
    std::fs::rename(&tmp, &target).map_err(io_err(&target))?;
    Ok(())
}

fn read_parameter_file(dir: &Path, index: usize) -> Result<Option<serde_json::Value>> {
    let path = parameter_file_path(dir, index);
    let bytes = match std::fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Runtime(format!("Cannot read {}: {}", path.display(), e))),
    };
    let value: serde_json::Value = serde_json::from_slice(&bytes)
        .map_err(|e| Error::Runtime(format!("Corrupt parameter file {}: {}", path.display(), e)))?;
    Ok(match value {
        serde_json::Value::Null => None,
        other => Some(other),
    })
}

fn image_digest(image: &WorkflowImage) -> Result<String> {
    let bytes = serde_json::to_vec(image)
        .map_err(|e| Error::Runtime(format!("Cannot serialise store image: {}", e)))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

fn rename_existing(path: &Path) -> Result<PathBuf> {
    let suffix: String = rand::thread_rng()
        .sample_iter(rand::distributions::Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| String::from("workflow"));
    let replaced = path.with_file_name(format!("{}.replaced.{}", name, suffix));
    std::fs::rename(path, &replaced).map_err(io_err(path))?;
    Ok(replaced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::resources::ElementResources;

    fn template() -> WorkflowTemplate {
        WorkflowTemplate {
            name: String::from("wk1"),
            tasks: vec![],
        }
    }

    fn new_store(dir: &Path) -> Store {
        Store::write_empty(&dir.join("wk1"), template(), false).unwrap()
    }

    fn pending_ear() -> Ear {
        Ear {
            id: 0,
            task_insert_id: 0,
            element_idx: 0,
            iteration_idx: 0,
            action_idx: 0,
            run_idx: 0,
            resources: ElementResources::default(),
            status: EarStatus::Pending,
            exit_code: None,
            start_time: None,
            end_time: None,
            skip: false,
            data_in: BTreeMap::new(),
            data_out: BTreeMap::new(),
            dependencies: vec![],
        }
    }

    #[test]
    fn test_open_missing_store() {
        let dir = tempfile::tempdir().unwrap();
        let err = Store::open(&dir.path().join("nope"), StoreMode::ReadOnly).unwrap_err();
        assert!(matches!(err, Error::WorkflowNotFound(_)));
    }

    #[test]
    fn test_parameter_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());

        let idx = store
            .add_parameter_data(Some(serde_json::json!(101)), ParameterSource::Local)
            .unwrap();
        assert_eq!(idx, 0);

        // visible through the pending overlay before commit
        assert_eq!(
            store.get_parameter_data(idx).unwrap(),
            Some(serde_json::json!(101))
        );

        store.commit_pending().unwrap();
        assert_eq!(
            store.get_parameter_data(idx).unwrap(),
            Some(serde_json::json!(101))
        );
        assert_eq!(
            store.get_parameter_source(idx).unwrap(),
            ParameterSource::Local
        );
        assert!(matches!(
            store.get_parameter_data(99).unwrap_err(),
            Error::UnknownParameter(99)
        ));
    }

    #[test]
    fn test_set_parameter_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());

        let idx = store
            .add_parameter_data(None, ParameterSource::task_output(0))
            .unwrap();
        store.commit_pending().unwrap();
        assert!(!store.is_parameter_set(idx).unwrap());

        store.set_parameter(idx, serde_json::json!("out")).unwrap();
        store.commit_pending().unwrap();
        assert!(store.is_parameter_set(idx).unwrap());
        assert!(matches!(
            store.set_parameter(idx, serde_json::json!("again")),
            Err(Error::ParameterAlreadySet(_))
        ));
    }

    #[test]
    fn test_ear_ids_monotonic_across_commits() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());

        let ids = store.add_ears(vec![pending_ear(), pending_ear()]).unwrap();
        assert_eq!(ids, vec![0, 1]);
        store.commit_pending().unwrap();

        let ids = store.add_ears(vec![pending_ear()]).unwrap();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn test_ear_transition_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());
        let ids = store.add_ears(vec![pending_ear()]).unwrap();
        store.commit_pending().unwrap();

        let err = store
            .update_ear(ids[0], EarStatus::Running, None, None, None, None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidEarTransition { .. }));

        store
            .update_ear(ids[0], EarStatus::Submitted, None, None, None, None)
            .unwrap();
        store
            .update_ear(ids[0], EarStatus::Running, None, None, None, None)
            .unwrap();
        store.commit_pending().unwrap();
        let ear = store.get_ears_from_ids(&ids).unwrap().remove(0);
        assert_eq!(ear.status, EarStatus::Running);
    }

    #[test]
    fn test_crash_leaves_previous_image() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());
        let idx = store
            .add_parameter_data(Some(serde_json::json!(1)), ParameterSource::Local)
            .unwrap();
        store.commit_pending().unwrap();

        // simulate a writer killed after writing the temp segment but before
        // the rename: the temp file must be invisible to readers
        let wk = dir.path().join("wk1");
        std::fs::write(wk.join("metadata.json.tmp"), b"{ partial garbage").unwrap();

        let reader = Store::open(&wk, StoreMode::ReadOnly).unwrap();
        assert_eq!(
            reader.get_parameter_data(idx).unwrap(),
            Some(serde_json::json!(1))
        );
    }

    #[test]
    fn test_overwrite_renames_existing() {
        let dir = tempfile::tempdir().unwrap();
        let wk = dir.path().join("wk1");
        {
            let _store = Store::write_empty(&wk, template(), false).unwrap();
        }
        let store = Store::write_empty(&wk, template(), true).unwrap();
        let image = store.load_disk_image().unwrap();
        let replaced = image.replaced_file.unwrap();
        assert!(replaced.starts_with("wk1.replaced."));
        assert!(dir.path().join(&replaced).is_dir());
    }

    #[test]
    fn test_cached_load_pins_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());
        store
            .add_parameter_data(Some(serde_json::json!(1)), ParameterSource::Local)
            .unwrap();
        store.commit_pending().unwrap();

        let reader = Store::open(&store.path().to_path_buf(), StoreMode::ReadOnly).unwrap();
        let _guard = reader.cached_load().unwrap();
        assert!(!reader.is_modified_on_disk().unwrap());

        // another writer commits; the pinned reader notices the divergence
        store
            .add_parameter_data(Some(serde_json::json!(2)), ParameterSource::Local)
            .unwrap();
        store.commit_pending().unwrap();
        assert!(reader.is_modified_on_disk().unwrap());
    }

    #[test]
    fn test_iterations_and_loop_idx_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = new_store(dir.path());

        let element = Element {
            element_idx: 0,
            data_index: BTreeMap::new(),
            iterations: vec![crate::model::element::ElementIteration {
                iteration_idx: 0,
                loop_idx: BTreeMap::new(),
                actions: BTreeMap::new(),
            }],
        };
        store
            .add_workflow_task(
                0,
                StoreTask {
                    insert_id: 0,
                    elements: vec![element],
                },
            )
            .unwrap();
        store.commit_pending().unwrap();

        store
            .add_loop_idx(0, 0, 0, 0, [(String::from("my_loop"), 0)].into_iter().collect())
            .unwrap();
        store
            .append_element_iterations(
                0,
                0,
                0,
                vec![crate::model::element::ElementIteration {
                    iteration_idx: 1,
                    loop_idx: [(String::from("my_loop"), 1)].into_iter().collect(),
                    actions: BTreeMap::new(),
                }],
            )
            .unwrap();

        // pending overlay visible before commit
        let elements = store.get_task_elements(0, 0..1).unwrap();
        assert_eq!(elements[0].iterations.len(), 2);
        assert_eq!(elements[0].iterations[0].loop_idx["my_loop"], 0);

        store.commit_pending().unwrap();
        let elements = store.get_task_elements(0, 0..1).unwrap();
        assert_eq!(elements[0].iterations.len(), 2);
        assert_eq!(elements[0].iterations[1].loop_idx["my_loop"], 1);
    }

    #[test]
    fn test_single_writer_lock() {
        let dir = tempfile::tempdir().unwrap();
        let store = new_store(dir.path());
        let err = Store::open(store.path(), StoreMode::ReadWrite);
        assert!(err.is_err());
        let _reader = Store::open(store.path(), StoreMode::ReadOnly).unwrap();
    }
}
