//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Submission: materialise planned jobscripts into a submission directory
//! and hand them to the scheduler (or the direct executor) in topological
//! order.

pub mod jobscript;
pub mod schedulers;
pub mod shells;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use colored::Colorize;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Configuration;
use crate::error::{Error, Result};
use crate::executor::{self, LaunchSpec};
use crate::model::element::EarStatus;
use crate::plan::deps::ResolvedJobscript;
use crate::store::pending::JobscriptMetadataUpdate;
use crate::store::Store;
use crate::submission::jobscript::{JobscriptRecord, SubmissionRecord};
use crate::submission::schedulers::get_scheduler;
use crate::submission::shells::{get_shell, os_version, JobscriptComposeContext, Shell};

pub const TMP_DIR_NAME: &str = "tmp";
pub const LOG_DIR_NAME: &str = "log";
pub const STD_DIR_NAME: &str = "std";
pub const SCRIPTS_DIR_NAME: &str = "scripts";
pub const ABORT_EARS_FILE_NAME: &str = "abort_EARs.txt";

/// Per block-element state as reported by the scheduler.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobscriptElementState {
    Pending,
    Waiting,
    Running,
    Finished,
    Cancelled,
    Errored,
}

impl JobscriptElementState {
    pub fn symbol(self) -> &'static str {
        match self {
            JobscriptElementState::Pending => "\u{25cb}",
            JobscriptElementState::Waiting => "\u{25ca}",
            JobscriptElementState::Running => "\u{25cf}",
            JobscriptElementState::Finished => "\u{25a0}",
            JobscriptElementState::Cancelled => "C",
            JobscriptElementState::Errored => "E",
        }
    }

    pub fn coloured(self) -> colored::ColoredString {
        match self {
            JobscriptElementState::Pending => self.symbol().yellow(),
            JobscriptElementState::Waiting => self.symbol().bright_black(),
            JobscriptElementState::Running => self.symbol().blue(),
            JobscriptElementState::Finished => self.symbol().bright_black(),
            JobscriptElementState::Cancelled => self.symbol().red(),
            JobscriptElementState::Errored => self.symbol().red(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            JobscriptElementState::Pending => "pending",
            JobscriptElementState::Waiting => "waiting",
            JobscriptElementState::Running => "running",
            JobscriptElementState::Finished => "finished",
            JobscriptElementState::Cancelled => "cancelled",
            JobscriptElementState::Errored => "errored",
        }
    }
}

/// Build the persisted submission record from the planner's output.
pub fn build_submission(sub_idx: usize, resolved: Vec<ResolvedJobscript>) -> SubmissionRecord {
    let jobscripts = resolved
        .into_iter()
        .enumerate()
        .map(|(idx, js)| JobscriptRecord::from_resolved(idx, js))
        .collect();
    SubmissionRecord::new(sub_idx, jobscripts)
}

pub fn submission_path(workflow_path: &Path, sub_idx: usize) -> PathBuf {
    workflow_path
        .join(crate::store::SUBMISSIONS_DIR_NAME)
        .join(sub_idx.to_string())
}

/// Reference handed back by the scheduler (job id) or the executor (pid).
#[derive(Clone, Debug)]
struct SubmittedRef {
    reference: String,
    is_array: bool,
    scheduled: bool,
}

/// What `submit` did: the refs of submitted jobscripts, plus the first
/// failure (which stopped any later submits).
#[derive(Debug)]
pub struct SubmissionOutcome {
    pub submitted: Vec<(usize, String)>,
    pub failure: Option<Error>,
}

/// Submit all outstanding jobscripts of a submission in index order.
///
/// A downstream jobscript is only handed over after the upstream reference
/// has been committed. With `wait`, direct jobscripts are supervised to
/// completion before returning.
pub async fn submit_jobscripts(
    store: &mut Store,
    config: &Configuration,
    sub_idx: usize,
    js_parallelism: Option<bool>,
    wait: bool,
) -> Result<SubmissionOutcome> {
    let submissions = store.get_submissions()?;
    let submission = submissions
        .get(sub_idx)
        .ok_or_else(|| Error::Runtime(format!("No submission at index {}", sub_idx)))?
        .clone();

    let workflow_path = store.path().to_path_buf();
    let sub_path = submission_path(&workflow_path, sub_idx);
    prepare_submission_dir(&sub_path, &submission)?;

    let parallelism = js_parallelism.unwrap_or(false);
    let mut refs: BTreeMap<usize, SubmittedRef> = BTreeMap::new();
    let mut supervisors = Vec::new();
    let mut outcome = SubmissionOutcome {
        submitted: Vec::new(),
        failure: None,
    };

    for js in &submission.jobscripts {
        if submission.submitted_jobscripts.contains(&js.index) {
            continue;
        }
        match submit_one(
            store,
            config,
            &workflow_path,
            &sub_path,
            sub_idx,
            js,
            &refs,
            parallelism,
        )
        .await
        {
            Ok((submitted_ref, supervisor)) => {
                outcome
                    .submitted
                    .push((js.index, submitted_ref.reference.clone()));
                refs.insert(js.index, submitted_ref);
                if let Some(supervisor) = supervisor {
                    supervisors.push(supervisor);
                }
            }
            Err(err) => {
                warn!(js_idx = js.index, "jobscript submission failed: {}", err);
                outcome.failure = Some(err);
                break;
            }
        }
    }

    store.commit_pending()?;

    if wait {
        for supervisor in supervisors {
            match supervisor.await {
                Ok(Ok(run_outcome)) => {
                    debug!(exit_code = run_outcome.exit_code, "jobscript finished")
                }
                Ok(Err(err)) => warn!("jobscript supervision failed: {}", err),
                Err(err) => warn!("jobscript supervisor panicked: {}", err),
            }
        }
    }

    Ok(outcome)
}

fn prepare_submission_dir(sub_path: &Path, submission: &SubmissionRecord) -> Result<()> {
    for dir in [TMP_DIR_NAME, LOG_DIR_NAME, STD_DIR_NAME, SCRIPTS_DIR_NAME] {
        std::fs::create_dir_all(sub_path.join(dir)).map_err(|e| {
            Error::Runtime(format!("Cannot create {}: {}", sub_path.join(dir).display(), e))
        })?;
    }

    // one line per EAR (id order); a '1' means abort requested
    let abort_path = sub_path.join(ABORT_EARS_FILE_NAME);
    if !abort_path.exists() {
        let mut ear_ids: Vec<u64> = submission
            .jobscripts
            .iter()
            .flat_map(|js| js.all_ear_ids())
            .collect();
        ear_ids.sort_unstable();
        let lines = ear_ids.iter().map(|_| "0").collect::<Vec<_>>().join("\n");
        std::fs::write(&abort_path, format!("{}\n", lines))
            .map_err(|e| Error::Runtime(format!("Cannot write {}: {}", abort_path.display(), e)))?;
    }
    Ok(())
}

/// Flag one EAR of a submission for abort via the abort file.
pub fn request_ear_abort(sub_path: &Path, line_idx: usize) -> Result<()> {
    let abort_path = sub_path.join(ABORT_EARS_FILE_NAME);
    let text = std::fs::read_to_string(&abort_path)
        .map_err(|e| Error::Runtime(format!("Cannot read {}: {}", abort_path.display(), e)))?;
    let mut lines: Vec<String> = text.lines().map(String::from).collect();
    if line_idx >= lines.len() {
        return Err(Error::Runtime(format!(
            "No abort entry at line {}",
            line_idx
        )));
    }
    lines[line_idx] = String::from("1");
    std::fs::write(&abort_path, format!("{}\n", lines.join("\n")))
        .map_err(|e| Error::Runtime(format!("Cannot write {}: {}", abort_path.display(), e)))?;
    Ok(())
}

type Supervisor = tokio::task::JoinHandle<Result<executor::RunOutcome>>;

#[allow(clippy::too_many_arguments)]
async fn submit_one(
    store: &mut Store,
    config: &Configuration,
    workflow_path: &Path,
    sub_path: &Path,
    sub_idx: usize,
    js: &JobscriptRecord,
    refs: &BTreeMap<usize, SubmittedRef>,
    parallelism: bool,
) -> Result<(SubmittedRef, Option<Supervisor>)> {
    let shell = get_shell(js.shell_name(), js.os_name())?;
    let scheduler = get_scheduler(js.scheduler_name())?;

    // upstream references: an array dependency is only submitted as such if
    // both ends are array jobs
    let mut deps: Vec<(String, bool)> = Vec::new();
    let mut wait_pids: Vec<u32> = Vec::new();
    for (dep_js_idx, dep_is_array) in js.external_dependencies() {
        let dep_ref = refs.get(&dep_js_idx).ok_or_else(|| {
            Error::Runtime(format!(
                "Dependency jobscript {} was not submitted",
                dep_js_idx
            ))
        })?;
        if dep_ref.scheduled {
            let as_array = dep_is_array && js.is_array && dep_ref.is_array;
            deps.push((dep_ref.reference.clone(), as_array));
        } else if let Ok(pid) = dep_ref.reference.parse::<u32>() {
            wait_pids.push(pid);
        }
    }
    if !parallelism && js.index > 0 {
        // serialise against everything already submitted
        for (prev_idx, prev_ref) in refs {
            if js.external_dependencies().contains_key(prev_idx) {
                continue;
            }
            if prev_ref.scheduled {
                deps.push((prev_ref.reference.clone(), false));
            } else if let Ok(pid) = prev_ref.reference.parse::<u32>() {
                wait_pids.push(pid);
            }
        }
    }

    // materialise the jobscript files
    let ear_id_path = sub_path.join(js.ear_id_file_name());
    let mut ear_id_text = String::new();
    for block in &js.blocks {
        ear_id_text.push_str(&block.format_ear_id_lines());
    }
    write_text(&ear_id_path, &ear_id_text)?;

    let directives = scheduler.format_directives(
        &js.resources,
        js.blocks.first().map(|b| b.num_elements()).unwrap_or(0),
        js.is_array,
    );
    let ctx = JobscriptComposeContext {
        sub_idx,
        js_idx: js.index,
        blocks: &js.blocks,
        is_array: js.is_array,
        is_scheduled: js.is_scheduled(),
        scheduler_directives: directives,
        scheduler_shebang_args: scheduler.shebang_args(),
        array_item_var: scheduler.array_item_var(),
        ear_id_file_name: js.ear_id_file_name(),
        functions_file_name: js.functions_file_name(shell.js_ext()),
        direct_wait_pids: wait_pids,
    };
    let js_path = sub_path.join(js.jobscript_file_name(shell.js_ext()));
    write_text(&js_path, &shell.compose_jobscript(&ctx))?;
    make_executable(&js_path)?;
    let funcs_path = sub_path.join(js.functions_file_name(shell.js_ext()));
    write_text(
        &funcs_path,
        &shell.compose_functions_file(
            js.resources
                .environment_setup
                .as_deref()
                .or(config.environment_setup().as_deref()),
            config.app_invocation(),
        ),
    )?;

    // all pending runs of this jobscript become submitted
    for ear_id in js.all_ear_ids() {
        let ear = store.get_ears_from_ids(&[ear_id])?.remove(0);
        if ear.status == EarStatus::Pending {
            store.update_ear(ear_id, EarStatus::Submitted, None, None, None, None)?;
        }
    }

    let version_info = get_version_info(
        shell.as_ref(),
        &scheduler.version_command(),
        false,
        config.linux_release_file(),
    )
    .await;
    let mut metadata = JobscriptMetadataUpdate {
        sub_idx,
        js_idx: js.index,
        submit_hostname: Some(hostname_string()),
        submit_machine: Some(config.machine().clone()),
        version_info: Some(version_info),
        os_name: Some(js.os_name().to_string()),
        shell_name: Some(js.shell_name().to_string()),
        scheduler_name: Some(js.scheduler_name().to_string()),
        ..Default::default()
    };

    if js.is_scheduled() {
        let prepared_path = shell.prepare_js_path(&js_path);
        let submit_cmd = scheduler.get_submit_command(Path::new(&prepared_path), &deps);
        info!(js_idx = js.index, cmd = ?submit_cmd, "submitting jobscript");
        metadata.submit_cmdline = Some(submit_cmd.clone());

        let failure = |message: &str,
                       stdout: Option<String>,
                       stderr: Option<String>,
                       subprocess_err: Option<std::io::Error>,
                       parse_err: Option<anyhow::Error>| {
            Error::JobscriptSubmissionFailure {
                message: message.to_string(),
                js_idx: js.index,
                js_path: js_path.clone(),
                submit_cmd: submit_cmd.clone(),
                stdout,
                stderr,
                subprocess_err,
                job_id_parse_err: parse_err,
            }
        };

        let output = tokio::process::Command::new(&submit_cmd[0])
            .args(&submit_cmd[1..])
            .current_dir(workflow_path)
            .output()
            .await
            .map_err(|e| failure("Failed to execute submit command", None, None, Some(e), None))?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !stderr.is_empty() {
            return Err(failure(
                "Non-empty stderr from submit command",
                Some(stdout),
                Some(stderr),
                None,
                None,
            ));
        }

        let job_id = scheduler
            .parse_submission_output(&stdout, &stderr)
            .map_err(|e| {
                failure(
                    "Failed to parse job ID from stdout",
                    Some(stdout.clone()),
                    Some(stderr.clone()),
                    None,
                    Some(anyhow::Error::new(e)),
                )
            })?;

        metadata.scheduler_job_id = Some(job_id.clone());
        metadata.submit_time = Some(Utc::now());
        store.set_jobscript_metadata(metadata)?;
        store.mark_jobscript_submitted(sub_idx, js.index)?;
        store.commit_pending()?;

        Ok((
            SubmittedRef {
                reference: job_id,
                is_array: js.is_array,
                scheduled: true,
            },
            None,
        ))
    } else {
        // direct execution through the supervised executor
        let argv: Vec<String> = if cfg!(windows) {
            let mut argv = shell.executable();
            argv.push(js_path.display().to_string());
            argv
        } else {
            vec![js_path.display().to_string()]
        };
        metadata.submit_cmdline = Some(argv.clone());

        let combine = js.resources.combine_jobscript_std == Some(true);
        let stdout_path = if combine {
            sub_path.join(js.direct_std_out_err_file_name())
        } else {
            sub_path.join(js.direct_stdout_file_name())
        };
        let spec = LaunchSpec {
            argv,
            cwd: workflow_path.to_path_buf(),
            stdout_path,
            stderr_path: sub_path.join(js.direct_stderr_file_name()),
            combine_std: combine,
            env: vec![(
                String::from("GANTRY_STD_STREAM_FILE"),
                sub_path
                    .join(STD_DIR_NAME)
                    .join(js.direct_std_out_err_file_name())
                    .display()
                    .to_string(),
            )],
        };
        let run = executor::launch(&spec).await?;
        let pid = run.pid;

        metadata.process_id = Some(pid);
        metadata.submit_time = Some(Utc::now());
        store.set_jobscript_metadata(metadata)?;
        store.mark_jobscript_submitted(sub_idx, js.index)?;
        // a downstream direct jobscript waits on this pid, so it must be
        // committed before the next submit begins
        store.commit_pending()?;

        let supervisor = tokio::spawn(run.supervise());
        Ok((
            SubmittedRef {
                reference: pid.to_string(),
                is_array: false,
                scheduled: false,
            },
            Some(supervisor),
        ))
    }
}

/// Shell, scheduler and (unless excluded) OS version information, captured
/// at submit time and recorded in the jobscript metadata.
pub async fn get_version_info(
    shell: &dyn Shell,
    scheduler_version_cmd: &[String],
    exclude_os: bool,
    linux_release_file: &str,
) -> BTreeMap<String, String> {
    let mut out = if exclude_os {
        BTreeMap::new()
    } else {
        os_version::get_os_info(linux_release_file)
    };

    if let Some(stdout) = run_capture(&shell.version_command()).await {
        match shell.parse_version_info(&stdout) {
            Ok(info) => out.extend(info),
            Err(e) => debug!("cannot parse shell version: {}", e),
        }
    }
    if !scheduler_version_cmd.is_empty() {
        if let Some(stdout) = run_capture(scheduler_version_cmd).await {
            out.insert(String::from("scheduler_version_output"), stdout);
        }
    }
    out
}

async fn run_capture(argv: &[String]) -> Option<String> {
    if argv.is_empty() {
        return None;
    }
    let output = tokio::process::Command::new(&argv[0])
        .args(&argv[1..])
        .output()
        .await
        .ok()?;
    Some(String::from_utf8_lossy(&output.stdout).to_string())
}

fn hostname_string() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| String::from("unknown"))
}

fn write_text(path: &Path, text: &str) -> Result<()> {
    std::fs::write(path, text.as_bytes())
        .map_err(|e| Error::Runtime(format!("Cannot write {}: {}", path.display(), e)))
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)
        .map_err(|e| Error::Runtime(format!("Cannot stat {}: {}", path.display(), e)))?
        .permissions();
    perms.set_mode(perms.mode() | 0o755);
    std::fs::set_permissions(path, perms)
        .map_err(|e| Error::Runtime(format!("Cannot chmod {}: {}", path.display(), e)))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submission_path_layout() {
        let p = submission_path(Path::new("/wk"), 2);
        assert_eq!(p, PathBuf::from("/wk/submissions/2"));
    }

    #[test]
    fn test_element_state_names() {
        assert_eq!(JobscriptElementState::Cancelled.name(), "cancelled");
        assert_eq!(JobscriptElementState::Running.symbol(), "\u{25cf}");
    }
}
