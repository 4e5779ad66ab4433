//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! Direct-execution supervisor: launches a jobscript as a detached child,
//! owns its control endpoint, and reaps the (normalised) exit code.

pub mod control;

use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::element::ABORT_EXIT_CODE;

pub use control::{send_control, ControlEndpoint, ControlMessage};

/// Environment variable under which the control port is published to the
/// child.
pub const RUN_PORT_VAR: &str = "GANTRY_RUN_PORT_NUMBER";

/// How one jobscript child is launched.
#[derive(Clone, Debug)]
pub struct LaunchSpec {
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    /// Merge stderr into the stdout file.
    pub combine_std: bool,
    pub env: Vec<(String, String)>,
}

/// Outcome of one supervised run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RunOutcome {
    pub exit_code: i32,
    pub aborted: bool,
}

/// A launched, supervised jobscript child.
pub struct SupervisedRun {
    pub pid: u32,
    child: tokio::process::Child,
    endpoint: ControlEndpoint,
}

/// Launch the child as a detached process (new session on posix so signals
/// to the parent do not propagate) with the control port in its environment.
pub async fn launch(spec: &LaunchSpec) -> Result<SupervisedRun> {
    let endpoint = ControlEndpoint::bind().await?;

    let stdout = std::fs::File::create(&spec.stdout_path)
        .map_err(|e| Error::Runtime(format!("Cannot create {}: {}", spec.stdout_path.display(), e)))?;
    let stderr: Stdio = if spec.combine_std {
        stdout
            .try_clone()
            .map_err(|e| Error::Runtime(format!("Cannot duplicate stdout handle: {}", e)))?
            .into()
    } else {
        std::fs::File::create(&spec.stderr_path)
            .map_err(|e| {
                Error::Runtime(format!("Cannot create {}: {}", spec.stderr_path.display(), e))
            })?
            .into()
    };

    let (program, args) = spec
        .argv
        .split_first()
        .ok_or_else(|| Error::Runtime(String::from("Empty launch command")))?;

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(&spec.cwd)
        .stdout(Stdio::from(stdout))
        .stderr(stderr)
        .env(RUN_PORT_VAR, endpoint.port().to_string());
    for (key, value) in &spec.env {
        command.env(key, value);
    }
    #[cfg(unix)]
    command.process_group(0);

    let child = command
        .spawn()
        .map_err(|e| Error::Runtime(format!("Cannot spawn {}: {}", program, e)))?;
    let pid = child
        .id()
        .ok_or_else(|| Error::Runtime(String::from("Child exited before pid was read")))?;
    info!(pid, program = %program, "launched jobscript child");

    Ok(SupervisedRun {
        pid,
        child,
        endpoint,
    })
}

impl SupervisedRun {
    pub fn control_port(&self) -> u16 {
        self.endpoint.port()
    }

    /// Await either child exit or a control message; an `abort` (or
    /// `shutdown`) kills the child's process tree and yields
    /// `ABORT_EXIT_CODE`. The endpoint closes on every exit path.
    pub async fn supervise(mut self) -> Result<RunOutcome> {
        tokio::select! {
            status = self.child.wait() => {
                let status = status
                    .map_err(|e| Error::Runtime(format!("Waiting on child failed: {}", e)))?;
                let exit_code = normalise_exit_code(&status);
                debug!(pid = self.pid, exit_code, "jobscript child exited");
                Ok(RunOutcome { exit_code, aborted: false })
            }
            message = self.endpoint.recv() => {
                debug!(pid = self.pid, ?message, "control message; terminating child");
                kill_process_tree(&mut self.child, self.pid).await;
                Ok(RunOutcome { exit_code: ABORT_EXIT_CODE, aborted: true })
            }
        }
    }
}

/// Terminate the child and everything in its process group.
async fn kill_process_tree(child: &mut tokio::process::Child, pid: u32) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        // the child was spawned as its own process group leader
        let pgid = Pid::from_raw(pid as i32);
        let _ = killpg(pgid, Signal::SIGTERM);
        let grace = tokio::time::timeout(std::time::Duration::from_secs(2), child.wait()).await;
        if grace.is_err() {
            let _ = killpg(pgid, Signal::SIGKILL);
            let _ = child.wait().await;
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        let _ = child.kill().await;
        let _ = child.wait().await;
    }
}

/// Normalise a child's exit status to a signed 32-bit code.
///
/// Windows reports unsigned 32-bit codes; reinterpret so e.g. 0xFFFFFFFF is
/// recovered as -1. On posix a signal death maps to 128 + signal number.
pub fn normalise_exit_code(status: &std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return reinterpret_exit_code(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[cfg(windows)]
fn reinterpret_exit_code(code: i32) -> i32 {
    // the OS hands us the raw unsigned value through a lossless i32 cast
    // already; keep the bit pattern
    code as u32 as i32
}

#[cfg(not(windows))]
fn reinterpret_exit_code(code: i32) -> i32 {
    code
}

/// The u32 -> i32 reinterpretation applied to raw Windows exit codes.
pub fn reinterpret_raw_exit_code(raw: u32) -> i32 {
    raw as i32
}
