//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use std::path::PathBuf;

/// Errors raised by the workflow core.
///
/// Static and planning errors abort an operation before any on-disk mutation.
/// Submission errors are caught per jobscript by the owning submission.
/// Execution errors (non-zero exit codes) are never surfaced through this
/// type; they are recorded as EAR state.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("No workflow found at path: {0}")]
    WorkflowNotFound(PathBuf),

    #[error("Duplicate executable: {0}")]
    DuplicateExecutable(String),

    #[error("Invalid input source task reference: {0}")]
    InvalidInputSourceTaskReference(String),

    #[error("The following inputs have no sources: {}", .0.join(", "))]
    MissingInputs(Vec<String>),

    #[error(
        "Cannot query the jobscript because the current machine ({current}) is not the \
         machine on which it was submitted ({submit})"
    )]
    NotSubmitMachine { current: String, submit: String },

    #[error("Failed to submit jobscript {js_idx}: {message}")]
    JobscriptSubmissionFailure {
        message: String,
        js_idx: usize,
        js_path: PathBuf,
        submit_cmd: Vec<String>,
        stdout: Option<String>,
        stderr: Option<String>,
        #[source]
        subprocess_err: Option<std::io::Error>,
        job_id_parse_err: Option<anyhow::Error>,
    },

    #[error("Unsupported shell {shell:?} for OS {os:?}")]
    UnsupportedShell { shell: String, os: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parameter at index {0} is already set")]
    ParameterAlreadySet(usize),

    #[error("Unknown parameter data index: {0}")]
    UnknownParameter(usize),

    #[error(
        "All sequences with the same nesting order must have the same multiplicity, but \
         found multiplicities {multiplicities:?} for nesting order {nesting_order}"
    )]
    SequenceMultiplicityMismatch {
        nesting_order: i64,
        multiplicities: Vec<usize>,
    },

    #[error("Invalid EAR state transition for run {ear_id}: {from} -> {to}")]
    InvalidEarTransition {
        ear_id: u64,
        from: String,
        to: String,
    },

    #[error("`use_job_array` not supported by scheduler: {0:?}")]
    JobArrayUnsupported(String),

    #[error("Workflow path already exists: {0}")]
    WorkflowExists(PathBuf),

    #[error("{0}")]
    Runtime(String),
}

impl Error {
    /// Short kind tag printed (coloured) at the CLI boundary.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::WorkflowNotFound(_) => "WorkflowNotFound",
            Error::DuplicateExecutable(_) => "DuplicateExecutable",
            Error::InvalidInputSourceTaskReference(_) => "InvalidInputSourceTaskReference",
            Error::MissingInputs(_) => "MissingInputs",
            Error::NotSubmitMachine { .. } => "NotSubmitMachine",
            Error::JobscriptSubmissionFailure { .. } => "JobscriptSubmissionFailure",
            Error::UnsupportedShell { .. } => "UnsupportedShell",
            Error::Config(_) => "ConfigError",
            Error::ParameterAlreadySet(_) => "ParameterAlreadySet",
            Error::UnknownParameter(_) => "UnknownParameter",
            Error::SequenceMultiplicityMismatch { .. } => "ValueError",
            Error::InvalidEarTransition { .. } => "InvalidEarTransition",
            Error::JobArrayUnsupported(_) => "ValueError",
            Error::WorkflowExists(_) => "ValueError",
            Error::Runtime(_) => "RuntimeError",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
