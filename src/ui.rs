//! Utility functions for the UI

use colored::Colorize;

use crate::error::Error;

/// Print an error at the CLI boundary: the kind coloured red, then the
/// message.
pub fn print_error(err: &Error) {
    eprintln!("{}: {}", err.kind().red(), err);
}

/// Process exit code for a failed operation.
pub fn error_exit_code(_err: &Error) -> i32 {
    1
}
