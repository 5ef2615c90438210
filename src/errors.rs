//! Crate-wide error type.
//!
//! Mirrors the four error kinds of the local-ancestry engine's contract:
//! malformed or mutually-incompatible inputs are reported immediately with
//! enough context to print a labeled diagnostic block; internal invariant
//! violations are bugs and propagate with their message intact so `main` can
//! print them alongside a backtrace.

use thiserror::Error;

/// Every fallible operation in this crate returns a `LaiError`.
#[derive(Error, Debug)]
pub enum LaiError {
    /// A file is malformed, a parameter is out of range, or a probability
    /// row does not sum to one within tolerance.
    #[error("input validation error in {file}{field}: {message}")]
    InputValidation {
        file: String,
        field: String,
        message: String,
    },

    /// Reference and target are mutually inconsistent (no shared markers, a
    /// duplicated sample identifier, too many panels, etc).
    #[error("compatibility error: {0}")]
    Compatibility(String),

    /// Reading or writing a file failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// An invariant that should always hold was violated. These indicate a
    /// bug in this crate, not a problem with the user's input.
    #[error("internal error: {0}")]
    Internal(String),
}

impl LaiError {
    pub fn invalid(file: impl Into<String>, message: impl Into<String>) -> Self {
        LaiError::InputValidation {
            file: file.into(),
            field: String::new(),
            message: message.into(),
        }
    }

    pub fn invalid_field(
        file: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        LaiError::InputValidation {
            file: file.into(),
            field: format!(" (field: {})", field.into()),
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        LaiError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        LaiError::Internal(message.into())
    }

    /// Render the section-7 "labeled block": error kind, offending file,
    /// and message, suitable for printing to stderr before the process
    /// exits non-zero.
    pub fn labeled_block(&self) -> String {
        match self {
            LaiError::InputValidation { file, field, message } => format!(
                "== InputValidation ==\nfile: {file}{field}\n{message}"
            ),
            LaiError::Compatibility(message) => format!("== Compatibility ==\n{message}"),
            LaiError::Io { path, source } => {
                format!("== IO ==\nfile: {path}\n{source}")
            }
            LaiError::Internal(message) => format!("== Internal ==\n{message}"),
        }
    }
}

pub type LaiResult<T> = Result<T, LaiError>;
