use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::retry::FailureClass;

#[derive(Debug, Error, Diagnostic)]
pub enum GenodexError {
    #[error("invalid group id: {0}")]
    InvalidGroupId(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("could not connect to remote file server: {0}")]
    RemoteConnect(String),

    #[error("remote file server request failed: {0}")]
    RemoteHttp(String),

    #[error("remote file server returned status {status}: {message}")]
    RemoteStatus { status: u16, message: String },

    #[error("no annotation file found for group {group} under {dir}")]
    #[diagnostic(help("check that the group id exists on the remote server"))]
    AnnotationNotFound { group: String, dir: String },

    #[error("annotations for group {group} failed recently, next attempt in {retry_in_secs}s")]
    AnnotationUnavailable { group: String, retry_in_secs: u64 },

    #[error("document store request failed: {0}")]
    IndexHttp(String),

    #[error("document store returned status {status}: {message}")]
    IndexStatus { status: u16, message: String },

    #[error("failed to read input {path}: {message}")]
    InputRead { path: PathBuf, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("entity builder is {current}, cannot {action}")]
    InvalidPhase {
        current: &'static str,
        action: &'static str,
    },
}

impl GenodexError {
    /// Connection-class failures get the longer backoff track.
    pub fn failure_class(&self) -> FailureClass {
        match self {
            GenodexError::RemoteConnect(_) => FailureClass::Connection,
            _ => FailureClass::Other,
        }
    }

    /// Permanent failures are never worth another attempt.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            GenodexError::AnnotationNotFound { .. }
                | GenodexError::AnnotationUnavailable { .. }
                | GenodexError::InvalidGroupId(_)
        )
    }
}
