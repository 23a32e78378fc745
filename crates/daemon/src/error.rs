use engine::MediaStatus;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("a scan is already running")]
    AlreadyRunning,

    #[error("cannot read input directory {0}: {1}")]
    RootUnreadable(PathBuf, #[source] std::io::Error),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Errors from the filename-addressed queue operations. Each variant maps to a
/// stable kind string that automation can branch on.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("filename is missing or invalid")]
    InvalidFilename,

    #[error("no record for {0}")]
    NotFound(String),

    #[error("{0} is already {1}")]
    Conflict(String, MediaStatus),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl QueueError {
    pub fn kind(&self) -> &'static str {
        match self {
            QueueError::InvalidFilename => "invalid_filename",
            QueueError::NotFound(_) => "not_found",
            QueueError::Conflict(..) => "conflict",
            QueueError::Store(_) => "internal",
        }
    }
}

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("cancelled")]
    Cancelled,

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("{0}")]
    ToolFailed(String),

    #[error("tool reported success but {0} is missing or empty")]
    EmptyOutput(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
