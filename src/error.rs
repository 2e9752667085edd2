use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum QmError {
    #[error("Malformed job file {}: missing or invalid '{key}'", path.display())]
    MalformedJobFile { path: PathBuf, key: String },

    #[error("No queue configured for job type '{0}'")]
    UnknownQueueType(String),

    #[error("Spool layout error at {}: {source}", path.display())]
    SpoolLayout {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Job {uid} could not be submitted: {reason}")]
    EngineSubmission { uid: String, reason: String },

    #[error("Job {uid} did not terminate within {waited:?}")]
    ExecutionTimeout { uid: String, waited: Duration },

    #[error("Job {0} has already been claimed")]
    DuplicateJob(String),

    #[error("Engine configuration {}: {reason}", path.display())]
    EngineConfig { path: PathBuf, reason: String },

    #[error("Unknown engine resource: {0}")]
    UnknownResource(String),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QmError {
    pub(crate) fn malformed(path: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        QmError::MalformedJobFile {
            path: path.into(),
            key: key.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, QmError>;
