//! Error types for hangar

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use hangar_archive::ArchiveError;
use hangar_oci::OciError;
use thiserror::Error;

/// Result type alias using hangar Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that end a whole run.  Per-image problems are [`JobError`]s and
/// never surface here.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid flags, environment or combination of both
    #[error("Configuration error: {0}")]
    Config(String),

    /// The image list could not be read
    #[error("cannot read image list {path}: {source}")]
    List {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Registry client construction or other run-wide registry failures
    #[error("Registry error: {0}")]
    Registry(#[from] OciError),

    /// The archive could not be created, opened or finished
    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The overall run timeout elapsed
    #[error("run timed out after {}", humantime::format_duration(*.0))]
    Timeout(Duration),

    /// A blocking or worker task could not be joined
    #[error("Task error: {0}")]
    Task(String),
}

// ---------------------------------------------------------------------------
// Per-job errors
// ---------------------------------------------------------------------------

/// Pipeline stage a job failed in.  Printed into failure reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Parse,
    Manifest,
    Blob,
    Archive,
    Destination,
    Push,
    Validate,
    Timeout,
    Panic,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Parse => "parse",
            Stage::Manifest => "manifest",
            Stage::Blob => "blob",
            Stage::Archive => "archive",
            Stage::Destination => "destination",
            Stage::Push => "push",
            Stage::Validate => "validate",
            Stage::Timeout => "timeout",
            Stage::Panic => "panic",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Underlying cause of a job failure.
#[derive(Error, Debug)]
pub enum JobFailure {
    #[error(transparent)]
    Registry(#[from] OciError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// A failed job: where it failed and why.
#[derive(Error, Debug)]
#[error("[{stage}] {source}")]
pub struct JobError {
    pub stage: Stage,
    #[source]
    pub source: JobFailure,
}

impl JobError {
    pub fn new(stage: Stage, source: impl Into<JobFailure>) -> Self {
        Self {
            stage,
            source: source.into(),
        }
    }

    pub fn other(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(stage, JobFailure::Other(message.into()))
    }
}

/// Tag a fallible step with the stage it belongs to.
pub trait StageExt<T> {
    fn stage(self, stage: Stage) -> std::result::Result<T, JobError>;
}

impl<T, E: Into<JobFailure>> StageExt<T> for std::result::Result<T, E> {
    fn stage(self, stage: Stage) -> std::result::Result<T, JobError> {
        self.map_err(|e| JobError::new(stage, e))
    }
}
