//! Per-job failure collection and the end-of-run report.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{info, warn};

use crate::error::{JobError, Stage};

/// One failed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub job: String,
    pub stage: Stage,
    pub error: String,
}

impl FailureRecord {
    /// The report line: the job first, everything else as a comment, so a
    /// report can be used as an input list to retry the failures.
    pub fn report_line(&self) -> String {
        let error = self
            .error
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        format!("{} # [{}] {}", self.job, self.stage, error)
    }
}

/// Append-only, shareable sink for [`FailureRecord`]s.  Records keep
/// completion order.
#[derive(Debug, Default)]
pub struct FailureTracker {
    records: Mutex<Vec<FailureRecord>>,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, job: impl Into<String>, stage: Stage, error: impl Into<String>) {
        let record = FailureRecord {
            job: job.into(),
            stage,
            error: error.into(),
        };
        warn!(job = %record.job, stage = %record.stage, error = %record.error, "job failed");
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }

    pub fn record_error(&self, job: impl Into<String>, err: &JobError) {
        self.record(job, err.stage, err.source.to_string());
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the records so far.
    pub fn records(&self) -> Vec<FailureRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Write the report to `path` if anything failed.  A clean run removes
    /// a report left by an earlier run so the file's presence always means
    /// this run had failures.
    pub fn write_report(&self, path: &Path) -> io::Result<Option<PathBuf>> {
        let records = self.records();
        if records.is_empty() {
            match fs::remove_file(path) {
                Ok(()) => info!(path = %path.display(), "removed stale failure report"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            return Ok(None);
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut body = String::new();
        for record in &records {
            body.push_str(&record.report_line());
            body.push('\n');
        }
        fs::write(path, body)?;
        warn!(
            path = %path.display(),
            failures = records.len(),
            "failure report written"
        );
        Ok(Some(path.to_path_buf()))
    }
}

/// Outcome of a run that was not fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Set iff `failed > 0`.
    pub report: Option<PathBuf>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}
