//! Read-only verification of archives and mirrored registries.
//!
//! Validation never writes to what it inspects.  A stream archive is
//! extracted into the run's cache directory; a directory archive is read in
//! place.  Every image yields one [`ValidationResult`]; results with
//! violations are also recorded as failures in the mode's report.

use std::collections::HashSet;
use std::fs::File;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hangar_archive::{ArchiveError, ImageRecord, OpenedArchive};
use hangar_oci::{digest, ImageRef, Manifest, OciError, PlatformFilter, Registry};
use tracing::{debug, info};

use crate::engine::{resolve_image, Engine, Rebase};
use crate::error::{Error, JobError, Result, Stage, StageExt};
use crate::failure::{FailureTracker, RunSummary};
use crate::list::{ImageJob, ImageList};
use crate::scheduler::JobPipeline;

/// One integrity problem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, thiserror::Error)]
pub enum Violation {
    #[error("missing blob {digest}")]
    MissingBlob { digest: String },

    #[error("blob {digest} hashes to {actual}")]
    DigestMismatch { digest: String, actual: String },

    #[error("archive part {part} is missing")]
    MissingPart { part: u32 },

    #[error("incomplete archive: {reason}")]
    IncompleteArchive { reason: String },

    #[error("malformed manifest {entry}: {reason}")]
    MalformedManifest { entry: String, reason: String },

    #[error("image {image} is missing")]
    MissingImage { image: String },

    #[error("{image} has digest {actual}, expected {expected}")]
    DestinationMismatch {
        image: String,
        expected: String,
        actual: String,
    },
}

impl Violation {
    fn from_archive(problem: &ArchiveError) -> Self {
        match problem {
            ArchiveError::MissingPart { part, .. } => Violation::MissingPart { part: *part },
            ArchiveError::DigestMismatch {
                expected, actual, ..
            } => Violation::DigestMismatch {
                digest: expected.clone(),
                actual: actual.clone(),
            },
            ArchiveError::MalformedEntry { entry, reason } => Violation::MalformedManifest {
                entry: entry.clone(),
                reason: reason.clone(),
            },
            other => Violation::IncompleteArchive {
                reason: other.to_string(),
            },
        }
    }
}

/// Findings for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub job: String,
    pub violations: Vec<Violation>,
}

impl ValidationResult {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    fn into_failure(self) -> std::result::Result<(), JobError> {
        if self.is_clean() {
            return Ok(());
        }
        let message = self
            .violations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Err(JobError::other(Stage::Validate, message))
    }
}

/// A validation run: the usual summary plus every result, sorted by job.
#[derive(Debug, Clone)]
pub struct ValidationRun {
    pub summary: RunSummary,
    pub results: Vec<ValidationResult>,
}

impl ValidationRun {
    pub fn violations(&self) -> usize {
        self.results.iter().map(|r| r.violations.len()).sum()
    }
}

type Results = Arc<Mutex<Vec<ValidationResult>>>;

fn push_result(results: &Results, result: ValidationResult) -> std::result::Result<(), JobError> {
    results
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(result.clone());
    result.into_failure()
}

fn sorted(results: &Results) -> Vec<ValidationResult> {
    let mut all = results.lock().unwrap_or_else(|e| e.into_inner()).clone();
    all.sort_by(|a, b| a.job.cmp(&b.job));
    all
}

// ---------------------------------------------------------------------------
// Archive checks
// ---------------------------------------------------------------------------

/// Check that `digest` is present and hashes to its name.
fn check_entry(archive: &OpenedArchive, digest: &str) -> Option<Violation> {
    let path = archive.blob_path(digest);
    let file = match File::open(&path) {
        Ok(f) => f,
        Err(_) => {
            return Some(Violation::MissingBlob {
                digest: digest.to_string(),
            })
        }
    };
    match digest::sha256_reader(file) {
        Ok((actual, _)) if actual == digest => None,
        Ok((actual, _)) => Some(Violation::DigestMismatch {
            digest: digest.to_string(),
            actual,
        }),
        Err(e) => Some(Violation::IncompleteArchive {
            reason: format!("cannot read {}: {}", path.display(), e),
        }),
    }
}

/// Verify a manifest entry and parse it.
fn check_manifest(
    archive: &OpenedArchive,
    digest: &str,
    media_type: &str,
    violations: &mut Vec<Violation>,
) -> Option<Manifest> {
    if let Some(v) = check_entry(archive, digest) {
        violations.push(v);
        return None;
    }
    let raw = match std::fs::read(archive.blob_path(digest)) {
        Ok(raw) => raw,
        Err(e) => {
            violations.push(Violation::IncompleteArchive {
                reason: e.to_string(),
            });
            return None;
        }
    };
    match Manifest::from_bytes(raw, Some(media_type)) {
        Ok(m) => Some(m),
        Err(e) => {
            violations.push(Violation::MalformedManifest {
                entry: digest.to_string(),
                reason: e.to_string(),
            });
            None
        }
    }
}

/// Every check one archived image needs.
fn check_record(archive: &OpenedArchive, record: &ImageRecord) -> Vec<Violation> {
    let mut violations = Vec::new();
    let Some(top) = check_manifest(
        archive,
        &record.manifest_digest,
        &record.media_type,
        &mut violations,
    ) else {
        return violations;
    };

    let mut manifests = vec![top.clone()];
    for child in top.children() {
        if let Some(m) = check_manifest(archive, &child.digest, &child.media_type, &mut violations) {
            manifests.push(m);
        }
    }

    let mut seen = HashSet::new();
    for desc in manifests.iter().flat_map(|m| m.blobs().iter()) {
        if !seen.insert(desc.digest.clone()) {
            continue;
        }
        if let Some(v) = check_entry(archive, &desc.digest) {
            violations.push(v);
        }
    }
    violations
}

struct ArchiveCheck {
    archive: Arc<OpenedArchive>,
    dest: Option<Arc<dyn Registry>>,
    rebase: Rebase,
    results: Results,
}

#[async_trait]
impl JobPipeline for ArchiveCheck {
    type Job = ImageRecord;

    fn describe(&self, record: &ImageRecord) -> String {
        record.job.clone()
    }

    async fn process(&self, record: ImageRecord) -> std::result::Result<(), JobError> {
        let archive = self.archive.clone();
        let checked = record.clone();
        let mut violations = tokio::task::spawn_blocking(move || check_record(&archive, &checked))
            .await
            .map_err(|e| JobError::other(Stage::Validate, e.to_string()))?;

        if let Some(dest) = &self.dest {
            let source = ImageRef::parse(&record.source).stage(Stage::Parse)?;
            let target = self.rebase.destination(&source, None);
            match dest.pull_manifest(&target).await {
                Ok(m) if m.digest == record.manifest_digest => {}
                Ok(m) => violations.push(Violation::DestinationMismatch {
                    image: target.to_string(),
                    expected: record.manifest_digest.clone(),
                    actual: m.digest,
                }),
                Err(OciError::NotFound(_)) => violations.push(Violation::MissingImage {
                    image: target.to_string(),
                }),
                Err(e) => return Err(JobError::new(Stage::Destination, e)),
            }
        }

        debug!(image = %record.source, violations = violations.len(), "archive image checked");
        push_result(
            &self.results,
            ValidationResult {
                job: record.job,
                violations,
            },
        )
    }
}

// ---------------------------------------------------------------------------
// Mirror checks
// ---------------------------------------------------------------------------

struct MirrorCheck {
    source: Arc<dyn Registry>,
    dest: Arc<dyn Registry>,
    rebase: Rebase,
    platforms: PlatformFilter,
    results: Results,
}

#[async_trait]
impl JobPipeline for MirrorCheck {
    type Job = ImageJob;

    fn describe(&self, job: &ImageJob) -> String {
        job.text.clone()
    }

    async fn process(&self, job: ImageJob) -> std::result::Result<(), JobError> {
        let source = self.rebase.source(&job);
        let target = self.rebase.destination(&source, job.destination.as_ref());
        // Images mirror skipped for want of a platform have nothing to check.
        let Some(resolved) = resolve_image(self.source.as_ref(), &source, &self.platforms).await?
        else {
            return Ok(());
        };
        let mut violations = Vec::new();

        match self.dest.pull_manifest(&target).await {
            Ok(m) if m.digest == resolved.top.digest => {}
            Ok(m) => violations.push(Violation::DestinationMismatch {
                image: target.to_string(),
                expected: resolved.top.digest.clone(),
                actual: m.digest,
            }),
            Err(OciError::NotFound(_)) => violations.push(Violation::MissingImage {
                image: target.to_string(),
            }),
            Err(e) => return Err(JobError::new(Stage::Destination, e)),
        }

        for child in &resolved.children {
            let child_ref = target.with_reference(&child.digest);
            match self.dest.pull_manifest(&child_ref).await {
                Ok(_) => {}
                Err(OciError::NotFound(_)) => violations.push(Violation::MissingImage {
                    image: child_ref.to_string(),
                }),
                Err(e) => return Err(JobError::new(Stage::Destination, e)),
            }
        }

        for desc in resolved.blobs() {
            let present = self
                .dest
                .blob_exists(&target, &desc.digest)
                .await
                .stage(Stage::Destination)?;
            if !present {
                violations.push(Violation::MissingBlob {
                    digest: desc.digest.clone(),
                });
            }
        }

        debug!(image = %target, violations = violations.len(), "mirrored image checked");
        push_result(
            &self.results,
            ValidationResult {
                job: job.text,
                violations,
            },
        )
    }
}

// ---------------------------------------------------------------------------
// Engine entry points
// ---------------------------------------------------------------------------

impl Engine {
    /// Verify the configured archive.  When a destination registry is
    /// configured, also check that each image arrived there intact.
    pub async fn load_validate(&self) -> Result<ValidationRun> {
        self.bounded(self.load_validate_inner()).await
    }

    async fn load_validate_inner(&self) -> Result<ValidationRun> {
        let failures = Arc::new(FailureTracker::new());
        let results: Results = Arc::new(Mutex::new(Vec::new()));
        let label = self.config.archive.display().to_string();
        let (opened, _extracted) = match self.open_archive().await {
            Ok(opened) => opened,
            Err(Error::Archive(e @ ArchiveError::MissingPart { .. })) => {
                let result = ValidationResult {
                    job: label.clone(),
                    violations: vec![Violation::from_archive(&e)],
                };
                if let Err(err) = push_result(&results, result) {
                    failures.record_error(label, &err);
                }
                let summary = self.conclude(0, &failures)?;
                return Ok(ValidationRun {
                    summary,
                    results: sorted(&results),
                });
            }
            Err(e) => return Err(e),
        };

        // Damage that is not tied to one image is reported against the
        // archive itself.
        let mut archive_violations: Vec<Violation> =
            opened.problems.iter().map(Violation::from_archive).collect();
        if let Some(trailer) = &opened.trailer {
            let recorded: HashSet<&str> = opened.records.iter().map(|r| r.source.as_str()).collect();
            for image in &trailer.images {
                if !recorded.contains(image.as_str()) {
                    archive_violations.push(Violation::MissingImage {
                        image: image.clone(),
                    });
                }
            }
        }
        if !archive_violations.is_empty() {
            let result = ValidationResult {
                job: label.clone(),
                violations: archive_violations,
            };
            if let Err(err) = push_result(&results, result) {
                failures.record_error(label.clone(), &err);
            }
        }

        let records = opened.records.clone();
        let dest = self
            .config
            .dest
            .is_configured()
            .then(|| self.dest.clone());
        let pipeline = Arc::new(ArchiveCheck {
            archive: Arc::new(opened),
            dest,
            rebase: self.rebase(),
            results: results.clone(),
        });
        let outcome = self
            .scheduler()
            .run(pipeline, records, failures.clone())
            .await?;

        let results = sorted(&results);
        info!(
            archive = %label,
            images = results.len(),
            violations = results.iter().map(|r| r.violations.len()).sum::<usize>(),
            "archive validated"
        );
        Ok(ValidationRun {
            summary: self.conclude(outcome.succeeded, &failures)?,
            results,
        })
    }

    /// Verify that every image in `list` is present and identical at the
    /// destination.  Only reads from both registries.
    pub async fn mirror_validate(&self, list: &ImageList) -> Result<ValidationRun> {
        self.bounded(self.mirror_validate_inner(list)).await
    }

    async fn mirror_validate_inner(&self, list: &ImageList) -> Result<ValidationRun> {
        let failures = Arc::new(FailureTracker::new());
        let results: Results = Arc::new(Mutex::new(Vec::new()));
        let jobs = self.parse_list(list, &failures);

        let pipeline = Arc::new(MirrorCheck {
            source: self.source.clone(),
            dest: self.dest.clone(),
            rebase: self.rebase(),
            platforms: self.config.platforms.clone(),
            results: results.clone(),
        });
        let outcome = self
            .scheduler()
            .run(pipeline, jobs, failures.clone())
            .await?;

        Ok(ValidationRun {
            summary: self.conclude(outcome.succeeded, &failures)?,
            results: sorted(&results),
        })
    }
}
