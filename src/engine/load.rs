//! Archive to registry.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::try_join_all;
use hangar_archive::{ArchiveError, ImageRecord, OpenedArchive};
use hangar_oci::{digest, ImageRef, Manifest, OciError};
use tracing::{info, warn};

use super::{Engine, Pusher, ResolvedImage};
use crate::error::{Error, JobError, Result, Stage, StageExt};
use crate::failure::{FailureTracker, RunSummary};
use crate::list::ImageList;
use crate::scheduler::JobPipeline;

/// One archived image and where it goes.
pub(crate) struct LoadJob {
    pub name: String,
    pub record: ImageRecord,
    pub destination: ImageRef,
}

/// Read a content entry from an opened archive and check its digest.
pub(crate) async fn read_entry(
    archive: &OpenedArchive,
    digest: &str,
) -> std::result::Result<Vec<u8>, JobError> {
    let path = archive.blob_path(digest);
    let data = match tokio::fs::read(&path).await {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(JobError::other(
                Stage::Archive,
                format!("{} is missing from the archive", digest),
            ))
        }
        Err(e) => return Err(JobError::new(Stage::Archive, e)),
    };
    digest::verify(digest, &data).stage(Stage::Archive)?;
    Ok(data)
}

/// Rebuild an image's manifests from the archive.
pub(crate) async fn read_image(
    archive: &OpenedArchive,
    record: &ImageRecord,
) -> std::result::Result<ResolvedImage, JobError> {
    let raw = read_entry(archive, &record.manifest_digest).await?;
    let top = Manifest::from_bytes(raw, Some(&record.media_type)).stage(Stage::Archive)?;
    let mut children = Vec::with_capacity(top.children().len());
    for child in top.children() {
        let raw = read_entry(archive, &child.digest).await?;
        children.push(Manifest::from_bytes(raw, Some(&child.media_type)).stage(Stage::Archive)?);
    }
    Ok(ResolvedImage { top, children })
}

struct LoadPipeline {
    archive: Arc<OpenedArchive>,
    pusher: Pusher,
}

#[async_trait]
impl JobPipeline for LoadPipeline {
    type Job = LoadJob;

    fn describe(&self, job: &LoadJob) -> String {
        job.name.clone()
    }

    async fn process(&self, job: LoadJob) -> std::result::Result<(), JobError> {
        let dest = &job.destination;
        info!(image = %job.record.source, destination = %dest, "loading image");

        let resolved = read_image(&self.archive, &job.record).await?;
        self.pusher.prepare(dest).await?;

        let archive = &self.archive;
        try_join_all(resolved.blobs().iter().map(|desc| {
            self.pusher
                .push_blob(dest, &desc.digest, || read_entry(archive, &desc.digest))
        }))
        .await?;

        self.pusher.push_manifests(dest, &resolved).await
    }
}

impl Engine {
    /// Push the images of the configured archive.  With `list`, only the
    /// listed images are loaded, and a listed image the archive lacks is a
    /// failure.
    pub async fn load(&self, list: Option<&ImageList>) -> Result<RunSummary> {
        self.bounded(self.load_inner(list)).await
    }

    async fn load_inner(&self, list: Option<&ImageList>) -> Result<RunSummary> {
        let failures = Arc::new(FailureTracker::new());
        let label = self.config.archive.display().to_string();
        let (opened, _extracted) = match self.open_archive().await {
            Ok(opened) => opened,
            Err(Error::Archive(e @ ArchiveError::MissingPart { .. })) => {
                failures.record(label, Stage::Archive, e.to_string());
                return self.conclude(0, &failures);
            }
            Err(e) => return Err(e),
        };
        for problem in &opened.problems {
            warn!(archive = %label, problem = %problem, "archive damage");
            failures.record(label.clone(), Stage::Archive, problem.to_string());
        }

        let rebase = self.rebase();
        let jobs = match list {
            None => opened
                .records
                .iter()
                .filter_map(|record| match ImageRef::parse(&record.source) {
                    Ok(source) => Some(LoadJob {
                        name: record.job.clone(),
                        destination: rebase.destination(&source, None),
                        record: record.clone(),
                    }),
                    Err(e) => {
                        failures.record(record.job.clone(), Stage::Parse, e.to_string());
                        None
                    }
                })
                .collect(),
            Some(list) => {
                let by_source: HashMap<&str, &ImageRecord> = opened
                    .records
                    .iter()
                    .map(|r| (r.source.as_str(), r))
                    .collect();
                let mut jobs = Vec::new();
                for job in self.parse_list(list, &failures) {
                    let wanted = rebase.source(&job).to_string();
                    let found = by_source
                        .get(wanted.as_str())
                        .or_else(|| by_source.get(job.source.to_string().as_str()))
                        .copied();
                    match found {
                        Some(record) => {
                            let source = rebase.source(&job);
                            jobs.push(LoadJob {
                                name: job.text.clone(),
                                destination: rebase.destination(&source, job.destination.as_ref()),
                                record: record.clone(),
                            });
                        }
                        None => failures.record(
                            job.text.clone(),
                            Stage::Archive,
                            OciError::NotFound(format!("{} is not in {}", wanted, label)).to_string(),
                        ),
                    }
                }
                jobs
            }
        };

        let pipeline = Arc::new(LoadPipeline {
            archive: Arc::new(opened),
            pusher: Pusher::new(self.dest.clone()),
        });
        let outcome = self
            .scheduler()
            .run(pipeline, jobs, failures.clone())
            .await?;
        self.conclude(outcome.succeeded, &failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Mode, RegistryConfig, RunConfig};
    use hangar_oci::{MemoryRegistry, Registry};
    use std::path::Path;

    fn save_config(dir: &Path, format: &str) -> RunConfig {
        let mut config = RunConfig::new(Mode::Save);
        config.format = format.parse().unwrap();
        config.archive = config.format.output_path(dir.join("saved").to_str().unwrap());
        config.cache_dir = dir.join("save-cache");
        config.report_path = dir.join("save-failed.txt");
        config.jobs = 2;
        config
    }

    fn load_config(dir: &Path, archive: &Path) -> RunConfig {
        let mut config = RunConfig::new(Mode::Load);
        config.archive = archive.to_path_buf();
        config.cache_dir = dir.join("load-cache");
        config.report_path = dir.join("load-failed.txt");
        config.dest = RegistryConfig::new("dest.local");
        config.jobs = 2;
        config
    }

    async fn seed_and_save(dir: &Path, format: &str) -> (Arc<MemoryRegistry>, RunConfig) {
        let reg = Arc::new(MemoryRegistry::new());
        for name in ["a", "b"] {
            let r = ImageRef::parse(&format!("src.local/apps/{}:1", name)).unwrap();
            reg.insert_image(&r, &[b"common", name.as_bytes()]);
        }
        let config = save_config(dir, format);
        Engine::new(config.clone(), reg.clone(), reg.clone())
            .save(&ImageList::from_text("src.local/apps/a:1\nsrc.local/apps/b:1"))
            .await
            .unwrap();
        (reg, config)
    }

    #[tokio::test]
    async fn load_pushes_every_image() {
        for format in ["gzip", "dir"] {
            let tmp = tempfile::tempdir().unwrap();
            let (src, saved) = seed_and_save(tmp.path(), format).await;
            let dest = Arc::new(MemoryRegistry::new());
            let config = load_config(tmp.path(), &saved.archive);

            let summary = Engine::new(config.clone(), src.clone(), dest.clone())
                .load(None)
                .await
                .unwrap();
            assert!(summary.is_success(), "{}: {:?}", format, summary);
            assert_eq!(summary.succeeded, 2);
            assert!(config.cache_dir.is_dir());

            for name in ["a", "b"] {
                let from = ImageRef::parse(&format!("src.local/apps/{}:1", name)).unwrap();
                let to = ImageRef::parse(&format!("dest.local/apps/{}:1", name)).unwrap();
                let want = src.pull_manifest(&from).await.unwrap();
                assert_eq!(dest.pull_manifest(&to).await.unwrap().digest, want.digest);
            }
        }
    }

    #[tokio::test]
    async fn list_filters_and_reports_absent_images() {
        let tmp = tempfile::tempdir().unwrap();
        let (src, saved) = seed_and_save(tmp.path(), "zstd").await;
        let dest = Arc::new(MemoryRegistry::new());
        let config = load_config(tmp.path(), &saved.archive);

        let list = ImageList::from_text("src.local/apps/b:1\nsrc.local/apps/zzz:1\n");
        let summary = Engine::new(config.clone(), src, dest.clone())
            .load(Some(&list))
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert!(dest
            .manifest(&ImageRef::parse("dest.local/apps/b:1").unwrap())
            .is_some());
        assert!(dest
            .manifest(&ImageRef::parse("dest.local/apps/a:1").unwrap())
            .is_none());
        let report = std::fs::read_to_string(&config.report_path).unwrap();
        assert!(report.starts_with("src.local/apps/zzz:1 # [archive]"));
    }

    #[tokio::test]
    async fn missing_part_is_recorded_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = Arc::new(MemoryRegistry::new());
        let mut saved = save_config(tmp.path(), "none");
        saved.part_size = Some(1024);
        let r = ImageRef::parse("src.local/apps/big:1").unwrap();
        reg.insert_image(&r, &[&vec![7u8; 8 * 1024]]);
        Engine::new(saved.clone(), reg.clone(), reg.clone())
            .save(&ImageList::from_text("src.local/apps/big:1"))
            .await
            .unwrap();
        let part1 = hangar_archive::parts::part_path(&saved.archive, 1);
        std::fs::remove_file(part1).unwrap();

        let part0 = hangar_archive::parts::part_path(&saved.archive, 0);
        let config = load_config(tmp.path(), &part0);
        let summary = Engine::new(config.clone(), reg.clone(), reg)
            .load(None)
            .await
            .unwrap();
        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.failed, 1);
        let report = std::fs::read_to_string(&config.report_path).unwrap();
        assert!(report.contains("[archive]"));
        assert!(report.contains("part 1"));
    }

    #[tokio::test]
    async fn look_alike_names_are_all_restored() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = Arc::new(MemoryRegistry::new());
        for name in ["src.local/a_b:1", "src.local/a/b:1"] {
            reg.insert_image(&ImageRef::parse(name).unwrap(), &[name.as_bytes()]);
        }
        let saved = save_config(tmp.path(), "dir");
        let summary = Engine::new(saved.clone(), reg.clone(), reg.clone())
            .save(&ImageList::from_text("src.local/a_b:1\nsrc.local/a/b:1"))
            .await
            .unwrap();
        assert_eq!(summary.succeeded, 2);

        let dest = Arc::new(MemoryRegistry::new());
        let config = load_config(tmp.path(), &saved.archive);
        let summary = Engine::new(config, reg, dest.clone())
            .load(None)
            .await
            .unwrap();
        assert_eq!(summary.succeeded, 2, "{:?}", summary);
        for name in ["dest.local/a_b:1", "dest.local/a/b:1"] {
            assert!(dest.manifest(&ImageRef::parse(name).unwrap()).is_some(), "{}", name);
        }
    }

    #[tokio::test]
    async fn missing_archive_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = Arc::new(MemoryRegistry::new());
        let config = load_config(tmp.path(), &tmp.path().join("nope.tar.gz"));
        let err = Engine::new(config, reg.clone(), reg)
            .load(None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Archive(_)));
    }

    #[tokio::test]
    async fn denied_destination_fails_each_job() {
        let tmp = tempfile::tempdir().unwrap();
        let (src, saved) = seed_and_save(tmp.path(), "gzip").await;
        let dest = Arc::new(MemoryRegistry::new());
        dest.deny("dest.local");
        let config = load_config(tmp.path(), &saved.archive);

        let summary = Engine::new(config.clone(), src, dest)
            .load(None)
            .await
            .unwrap();
        assert_eq!(summary.failed, 2);
        let report = std::fs::read_to_string(&config.report_path).unwrap();
        assert_eq!(report.lines().count(), 2);
        assert!(report.lines().all(|l| l.contains("[destination]")));
    }
}
