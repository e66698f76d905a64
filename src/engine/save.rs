//! Registry to archive.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::future::try_join_all;
use hangar_archive::{
    ArchiveError, ArchiveFormat, ArchiveWriter, Content, Entry, ImageRecord, PendingImage,
};
use hangar_oci::{BlobCache, Descriptor, ImageRef, PlatformFilter, Registry};
use tracing::info;

use super::{blocking, resolve_image, Engine, Rebase, ResolvedImage};
use crate::error::{Error, JobError, Result, Stage, StageExt};
use crate::failure::{FailureTracker, RunSummary};
use crate::list::{ImageJob, ImageList};
use crate::scheduler::JobPipeline;

type SharedWriter = Arc<Mutex<Option<ArchiveWriter>>>;

struct SavePipeline {
    source: Arc<dyn Registry>,
    rebase: Rebase,
    platforms: PlatformFilter,
    cache: BlobCache,
    writer: SharedWriter,
}

impl SavePipeline {
    async fn fetch(&self, image: &ImageRef, desc: &Descriptor) -> std::result::Result<Entry, JobError> {
        let cached = self
            .cache
            .fetch_or_get(&desc.digest, || self.source.pull_blob(image, &desc.digest))
            .await
            .stage(Stage::Blob)?;
        let content = match cached.path() {
            Some(path) => Content::File(path.to_path_buf()),
            None => Content::Bytes(cached.read().await.stage(Stage::Blob)?),
        };
        Ok(Entry {
            digest: desc.digest.clone(),
            content,
        })
    }
}

/// Manifest entries in write order: children before their index.
fn manifest_entries(resolved: &ResolvedImage) -> Vec<Entry> {
    resolved
        .children
        .iter()
        .chain(std::iter::once(&resolved.top))
        .map(|m| Entry {
            digest: m.digest.clone(),
            content: Content::Bytes(m.raw.clone()),
        })
        .collect()
}

#[async_trait]
impl JobPipeline for SavePipeline {
    type Job = ImageJob;

    fn describe(&self, job: &ImageJob) -> String {
        job.text.clone()
    }

    async fn process(&self, job: ImageJob) -> std::result::Result<(), JobError> {
        let source = self.rebase.source(&job);
        info!(job = job.id, image = %source, "saving image");

        let Some(resolved) = resolve_image(self.source.as_ref(), &source, &self.platforms).await?
        else {
            return Ok(());
        };
        let blobs = try_join_all(
            resolved
                .blobs()
                .iter()
                .map(|desc| self.fetch(&source, desc)),
        )
        .await?;

        let pending = PendingImage {
            blobs,
            manifests: manifest_entries(&resolved),
            record: ImageRecord {
                job: job.text.clone(),
                source: source.to_string(),
                manifest_digest: resolved.top.digest.clone(),
                media_type: resolved.top.media_type.clone(),
            },
        };

        let writer = self.writer.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = writer.lock().unwrap_or_else(|e| e.into_inner());
            match guard.as_mut() {
                Some(w) => w.append_image(pending),
                None => Err(ArchiveError::Incomplete {
                    path: String::new(),
                    reason: "archive already closed".into(),
                }),
            }
        })
        .await
        .map_err(|e| JobError::other(Stage::Archive, e.to_string()))?
        .stage(Stage::Archive)?;

        info!(job = job.id, image = %source, digest = %resolved.top.digest, "image saved");
        Ok(())
    }
}

impl Engine {
    /// Save every image in `list` into the configured archive.
    pub async fn save(&self, list: &ImageList) -> Result<RunSummary> {
        self.bounded(self.save_inner(list)).await
    }

    async fn save_inner(&self, list: &ImageList) -> Result<RunSummary> {
        let config = self.config.clone();
        let failures = Arc::new(FailureTracker::new());
        let jobs = self.parse_list(list, &failures);

        // Directory archives are the cache: blobs land in place.
        let cache_root = match config.format {
            ArchiveFormat::Directory => config.archive.clone(),
            ArchiveFormat::Stream(_) => config.cache_dir.clone(),
        };
        tokio::fs::create_dir_all(&cache_root).await?;

        let (archive, format, part_size) = (config.archive.clone(), config.format, config.part_size);
        let writer = blocking(move || ArchiveWriter::create(&archive, format, part_size)).await?;
        let writer: SharedWriter = Arc::new(Mutex::new(Some(writer)));

        let pipeline = Arc::new(SavePipeline {
            source: self.source.clone(),
            rebase: self.rebase(),
            platforms: config.platforms.clone(),
            cache: BlobCache::on_disk(cache_root),
            writer: writer.clone(),
        });
        let outcome = self
            .scheduler()
            .run(pipeline, jobs, failures.clone())
            .await?;

        let writer = writer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| Error::Task("archive writer already taken".into()))?;
        let summary = blocking(move || writer.finish()).await?;
        info!(
            path = %summary.path.display(),
            files = summary.files.len(),
            images = summary.images,
            "archive written"
        );

        self.conclude(outcome.succeeded, &failures)
    }
}
