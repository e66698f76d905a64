//! Registry to registry, nothing persisted locally.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::try_join_all;
use hangar_oci::{BlobCache, PlatformFilter, Registry};
use tracing::info;

use super::{resolve_image, Engine, Pusher, Rebase};
use crate::error::{JobError, Result, Stage, StageExt};
use crate::failure::{FailureTracker, RunSummary};
use crate::list::{ImageJob, ImageList};
use crate::scheduler::JobPipeline;

struct MirrorPipeline {
    source: Arc<dyn Registry>,
    rebase: Rebase,
    platforms: PlatformFilter,
    cache: BlobCache,
    pusher: Pusher,
}

#[async_trait]
impl JobPipeline for MirrorPipeline {
    type Job = ImageJob;

    fn describe(&self, job: &ImageJob) -> String {
        job.text.clone()
    }

    async fn process(&self, job: ImageJob) -> std::result::Result<(), JobError> {
        let source = self.rebase.source(&job);
        let dest = self.rebase.destination(&source, job.destination.as_ref());
        info!(job = job.id, image = %source, destination = %dest, "mirroring image");

        let Some(resolved) = resolve_image(self.source.as_ref(), &source, &self.platforms).await?
        else {
            return Ok(());
        };
        self.pusher.prepare(&dest).await?;

        let (source, dest) = (&source, &dest);
        try_join_all(resolved.blobs().iter().map(|desc| {
            self.pusher.push_blob(dest, &desc.digest, move || async move {
                let cached = self
                    .cache
                    .fetch_or_get(&desc.digest, || self.source.pull_blob(source, &desc.digest))
                    .await
                    .stage(Stage::Blob)?;
                cached.read().await.stage(Stage::Blob)
            })
        }))
        .await?;

        self.pusher.push_manifests(dest, &resolved).await
    }
}

impl Engine {
    /// Copy every image in `list` from the source to the destination
    /// registry.
    pub async fn mirror(&self, list: &ImageList) -> Result<RunSummary> {
        self.bounded(self.mirror_inner(list)).await
    }

    async fn mirror_inner(&self, list: &ImageList) -> Result<RunSummary> {
        let failures = Arc::new(FailureTracker::new());
        let jobs = self.parse_list(list, &failures);

        let pipeline = Arc::new(MirrorPipeline {
            source: self.source.clone(),
            rebase: self.rebase(),
            platforms: self.config.platforms.clone(),
            cache: BlobCache::in_memory(),
            pusher: Pusher::new(self.dest.clone()),
        });
        let outcome = self
            .scheduler()
            .run(pipeline, jobs, failures.clone())
            .await?;
        self.conclude(outcome.succeeded, &failures)
    }
}
