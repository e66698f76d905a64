//! Transfer engine: save, load and mirror runs.
//!
//! An [`Engine`] owns one run's configuration and its two registry
//! endpoints.  Each mode builds a [`JobPipeline`] over its jobs, hands it to
//! the [`Scheduler`] and turns the collected failures into a
//! [`RunSummary`].
//!
//! [`JobPipeline`]: crate::scheduler::JobPipeline

mod load;
mod mirror;
mod save;

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use hangar_archive::OpenedArchive;
use hangar_oci::{
    provisioner_for, ClientOptions, Descriptor, ImageRef, Manifest, PlatformFilter, Registry,
    RegistryClient, SingleFlight,
};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::config::{Mode, RunConfig};
use crate::error::{Error, JobError, Result, Stage, StageExt};
use crate::failure::{FailureTracker, RunSummary};
use crate::list::{ImageJob, ImageList};
use crate::scheduler::Scheduler;

/// One run's engine.
pub struct Engine {
    pub(crate) config: Arc<RunConfig>,
    pub(crate) source: Arc<dyn Registry>,
    pub(crate) dest: Arc<dyn Registry>,
}

impl Engine {
    pub fn new(config: RunConfig, source: Arc<dyn Registry>, dest: Arc<dyn Registry>) -> Self {
        Self {
            config: Arc::new(config),
            source,
            dest,
        }
    }

    /// Build HTTP registry clients from `config`.
    pub fn from_config(config: RunConfig) -> Result<Self> {
        config.validate()?;
        let user_agent = format!("hangar/{}", env!("CARGO_PKG_VERSION"));
        let source = RegistryClient::new(ClientOptions {
            credentials: config.source.credentials(),
            tls_verify: config.tls_verify,
            user_agent: user_agent.clone(),
        })?;
        let dest = RegistryClient::new(ClientOptions {
            credentials: config.dest.credentials(),
            tls_verify: config.tls_verify,
            user_agent,
        })?
        .with_provisioner(provisioner_for(config.repo_type));
        Ok(Self::new(config, Arc::new(source), Arc::new(dest)))
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Run the configured mode.  Save, mirror and mirror-validate need a
    /// list; load uses one as a filter when given.
    pub async fn run(&self, list: Option<&ImageList>) -> Result<RunSummary> {
        let needs_list = || {
            list.ok_or_else(|| {
                Error::Config(format!("{} needs an image list (-f)", self.config.mode))
            })
        };
        match self.config.mode {
            Mode::Save => self.save(needs_list()?).await,
            Mode::Load => self.load(list).await,
            Mode::Mirror => self.mirror(needs_list()?).await,
            Mode::LoadValidate => Ok(self.load_validate().await?.summary),
            Mode::MirrorValidate => Ok(self.mirror_validate(needs_list()?).await?.summary),
        }
    }

    pub(crate) fn scheduler(&self) -> Scheduler {
        Scheduler::new(self.config.jobs).with_job_timeout(self.config.job_timeout)
    }

    pub(crate) fn rebase(&self) -> Rebase {
        Rebase {
            source_host: Some(self.config.source.host()).filter(|h| !h.is_empty()),
            dest_host: Some(self.config.dest.host()).filter(|h| !h.is_empty()),
            project: self.config.project.clone(),
            source_project: self.config.source_project.clone(),
        }
    }

    /// Apply the overall run timeout.
    pub(crate) async fn bounded<T>(&self, run: impl Future<Output = Result<T>>) -> Result<T> {
        match self.config.timeout {
            Some(limit) => tokio::time::timeout(limit, run)
                .await
                .map_err(|_| Error::Timeout(limit))?,
            None => run.await,
        }
    }

    /// Open the configured archive.  Stream archives are extracted into a
    /// fresh directory under the cache dir, removed when the returned guard
    /// drops, so only this archive's entries are visible to the run.
    pub(crate) async fn open_archive(&self) -> Result<(OpenedArchive, TempDir)> {
        tokio::fs::create_dir_all(&self.config.cache_dir).await?;
        let (source, cache) = (self.config.archive.clone(), self.config.cache_dir.clone());
        blocking(move || -> Result<(OpenedArchive, TempDir)> {
            let work = tempfile::Builder::new()
                .prefix("extract-")
                .tempdir_in(&cache)?;
            let opened = hangar_archive::open(&source, work.path())?;
            Ok((opened, work))
        })
        .await
    }

    /// Record malformed list entries and return the valid jobs.
    pub(crate) fn parse_list(&self, list: &ImageList, failures: &FailureTracker) -> Vec<ImageJob> {
        let (jobs, malformed) = list.jobs();
        for bad in malformed {
            failures.record(bad.content.clone(), Stage::Parse, bad.to_string());
        }
        jobs
    }

    /// Write the report and summarize.
    pub(crate) fn conclude(&self, succeeded: usize, failures: &FailureTracker) -> Result<RunSummary> {
        let report = failures.write_report(&self.config.report_path)?;
        let failed = failures.len();
        let summary = RunSummary {
            total: succeeded + failed,
            succeeded,
            failed,
            report,
        };
        info!(
            mode = %self.config.mode,
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "run finished"
        );
        Ok(summary)
    }
}

/// Run blocking work on the blocking pool.
pub(crate) async fn blocking<T, E, F>(work: F) -> Result<T>
where
    F: FnOnce() -> std::result::Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<Error> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Task(e.to_string()))?
        .map_err(Into::into)
}

// ---------------------------------------------------------------------------
// Reference rebasing
// ---------------------------------------------------------------------------

/// How list references map onto the configured registries.
#[derive(Debug, Clone)]
pub(crate) struct Rebase {
    source_host: Option<String>,
    dest_host: Option<String>,
    project: Option<String>,
    source_project: Option<String>,
}

impl Rebase {
    /// Where to pull `job` from.  Single-reference lines are moved onto the
    /// source registry and project when those are configured; explicit
    /// pairs are taken as written.
    pub fn source(&self, job: &ImageJob) -> ImageRef {
        if job.destination.is_some() {
            return job.source.clone();
        }
        let moved = match &self.source_host {
            Some(host) => job.source.with_registry(host),
            None => job.source.clone(),
        };
        match &self.source_project {
            Some(project) => moved.with_project(project),
            None => moved,
        }
    }

    /// Where to push `source`.  An explicit destination wins; otherwise the
    /// source is moved onto the destination registry and project.
    pub fn destination(&self, source: &ImageRef, explicit: Option<&ImageRef>) -> ImageRef {
        if let Some(dest) = explicit {
            return dest.clone();
        }
        let moved = match &self.dest_host {
            Some(host) => source.with_registry(host),
            None => source.clone(),
        };
        match &self.project {
            Some(project) => moved.with_project(project),
            None => moved,
        }
    }
}

// ---------------------------------------------------------------------------
// Resolved images
// ---------------------------------------------------------------------------

/// A top-level manifest together with the child manifests of an index.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedImage {
    pub top: Manifest,
    pub children: Vec<Manifest>,
}

impl ResolvedImage {
    /// Every blob the image needs, first occurrence order, no repeats.
    pub fn blobs(&self) -> Vec<Descriptor> {
        let mut seen = HashSet::new();
        self.top
            .blobs()
            .iter()
            .chain(self.children.iter().flat_map(|c| c.blobs().iter()))
            .filter(|d| seen.insert(d.digest.clone()))
            .cloned()
            .collect()
    }
}

/// Pull `image`'s manifest and, for an index, the child manifests `platforms`
/// keeps.  `None` when the index has no child for the wanted platforms; the
/// caller skips such an image without counting it as failed.
pub(crate) async fn resolve_image(
    registry: &dyn Registry,
    image: &ImageRef,
    platforms: &PlatformFilter,
) -> std::result::Result<Option<ResolvedImage>, JobError> {
    let pulled = registry.pull_manifest(image).await.stage(Stage::Manifest)?;
    let Some(top) = pulled.select_platforms(platforms).stage(Stage::Manifest)? else {
        warn!(image = %image, platforms = %platforms, "no manifest for the requested platforms, skipping");
        return Ok(None);
    };
    let mut children = Vec::with_capacity(top.children().len());
    for child in top.children() {
        let child_ref = image.with_reference(&child.digest);
        let manifest = registry
            .pull_manifest(&child_ref)
            .await
            .stage(Stage::Manifest)?;
        children.push(manifest);
    }
    debug!(
        image = %image,
        digest = %top.digest,
        children = children.len(),
        "resolved manifest"
    );
    Ok(Some(ResolvedImage { top, children }))
}

// ---------------------------------------------------------------------------
// Pusher
// ---------------------------------------------------------------------------

/// Destination-side pushes shared by load and mirror.  Each blob is pushed
/// at most once per repository per run and each project is provisioned at
/// most once per run.
pub(crate) struct Pusher {
    dest: Arc<dyn Registry>,
    blobs: SingleFlight<String, ()>,
    projects: SingleFlight<String, ()>,
}

impl Pusher {
    pub fn new(dest: Arc<dyn Registry>) -> Self {
        Self {
            dest,
            blobs: SingleFlight::new(),
            projects: SingleFlight::new(),
        }
    }

    pub async fn prepare(&self, image: &ImageRef) -> std::result::Result<(), JobError> {
        let key = format!("{}/{}", image.registry, image.project());
        self.projects
            .get_or_try_init(key, || async {
                self.dest
                    .ensure_destination_exists(image)
                    .await
                    .stage(Stage::Destination)
            })
            .await
    }

    /// Push `digest` into `image`'s repository unless it is already there.
    /// `load` produces the bytes and only runs when an upload is needed.
    pub async fn push_blob<F, Fut>(
        &self,
        image: &ImageRef,
        digest: &str,
        load: F,
    ) -> std::result::Result<(), JobError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Vec<u8>, JobError>>,
    {
        let key = format!("{}/{}@{}", image.registry, image.repository, digest);
        self.blobs
            .get_or_try_init(key, || async move {
                if self.dest.blob_exists(image, digest).await.stage(Stage::Push)? {
                    debug!(image = %image, digest, "blob already at destination");
                    return Ok(());
                }
                let data = load().await?;
                self.dest
                    .push_blob(image, digest, data)
                    .await
                    .stage(Stage::Push)?;
                debug!(image = %image, digest, "blob pushed");
                Ok(())
            })
            .await
    }

    /// Push an index's children, then the top manifest under `image`.
    pub async fn push_manifests(
        &self,
        image: &ImageRef,
        resolved: &ResolvedImage,
    ) -> std::result::Result<(), JobError> {
        for child in &resolved.children {
            self.dest
                .push_manifest(&image.with_reference(&child.digest), child)
                .await
                .stage(Stage::Push)?;
        }
        self.dest
            .push_manifest(image, &resolved.top)
            .await
            .stage(Stage::Push)?;
        info!(image = %image, digest = %resolved.top.digest, "manifest pushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use hangar_oci::MemoryRegistry;

    fn job(text: &str) -> ImageJob {
        let (mut jobs, _) = ImageList::from_text(text).jobs();
        jobs.remove(0)
    }

    fn engine(mut config: RunConfig) -> Engine {
        config.dest = RegistryConfig::new("dest.local");
        let reg: Arc<dyn Registry> = Arc::new(MemoryRegistry::new());
        Engine::new(config, reg.clone(), reg)
    }

    #[test]
    fn rebase_single_and_paired_lines() {
        let mut config = RunConfig::new(Mode::Mirror);
        config.source = RegistryConfig::new("https://src.local");
        let rebase = engine(config).rebase();

        let single = job("rancher/rancher:v2.9.0");
        let src = rebase.source(&single);
        assert_eq!(src.to_string(), "src.local/rancher/rancher:v2.9.0");
        assert_eq!(
            rebase.destination(&src, None).to_string(),
            "dest.local/rancher/rancher:v2.9.0"
        );

        let pair = job("quay.io/a/b:1 other.local/x/b:2");
        let src = rebase.source(&pair);
        assert_eq!(src.to_string(), "quay.io/a/b:1");
        assert_eq!(
            rebase.destination(&src, pair.destination.as_ref()).to_string(),
            "other.local/x/b:2"
        );
    }

    #[test]
    fn source_project_override() {
        let mut config = RunConfig::new(Mode::Save);
        config.source = RegistryConfig::new("src.local");
        config.source_project = Some("upstream".into());
        let rebase = engine(config).rebase();

        let single = job("rancher/rancher:v2.9.0");
        assert_eq!(
            rebase.source(&single).to_string(),
            "src.local/upstream/rancher:v2.9.0"
        );
        let pair = job("quay.io/a/b:1 other.local/x/b:2");
        assert_eq!(rebase.source(&pair).to_string(), "quay.io/a/b:1");
    }

    #[test]
    fn project_override() {
        let mut config = RunConfig::new(Mode::Load);
        config.project = Some("airgap".into());
        let rebase = engine(config).rebase();
        let src = ImageRef::parse("nginx:1.25").unwrap();
        assert_eq!(
            rebase.destination(&src, None).to_string(),
            "dest.local/airgap/nginx:1.25"
        );
    }

    #[tokio::test]
    async fn pusher_uploads_each_blob_once() {
        let reg = Arc::new(MemoryRegistry::new());
        let pusher = Pusher::new(reg.clone());
        let image = ImageRef::parse("dest.local/p/app:1").unwrap();
        let data = b"layer".to_vec();
        let digest = hangar_oci::digest::sha256_digest(&data);

        pusher.prepare(&image).await.unwrap();
        pusher.prepare(&image.with_reference("2")).await.unwrap();
        for _ in 0..3 {
            let data = data.clone();
            pusher
                .push_blob(&image, &digest, || async move { Ok(data) })
                .await
                .unwrap();
        }
        assert!(reg.has_blob(&image, &digest));
        assert_eq!(reg.counters().blob_pushes.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(reg.counters().provisions.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_jobs_provision_a_project_once() {
        let reg = Arc::new(MemoryRegistry::new().with_latency(std::time::Duration::from_millis(5)));
        let pusher = Pusher::new(reg.clone());
        let images: Vec<ImageRef> = (0..8)
            .map(|n| ImageRef::parse(&format!("dest.local/team/app{}:1", n)).unwrap())
            .chain(std::iter::once(ImageRef::parse("dest.local/ops/tool:1").unwrap()))
            .collect();

        futures_util::future::try_join_all(images.iter().map(|i| pusher.prepare(i)))
            .await
            .unwrap();
        assert_eq!(reg.counters().provisions.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(
            reg.provisioned(),
            vec!["dest.local/ops".to_string(), "dest.local/team".to_string()]
        );
    }

    #[tokio::test]
    async fn run_timeout_is_fatal() {
        let mut config = RunConfig::new(Mode::Mirror);
        config.timeout = Some(std::time::Duration::from_millis(20));
        let engine = engine(config);
        let err = engine
            .bounded(async {
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }
}
