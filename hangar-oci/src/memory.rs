//! In-process [`Registry`] used by tests and dry runs.
//!
//! Repositories, manifests and blobs live in a single mutex-guarded store.
//! The registry counts every operation so callers can assert on fetch and
//! push behaviour, and supports injected latency and failures.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::digest;
use crate::error::{OciError, Result};
use crate::manifest::{
    Descriptor, Manifest, Platform, MEDIA_TYPE_OCI_CONFIG, MEDIA_TYPE_OCI_INDEX,
    MEDIA_TYPE_OCI_LAYER_GZIP, MEDIA_TYPE_OCI_MANIFEST,
};
use crate::reference::ImageRef;
use crate::registry::Registry;

#[derive(Default)]
struct Repo {
    manifests: HashMap<String, Manifest>,
    blobs: HashMap<String, Arc<Vec<u8>>>,
}

#[derive(Default)]
struct Store {
    repos: HashMap<String, Repo>,
    provisioned: HashSet<String>,
    missing_images: HashSet<String>,
    corrupt_blobs: HashSet<String>,
    denied_registries: HashSet<String>,
    blob_pulls_by_digest: HashMap<String, u64>,
}

/// Operation counters.
#[derive(Debug, Default)]
pub struct Counters {
    pub manifest_pulls: AtomicU64,
    pub blob_pulls: AtomicU64,
    pub blob_exists: AtomicU64,
    pub blob_pushes: AtomicU64,
    pub manifest_pushes: AtomicU64,
    pub provisions: AtomicU64,
}

/// A registry held entirely in memory.
#[derive(Default)]
pub struct MemoryRegistry {
    store: Mutex<Store>,
    counters: Counters,
    latency: Option<Duration>,
    require_provisioning: bool,
}

fn repo_key(image: &ImageRef) -> String {
    format!("{}/{}", image.registry, image.repository)
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every operation by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Reject pushes into projects that were never provisioned, the way
    /// Harbor does.
    pub fn require_provisioning(mut self) -> Self {
        self.require_provisioning = true;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    // -- seeding ------------------------------------------------------------

    /// Store a blob in `image`'s repository and return its descriptor.
    pub fn insert_blob(&self, image: &ImageRef, media_type: &str, data: Vec<u8>) -> Descriptor {
        let desc = Descriptor {
            media_type: media_type.to_string(),
            digest: digest::sha256_digest(&data),
            size: data.len() as u64,
            platform: None,
        };
        self.lock()
            .repos
            .entry(repo_key(image))
            .or_default()
            .blobs
            .insert(desc.digest.clone(), Arc::new(data));
        desc
    }

    /// Store `manifest` under `image`'s reference and under its own digest.
    pub fn insert_manifest(&self, image: &ImageRef, manifest: Manifest) {
        let mut store = self.lock();
        let repo = store.repos.entry(repo_key(image)).or_default();
        repo.manifests
            .insert(manifest.digest.clone(), manifest.clone());
        repo.manifests.insert(image.reference.clone(), manifest);
    }

    /// Build and store a single-platform image whose layers hold `layers`.
    /// The config blob is derived from `image` so distinct images get
    /// distinct configs.
    pub fn insert_image(&self, image: &ImageRef, layers: &[&[u8]]) -> Manifest {
        let manifest = self.build_manifest(image, &image.to_string(), layers);
        self.insert_manifest(image, manifest.clone());
        manifest
    }

    /// Build and store a multi-platform index.  Each platform gets its own
    /// manifest built from its layers.
    pub fn insert_index(&self, image: &ImageRef, platforms: &[(Platform, Vec<&[u8]>)]) -> Manifest {
        let mut children = Vec::with_capacity(platforms.len());
        for (platform, layers) in platforms {
            let child = self.build_manifest(image, &format!("{} {}", image, platform), layers);
            children.push(Descriptor {
                media_type: child.media_type.clone(),
                digest: child.digest.clone(),
                size: child.raw.len() as u64,
                platform: Some(platform.clone()),
            });
            self.insert_manifest(&image.with_reference(&child.digest), child);
        }
        let raw = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_OCI_INDEX,
            "manifests": children,
        }))
        .unwrap_or_default();
        let index = Manifest {
            media_type: MEDIA_TYPE_OCI_INDEX.to_string(),
            digest: digest::sha256_digest(&raw),
            descriptors: children,
            raw,
        };
        self.insert_manifest(image, index.clone());
        index
    }

    fn build_manifest(&self, image: &ImageRef, config_seed: &str, layers: &[&[u8]]) -> Manifest {
        let config_body = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "config": { "Labels": { "source": config_seed } },
        });
        let config = self.insert_blob(
            image,
            MEDIA_TYPE_OCI_CONFIG,
            serde_json::to_vec(&config_body).unwrap_or_default(),
        );
        let layer_descs: Vec<Descriptor> = layers
            .iter()
            .map(|l| self.insert_blob(image, MEDIA_TYPE_OCI_LAYER_GZIP, l.to_vec()))
            .collect();

        let raw = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_OCI_MANIFEST,
            "config": config,
            "layers": layer_descs,
        }))
        .unwrap_or_default();

        let mut descriptors = vec![config];
        descriptors.extend(layer_descs);
        Manifest {
            media_type: MEDIA_TYPE_OCI_MANIFEST.to_string(),
            digest: digest::sha256_digest(&raw),
            descriptors,
            raw,
        }
    }

    // -- failure injection --------------------------------------------------

    /// Make `image` unresolvable even if it was seeded.
    pub fn fail_image(&self, image: &ImageRef) {
        self.lock().missing_images.insert(image.to_string());
    }

    /// Serve corrupted bytes for `digest`.
    pub fn corrupt_blob(&self, digest: &str) {
        self.lock().corrupt_blobs.insert(digest.to_string());
    }

    /// Reject every operation against `registry` with an auth error.
    pub fn deny(&self, registry: &str) {
        self.lock().denied_registries.insert(registry.to_string());
    }

    /// Drop a blob from `image`'s repository.
    pub fn remove_blob(&self, image: &ImageRef, digest: &str) {
        if let Some(repo) = self.lock().repos.get_mut(&repo_key(image)) {
            repo.blobs.remove(digest);
        }
    }

    // -- inspection ---------------------------------------------------------

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// How many times `digest` was downloaded.
    pub fn blob_pulls(&self, digest: &str) -> u64 {
        self.lock()
            .blob_pulls_by_digest
            .get(digest)
            .copied()
            .unwrap_or(0)
    }

    /// The manifest stored under `image`'s reference, if any.
    pub fn manifest(&self, image: &ImageRef) -> Option<Manifest> {
        self.lock()
            .repos
            .get(&repo_key(image))
            .and_then(|r| r.manifests.get(&image.reference).cloned())
    }

    /// Whether `image`'s repository holds `digest`.
    pub fn has_blob(&self, image: &ImageRef, digest: &str) -> bool {
        self.lock()
            .repos
            .get(&repo_key(image))
            .map(|r| r.blobs.contains_key(digest))
            .unwrap_or(false)
    }

    /// Projects provisioned so far, as `registry/project`.
    pub fn provisioned(&self) -> Vec<String> {
        let mut v: Vec<String> = self.lock().provisioned.iter().cloned().collect();
        v.sort();
        v
    }

    fn check_access(&self, image: &ImageRef) -> Result<()> {
        if self.lock().denied_registries.contains(&image.registry) {
            return Err(OciError::Auth(format!(
                "{} rejected credentials for {}",
                image.registry, image.repository
            )));
        }
        Ok(())
    }

    fn check_provisioned(&self, image: &ImageRef) -> Result<()> {
        if !self.require_provisioning {
            return Ok(());
        }
        let key = format!("{}/{}", image.registry, image.project());
        if self.lock().provisioned.contains(&key) {
            Ok(())
        } else {
            Err(OciError::NotFound(format!("project {} does not exist", key)))
        }
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn pull_manifest(&self, image: &ImageRef) -> Result<Manifest> {
        self.delay().await;
        self.check_access(image)?;
        self.counters.manifest_pulls.fetch_add(1, Ordering::SeqCst);
        let store = self.lock();
        if store.missing_images.contains(&image.to_string()) {
            return Err(OciError::NotFound(image.to_string()));
        }
        store
            .repos
            .get(&repo_key(image))
            .and_then(|r| r.manifests.get(&image.reference))
            .cloned()
            .ok_or_else(|| OciError::NotFound(image.to_string()))
    }

    async fn pull_blob(&self, image: &ImageRef, digest: &str) -> Result<Vec<u8>> {
        self.delay().await;
        self.check_access(image)?;
        self.counters.blob_pulls.fetch_add(1, Ordering::SeqCst);
        let data = {
            let mut store = self.lock();
            *store
                .blob_pulls_by_digest
                .entry(digest.to_string())
                .or_insert(0) += 1;
            let corrupt = store.corrupt_blobs.contains(digest);
            let blob = store
                .repos
                .get(&repo_key(image))
                .and_then(|r| r.blobs.get(digest))
                .cloned()
                .ok_or_else(|| OciError::NotFound(format!("{}@{}", image.repository, digest)))?;
            let mut data = blob.as_ref().clone();
            if corrupt {
                data.push(0xff);
            }
            data
        };
        digest::verify(digest, &data)?;
        Ok(data)
    }

    async fn blob_exists(&self, image: &ImageRef, digest: &str) -> Result<bool> {
        self.delay().await;
        self.check_access(image)?;
        self.counters.blob_exists.fetch_add(1, Ordering::SeqCst);
        Ok(self.has_blob(image, digest))
    }

    async fn push_blob(&self, image: &ImageRef, digest: &str, data: Vec<u8>) -> Result<()> {
        self.delay().await;
        self.check_access(image)?;
        self.check_provisioned(image)?;
        digest::verify(digest, &data)?;
        self.counters.blob_pushes.fetch_add(1, Ordering::SeqCst);
        self.lock()
            .repos
            .entry(repo_key(image))
            .or_default()
            .blobs
            .insert(digest.to_string(), Arc::new(data));
        Ok(())
    }

    async fn push_manifest(&self, image: &ImageRef, manifest: &Manifest) -> Result<()> {
        self.delay().await;
        self.check_access(image)?;
        self.check_provisioned(image)?;
        let mut store = self.lock();
        let repo = store.repos.entry(repo_key(image)).or_default();

        // Referenced content must already be present.
        for desc in manifest.blobs() {
            if !repo.blobs.contains_key(&desc.digest) {
                return Err(OciError::Registry(format!(
                    "manifest {} references unknown blob {}",
                    manifest.digest, desc.digest
                )));
            }
        }
        for child in manifest.children() {
            if !repo.manifests.contains_key(&child.digest) {
                return Err(OciError::Registry(format!(
                    "index {} references unknown manifest {}",
                    manifest.digest, child.digest
                )));
            }
        }

        self.counters.manifest_pushes.fetch_add(1, Ordering::SeqCst);
        repo.manifests
            .insert(manifest.digest.clone(), manifest.clone());
        repo.manifests
            .insert(image.reference.clone(), manifest.clone());
        Ok(())
    }

    async fn ensure_destination_exists(&self, image: &ImageRef) -> Result<()> {
        self.check_access(image)?;
        self.counters.provisions.fetch_add(1, Ordering::SeqCst);
        self.lock()
            .provisioned
            .insert(format!("{}/{}", image.registry, image.project()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn img(s: &str) -> ImageRef {
        ImageRef::parse(s).unwrap()
    }

    #[tokio::test]
    async fn seeded_image_round_trips_through_registry_api() {
        let reg = MemoryRegistry::new();
        let src = img("src.local/library/app:1.0");
        let m = reg.insert_image(&src, &[b"layer-a", b"layer-b"]);

        let pulled = reg.pull_manifest(&src).await.unwrap();
        assert_eq!(pulled, m);
        assert_eq!(pulled.blobs().len(), 3);

        let by_digest = reg.pull_manifest(&src.with_reference(&m.digest)).await.unwrap();
        assert_eq!(by_digest.digest, m.digest);

        let layer = &pulled.blobs()[1];
        assert_eq!(reg.pull_blob(&src, &layer.digest).await.unwrap(), b"layer-a");
        assert_eq!(reg.blob_pulls(&layer.digest), 1);
    }

    #[tokio::test]
    async fn index_children_resolve_by_digest() {
        let reg = MemoryRegistry::new();
        let src = img("src.local/library/multi:1");
        let amd64 = Platform {
            architecture: "amd64".into(),
            os: "linux".into(),
            variant: None,
        };
        let arm64 = Platform {
            architecture: "arm64".into(),
            os: "linux".into(),
            variant: Some("v8".into()),
        };
        let index = reg.insert_index(&src, &[(amd64, vec![&b"x86"[..]]), (arm64, vec![&b"arm"[..]])]);
        assert!(index.is_index());
        assert_eq!(index.children().len(), 2);
        for child in index.children() {
            let m = reg
                .pull_manifest(&src.with_reference(&child.digest))
                .await
                .unwrap();
            assert_eq!(m.digest, child.digest);
        }
    }

    #[tokio::test]
    async fn injected_failures() {
        let reg = MemoryRegistry::new();
        let src = img("src.local/library/app:1.0");
        let m = reg.insert_image(&src, &[b"layer"]);

        reg.corrupt_blob(&m.blobs()[1].digest);
        assert!(matches!(
            reg.pull_blob(&src, &m.blobs()[1].digest).await,
            Err(OciError::DigestMismatch { .. })
        ));

        reg.fail_image(&src);
        assert!(matches!(
            reg.pull_manifest(&src).await,
            Err(OciError::NotFound(_))
        ));

        reg.deny("src.local");
        assert!(matches!(
            reg.blob_exists(&src, &m.digest).await,
            Err(OciError::Auth(_))
        ));
    }

    #[tokio::test]
    async fn manifest_push_requires_blobs() {
        let reg = MemoryRegistry::new();
        let src = img("src.local/library/app:1.0");
        let dst = img("dst.local/library/app:1.0");
        let m = reg.insert_image(&src, &[b"layer"]);

        assert!(reg.push_manifest(&dst, &m).await.is_err());
        for desc in m.blobs() {
            let data = reg.pull_blob(&src, &desc.digest).await.unwrap();
            reg.push_blob(&dst, &desc.digest, data).await.unwrap();
        }
        reg.push_manifest(&dst, &m).await.unwrap();
        assert_eq!(reg.manifest(&dst).unwrap().digest, m.digest);
    }

    #[tokio::test]
    async fn provisioning_gate() {
        let reg = MemoryRegistry::new().require_provisioning();
        let dst = img("harbor.local/team/app:1");
        let data = b"blob".to_vec();
        let d = digest::sha256_digest(&data);
        assert!(reg.push_blob(&dst, &d, data.clone()).await.is_err());
        reg.ensure_destination_exists(&dst).await.unwrap();
        reg.push_blob(&dst, &d, data).await.unwrap();
        assert_eq!(reg.provisioned(), vec!["harbor.local/team".to_string()]);
    }
}
