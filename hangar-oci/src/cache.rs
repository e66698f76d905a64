//! Run-scoped, content-addressed blob cache with per-digest single-flight
//! fetching.
//!
//! The cache map lock is only held long enough to look up or insert the slot
//! for one key.  The fetch itself runs inside that slot's [`OnceCell`], so
//! concurrent requesters for the same digest wait for one in-progress fetch
//! while unrelated digests make independent progress.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::fs;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::digest;
use crate::error::Result;

// ---------------------------------------------------------------------------
// SingleFlight
// ---------------------------------------------------------------------------

struct Slot<V> {
    cell: OnceCell<V>,
    requests: AtomicU64,
}

/// Deduplicates concurrent work by key: the first caller for a key runs the
/// initializer, every other caller waits for and then shares its result.
/// A failed initializer leaves the slot empty so a later caller can retry.
pub struct SingleFlight<K, V> {
    slots: Mutex<HashMap<K, Arc<Slot<V>>>>,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Return the value for `key`, running `init` only if no value has been
    /// produced yet and no other caller is currently producing it.
    pub async fn get_or_try_init<F, Fut, E>(&self, key: K, init: F) -> std::result::Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<V, E>>,
    {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots
                .entry(key)
                .or_insert_with(|| {
                    Arc::new(Slot {
                        cell: OnceCell::new(),
                        requests: AtomicU64::new(0),
                    })
                })
                .clone()
        };
        slot.requests.fetch_add(1, Ordering::SeqCst);
        slot.cell.get_or_try_init(init).await.cloned()
    }

    /// Number of times `key` has been requested in this run.
    pub fn requests(&self, key: &K) -> u64 {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|s| s.requests.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Whether a value has been produced for `key`.
    pub fn is_ready(&self, key: &K) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|s| s.cell.initialized())
            .unwrap_or(false)
    }

    /// Number of keys that have a produced value.
    pub fn ready_len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|s| s.cell.initialized())
            .count()
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// BlobCache
// ---------------------------------------------------------------------------

/// Where a cached blob's bytes live.
#[derive(Debug, Clone)]
pub enum BlobLocation {
    Memory(Arc<Vec<u8>>),
    Disk(PathBuf),
}

/// A resolved blob.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub digest: String,
    pub size: u64,
    pub location: BlobLocation,
}

impl CacheEntry {
    /// Load the blob's bytes.
    pub async fn read(&self) -> Result<Vec<u8>> {
        match &self.location {
            BlobLocation::Memory(data) => Ok(data.as_ref().clone()),
            BlobLocation::Disk(path) => Ok(fs::read(path).await?),
        }
    }

    /// On-disk path, when the entry is disk-backed.
    pub fn path(&self) -> Option<&Path> {
        match &self.location {
            BlobLocation::Disk(p) => Some(p),
            BlobLocation::Memory(_) => None,
        }
    }
}

/// Content-addressed blob cache.  Disk-backed caches store blobs under
/// `<cache_dir>/blobs/sha256/<hex>`; memory-backed caches hold them for the
/// lifetime of the cache value.
pub struct BlobCache {
    cache_dir: Option<PathBuf>,
    flights: SingleFlight<String, CacheEntry>,
}

impl BlobCache {
    pub fn in_memory() -> Self {
        Self {
            cache_dir: None,
            flights: SingleFlight::new(),
        }
    }

    pub fn on_disk(cache_dir: PathBuf) -> Self {
        Self {
            cache_dir: Some(cache_dir),
            flights: SingleFlight::new(),
        }
    }

    /// Directory that holds all blobs: `<cache_dir>/blobs/sha256/`.
    pub fn blobs_dir(&self) -> Option<PathBuf> {
        self.cache_dir
            .as_ref()
            .map(|d| d.join("blobs").join("sha256"))
    }

    /// Return the expected path for a blob with the given digest.
    pub fn blob_path(&self, digest: &str) -> Option<PathBuf> {
        self.blobs_dir().map(|d| d.join(digest::hex_part(digest)))
    }

    /// Return the cached blob for `digest`, invoking `fetch` at most once per
    /// digest for the lifetime of this cache.  Fetched bytes are verified
    /// against `digest` before they are stored.
    pub async fn fetch_or_get<F, Fut>(&self, digest: &str, fetch: F) -> Result<CacheEntry>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>>>,
    {
        self.flights
            .get_or_try_init(digest.to_string(), || async move {
                if let Some(entry) = self.reuse_from_disk(digest).await? {
                    return Ok(entry);
                }
                let data = fetch().await?;
                digest::verify(digest, &data)?;
                self.store(digest, data).await
            })
            .await
    }

    /// Number of requests made for `digest` during this run.
    pub fn refs(&self, digest: &str) -> u64 {
        self.flights.requests(&digest.to_string())
    }

    pub fn contains(&self, digest: &str) -> bool {
        self.flights.is_ready(&digest.to_string())
    }

    pub fn len(&self) -> usize {
        self.flights.ready_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return a reference to the underlying cache directory.
    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache_dir.as_deref()
    }

    /// A blob left on disk by an earlier run is reused only if it still
    /// hashes to its name.
    async fn reuse_from_disk(&self, digest: &str) -> Result<Option<CacheEntry>> {
        let Some(path) = self.blob_path(digest) else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path).await?;
        if digest::verify(digest, &data).is_err() {
            debug!(path = %path.display(), "discarding corrupt cached blob");
            fs::remove_file(&path).await?;
            return Ok(None);
        }
        debug!(digest, "blob already cached");
        Ok(Some(CacheEntry {
            digest: digest.to_string(),
            size: data.len() as u64,
            location: BlobLocation::Disk(path),
        }))
    }

    async fn store(&self, digest: &str, data: Vec<u8>) -> Result<CacheEntry> {
        let size = data.len() as u64;
        let Some(dir) = self.blobs_dir() else {
            return Ok(CacheEntry {
                digest: digest.to_string(),
                size,
                location: BlobLocation::Memory(Arc::new(data)),
            });
        };
        fs::create_dir_all(&dir).await?;

        let path = dir.join(digest::hex_part(digest));
        let partial = path.with_extension("partial");
        fs::write(&partial, &data).await?;
        fs::rename(&partial, &path).await?;
        debug!(path = %path.display(), "stored blob");
        Ok(CacheEntry {
            digest: digest.to_string(),
            size,
            location: BlobLocation::Disk(path),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
