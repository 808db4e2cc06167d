//! Public cache handle wiring a [`Cache`] to a [`Scheduler`].

use crate::cache::{Cache, Lookup};
use crate::config::CacheConfig;
use crate::error::{CoreResult, GetStatus, PutStatus};
use crate::scheduler::{MaterializeHandle, Scheduler};
use crate::types::{Ailments, ContentKey};
use bytes::Bytes;
use iostash_storage::{FileBackend, InMemoryBackend, StorageBackend};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// File name of the data region within the cache directory.
const DATA_FILE: &str = "chunks.bin";

/// File name of the journal within the cache directory.
const JOURNAL_FILE: &str = "chunks.jrn";

/// Disk usage snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheUsage {
    /// Bytes currently indexed on disk.
    pub used_bytes: u64,
    /// Data-region capacity in bytes.
    pub capacity_bytes: u64,
}

/// The object callers interact with: a journaled two-tier chunk cache
/// serviced by a background scheduler.
///
/// `put`, `get`, `contains_chunk` and `evict` are synchronous and may be
/// called from any thread. Disk-resident bytes are read asynchronously via
/// [`ChunkCache::materialize`]; the scheduler's worker performs the read
/// and completes the returned handle.
///
/// Dropping the handle unregisters the cache from its scheduler.
///
/// # Example
///
/// ```no_run
/// use iostash_core::{CacheConfig, ChunkCache, ContentKey, GetStatus, Scheduler};
/// use std::path::Path;
///
/// let scheduler = Scheduler::new()?;
/// let cache = ChunkCache::open(Path::new("cache_dir"), CacheConfig::default(), &scheduler)?;
///
/// cache.put(ContentKey::new(0x493), b"chunk bytes".to_vec());
/// let mut out = Vec::new();
/// match cache.get(ContentKey::new(0x493), &mut out) {
///     GetStatus::Ok => { /* bytes are in `out` */ }
///     GetStatus::NeedsMaterialize => {
///         let read = cache.materialize(ContentKey::new(0x493));
///         read.wait();
///     }
///     GetStatus::NotFound => {}
/// }
/// # Ok::<(), iostash_core::CoreError>(())
/// ```
pub struct ChunkCache {
    cache: Arc<Cache>,
    scheduler: Scheduler,
}

impl ChunkCache {
    /// Opens a cache rooted at `dir`, creating the directory if needed.
    ///
    /// A chunk file that cannot be opened degrades the cache to index-only
    /// mode rather than failing; see [`ChunkCache::ailments`]. Recovery of
    /// any existing on-disk state runs on the scheduler's worker thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the
    /// configuration is invalid.
    pub fn open(dir: &Path, config: CacheConfig, scheduler: &Scheduler) -> CoreResult<Self> {
        config.validate()?;
        std::fs::create_dir_all(dir)?;

        let data = open_backend(&dir.join(DATA_FILE));
        let journal = open_backend(&dir.join(JOURNAL_FILE));

        let cache = Arc::new(Cache::with_backends(&config, data, journal));
        Ok(Self::attach(cache, &config, scheduler))
    }

    /// Opens a non-persistent cache for testing and ephemeral use.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn open_in_memory(config: CacheConfig, scheduler: &Scheduler) -> CoreResult<Self> {
        config.validate()?;

        let cache = Arc::new(Cache::with_backends(
            &config,
            Some(Box::new(InMemoryBackend::new())),
            Some(Box::new(InMemoryBackend::new())),
        ));
        Ok(Self::attach(cache, &config, scheduler))
    }

    fn attach(cache: Arc<Cache>, config: &CacheConfig, scheduler: &Scheduler) -> Self {
        scheduler.register(Arc::clone(&cache));
        scheduler.set_write_rate(config.write_rate);
        scheduler.set_demand_bands(config.demand);

        Self {
            cache,
            scheduler: scheduler.clone(),
        }
    }

    /// Whether the key is cached in any tier.
    #[must_use]
    pub fn contains_chunk(&self, key: ContentKey) -> bool {
        self.cache.has(key)
    }

    /// Synchronous lookup.
    ///
    /// Memory-resident bytes are copied into `out`. Disk-resident bytes are
    /// not read here - `NeedsMaterialize` tells the caller to issue a
    /// [`ChunkCache::materialize`] instead.
    pub fn get(&self, key: ContentKey, out: &mut Vec<u8>) -> GetStatus {
        match self.cache.get(key) {
            Lookup::Memory(bytes) => {
                out.clear();
                out.extend_from_slice(&bytes);
                GetStatus::Ok
            }
            Lookup::Disk => GetStatus::NeedsMaterialize,
            Lookup::Absent => GetStatus::NotFound,
        }
    }

    /// Begins an asynchronous read of a disk-resident chunk.
    ///
    /// Completion is delivered through the returned handle; see
    /// [`MaterializeHandle`]. Callers must treat `Cancelled` and
    /// `FileNotOpen` as retryable states.
    #[must_use]
    pub fn materialize(&self, key: ContentKey) -> MaterializeHandle {
        self.materialize_at(key, 0)
    }

    /// Like [`ChunkCache::materialize`], starting `offset` bytes into the
    /// chunk.
    #[must_use]
    pub fn materialize_at(&self, key: ContentKey, offset: u32) -> MaterializeHandle {
        self.scheduler
            .begin_read(Arc::clone(&self.cache), key, offset)
    }

    /// Requests cancellation of a pending materialize. Best-effort: a read
    /// already in flight completes normally.
    pub fn cancel(&self, handle: &MaterializeHandle) {
        self.scheduler.cancel(handle);
    }

    /// Inserts a chunk into the memory tier; the scheduler moves it to disk
    /// as rate and demand allow.
    pub fn put(&self, key: ContentKey, data: impl Into<Bytes>) -> PutStatus {
        if self.cache.put(key, data.into()) {
            PutStatus::Ok
        } else {
            PutStatus::Rejected
        }
    }

    /// Removes the key from every tier, durably.
    pub fn evict(&self, key: ContentKey) -> bool {
        self.cache.evict(key)
    }

    /// Current disk usage.
    #[must_use]
    pub fn cache_usage(&self) -> CacheUsage {
        let (used_bytes, capacity_bytes) = self.cache.usage();
        CacheUsage {
            used_bytes,
            capacity_bytes,
        }
    }

    /// Degraded-state flags for the underlying file handles.
    #[must_use]
    pub fn ailments(&self) -> Ailments {
        self.cache.ailments()
    }

    /// Abandons all cached state, truncating the on-disk files.
    pub fn drop_cache(&self) {
        self.cache.drop_cache();
    }
}

impl Drop for ChunkCache {
    fn drop(&mut self) {
        self.scheduler.unregister(&self.cache);
    }
}

impl std::fmt::Debug for ChunkCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkCache")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

/// Opens a chunk file, degrading to `None` on failure.
fn open_backend(path: &Path) -> Option<Box<dyn StorageBackend>> {
    match FileBackend::open(path) {
        Ok(backend) => Some(Box::new(backend)),
        Err(err) => {
            warn!(%err, path = %path.display(), "failed opening cache file");
            None
        }
    }
}
