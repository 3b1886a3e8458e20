//! Folder-state cache: keeps serialized paged folder state across
//! deselects and reconnects so SELECT does not always rebuild from the
//! store.
//!
//! Backends never surface errors to callers. A failed lookup is a miss, a
//! failed write is a dropped cache entry; sessions must work identically
//! with an empty cache.

pub mod disk;
pub mod memory;
pub mod remote;
pub mod tiered;

use crate::config::{CacheBackend, CacheConfig};
use crate::session::folder::PagedFolderState;
use std::sync::Arc;
use std::time::Duration;

/// Cache key: owning account, folder path, and whether the entry belongs to
/// a live session (active) or a disconnected one (parked).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub account_id: String,
    pub folder: String,
    pub active: bool,
}

impl CacheKey {
    pub fn active<A: Into<String>, F: Into<String>>(account_id: A, folder: F) -> Self {
        CacheKey {
            account_id: account_id.into(),
            folder: folder.into(),
            active: true,
        }
    }

    pub fn parked<A: Into<String>, F: Into<String>>(account_id: A, folder: F) -> Self {
        CacheKey {
            account_id: account_id.into(),
            folder: folder.into(),
            active: false,
        }
    }

    /// Filesystem- and wire-safe rendering, unique per key.
    pub fn encode(&self) -> String {
        let marker = if self.active { "a" } else { "p" };
        format!(
            "{}_{}_{}",
            sanitize(&self.account_id),
            sanitize(&self.folder),
            marker
        )
    }
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '~'
            }
        })
        .collect()
}

/// A folder-state cache backend. All operations are best-effort and
/// infallible from the caller's point of view.
pub trait FolderCache: Send + Sync {
    /// Store a value under a key. If the key already exists the call is a
    /// no-op: the first writer wins.
    fn put(&self, key: &CacheKey, state: &PagedFolderState);

    fn get(&self, key: &CacheKey) -> Option<PagedFolderState>;

    fn remove(&self, key: &CacheKey);

    /// Refresh the liveness clock of an entry without touching its value.
    fn update_access_time(&self, key: &CacheKey);

    /// Move an entry to a new key, atomically with respect to other cache
    /// operations. Used to park a folder on disconnect.
    fn rename(&self, from: &CacheKey, to: &CacheKey);
}

/// Build the backend named by the configuration.
pub fn from_config(config: &CacheConfig, authenticated_idle: Duration) -> Arc<dyn FolderCache> {
    match config.backend {
        CacheBackend::Memory => Arc::new(memory::MemoryFolderCache::new(
            config.max_entries,
            config.max_bytes,
        )),
        CacheBackend::Disk => Arc::new(disk::DiskFolderCache::new(config.disk_dir.clone())),
        CacheBackend::Remote => Arc::new(remote::RemoteFolderCache::new(Arc::new(
            remote::InMemoryByteStore::default(),
        ))),
        CacheBackend::Tiered => Arc::new(tiered::TieredFolderCache::new(
            config.max_entries,
            authenticated_idle + Duration::from_secs(config.active_grace_secs),
        )),
    }
}
