//! Folder cache backed by an external byte store (memcached-style). The
//! cache layer owns serialization; the store only ever sees opaque bytes
//! under `CacheKey::encode()` keys.

use crate::cache::{CacheKey, FolderCache};
use crate::error::Result;
use crate::session::folder::PagedFolderState;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::warn;

/// Transport to the external store. Implementations may fail; the cache
/// turns every failure into a miss.
pub trait ByteStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn store(&self, key: &str, bytes: &[u8]) -> Result<()>;

    fn delete(&self, key: &str) -> Result<()>;
}

pub struct RemoteFolderCache {
    store: std::sync::Arc<dyn ByteStore>,
    // Compound operations (first-writer check, rename) must not interleave
    // within this process; the remote store itself offers no transactions.
    lock: Mutex<()>,
}

impl RemoteFolderCache {
    pub fn new(store: std::sync::Arc<dyn ByteStore>) -> Self {
        RemoteFolderCache {
            store,
            lock: Mutex::new(()),
        }
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl FolderCache for RemoteFolderCache {
    fn put(&self, key: &CacheKey, state: &PagedFolderState) {
        let bytes = match serde_json::to_vec(state) {
            Ok(b) => b,
            Err(e) => {
                warn!(key = key.encode(), error = %e, "cache serialization failed");
                return;
            }
        };
        let _guard = self.guard();
        let encoded = key.encode();
        match self.store.load(&encoded) {
            Ok(Some(_)) => {}
            Ok(None) => {
                if let Err(e) = self.store.store(&encoded, &bytes) {
                    warn!(key = encoded, error = %e, "remote cache write failed");
                }
            }
            Err(e) => warn!(key = encoded, error = %e, "remote cache unreachable"),
        }
    }

    fn get(&self, key: &CacheKey) -> Option<PagedFolderState> {
        let _guard = self.guard();
        let encoded = key.encode();
        let bytes = match self.store.load(&encoded) {
            Ok(Some(b)) => b,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = encoded, error = %e, "remote cache unreachable");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(key = encoded, error = %e, "corrupt remote entry dropped");
                let _ = self.store.delete(&encoded);
                None
            }
        }
    }

    fn remove(&self, key: &CacheKey) {
        let _guard = self.guard();
        if let Err(e) = self.store.delete(&key.encode()) {
            warn!(key = key.encode(), error = %e, "remote cache delete failed");
        }
    }

    fn update_access_time(&self, _key: &CacheKey) {
        // Expiry is the remote store's concern.
    }

    fn rename(&self, from: &CacheKey, to: &CacheKey) {
        let _guard = self.guard();
        let from_key = from.encode();
        let bytes = match self.store.load(&from_key) {
            Ok(Some(b)) => b,
            Ok(None) => return,
            Err(e) => {
                warn!(key = from_key, error = %e, "remote cache unreachable");
                return;
            }
        };
        if let Err(e) = self.store.store(&to.encode(), &bytes) {
            warn!(key = to.encode(), error = %e, "remote cache write failed");
            return;
        }
        let _ = self.store.delete(&from_key);
    }
}

/// Byte store used by tests and single-node deployments.
#[derive(Default)]
pub struct InMemoryByteStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl ByteStore for InMemoryByteStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned())
    }

    fn store(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(key);
        Ok(())
    }
}
