//! In-process folder cache bounded by entry count and total serialized
//! size. Values are held serialized so the memory bound is accurate.

use crate::cache::{CacheKey, FolderCache};
use crate::session::folder::PagedFolderState;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;
use tracing::warn;

struct Entry {
    bytes: Vec<u8>,
    last_access: Instant,
}

struct Inner {
    entries: HashMap<CacheKey, Entry>,
    total_bytes: usize,
}

pub struct MemoryFolderCache {
    inner: Mutex<Inner>,
    max_entries: usize,
    max_bytes: usize,
}

impl MemoryFolderCache {
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        MemoryFolderCache {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                total_bytes: 0,
            }),
            max_entries: max_entries.max(1),
            max_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Inner {
    fn insert(&mut self, key: CacheKey, bytes: Vec<u8>) {
        self.total_bytes += bytes.len();
        self.entries.insert(
            key,
            Entry {
                bytes,
                last_access: Instant::now(),
            },
        );
    }

    fn drop_key(&mut self, key: &CacheKey) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.total_bytes -= entry.bytes.len();
        Some(entry)
    }

    fn evict_to(&mut self, max_entries: usize, max_bytes: usize) {
        while self.entries.len() > max_entries || self.total_bytes > max_bytes {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    self.drop_key(&key);
                }
                None => break,
            }
        }
    }
}

impl FolderCache for MemoryFolderCache {
    fn put(&self, key: &CacheKey, state: &PagedFolderState) {
        let bytes = match serde_json::to_vec(state) {
            Ok(b) => b,
            Err(e) => {
                warn!(key = key.encode(), error = %e, "cache serialization failed");
                return;
            }
        };
        let mut inner = self.lock();
        if inner.entries.contains_key(key) {
            return;
        }
        inner.insert(key.clone(), bytes);
        inner.evict_to(self.max_entries, self.max_bytes);
    }

    fn get(&self, key: &CacheKey) -> Option<PagedFolderState> {
        let mut inner = self.lock();
        let bytes = match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.last_access = Instant::now();
                entry.bytes.clone()
            }
            None => return None,
        };
        match serde_json::from_slice(&bytes) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(key = key.encode(), error = %e, "corrupt cache entry dropped");
                inner.drop_key(key);
                None
            }
        }
    }

    fn remove(&self, key: &CacheKey) {
        self.lock().drop_key(key);
    }

    fn update_access_time(&self, key: &CacheKey) {
        if let Some(entry) = self.lock().entries.get_mut(key) {
            entry.last_access = Instant::now();
        }
    }

    fn rename(&self, from: &CacheKey, to: &CacheKey) {
        let mut inner = self.lock();
        if let Some(entry) = inner.drop_key(from) {
            inner.drop_key(to);
            inner.insert(to.clone(), entry.bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::folder::PagedFolderState;
    use crate::session::mailbox::FolderSnapshot;

    fn state(path: &str) -> PagedFolderState {
        PagedFolderState::from_snapshot(FolderSnapshot {
            path: path.to_string(),
            uidvalidity: 1,
            uid_next: 1,
            highest_modseq: 1,
            items: Vec::new(),
            recent_cutoff: 1,
            read_only: false,
        })
    }

    #[test]
    fn test_put_get_roundtrip() {
        let cache = MemoryFolderCache::new(4, 1 << 20);
        let key = CacheKey::active("acct", "INBOX");
        cache.put(&key, &state("INBOX"));
        let got = cache.get(&key).unwrap();
        assert_eq!(got.path(), "INBOX");
    }

    #[test]
    fn test_first_writer_wins() {
        let cache = MemoryFolderCache::new(4, 1 << 20);
        let key = CacheKey::parked("acct", "INBOX");
        cache.put(&key, &state("INBOX"));
        cache.put(&key, &state("Sent"));
        assert_eq!(cache.get(&key).unwrap().path(), "INBOX");
    }

    #[test]
    fn test_entry_count_bound_evicts_oldest() {
        let cache = MemoryFolderCache::new(2, 1 << 20);
        let k1 = CacheKey::parked("acct", "one");
        let k2 = CacheKey::parked("acct", "two");
        let k3 = CacheKey::parked("acct", "three");
        cache.put(&k1, &state("one"));
        cache.put(&k2, &state("two"));
        // Touch k1 so k2 becomes the eviction candidate.
        cache.update_access_time(&k1);
        cache.put(&k3, &state("three"));
        assert!(cache.get(&k2).is_none());
        assert!(cache.get(&k1).is_some());
        assert!(cache.get(&k3).is_some());
    }

    #[test]
    fn test_rename_moves_value_and_replaces_destination() {
        let cache = MemoryFolderCache::new(4, 1 << 20);
        let active = CacheKey::active("acct", "INBOX");
        let parked = CacheKey::parked("acct", "INBOX");
        cache.put(&parked, &state("stale"));
        cache.put(&active, &state("INBOX"));
        cache.rename(&active, &parked);
        assert!(cache.get(&active).is_none());
        assert_eq!(cache.get(&parked).unwrap().path(), "INBOX");
    }

    #[test]
    fn test_byte_bound_evicts() {
        let cache = MemoryFolderCache::new(64, 1);
        let k1 = CacheKey::parked("acct", "one");
        cache.put(&k1, &state("one"));
        // The single entry already exceeds the byte bound.
        assert!(cache.is_empty());
    }
}
