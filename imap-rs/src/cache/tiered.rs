//! Two-tier folder cache. Active entries belong to live sessions and are
//! never evicted before their liveness TTL elapses; parked entries are a
//! plain LRU pool. Parking on disconnect is a single-lock move between
//! tiers.

use crate::cache::{CacheKey, FolderCache};
use crate::session::folder::PagedFolderState;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

struct Entry {
    bytes: Vec<u8>,
    last_access: Instant,
}

struct Inner {
    active: HashMap<CacheKey, Entry>,
    parked: HashMap<CacheKey, Entry>,
}

pub struct TieredFolderCache {
    inner: Mutex<Inner>,
    max_parked: usize,
    /// Active entries may only be dropped once untouched for this long;
    /// sized from the session idle timeout so a live session never loses
    /// its entry.
    active_ttl: Duration,
}

impl TieredFolderCache {
    pub fn new(max_parked: usize, active_ttl: Duration) -> Self {
        TieredFolderCache {
            inner: Mutex::new(Inner {
                active: HashMap::new(),
                parked: HashMap::new(),
            }),
            max_parked: max_parked.max(1),
            active_ttl,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sweep(&self, inner: &mut Inner) {
        let ttl = self.active_ttl;
        inner
            .active
            .retain(|_, entry| entry.last_access.elapsed() < ttl);
        while inner.parked.len() > self.max_parked {
            let oldest = inner
                .parked
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    inner.parked.remove(&key);
                }
                None => break,
            }
        }
    }
}

fn tier<'a>(inner: &'a mut Inner, key: &CacheKey) -> &'a mut HashMap<CacheKey, Entry> {
    if key.active {
        &mut inner.active
    } else {
        &mut inner.parked
    }
}

impl FolderCache for TieredFolderCache {
    fn put(&self, key: &CacheKey, state: &PagedFolderState) {
        let bytes = match serde_json::to_vec(state) {
            Ok(b) => b,
            Err(e) => {
                warn!(key = key.encode(), error = %e, "cache serialization failed");
                return;
            }
        };
        let mut inner = self.lock();
        self.sweep(&mut inner);
        let tier = tier(&mut inner, key);
        if tier.contains_key(key) {
            return;
        }
        tier.insert(
            key.clone(),
            Entry {
                bytes,
                last_access: Instant::now(),
            },
        );
    }

    fn get(&self, key: &CacheKey) -> Option<PagedFolderState> {
        let mut inner = self.lock();
        let tier = tier(&mut inner, key);
        let bytes = match tier.get_mut(key) {
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
                tier.remove(key);
                None
            }
        }
    }

    fn remove(&self, key: &CacheKey) {
        let mut inner = self.lock();
        tier(&mut inner, key).remove(key);
    }

    fn update_access_time(&self, key: &CacheKey) {
        let mut inner = self.lock();
        if let Some(entry) = tier(&mut inner, key).get_mut(key) {
            entry.last_access = Instant::now();
        }
    }

    fn rename(&self, from: &CacheKey, to: &CacheKey) {
        let mut inner = self.lock();
        let entry = match tier(&mut inner, from).remove(from) {
            Some(entry) => entry,
            None => return,
        };
        let dest = tier(&mut inner, to);
        dest.remove(to);
        dest.insert(to.clone(), entry);
        self.sweep(&mut inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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
    fn test_tiers_do_not_alias() {
        let cache = TieredFolderCache::new(4, Duration::from_secs(60));
        let active = CacheKey::active("acct", "INBOX");
        let parked = CacheKey::parked("acct", "INBOX");
        cache.put(&active, &state("active-copy"));
        assert!(cache.get(&parked).is_none());
        assert_eq!(cache.get(&active).unwrap().path(), "active-copy");
    }

    #[test]
    fn test_park_moves_between_tiers() {
        let cache = TieredFolderCache::new(4, Duration::from_secs(60));
        let active = CacheKey::active("acct", "INBOX");
        let parked = CacheKey::parked("acct", "INBOX");
        cache.put(&active, &state("INBOX"));
        cache.rename(&active, &parked);
        assert!(cache.get(&active).is_none());
        assert_eq!(cache.get(&parked).unwrap().path(), "INBOX");
    }

    #[test]
    fn test_active_entries_survive_parked_pressure() {
        let cache = TieredFolderCache::new(1, Duration::from_secs(60));
        let active = CacheKey::active("acct", "INBOX");
        cache.put(&active, &state("INBOX"));
        // Overflow the parked tier; the active entry must be untouched.
        cache.put(&CacheKey::parked("acct", "one"), &state("one"));
        cache.put(&CacheKey::parked("acct", "two"), &state("two"));
        assert!(cache.get(&active).is_some());
        let survivors = [
            cache.get(&CacheKey::parked("acct", "one")).is_some(),
            cache.get(&CacheKey::parked("acct", "two")).is_some(),
        ];
        assert_eq!(survivors.iter().filter(|s| **s).count(), 1);
    }

    #[test]
    fn test_expired_active_entry_is_swept() {
        let cache = TieredFolderCache::new(4, Duration::from_millis(0));
        let active = CacheKey::active("acct", "INBOX");
        cache.put(&active, &state("INBOX"));
        // A zero TTL expires immediately; the next write sweeps it.
        cache.put(&CacheKey::parked("acct", "other"), &state("other"));
        assert!(cache.get(&active).is_none());
    }
}
