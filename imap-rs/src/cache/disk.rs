//! Disk-backed folder cache: one JSON file per key. Survives process
//! restarts; `reconcile` turns entries left active by a crash back into
//! parked ones.

use crate::cache::{CacheKey, FolderCache};
use crate::session::folder::PagedFolderState;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

const TMP_SUFFIX: &str = ".tmp";

pub struct DiskFolderCache {
    dir: PathBuf,
    // Serializes rename against put/get; file operations alone are atomic
    // but a park must not interleave with a concurrent put.
    lock: Mutex<()>,
}

impl DiskFolderCache {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        let dir = dir.into();
        if let Err(e) = fs::create_dir_all(&dir) {
            warn!(dir = %dir.display(), error = %e, "cache directory unavailable");
        }
        let cache = DiskFolderCache {
            dir,
            lock: Mutex::new(()),
        };
        cache.reconcile();
        cache
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.encode())
    }

    /// Drop partial writes and park entries a dead process left active.
    pub fn reconcile(&self) {
        let _guard = self.guard();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "cache reconcile skipped");
                return;
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy().into_owned();
            if name.ends_with(TMP_SUFFIX) {
                let _ = fs::remove_file(entry.path());
                continue;
            }
            if let Some(stem) = name.strip_suffix("_a") {
                let parked = self.dir.join(format!("{}_p", stem));
                if parked.exists() {
                    // The parked copy is the one a clean deselect wrote.
                    let _ = fs::remove_file(entry.path());
                } else if let Err(e) = fs::rename(entry.path(), &parked) {
                    debug!(file = name, error = %e, "could not park stale entry");
                }
            }
        }
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let tmp = path.with_file_name(format!(
            "{}{}",
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            TMP_SUFFIX
        ));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)
    }
}

impl FolderCache for DiskFolderCache {
    fn put(&self, key: &CacheKey, state: &PagedFolderState) {
        let bytes = match serde_json::to_vec(state) {
            Ok(b) => b,
            Err(e) => {
                warn!(key = key.encode(), error = %e, "cache serialization failed");
                return;
            }
        };
        let _guard = self.guard();
        let path = self.path_for(key);
        if path.exists() {
            return;
        }
        if let Err(e) = self.write_atomic(&path, &bytes) {
            warn!(key = key.encode(), error = %e, "cache write failed");
        }
    }

    fn get(&self, key: &CacheKey) -> Option<PagedFolderState> {
        let _guard = self.guard();
        let path = self.path_for(key);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(_) => return None,
        };
        match serde_json::from_slice(&bytes) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(key = key.encode(), error = %e, "corrupt cache file dropped");
                let _ = fs::remove_file(&path);
                None
            }
        }
    }

    fn remove(&self, key: &CacheKey) {
        let _guard = self.guard();
        let _ = fs::remove_file(self.path_for(key));
    }

    fn update_access_time(&self, _key: &CacheKey) {
        // Disk entries do not expire; nothing tracks liveness here.
    }

    fn rename(&self, from: &CacheKey, to: &CacheKey) {
        let _guard = self.guard();
        let from_path = self.path_for(from);
        if !from_path.exists() {
            return;
        }
        if let Err(e) = fs::rename(&from_path, self.path_for(to)) {
            warn!(from = from.encode(), to = to.encode(), error = %e, "cache rename failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::mailbox::FolderSnapshot;
    use tempfile::TempDir;

    fn state(path: &str) -> PagedFolderState {
        PagedFolderState::from_snapshot(FolderSnapshot {
            path: path.to_string(),
            uidvalidity: 7,
            uid_next: 12,
            highest_modseq: 3,
            items: Vec::new(),
            recent_cutoff: 12,
            read_only: false,
        })
    }

    #[test]
    fn test_roundtrip_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let key = CacheKey::parked("acct", "INBOX");
        {
            let cache = DiskFolderCache::new(dir.path());
            cache.put(&key, &state("INBOX"));
        }
        let cache = DiskFolderCache::new(dir.path());
        let got = cache.get(&key).unwrap();
        assert_eq!(got.uidvalidity(), 7);
        assert_eq!(got.uid_next(), 12);
    }

    #[test]
    fn test_corrupt_file_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let cache = DiskFolderCache::new(dir.path());
        let key = CacheKey::parked("acct", "INBOX");
        std::fs::write(dir.path().join(key.encode()), b"not json").unwrap();
        assert!(cache.get(&key).is_none());
        // The broken file is gone, so a fresh put succeeds.
        cache.put(&key, &state("INBOX"));
        assert!(cache.get(&key).is_some());
    }

    #[test]
    fn test_reconcile_parks_stale_active_entries() {
        let dir = TempDir::new().unwrap();
        let active = CacheKey::active("acct", "INBOX");
        let parked = CacheKey::parked("acct", "INBOX");
        {
            let cache = DiskFolderCache::new(dir.path());
            cache.put(&active, &state("INBOX"));
        }
        // Simulates a process that died with the folder selected.
        let cache = DiskFolderCache::new(dir.path());
        assert!(cache.get(&active).is_none());
        assert!(cache.get(&parked).is_some());
    }

    #[test]
    fn test_reconcile_drops_partial_writes() {
        let dir = TempDir::new().unwrap();
        let stray = dir.path().join("acct_INBOX_p.tmp");
        std::fs::write(&stray, b"partial").unwrap();
        let _cache = DiskFolderCache::new(dir.path());
        assert!(!stray.exists());
    }
}
