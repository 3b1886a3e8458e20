//! Contract tests every folder-cache backend must satisfy.

use imap_rs::cache::disk::DiskFolderCache;
use imap_rs::cache::memory::MemoryFolderCache;
use imap_rs::cache::remote::{InMemoryByteStore, RemoteFolderCache};
use imap_rs::cache::tiered::TieredFolderCache;
use imap_rs::cache::{CacheKey, FolderCache};
use imap_rs::session::folder::PagedFolderState;
use imap_rs::session::mailbox::{FolderSnapshot, MailboxItem};
use imap_rs::proto::flags::Flags;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn sample_state(path: &str, uids: &[u32]) -> PagedFolderState {
    PagedFolderState::from_snapshot(FolderSnapshot {
        path: path.to_string(),
        uidvalidity: 42,
        uid_next: uids.last().map(|u| u + 1).unwrap_or(1),
        highest_modseq: 9,
        items: uids
            .iter()
            .map(|&id| MailboxItem {
                id,
                flags: Flags::new(),
                modseq: id as u64,
            })
            .collect(),
        recent_cutoff: 1,
        read_only: false,
    })
}

/// The shared backend contract: value fidelity, first-writer-wins puts,
/// removal, and atomic renames that replace the destination.
fn check_contract(cache: &dyn FolderCache) {
    let key = CacheKey::parked("acct", "INBOX");

    assert!(cache.get(&key).is_none());

    cache.put(&key, &sample_state("INBOX", &[3, 7]));
    let got = cache.get(&key).unwrap();
    assert_eq!(got.path(), "INBOX");
    assert_eq!(got.uidvalidity(), 42);
    assert_eq!(got.exists(), 2);
    assert_eq!(got.msn_for_uid(7), Some(2));
    assert_eq!(got.highest_modseq(), 9);

    // First writer wins.
    cache.put(&key, &sample_state("INBOX", &[1]));
    assert_eq!(cache.get(&key).unwrap().exists(), 2);

    // Remove, then the slot is writable again.
    cache.remove(&key);
    assert!(cache.get(&key).is_none());
    cache.put(&key, &sample_state("INBOX", &[1]));
    assert_eq!(cache.get(&key).unwrap().exists(), 1);

    // Rename replaces the destination and vacates the source.
    let active = CacheKey::active("acct", "INBOX");
    cache.remove(&active);
    cache.put(&active, &sample_state("INBOX", &[3, 7, 9]));
    cache.rename(&active, &key);
    assert!(cache.get(&active).is_none());
    assert_eq!(cache.get(&key).unwrap().exists(), 3);

    // Accounts and folders do not collide.
    let other_account = CacheKey::parked("acct-2", "INBOX");
    let other_folder = CacheKey::parked("acct", "Sent");
    assert!(cache.get(&other_account).is_none());
    assert!(cache.get(&other_folder).is_none());

    // Touching an entry never changes its value.
    cache.update_access_time(&key);
    assert_eq!(cache.get(&key).unwrap().exists(), 3);
}

#[test]
fn test_memory_backend_contract() {
    let cache = MemoryFolderCache::new(16, 1 << 20);
    check_contract(&cache);
}

#[test]
fn test_disk_backend_contract() {
    let dir = TempDir::new().unwrap();
    let cache = DiskFolderCache::new(dir.path());
    check_contract(&cache);
}

#[test]
fn test_remote_backend_contract() {
    let cache = RemoteFolderCache::new(Arc::new(InMemoryByteStore::default()));
    check_contract(&cache);
}

#[test]
fn test_tiered_backend_contract() {
    let cache = TieredFolderCache::new(16, Duration::from_secs(300));
    check_contract(&cache);
}

#[test]
fn test_disk_backend_persists_across_instances() {
    let dir = TempDir::new().unwrap();
    let key = CacheKey::parked("acct", "Archive/2024");
    {
        let cache = DiskFolderCache::new(dir.path());
        cache.put(&key, &sample_state("Archive/2024", &[5]));
    }
    let cache = DiskFolderCache::new(dir.path());
    let got = cache.get(&key).unwrap();
    assert_eq!(got.path(), "Archive/2024");
    assert_eq!(got.exists(), 1);
}

#[test]
fn test_pending_notifications_never_survive_caching() {
    use imap_rs::session::mailbox::{MailboxChange, MailboxEvent};

    let cache = MemoryFolderCache::new(16, 1 << 20);
    let key = CacheKey::parked("acct", "INBOX");
    let mut state = sample_state("INBOX", &[3]);
    state.queue_event(MailboxEvent {
        change_id: 10,
        change: MailboxChange::Created(MailboxItem {
            id: 5,
            flags: Flags::new(),
            modseq: 10,
        }),
    });
    cache.put(&key, &state);
    assert!(!cache.get(&key).unwrap().has_pending());
}
