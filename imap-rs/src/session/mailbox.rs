//! Mailbox-store collaborator: the interface sessions use to read and
//! mutate folders, and the change-notification types stores emit.

use crate::command::{SearchCriteria, StoreAction};
use crate::error::{ImapError, Result};
use crate::proto::fetch::MessageData;
use crate::proto::flags::{Flags, SystemFlag};
use crate::proto::response::{AppendUid, CopyUid};
use crate::proto::types::Literal;
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// One message as the store sees it. The item id doubles as the UID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailboxItem {
    pub id: u32,
    pub flags: Flags,
    pub modseq: u64,
}

/// Point-in-time view of a folder, used to build fresh paged state.
#[derive(Debug, Clone)]
pub struct FolderSnapshot {
    pub path: String,
    pub uidvalidity: u32,
    pub uid_next: u32,
    pub highest_modseq: u64,
    /// Items in ascending id order.
    pub items: Vec<MailboxItem>,
    /// Items with an id at or above this boundary count as RECENT.
    pub recent_cutoff: u32,
    pub read_only: bool,
}

/// A single change to a folder.
#[derive(Debug, Clone, PartialEq)]
pub enum MailboxChange {
    Created(MailboxItem),
    Modified(MailboxItem),
    /// The item left the folder (deleted or moved away).
    Removed(u32),
}

impl MailboxChange {
    pub fn item_id(&self) -> u32 {
        match self {
            MailboxChange::Created(item) | MailboxChange::Modified(item) => item.id,
            MailboxChange::Removed(id) => *id,
        }
    }
}

/// A change stamped with the store's change sequence. Events for one folder
/// arrive in nondecreasing change-id order.
#[derive(Debug, Clone, PartialEq)]
pub struct MailboxEvent {
    pub change_id: u64,
    pub change: MailboxChange,
}

/// One folder in a LIST/LSUB result.
#[derive(Debug, Clone, PartialEq)]
pub struct FolderInfo {
    pub path: String,
    pub delimiter: Option<char>,
    pub selectable: bool,
    pub has_children: bool,
}

/// A message to append, already parsed off the wire.
pub struct AppendItem {
    pub flags: Flags,
    pub date: Option<DateTime<FixedOffset>>,
    pub body: Literal,
}

/// STATUS counters for a folder.
#[derive(Debug, Clone, Copy, Default)]
pub struct FolderStatus {
    pub messages: u32,
    pub recent: u32,
    pub unseen: u32,
    pub uid_next: u32,
    pub uidvalidity: u32,
}

/// Backing store for an account's folders. Implementations may be local or
/// proxy to a remote server through the request/response engine.
pub trait MailboxStore: Send {
    fn snapshot(&self, account_id: &str, path: &str) -> Result<FolderSnapshot>;

    fn list(&self, account_id: &str, reference: &str, pattern: &str) -> Result<Vec<FolderInfo>>;

    fn status(&self, account_id: &str, path: &str) -> Result<FolderStatus>;

    fn create_folder(&mut self, account_id: &str, path: &str) -> Result<()>;

    fn delete_folder(&mut self, account_id: &str, path: &str) -> Result<()>;

    fn rename_folder(&mut self, account_id: &str, from: &str, to: &str) -> Result<()>;

    /// Append messages; returns the UIDPLUS result for the batch.
    fn append(&mut self, account_id: &str, path: &str, items: Vec<AppendItem>)
        -> Result<AppendUid>;

    /// Apply a flag change to the given UIDs; returns the updated items.
    fn store_flags(
        &mut self,
        account_id: &str,
        path: &str,
        uids: &[u32],
        action: StoreAction,
        flags: &Flags,
    ) -> Result<Vec<MailboxItem>>;

    fn copy(
        &mut self,
        account_id: &str,
        from_path: &str,
        uids: &[u32],
        to_path: &str,
    ) -> Result<CopyUid>;

    /// Remove \Deleted messages; returns the UIDs removed.
    fn expunge(&mut self, account_id: &str, path: &str) -> Result<Vec<u32>>;

    fn search(&self, account_id: &str, path: &str, criteria: &SearchCriteria) -> Result<Vec<u32>>;

    /// Message data for the given UIDs, in ascending UID order.
    fn fetch(
        &self,
        account_id: &str,
        path: &str,
        uids: &[u32],
    ) -> Result<Vec<crate::proto::fetch::MessageData>>;

    /// Persist the RECENT high-water boundary on folder close.
    fn set_recent_cutoff(&mut self, account_id: &str, path: &str, cutoff: u32) -> Result<()>;

    /// Drain change events for a folder with change ids above
    /// `after_change_id`.
    fn poll_events(
        &mut self,
        account_id: &str,
        path: &str,
        after_change_id: u64,
    ) -> Result<Vec<MailboxEvent>>;
}

struct StoredMessage {
    item: MailboxItem,
    internal_date: DateTime<FixedOffset>,
    body: Vec<u8>,
}

struct FolderData {
    uidvalidity: u32,
    uid_next: u32,
    change_seq: u64,
    recent_cutoff: u32,
    messages: Vec<StoredMessage>,
    events: Vec<MailboxEvent>,
}

impl FolderData {
    fn new(uidvalidity: u32) -> Self {
        FolderData {
            uidvalidity,
            uid_next: 1,
            change_seq: 1,
            recent_cutoff: 1,
            messages: Vec::new(),
            events: Vec::new(),
        }
    }

    fn record(&mut self, change: MailboxChange) {
        self.change_seq += 1;
        self.events.push(MailboxEvent {
            change_id: self.change_seq,
            change,
        });
    }
}

/// In-process store backing local accounts and the test suites.
#[derive(Default)]
pub struct InMemoryMailboxStore {
    folders: HashMap<(String, String), FolderData>,
    next_uidvalidity: u32,
}

impl InMemoryMailboxStore {
    pub fn new() -> Self {
        InMemoryMailboxStore {
            folders: HashMap::new(),
            next_uidvalidity: 1000,
        }
    }

    /// Create the account's default folder set.
    pub fn provision(&mut self, account_id: &str) {
        for path in ["INBOX", "Sent", "Drafts", "Trash"] {
            let _ = self.create_folder(account_id, path);
        }
    }

    /// Deliver a message directly, producing a change event as an external
    /// delivery would.
    pub fn deliver(&mut self, account_id: &str, path: &str, body: &[u8]) -> Result<u32> {
        let folder = self.folder_mut(account_id, path)?;
        let uid = folder.uid_next;
        folder.uid_next += 1;
        let item = MailboxItem {
            id: uid,
            flags: Flags::new(),
            modseq: folder.change_seq + 1,
        };
        folder.messages.push(StoredMessage {
            item: item.clone(),
            internal_date: Utc::now().fixed_offset(),
            body: body.to_vec(),
        });
        folder.record(MailboxChange::Created(item));
        Ok(uid)
    }

    fn folder(&self, account_id: &str, path: &str) -> Result<&FolderData> {
        self.folders
            .get(&(account_id.to_string(), path.to_string()))
            .ok_or_else(|| ImapError::Store(format!("no such folder {path:?}")))
    }

    fn folder_mut(&mut self, account_id: &str, path: &str) -> Result<&mut FolderData> {
        self.folders
            .get_mut(&(account_id.to_string(), path.to_string()))
            .ok_or_else(|| ImapError::Store(format!("no such folder {path:?}")))
    }
}

fn body_contains(body: &[u8], needle: &str) -> bool {
    let haystack = String::from_utf8_lossy(body).to_ascii_lowercase();
    haystack.contains(&needle.to_ascii_lowercase())
}

fn header_contains(body: &[u8], header: &str, needle: &str) -> bool {
    let text = String::from_utf8_lossy(body);
    let headers = text.split("\r\n\r\n").next().unwrap_or("");
    headers.lines().any(|line| {
        line.len() > header.len()
            && line[..header.len()].eq_ignore_ascii_case(header)
            && line[header.len()..].starts_with(':')
            && line.to_ascii_lowercase().contains(&needle.to_ascii_lowercase())
    })
}

impl MailboxStore for InMemoryMailboxStore {
    fn snapshot(&self, account_id: &str, path: &str) -> Result<FolderSnapshot> {
        let folder = self.folder(account_id, path)?;
        Ok(FolderSnapshot {
            path: path.to_string(),
            uidvalidity: folder.uidvalidity,
            uid_next: folder.uid_next,
            highest_modseq: folder.change_seq,
            items: folder.messages.iter().map(|m| m.item.clone()).collect(),
            recent_cutoff: folder.recent_cutoff,
            read_only: false,
        })
    }

    fn list(&self, account_id: &str, reference: &str, pattern: &str) -> Result<Vec<FolderInfo>> {
        let prefix = reference.to_string();
        let mut out: Vec<FolderInfo> = self
            .folders
            .keys()
            .filter(|(acct, _)| acct == account_id)
            .filter(|(_, path)| path.starts_with(&prefix) && pattern_matches(pattern, path))
            .map(|(_, path)| FolderInfo {
                path: path.clone(),
                delimiter: Some('/'),
                selectable: true,
                has_children: self
                    .folders
                    .keys()
                    .any(|(a, p)| a == account_id && p.starts_with(&format!("{}/", path))),
            })
            .collect();
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    fn status(&self, account_id: &str, path: &str) -> Result<FolderStatus> {
        let folder = self.folder(account_id, path)?;
        Ok(FolderStatus {
            messages: folder.messages.len() as u32,
            recent: folder
                .messages
                .iter()
                .filter(|m| m.item.id >= folder.recent_cutoff)
                .count() as u32,
            unseen: folder
                .messages
                .iter()
                .filter(|m| !m.item.flags.contains(SystemFlag::Seen))
                .count() as u32,
            uid_next: folder.uid_next,
            uidvalidity: folder.uidvalidity,
        })
    }

    fn create_folder(&mut self, account_id: &str, path: &str) -> Result<()> {
        let key = (account_id.to_string(), path.to_string());
        if self.folders.contains_key(&key) {
            return Err(ImapError::Store(format!("folder {path:?} already exists")));
        }
        self.next_uidvalidity += 1;
        self.folders.insert(key, FolderData::new(self.next_uidvalidity));
        Ok(())
    }

    fn delete_folder(&mut self, account_id: &str, path: &str) -> Result<()> {
        self.folders
            .remove(&(account_id.to_string(), path.to_string()))
            .map(|_| ())
            .ok_or_else(|| ImapError::Store(format!("no such folder {path:?}")))
    }

    fn rename_folder(&mut self, account_id: &str, from: &str, to: &str) -> Result<()> {
        let data = self
            .folders
            .remove(&(account_id.to_string(), from.to_string()))
            .ok_or_else(|| ImapError::Store(format!("no such folder {from:?}")))?;
        self.folders.insert((account_id.to_string(), to.to_string()), data);
        Ok(())
    }

    fn append(
        &mut self,
        account_id: &str,
        path: &str,
        items: Vec<AppendItem>,
    ) -> Result<AppendUid> {
        let folder = self.folder_mut(account_id, path)?;
        let uidvalidity = folder.uidvalidity;
        let mut uids = Vec::with_capacity(items.len());
        for entry in items {
            let uid = folder.uid_next;
            folder.uid_next += 1;
            let item = MailboxItem {
                id: uid,
                flags: entry.flags.clone(),
                modseq: folder.change_seq + 1,
            };
            folder.messages.push(StoredMessage {
                item: item.clone(),
                internal_date: entry.date.unwrap_or_else(|| Utc::now().fixed_offset()),
                body: entry.body.into_bytes()?,
            });
            folder.record(MailboxChange::Created(item));
            uids.push(uid);
        }
        Ok(AppendUid { uidvalidity, uids })
    }

    fn store_flags(
        &mut self,
        account_id: &str,
        path: &str,
        uids: &[u32],
        action: StoreAction,
        flags: &Flags,
    ) -> Result<Vec<MailboxItem>> {
        let folder = self.folder_mut(account_id, path)?;
        let mut updated = Vec::new();
        for message in folder.messages.iter_mut() {
            if !uids.contains(&message.item.id) {
                continue;
            }
            match action {
                StoreAction::Replace => message.item.flags = flags.clone(),
                StoreAction::Add => {
                    for name in flags.iter_names() {
                        message.item.flags.set_by_name(name);
                    }
                }
                StoreAction::Remove => {
                    for sys in SystemFlag::ALL {
                        if flags.contains(sys) {
                            message.item.flags.unset(sys);
                        }
                    }
                    for kw in flags.keyword_atoms() {
                        message.item.flags.unset_keyword(kw.as_str());
                    }
                }
            }
            message.item.modseq = folder.change_seq + 1;
            updated.push(message.item.clone());
        }
        for item in &updated {
            folder.record(MailboxChange::Modified(item.clone()));
        }
        Ok(updated)
    }

    fn copy(
        &mut self,
        account_id: &str,
        from_path: &str,
        uids: &[u32],
        to_path: &str,
    ) -> Result<CopyUid> {
        let copies: Vec<(Flags, DateTime<FixedOffset>, Vec<u8>)> = {
            let source = self.folder(account_id, from_path)?;
            source
                .messages
                .iter()
                .filter(|m| uids.contains(&m.item.id))
                .map(|m| (m.item.flags.clone(), m.internal_date, m.body.clone()))
                .collect()
        };
        if copies.len() != uids.len() {
            return Err(ImapError::Store("some messages no longer exist".into()));
        }
        let dest = self.folder_mut(account_id, to_path)?;
        let uidvalidity = dest.uidvalidity;
        let mut to = Vec::with_capacity(copies.len());
        for (flags, internal_date, body) in copies {
            let uid = dest.uid_next;
            dest.uid_next += 1;
            let item = MailboxItem {
                id: uid,
                flags,
                modseq: dest.change_seq + 1,
            };
            dest.messages.push(StoredMessage {
                item: item.clone(),
                internal_date,
                body,
            });
            dest.record(MailboxChange::Created(item));
            to.push(uid);
        }
        Ok(CopyUid {
            uidvalidity,
            from: uids.to_vec(),
            to,
        })
    }

    fn expunge(&mut self, account_id: &str, path: &str) -> Result<Vec<u32>> {
        let folder = self.folder_mut(account_id, path)?;
        let mut removed = Vec::new();
        folder.messages.retain(|m| {
            if m.item.flags.contains(SystemFlag::Deleted) {
                removed.push(m.item.id);
                false
            } else {
                true
            }
        });
        for uid in &removed {
            folder.record(MailboxChange::Removed(*uid));
        }
        Ok(removed)
    }

    fn search(&self, account_id: &str, path: &str, criteria: &SearchCriteria) -> Result<Vec<u32>> {
        let folder = self.folder(account_id, path)?;
        let matches = |m: &StoredMessage| match criteria {
            SearchCriteria::All | SearchCriteria::Raw(_) => true,
            SearchCriteria::Unseen => !m.item.flags.contains(SystemFlag::Seen),
            SearchCriteria::Deleted => m.item.flags.contains(SystemFlag::Deleted),
            SearchCriteria::Subject(s) => header_contains(&m.body, "Subject", s),
            SearchCriteria::From(s) => header_contains(&m.body, "From", s),
            SearchCriteria::To(s) => header_contains(&m.body, "To", s),
            SearchCriteria::Text(s) => body_contains(&m.body, s),
        };
        Ok(folder
            .messages
            .iter()
            .filter(|m| matches(m))
            .map(|m| m.item.id)
            .collect())
    }

    fn fetch(&self, account_id: &str, path: &str, uids: &[u32]) -> Result<Vec<MessageData>> {
        let folder = self.folder(account_id, path)?;
        let mut out = Vec::new();
        for message in &folder.messages {
            if !uids.contains(&message.item.id) {
                continue;
            }
            let mut data = MessageData::new();
            data.uid = Some(message.item.id);
            data.modseq = Some(message.item.modseq);
            data.flags = Some(message.item.flags.clone());
            data.internal_date = Some(message.internal_date);
            data.rfc822_size = Some(message.body.len() as u64);
            let text = String::from_utf8_lossy(&message.body);
            let (headers, body) = match text.split_once("\r\n\r\n") {
                Some((h, b)) => (format!("{}\r\n\r\n", h), b.to_string()),
                None => (text.to_string(), String::new()),
            };
            data.sections.insert(String::new(), message.body.clone());
            data.sections.insert("HEADER".into(), headers.into_bytes());
            data.sections.insert("TEXT".into(), body.into_bytes());
            out.push(data);
        }
        Ok(out)
    }

    fn set_recent_cutoff(&mut self, account_id: &str, path: &str, cutoff: u32) -> Result<()> {
        let folder = self.folder_mut(account_id, path)?;
        folder.recent_cutoff = folder.recent_cutoff.max(cutoff);
        Ok(())
    }

    fn poll_events(
        &mut self,
        account_id: &str,
        path: &str,
        after_change_id: u64,
    ) -> Result<Vec<MailboxEvent>> {
        let folder = self.folder_mut(account_id, path)?;
        let drained: Vec<MailboxEvent> = folder
            .events
            .iter()
            .filter(|e| e.change_id > after_change_id)
            .cloned()
            .collect();
        // Each session filters by its own change-id position; the shared log
        // just needs a bound.
        if folder.events.len() > 1024 {
            let excess = folder.events.len() - 1024;
            folder.events.drain(..excess);
        }
        Ok(drained)
    }
}

/// LIST pattern match: `*` spans delimiters, `%` does not.
/// Clonable handle that shares one store across connections. Every call
/// takes the store mutex, so command execution serializes at the store.
pub struct SharedMailboxStore<S: MailboxStore>(Arc<Mutex<S>>);

impl<S: MailboxStore> SharedMailboxStore<S> {
    pub fn new(store: S) -> Self {
        SharedMailboxStore(Arc::new(Mutex::new(store)))
    }

    pub fn with<T>(&self, f: impl FnOnce(&mut S) -> T) -> T {
        f(&mut self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, S> {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<S: MailboxStore> Clone for SharedMailboxStore<S> {
    fn clone(&self) -> Self {
        SharedMailboxStore(Arc::clone(&self.0))
    }
}

impl<S: MailboxStore> MailboxStore for SharedMailboxStore<S> {
    fn snapshot(&self, account_id: &str, path: &str) -> Result<FolderSnapshot> {
        self.lock().snapshot(account_id, path)
    }

    fn list(&self, account_id: &str, reference: &str, pattern: &str) -> Result<Vec<FolderInfo>> {
        self.lock().list(account_id, reference, pattern)
    }

    fn status(&self, account_id: &str, path: &str) -> Result<FolderStatus> {
        self.lock().status(account_id, path)
    }

    fn create_folder(&mut self, account_id: &str, path: &str) -> Result<()> {
        self.lock().create_folder(account_id, path)
    }

    fn delete_folder(&mut self, account_id: &str, path: &str) -> Result<()> {
        self.lock().delete_folder(account_id, path)
    }

    fn rename_folder(&mut self, account_id: &str, from: &str, to: &str) -> Result<()> {
        self.lock().rename_folder(account_id, from, to)
    }

    fn append(
        &mut self,
        account_id: &str,
        path: &str,
        items: Vec<AppendItem>,
    ) -> Result<AppendUid> {
        self.lock().append(account_id, path, items)
    }

    fn store_flags(
        &mut self,
        account_id: &str,
        path: &str,
        uids: &[u32],
        action: StoreAction,
        flags: &Flags,
    ) -> Result<Vec<MailboxItem>> {
        self.lock().store_flags(account_id, path, uids, action, flags)
    }

    fn copy(
        &mut self,
        account_id: &str,
        from_path: &str,
        uids: &[u32],
        to_path: &str,
    ) -> Result<CopyUid> {
        self.lock().copy(account_id, from_path, uids, to_path)
    }

    fn expunge(&mut self, account_id: &str, path: &str) -> Result<Vec<u32>> {
        self.lock().expunge(account_id, path)
    }

    fn search(&self, account_id: &str, path: &str, criteria: &SearchCriteria) -> Result<Vec<u32>> {
        self.lock().search(account_id, path, criteria)
    }

    fn fetch(&self, account_id: &str, path: &str, uids: &[u32]) -> Result<Vec<MessageData>> {
        self.lock().fetch(account_id, path, uids)
    }

    fn set_recent_cutoff(&mut self, account_id: &str, path: &str, cutoff: u32) -> Result<()> {
        self.lock().set_recent_cutoff(account_id, path, cutoff)
    }

    fn poll_events(
        &mut self,
        account_id: &str,
        path: &str,
        after_change_id: u64,
    ) -> Result<Vec<MailboxEvent>> {
        self.lock().poll_events(account_id, path, after_change_id)
    }
}

pub fn pattern_matches(pattern: &str, path: &str) -> bool {
    fn matches(p: &[u8], s: &[u8]) -> bool {
        match (p.first(), s.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                matches(&p[1..], s) || (!s.is_empty() && matches(p, &s[1..]))
            }
            (Some(b'%'), _) => {
                matches(&p[1..], s)
                    || (!s.is_empty() && s[0] != b'/' && matches(p, &s[1..]))
            }
            (Some(pc), Some(sc)) if pc.eq_ignore_ascii_case(sc) => matches(&p[1..], &s[1..]),
            _ => false,
        }
    }
    matches(pattern.as_bytes(), path.as_bytes())
}
