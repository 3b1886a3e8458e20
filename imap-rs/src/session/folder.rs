//! Paged folder state: the sequence-number view of a selected folder, plus
//! the pending-notification queue that keeps that view stable mid-command.
//!
//! Sequence numbers (MSNs) are positions in `items` plus one. Items stay in
//! ascending id order; new ids are only ever appended, and a store that
//! reports an id ordered before an already-mapped one has broken the
//! numbering contract, which is fatal for the session.

use crate::error::{ImapError, Result};
use crate::proto::flags::{Flags, SystemFlag};
use crate::proto::response::{Response, UntaggedResponse};
use crate::session::mailbox::{FolderSnapshot, MailboxChange, MailboxEvent, MailboxItem};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Serialize, Deserialize)]
pub struct PagedFolderState {
    path: String,
    uidvalidity: u32,
    uid_next: u32,
    highest_modseq: u64,
    read_only: bool,
    /// Ascending item id; MSN = index + 1.
    items: Vec<MailboxItem>,
    /// Ids at or above this boundary are RECENT for this session.
    recent_cutoff: u32,
    /// Queued change events by change id, merged per item. Never persisted;
    /// a paged-out folder has an empty queue.
    #[serde(skip)]
    pending: BTreeMap<u64, Vec<MailboxChange>>,
}

impl PagedFolderState {
    pub fn from_snapshot(snapshot: FolderSnapshot) -> Self {
        PagedFolderState {
            path: snapshot.path,
            uidvalidity: snapshot.uidvalidity,
            uid_next: snapshot.uid_next,
            highest_modseq: snapshot.highest_modseq,
            read_only: snapshot.read_only,
            items: snapshot.items,
            recent_cutoff: snapshot.recent_cutoff,
            pending: BTreeMap::new(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn uidvalidity(&self) -> u32 {
        self.uidvalidity
    }

    pub fn uid_next(&self) -> u32 {
        self.uid_next
    }

    pub fn highest_modseq(&self) -> u64 {
        self.highest_modseq
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub fn exists(&self) -> u32 {
        self.items.len() as u32
    }

    pub fn recent(&self) -> u32 {
        self.items
            .iter()
            .filter(|i| i.id >= self.recent_cutoff)
            .count() as u32
    }

    /// MSN of the first message without \Seen, if any.
    pub fn first_unseen(&self) -> Option<u32> {
        self.items
            .iter()
            .position(|i| !i.flags.contains(SystemFlag::Seen))
            .map(|idx| idx as u32 + 1)
    }

    pub fn uid_for_msn(&self, msn: u32) -> Option<u32> {
        if msn == 0 {
            return None;
        }
        self.items.get(msn as usize - 1).map(|i| i.id)
    }

    pub fn msn_for_uid(&self, uid: u32) -> Option<u32> {
        self.items
            .binary_search_by_key(&uid, |i| i.id)
            .ok()
            .map(|idx| idx as u32 + 1)
    }

    pub fn item_for_uid(&self, uid: u32) -> Option<&MailboxItem> {
        self.items
            .binary_search_by_key(&uid, |i| i.id)
            .ok()
            .map(|idx| &self.items[idx])
    }

    /// Adopt the store's current RECENT boundary. Used when a parked copy
    /// is reactivated after another session moved the boundary.
    pub fn refresh_recent_cutoff(&mut self, cutoff: u32) {
        self.recent_cutoff = self.recent_cutoff.max(cutoff);
    }

    /// RECENT high-water boundary to persist when the folder is closed
    /// read-write; everything this session has seen stops being recent.
    pub fn close_cutoff(&self) -> u32 {
        self.uid_next
    }

    /// Resolve a raw sequence set (`2`, `2:4`, `1,3:*`, `*`) to UIDs.
    /// In MSN mode the elements index the current view; in UID mode they
    /// are UIDs directly and unmatched ones are skipped.
    pub fn resolve_sequence(&self, set: &str, uid_mode: bool) -> Result<Vec<u32>> {
        let max = if uid_mode {
            self.items.last().map(|i| i.id).unwrap_or(0)
        } else {
            self.items.len() as u32
        };
        let mut out = Vec::new();
        for part in set.split(',') {
            let (lo, hi) = match part.split_once(':') {
                Some((a, b)) => (
                    Self::sequence_element(a, max)?,
                    Self::sequence_element(b, max)?,
                ),
                None => {
                    let n = Self::sequence_element(part, max)?;
                    (n, n)
                }
            };
            let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
            for n in lo..=hi {
                if uid_mode {
                    if self.msn_for_uid(n).is_some() {
                        out.push(n);
                    }
                } else if let Some(uid) = self.uid_for_msn(n) {
                    out.push(uid);
                } else {
                    return Err(ImapError::syntax(format!(
                        "sequence number {} out of range",
                        n
                    )));
                }
            }
        }
        out.sort_unstable();
        out.dedup();
        Ok(out)
    }

    fn sequence_element(token: &str, max: u32) -> Result<u32> {
        if token == "*" {
            if max == 0 {
                return Err(ImapError::syntax("'*' in an empty folder"));
            }
            return Ok(max);
        }
        let n: u32 = token
            .parse()
            .map_err(|_| ImapError::syntax(format!("bad sequence element {token:?}")))?;
        if n == 0 {
            return Err(ImapError::syntax("sequence numbers start at 1"));
        }
        Ok(n)
    }

    /// Queue a change event. Events are applied only at flush points, never
    /// while a command is in flight. Within one change id, later changes to
    /// the same item merge into earlier ones: a create followed by a modify
    /// stays a create with the newer payload, repeated modifies keep the
    /// last, and a removal wins outright.
    pub fn queue_event(&mut self, event: MailboxEvent) {
        let batch = self.pending.entry(event.change_id).or_default();
        let id = event.change.item_id();
        match batch.iter().position(|c| c.item_id() == id) {
            Some(pos) => {
                let merged = match (&batch[pos], event.change) {
                    (MailboxChange::Created(_), MailboxChange::Modified(item)) => {
                        MailboxChange::Created(item)
                    }
                    (_, incoming) => incoming,
                };
                batch[pos] = merged;
            }
            None => batch.push(event.change),
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Apply all queued changes in increasing change-id order, producing the
    /// untagged responses the client must see. The queue is discarded as it
    /// is applied.
    pub fn flush(&mut self) -> Result<Vec<Response>> {
        let mut responses = Vec::new();
        let mut created = false;
        let pending = std::mem::take(&mut self.pending);
        for (change_id, batch) in pending {
            for change in batch {
                match change {
                    MailboxChange::Removed(id) => {
                        if let Some(msn) = self.msn_for_uid(id) {
                            self.items.remove(msn as usize - 1);
                            responses.push(Response::Untagged(UntaggedResponse::Expunge(msn)));
                        }
                    }
                    MailboxChange::Created(item) => {
                        self.insert_item(item)?;
                        created = true;
                    }
                    MailboxChange::Modified(item) => {
                        match self.msn_for_uid(item.id) {
                            Some(msn) => {
                                let idx = msn as usize - 1;
                                // An equal modseq is this session's own
                                // change echoed back; already applied and
                                // already reported.
                                if self.items[idx].modseq >= item.modseq {
                                    continue;
                                }
                                self.items[idx] = item.clone();
                                responses.push(Response::Untagged(UntaggedResponse::Fetch(
                                    msn,
                                    format!("FLAGS {} UID {}", item.flags.encode(), item.id),
                                )));
                            }
                            // A previously numbered id left the folder
                            // before this flush; its trailing modify is
                            // stale.
                            None if item.id < self.uid_next => {
                                debug!(folder = %self.path, uid = item.id, "stale modify dropped");
                            }
                            // Modified into the folder (moved in): numbers
                            // like a create.
                            None => {
                                self.insert_item(item)?;
                                created = true;
                            }
                        }
                    }
                }
            }
            self.highest_modseq = self.highest_modseq.max(change_id);
        }
        if created {
            responses.push(Response::Untagged(UntaggedResponse::Exists(self.exists())));
            responses.push(Response::Untagged(UntaggedResponse::Recent(self.recent())));
        }
        Ok(responses)
    }

    fn insert_item(&mut self, item: MailboxItem) -> Result<()> {
        if let Some(last) = self.items.last() {
            if item.id <= last.id {
                // Already mapped ids would have to renumber; the view can no
                // longer be trusted.
                return Err(ImapError::RenumberingInconsistency(format!(
                    "item {} arrived after item {} was already numbered",
                    item.id, last.id
                )));
            }
        }
        self.uid_next = self.uid_next.max(item.id + 1);
        debug!(folder = %self.path, uid = item.id, "new message numbered");
        self.items.push(item);
        Ok(())
    }

    /// Quietly update a known item, without emitting responses. Used after
    /// this session's own STORE, where the tagged path reports the change.
    pub fn update_item(&mut self, item: &MailboxItem) {
        if let Ok(idx) = self.items.binary_search_by_key(&item.id, |i| i.id) {
            self.items[idx] = item.clone();
        }
    }

    /// Remove the given UIDs, returning EXPUNGE responses with MSNs
    /// recomputed as each removal lands.
    pub fn expunge_uids(&mut self, uids: &[u32]) -> Vec<Response> {
        let mut responses = Vec::new();
        for uid in uids {
            if let Some(msn) = self.msn_for_uid(*uid) {
                self.items.remove(msn as usize - 1);
                responses.push(Response::Untagged(UntaggedResponse::Expunge(msn)));
            }
        }
        responses
    }

    /// Aggregate flags in use across the folder, for the SELECT FLAGS
    /// response.
    pub fn folder_flags(&self) -> Flags {
        let mut flags = Flags::new();
        for sys in SystemFlag::ALL {
            flags.set(sys);
        }
        for item in &self.items {
            for kw in item.flags.keyword_atoms() {
                flags.set_keyword(kw.as_str());
            }
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: u32, flags: Flags) -> MailboxItem {
        MailboxItem {
            id,
            flags,
            modseq: id as u64,
        }
    }

    fn seen() -> Flags {
        let mut f = Flags::new();
        f.set(SystemFlag::Seen);
        f
    }

    fn snapshot(ids: &[u32], recent_cutoff: u32) -> FolderSnapshot {
        FolderSnapshot {
            path: "INBOX".into(),
            uidvalidity: 100,
            uid_next: ids.last().map(|i| i + 1).unwrap_or(1),
            highest_modseq: 10,
            items: ids.iter().map(|&id| item(id, Flags::new())).collect(),
            recent_cutoff,
            read_only: false,
        }
    }

    #[test]
    fn test_msn_uid_mapping() {
        let state = PagedFolderState::from_snapshot(snapshot(&[3, 7, 9], 0));
        assert_eq!(state.exists(), 3);
        assert_eq!(state.msn_for_uid(7), Some(2));
        assert_eq!(state.uid_for_msn(3), Some(9));
        assert_eq!(state.msn_for_uid(5), None);
    }

    #[test]
    fn test_resolve_sequence_msn_mode() {
        let state = PagedFolderState::from_snapshot(snapshot(&[3, 7, 9], 0));
        assert_eq!(state.resolve_sequence("1:2", false).unwrap(), vec![3, 7]);
        assert_eq!(state.resolve_sequence("*", false).unwrap(), vec![9]);
        assert_eq!(state.resolve_sequence("1,3", false).unwrap(), vec![3, 9]);
    }

    #[test]
    fn test_resolve_sequence_uid_mode_skips_gaps() {
        let state = PagedFolderState::from_snapshot(snapshot(&[3, 7, 9], 0));
        assert_eq!(state.resolve_sequence("3:9", true).unwrap(), vec![3, 7, 9]);
        assert_eq!(state.resolve_sequence("4:6", true).unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn test_out_of_range_msn_rejected() {
        let state = PagedFolderState::from_snapshot(snapshot(&[3], 0));
        assert!(state.resolve_sequence("2", false).is_err());
    }

    #[test]
    fn test_queued_create_applies_on_flush_only() {
        let mut state = PagedFolderState::from_snapshot(snapshot(&[3, 7], 0));
        state.queue_event(MailboxEvent {
            change_id: 11,
            change: MailboxChange::Created(item(10, Flags::new())),
        });
        assert_eq!(state.exists(), 2);

        let responses = state.flush().unwrap();
        assert_eq!(state.exists(), 3);
        assert_eq!(state.msn_for_uid(10), Some(3));
        assert!(responses.contains(&Response::Untagged(UntaggedResponse::Exists(3))));
    }

    #[test]
    fn test_create_then_modify_merges_to_create() {
        let mut state = PagedFolderState::from_snapshot(snapshot(&[3], 0));
        state.queue_event(MailboxEvent {
            change_id: 11,
            change: MailboxChange::Created(item(10, Flags::new())),
        });
        state.queue_event(MailboxEvent {
            change_id: 11,
            change: MailboxChange::Modified(item(10, seen())),
        });
        let responses = state.flush().unwrap();
        // One EXISTS, no FETCH: the modify folded into the create.
        assert!(responses
            .iter()
            .all(|r| !matches!(r, Response::Untagged(UntaggedResponse::Fetch(..)))));
        assert!(state.item_for_uid(10).unwrap().flags.contains(SystemFlag::Seen));
    }

    #[test]
    fn test_modify_emits_fetch_flags() {
        let mut state = PagedFolderState::from_snapshot(snapshot(&[3, 7], 0));
        state.queue_event(MailboxEvent {
            change_id: 12,
            change: MailboxChange::Modified(MailboxItem {
                id: 7,
                flags: seen(),
                modseq: 12,
            }),
        });
        let responses = state.flush().unwrap();
        assert_eq!(responses.len(), 1);
        match &responses[0] {
            Response::Untagged(UntaggedResponse::Fetch(2, data)) => {
                assert!(data.contains("\\Seen"));
                assert!(data.contains("UID 7"));
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn test_own_modify_echo_is_suppressed() {
        let mut state = PagedFolderState::from_snapshot(snapshot(&[3, 7], 0));
        // The session already applied this change through its STORE path.
        state.update_item(&MailboxItem {
            id: 7,
            flags: seen(),
            modseq: 12,
        });
        state.queue_event(MailboxEvent {
            change_id: 12,
            change: MailboxChange::Modified(MailboxItem {
                id: 7,
                flags: seen(),
                modseq: 12,
            }),
        });
        let responses = state.flush().unwrap();
        assert!(responses.is_empty());
        assert_eq!(state.highest_modseq(), 12);
    }

    #[test]
    fn test_stale_modify_after_local_expunge_is_dropped() {
        let mut state = PagedFolderState::from_snapshot(snapshot(&[3, 7], 0));
        state.expunge_uids(&[7]);
        state.queue_event(MailboxEvent {
            change_id: 12,
            change: MailboxChange::Modified(MailboxItem {
                id: 7,
                flags: seen(),
                modseq: 12,
            }),
        });
        let responses = state.flush().unwrap();
        assert!(responses.is_empty());
        assert_eq!(state.exists(), 1);
    }

    #[test]
    fn test_removal_emits_expunge_and_renumbers() {
        let mut state = PagedFolderState::from_snapshot(snapshot(&[3, 7, 9], 0));
        state.queue_event(MailboxEvent {
            change_id: 13,
            change: MailboxChange::Removed(7),
        });
        let responses = state.flush().unwrap();
        assert_eq!(
            responses,
            vec![Response::Untagged(UntaggedResponse::Expunge(2))]
        );
        // 9 moved down into the vacated slot.
        assert_eq!(state.msn_for_uid(9), Some(2));
    }

    #[test]
    fn test_changes_apply_in_change_id_order() {
        let mut state = PagedFolderState::from_snapshot(snapshot(&[3], 0));
        state.queue_event(MailboxEvent {
            change_id: 20,
            change: MailboxChange::Created(item(11, Flags::new())),
        });
        state.queue_event(MailboxEvent {
            change_id: 15,
            change: MailboxChange::Created(item(10, Flags::new())),
        });
        state.flush().unwrap();
        assert_eq!(state.msn_for_uid(10), Some(2));
        assert_eq!(state.msn_for_uid(11), Some(3));
        assert_eq!(state.highest_modseq(), 20);
    }

    #[test]
    fn test_out_of_order_id_is_fatal() {
        let mut state = PagedFolderState::from_snapshot(snapshot(&[3, 9], 0));
        state.queue_event(MailboxEvent {
            change_id: 14,
            change: MailboxChange::Created(item(5, Flags::new())),
        });
        let err = state.flush().unwrap_err();
        assert!(matches!(err, ImapError::RenumberingInconsistency(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_recent_counts_from_cutoff() {
        let state = PagedFolderState::from_snapshot(snapshot(&[3, 7, 9], 8));
        assert_eq!(state.recent(), 1);
        assert_eq!(state.close_cutoff(), 10);
    }

    #[test]
    fn test_expunge_uids_renumbers_progressively() {
        let mut state = PagedFolderState::from_snapshot(snapshot(&[3, 7, 9], 0));
        let responses = state.expunge_uids(&[3, 9]);
        // After removing MSN 1, former MSN 3 is MSN 2.
        assert_eq!(
            responses,
            vec![
                Response::Untagged(UntaggedResponse::Expunge(1)),
                Response::Untagged(UntaggedResponse::Expunge(2)),
            ]
        );
        assert_eq!(state.exists(), 1);
    }

    #[test]
    fn test_serde_roundtrip_drops_pending_queue() {
        let mut state = PagedFolderState::from_snapshot(snapshot(&[3, 7], 0));
        state.queue_event(MailboxEvent {
            change_id: 11,
            change: MailboxChange::Created(item(10, Flags::new())),
        });
        let bytes = serde_json::to_vec(&state).unwrap();
        let restored: PagedFolderState = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(restored.exists(), 2);
        assert!(!restored.has_pending());
        assert_eq!(restored.uidvalidity(), 100);
    }
}
