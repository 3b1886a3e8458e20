//! Per-account mutual exclusion for expensive commands.
//!
//! One lock per account id, shared by all of that account's sessions
//! regardless of transport. This is a cooperative fairness mechanism, not a
//! correctness lock: an acquisition timeout rejects the current command and
//! must never corrupt session state.

use crate::error::{ImapError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

struct LockEntry {
    busy: bool,
    last_used: Instant,
}

struct LockState {
    entries: HashMap<String, LockEntry>,
}

/// Table of per-account locks with bounded-timeout acquisition and
/// inactivity reclamation.
pub struct AccountLockTable {
    state: Mutex<LockState>,
    cond: Condvar,
    timeout: Duration,
    reclaim_after: Duration,
}

impl AccountLockTable {
    pub fn new(timeout: Duration, reclaim_after: Duration) -> Self {
        AccountLockTable {
            state: Mutex::new(LockState {
                entries: HashMap::new(),
            }),
            cond: Condvar::new(),
            timeout,
            reclaim_after,
        }
    }

    /// Acquire the lock for `account_id`, blocking up to the configured
    /// timeout. Timing out yields `ImapError::Throttled`.
    pub fn acquire(self: &Arc<Self>, account_id: &str) -> Result<AccountLockGuard> {
        let deadline = Instant::now() + self.timeout;
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        loop {
            let entry = state
                .entries
                .entry(account_id.to_string())
                .or_insert_with(|| LockEntry {
                    busy: false,
                    last_used: Instant::now(),
                });
            if !entry.busy {
                entry.busy = true;
                entry.last_used = Instant::now();
                debug!(account = account_id, "account lock acquired");
                return Ok(AccountLockGuard {
                    table: Arc::clone(self),
                    account_id: account_id.to_string(),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(account = account_id, "account lock acquisition timed out");
                return Err(ImapError::Throttled(format!(
                    "account {} is busy with another expensive command",
                    account_id
                )));
            }
            let (next, timed_out) = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = next;
            if timed_out.timed_out() {
                // Re-check once more; the holder may have released exactly
                // at the deadline.
                continue;
            }
        }
    }

    fn release(&self, account_id: &str) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(entry) = state.entries.get_mut(account_id) {
            entry.busy = false;
            entry.last_used = Instant::now();
        }
        self.cond.notify_all();
    }

    /// Drop idle entries so the table does not grow with the account
    /// population. Busy entries are never reclaimed.
    pub fn reclaim_idle(&self) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let cutoff = self.reclaim_after;
        let before = state.entries.len();
        state
            .entries
            .retain(|_, entry| entry.busy || entry.last_used.elapsed() < cutoff);
        let removed = before - state.entries.len();
        if removed > 0 {
            debug!(removed, "reclaimed idle account-lock entries");
        }
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entries
            .len()
    }
}

/// Held while an expensive command runs; releasing is automatic.
pub struct AccountLockGuard {
    table: Arc<AccountLockTable>,
    account_id: String,
}

impl Drop for AccountLockGuard {
    fn drop(&mut self) {
        self.table.release(&self.account_id);
    }
}
