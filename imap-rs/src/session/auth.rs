//! Authentication collaborator and the per-session token cache.

use crate::error::{ImapError, Result};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

/// External authentication authority. Implementations back onto whatever
/// identity system the deployment uses; the session only needs tokens it
/// can hand to remote stores.
pub trait AuthProvider: Send + Sync {
    /// Authenticate a login and return the account id.
    fn authenticate(&self, username: &str, password: &str) -> Result<String>;

    /// Issue a fresh bearer token for an account.
    fn issue(&self, account_id: &str) -> Result<String>;

    /// Check that a previously issued token is still good.
    fn validate(&self, token: &str) -> Result<bool>;
}

const TOKEN_REVALIDATE_AFTER: Duration = Duration::from_secs(60);

struct CachedToken {
    account_id: String,
    token: String,
    checked_at: Instant,
}

/// Small bounded cache of per-account tokens. Tokens are revalidated lazily:
/// a hit older than the revalidation window is verified with the provider
/// before being returned, and dropped if no longer valid.
pub struct TokenCache {
    entries: VecDeque<CachedToken>,
    capacity: usize,
}

impl TokenCache {
    pub fn new(capacity: usize) -> Self {
        TokenCache {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Fetch a token for `account_id`, reusing a cached one when possible.
    pub fn token_for(&mut self, account_id: &str, provider: &dyn AuthProvider) -> Result<String> {
        if let Some(pos) = self
            .entries
            .iter()
            .position(|e| e.account_id == account_id)
        {
            let stale = self.entries[pos].checked_at.elapsed() >= TOKEN_REVALIDATE_AFTER;
            if !stale {
                return Ok(self.entries[pos].token.clone());
            }
            let token = self.entries[pos].token.clone();
            if provider.validate(&token)? {
                self.entries[pos].checked_at = Instant::now();
                return Ok(token);
            }
            debug!(account = account_id, "cached auth token expired");
            self.entries.remove(pos);
        }

        let token = provider.issue(account_id)?;
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(CachedToken {
            account_id: account_id.to_string(),
            token: token.clone(),
            checked_at: Instant::now(),
        });
        Ok(token)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Fixed-credential provider for tests and local development.
pub struct StaticAuthProvider {
    pub username: String,
    pub password: String,
    pub account_id: String,
}

impl AuthProvider for StaticAuthProvider {
    fn authenticate(&self, username: &str, password: &str) -> Result<String> {
        if username == self.username && password == self.password {
            Ok(self.account_id.clone())
        } else {
            Err(ImapError::AuthenticationFailed)
        }
    }

    fn issue(&self, account_id: &str) -> Result<String> {
        Ok(format!("token-{}", account_id))
    }

    fn validate(&self, _token: &str) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        issued: AtomicUsize,
        valid: bool,
    }

    impl AuthProvider for CountingProvider {
        fn authenticate(&self, _u: &str, _p: &str) -> Result<String> {
            Ok("acct-1".into())
        }
        fn issue(&self, account_id: &str) -> Result<String> {
            let n = self.issued.fetch_add(1, Ordering::SeqCst);
            Ok(format!("token-{}-{}", account_id, n))
        }
        fn validate(&self, _token: &str) -> Result<bool> {
            Ok(self.valid)
        }
    }

    #[test]
    fn test_cache_hit_skips_issue() {
        let provider = CountingProvider {
            issued: AtomicUsize::new(0),
            valid: true,
        };
        let mut cache = TokenCache::new(4);
        let a = cache.token_for("acct-1", &provider).unwrap();
        let b = cache.token_for("acct-1", &provider).unwrap();
        assert_eq!(a, b);
        assert_eq!(provider.issued.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let provider = CountingProvider {
            issued: AtomicUsize::new(0),
            valid: true,
        };
        let mut cache = TokenCache::new(2);
        cache.token_for("a", &provider).unwrap();
        cache.token_for("b", &provider).unwrap();
        cache.token_for("c", &provider).unwrap();
        // "a" was evicted; fetching it issues again.
        cache.token_for("a", &provider).unwrap();
        assert_eq!(provider.issued.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_static_provider_rejects_wrong_password() {
        let provider = StaticAuthProvider {
            username: "alice".into(),
            password: "secret".into(),
            account_id: "acct-1".into(),
        };
        assert!(provider.authenticate("alice", "secret").is_ok());
        assert!(matches!(
            provider.authenticate("alice", "wrong"),
            Err(ImapError::AuthenticationFailed)
        ));
    }
}
