use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub throttle: ThrottleConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub greeting_host: String,
    /// Idle timeout before LOGIN, in seconds.
    pub unauthenticated_idle_secs: u64,
    /// Idle timeout after LOGIN, in seconds (RFC 3501 requires >= 30min).
    pub authenticated_idle_secs: u64,
    /// Consecutive unparseable commands tolerated before dropping.
    pub max_consecutive_errors: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Literals larger than this are spilled to a temporary file.
    pub literal_memory_threshold: usize,
    /// Largest literal accepted at all.
    pub max_literal_size: usize,
    /// Entries kept in the per-account auth-token cache.
    pub auth_token_cache_size: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ThrottleConfig {
    /// Identical commands tolerated inside the repeat window; 0 disables.
    pub repeat_limit: u32,
    /// Per-account lock acquisition timeout, in milliseconds.
    pub account_lock_timeout_ms: u64,
    /// Idle account-lock entries are reclaimed after this many seconds.
    pub account_lock_reclaim_secs: u64,
}

/// Which folder-cache backend a deployment runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackend {
    Memory,
    Disk,
    Remote,
    Tiered,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    pub backend: CacheBackend,
    /// Entry-count bound for the in-process backends.
    pub max_entries: usize,
    /// Total serialized-size bound in bytes for the in-process backends.
    pub max_bytes: usize,
    /// Directory for the disk backend.
    pub disk_dir: String,
    /// Grace period added to the authenticated idle timeout before an
    /// active entry in the tiered backend may expire, in seconds.
    pub active_grace_secs: u64,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::error::ImapError::Config(e.to_string()))?;

        toml::from_str(&content).map_err(|e| crate::error::ImapError::Config(e.to_string()))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                listen_addr: "0.0.0.0:1143".to_string(),
                greeting_host: "localhost".to_string(),
                unauthenticated_idle_secs: 60,
                authenticated_idle_secs: 30 * 60,
                max_consecutive_errors: 5,
            },
            session: SessionConfig {
                literal_memory_threshold: 64 * 1024,
                max_literal_size: 50 * 1024 * 1024, // 50MB
                auth_token_cache_size: 16,
            },
            throttle: ThrottleConfig {
                repeat_limit: 25,
                account_lock_timeout_ms: 10_000,
                account_lock_reclaim_secs: 12 * 60 * 60,
            },
            cache: CacheConfig {
                backend: CacheBackend::Memory,
                max_entries: 1024,
                max_bytes: 64 * 1024 * 1024,
                disk_dir: "/tmp/imap-cache".to_string(),
                active_grace_secs: 5 * 60,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_toml_config() {
        let toml = r#"
            [server]
            listen_addr = "127.0.0.1:143"
            greeting_host = "mail.example.com"
            unauthenticated_idle_secs = 30
            authenticated_idle_secs = 1800
            max_consecutive_errors = 3

            [session]
            literal_memory_threshold = 4096
            max_literal_size = 1048576
            auth_token_cache_size = 8

            [throttle]
            repeat_limit = 10
            account_lock_timeout_ms = 5000
            account_lock_reclaim_secs = 3600

            [cache]
            backend = "tiered"
            max_entries = 128
            max_bytes = 1048576
            disk_dir = "/var/cache/imap"
            active_grace_secs = 120
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.listen_addr, "127.0.0.1:143");
        assert_eq!(config.cache.backend, CacheBackend::Tiered);
        assert_eq!(config.throttle.repeat_limit, 10);
    }

    #[test]
    fn test_default_config_is_sane() {
        let config = Config::default();
        assert!(config.session.literal_memory_threshold < config.session.max_literal_size);
        assert!(config.server.authenticated_idle_secs > config.server.unauthenticated_idle_secs);
    }
}
