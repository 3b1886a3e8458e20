//! imap-rs: Server-side IMAP4rev1 protocol engine
//!
//! A transport-agnostic IMAP4rev1 server core with UIDPLUS, LITERAL+, ID,
//! and IDLE, plus a client-side request engine for upstream stores.
//!
//! # Features
//!
//! - **Wire layer**: tokenizing reader/writer with disk-spilled literals
//! - **Session core**: synchronous state machine shared by all transports
//! - **Notifications**: change queueing with stable sequence numbers
//! - **Folder cache**: pluggable backends so SELECT rarely rebuilds state
//! - **Transports**: tokio event loop or thread-per-connection
//!
//! # Example
//!
//! ```no_run
//! use imap_rs::cache;
//! use imap_rs::command::account_lock::AccountLockTable;
//! use imap_rs::config::Config;
//! use imap_rs::session::auth::StaticAuthProvider;
//! use imap_rs::session::mailbox::{InMemoryMailboxStore, SharedMailboxStore};
//! use imap_rs::transport::event::EventTransport;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let mut store = InMemoryMailboxStore::new();
//!     store.provision("acct-1");
//!
//!     let cache = cache::from_config(
//!         &config.cache,
//!         Duration::from_secs(config.server.authenticated_idle_secs),
//!     );
//!     let locks = Arc::new(AccountLockTable::new(
//!         Duration::from_millis(config.throttle.account_lock_timeout_ms),
//!         Duration::from_secs(config.throttle.account_lock_reclaim_secs),
//!     ));
//!     let auth = Arc::new(StaticAuthProvider {
//!         username: "alice".into(),
//!         password: "secret".into(),
//!         account_id: "acct-1".into(),
//!     });
//!
//!     let server = EventTransport::new(
//!         config,
//!         SharedMailboxStore::new(store),
//!         auth,
//!         cache,
//!         locks,
//!     );
//!     server.serve().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`proto`]: wire-level types, reader, writer, responses
//! - [`command`]: parsed commands, throttle, per-account lock
//! - [`session`]: the session state machine and its collaborators
//! - [`cache`]: folder-state cache backends
//! - [`engine`]: client-side request engine for upstream IMAP stores
//! - [`transport`]: connection adapters
//! - [`config`]: configuration management
//! - [`error`]: error types

pub mod cache;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod proto;
pub mod session;
pub mod transport;

pub use crate::config::Config;
pub use crate::error::{ImapError, Result};
pub use crate::session::Session;
