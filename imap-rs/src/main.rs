use imap_rs::cache;
use imap_rs::command::account_lock::AccountLockTable;
use imap_rs::config::Config;
use imap_rs::session::auth::StaticAuthProvider;
use imap_rs::session::mailbox::{InMemoryMailboxStore, SharedMailboxStore};
use imap_rs::transport::event::EventTransport;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting imap-rs server");

    let config = if std::path::Path::new("config.toml").exists() {
        Config::from_file("config.toml")?
    } else {
        info!("No config file found, using defaults");
        Config::default()
    };

    info!("  IMAP listening on: {}", config.server.listen_addr);
    info!("  Greeting host: {}", config.server.greeting_host);
    info!("  Cache backend: {:?}", config.cache.backend);

    let username = std::env::var("IMAP_USER").unwrap_or_else(|_| "demo".to_string());
    let password = std::env::var("IMAP_PASSWORD").unwrap_or_else(|_| "demo".to_string());
    let auth = Arc::new(StaticAuthProvider {
        account_id: username.clone(),
        username,
        password,
    });

    let mut store = InMemoryMailboxStore::new();
    store.provision(&auth.account_id);

    let cache = cache::from_config(
        &config.cache,
        Duration::from_secs(config.server.authenticated_idle_secs),
    );
    let locks = Arc::new(AccountLockTable::new(
        Duration::from_millis(config.throttle.account_lock_timeout_ms),
        Duration::from_secs(config.throttle.account_lock_reclaim_secs),
    ));

    let server = EventTransport::new(
        config,
        SharedMailboxStore::new(store),
        auth,
        cache,
        locks,
    );
    server.serve().await?;
    Ok(())
}
