//! Event-driven transport: one tokio task per connection, idle timeouts
//! enforced with `tokio::time::timeout`.

use crate::cache::FolderCache;
use crate::command::account_lock::AccountLockTable;
use crate::config::Config;
use crate::error::Result;
use crate::session::auth::AuthProvider;
use crate::session::mailbox::MailboxStore;
use crate::session::Session;
use crate::transport::{Connection, NoTls, TlsUpgrade};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

pub struct EventTransport<S> {
    config: Config,
    store: S,
    auth: Arc<dyn AuthProvider>,
    cache: Arc<dyn FolderCache>,
    locks: Arc<AccountLockTable>,
    tls: Arc<dyn TlsUpgrade>,
}

impl<S> EventTransport<S>
where
    S: MailboxStore + Clone + Send + 'static,
{
    pub fn new(
        config: Config,
        store: S,
        auth: Arc<dyn AuthProvider>,
        cache: Arc<dyn FolderCache>,
        locks: Arc<AccountLockTable>,
    ) -> Self {
        EventTransport {
            config,
            store,
            auth,
            cache,
            locks,
            tls: Arc::new(NoTls),
        }
    }

    pub fn with_tls(mut self, tls: Arc<dyn TlsUpgrade>) -> Self {
        self.tls = tls;
        self
    }

    pub async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.server.listen_addr).await?;
        info!(addr = %self.config.server.listen_addr, "imap listener started");
        loop {
            let (socket, peer) = listener.accept().await?;
            debug!(%peer, "connection accepted");
            let connection = self.new_connection();
            let tls = Arc::clone(&self.tls);
            tokio::spawn(async move {
                if let Err(e) = drive(socket, connection, tls).await {
                    debug!(%peer, error = %e, "connection closed with error");
                }
            });
        }
    }

    fn new_connection(&self) -> Connection {
        let session = Session::new(
            self.config.clone(),
            Box::new(self.store.clone()),
            Arc::clone(&self.auth),
            Arc::clone(&self.cache),
            Arc::clone(&self.locks),
        );
        Connection::new(&self.config, session)
    }
}

async fn drive(
    mut socket: TcpStream,
    mut connection: Connection,
    tls: Arc<dyn TlsUpgrade>,
) -> Result<()> {
    let result = drive_inner(&mut socket, &mut connection, &tls).await;
    connection.on_disconnect();
    result
}

async fn drive_inner(
    socket: &mut TcpStream,
    connection: &mut Connection,
    tls: &Arc<dyn TlsUpgrade>,
) -> Result<()> {
    socket.write_all(&connection.greeting()).await?;
    let mut buf = vec![0u8; 8192];
    loop {
        let read = tokio::time::timeout(connection.idle_timeout(), socket.read(&mut buf)).await;
        let n = match read {
            Err(_elapsed) => {
                let out = connection.on_idle_timeout();
                let _ = socket.write_all(&out.bytes).await;
                return Ok(());
            }
            Ok(Ok(0)) => return Ok(()),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e.into()),
        };
        let out = connection.on_bytes(&buf[..n]);
        socket.write_all(&out.bytes).await?;
        if out.upgrade_tls {
            match tls.upgrade() {
                Ok(()) => connection.tls_established(),
                Err(e) => {
                    warn!(error = %e, "tls negotiation failed");
                    return Err(e);
                }
            }
        }
        if out.close {
            return Ok(());
        }
    }
}
