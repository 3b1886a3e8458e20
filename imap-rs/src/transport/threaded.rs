//! Thread-per-connection transport: blocking sockets with read timeouts
//! standing in for the event transport's timers. Suited to embedding in
//! hosts without a tokio runtime.

use crate::cache::FolderCache;
use crate::command::account_lock::AccountLockTable;
use crate::config::Config;
use crate::error::Result;
use crate::session::auth::AuthProvider;
use crate::session::mailbox::MailboxStore;
use crate::session::Session;
use crate::transport::{Connection, NoTls, TlsUpgrade};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

pub struct ThreadedTransport<S> {
    config: Config,
    store: S,
    auth: Arc<dyn AuthProvider>,
    cache: Arc<dyn FolderCache>,
    locks: Arc<AccountLockTable>,
    tls: Arc<dyn TlsUpgrade>,
}

impl<S> ThreadedTransport<S>
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
        ThreadedTransport {
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

    pub fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.server.listen_addr)?;
        info!(addr = %self.config.server.listen_addr, "imap listener started");
        for socket in listener.incoming() {
            let socket = match socket {
                Ok(socket) => socket,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            if let Ok(peer) = socket.peer_addr() {
                debug!(%peer, "connection accepted");
            }
            let connection = self.new_connection();
            let tls = Arc::clone(&self.tls);
            thread::spawn(move || {
                if let Err(e) = drive(socket, connection, tls) {
                    debug!(error = %e, "connection closed with error");
                }
            });
        }
        Ok(())
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

fn drive(mut socket: TcpStream, mut connection: Connection, tls: Arc<dyn TlsUpgrade>) -> Result<()> {
    let result = drive_inner(&mut socket, &mut connection, &tls);
    connection.on_disconnect();
    result
}

fn drive_inner(
    socket: &mut TcpStream,
    connection: &mut Connection,
    tls: &Arc<dyn TlsUpgrade>,
) -> Result<()> {
    socket.write_all(&connection.greeting())?;
    let mut buf = vec![0u8; 8192];
    loop {
        socket.set_read_timeout(Some(connection.idle_timeout()))?;
        let n = match socket.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                let out = connection.on_idle_timeout();
                let _ = socket.write_all(&out.bytes);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let out = connection.on_bytes(&buf[..n]);
        socket.write_all(&out.bytes)?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryFolderCache;
    use crate::session::auth::StaticAuthProvider;
    use crate::session::mailbox::{InMemoryMailboxStore, SharedMailboxStore};
    use std::io::{BufRead, BufReader};
    use std::time::Duration;

    fn start_server() -> std::net::SocketAddr {
        let mut config = Config::default();
        config.server.listen_addr = "127.0.0.1:0".to_string();
        let mut store = InMemoryMailboxStore::new();
        store.provision("acct-1");
        let transport = ThreadedTransport::new(
            config.clone(),
            SharedMailboxStore::new(store),
            Arc::new(StaticAuthProvider {
                username: "alice".into(),
                password: "secret".into(),
                account_id: "acct-1".into(),
            }),
            Arc::new(MemoryFolderCache::new(16, 1 << 20)),
            Arc::new(AccountLockTable::new(
                Duration::from_millis(200),
                Duration::from_secs(3600),
            )),
        );

        let listener = TcpListener::bind(&config.server.listen_addr).unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            for socket in listener.incoming().flatten() {
                let connection = transport.new_connection();
                let tls: Arc<dyn TlsUpgrade> = Arc::new(NoTls);
                thread::spawn(move || {
                    let _ = drive(socket, connection, tls);
                });
            }
        });
        addr
    }

    #[test]
    fn test_login_and_select_over_blocking_socket() {
        let addr = start_server();
        let socket = TcpStream::connect(addr).unwrap();
        let mut reader = BufReader::new(socket.try_clone().unwrap());
        let mut writer = socket;
        let mut line = String::new();

        reader.read_line(&mut line).unwrap();
        assert!(line.starts_with("* OK [CAPABILITY"));

        writer.write_all(b"a1 LOGIN alice secret\r\n").unwrap();
        line.clear();
        reader.read_line(&mut line).unwrap();
        assert!(line.starts_with("a1 OK"));

        writer.write_all(b"a2 SELECT INBOX\r\n").unwrap();
        let mut saw_exists = false;
        loop {
            line.clear();
            reader.read_line(&mut line).unwrap();
            if line.contains("EXISTS") {
                saw_exists = true;
            }
            if line.starts_with("a2 ") {
                break;
            }
        }
        assert!(saw_exists);
        assert!(line.starts_with("a2 OK"));
    }
}
