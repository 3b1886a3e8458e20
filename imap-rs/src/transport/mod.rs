//! Connection transports. The adapters in `event` and `threaded` only move
//! bytes; everything protocol-shaped lives in the shared [`Connection`]
//! driver so both serve identical sessions.

pub mod event;
pub mod framing;
pub mod threaded;

use crate::command::parse::parse_command;
use crate::command::CommandKind;
use crate::config::Config;
use crate::error::Result;
use crate::proto::response::{Response, Status};
use crate::session::{Session, SessionState, CAPABILITIES};
use crate::transport::framing::{CommandAccumulator, Frame};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Performs the TLS negotiation after a STARTTLS acceptance. The driver
/// only decides *when* an upgrade happens; deployments supply the how.
pub trait TlsUpgrade: Send + Sync {
    /// Called once, between the tagged OK and the next client byte.
    fn upgrade(&self) -> Result<()>;
}

/// Upgrade hook for plaintext deployments: accepts the command, performs
/// nothing.
pub struct NoTls;

impl TlsUpgrade for NoTls {
    fn upgrade(&self) -> Result<()> {
        Ok(())
    }
}

/// What the driver wants written and done after a chunk of input.
#[derive(Debug, Default)]
pub struct Output {
    pub bytes: Vec<u8>,
    pub close: bool,
    /// The STARTTLS acceptance is in `bytes`; negotiate before reading on.
    pub upgrade_tls: bool,
}

/// Per-connection protocol driver shared by both transports.
pub struct Connection {
    session: Session,
    accumulator: CommandAccumulator,
    consecutive_errors: u32,
    max_consecutive_errors: u32,
    literal_memory_threshold: usize,
    unauthenticated_idle: Duration,
    authenticated_idle: Duration,
    greeting_host: String,
    tls_done: bool,
}

impl Connection {
    pub fn new(config: &Config, session: Session) -> Self {
        Connection {
            session,
            accumulator: CommandAccumulator::new(config.session.max_literal_size),
            consecutive_errors: 0,
            max_consecutive_errors: config.server.max_consecutive_errors,
            literal_memory_threshold: config.session.literal_memory_threshold,
            unauthenticated_idle: Duration::from_secs(config.server.unauthenticated_idle_secs),
            authenticated_idle: Duration::from_secs(config.server.authenticated_idle_secs),
            greeting_host: config.server.greeting_host.clone(),
            tls_done: false,
        }
    }

    pub fn greeting(&self) -> Vec<u8> {
        format!(
            "* OK [CAPABILITY {}] {} IMAP4rev1 service ready\r\n",
            CAPABILITIES.join(" "),
            self.greeting_host
        )
        .into_bytes()
    }

    /// How long the adapter may wait for the next byte.
    pub fn idle_timeout(&self) -> Duration {
        if self.session.is_authenticated() {
            self.authenticated_idle
        } else {
            self.unauthenticated_idle
        }
    }

    /// Feed a chunk of socket input; returns everything to write back.
    pub fn on_bytes(&mut self, data: &[u8]) -> Output {
        self.accumulator.feed(data);
        let mut out = Output::default();
        while let Some(frame) = self.accumulator.next_frame() {
            match frame {
                Frame::NeedContinuation => {
                    push_line(&mut out.bytes, "+ OK");
                }
                Frame::LiteralTooLarge { tag, size } => {
                    warn!(size, "oversized literal rejected");
                    push_response(
                        &mut out.bytes,
                        &Response::tagged_no(tag, "literal too large"),
                    );
                }
                Frame::Command(bytes) => {
                    self.run_command(&bytes, &mut out);
                }
            }
            if out.close || out.upgrade_tls {
                break;
            }
        }
        out
    }

    /// The adapter hit its idle timeout; say goodbye.
    pub fn on_idle_timeout(&mut self) -> Output {
        debug!("connection idle timeout");
        let mut out = Output {
            close: true,
            ..Output::default()
        };
        push_response(&mut out.bytes, &Response::bye("idle timeout, closing"));
        self.session.teardown();
        out
    }

    /// The socket is gone; release session resources.
    pub fn on_disconnect(&mut self) {
        self.session.teardown();
    }

    /// Mark the TLS negotiation finished so a second STARTTLS is refused.
    pub fn tls_established(&mut self) {
        self.tls_done = true;
    }

    fn run_command(&mut self, bytes: &[u8], out: &mut Output) {
        let (tag, command) = match parse_command(bytes, self.literal_memory_threshold) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.consecutive_errors += 1;
                if self.consecutive_errors >= self.max_consecutive_errors {
                    warn!(errors = self.consecutive_errors, "too many bad commands");
                    push_response(&mut out.bytes, &Response::bye("too many invalid commands"));
                    out.close = true;
                    self.session.teardown();
                    return;
                }
                push_response(&mut out.bytes, &Response::tagged_bad("*", e.to_string()));
                return;
            }
        };
        self.consecutive_errors = 0;

        let starttls_request = command.kind() == CommandKind::Starttls;
        if starttls_request && self.tls_done {
            push_response(
                &mut out.bytes,
                &Response::tagged_bad(tag, "TLS already negotiated"),
            );
            return;
        }

        match self.session.handle_command(&tag, command) {
            Ok(responses) => {
                let accepted = matches!(
                    responses.last(),
                    Some(Response::Tagged {
                        status: Status::Ok,
                        ..
                    })
                );
                for response in &responses {
                    push_response(&mut out.bytes, response);
                }
                if starttls_request && accepted {
                    out.upgrade_tls = true;
                }
                if self.session.state() == SessionState::Logout {
                    out.close = true;
                }
            }
            Err(e) => {
                error!(error = %e, "session failed, dropping connection");
                push_response(&mut out.bytes, &Response::bye("internal failure"));
                out.close = true;
                self.session.teardown();
            }
        }
    }
}

fn push_line(bytes: &mut Vec<u8>, line: &str) {
    bytes.extend_from_slice(line.as_bytes());
    bytes.extend_from_slice(b"\r\n");
}

fn push_response(bytes: &mut Vec<u8>, response: &Response) {
    push_line(bytes, &response.render());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryFolderCache;
    use crate::command::account_lock::AccountLockTable;
    use crate::session::auth::StaticAuthProvider;
    use crate::session::mailbox::InMemoryMailboxStore;
    use std::sync::Arc;

    fn new_connection() -> Connection {
        let config = Config::default();
        let mut store = InMemoryMailboxStore::new();
        store.provision("acct-1");
        let session = Session::new(
            config.clone(),
            Box::new(store),
            Arc::new(StaticAuthProvider {
                username: "alice".into(),
                password: "secret".into(),
                account_id: "acct-1".into(),
            }),
            Arc::new(MemoryFolderCache::new(16, 1 << 20)),
            Arc::new(AccountLockTable::new(
                Duration::from_millis(100),
                Duration::from_secs(3600),
            )),
        );
        Connection::new(&config, session)
    }

    #[test]
    fn test_greeting_advertises_capabilities() {
        let conn = new_connection();
        let greeting = String::from_utf8(conn.greeting()).unwrap();
        assert!(greeting.starts_with("* OK [CAPABILITY IMAP4rev1"));
        assert!(greeting.contains("LITERAL+"));
    }

    #[test]
    fn test_login_extends_idle_timeout() {
        let mut conn = new_connection();
        let before = conn.idle_timeout();
        let out = conn.on_bytes(b"a1 LOGIN alice secret\r\n");
        assert!(String::from_utf8(out.bytes).unwrap().contains("a1 OK"));
        assert!(conn.idle_timeout() > before);
    }

    #[test]
    fn test_split_input_executes_once_complete() {
        let mut conn = new_connection();
        let out = conn.on_bytes(b"a1 LOG");
        assert!(out.bytes.is_empty());
        let out = conn.on_bytes(b"IN alice secret\r\n");
        assert!(String::from_utf8(out.bytes).unwrap().contains("a1 OK"));
    }

    #[test]
    fn test_parse_error_threshold_closes_connection() {
        let mut conn = new_connection();
        let mut closed = false;
        for _ in 0..Config::default().server.max_consecutive_errors {
            let out = conn.on_bytes(b"!! not a command\r\n");
            closed = out.close;
        }
        assert!(closed);
    }

    #[test]
    fn test_logout_closes() {
        let mut conn = new_connection();
        let out = conn.on_bytes(b"a1 LOGOUT\r\n");
        assert!(out.close);
        let text = String::from_utf8(out.bytes).unwrap();
        assert!(text.contains("* BYE"));
        assert!(text.contains("a1 OK"));
    }

    #[test]
    fn test_starttls_signals_upgrade_once() {
        let mut conn = new_connection();
        let out = conn.on_bytes(b"a1 STARTTLS\r\n");
        assert!(out.upgrade_tls);
        conn.tls_established();
        let out = conn.on_bytes(b"a2 STARTTLS\r\n");
        assert!(!out.upgrade_tls);
        assert!(String::from_utf8(out.bytes).unwrap().contains("a2 BAD"));
    }

    #[test]
    fn test_synchronizing_literal_gets_continuation() {
        let mut conn = new_connection();
        conn.on_bytes(b"a1 LOGIN alice secret\r\n");
        let out = conn.on_bytes(b"a2 APPEND INBOX {13}\r\n");
        assert!(String::from_utf8(out.bytes).unwrap().starts_with("+ OK"));
        let out = conn.on_bytes(b"Subject: x\r\nz\r\n");
        assert!(String::from_utf8(out.bytes).unwrap().contains("a2 OK"));
    }
}
