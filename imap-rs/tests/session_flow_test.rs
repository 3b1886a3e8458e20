//! End-to-end session scenarios against the in-memory mailbox store.

use imap_rs::cache::memory::MemoryFolderCache;
use imap_rs::cache::FolderCache;
use imap_rs::command::account_lock::AccountLockTable;
use imap_rs::command::parse::parse_command;
use imap_rs::config::Config;
use imap_rs::proto::response::{Response, ResponseCode, Status, UntaggedResponse};
use imap_rs::session::auth::StaticAuthProvider;
use imap_rs::session::mailbox::{InMemoryMailboxStore, SharedMailboxStore};
use imap_rs::session::Session;
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    config: Config,
    store: SharedMailboxStore<InMemoryMailboxStore>,
    cache: Arc<dyn FolderCache>,
    locks: Arc<AccountLockTable>,
    auth: Arc<StaticAuthProvider>,
}

impl Fixture {
    fn new() -> Self {
        Fixture::with_config(Config::default())
    }

    fn with_config(config: Config) -> Self {
        let mut store = InMemoryMailboxStore::new();
        store.provision("acct-1");
        Fixture {
            config,
            store: SharedMailboxStore::new(store),
            cache: Arc::new(MemoryFolderCache::new(64, 1 << 20)),
            locks: Arc::new(AccountLockTable::new(
                Duration::from_millis(200),
                Duration::from_secs(3600),
            )),
            auth: Arc::new(StaticAuthProvider {
                username: "alice".into(),
                password: "secret".into(),
                account_id: "acct-1".into(),
            }),
        }
    }

    /// A fresh logged-in session sharing the fixture's store and cache.
    fn session(&self) -> Session {
        let mut session = Session::new(
            self.config.clone(),
            Box::new(self.store.clone()),
            self.auth.clone(),
            self.cache.clone(),
            self.locks.clone(),
        );
        let responses = run(&mut session, "a0 LOGIN alice secret\r\n");
        assert_tagged(&responses, Status::Ok);
        session
    }

    fn deliver(&self, folder: &str, body: &[u8]) -> u32 {
        self.store
            .with(|s| s.deliver("acct-1", folder, body))
            .unwrap()
    }
}

fn run(session: &mut Session, line: &str) -> Vec<Response> {
    run_with_threshold(session, line, 64 * 1024).unwrap()
}

fn run_with_threshold(
    session: &mut Session,
    line: &str,
    threshold: usize,
) -> anyhow::Result<Vec<Response>> {
    let (tag, command) = parse_command(line.as_bytes(), threshold)?;
    Ok(session.handle_command(&tag, command)?)
}

fn assert_tagged(responses: &[Response], want: Status) {
    match responses.last() {
        Some(Response::Tagged { status, .. }) => assert_eq!(*status, want),
        other => panic!("expected tagged completion, got {other:?}"),
    }
}

#[test]
fn test_select_reports_folder_state() {
    let fixture = Fixture::new();
    fixture.deliver("INBOX", b"Subject: one\r\n\r\nfirst");
    fixture.deliver("INBOX", b"Subject: two\r\n\r\nsecond");

    let mut session = fixture.session();
    let responses = run(&mut session, "a1 SELECT INBOX\r\n");

    assert!(responses
        .iter()
        .any(|r| matches!(r, Response::Untagged(UntaggedResponse::Exists(2)))));
    assert!(responses
        .iter()
        .any(|r| matches!(r, Response::Untagged(UntaggedResponse::Recent(2)))));
    let has_uidvalidity = responses.iter().any(|r| {
        matches!(
            r,
            Response::Untagged(UntaggedResponse::Condition(_, text))
                if matches!(text.code, Some(ResponseCode::UidValidity(_)))
        )
    });
    assert!(has_uidvalidity);
    match responses.last() {
        Some(Response::Tagged {
            status: Status::Ok,
            text,
            ..
        }) => assert_eq!(text.code, Some(ResponseCode::ReadWrite)),
        other => panic!("unexpected completion {other:?}"),
    }
}

#[test]
fn test_delivery_surfaces_as_single_exists_on_noop() {
    let fixture = Fixture::new();
    fixture.deliver("INBOX", b"first");

    let mut session = fixture.session();
    run(&mut session, "a1 SELECT INBOX\r\n");

    fixture.deliver("INBOX", b"second");

    let responses = run(&mut session, "a2 NOOP\r\n");
    let exists: Vec<u32> = responses
        .iter()
        .filter_map(|r| match r {
            Response::Untagged(UntaggedResponse::Exists(n)) => Some(*n),
            _ => None,
        })
        .collect();
    assert_eq!(exists, vec![2]);
    assert_tagged(&responses, Status::Ok);

    // Nothing further pending: the next NOOP is quiet.
    let responses = run(&mut session, "a3 NOOP\r\n");
    assert_eq!(responses.len(), 1);
}

#[test]
fn test_create_flood_stops_at_the_limit() {
    let mut config = Config::default();
    config.throttle.repeat_limit = 10;
    let fixture = Fixture::with_config(config);
    let mut session = fixture.session();

    for i in 1..=10 {
        let responses = run(&mut session, &format!("c{i} CREATE folder-{i}\r\n"));
        assert_tagged(&responses, Status::Ok);
    }
    let responses = run(&mut session, "c11 CREATE folder-11\r\n");
    assert_tagged(&responses, Status::No);

    // A different command resets the consecutive-CREATE count.
    run(&mut session, "n1 NOOP\r\n");
    let responses = run(&mut session, "c12 CREATE folder-12\r\n");
    assert_tagged(&responses, Status::Ok);
}

#[test]
fn test_recent_excludes_seen_messages_after_readwrite_close() {
    let fixture = Fixture::new();
    fixture.deliver("INBOX", b"already here");

    let mut first = fixture.session();
    let responses = run(&mut first, "a1 SELECT INBOX\r\n");
    assert!(responses
        .iter()
        .any(|r| matches!(r, Response::Untagged(UntaggedResponse::Recent(1)))));
    let responses = run(&mut first, "a2 CLOSE\r\n");
    assert_tagged(&responses, Status::Ok);

    // A reconnecting session must not see the same message as recent.
    let mut second = fixture.session();
    let responses = run(&mut second, "b1 SELECT INBOX\r\n");
    assert!(responses
        .iter()
        .any(|r| matches!(r, Response::Untagged(UntaggedResponse::Recent(0)))));

    // New mail after the close is recent again.
    run(&mut second, "b2 CLOSE\r\n");
    fixture.deliver("INBOX", b"fresh");
    let mut third = fixture.session();
    let responses = run(&mut third, "c1 SELECT INBOX\r\n");
    assert!(responses
        .iter()
        .any(|r| matches!(r, Response::Untagged(UntaggedResponse::Recent(1)))));
}

#[test]
fn test_large_literal_round_trips_through_disk_spill() -> anyhow::Result<()> {
    let fixture = Fixture::new();
    let mut session = fixture.session();

    let mut body = String::from("Subject: big\r\n\r\n");
    while body.len() < 4096 {
        body.push_str("0123456789abcdef");
    }
    let line = format!("a1 APPEND INBOX {{{}+}}\r\n{}\r\n", body.len(), body);

    // A 64-byte threshold forces the literal through a spill file.
    let responses = run_with_threshold(&mut session, &line, 64)?;
    match responses.last() {
        Some(Response::Tagged {
            status: Status::Ok,
            text,
            ..
        }) => assert!(matches!(text.code, Some(ResponseCode::AppendUid(_)))),
        other => panic!("unexpected completion {other:?}"),
    }

    run(&mut session, "a2 SELECT INBOX\r\n");
    let responses = run(&mut session, "a3 FETCH 1 (BODY.PEEK[])\r\n");
    let fetched = responses
        .iter()
        .find_map(|r| match r {
            Response::Untagged(UntaggedResponse::Fetch(1, data)) => Some(data.clone()),
            _ => None,
        })
        .unwrap();
    assert!(fetched.contains(&format!("{{{}}}", body.len())));
    assert!(fetched.contains("0123456789abcdef"));
    Ok(())
}

#[test]
fn test_copy_reports_uidplus_mapping() {
    let fixture = Fixture::new();
    fixture.deliver("INBOX", b"one");
    fixture.deliver("INBOX", b"two");

    let mut session = fixture.session();
    run(&mut session, "a1 SELECT INBOX\r\n");
    let responses = run(&mut session, "a2 COPY 1:2 Sent\r\n");
    match responses.last() {
        Some(Response::Tagged {
            status: Status::Ok,
            text,
            ..
        }) => match &text.code {
            Some(ResponseCode::CopyUid(copied)) => {
                assert_eq!(copied.from.len(), copied.to.len());
            }
            other => panic!("expected COPYUID, got {other:?}"),
        },
        other => panic!("unexpected completion {other:?}"),
    }

    // The destination folder gained the messages.
    let responses = run(&mut session, "a3 STATUS Sent (MESSAGES)\r\n");
    match responses.first() {
        Some(Response::Untagged(UntaggedResponse::MailboxStatus(_, items))) => {
            assert!(items.contains("MESSAGES 2"));
        }
        other => panic!("unexpected response {other:?}"),
    }
}

#[test]
fn test_expunge_renumbers_later_messages() {
    let fixture = Fixture::new();
    fixture.deliver("INBOX", b"one");
    fixture.deliver("INBOX", b"two");
    fixture.deliver("INBOX", b"three");

    let mut session = fixture.session();
    run(&mut session, "a1 SELECT INBOX\r\n");
    run(&mut session, "a2 STORE 1:2 +FLAGS.SILENT (\\Deleted)\r\n");
    let responses = run(&mut session, "a3 EXPUNGE\r\n");

    // Both removals report MSN 1: the second message became number one
    // after the first left.
    let expunged: Vec<u32> = responses
        .iter()
        .filter_map(|r| match r {
            Response::Untagged(UntaggedResponse::Expunge(n)) => Some(*n),
            _ => None,
        })
        .collect();
    assert_eq!(expunged, vec![1, 1]);

    let responses = run(&mut session, "a4 FETCH 1 (UID)\r\n");
    let fetched = responses
        .iter()
        .find_map(|r| match r {
            Response::Untagged(UntaggedResponse::Fetch(1, data)) => Some(data.clone()),
            _ => None,
        })
        .unwrap();
    assert!(fetched.contains("UID 3"));
}
