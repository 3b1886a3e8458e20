//! Typed client commands, value equality for duplicate detection, and the
//! per-kind throttle hooks.
//!
//! All throttle policy is dispatched over [`CommandKind`] here so it can be
//! audited in one place.

pub mod account_lock;
pub mod parse;
pub mod throttle;

use crate::proto::types::Literal;

/// QRESYNC parameters attached to SELECT/EXAMINE.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QresyncParams {
    pub uidvalidity: u32,
    pub modseq: u64,
    pub known_uids: Option<String>,
    pub seq_milestones: Option<String>,
    pub uid_milestones: Option<String>,
}

/// One BODY[...] / BODY.PEEK[...] part specifier in a FETCH.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PartSpecifier {
    pub peek: bool,
    /// Section path, e.g. `1.2`, `HEADER`, `TEXT`, `1.MIME`, or empty for
    /// the whole body.
    pub section: String,
    /// `HEADER.FIELDS` / `HEADER.FIELDS.NOT` modifier, if any.
    pub modifier: Option<String>,
    pub headers: Vec<String>,
    /// `<offset.count>` partial range.
    pub partial: Option<(u32, u32)>,
}

impl PartSpecifier {
    /// Exchange clients ask for the CONTENT-CLASS header, which no other
    /// server stores; such parts are stripped rather than throttled.
    pub fn is_ignored_exchange_header(&self) -> bool {
        self.modifier
            .as_deref()
            .is_some_and(|m| m.eq_ignore_ascii_case("HEADER.FIELDS"))
            && self.headers.len() == 1
            && self.headers[0].eq_ignore_ascii_case("CONTENT-CLASS")
    }
}

/// One message of an APPEND command. The literal carries the payload; for
/// duplicate detection only its size participates.
#[derive(Debug)]
pub struct AppendMessage {
    pub flags: Vec<String>,
    pub date: Option<String>,
    pub literal: Literal,
}

/// STORE action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreAction {
    Add,
    Remove,
    Replace,
}

impl StoreAction {
    pub fn silent_name(self, silent: bool) -> &'static str {
        match (self, silent) {
            (StoreAction::Add, false) => "+FLAGS",
            (StoreAction::Remove, false) => "-FLAGS",
            (StoreAction::Replace, false) => "FLAGS",
            (StoreAction::Add, true) => "+FLAGS.SILENT",
            (StoreAction::Remove, true) => "-FLAGS.SILENT",
            (StoreAction::Replace, true) => "FLAGS.SILENT",
        }
    }
}

/// SEARCH criteria. Nested criteria not modeled here are preserved raw so
/// value equality still holds for duplicate detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchCriteria {
    All,
    Unseen,
    Deleted,
    Subject(String),
    From(String),
    To(String),
    Text(String),
    Raw(String),
}

/// A parsed client command.
#[derive(Debug)]
pub enum Command {
    Capability,
    Noop,
    Logout,
    Starttls,
    Id {
        params: Option<Vec<(String, Option<String>)>>,
    },
    Login {
        username: String,
        password: String,
    },
    Select {
        path: String,
        qresync: Option<QresyncParams>,
    },
    Examine {
        path: String,
        qresync: Option<QresyncParams>,
    },
    Create {
        path: String,
        /// Consecutive-CREATE count, maintained by the throttle hook.
        repeats: u32,
    },
    Delete {
        path: String,
    },
    Rename {
        from: String,
        to: String,
    },
    Subscribe {
        path: String,
    },
    Unsubscribe {
        path: String,
    },
    List {
        reference: String,
        patterns: Vec<String>,
    },
    Lsub {
        reference: String,
        patterns: Vec<String>,
    },
    Status {
        path: String,
        items: Vec<String>,
    },
    Append {
        path: String,
        messages: Vec<AppendMessage>,
    },
    Check,
    Close,
    Expunge,
    Search {
        criteria: SearchCriteria,
        uid: bool,
    },
    Fetch {
        sequence: String,
        /// Plain attribute atoms (FLAGS, UID, ENVELOPE, ...), uppercased.
        items: Vec<String>,
        parts: Vec<PartSpecifier>,
        uid: bool,
    },
    Store {
        sequence: String,
        action: StoreAction,
        silent: bool,
        flags: Vec<String>,
        uid: bool,
    },
    Copy {
        sequence: String,
        dest: String,
        uid: bool,
    },
    Idle,
    /// Untagged DONE terminating IDLE.
    Done,
}

/// Discriminant for state checks and throttle bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Capability,
    Noop,
    Logout,
    Starttls,
    Id,
    Login,
    Select,
    Examine,
    Create,
    Delete,
    Rename,
    Subscribe,
    Unsubscribe,
    List,
    Lsub,
    Status,
    Append,
    Check,
    Close,
    Expunge,
    Search,
    Fetch,
    Store,
    Copy,
    Idle,
    Done,
}

/// Normalized, cheaply comparable view of a command's parameters.
///
/// List-valued fields are sorted so that semantically equal commands with
/// differently ordered lists compare equal; APPEND payloads are reduced to
/// their octet counts.
#[derive(Debug, Clone, PartialEq)]
pub enum Fingerprint {
    None,
    Mailbox(String),
    SelectLike {
        path: String,
        qresync: Option<QresyncParams>,
    },
    Rename {
        from: String,
        to: String,
    },
    ListLike {
        reference: String,
        patterns: Vec<String>,
    },
    Status {
        path: String,
        items: Vec<String>,
    },
    Append {
        path: String,
        messages: Vec<(Vec<String>, Option<String>, u64)>,
    },
    Search {
        criteria: SearchCriteria,
        uid: bool,
    },
    Fetch {
        sequence: String,
        items: Vec<String>,
        parts: Vec<PartSpecifier>,
        uid: bool,
    },
    Store {
        sequence: String,
        action: StoreAction,
        silent: bool,
        flags: Vec<String>,
        uid: bool,
    },
    Copy {
        sequence: String,
        dest: String,
        uid: bool,
    },
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Capability => CommandKind::Capability,
            Command::Noop => CommandKind::Noop,
            Command::Logout => CommandKind::Logout,
            Command::Starttls => CommandKind::Starttls,
            Command::Id { .. } => CommandKind::Id,
            Command::Login { .. } => CommandKind::Login,
            Command::Select { .. } => CommandKind::Select,
            Command::Examine { .. } => CommandKind::Examine,
            Command::Create { .. } => CommandKind::Create,
            Command::Delete { .. } => CommandKind::Delete,
            Command::Rename { .. } => CommandKind::Rename,
            Command::Subscribe { .. } => CommandKind::Subscribe,
            Command::Unsubscribe { .. } => CommandKind::Unsubscribe,
            Command::List { .. } => CommandKind::List,
            Command::Lsub { .. } => CommandKind::Lsub,
            Command::Status { .. } => CommandKind::Status,
            Command::Append { .. } => CommandKind::Append,
            Command::Check => CommandKind::Check,
            Command::Close => CommandKind::Close,
            Command::Expunge => CommandKind::Expunge,
            Command::Search { .. } => CommandKind::Search,
            Command::Fetch { .. } => CommandKind::Fetch,
            Command::Store { .. } => CommandKind::Store,
            Command::Copy { .. } => CommandKind::Copy,
            Command::Idle => CommandKind::Idle,
            Command::Done => CommandKind::Done,
        }
    }

    pub fn name(&self) -> &'static str {
        match self.kind() {
            CommandKind::Capability => "CAPABILITY",
            CommandKind::Noop => "NOOP",
            CommandKind::Logout => "LOGOUT",
            CommandKind::Starttls => "STARTTLS",
            CommandKind::Id => "ID",
            CommandKind::Login => "LOGIN",
            CommandKind::Select => "SELECT",
            CommandKind::Examine => "EXAMINE",
            CommandKind::Create => "CREATE",
            CommandKind::Delete => "DELETE",
            CommandKind::Rename => "RENAME",
            CommandKind::Subscribe => "SUBSCRIBE",
            CommandKind::Unsubscribe => "UNSUBSCRIBE",
            CommandKind::List => "LIST",
            CommandKind::Lsub => "LSUB",
            CommandKind::Status => "STATUS",
            CommandKind::Append => "APPEND",
            CommandKind::Check => "CHECK",
            CommandKind::Close => "CLOSE",
            CommandKind::Expunge => "EXPUNGE",
            CommandKind::Search => "SEARCH",
            CommandKind::Fetch => "FETCH",
            CommandKind::Store => "STORE",
            CommandKind::Copy => "COPY",
            CommandKind::Idle => "IDLE",
            CommandKind::Done => "DONE",
        }
    }

    /// Normalized parameter view used for duplicate detection.
    pub fn fingerprint(&self) -> Fingerprint {
        match self {
            Command::Capability
            | Command::Noop
            | Command::Logout
            | Command::Starttls
            | Command::Id { .. }
            | Command::Login { .. }
            | Command::Check
            | Command::Close
            | Command::Expunge
            | Command::Idle
            | Command::Done => Fingerprint::None,
            Command::Create { path, .. }
            | Command::Delete { path }
            | Command::Subscribe { path }
            | Command::Unsubscribe { path } => Fingerprint::Mailbox(path.clone()),
            Command::Select { path, qresync } | Command::Examine { path, qresync } => {
                Fingerprint::SelectLike {
                    path: path.clone(),
                    qresync: qresync.clone(),
                }
            }
            Command::Rename { from, to } => Fingerprint::Rename {
                from: from.clone(),
                to: to.clone(),
            },
            Command::List {
                reference,
                patterns,
            }
            | Command::Lsub {
                reference,
                patterns,
            } => {
                let mut patterns = patterns.clone();
                patterns.sort();
                Fingerprint::ListLike {
                    reference: reference.clone(),
                    patterns,
                }
            }
            Command::Status { path, items } => {
                let mut items = items.clone();
                items.sort();
                Fingerprint::Status {
                    path: path.clone(),
                    items,
                }
            }
            Command::Append { path, messages } => Fingerprint::Append {
                path: path.clone(),
                messages: messages
                    .iter()
                    .map(|m| (m.flags.clone(), m.date.clone(), m.literal.len()))
                    .collect(),
            },
            Command::Search { criteria, uid } => Fingerprint::Search {
                criteria: criteria.clone(),
                uid: *uid,
            },
            Command::Fetch {
                sequence,
                items,
                parts,
                uid,
            } => {
                let mut items = items.clone();
                items.sort();
                let mut parts = parts.clone();
                parts.sort();
                Fingerprint::Fetch {
                    sequence: sequence.clone(),
                    items,
                    parts,
                    uid: *uid,
                }
            }
            Command::Store {
                sequence,
                action,
                silent,
                flags,
                uid,
            } => {
                let mut flags = flags.clone();
                flags.sort();
                Fingerprint::Store {
                    sequence: sequence.clone(),
                    action: *action,
                    silent: *silent,
                    flags,
                    uid: *uid,
                }
            }
            Command::Copy {
                sequence,
                dest,
                uid,
            } => Fingerprint::Copy {
                sequence: sequence.clone(),
                dest: dest.clone(),
                uid: *uid,
            },
        }
    }

    /// Is `self` a value-duplicate of `other`? Same kind, same semantic
    /// parameters; list order does not matter.
    pub fn is_duplicate(&self, other: &Command) -> bool {
        if self.kind() != other.kind() {
            return false;
        }
        // Commands without meaningful parameters never count as repeats.
        if matches!(self.fingerprint(), Fingerprint::None) {
            return false;
        }
        self.fingerprint() == other.fingerprint()
    }

    /// Per-kind throttle hook run before the repeat check. Returns true if
    /// the command vetoes itself given the previous command.
    pub fn throttle(&mut self, previous: Option<&Command>, limit: u32) -> bool {
        match self {
            // CREATE floods are counted across differing paths.
            Command::Create { repeats, .. } => {
                *repeats = match previous {
                    Some(Command::Create { repeats: prev, .. }) => prev + 1,
                    _ => 1,
                };
                limit > 0 && *repeats > limit
            }
            // Known-bad Exchange header parts are stripped, not rejected.
            Command::Fetch { parts, .. } => {
                parts.retain(|p| !p.is_ignored_exchange_header());
                false
            }
            _ => false,
        }
    }

    /// Clone for throttle bookkeeping. Append payloads are replaced by
    /// length-preserving placeholders so the previous command does not pin
    /// literal spill files; everything that participates in value equality
    /// survives.
    pub fn shallow_clone(&self) -> Command {
        match self {
            Command::Capability => Command::Capability,
            Command::Noop => Command::Noop,
            Command::Logout => Command::Logout,
            Command::Starttls => Command::Starttls,
            Command::Id { params } => Command::Id {
                params: params.clone(),
            },
            Command::Login { username, password } => Command::Login {
                username: username.clone(),
                password: password.clone(),
            },
            Command::Select { path, qresync } => Command::Select {
                path: path.clone(),
                qresync: qresync.clone(),
            },
            Command::Examine { path, qresync } => Command::Examine {
                path: path.clone(),
                qresync: qresync.clone(),
            },
            Command::Create { path, repeats } => Command::Create {
                path: path.clone(),
                repeats: *repeats,
            },
            Command::Delete { path } => Command::Delete { path: path.clone() },
            Command::Rename { from, to } => Command::Rename {
                from: from.clone(),
                to: to.clone(),
            },
            Command::Subscribe { path } => Command::Subscribe { path: path.clone() },
            Command::Unsubscribe { path } => Command::Unsubscribe { path: path.clone() },
            Command::List {
                reference,
                patterns,
            } => Command::List {
                reference: reference.clone(),
                patterns: patterns.clone(),
            },
            Command::Lsub {
                reference,
                patterns,
            } => Command::Lsub {
                reference: reference.clone(),
                patterns: patterns.clone(),
            },
            Command::Status { path, items } => Command::Status {
                path: path.clone(),
                items: items.clone(),
            },
            Command::Append { path, messages } => Command::Append {
                path: path.clone(),
                messages: messages
                    .iter()
                    .map(|m| AppendMessage {
                        flags: m.flags.clone(),
                        date: m.date.clone(),
                        literal: Literal::from_stream(
                            Box::new(std::io::empty()),
                            m.literal.len(),
                        ),
                    })
                    .collect(),
            },
            Command::Check => Command::Check,
            Command::Close => Command::Close,
            Command::Expunge => Command::Expunge,
            Command::Search { criteria, uid } => Command::Search {
                criteria: criteria.clone(),
                uid: *uid,
            },
            Command::Fetch {
                sequence,
                items,
                parts,
                uid,
            } => Command::Fetch {
                sequence: sequence.clone(),
                items: items.clone(),
                parts: parts.clone(),
                uid: *uid,
            },
            Command::Store {
                sequence,
                action,
                silent,
                flags,
                uid,
            } => Command::Store {
                sequence: sequence.clone(),
                action: *action,
                silent: *silent,
                flags: flags.clone(),
                uid: *uid,
            },
            Command::Copy {
                sequence,
                dest,
                uid,
            } => Command::Copy {
                sequence: sequence.clone(),
                dest: dest.clone(),
                uid: *uid,
            },
            Command::Idle => Command::Idle,
            Command::Done => Command::Done,
        }
    }

    /// Commands that hold the per-account lock while executing.
    pub fn is_expensive(&self) -> bool {
        match self {
            Command::Fetch { parts, .. } => !parts.is_empty(),
            Command::Append { .. } | Command::Copy { .. } | Command::Search { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_parts() -> Vec<PartSpecifier> {
        vec![
            PartSpecifier {
                peek: false,
                section: "1".into(),
                modifier: Some("MIME".into()),
                headers: vec![],
                partial: None,
            },
            PartSpecifier {
                peek: true,
                section: String::new(),
                modifier: Some("HEADER.FIELDS".into()),
                headers: vec!["h1".into(), "h2".into()],
                partial: None,
            },
        ]
    }

    fn fetch(sequence: &str, items: &[&str], parts: Vec<PartSpecifier>) -> Command {
        Command::Fetch {
            sequence: sequence.into(),
            items: items.iter().map(|s| s.to_string()).collect(),
            parts,
            uid: false,
        }
    }

    #[test]
    fn test_fetch_duplicate_same_fields() {
        let a = fetch("1:*", &["FLAGS", "UID"], make_parts());
        let b = fetch("1:*", &["FLAGS", "UID"], make_parts());
        assert!(a.is_duplicate(&b));
    }

    #[test]
    fn test_fetch_duplicate_ignores_part_order() {
        let a = fetch("1:*", &["FLAGS", "UID"], make_parts());
        let mut parts = make_parts();
        parts.rotate_left(1);
        let b = fetch("1:*", &["UID", "FLAGS"], parts);
        assert!(a.is_duplicate(&b));
    }

    #[test]
    fn test_fetch_not_duplicate_different_sequence() {
        let a = fetch("1:*", &["FLAGS"], make_parts());
        let b = fetch("1:10", &["FLAGS"], make_parts());
        assert!(!a.is_duplicate(&b));
    }

    #[test]
    fn test_fetch_not_duplicate_different_headers() {
        let a = fetch("1:*", &["FLAGS"], make_parts());
        let mut parts = make_parts();
        parts[1].headers = vec!["h1".into(), "h3".into()];
        let b = fetch("1:*", &["FLAGS"], parts);
        assert!(!a.is_duplicate(&b));
    }

    #[test]
    fn test_fetch_not_duplicate_extra_part() {
        let a = fetch("1:*", &["FLAGS"], make_parts());
        let mut parts = make_parts();
        parts.push(PartSpecifier {
            peek: false,
            section: "2".into(),
            modifier: None,
            headers: vec![],
            partial: None,
        });
        let b = fetch("1:*", &["FLAGS"], parts);
        assert!(!a.is_duplicate(&b));
    }

    #[test]
    fn test_select_vs_examine_not_duplicates() {
        let select = Command::Select {
            path: "testfolder".into(),
            qresync: None,
        };
        let examine = Command::Examine {
            path: "testfolder".into(),
            qresync: None,
        };
        assert!(!select.is_duplicate(&examine));
        assert!(select.is_duplicate(&Command::Select {
            path: "testfolder".into(),
            qresync: None,
        }));
    }

    #[test]
    fn test_select_qresync_participates_in_equality() {
        let qresync = QresyncParams {
            uidvalidity: 123456,
            modseq: 1,
            known_uids: Some("knownUIDs".into()),
            seq_milestones: Some("seqMilestones".into()),
            uid_milestones: Some("uidMilestones".into()),
        };
        let a = Command::Select {
            path: "testfolder".into(),
            qresync: Some(qresync.clone()),
        };
        let mut other = qresync.clone();
        other.known_uids = Some("foo".into());
        let b = Command::Select {
            path: "testfolder".into(),
            qresync: Some(other),
        };
        assert!(!a.is_duplicate(&b));
        assert!(a.is_duplicate(&Command::Select {
            path: "testfolder".into(),
            qresync: Some(qresync),
        }));
    }

    #[test]
    fn test_copy_duplicate() {
        let a = Command::Copy {
            sequence: "10:20".into(),
            dest: "destFolder".into(),
            uid: false,
        };
        let b = Command::Copy {
            sequence: "10:20".into(),
            dest: "destFolder".into(),
            uid: false,
        };
        let c = Command::Copy {
            sequence: "10:20".into(),
            dest: "destFolderfoo".into(),
            uid: false,
        };
        assert!(a.is_duplicate(&b));
        assert!(!a.is_duplicate(&c));
    }

    #[test]
    fn test_append_duplicate_by_size_flags_date() {
        let make = |size: usize, flag: &str, date: &str| Command::Append {
            path: "testPath".into(),
            messages: vec![AppendMessage {
                flags: vec![flag.to_string()],
                date: Some(date.to_string()),
                literal: Literal::from_bytes(vec![b'x'; size]),
            }],
        };
        assert!(make(123, "F1", "d1").is_duplicate(&make(123, "F1", "d1")));
        assert!(!make(123, "F1", "d1").is_duplicate(&make(215, "F1", "d1")));
        assert!(!make(123, "F1", "d1").is_duplicate(&make(123, "F3", "d1")));
        assert!(!make(123, "F1", "d1").is_duplicate(&make(123, "F1", "d2")));
    }

    #[test]
    fn test_noop_never_a_duplicate() {
        assert!(!Command::Noop.is_duplicate(&Command::Noop));
    }

    #[test]
    fn test_exchange_header_part_stripped_not_throttled() {
        let mut cmd = fetch(
            "1:123",
            &["FLAGS"],
            vec![PartSpecifier {
                peek: false,
                section: String::new(),
                modifier: Some("HEADER.FIELDS".into()),
                headers: vec!["CONTENT-CLASS".into()],
                partial: None,
            }],
        );
        assert!(!cmd.throttle(None, 10));
        match cmd {
            Command::Fetch { parts, .. } => assert!(parts.is_empty()),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_create_counts_consecutive_creates() {
        let limit = 3;
        let mut prev = Command::Create {
            path: "f0".into(),
            repeats: 0,
        };
        assert!(!prev.throttle(None, limit));
        for i in 1..=limit {
            let mut next = Command::Create {
                path: format!("f{}", i),
                repeats: 0,
            };
            let throttled = next.throttle(Some(&prev), limit);
            if i == limit {
                assert!(throttled, "create {} should exceed the limit", i);
            } else {
                assert!(!throttled);
            }
            prev = next;
        }
    }
}
