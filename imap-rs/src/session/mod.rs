//! Connection session: the state machine that turns parsed commands into
//! response sequences.
//!
//! The session core is synchronous and transport-agnostic. Both the
//! event-driven and the thread-per-connection adapters feed it complete
//! commands and write out the `Vec<Response>` it returns; fatal errors
//! propagate to the transport, everything else becomes a tagged NO or BAD
//! on the open connection.

pub mod auth;
pub mod credentials;
pub mod folder;
pub mod mailbox;

use crate::cache::{CacheKey, FolderCache};
use crate::command::account_lock::AccountLockTable;
use crate::command::throttle::CommandThrottle;
use crate::command::{AppendMessage, Command, CommandKind, PartSpecifier};
use crate::config::Config;
use crate::error::{ImapError, Result};
use crate::proto::fetch::MessageData;
use crate::proto::flags::{Flags, SystemFlag};
use crate::proto::response::{
    ListEntry, Response, ResponseCode, ResponseText, Status, UntaggedResponse,
};
use crate::session::auth::{AuthProvider, TokenCache};
use crate::session::credentials::{SessionCredentials, StoreLocality};
use crate::session::folder::PagedFolderState;
use crate::session::mailbox::{AppendItem, MailboxStore};
use chrono::DateTime;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Capabilities advertised in the greeting and CAPABILITY responses.
pub const CAPABILITIES: &[&str] = &[
    "IMAP4rev1",
    "LITERAL+",
    "UIDPLUS",
    "ID",
    "IDLE",
    "STARTTLS",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotAuthenticated,
    Authenticated,
    Selected,
    Logout,
}

pub struct Session {
    state: SessionState,
    config: Config,
    store: Box<dyn MailboxStore>,
    auth: Arc<dyn AuthProvider>,
    cache: Arc<dyn FolderCache>,
    locks: Arc<AccountLockTable>,
    throttle: CommandThrottle,
    token_cache: TokenCache,
    credentials: Option<SessionCredentials>,
    folder: Option<PagedFolderState>,
    idle_tag: Option<String>,
}

impl Session {
    pub fn new(
        config: Config,
        store: Box<dyn MailboxStore>,
        auth: Arc<dyn AuthProvider>,
        cache: Arc<dyn FolderCache>,
        locks: Arc<AccountLockTable>,
    ) -> Self {
        let throttle = CommandThrottle::new(config.throttle.repeat_limit);
        let token_cache = TokenCache::new(config.session.auth_token_cache_size);
        Session {
            state: SessionState::NotAuthenticated,
            config,
            store,
            auth,
            cache,
            locks,
            throttle,
            token_cache,
            credentials: None,
            folder: None,
            idle_tag: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        !matches!(self.state, SessionState::NotAuthenticated)
    }

    pub fn is_idling(&self) -> bool {
        self.idle_tag.is_some()
    }

    /// Execute one complete command. Returns the responses to write, or a
    /// fatal error that must close the connection.
    pub fn handle_command(&mut self, tag: &str, mut command: Command) -> Result<Vec<Response>> {
        if self.state == SessionState::Logout {
            return Err(ImapError::SessionClosed);
        }

        if self.throttle.check(&mut command, Instant::now()) {
            return Ok(vec![Response::tagged_no(
                tag,
                "request rate too high for this command",
            )]);
        }

        // Expensive commands serialize per account across all of the
        // account's sessions.
        let _account_lock = match (&self.credentials, command.is_expensive()) {
            (Some(creds), true) => match self.locks.acquire(creds.account_id()) {
                Ok(guard) => Some(guard),
                Err(ImapError::Throttled(msg)) => {
                    return Ok(vec![Response::tagged_no(tag, msg)]);
                }
                Err(e) => return Err(e),
            },
            _ => None,
        };

        let mut responses = Vec::new();
        if self.state == SessionState::Selected && flush_allowed(&command) {
            match self.drain_notifications() {
                Ok(mut flushed) => responses.append(&mut flushed),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => debug!(error = %e, "notification flush failed"),
            }
        }

        match self.dispatch(tag, command) {
            Ok(mut out) => {
                responses.append(&mut out);
                self.touch_cache();
                Ok(responses)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(ImapError::SessionClosed) => Err(ImapError::SessionClosed),
            Err(ImapError::ProtocolSyntax(msg)) => {
                responses.push(Response::tagged_bad(tag, msg));
                Ok(responses)
            }
            Err(ImapError::Throttled(msg)) => {
                responses.push(Response::tagged_no(tag, msg));
                Ok(responses)
            }
            Err(other) => {
                responses.push(Response::tagged_no(tag, other.to_string()));
                Ok(responses)
            }
        }
    }

    /// Release everything the connection holds: park the selected folder,
    /// push the RECENT boundary, drop cached tokens.
    pub fn teardown(&mut self) {
        self.deselect();
        self.token_cache.clear();
        self.state = SessionState::Logout;
    }

    fn dispatch(&mut self, tag: &str, command: Command) -> Result<Vec<Response>> {
        use SessionState::{Authenticated, NotAuthenticated, Selected};

        match (self.state, command) {
            (_, Command::Capability) => Ok(vec![
                Response::Untagged(UntaggedResponse::Capability(
                    CAPABILITIES.iter().map(|c| c.to_string()).collect(),
                )),
                Response::tagged_ok(tag, ResponseText::plain("CAPABILITY completed")),
            ]),
            (_, Command::Noop) => Ok(vec![Response::tagged_ok(
                tag,
                ResponseText::plain("NOOP completed"),
            )]),
            (_, Command::Logout) => {
                self.teardown();
                Ok(vec![
                    Response::bye("logging out"),
                    Response::tagged_ok(tag, ResponseText::plain("LOGOUT completed")),
                ])
            }
            (_, Command::Id { params }) => {
                if let Some(fields) = params {
                    debug!(client_id = ?fields, "client identified itself");
                }
                Ok(vec![
                    Response::Untagged(UntaggedResponse::Id(format!(
                        "(\"name\" \"imap-rs\" \"version\" \"{}\")",
                        env!("CARGO_PKG_VERSION")
                    ))),
                    Response::tagged_ok(tag, ResponseText::plain("ID completed")),
                ])
            }
            (NotAuthenticated, Command::Starttls) => Ok(vec![Response::tagged_ok(
                tag,
                ResponseText::plain("begin TLS negotiation now"),
            )]),
            (_, Command::Starttls) => Ok(vec![Response::tagged_bad(
                tag,
                "STARTTLS is only valid before authentication",
            )]),
            (NotAuthenticated, Command::Login { username, password }) => {
                self.login(tag, &username, &password)
            }
            (_, Command::Login { .. }) => {
                Ok(vec![Response::tagged_bad(tag, "already authenticated")])
            }
            (Authenticated | Selected, Command::Select { path, .. }) => {
                self.select(tag, &path, false)
            }
            (Authenticated | Selected, Command::Examine { path, .. }) => {
                self.select(tag, &path, true)
            }
            (Authenticated | Selected, Command::Create { path, .. }) => {
                let account = self.account_id()?;
                self.store.create_folder(&account, &path)?;
                info!(account = %account, folder = %path, "folder created");
                Ok(vec![Response::tagged_ok(
                    tag,
                    ResponseText::plain("CREATE completed"),
                )])
            }
            (Authenticated | Selected, Command::Delete { path }) => {
                let account = self.account_id()?;
                self.store.delete_folder(&account, &path)?;
                Ok(vec![Response::tagged_ok(
                    tag,
                    ResponseText::plain("DELETE completed"),
                )])
            }
            (Authenticated | Selected, Command::Rename { from, to }) => {
                let account = self.account_id()?;
                self.store.rename_folder(&account, &from, &to)?;
                Ok(vec![Response::tagged_ok(
                    tag,
                    ResponseText::plain("RENAME completed"),
                )])
            }
            (Authenticated | Selected, Command::Subscribe { path }) => {
                self.credentials_mut()?.subscribe(&path);
                Ok(vec![Response::tagged_ok(
                    tag,
                    ResponseText::plain("SUBSCRIBE completed"),
                )])
            }
            (Authenticated | Selected, Command::Unsubscribe { path }) => {
                self.credentials_mut()?.unsubscribe(&path);
                Ok(vec![Response::tagged_ok(
                    tag,
                    ResponseText::plain("UNSUBSCRIBE completed"),
                )])
            }
            (Authenticated | Selected, Command::List {
                reference,
                patterns,
            }) => self.list(tag, &reference, &patterns, false),
            (Authenticated | Selected, Command::Lsub {
                reference,
                patterns,
            }) => self.list(tag, &reference, &patterns, true),
            (Authenticated | Selected, Command::Status { path, items }) => {
                self.mailbox_status(tag, &path, &items)
            }
            (Authenticated | Selected, Command::Append { path, messages }) => {
                self.append(tag, &path, messages)
            }
            (Authenticated | Selected, Command::Idle) => {
                self.idle_tag = Some(tag.to_string());
                Ok(vec![Response::Continuation(ResponseText::plain("idling"))])
            }
            (_, Command::Done) => match self.idle_tag.take() {
                Some(idle_tag) => Ok(vec![Response::tagged_ok(
                    idle_tag,
                    ResponseText::plain("IDLE terminated"),
                )]),
                None => Ok(vec![Response::tagged_bad("*", "DONE without IDLE")]),
            },
            (Selected, Command::Check) => Ok(vec![Response::tagged_ok(
                tag,
                ResponseText::plain("CHECK completed"),
            )]),
            (Selected, Command::Close) => self.close(tag),
            (Selected, Command::Expunge) => self.expunge(tag),
            (Selected, Command::Search { criteria, uid }) => self.search(tag, &criteria, uid),
            (Selected, Command::Fetch {
                sequence,
                items,
                parts,
                uid,
            }) => self.fetch(tag, &sequence, &items, &parts, uid),
            (Selected, Command::Store {
                sequence,
                action,
                silent,
                flags,
                uid,
            }) => self.store_flags(tag, &sequence, action, silent, &flags, uid),
            (Selected, Command::Copy {
                sequence,
                dest,
                uid,
            }) => self.copy(tag, &sequence, &dest, uid),
            (_, other) => Ok(vec![Response::tagged_bad(
                tag,
                format!("{} is not valid in this state", other.name()),
            )]),
        }
    }

    fn login(&mut self, tag: &str, username: &str, password: &str) -> Result<Vec<Response>> {
        // Strip compatibility suffixes before asking the authority.
        let probe = SessionCredentials::new("", username, StoreLocality::Local);
        match self.auth.authenticate(probe.username(), password) {
            Ok(account_id) => {
                let creds = SessionCredentials::new(account_id, username, StoreLocality::Local);
                info!(account = creds.account_id(), user = creds.username(), "login");
                self.credentials = Some(creds);
                self.state = SessionState::Authenticated;
                Ok(vec![Response::tagged_ok(
                    tag,
                    ResponseText::with_code(
                        ResponseCode::Capability(
                            CAPABILITIES.iter().map(|c| c.to_string()).collect(),
                        ),
                        "LOGIN completed",
                    ),
                )])
            }
            Err(ImapError::AuthenticationFailed) => {
                warn!(user = username, "login rejected");
                Ok(vec![Response::tagged_no(tag, "LOGIN failed")])
            }
            Err(e) => Err(e),
        }
    }

    fn select(&mut self, tag: &str, path: &str, examine: bool) -> Result<Vec<Response>> {
        self.deselect();
        let account = self.account_id()?;
        let snapshot = self.store.snapshot(&account, path)?;

        let parked = CacheKey::parked(&account, path);
        let mut state = match self.cache.get(&parked) {
            Some(mut cached) if cached.uidvalidity() == snapshot.uidvalidity => {
                self.cache.remove(&parked);
                cached.refresh_recent_cutoff(snapshot.recent_cutoff);
                // Catch up on changes since the folder was parked, without
                // surfacing them: the client has not seen this folder yet.
                let events =
                    self.store
                        .poll_events(&account, path, cached.highest_modseq())?;
                for event in events {
                    cached.queue_event(event);
                }
                match cached.flush() {
                    Ok(_) => cached,
                    Err(e) => {
                        debug!(error = %e, "cached folder unusable, rebuilding");
                        PagedFolderState::from_snapshot(snapshot.clone())
                    }
                }
            }
            other => {
                if other.is_some() {
                    // UIDVALIDITY changed while parked.
                    self.cache.remove(&parked);
                }
                PagedFolderState::from_snapshot(snapshot.clone())
            }
        };
        state.set_read_only(examine || snapshot.read_only);

        let mut responses = Vec::new();
        let mut flags = state.folder_flags();
        flags.unset(SystemFlag::Star);
        responses.push(Response::Untagged(UntaggedResponse::Flags(flags)));
        responses.push(Response::Untagged(UntaggedResponse::Exists(state.exists())));
        responses.push(Response::Untagged(UntaggedResponse::Recent(state.recent())));
        if let Some(unseen) = state.first_unseen() {
            responses.push(Response::Untagged(UntaggedResponse::Condition(
                Status::Ok,
                ResponseText::with_code(ResponseCode::Unseen(unseen), "first unseen"),
            )));
        }
        let mut permanent = state.folder_flags();
        permanent.unset(SystemFlag::Recent);
        responses.push(Response::Untagged(UntaggedResponse::Condition(
            Status::Ok,
            ResponseText::with_code(ResponseCode::PermanentFlags(permanent), "flags permitted"),
        )));
        responses.push(Response::Untagged(UntaggedResponse::Condition(
            Status::Ok,
            ResponseText::with_code(ResponseCode::UidNext(state.uid_next()), "predicted next UID"),
        )));
        responses.push(Response::Untagged(UntaggedResponse::Condition(
            Status::Ok,
            ResponseText::with_code(ResponseCode::UidValidity(state.uidvalidity()), "UIDs valid"),
        )));
        responses.push(Response::Untagged(UntaggedResponse::Condition(
            Status::Ok,
            ResponseText::with_code(
                ResponseCode::HighestModSeq(state.highest_modseq()),
                "highest modseq",
            ),
        )));
        let (code, verb) = if state.read_only() {
            (ResponseCode::ReadOnly, "EXAMINE")
        } else {
            (ResponseCode::ReadWrite, "SELECT")
        };
        responses.push(Response::tagged_ok(
            tag,
            ResponseText::with_code(code, format!("{} completed", verb)),
        ));

        self.cache.put(&CacheKey::active(&account, path), &state);
        self.folder = Some(state);
        self.state = SessionState::Selected;
        Ok(responses)
    }

    fn close(&mut self, tag: &str) -> Result<Vec<Response>> {
        let read_only = self.folder.as_ref().map(|f| f.read_only()).unwrap_or(true);
        if !read_only {
            let account = self.account_id()?;
            let path = self.folder_path()?;
            // CLOSE expunges silently.
            self.store.expunge(&account, &path)?;
        }
        self.deselect();
        Ok(vec![Response::tagged_ok(
            tag,
            ResponseText::plain("CLOSE completed"),
        )])
    }

    fn expunge(&mut self, tag: &str) -> Result<Vec<Response>> {
        self.require_writable()?;
        let account = self.account_id()?;
        let path = self.folder_path()?;
        let removed = self.store.expunge(&account, &path)?;
        let folder = self.folder_mut()?;
        let mut responses = folder.expunge_uids(&removed);
        responses.push(Response::tagged_ok(
            tag,
            ResponseText::plain("EXPUNGE completed"),
        ));
        Ok(responses)
    }

    fn search(
        &mut self,
        tag: &str,
        criteria: &crate::command::SearchCriteria,
        uid: bool,
    ) -> Result<Vec<Response>> {
        let account = self.account_id()?;
        let path = self.folder_path()?;
        let hits = self.store.search(&account, &path, criteria)?;
        let folder = self.folder_ref()?;
        let numbers: Vec<u32> = if uid {
            hits.into_iter()
                .filter(|u| folder.msn_for_uid(*u).is_some())
                .collect()
        } else {
            hits.into_iter()
                .filter_map(|u| folder.msn_for_uid(u))
                .collect()
        };
        Ok(vec![
            Response::Untagged(UntaggedResponse::Search(numbers)),
            Response::tagged_ok(tag, ResponseText::plain("SEARCH completed")),
        ])
    }

    fn fetch(
        &mut self,
        tag: &str,
        sequence: &str,
        items: &[String],
        parts: &[PartSpecifier],
        uid_mode: bool,
    ) -> Result<Vec<Response>> {
        let account = self.account_id()?;
        let path = self.folder_path()?;
        let uids = self.folder_ref()?.resolve_sequence(sequence, uid_mode)?;
        let records = self.store.fetch(&account, &path, &uids)?;

        // A body fetch without .PEEK implies \Seen, unless read-only.
        let marks_seen =
            !self.folder_ref()?.read_only() && parts.iter().any(|p| !p.peek);
        if marks_seen {
            let mut seen = Flags::new();
            seen.set(SystemFlag::Seen);
            let updated = self.store.store_flags(
                &account,
                &path,
                &uids,
                crate::command::StoreAction::Add,
                &seen,
            )?;
            let folder = self.folder_mut()?;
            for item in &updated {
                folder.update_item(item);
            }
        }

        let folder = self.folder_ref()?;
        let mut responses = Vec::new();
        for record in &records {
            if let Some((msn, rendered)) = render_fetch(folder, record, items, parts, uid_mode) {
                responses.push(Response::Untagged(UntaggedResponse::Fetch(msn, rendered)));
            }
        }
        responses.push(Response::tagged_ok(
            tag,
            ResponseText::plain("FETCH completed"),
        ));
        Ok(responses)
    }

    fn store_flags(
        &mut self,
        tag: &str,
        sequence: &str,
        action: crate::command::StoreAction,
        silent: bool,
        flag_names: &[String],
        uid_mode: bool,
    ) -> Result<Vec<Response>> {
        self.require_writable()?;
        let account = self.account_id()?;
        let path = self.folder_path()?;
        let uids = self.folder_ref()?.resolve_sequence(sequence, uid_mode)?;
        let flags = Flags::from_names(flag_names.iter().map(String::as_str));
        let updated = self.store.store_flags(&account, &path, &uids, action, &flags)?;

        let folder = self.folder_mut()?;
        let mut responses = Vec::new();
        for item in &updated {
            folder.update_item(item);
            if silent {
                continue;
            }
            if let Some(msn) = folder.msn_for_uid(item.id) {
                let mut rendered = format!("FLAGS {}", item.flags.encode());
                if uid_mode {
                    rendered.push_str(&format!(" UID {}", item.id));
                }
                responses.push(Response::Untagged(UntaggedResponse::Fetch(msn, rendered)));
            }
        }
        responses.push(Response::tagged_ok(
            tag,
            ResponseText::plain("STORE completed"),
        ));
        Ok(responses)
    }

    fn copy(&mut self, tag: &str, sequence: &str, dest: &str, uid_mode: bool) -> Result<Vec<Response>> {
        let account = self.account_id()?;
        let path = self.folder_path()?;
        let uids = self.folder_ref()?.resolve_sequence(sequence, uid_mode)?;
        match self.store.copy(&account, &path, &uids, dest) {
            Ok(copied) => Ok(vec![Response::tagged_ok(
                tag,
                ResponseText::with_code(ResponseCode::CopyUid(copied), "COPY completed"),
            )]),
            Err(ImapError::Store(msg)) => Ok(vec![Response::Tagged {
                tag: tag.to_string(),
                status: Status::No,
                text: ResponseText::with_code(ResponseCode::TryCreate, msg),
            }]),
            Err(e) => Err(e),
        }
    }

    fn append(
        &mut self,
        tag: &str,
        path: &str,
        messages: Vec<AppendMessage>,
    ) -> Result<Vec<Response>> {
        let account = self.account_id()?;
        let mut items = Vec::with_capacity(messages.len());
        for message in messages {
            if message.literal.len() > self.config.session.max_literal_size as u64 {
                return Err(ImapError::syntax("message exceeds the literal size limit"));
            }
            let date = match &message.date {
                Some(raw) => Some(
                    DateTime::parse_from_str(raw.trim(), "%d-%b-%Y %H:%M:%S %z")
                        .map_err(|_| ImapError::syntax(format!("bad INTERNALDATE {raw:?}")))?,
                ),
                None => None,
            };
            items.push(AppendItem {
                flags: Flags::from_names(message.flags.iter().map(String::as_str)),
                date,
                body: message.literal,
            });
        }
        match self.store.append(&account, path, items) {
            Ok(appended) => Ok(vec![Response::tagged_ok(
                tag,
                ResponseText::with_code(ResponseCode::AppendUid(appended), "APPEND completed"),
            )]),
            Err(ImapError::Store(msg)) => Ok(vec![Response::Tagged {
                tag: tag.to_string(),
                status: Status::No,
                text: ResponseText::with_code(ResponseCode::TryCreate, msg),
            }]),
            Err(e) => Err(e),
        }
    }

    fn list(
        &mut self,
        tag: &str,
        reference: &str,
        patterns: &[String],
        subscribed_only: bool,
    ) -> Result<Vec<Response>> {
        let account = self.account_id()?;
        let mut responses = Vec::new();
        for pattern in patterns {
            // An empty pattern just asks for the hierarchy delimiter.
            if pattern.is_empty() {
                let entry = ListEntry {
                    attributes: vec!["\\Noselect".to_string()],
                    delimiter: Some('/'),
                    name: String::new(),
                };
                responses.push(Response::Untagged(UntaggedResponse::List(entry)));
                continue;
            }
            for info in self.store.list(&account, reference, pattern)? {
                let creds = self.credentials_ref()?;
                if creds.is_hidden(&info.path) {
                    continue;
                }
                if subscribed_only && !creds.is_subscribed(&info.path) {
                    continue;
                }
                let mut attributes = Vec::new();
                if !info.selectable {
                    attributes.push("\\Noselect".to_string());
                }
                attributes.push(if info.has_children {
                    "\\HasChildren".to_string()
                } else {
                    "\\HasNoChildren".to_string()
                });
                let entry = ListEntry {
                    attributes,
                    delimiter: info.delimiter,
                    name: info.path,
                };
                responses.push(Response::Untagged(if subscribed_only {
                    UntaggedResponse::Lsub(entry)
                } else {
                    UntaggedResponse::List(entry)
                }));
            }
        }
        let verb = if subscribed_only { "LSUB" } else { "LIST" };
        responses.push(Response::tagged_ok(
            tag,
            ResponseText::plain(format!("{} completed", verb)),
        ));
        Ok(responses)
    }

    fn mailbox_status(&mut self, tag: &str, path: &str, items: &[String]) -> Result<Vec<Response>> {
        let account = self.account_id()?;
        let status = self.store.status(&account, path)?;
        let mut fields = Vec::new();
        for item in items {
            let value = match item.as_str() {
                "MESSAGES" => status.messages,
                "RECENT" => status.recent,
                "UNSEEN" => status.unseen,
                "UIDNEXT" => status.uid_next,
                "UIDVALIDITY" => status.uidvalidity,
                other => {
                    return Err(ImapError::syntax(format!("unknown STATUS item {other:?}")));
                }
            };
            fields.push(format!("{} {}", item, value));
        }
        Ok(vec![
            Response::Untagged(UntaggedResponse::MailboxStatus(
                path.to_string(),
                fields.join(" "),
            )),
            Response::tagged_ok(tag, ResponseText::plain("STATUS completed")),
        ])
    }

    /// Pull queued store events into the folder and apply them.
    fn drain_notifications(&mut self) -> Result<Vec<Response>> {
        let account = self.account_id()?;
        let path = self.folder_path()?;
        let since = self.folder_ref()?.highest_modseq();
        let events = self.store.poll_events(&account, &path, since)?;
        let folder = self.folder_mut()?;
        for event in events {
            folder.queue_event(event);
        }
        if folder.has_pending() {
            folder.flush()
        } else {
            Ok(Vec::new())
        }
    }

    /// Park the selected folder: push the RECENT boundary (read-write
    /// only), refresh the cached copy, and rename it out of the active
    /// tier.
    fn deselect(&mut self) {
        let folder = match self.folder.take() {
            Some(f) => f,
            None => return,
        };
        let account = match &self.credentials {
            Some(c) => c.account_id().to_string(),
            None => return,
        };
        if !folder.read_only() {
            if let Err(e) =
                self.store
                    .set_recent_cutoff(&account, folder.path(), folder.close_cutoff())
            {
                // Best effort only; the next session recomputes RECENT.
                debug!(error = %e, folder = folder.path(), "recent boundary pushback failed");
            }
        }
        let active = CacheKey::active(&account, folder.path());
        let parked = CacheKey::parked(&account, folder.path());
        self.cache.remove(&active);
        self.cache.put(&active, &folder);
        self.cache.rename(&active, &parked);
        if self.state == SessionState::Selected {
            self.state = SessionState::Authenticated;
        }
    }

    fn touch_cache(&self) {
        if let (SessionState::Selected, Some(creds), Some(folder)) =
            (self.state, &self.credentials, &self.folder)
        {
            self.cache
                .update_access_time(&CacheKey::active(creds.account_id(), folder.path()));
        }
    }

    fn account_id(&self) -> Result<String> {
        self.credentials_ref().map(|c| c.account_id().to_string())
    }

    fn credentials_ref(&self) -> Result<&SessionCredentials> {
        self.credentials
            .as_ref()
            .ok_or(ImapError::AuthenticationFailed)
    }

    fn credentials_mut(&mut self) -> Result<&mut SessionCredentials> {
        self.credentials
            .as_mut()
            .ok_or(ImapError::AuthenticationFailed)
    }

    fn folder_ref(&self) -> Result<&PagedFolderState> {
        self.folder
            .as_ref()
            .ok_or_else(|| ImapError::syntax("no folder selected"))
    }

    fn folder_mut(&mut self) -> Result<&mut PagedFolderState> {
        self.folder
            .as_mut()
            .ok_or_else(|| ImapError::syntax("no folder selected"))
    }

    fn folder_path(&self) -> Result<String> {
        self.folder_ref().map(|f| f.path().to_string())
    }

    fn require_writable(&self) -> Result<()> {
        if self.folder_ref()?.read_only() {
            Err(ImapError::Store("folder is read-only".into()))
        } else {
            Ok(())
        }
    }
}

/// Notification flushes are held back during commands whose sequence
/// numbers an EXPUNGE would invalidate.
fn flush_allowed(command: &Command) -> bool {
    !matches!(
        command.kind(),
        CommandKind::Fetch
            | CommandKind::Store
            | CommandKind::Search
            | CommandKind::Select
            | CommandKind::Examine
            | CommandKind::Idle
            | CommandKind::Starttls
            | CommandKind::Login
    )
}

/// Render one FETCH response line body for a message.
fn render_fetch(
    folder: &PagedFolderState,
    record: &MessageData,
    items: &[String],
    parts: &[PartSpecifier],
    uid_mode: bool,
) -> Option<(u32, String)> {
    let uid = record.uid?;
    let msn = folder.msn_for_uid(uid)?;
    let mut out: Vec<String> = Vec::new();

    for item in items {
        match item.as_str() {
            "FLAGS" => {
                let flags = record
                    .flags
                    .clone()
                    .or_else(|| folder.item_for_uid(uid).map(|i| i.flags.clone()))
                    .unwrap_or_default();
                out.push(format!("FLAGS {}", flags.encode()));
            }
            "UID" => {} // always appended below in UID mode, once here otherwise
            "INTERNALDATE" => {
                if let Some(date) = record.internal_date {
                    out.push(format!(
                        "INTERNALDATE \"{}\"",
                        date.format("%d-%b-%Y %H:%M:%S %z")
                    ));
                }
            }
            "RFC822.SIZE" => {
                if let Some(size) = record.rfc822_size {
                    out.push(format!("RFC822.SIZE {}", size));
                }
            }
            "ENVELOPE" => {
                if let Some(env) = &record.envelope {
                    out.push(format!("ENVELOPE {}", env.render()));
                }
            }
            "BODY" | "BODYSTRUCTURE" => {
                if let Some(body) = &record.body_structure {
                    out.push(format!("BODYSTRUCTURE {}", body.render()));
                }
            }
            _ => {}
        }
    }

    for part in parts {
        if let Some(payload) = section_payload(record, part) {
            let mut label = format!("BODY[{}]", part_label(part));
            if let Some((offset, _)) = part.partial {
                label.push_str(&format!("<{}>", offset));
            }
            out.push(format!(
                "{} {{{}}}\r\n{}",
                label,
                payload.len(),
                String::from_utf8_lossy(&payload)
            ));
        }
    }

    if uid_mode || items.iter().any(|i| i == "UID") {
        out.push(format!("UID {}", uid));
    }
    Some((msn, out.join(" ")))
}

fn part_label(part: &PartSpecifier) -> String {
    let mut label = part.section.clone();
    if let Some(modifier) = &part.modifier {
        if !label.is_empty() {
            label.push('.');
        }
        label.push_str(modifier);
        if !part.headers.is_empty() {
            label.push_str(&format!(" ({})", part.headers.join(" ")));
        }
    }
    label
}

/// Look up (and post-process) the stored section bytes for a part
/// specifier. HEADER.FIELDS filtering and partial ranges are applied here.
fn section_payload(record: &MessageData, part: &PartSpecifier) -> Option<Vec<u8>> {
    let base_key = match &part.modifier {
        Some(m) if m.starts_with("HEADER.FIELDS") => {
            if part.section.is_empty() {
                "HEADER".to_string()
            } else {
                format!("{}.HEADER", part.section)
            }
        }
        Some(m) if part.section.is_empty() => m.clone(),
        Some(m) => format!("{}.{}", part.section, m),
        None => part.section.clone(),
    };
    let mut payload = record.sections.get(&base_key)?.clone();

    if let Some(modifier) = &part.modifier {
        if modifier.starts_with("HEADER.FIELDS") {
            let exclude = modifier.eq_ignore_ascii_case("HEADER.FIELDS.NOT");
            payload = filter_headers(&payload, &part.headers, exclude);
        }
    }

    if let Some((offset, count)) = part.partial {
        let start = (offset as usize).min(payload.len());
        let end = (start + count as usize).min(payload.len());
        payload = payload[start..end].to_vec();
    }
    Some(payload)
}

fn filter_headers(header_block: &[u8], names: &[String], exclude: bool) -> Vec<u8> {
    let text = String::from_utf8_lossy(header_block);
    let mut out = String::new();
    let mut keeping = false;
    for line in text.split("\r\n") {
        if line.is_empty() {
            break;
        }
        // Continuation lines belong to the previous header.
        if line.starts_with(' ') || line.starts_with('\t') {
            if keeping {
                out.push_str(line);
                out.push_str("\r\n");
            }
            continue;
        }
        let name = line.split(':').next().unwrap_or("");
        let named = names.iter().any(|n| n.eq_ignore_ascii_case(name));
        keeping = named != exclude;
        if keeping {
            out.push_str(line);
            out.push_str("\r\n");
        }
    }
    out.push_str("\r\n");
    out.into_bytes()
}
