//! Parsing one fully assembled command (line plus any literals) into a tag
//! and a typed [`Command`].

use crate::command::{
    AppendMessage, Command, PartSpecifier, QresyncParams, SearchCriteria, StoreAction,
};
use crate::error::{ImapError, Result};
use crate::proto::reader::WireReader;
use std::io::{BufRead, Cursor};

/// Parse a complete command buffer. Any literals announced on the command
/// line must already be present in `input` (the transport accumulator
/// guarantees this).
pub fn parse_command(input: &[u8], literal_memory_threshold: usize) -> Result<(String, Command)> {
    let mut r = WireReader::new(Cursor::new(input.to_vec()), literal_memory_threshold);

    // DONE terminates IDLE and carries no tag.
    let trimmed: &[u8] = match input {
        [rest @ .., b'\r', b'\n'] => rest,
        [rest @ .., b'\n'] => rest,
        _ => input,
    };
    if trimmed.eq_ignore_ascii_case(b"DONE") {
        return Ok((String::new(), Command::Done));
    }

    let tag = r.read_atom()?.as_str().to_string();
    r.skip_space()?;
    let mut verb = r.read_atom()?.as_str().to_ascii_uppercase();

    // UID FETCH/STORE/COPY/SEARCH share their base command's grammar.
    let uid = verb == "UID";
    if uid {
        r.skip_space()?;
        verb = r.read_atom()?.as_str().to_ascii_uppercase();
    }

    let command = match verb.as_str() {
        "CAPABILITY" => Command::Capability,
        "NOOP" => Command::Noop,
        "LOGOUT" => Command::Logout,
        "STARTTLS" => Command::Starttls,
        "CHECK" => Command::Check,
        "CLOSE" => Command::Close,
        "EXPUNGE" => Command::Expunge,
        "IDLE" => Command::Idle,
        "ID" => parse_id(&mut r)?,
        "LOGIN" => {
            r.skip_space()?;
            let username = r.read_text_string()?;
            r.skip_space()?;
            let password = r.read_text_string()?;
            Command::Login { username, password }
        }
        "SELECT" => {
            let (path, qresync) = parse_select_args(&mut r)?;
            Command::Select { path, qresync }
        }
        "EXAMINE" => {
            let (path, qresync) = parse_select_args(&mut r)?;
            Command::Examine { path, qresync }
        }
        "CREATE" => Command::Create {
            path: parse_mailbox_arg(&mut r)?,
            repeats: 0,
        },
        "DELETE" => Command::Delete {
            path: parse_mailbox_arg(&mut r)?,
        },
        "RENAME" => {
            r.skip_space()?;
            let from = r.read_text_string()?;
            r.skip_space()?;
            let to = r.read_text_string()?;
            Command::Rename { from, to }
        }
        "SUBSCRIBE" => Command::Subscribe {
            path: parse_mailbox_arg(&mut r)?,
        },
        "UNSUBSCRIBE" => Command::Unsubscribe {
            path: parse_mailbox_arg(&mut r)?,
        },
        "LIST" => {
            let (reference, patterns) = parse_list_args(&mut r)?;
            Command::List {
                reference,
                patterns,
            }
        }
        "LSUB" => {
            let (reference, patterns) = parse_list_args(&mut r)?;
            Command::Lsub {
                reference,
                patterns,
            }
        }
        "STATUS" => {
            r.skip_space()?;
            let path = r.read_text_string()?;
            r.skip_space()?;
            r.skip_char(b'(')?;
            let mut items = Vec::new();
            loop {
                items.push(r.read_atom()?.as_str().to_ascii_uppercase());
                if !r.skip_optional_space()? {
                    break;
                }
            }
            r.skip_char(b')')?;
            Command::Status { path, items }
        }
        "APPEND" => parse_append(&mut r)?,
        "SEARCH" => parse_search(&mut r, uid)?,
        "FETCH" => parse_fetch(&mut r, uid)?,
        "STORE" => parse_store(&mut r, uid)?,
        "COPY" => {
            r.skip_space()?;
            let sequence = r.read_sequence_set()?;
            r.skip_space()?;
            let dest = r.read_text_string()?;
            Command::Copy {
                sequence,
                dest,
                uid,
            }
        }
        other => {
            return Err(ImapError::syntax(format!("unknown command {other:?}")));
        }
    };

    Ok((tag, command))
}

fn parse_mailbox_arg<R: BufRead>(r: &mut WireReader<R>) -> Result<String> {
    r.skip_space()?;
    r.read_text_string()
}

fn parse_id<R: BufRead>(r: &mut WireReader<R>) -> Result<Command> {
    r.skip_space()?;
    if r.peek()? != Some(b'(') {
        // "ID NIL"
        let atom = r.read_atom()?;
        if atom == *"NIL" {
            return Ok(Command::Id { params: None });
        }
        return Err(ImapError::syntax("ID argument must be NIL or a list"));
    }
    r.skip_char(b'(')?;
    let mut params = Vec::new();
    while r.peek()? != Some(b')') {
        let key = r.read_text_string()?;
        r.skip_space()?;
        let value = if r.peek()? != Some(b'"') && r.peek()? != Some(b'{') {
            let v = r.read_atom()?;
            if v == *"NIL" {
                None
            } else {
                Some(v.as_str().to_string())
            }
        } else {
            Some(r.read_text_string()?)
        };
        params.push((key, value));
        if !r.skip_optional_space()? {
            break;
        }
    }
    r.skip_char(b')')?;
    Ok(Command::Id {
        params: Some(params),
    })
}

fn parse_select_args<R: BufRead>(
    r: &mut WireReader<R>,
) -> Result<(String, Option<QresyncParams>)> {
    r.skip_space()?;
    let path = r.read_text_string()?;
    if !r.skip_optional_space()? {
        return Ok((path, None));
    }

    r.skip_char(b'(')?;
    let keyword = r.read_atom()?;
    if keyword != *"QRESYNC" {
        return Err(ImapError::syntax(format!(
            "unknown select parameter {keyword}"
        )));
    }
    r.skip_space()?;
    r.skip_char(b'(')?;
    let uidvalidity = r.read_nz_number()?;
    r.skip_space()?;
    let modseq = r.read_number_u64()?;

    let mut params = QresyncParams {
        uidvalidity,
        modseq,
        ..QresyncParams::default()
    };
    if r.skip_optional_space()? {
        if r.peek()? != Some(b'(') {
            params.known_uids = Some(r.read_sequence_set()?);
        }
        if r.skip_optional_space()? || r.peek()? == Some(b'(') {
            r.skip_char(b'(')?;
            params.seq_milestones = Some(r.read_sequence_set()?);
            r.skip_space()?;
            params.uid_milestones = Some(r.read_sequence_set()?);
            r.skip_char(b')')?;
        }
    }
    r.skip_char(b')')?;
    r.skip_char(b')')?;
    Ok((path, Some(params)))
}

fn parse_list_args<R: BufRead>(r: &mut WireReader<R>) -> Result<(String, Vec<String>)> {
    r.skip_space()?;
    let reference = r.read_text_string()?;
    r.skip_space()?;

    // Extended LIST accepts a parenthesized pattern list.
    let mut patterns = Vec::new();
    if r.peek()? == Some(b'(') {
        r.skip_char(b'(')?;
        loop {
            patterns.push(r.read_mailbox_pattern()?);
            if !r.skip_optional_space()? {
                break;
            }
        }
        r.skip_char(b')')?;
    } else {
        patterns.push(r.read_mailbox_pattern()?);
    }
    Ok((reference, patterns))
}

fn parse_append<R: BufRead>(r: &mut WireReader<R>) -> Result<Command> {
    r.skip_space()?;
    let path = r.read_text_string()?;

    let mut messages = Vec::new();
    // MULTIAPPEND: message groups repeat until the line is exhausted.
    while r.skip_optional_space()? {
        let mut flags = Vec::new();
        if r.peek()? == Some(b'(') {
            r.skip_char(b'(')?;
            while r.peek()? != Some(b')') {
                flags.push(r.read_flag()?);
                r.skip_optional_space()?;
            }
            r.skip_char(b')')?;
            r.skip_space()?;
        }
        let date = if r.peek()? == Some(b'"') {
            let d = r.read_quoted()?;
            r.skip_space()?;
            Some(d)
        } else {
            None
        };
        let literal = r.read_literal()?;
        messages.push(AppendMessage {
            flags,
            date,
            literal,
        });
    }

    if messages.is_empty() {
        return Err(ImapError::syntax("APPEND requires at least one message"));
    }
    Ok(Command::Append { path, messages })
}

fn parse_search<R: BufRead>(r: &mut WireReader<R>, uid: bool) -> Result<Command> {
    r.skip_space()?;
    let first = r.read_atom()?.as_str().to_ascii_uppercase();
    let criteria = match first.as_str() {
        "ALL" => SearchCriteria::All,
        "UNSEEN" => SearchCriteria::Unseen,
        "DELETED" => SearchCriteria::Deleted,
        "SUBJECT" => {
            r.skip_space()?;
            SearchCriteria::Subject(r.read_text_string()?)
        }
        "FROM" => {
            r.skip_space()?;
            SearchCriteria::From(r.read_text_string()?)
        }
        "TO" => {
            r.skip_space()?;
            SearchCriteria::To(r.read_text_string()?)
        }
        "TEXT" => {
            r.skip_space()?;
            SearchCriteria::Text(r.read_text_string()?)
        }
        _ => {
            // Unmodeled criteria keep their raw text so value equality
            // still works for duplicate detection.
            let mut raw = first;
            while let Some(b) = r.peek()? {
                if b == b'\r' || b == b'\n' {
                    break;
                }
                raw.push(b as char);
                r.skip_char(b)?;
            }
            SearchCriteria::Raw(raw)
        }
    };
    Ok(Command::Search { criteria, uid })
}

fn parse_fetch<R: BufRead>(r: &mut WireReader<R>, uid: bool) -> Result<Command> {
    r.skip_space()?;
    let sequence = r.read_sequence_set()?;
    r.skip_space()?;

    let mut items = Vec::new();
    let mut parts = Vec::new();

    let parenthesized = r.peek()? == Some(b'(');
    if parenthesized {
        r.skip_char(b'(')?;
    }
    loop {
        parse_fetch_item(r, &mut items, &mut parts)?;
        if !r.skip_optional_space()? {
            break;
        }
        if parenthesized && r.peek()? == Some(b')') {
            break;
        }
        if !parenthesized {
            // A bare item list ends at the line terminator.
            if matches!(r.peek()?, Some(b'\r') | None) {
                break;
            }
        }
    }
    if parenthesized {
        r.skip_char(b')')?;
    }

    // FETCH macros expand to fixed attribute sets.
    if items.len() == 1 && parts.is_empty() {
        match items[0].as_str() {
            "ALL" => {
                items = ["FLAGS", "INTERNALDATE", "RFC822.SIZE", "ENVELOPE"]
                    .map(String::from)
                    .to_vec()
            }
            "FAST" => {
                items = ["FLAGS", "INTERNALDATE", "RFC822.SIZE"]
                    .map(String::from)
                    .to_vec()
            }
            "FULL" => {
                items = [
                    "FLAGS",
                    "INTERNALDATE",
                    "RFC822.SIZE",
                    "ENVELOPE",
                    "BODYSTRUCTURE",
                ]
                .map(String::from)
                .to_vec()
            }
            _ => {}
        }
    }

    Ok(Command::Fetch {
        sequence,
        items,
        parts,
        uid,
    })
}

fn parse_fetch_item<R: BufRead>(
    r: &mut WireReader<R>,
    items: &mut Vec<String>,
    parts: &mut Vec<PartSpecifier>,
) -> Result<()> {
    let name = r.read_atom()?.as_str().to_ascii_uppercase();
    if (name == "BODY" || name == "BODY.PEEK") && r.peek()? == Some(b'[') {
        let peek = name == "BODY.PEEK";
        parts.push(parse_part_specifier(r, peek)?);
        return Ok(());
    }
    items.push(name);
    Ok(())
}

fn parse_part_specifier<R: BufRead>(r: &mut WireReader<R>, peek: bool) -> Result<PartSpecifier> {
    r.skip_char(b'[')?;

    // Section text runs until a header list or the closing bracket.
    let mut section_text = String::new();
    loop {
        match r.peek()? {
            Some(b']') | Some(b'(') => break,
            Some(b' ') => {
                r.skip_space()?;
                break;
            }
            Some(b) => {
                section_text.push(b as char);
                r.skip_char(b)?;
            }
            None => return Err(ImapError::syntax("unterminated section specifier")),
        }
    }

    let mut headers = Vec::new();
    if r.peek()? == Some(b'(') {
        r.skip_char(b'(')?;
        while r.peek()? != Some(b')') {
            headers.push(r.read_text_string()?.to_ascii_uppercase());
            r.skip_optional_space()?;
        }
        r.skip_char(b')')?;
    }
    r.skip_char(b']')?;

    let partial = if r.peek()? == Some(b'<') {
        r.skip_char(b'<')?;
        let offset = r.read_number()?;
        r.skip_char(b'.')?;
        let count = r.read_number()?;
        r.skip_char(b'>')?;
        Some((offset, count))
    } else {
        None
    };

    let upper = section_text.to_ascii_uppercase();
    let (section, modifier) = if let Some(prefix) = upper.strip_suffix("HEADER.FIELDS.NOT") {
        (
            prefix.trim_end_matches('.').to_string(),
            Some("HEADER.FIELDS.NOT".to_string()),
        )
    } else if let Some(prefix) = upper.strip_suffix("HEADER.FIELDS") {
        (
            prefix.trim_end_matches('.').to_string(),
            Some("HEADER.FIELDS".to_string()),
        )
    } else {
        (upper, None)
    };

    Ok(PartSpecifier {
        peek,
        section,
        modifier,
        headers,
        partial,
    })
}

fn parse_store<R: BufRead>(r: &mut WireReader<R>, uid: bool) -> Result<Command> {
    r.skip_space()?;
    let sequence = r.read_sequence_set()?;
    r.skip_space()?;

    let mut op = String::new();
    if matches!(r.peek()?, Some(b'+') | Some(b'-')) {
        let sign = r.peek()?.ok_or_else(|| ImapError::syntax("store operation truncated"))?;
        r.skip_char(sign)?;
        op.push(sign as char);
    }
    op.push_str(r.read_atom()?.as_str());
    let op_upper = op.to_ascii_uppercase();

    let (base, silent) = match op_upper.strip_suffix(".SILENT") {
        Some(base) => (base, true),
        None => (op_upper.as_str(), false),
    };
    let action = match base {
        "+FLAGS" => StoreAction::Add,
        "-FLAGS" => StoreAction::Remove,
        "FLAGS" => StoreAction::Replace,
        other => {
            return Err(ImapError::syntax(format!(
                "unknown STORE operation {other:?}"
            )))
        }
    };

    r.skip_space()?;
    let mut flags = Vec::new();
    if r.peek()? == Some(b'(') {
        r.skip_char(b'(')?;
        while r.peek()? != Some(b')') {
            flags.push(r.read_flag()?);
            r.skip_optional_space()?;
        }
        r.skip_char(b')')?;
    } else {
        loop {
            flags.push(r.read_flag()?);
            if !r.skip_optional_space()? {
                break;
            }
        }
    }

    Ok(Command::Store {
        sequence,
        action,
        silent,
        flags,
        uid,
    })
}
