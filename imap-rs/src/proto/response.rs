//! Tagged and untagged response types, response-text codes, and their
//! wire rendering/parsing.

use crate::error::{ImapError, Result};
use crate::proto::flags::Flags;

/// Tagged completion / untagged condition status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    No,
    Bad,
    Preauth,
    Bye,
}

impl Status {
    pub fn name(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::No => "NO",
            Status::Bad => "BAD",
            Status::Preauth => "PREAUTH",
            Status::Bye => "BYE",
        }
    }

    pub fn parse(token: &str) -> Option<Status> {
        match token.to_ascii_uppercase().as_str() {
            "OK" => Some(Status::Ok),
            "NO" => Some(Status::No),
            "BAD" => Some(Status::Bad),
            "PREAUTH" => Some(Status::Preauth),
            "BYE" => Some(Status::Bye),
            _ => None,
        }
    }
}

/// UIDPLUS APPENDUID payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendUid {
    pub uidvalidity: u32,
    pub uids: Vec<u32>,
}

/// UIDPLUS COPYUID payload: source and destination UIDs in parallel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyUid {
    pub uidvalidity: u32,
    pub from: Vec<u32>,
    pub to: Vec<u32>,
}

/// Expand a UID set string (`a`, `a:b`, comma-separated) into its members.
pub fn parse_uid_set(input: &str) -> Result<Vec<u32>> {
    let mut out = Vec::new();
    for part in input.split(',') {
        match part.split_once(':') {
            Some((lo, hi)) => {
                let lo: u32 = lo
                    .parse()
                    .map_err(|_| ImapError::syntax(format!("bad uid-set element {part:?}")))?;
                let hi: u32 = hi
                    .parse()
                    .map_err(|_| ImapError::syntax(format!("bad uid-set element {part:?}")))?;
                let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
                out.extend(lo..=hi);
            }
            None => out.push(
                part.parse()
                    .map_err(|_| ImapError::syntax(format!("bad uid-set element {part:?}")))?,
            ),
        }
    }
    Ok(out)
}

/// Bracketed response code inside a status condition.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseCode {
    Alert,
    Parse,
    ReadOnly,
    ReadWrite,
    TryCreate,
    Closed,
    NoModSeq,
    BadCharset,
    UidValidity(u32),
    UidNext(u32),
    Unseen(u32),
    HighestModSeq(u64),
    PermanentFlags(Flags),
    Capability(Vec<String>),
    AppendUid(AppendUid),
    CopyUid(CopyUid),
    /// CONDSTORE MODIFIED, carrying the raw sequence set.
    Modified(String),
    /// Unrecognized code with its raw argument text.
    Other(String, Option<String>),
}

impl ResponseCode {
    fn parse(body: &str) -> Result<ResponseCode> {
        let (name, args) = match body.split_once(' ') {
            Some((n, a)) => (n, Some(a)),
            None => (body, None),
        };
        let code = match name.to_ascii_uppercase().as_str() {
            "ALERT" => ResponseCode::Alert,
            "PARSE" => ResponseCode::Parse,
            "READ-ONLY" => ResponseCode::ReadOnly,
            "READ-WRITE" => ResponseCode::ReadWrite,
            "TRYCREATE" => ResponseCode::TryCreate,
            "CLOSED" => ResponseCode::Closed,
            "NOMODSEQ" => ResponseCode::NoModSeq,
            "BADCHARSET" => ResponseCode::BadCharset,
            "UIDVALIDITY" => ResponseCode::UidValidity(parse_code_number(name, args)?),
            "UIDNEXT" => ResponseCode::UidNext(parse_code_number(name, args)?),
            "UNSEEN" => ResponseCode::Unseen(parse_code_number(name, args)?),
            "HIGHESTMODSEQ" => ResponseCode::HighestModSeq(parse_code_number(name, args)?),
            "PERMANENTFLAGS" => {
                let args = args.ok_or_else(|| ImapError::syntax("PERMANENTFLAGS without flags"))?;
                ResponseCode::PermanentFlags(Flags::decode(args)?)
            }
            "CAPABILITY" => ResponseCode::Capability(
                args.unwrap_or("")
                    .split_ascii_whitespace()
                    .map(str::to_string)
                    .collect(),
            ),
            "APPENDUID" => {
                let args = args.ok_or_else(|| ImapError::syntax("APPENDUID without arguments"))?;
                let mut it = args.split_ascii_whitespace();
                let uidvalidity = next_number(&mut it, "APPENDUID uidvalidity")?;
                let uids = parse_uid_set(
                    it.next()
                        .ok_or_else(|| ImapError::syntax("APPENDUID without uid set"))?,
                )?;
                ResponseCode::AppendUid(AppendUid {
                    uidvalidity: uidvalidity as u32,
                    uids,
                })
            }
            "COPYUID" => {
                let args = args.ok_or_else(|| ImapError::syntax("COPYUID without arguments"))?;
                let mut it = args.split_ascii_whitespace();
                let uidvalidity = next_number(&mut it, "COPYUID uidvalidity")?;
                let from = parse_uid_set(
                    it.next()
                        .ok_or_else(|| ImapError::syntax("COPYUID without source set"))?,
                )?;
                let to = parse_uid_set(
                    it.next()
                        .ok_or_else(|| ImapError::syntax("COPYUID without destination set"))?,
                )?;
                if from.len() != to.len() {
                    return Err(ImapError::syntax(format!(
                        "COPYUID set length mismatch: {} source vs {} destination",
                        from.len(),
                        to.len()
                    )));
                }
                ResponseCode::CopyUid(CopyUid {
                    uidvalidity: uidvalidity as u32,
                    from,
                    to,
                })
            }
            "MODIFIED" => ResponseCode::Modified(args.unwrap_or("").to_string()),
            _ => ResponseCode::Other(name.to_string(), args.map(str::to_string)),
        };
        Ok(code)
    }

    fn render(&self) -> String {
        match self {
            ResponseCode::Alert => "ALERT".into(),
            ResponseCode::Parse => "PARSE".into(),
            ResponseCode::ReadOnly => "READ-ONLY".into(),
            ResponseCode::ReadWrite => "READ-WRITE".into(),
            ResponseCode::TryCreate => "TRYCREATE".into(),
            ResponseCode::Closed => "CLOSED".into(),
            ResponseCode::NoModSeq => "NOMODSEQ".into(),
            ResponseCode::BadCharset => "BADCHARSET".into(),
            ResponseCode::UidValidity(n) => format!("UIDVALIDITY {}", n),
            ResponseCode::UidNext(n) => format!("UIDNEXT {}", n),
            ResponseCode::Unseen(n) => format!("UNSEEN {}", n),
            ResponseCode::HighestModSeq(n) => format!("HIGHESTMODSEQ {}", n),
            ResponseCode::PermanentFlags(f) => format!("PERMANENTFLAGS {}", f.encode()),
            ResponseCode::Capability(caps) => format!("CAPABILITY {}", caps.join(" ")),
            ResponseCode::AppendUid(a) => {
                format!("APPENDUID {} {}", a.uidvalidity, render_uid_set(&a.uids))
            }
            ResponseCode::CopyUid(c) => format!(
                "COPYUID {} {} {}",
                c.uidvalidity,
                render_uid_set(&c.from),
                render_uid_set(&c.to)
            ),
            ResponseCode::Modified(set) => format!("MODIFIED {}", set),
            ResponseCode::Other(name, Some(args)) => format!("{} {}", name, args),
            ResponseCode::Other(name, None) => name.clone(),
        }
    }
}

fn parse_code_number<T: std::str::FromStr>(name: &str, args: Option<&str>) -> Result<T> {
    args.and_then(|a| a.trim().parse().ok())
        .ok_or_else(|| ImapError::syntax(format!("{} requires a numeric argument", name)))
}

fn next_number<'a, I: Iterator<Item = &'a str>>(it: &mut I, what: &str) -> Result<u64> {
    it.next()
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| ImapError::syntax(format!("{} missing or not a number", what)))
}

/// Render UIDs as a compact uid-set, collapsing consecutive runs.
pub fn render_uid_set(uids: &[u32]) -> String {
    let mut out = String::new();
    let mut i = 0;
    while i < uids.len() {
        let start = uids[i];
        let mut end = start;
        while i + 1 < uids.len() && uids[i + 1] == end + 1 {
            i += 1;
            end = uids[i];
        }
        if !out.is_empty() {
            out.push(',');
        }
        if start == end {
            out.push_str(&start.to_string());
        } else {
            out.push_str(&format!("{}:{}", start, end));
        }
        i += 1;
    }
    out
}

/// Optional bracketed code plus free text.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseText {
    pub code: Option<ResponseCode>,
    pub text: String,
}

impl ResponseText {
    pub fn plain<S: Into<String>>(text: S) -> Self {
        ResponseText {
            code: None,
            text: text.into(),
        }
    }

    pub fn with_code<S: Into<String>>(code: ResponseCode, text: S) -> Self {
        ResponseText {
            code: Some(code),
            text: text.into(),
        }
    }

    pub fn parse(input: &str) -> Result<ResponseText> {
        let input = input.trim_end();
        if let Some(rest) = input.strip_prefix('[') {
            let end = rest
                .find(']')
                .ok_or_else(|| ImapError::syntax("unterminated response code"))?;
            let code = ResponseCode::parse(&rest[..end])?;
            let text = rest[end + 1..].trim_start().to_string();
            Ok(ResponseText {
                code: Some(code),
                text,
            })
        } else {
            Ok(ResponseText::plain(input))
        }
    }

    pub fn render(&self) -> String {
        match &self.code {
            Some(code) => format!("[{}] {}", code.render(), self.text),
            None => self.text.clone(),
        }
    }
}

/// One entry of a LIST/LSUB response.
#[derive(Debug, Clone, PartialEq)]
pub struct ListEntry {
    pub attributes: Vec<String>,
    pub delimiter: Option<char>,
    pub name: String,
}

impl ListEntry {
    pub fn render(&self) -> String {
        let delim = match self.delimiter {
            Some(d) => format!("\"{}\"", d),
            None => "NIL".to_string(),
        };
        format!("({}) {} \"{}\"", self.attributes.join(" "), delim, self.name)
    }

    pub fn parse(input: &str) -> Result<ListEntry> {
        let input = input.trim();
        let rest = input
            .strip_prefix('(')
            .ok_or_else(|| ImapError::syntax("LIST entry missing attribute list"))?;
        let close = rest
            .find(')')
            .ok_or_else(|| ImapError::syntax("LIST entry attribute list unterminated"))?;
        let attributes = rest[..close]
            .split_ascii_whitespace()
            .map(str::to_string)
            .collect();
        let mut rest = rest[close + 1..].trim_start();

        let delimiter = if rest.to_ascii_uppercase().starts_with("NIL") {
            rest = rest[3..].trim_start();
            None
        } else {
            let unquoted = rest
                .strip_prefix('"')
                .and_then(|r| r.split_once('"'))
                .ok_or_else(|| ImapError::syntax("LIST entry delimiter malformed"))?;
            let d = unquoted.0.chars().next();
            rest = unquoted.1.trim_start();
            d
        };

        let name = rest.trim().trim_matches('"').to_string();
        if name.is_empty() {
            return Err(ImapError::syntax("LIST entry without a mailbox name"));
        }
        Ok(ListEntry {
            attributes,
            delimiter,
            name,
        })
    }
}

/// An untagged (`*`-prefixed) response.
#[derive(Debug, Clone, PartialEq)]
pub enum UntaggedResponse {
    Condition(Status, ResponseText),
    Capability(Vec<String>),
    List(ListEntry),
    Lsub(ListEntry),
    Search(Vec<u32>),
    Flags(Flags),
    Exists(u32),
    Recent(u32),
    Expunge(u32),
    /// FETCH data for one sequence number; the attribute list is kept in
    /// rendered form.
    Fetch(u32, String),
    /// STATUS response: mailbox name plus raw attribute list.
    MailboxStatus(String, String),
    /// ID response payload (RFC 2971), NIL or a field list.
    Id(String),
}

impl UntaggedResponse {
    pub fn render(&self) -> String {
        match self {
            UntaggedResponse::Condition(status, rt) => {
                format!("* {} {}", status.name(), rt.render())
            }
            UntaggedResponse::Capability(caps) => format!("* CAPABILITY {}", caps.join(" ")),
            UntaggedResponse::List(e) => format!("* LIST {}", e.render()),
            UntaggedResponse::Lsub(e) => format!("* LSUB {}", e.render()),
            UntaggedResponse::Search(hits) => {
                let mut s = String::from("* SEARCH");
                for hit in hits {
                    s.push(' ');
                    s.push_str(&hit.to_string());
                }
                s
            }
            UntaggedResponse::Flags(f) => format!("* FLAGS {}", f.encode()),
            UntaggedResponse::Exists(n) => format!("* {} EXISTS", n),
            UntaggedResponse::Recent(n) => format!("* {} RECENT", n),
            UntaggedResponse::Expunge(n) => format!("* {} EXPUNGE", n),
            UntaggedResponse::Fetch(seq, data) => format!("* {} FETCH ({})", seq, data),
            UntaggedResponse::MailboxStatus(name, items) => {
                format!("* STATUS \"{}\" ({})", name, items)
            }
            UntaggedResponse::Id(fields) => format!("* ID {}", fields),
        }
    }

    /// Parse the part of an untagged line after `* `.
    pub fn parse(body: &str) -> Result<UntaggedResponse> {
        let body = body.trim_end();
        let (first, rest) = match body.split_once(' ') {
            Some((f, r)) => (f, r),
            None => (body, ""),
        };

        // "<n> EXISTS" / "<n> RECENT" / "<n> EXPUNGE" / "<n> FETCH (...)"
        if let Ok(n) = first.parse::<u32>() {
            let (word, args) = match rest.split_once(' ') {
                Some((w, a)) => (w, a),
                None => (rest, ""),
            };
            return match word.to_ascii_uppercase().as_str() {
                "EXISTS" => Ok(UntaggedResponse::Exists(n)),
                "RECENT" => Ok(UntaggedResponse::Recent(n)),
                "EXPUNGE" => Ok(UntaggedResponse::Expunge(n)),
                "FETCH" => {
                    let data = args
                        .trim()
                        .strip_prefix('(')
                        .and_then(|s| s.strip_suffix(')'))
                        .ok_or_else(|| ImapError::syntax("FETCH data not parenthesized"))?;
                    Ok(UntaggedResponse::Fetch(n, data.to_string()))
                }
                _ => Err(ImapError::syntax(format!(
                    "unknown numeric untagged response {word:?}"
                ))),
            };
        }

        if let Some(status) = Status::parse(first) {
            return Ok(UntaggedResponse::Condition(
                status,
                ResponseText::parse(rest)?,
            ));
        }

        match first.to_ascii_uppercase().as_str() {
            "CAPABILITY" => Ok(UntaggedResponse::Capability(
                rest.split_ascii_whitespace().map(str::to_string).collect(),
            )),
            "LIST" => Ok(UntaggedResponse::List(ListEntry::parse(rest)?)),
            "LSUB" => Ok(UntaggedResponse::Lsub(ListEntry::parse(rest)?)),
            "SEARCH" => {
                let mut hits = Vec::new();
                for tok in rest.split_ascii_whitespace() {
                    hits.push(tok.parse::<u32>().map_err(|_| {
                        ImapError::syntax(format!("SEARCH hit {tok:?} is not a number"))
                    })?);
                }
                Ok(UntaggedResponse::Search(hits))
            }
            "FLAGS" => Ok(UntaggedResponse::Flags(Flags::decode(rest)?)),
            "STATUS" => {
                let rest = rest.trim_start();
                let (name, items) = rest
                    .split_once(" (")
                    .ok_or_else(|| ImapError::syntax("STATUS response malformed"))?;
                Ok(UntaggedResponse::MailboxStatus(
                    name.trim_matches('"').to_string(),
                    items.trim_end_matches(')').to_string(),
                ))
            }
            "ID" => Ok(UntaggedResponse::Id(rest.to_string())),
            other => Err(ImapError::syntax(format!(
                "unknown untagged response {other:?}"
            ))),
        }
    }
}

/// A complete server response line.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// `+ ...` continuation request.
    Continuation(ResponseText),
    Untagged(UntaggedResponse),
    Tagged {
        tag: String,
        status: Status,
        text: ResponseText,
    },
}

impl Response {
    pub fn tagged_ok<S: Into<String>>(tag: S, text: ResponseText) -> Response {
        Response::Tagged {
            tag: tag.into(),
            status: Status::Ok,
            text,
        }
    }

    pub fn tagged_no<S: Into<String>, T: Into<String>>(tag: S, msg: T) -> Response {
        Response::Tagged {
            tag: tag.into(),
            status: Status::No,
            text: ResponseText::plain(msg),
        }
    }

    pub fn tagged_bad<S: Into<String>, T: Into<String>>(tag: S, msg: T) -> Response {
        Response::Tagged {
            tag: tag.into(),
            status: Status::Bad,
            text: ResponseText::plain(msg),
        }
    }

    pub fn bye<S: Into<String>>(msg: S) -> Response {
        Response::Untagged(UntaggedResponse::Condition(
            Status::Bye,
            ResponseText::plain(msg),
        ))
    }

    /// Wire form without the trailing CRLF.
    pub fn render(&self) -> String {
        match self {
            Response::Continuation(rt) => format!("+ {}", rt.render()),
            Response::Untagged(u) => u.render(),
            Response::Tagged { tag, status, text } => {
                format!("{} {} {}", tag, status.name(), text.render())
            }
        }
    }

    pub fn parse(line: &str) -> Result<Response> {
        let line = line.trim_end_matches(['\r', '\n']);
        if let Some(rest) = line.strip_prefix("+ ") {
            return Ok(Response::Continuation(ResponseText::parse(rest)?));
        }
        if line == "+" {
            return Ok(Response::Continuation(ResponseText::plain("")));
        }
        if let Some(rest) = line.strip_prefix("* ") {
            return Ok(Response::Untagged(UntaggedResponse::parse(rest)?));
        }

        let (tag, rest) = line
            .split_once(' ')
            .ok_or_else(|| ImapError::syntax("response line has no status"))?;
        let (status_tok, text) = match rest.split_once(' ') {
            Some((s, t)) => (s, t),
            None => (rest, ""),
        };
        let status = Status::parse(status_tok)
            .ok_or_else(|| ImapError::syntax(format!("unknown response status {status_tok:?}")))?;
        Ok(Response::Tagged {
            tag: tag.to_string(),
            status,
            text: ResponseText::parse(text)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::flags::SystemFlag;

    #[test]
    fn test_parse_tagged_ok_with_code() {
        let r = Response::parse("a1 OK [READ-WRITE] SELECT completed\r\n").unwrap();
        match r {
            Response::Tagged { tag, status, text } => {
                assert_eq!(tag, "a1");
                assert_eq!(status, Status::Ok);
                assert_eq!(text.code, Some(ResponseCode::ReadWrite));
                assert_eq!(text.text, "SELECT completed");
            }
            _ => panic!("expected tagged response"),
        }
    }

    #[test]
    fn test_parse_untagged_exists() {
        let r = Response::parse("* 23 EXISTS").unwrap();
        assert_eq!(r, Response::Untagged(UntaggedResponse::Exists(23)));
    }

    #[test]
    fn test_parse_uidvalidity_code() {
        let r = Response::parse("* OK [UIDVALIDITY 3857529045] UIDs valid").unwrap();
        match r {
            Response::Untagged(UntaggedResponse::Condition(Status::Ok, rt)) => {
                assert_eq!(rt.code, Some(ResponseCode::UidValidity(3857529045)));
            }
            _ => panic!("expected untagged OK"),
        }
    }

    #[test]
    fn test_parse_appenduid() {
        let code = ResponseCode::parse("APPENDUID 38505 3955").unwrap();
        assert_eq!(
            code,
            ResponseCode::AppendUid(AppendUid {
                uidvalidity: 38505,
                uids: vec![3955],
            })
        );
    }

    #[test]
    fn test_parse_copyuid_parallel_sets() {
        let code = ResponseCode::parse("COPYUID 38505 304,319:320 3956:3958").unwrap();
        assert_eq!(
            code,
            ResponseCode::CopyUid(CopyUid {
                uidvalidity: 38505,
                from: vec![304, 319, 320],
                to: vec![3956, 3957, 3958],
            })
        );
    }

    #[test]
    fn test_copyuid_length_mismatch_rejected() {
        let err = ResponseCode::parse("COPYUID 38505 304,319 3956:3958");
        assert!(matches!(err, Err(ImapError::ProtocolSyntax(_))));
    }

    #[test]
    fn test_uid_set_render_collapses_runs() {
        assert_eq!(render_uid_set(&[1, 2, 3, 7, 9, 10]), "1:3,7,9:10");
        assert_eq!(render_uid_set(&[5]), "5");
    }

    #[test]
    fn test_parse_list_entry() {
        let entry = ListEntry::parse(r#"(\Noselect \HasChildren) "/" "Archive""#).unwrap();
        assert_eq!(entry.attributes, vec!["\\Noselect", "\\HasChildren"]);
        assert_eq!(entry.delimiter, Some('/'));
        assert_eq!(entry.name, "Archive");
    }

    #[test]
    fn test_list_entry_roundtrip() {
        let entry = ListEntry {
            attributes: vec!["\\HasNoChildren".into()],
            delimiter: Some('/'),
            name: "INBOX".into(),
        };
        let rendered = format!("* LIST {}", entry.render());
        match Response::parse(&rendered).unwrap() {
            Response::Untagged(UntaggedResponse::List(e)) => assert_eq!(e, entry),
            _ => panic!("expected LIST"),
        }
    }

    #[test]
    fn test_render_permanentflags() {
        let mut flags = Flags::new();
        flags.set(SystemFlag::Deleted);
        flags.set(SystemFlag::Star);
        let rt = ResponseText::with_code(ResponseCode::PermanentFlags(flags), "Limited");
        assert_eq!(rt.render(), "[PERMANENTFLAGS (\\Deleted \\*)] Limited");
    }

    #[test]
    fn test_parse_continuation() {
        let r = Response::parse("+ Ready for literal data").unwrap();
        assert!(matches!(r, Response::Continuation(_)));
    }
}
