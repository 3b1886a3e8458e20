//! ENVELOPE and BODYSTRUCTURE trees.
//!
//! Both arrive as nested parenthesized lists inside FETCH responses and are
//! parsed here into immutable trees via a small recursive-descent list
//! parser.

use crate::error::{ImapError, Result};

/// One node of a parenthesized list.
#[derive(Debug, Clone, PartialEq)]
pub enum ListItem {
    Nil,
    Number(u64),
    String(String),
    List(Vec<ListItem>),
}

impl ListItem {
    pub fn as_string(&self) -> Option<&str> {
        match self {
            ListItem::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<u64> {
        match self {
            ListItem::Number(n) => Some(*n),
            // Some servers quote numeric fields.
            ListItem::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ListItem]> {
        match self {
            ListItem::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, ListItem::Nil)
    }
}

/// Parse one parenthesized list from `input`. Literals must already have
/// been resolved into quoted form by the response reader.
pub fn parse_list(input: &str) -> Result<ListItem> {
    let mut chars = input.char_indices().peekable();
    let item = parse_item(input, &mut chars)?;
    Ok(item)
}

fn parse_item(
    src: &str,
    chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>,
) -> Result<ListItem> {
    skip_spaces(chars);
    match chars.peek().copied() {
        Some((_, '(')) => {
            chars.next();
            let mut items = Vec::new();
            loop {
                skip_spaces(chars);
                match chars.peek().copied() {
                    Some((_, ')')) => {
                        chars.next();
                        return Ok(ListItem::List(items));
                    }
                    Some(_) => items.push(parse_item(src, chars)?),
                    None => return Err(ImapError::syntax("unterminated parenthesized list")),
                }
            }
        }
        Some((_, '"')) => {
            chars.next();
            let mut s = String::new();
            loop {
                match chars.next() {
                    Some((_, '\\')) => match chars.next() {
                        Some((_, c)) => s.push(c),
                        None => return Err(ImapError::syntax("dangling escape in quoted string")),
                    },
                    Some((_, '"')) => return Ok(ListItem::String(s)),
                    Some((_, c)) => s.push(c),
                    None => return Err(ImapError::syntax("unterminated quoted string")),
                }
            }
        }
        Some((start, _)) => {
            let mut end = src.len();
            while let Some((i, c)) = chars.peek().copied() {
                if c == ' ' || c == ')' || c == '(' {
                    end = i;
                    break;
                }
                chars.next();
            }
            let token = &src[start..end];
            if token.eq_ignore_ascii_case("NIL") {
                Ok(ListItem::Nil)
            } else if let Ok(n) = token.parse::<u64>() {
                Ok(ListItem::Number(n))
            } else {
                Ok(ListItem::String(token.to_string()))
            }
        }
        None => Err(ImapError::syntax("empty list item")),
    }
}

fn skip_spaces(chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>) {
    while matches!(chars.peek(), Some((_, ' '))) {
        chars.next();
    }
}

/// An RFC 2822 address as transported in ENVELOPE structures.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Address {
    pub name: Option<String>,
    pub route: Option<String>,
    pub mailbox: Option<String>,
    pub host: Option<String>,
}

impl Address {
    fn from_item(item: &ListItem) -> Result<Address> {
        let fields = item
            .as_list()
            .ok_or_else(|| ImapError::syntax("address is not a list"))?;
        if fields.len() != 4 {
            return Err(ImapError::syntax(format!(
                "address needs 4 fields, found {}",
                fields.len()
            )));
        }
        let opt = |i: &ListItem| i.as_string().map(str::to_string);
        Ok(Address {
            name: opt(&fields[0]),
            route: opt(&fields[1]),
            mailbox: opt(&fields[2]),
            host: opt(&fields[3]),
        })
    }

    fn list_from_item(item: &ListItem) -> Result<Vec<Address>> {
        match item {
            ListItem::Nil => Ok(Vec::new()),
            ListItem::List(items) => items.iter().map(Address::from_item).collect(),
            _ => Err(ImapError::syntax("address list is neither NIL nor a list")),
        }
    }

    fn render(&self) -> String {
        format!(
            "({} {} {} {})",
            render_nstring(&self.name),
            render_nstring(&self.route),
            render_nstring(&self.mailbox),
            render_nstring(&self.host)
        )
    }

    fn render_list(addrs: &[Address]) -> String {
        if addrs.is_empty() {
            return "NIL".to_string();
        }
        let rendered: Vec<String> = addrs.iter().map(Address::render).collect();
        format!("({})", rendered.join(""))
    }
}

fn render_nstring(value: &Option<String>) -> String {
    match value {
        Some(s) => {
            let mut out = String::with_capacity(s.len() + 2);
            out.push('"');
            for c in s.chars() {
                if c == '"' || c == '\\' {
                    out.push('\\');
                }
                out.push(c);
            }
            out.push('"');
            out
        }
        None => "NIL".to_string(),
    }
}

/// Parsed ENVELOPE data.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Envelope {
    pub date: Option<String>,
    pub subject: Option<String>,
    pub from: Vec<Address>,
    pub sender: Vec<Address>,
    pub reply_to: Vec<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub in_reply_to: Option<String>,
    pub message_id: Option<String>,
}

impl Envelope {
    pub fn parse(input: &str) -> Result<Envelope> {
        Envelope::from_item(&parse_list(input)?)
    }

    pub fn from_item(item: &ListItem) -> Result<Envelope> {
        let fields = item
            .as_list()
            .ok_or_else(|| ImapError::syntax("envelope is not a list"))?;
        if fields.len() != 10 {
            return Err(ImapError::syntax(format!(
                "envelope needs 10 fields, found {}",
                fields.len()
            )));
        }
        Ok(Envelope {
            date: fields[0].as_string().map(str::to_string),
            subject: fields[1].as_string().map(str::to_string),
            from: Address::list_from_item(&fields[2])?,
            sender: Address::list_from_item(&fields[3])?,
            reply_to: Address::list_from_item(&fields[4])?,
            to: Address::list_from_item(&fields[5])?,
            cc: Address::list_from_item(&fields[6])?,
            bcc: Address::list_from_item(&fields[7])?,
            in_reply_to: fields[8].as_string().map(str::to_string),
            message_id: fields[9].as_string().map(str::to_string),
        })
    }

    /// Wire form: the ten-field parenthesized list.
    pub fn render(&self) -> String {
        format!(
            "({} {} {} {} {} {} {} {} {} {})",
            render_nstring(&self.date),
            render_nstring(&self.subject),
            Address::render_list(&self.from),
            Address::render_list(&self.sender),
            Address::render_list(&self.reply_to),
            Address::render_list(&self.to),
            Address::render_list(&self.cc),
            Address::render_list(&self.bcc),
            render_nstring(&self.in_reply_to),
            render_nstring(&self.message_id)
        )
    }
}

/// Parsed BODYSTRUCTURE data.
///
/// A multipart node carries only its children and subtype; a leaf part
/// always has an encoding and size.
#[derive(Debug, Clone, PartialEq)]
pub enum BodyStructure {
    Multipart {
        parts: Vec<BodyStructure>,
        subtype: String,
    },
    Part {
        media_type: String,
        subtype: String,
        params: Vec<(String, String)>,
        content_id: Option<String>,
        description: Option<String>,
        encoding: String,
        size: u64,
        /// Line count, present for TEXT/* parts.
        lines: Option<u64>,
        /// Nested message, present for MESSAGE/RFC822 parts.
        message: Option<Box<(Envelope, BodyStructure)>>,
    },
}

impl BodyStructure {
    pub fn parse(input: &str) -> Result<BodyStructure> {
        BodyStructure::from_item(&parse_list(input)?)
    }

    pub fn from_item(item: &ListItem) -> Result<BodyStructure> {
        let fields = item
            .as_list()
            .ok_or_else(|| ImapError::syntax("body structure is not a list"))?;
        if fields.is_empty() {
            return Err(ImapError::syntax("empty body structure"));
        }

        // Multipart: one or more nested structures followed by the subtype.
        if fields[0].as_list().is_some() {
            let mut parts = Vec::new();
            let mut idx = 0;
            while idx < fields.len() && fields[idx].as_list().is_some() {
                parts.push(BodyStructure::from_item(&fields[idx])?);
                idx += 1;
            }
            let subtype = fields
                .get(idx)
                .and_then(|f| f.as_string())
                .ok_or_else(|| ImapError::syntax("multipart body lacks a subtype"))?;
            return Ok(BodyStructure::Multipart {
                parts,
                subtype: subtype.to_string(),
            });
        }

        if fields.len() < 7 {
            return Err(ImapError::syntax(format!(
                "body part needs at least 7 fields, found {}",
                fields.len()
            )));
        }

        let media_type = fields[0]
            .as_string()
            .ok_or_else(|| ImapError::syntax("body part media type missing"))?
            .to_string();
        let subtype = fields[1]
            .as_string()
            .ok_or_else(|| ImapError::syntax("body part subtype missing"))?
            .to_string();

        let mut params = Vec::new();
        if let Some(items) = fields[2].as_list() {
            let mut it = items.iter();
            while let (Some(k), Some(v)) = (it.next(), it.next()) {
                if let (Some(k), Some(v)) = (k.as_string(), v.as_string()) {
                    params.push((k.to_string(), v.to_string()));
                }
            }
        }

        let encoding = fields[5]
            .as_string()
            .ok_or_else(|| ImapError::syntax("body part encoding missing"))?
            .to_string();
        let size = fields[6]
            .as_number()
            .ok_or_else(|| ImapError::syntax("body part size missing"))?;

        let is_text = media_type.eq_ignore_ascii_case("TEXT");
        let is_message = media_type.eq_ignore_ascii_case("MESSAGE")
            && subtype.eq_ignore_ascii_case("RFC822");

        let lines = if is_text {
            fields.get(7).and_then(|f| f.as_number())
        } else if is_message {
            fields.get(9).and_then(|f| f.as_number())
        } else {
            None
        };

        let message = if is_message {
            match (fields.get(7), fields.get(8)) {
                (Some(env), Some(body)) if !env.is_nil() && !body.is_nil() => Some(Box::new((
                    Envelope::from_item(env)?,
                    BodyStructure::from_item(body)?,
                ))),
                _ => None,
            }
        } else {
            None
        };

        Ok(BodyStructure::Part {
            media_type,
            subtype,
            params,
            content_id: fields[3].as_string().map(str::to_string),
            description: fields[4].as_string().map(str::to_string),
            encoding,
            size,
            lines,
            message,
        })
    }

    pub fn is_multipart(&self) -> bool {
        matches!(self, BodyStructure::Multipart { .. })
    }

    /// Wire form, inverse of [`BodyStructure::parse`].
    pub fn render(&self) -> String {
        match self {
            BodyStructure::Multipart { parts, subtype } => {
                let rendered: Vec<String> = parts.iter().map(BodyStructure::render).collect();
                format!("({} {})", rendered.join(""), quote(subtype))
            }
            BodyStructure::Part {
                media_type,
                subtype,
                params,
                content_id,
                description,
                encoding,
                size,
                lines,
                message,
            } => {
                let params = if params.is_empty() {
                    "NIL".to_string()
                } else {
                    let kv: Vec<String> = params
                        .iter()
                        .flat_map(|(k, v)| [quote(k), quote(v)])
                        .collect();
                    format!("({})", kv.join(" "))
                };
                let mut out = format!(
                    "({} {} {} {} {} {} {}",
                    quote(media_type),
                    quote(subtype),
                    params,
                    render_nstring(content_id),
                    render_nstring(description),
                    quote(encoding),
                    size
                );
                if let Some(boxed) = message {
                    let (env, body) = boxed.as_ref();
                    out.push(' ');
                    out.push_str(&env.render());
                    out.push(' ');
                    out.push_str(&body.render());
                }
                if let Some(lines) = lines {
                    out.push(' ');
                    out.push_str(&lines.to_string());
                }
                out.push(')');
                out
            }
        }
    }
}

fn quote(s: &str) -> String {
    render_nstring(&Some(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_envelope() {
        let env = Envelope::parse(
            r#"("Mon, 7 Feb 1994 21:52:25 -0800" "Hello" (("Alice" NIL "alice" "example.com")) NIL NIL (("Bob" NIL "bob" "example.com")) NIL NIL NIL "<id1@example.com>")"#,
        )
        .unwrap();

        assert_eq!(env.subject.as_deref(), Some("Hello"));
        assert_eq!(env.from.len(), 1);
        assert_eq!(env.from[0].mailbox.as_deref(), Some("alice"));
        assert_eq!(env.from[0].host.as_deref(), Some("example.com"));
        assert!(env.sender.is_empty());
        assert_eq!(env.message_id.as_deref(), Some("<id1@example.com>"));
    }

    #[test]
    fn test_parse_text_part() {
        let body =
            BodyStructure::parse(r#"("TEXT" "PLAIN" ("CHARSET" "US-ASCII") NIL NIL "7BIT" 2279 48)"#)
                .unwrap();
        match body {
            BodyStructure::Part {
                media_type,
                subtype,
                encoding,
                size,
                lines,
                ..
            } => {
                assert_eq!(media_type, "TEXT");
                assert_eq!(subtype, "PLAIN");
                assert_eq!(encoding, "7BIT");
                assert_eq!(size, 2279);
                assert_eq!(lines, Some(48));
            }
            _ => panic!("expected leaf part"),
        }
    }

    #[test]
    fn test_parse_multipart() {
        let body = BodyStructure::parse(
            r#"(("TEXT" "PLAIN" ("CHARSET" "US-ASCII") NIL NIL "7BIT" 1152 23)("TEXT" "HTML" ("CHARSET" "US-ASCII") NIL NIL "BASE64" 4554 73) "ALTERNATIVE")"#,
        )
        .unwrap();

        match &body {
            BodyStructure::Multipart { parts, subtype } => {
                assert_eq!(subtype, "ALTERNATIVE");
                assert_eq!(parts.len(), 2);
                assert!(parts.iter().all(|p| !p.is_multipart()));
            }
            _ => panic!("expected multipart"),
        }
        assert!(body.is_multipart());
    }

    #[test]
    fn test_multipart_without_subtype_rejected() {
        let err = BodyStructure::parse(r#"(("TEXT" "PLAIN" NIL NIL NIL "7BIT" 10 1))"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_envelope_render_parses_back() {
        let env = Envelope {
            date: Some("Mon, 7 Feb 1994 21:52:25 -0800".into()),
            subject: Some("Hello".into()),
            from: vec![Address {
                name: Some("Alice".into()),
                route: None,
                mailbox: Some("alice".into()),
                host: Some("example.com".into()),
            }],
            message_id: Some("<id1@example.com>".into()),
            ..Envelope::default()
        };
        let reparsed = Envelope::parse(&env.render()).unwrap();
        assert_eq!(reparsed, env);
    }

    #[test]
    fn test_bodystructure_render_parses_back() {
        let body = BodyStructure::parse(
            r#"(("TEXT" "PLAIN" ("CHARSET" "US-ASCII") NIL NIL "7BIT" 1152 23)("TEXT" "HTML" ("CHARSET" "US-ASCII") NIL NIL "BASE64" 4554 73) "ALTERNATIVE")"#,
        )
        .unwrap();
        let reparsed = BodyStructure::parse(&body.render()).unwrap();
        assert_eq!(reparsed, body);
    }

    #[test]
    fn test_unterminated_list_rejected() {
        assert!(parse_list("(\"a\" (\"b\"").is_err());
        assert!(parse_list(r#"("unclosed"#).is_err());
    }
}
