//! Upstream request/response engine: issues tagged commands over a byte
//! stream, routes untagged data to a handler, and checks tagged completions.
//!
//! This is the client half of the protocol, used when the mailbox for an
//! account lives on a remote store. Tags are monotonically increasing
//! (`C1`, `C2`, ...) and never reused within a connection.

use crate::error::{ImapError, Result};
use crate::proto::flags::Flags;
use crate::proto::response::{AppendUid, CopyUid, Response, ResponseCode, ResponseText, Status, UntaggedResponse};
use crate::proto::types::Literal;
use crate::proto::writer::WireWriter;
use std::io::{BufRead, BufReader, Read, Write};
use tracing::{debug, trace, warn};

/// One argument of an outgoing request.
pub enum RequestArg {
    Atom(String),
    Quoted(String),
    /// Quoted on the wire, replaced by `XXXX` in the request trace.
    Secret(String),
    Number(u64),
    Flags(Flags),
    Literal(Literal),
    /// Pre-rendered text appended verbatim (sequence sets, search criteria).
    Raw(String),
}

/// An outgoing command: verb plus arguments, tagged at send time.
pub struct Request {
    pub verb: String,
    pub args: Vec<RequestArg>,
}

impl Request {
    pub fn new<S: Into<String>>(verb: S) -> Self {
        Request {
            verb: verb.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: RequestArg) -> Self {
        self.args.push(arg);
        self
    }
}

/// Tagged completion of a request, with the redacted request trace attached
/// for diagnostics.
#[derive(Debug)]
pub struct TaggedResult {
    pub status: Status,
    pub text: ResponseText,
    pub request: String,
}

impl TaggedResult {
    /// Non-OK completion becomes `ImapError::CommandFailed` carrying the
    /// redacted request text.
    pub fn check(self) -> Result<ResponseText> {
        if self.status == Status::Ok {
            Ok(self.text)
        } else {
            Err(ImapError::CommandFailed {
                status: self.status.name().to_string(),
                request: self.request,
            })
        }
    }

    /// UIDPLUS APPENDUID payload, if the completion carried one.
    pub fn append_uid(&self) -> Option<&AppendUid> {
        match &self.text.code {
            Some(ResponseCode::AppendUid(a)) => Some(a),
            _ => None,
        }
    }

    /// UIDPLUS COPYUID payload, if the completion carried one.
    pub fn copy_uid(&self) -> Option<&CopyUid> {
        match &self.text.code {
            Some(ResponseCode::CopyUid(c)) => Some(c),
            _ => None,
        }
    }
}

pub struct ImapConnection<S> {
    stream: BufReader<S>,
    tag: u32,
    /// Negotiated LITERAL+ support: literals go out with `{n+}` headers and
    /// no continuation wait.
    literal_plus: bool,
}

impl<S: Read + Write> ImapConnection<S> {
    pub fn new(stream: S) -> Self {
        ImapConnection {
            stream: BufReader::new(stream),
            tag: 0,
            literal_plus: false,
        }
    }

    pub fn set_literal_plus(&mut self, enabled: bool) {
        self.literal_plus = enabled;
    }

    fn next_tag(&mut self) -> String {
        self.tag += 1;
        format!("C{}", self.tag)
    }

    /// Read the server greeting. PREAUTH and OK greetings are accepted; BYE
    /// means the server refused the connection.
    pub fn read_greeting(&mut self) -> Result<Status> {
        match self.read_response()? {
            Response::Untagged(UntaggedResponse::Condition(status, text)) => match status {
                Status::Ok | Status::Preauth => Ok(status),
                _ => Err(ImapError::CommandFailed {
                    status: status.name().to_string(),
                    request: format!("<greeting> {}", text.render()),
                }),
            },
            other => Err(ImapError::syntax(format!(
                "unexpected greeting {:?}",
                other
            ))),
        }
    }

    /// Send one request and read until its tagged completion. Untagged
    /// responses seen along the way go to `on_untagged`.
    pub fn send<F>(&mut self, mut request: Request, mut on_untagged: F) -> Result<TaggedResult>
    where
        F: FnMut(UntaggedResponse) -> Result<()>,
    {
        let tag = self.next_tag();
        let mut request_trace = String::new();

        let mut w = WireWriter::new(Vec::new());
        w.write_atom(&tag)?;
        w.write_space()?;
        w.write_atom(&request.verb)?;
        for arg in &mut request.args {
            w.write_space()?;
            match arg {
                RequestArg::Atom(a) => w.write_atom(a)?,
                RequestArg::Quoted(q) => w.write_quoted(q)?,
                RequestArg::Secret(s) => w.write_secret(s)?,
                RequestArg::Number(n) => w.write_number(*n)?,
                RequestArg::Flags(f) => w.write_flags(f)?,
                RequestArg::Raw(r) => w.write_raw(r)?,
                RequestArg::Literal(lit) => {
                    let header = if self.literal_plus {
                        format!("{{{}+}}", lit.len())
                    } else {
                        format!("{{{}}}", lit.len())
                    };
                    w.write_raw(&header)?;
                    // Header ends the line; octets follow after the
                    // continuation (or immediately with LITERAL+).
                    request_trace.push_str(&w.take_trace());
                    let mut segment = w.into_inner();
                    segment.extend_from_slice(b"\r\n");
                    self.stream.get_mut().write_all(&segment)?;
                    self.stream.get_mut().flush()?;

                    if !self.literal_plus {
                        self.await_continuation(&mut on_untagged)?;
                    }
                    lit.write_to(self.stream.get_mut())?;
                    request_trace.push_str(&format!("<{} octets>", lit.len()));
                    w = WireWriter::new(Vec::new());
                }
            }
        }
        request_trace.push_str(&w.take_trace());
        let mut tail = w.into_inner();
        tail.extend_from_slice(b"\r\n");
        self.stream.get_mut().write_all(&tail)?;
        self.stream.get_mut().flush()?;
        trace!(request = %request_trace, "request sent");

        loop {
            match self.read_response()? {
                Response::Continuation(_) => {
                    return Err(ImapError::syntax("continuation outside a literal"));
                }
                Response::Untagged(u) => on_untagged(u)?,
                Response::Tagged {
                    tag: got,
                    status,
                    text,
                } => {
                    if got != tag {
                        warn!(expected = %tag, got = %got, "tagged response for wrong tag");
                        return Err(ImapError::CommandFailed {
                            status: format!("tag mismatch ({} != {})", got, tag),
                            request: request_trace,
                        });
                    }
                    debug!(%tag, status = status.name(), "request completed");
                    return Ok(TaggedResult {
                        status,
                        text,
                        request: request_trace,
                    });
                }
            }
        }
    }

    /// Send a request and fail unless it completes OK.
    pub fn send_checked<F>(&mut self, request: Request, on_untagged: F) -> Result<ResponseText>
    where
        F: FnMut(UntaggedResponse) -> Result<()>,
    {
        self.send(request, on_untagged)?.check()
    }

    fn await_continuation<F>(&mut self, on_untagged: &mut F) -> Result<()>
    where
        F: FnMut(UntaggedResponse) -> Result<()>,
    {
        loop {
            match self.read_response()? {
                Response::Continuation(_) => return Ok(()),
                Response::Untagged(u) => on_untagged(u)?,
                Response::Tagged { status, text, .. } => {
                    // Completion before the literal was sent: the command
                    // was rejected outright.
                    return Err(ImapError::CommandFailed {
                        status: status.name().to_string(),
                        request: text.render(),
                    });
                }
            }
        }
    }

    fn read_response(&mut self) -> Result<Response> {
        let mut line = String::new();
        let n = self.stream.read_line(&mut line)?;
        if n == 0 {
            return Err(ImapError::SessionClosed);
        }
        trace!(line = %line.trim_end(), "response received");
        Response::parse(&line)
    }
}
