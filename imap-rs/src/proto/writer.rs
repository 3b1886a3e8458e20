//! Wire writer: token serialization, CRLF framing, and a redacted request
//! trace for diagnostics.

use crate::error::Result;
use crate::proto::flags::Flags;
use crate::proto::types::{ImapString, Literal};
use std::io::Write;

pub struct WireWriter<W> {
    inner: W,
    /// Human-readable copy of what was written on the current line, with
    /// secrets replaced. Reset by [`WireWriter::take_trace`].
    trace: String,
}

impl<W: Write> WireWriter<W> {
    pub fn new(inner: W) -> Self {
        WireWriter {
            inner,
            trace: String::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn emit(&mut self, bytes: &[u8], trace: &str) -> Result<()> {
        self.inner.write_all(bytes)?;
        self.trace.push_str(trace);
        Ok(())
    }

    pub fn write_raw(&mut self, text: &str) -> Result<()> {
        self.emit(text.as_bytes(), text)
    }

    pub fn write_space(&mut self) -> Result<()> {
        self.emit(b" ", " ")
    }

    pub fn write_atom(&mut self, atom: &str) -> Result<()> {
        self.write_raw(atom)
    }

    pub fn write_number(&mut self, n: u64) -> Result<()> {
        let s = n.to_string();
        self.write_raw(&s)
    }

    pub fn write_quoted(&mut self, text: &str) -> Result<()> {
        let mut encoded = String::with_capacity(text.len() + 2);
        encoded.push('"');
        for c in text.chars() {
            if c == '"' || c == '\\' {
                encoded.push('\\');
            }
            encoded.push(c);
        }
        encoded.push('"');
        self.write_raw(&encoded)
    }

    /// Write a quoted string whose value must not appear in diagnostics.
    pub fn write_secret(&mut self, text: &str) -> Result<()> {
        let mut encoded = String::with_capacity(text.len() + 2);
        encoded.push('"');
        for c in text.chars() {
            if c == '"' || c == '\\' {
                encoded.push('\\');
            }
            encoded.push(c);
        }
        encoded.push('"');
        self.emit(encoded.as_bytes(), "\"XXXX\"")
    }

    /// Write a literal: header, CRLF, octets. With `non_synchronizing` the
    /// header is `{n+}` and no continuation wait is implied. The octet
    /// payload is traced as a placeholder, not content.
    pub fn write_literal(&mut self, literal: &mut Literal, non_synchronizing: bool) -> Result<()> {
        let header = if non_synchronizing {
            format!("{{{}+}}\r\n", literal.len())
        } else {
            format!("{{{}}}\r\n", literal.len())
        };
        self.emit(header.as_bytes(), &header)?;
        literal.write_to(&mut self.inner)?;
        self.trace.push_str(&format!("<{} octets>", literal.len()));
        Ok(())
    }

    pub fn write_string(&mut self, s: &mut ImapString) -> Result<()> {
        match s {
            ImapString::Atom(a) => {
                let a = a.as_str().to_string();
                self.write_atom(&a)
            }
            ImapString::Quoted(q) => {
                let q = q.clone();
                self.write_quoted(&q)
            }
            ImapString::Literal(l) => self.write_literal(l, true),
        }
    }

    pub fn write_flags(&mut self, flags: &Flags) -> Result<()> {
        let encoded = flags.encode();
        self.write_raw(&encoded)
    }

    /// Terminate the line and flush: one line, one flush point.
    pub fn end_line(&mut self) -> Result<()> {
        self.inner.write_all(b"\r\n")?;
        self.inner.flush()?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    /// The redacted trace of everything written since the last call.
    pub fn take_trace(&mut self) -> String {
        std::mem::take(&mut self.trace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_framing_and_flush() {
        let mut w = WireWriter::new(Vec::new());
        w.write_atom("a1").unwrap();
        w.write_space().unwrap();
        w.write_atom("NOOP").unwrap();
        w.end_line().unwrap();
        assert_eq!(w.into_inner(), b"a1 NOOP\r\n");
    }

    #[test]
    fn test_quoted_escaping() {
        let mut w = WireWriter::new(Vec::new());
        w.write_quoted(r#"say "hi" \ bye"#).unwrap();
        assert_eq!(w.into_inner(), br#""say \"hi\" \\ bye""#);
    }

    #[test]
    fn test_secret_redacted_from_trace_but_written() {
        let mut w = WireWriter::new(Vec::new());
        w.write_atom("a1").unwrap();
        w.write_space().unwrap();
        w.write_atom("LOGIN").unwrap();
        w.write_space().unwrap();
        w.write_quoted("alice").unwrap();
        w.write_space().unwrap();
        w.write_secret("hunter2").unwrap();

        let trace = w.take_trace();
        assert_eq!(trace, r#"a1 LOGIN "alice" "XXXX""#);
        assert!(!trace.contains("hunter2"));

        w.end_line().unwrap();
        let wire = w.into_inner();
        assert!(std::str::from_utf8(&wire).unwrap().contains("hunter2"));
    }

    #[test]
    fn test_literal_header_and_payload() {
        let mut w = WireWriter::new(Vec::new());
        let mut lit = Literal::from_bytes(b"hello".to_vec());
        w.write_literal(&mut lit, false).unwrap();
        assert_eq!(w.into_inner(), b"{5}\r\nhello");
    }

    #[test]
    fn test_literal_plus_header() {
        let mut w = WireWriter::new(Vec::new());
        let mut lit = Literal::from_bytes(b"abc".to_vec());
        w.write_literal(&mut lit, true).unwrap();
        let out = w.into_inner();
        assert!(out.starts_with(b"{3+}\r\n"));
    }

    #[test]
    fn test_literal_trace_is_placeholder() {
        let mut w = WireWriter::new(Vec::new());
        let mut lit = Literal::from_bytes(b"secret-body".to_vec());
        w.write_literal(&mut lit, true).unwrap();
        let trace = w.take_trace();
        assert!(trace.contains("<11 octets>"));
        assert!(!trace.contains("secret-body"));
    }
}
