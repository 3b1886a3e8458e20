//! Streaming reader for the IMAP token grammar.
//!
//! Each `read_*` method consumes exactly the bytes belonging to its token
//! and fails with `ImapError::ProtocolSyntax` on malformed input, leaving
//! the caller free to answer with a tagged BAD and keep the connection.

use crate::error::{ImapError, Result};
use crate::proto::types::{Atom, ImapString, Literal};
use std::io::BufRead;

/// Header of a literal token: octet count plus the LITERAL+ marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiteralHeader {
    pub len: u64,
    /// `{n+}`: the client sends the octets without waiting for a
    /// continuation prompt.
    pub non_synchronizing: bool,
}

pub struct WireReader<R> {
    inner: R,
    /// Literals above this many octets spill to a temporary file.
    memory_threshold: usize,
}

impl<R: BufRead> WireReader<R> {
    pub fn new(inner: R, memory_threshold: usize) -> Self {
        WireReader {
            inner,
            memory_threshold,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn peek_byte(&mut self) -> Result<Option<u8>> {
        let buf = self.inner.fill_buf()?;
        Ok(buf.first().copied())
    }

    fn next_byte(&mut self) -> Result<u8> {
        match self.peek_byte()? {
            Some(b) => {
                self.inner.consume(1);
                Ok(b)
            }
            None => Err(ImapError::syntax("unexpected end of input")),
        }
    }

    /// Peek without consuming; `None` at end of input.
    pub fn peek(&mut self) -> Result<Option<u8>> {
        self.peek_byte()
    }

    pub fn at_end(&mut self) -> Result<bool> {
        Ok(self.peek_byte()?.is_none())
    }

    /// Consume one expected byte.
    pub fn skip_char(&mut self, expected: u8) -> Result<()> {
        let b = self.next_byte()?;
        if b != expected {
            return Err(ImapError::syntax(format!(
                "expected {:?}, found {:?}",
                expected as char, b as char
            )));
        }
        Ok(())
    }

    pub fn skip_space(&mut self) -> Result<()> {
        self.skip_char(b' ')
    }

    /// Consume a space if one is next; reports whether it did.
    pub fn skip_optional_space(&mut self) -> Result<bool> {
        if self.peek_byte()? == Some(b' ') {
            self.inner.consume(1);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn read_crlf(&mut self) -> Result<()> {
        self.skip_char(b'\r')?;
        self.skip_char(b'\n')
    }

    /// Read the rest of the current line, not including CRLF.
    pub fn read_line(&mut self) -> Result<String> {
        let mut out = Vec::new();
        loop {
            match self.next_byte()? {
                b'\r' => {
                    self.skip_char(b'\n')?;
                    break;
                }
                b'\n' => break,
                b => out.push(b),
            }
        }
        String::from_utf8(out).map_err(|_| ImapError::syntax("line is not valid UTF-8"))
    }

    pub fn read_atom(&mut self) -> Result<Atom> {
        let mut out = Vec::new();
        while let Some(b) = self.peek_byte()? {
            if !Atom::is_atom_char(b) {
                break;
            }
            out.push(b);
            self.inner.consume(1);
        }
        if out.is_empty() {
            return Err(ImapError::syntax(format!(
                "expected atom, found {:?}",
                self.peek_byte()?.map(|b| b as char)
            )));
        }
        // is_atom_char admits only printable ASCII.
        let s = String::from_utf8(out).map_err(|_| ImapError::syntax("atom is not ASCII"))?;
        Ok(Atom::new(s))
    }

    /// Read a quoted string, unescaping `\"` and `\\`.
    pub fn read_quoted(&mut self) -> Result<String> {
        self.skip_char(b'"')?;
        let mut out = Vec::new();
        loop {
            match self.next_byte()? {
                b'"' => break,
                b'\\' => out.push(self.next_byte()?),
                b'\r' | b'\n' => {
                    return Err(ImapError::syntax("CR/LF inside quoted string"));
                }
                0 => return Err(ImapError::syntax("NUL inside quoted string")),
                b => out.push(b),
            }
        }
        String::from_utf8(out).map_err(|_| ImapError::syntax("quoted string is not valid UTF-8"))
    }

    /// Read the `{n}` / `{n+}` literal header and the terminating CRLF.
    ///
    /// The caller is responsible for any continuation prompt before calling
    /// [`WireReader::read_literal_octets`]; non-synchronizing literals need
    /// none.
    pub fn read_literal_header(&mut self) -> Result<LiteralHeader> {
        self.skip_char(b'{')?;
        let len = self.read_number_u64()?;
        let non_synchronizing = if self.peek_byte()? == Some(b'+') {
            self.inner.consume(1);
            true
        } else {
            false
        };
        self.skip_char(b'}')?;
        self.read_crlf()?;
        Ok(LiteralHeader {
            len,
            non_synchronizing,
        })
    }

    /// Read exactly `header.len` octets, spilling to a temporary file above
    /// the memory threshold. The returned literal owns the spill file.
    pub fn read_literal_octets(&mut self, header: LiteralHeader) -> Result<Literal> {
        Literal::spool(&mut self.inner, header.len, self.memory_threshold)
    }

    /// Read a complete literal token (header + octets). Only correct when
    /// the octets are already available without a continuation round-trip,
    /// i.e. LITERAL+ or pre-assembled input.
    pub fn read_literal(&mut self) -> Result<Literal> {
        let header = self.read_literal_header()?;
        self.read_literal_octets(header)
    }

    /// Read any of the three string encodings.
    pub fn read_string(&mut self) -> Result<ImapString> {
        match self.peek_byte()? {
            Some(b'"') => Ok(ImapString::Quoted(self.read_quoted()?)),
            Some(b'{') => Ok(ImapString::Literal(self.read_literal()?)),
            _ => Ok(ImapString::Atom(self.read_atom()?)),
        }
    }

    /// Read a string token and decode it to text.
    pub fn read_text_string(&mut self) -> Result<String> {
        self.read_string()?.into_text()
    }

    /// Read a LIST pattern: an atom extended with the `%` and `*`
    /// wildcards, or any quoted/literal string.
    pub fn read_mailbox_pattern(&mut self) -> Result<String> {
        match self.peek_byte()? {
            Some(b'"') | Some(b'{') => self.read_text_string(),
            _ => {
                let mut out = Vec::new();
                while let Some(b) = self.peek_byte()? {
                    if Atom::is_atom_char(b) || b == b'%' || b == b'*' {
                        out.push(b);
                        self.inner.consume(1);
                    } else {
                        break;
                    }
                }
                if out.is_empty() {
                    return Err(ImapError::syntax("expected mailbox pattern"));
                }
                String::from_utf8(out).map_err(|_| ImapError::syntax("pattern is not ASCII"))
            }
        }
    }

    /// Read one flag: `\Atom`, `\*`, or a bare keyword atom.
    pub fn read_flag(&mut self) -> Result<String> {
        if self.peek_byte()? == Some(b'\\') {
            self.inner.consume(1);
            if self.peek_byte()? == Some(b'*') {
                self.inner.consume(1);
                return Ok("\\*".to_string());
            }
            let atom = self.read_atom()?;
            Ok(format!("\\{}", atom))
        } else {
            Ok(self.read_atom()?.as_str().to_string())
        }
    }

    pub fn read_number_u64(&mut self) -> Result<u64> {
        let mut seen = false;
        let mut value: u64 = 0;
        while let Some(b) = self.peek_byte()? {
            if !b.is_ascii_digit() {
                break;
            }
            seen = true;
            value = value
                .checked_mul(10)
                .and_then(|v| v.checked_add((b - b'0') as u64))
                .ok_or_else(|| ImapError::syntax("number overflows"))?;
            self.inner.consume(1);
        }
        if !seen {
            return Err(ImapError::syntax(format!(
                "expected number, found {:?}",
                self.peek_byte()?.map(|b| b as char)
            )));
        }
        Ok(value)
    }

    pub fn read_number(&mut self) -> Result<u32> {
        let n = self.read_number_u64()?;
        u32::try_from(n).map_err(|_| ImapError::syntax("number too large"))
    }

    /// Read an `nz-number`: a number that must not be zero.
    pub fn read_nz_number(&mut self) -> Result<u32> {
        let n = self.read_number()?;
        if n == 0 {
            return Err(ImapError::syntax("expected nonzero number"));
        }
        Ok(n)
    }

    /// Read a sequence set, returned raw: interpreting `*` and ranges
    /// needs folder context the tokenizer does not have.
    pub fn read_sequence_set(&mut self) -> Result<String> {
        let mut out = String::new();
        while let Some(b) = self.peek_byte()? {
            if b.is_ascii_digit() || b == b':' || b == b',' || b == b'*' || b == b'$' {
                out.push(b as char);
                self.inner.consume(1);
            } else {
                break;
            }
        }
        if out.is_empty() {
            return Err(ImapError::syntax("expected sequence set"));
        }
        Ok(out)
    }
}
