//! Core IMAP string encodings: atoms, quoted strings, and literals.

use crate::error::{ImapError, Result};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use tempfile::NamedTempFile;

/// An IMAP atom. Protocol keywords are case-insensitive, so equality and
/// hashing ignore ASCII case.
#[derive(Debug, Clone)]
pub struct Atom(String);

impl Atom {
    pub fn new<S: Into<String>>(s: S) -> Self {
        Atom(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if this byte may appear inside an atom.
    pub fn is_atom_char(b: u8) -> bool {
        !matches!(
            b,
            b'(' | b')' | b'{' | b' ' | b'%' | b'*' | b'"' | b'\\' | b']'
        ) && b > 0x1f
            && b < 0x7f
    }
}

impl PartialEq for Atom {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for Atom {}

impl PartialEq<str> for Atom {
    fn eq(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other)
    }
}

impl Hash for Atom {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.0.as_bytes() {
            state.write_u8(b.to_ascii_uppercase());
        }
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Atom {
    fn from(s: &str) -> Self {
        Atom::new(s)
    }
}

/// What holds a literal's octets.
enum Backing {
    Memory(Vec<u8>),
    /// Spilled to a temporary file; removed when the literal is dropped.
    File(NamedTempFile, u64),
    /// A bounded, not-yet-consumed input stream.
    Stream(Box<dyn Read + Send>, u64),
}

impl fmt::Debug for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backing::Memory(b) => write!(f, "Memory({} bytes)", b.len()),
            Backing::File(_, n) => write!(f, "File({} bytes)", n),
            Backing::Stream(_, n) => write!(f, "Stream({} bytes)", n),
        }
    }
}

/// A length-prefixed IMAP literal. May contain arbitrary octets.
///
/// Owns its backing resource; dropping the literal removes any temporary
/// file. Stream-backed literals are consumed by the first read.
#[derive(Debug)]
pub struct Literal {
    backing: Backing,
}

impl Literal {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Literal {
            backing: Backing::Memory(bytes),
        }
    }

    /// Wrap a bounded input stream without buffering it.
    pub fn from_stream(reader: Box<dyn Read + Send>, len: u64) -> Self {
        Literal {
            backing: Backing::Stream(reader, len),
        }
    }

    /// Read exactly `len` octets from `reader`. Octet counts above
    /// `memory_threshold` are spooled to a temporary file instead of being
    /// held in memory.
    pub fn spool<R: Read>(reader: &mut R, len: u64, memory_threshold: usize) -> Result<Self> {
        if len <= memory_threshold as u64 {
            let mut buf = vec![0u8; len as usize];
            reader.read_exact(&mut buf)?;
            Ok(Literal::from_bytes(buf))
        } else {
            let mut file = NamedTempFile::new()?;
            let mut remaining = len;
            let mut chunk = [0u8; 8192];
            while remaining > 0 {
                let want = remaining.min(chunk.len() as u64) as usize;
                reader.read_exact(&mut chunk[..want])?;
                file.write_all(&chunk[..want])?;
                remaining -= want as u64;
            }
            file.flush()?;
            Ok(Literal {
                backing: Backing::File(file, len),
            })
        }
    }

    pub fn len(&self) -> u64 {
        match &self.backing {
            Backing::Memory(b) => b.len() as u64,
            Backing::File(_, n) | Backing::Stream(_, n) => *n,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Path of the spill file, if this literal went to disk.
    pub fn spill_path(&self) -> Option<PathBuf> {
        match &self.backing {
            Backing::File(f, _) => Some(f.path().to_path_buf()),
            _ => None,
        }
    }

    /// Copy the literal's octets into `out`. File-backed literals rewind
    /// first so this is repeatable; stream-backed literals are consumed.
    pub fn write_to<W: Write>(&mut self, out: &mut W) -> Result<()> {
        match &mut self.backing {
            Backing::Memory(b) => out.write_all(b)?,
            Backing::File(f, n) => {
                f.as_file_mut().seek(SeekFrom::Start(0))?;
                let copied = std::io::copy(f.as_file_mut(), out)?;
                if copied != *n {
                    return Err(ImapError::syntax(format!(
                        "literal spill truncated: expected {} bytes, found {}",
                        n, copied
                    )));
                }
            }
            Backing::Stream(r, n) => {
                let copied = std::io::copy(&mut r.take(*n), out)?;
                if copied != *n {
                    return Err(ImapError::syntax(format!(
                        "literal stream truncated: expected {} bytes, found {}",
                        n, copied
                    )));
                }
                *n = 0;
            }
        }
        Ok(())
    }

    /// Consume the literal and return its octets, releasing any backing
    /// file or stream.
    pub fn into_bytes(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.len() as usize);
        self.write_to(&mut out)?;
        Ok(out)
    }
}

/// The three IMAP string token encodings.
#[derive(Debug)]
pub enum ImapString {
    Atom(Atom),
    Quoted(String),
    Literal(Literal),
}

impl ImapString {
    /// Pick the cheapest valid encoding for `text`.
    pub fn from_text(text: &str) -> Self {
        if !text.is_empty() && text.bytes().all(Atom::is_atom_char) {
            ImapString::Atom(Atom::new(text))
        } else if text.bytes().all(|b| b != b'\r' && b != b'\n' && b != 0) {
            ImapString::Quoted(text.to_string())
        } else {
            ImapString::Literal(Literal::from_bytes(text.as_bytes().to_vec()))
        }
    }

    /// Decode into text, consuming any literal backing.
    pub fn into_text(self) -> Result<String> {
        match self {
            ImapString::Atom(a) => Ok(a.0),
            ImapString::Quoted(q) => Ok(q),
            ImapString::Literal(l) => String::from_utf8(l.into_bytes()?)
                .map_err(|_| ImapError::syntax("literal is not valid UTF-8 text")),
        }
    }
}
