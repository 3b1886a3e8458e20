//! Incremental command framing. Transports feed raw socket bytes in and
//! pull complete commands out; the accumulator tracks literal
//! announcements across lines so a command is only surfaced once every
//! announced octet has arrived.

use bytes::BytesMut;

/// What the accumulator has for the transport after the latest feed.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    /// A complete command, ready for the parser.
    Command(Vec<u8>),
    /// A synchronizing literal was announced; the transport must send a
    /// continuation before the client transmits the octets.
    NeedContinuation,
    /// A literal announcement exceeded the configured limit. The command
    /// is abandoned; the transport should reject it under `tag`.
    LiteralTooLarge { tag: String, size: u64 },
}

#[derive(Debug)]
pub struct CommandAccumulator {
    buf: BytesMut,
    /// Bytes of the command being assembled, literals included.
    command: Vec<u8>,
    /// Octets of the current literal still outstanding.
    pending_literal: usize,
    /// Octets of an oversized non-synchronizing literal to swallow.
    discard: usize,
    max_literal_size: usize,
}

impl CommandAccumulator {
    pub fn new(max_literal_size: usize) -> Self {
        CommandAccumulator {
            buf: BytesMut::with_capacity(4096),
            command: Vec::new(),
            pending_literal: 0,
            discard: 0,
            max_literal_size,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet part of a surfaced command.
    pub fn buffered(&self) -> usize {
        self.buf.len() + self.command.len()
    }

    /// Pull the next frame, if the buffer holds one.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            if self.discard > 0 {
                let n = self.discard.min(self.buf.len());
                let _ = self.buf.split_to(n);
                self.discard -= n;
                if self.discard > 0 {
                    return None;
                }
                continue;
            }

            if self.pending_literal > 0 {
                let n = self.pending_literal.min(self.buf.len());
                self.command.extend_from_slice(&self.buf.split_to(n));
                self.pending_literal -= n;
                if self.pending_literal > 0 {
                    return None;
                }
                continue;
            }

            let newline = match self.buf.iter().position(|b| *b == b'\n') {
                Some(idx) => idx,
                None => return None,
            };
            let line = self.buf.split_to(newline + 1);
            self.command.extend_from_slice(&line);

            match literal_announcement(&line) {
                Some((size, non_sync)) => {
                    if size > self.max_literal_size as u64 {
                        let tag = self.command_tag();
                        self.command.clear();
                        if non_sync {
                            // The client streams the octets regardless.
                            self.discard = size as usize;
                        }
                        return Some(Frame::LiteralTooLarge { tag, size });
                    }
                    self.pending_literal = size as usize;
                    if !non_sync {
                        return Some(Frame::NeedContinuation);
                    }
                }
                None => {
                    return Some(Frame::Command(std::mem::take(&mut self.command)));
                }
            }
        }
    }

    fn command_tag(&self) -> String {
        let text = String::from_utf8_lossy(&self.command);
        text.split_whitespace()
            .next()
            .unwrap_or("*")
            .to_string()
    }
}

/// `{n}` or `{n+}` at the end of a command line, if present.
fn literal_announcement(line: &[u8]) -> Option<(u64, bool)> {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    let line = &line[..end];
    if !line.ends_with(b"}") {
        return None;
    }
    let open = line.iter().rposition(|b| *b == b'{')?;
    let inner = &line[open + 1..line.len() - 1];
    let (digits, non_sync) = match inner.split_last() {
        Some((b'+', rest)) => (rest, true),
        _ => (inner, false),
    };
    if digits.is_empty() || !digits.iter().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let size = std::str::from_utf8(digits).ok()?.parse().ok()?;
    Some((size, non_sync))
}
