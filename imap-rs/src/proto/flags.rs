//! Message flag sets.
//!
//! The seven well-known system flags live in a bitmask; keyword flags are
//! kept alongside as case-insensitive atoms. Encoding always emits system
//! flags in canonical order before keywords.

use crate::error::{ImapError, Result};
use crate::proto::types::Atom;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the RFC 3501 system flags, plus `\*` from PERMANENTFLAGS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemFlag {
    Answered,
    Flagged,
    Deleted,
    Seen,
    Draft,
    Recent,
    /// `\*`: clients may create new keywords.
    Star,
}

impl SystemFlag {
    /// Canonical encoding order.
    pub const ALL: [SystemFlag; 7] = [
        SystemFlag::Answered,
        SystemFlag::Flagged,
        SystemFlag::Deleted,
        SystemFlag::Seen,
        SystemFlag::Draft,
        SystemFlag::Recent,
        SystemFlag::Star,
    ];

    fn bit(self) -> u8 {
        match self {
            SystemFlag::Answered => 1 << 0,
            SystemFlag::Flagged => 1 << 1,
            SystemFlag::Deleted => 1 << 2,
            SystemFlag::Seen => 1 << 3,
            SystemFlag::Draft => 1 << 4,
            SystemFlag::Recent => 1 << 5,
            SystemFlag::Star => 1 << 6,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SystemFlag::Answered => "\\Answered",
            SystemFlag::Flagged => "\\Flagged",
            SystemFlag::Deleted => "\\Deleted",
            SystemFlag::Seen => "\\Seen",
            SystemFlag::Draft => "\\Draft",
            SystemFlag::Recent => "\\Recent",
            SystemFlag::Star => "\\*",
        }
    }

    fn from_name(name: &str) -> Option<SystemFlag> {
        SystemFlag::ALL
            .into_iter()
            .find(|f| f.name().eq_ignore_ascii_case(name))
    }
}

/// A message's flag set: system-flag bitmask plus custom keywords.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Flags {
    bits: u8,
    keywords: Vec<String>,
}

impl Flags {
    pub fn new() -> Self {
        Flags::default()
    }

    pub fn set(&mut self, flag: SystemFlag) {
        self.bits |= flag.bit();
    }

    pub fn unset(&mut self, flag: SystemFlag) {
        self.bits &= !flag.bit();
    }

    pub fn contains(&self, flag: SystemFlag) -> bool {
        self.bits & flag.bit() != 0
    }

    pub fn set_keyword(&mut self, kw: &str) {
        if SystemFlag::from_name(kw).is_some() {
            return;
        }
        if !self.has_keyword(kw) {
            self.keywords.push(kw.to_string());
        }
    }

    pub fn unset_keyword(&mut self, kw: &str) {
        self.keywords.retain(|k| !k.eq_ignore_ascii_case(kw));
    }

    pub fn has_keyword(&self, kw: &str) -> bool {
        self.keywords.iter().any(|k| k.eq_ignore_ascii_case(kw))
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0 && self.keywords.is_empty()
    }

    /// Set one flag by its wire name (`\Seen`, `$Forwarded`, ...).
    pub fn set_by_name(&mut self, name: &str) {
        match SystemFlag::from_name(name) {
            Some(f) => self.set(f),
            None => self.set_keyword(name),
        }
    }

    /// Flag names in canonical order: system flags first, then keywords in
    /// insertion order. Iteration and membership tests agree by
    /// construction.
    pub fn iter_names(&self) -> impl Iterator<Item = &str> {
        SystemFlag::ALL
            .iter()
            .filter(|f| self.contains(**f))
            .map(|f| f.name())
            .chain(self.keywords.iter().map(|k| k.as_str()))
    }

    /// Parse a parenthesized-list body that has already been split into
    /// tokens.
    pub fn from_names<'a, I: IntoIterator<Item = &'a str>>(names: I) -> Self {
        let mut flags = Flags::new();
        for name in names {
            flags.set_by_name(name);
        }
        flags
    }

    /// Parse the textual form, with or without surrounding parentheses.
    pub fn decode(input: &str) -> Result<Self> {
        let inner = input.trim();
        let inner = if inner.starts_with('(') {
            inner
                .strip_prefix('(')
                .and_then(|s| s.strip_suffix(')'))
                .ok_or_else(|| ImapError::syntax(format!("unbalanced flag list: {input:?}")))?
        } else {
            inner
        };
        Ok(Flags::from_names(inner.split_ascii_whitespace()))
    }

    /// Canonical wire encoding, e.g. `(\Answered \Seen $Forwarded)`.
    pub fn encode(&self) -> String {
        let names: Vec<&str> = self.iter_names().collect();
        format!("({})", names.join(" "))
    }

    /// Keywords as atoms, for callers that need case-insensitive handling.
    pub fn keyword_atoms(&self) -> Vec<Atom> {
        self.keywords.iter().map(|k| Atom::new(k.clone())).collect()
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut flags = Flags::new();
        flags.set(SystemFlag::Seen);
        flags.set(SystemFlag::Answered);
        flags.set_keyword("$Forwarded");
        flags.set_keyword("Junk");

        let decoded = Flags::decode(&flags.encode()).unwrap();
        assert_eq!(decoded, flags);
    }

    #[test]
    fn test_system_flags_precede_keywords() {
        let flags = Flags::from_names(["Junk", "\\Seen", "\\Answered"]);
        let names: Vec<&str> = flags.iter_names().collect();
        assert_eq!(names, vec!["\\Answered", "\\Seen", "Junk"]);
    }

    #[test]
    fn test_membership_matches_iteration() {
        let flags = Flags::from_names(["\\Deleted", "\\Recent", "$MDNSent"]);
        assert!(flags.contains(SystemFlag::Deleted));
        assert!(flags.contains(SystemFlag::Recent));
        assert!(flags.has_keyword("$mdnsent"));
        assert!(!flags.contains(SystemFlag::Seen));
        assert_eq!(flags.iter_names().count(), 3);
    }

    #[test]
    fn test_flag_names_case_insensitive() {
        let flags = Flags::from_names(["\\SEEN", "\\draft"]);
        assert!(flags.contains(SystemFlag::Seen));
        assert!(flags.contains(SystemFlag::Draft));
        assert_eq!(flags.encode(), "(\\Seen \\Draft)");
    }

    #[test]
    fn test_decode_bare_flag() {
        let flags = Flags::decode("\\Deleted").unwrap();
        assert!(flags.contains(SystemFlag::Deleted));
    }

    #[test]
    fn test_star_flag() {
        let flags = Flags::decode("(\\Answered \\*)").unwrap();
        assert!(flags.contains(SystemFlag::Star));
        assert_eq!(flags.encode(), "(\\Answered \\*)");
    }

    #[test]
    fn test_keyword_dedup() {
        let mut flags = Flags::new();
        flags.set_keyword("Junk");
        flags.set_keyword("JUNK");
        assert_eq!(flags.iter_names().count(), 1);
    }
}
