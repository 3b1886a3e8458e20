//! Per-message FETCH data.

use crate::proto::envelope::{BodyStructure, Envelope};
use crate::proto::flags::Flags;
use chrono::{DateTime, FixedOffset};
use std::collections::HashMap;

/// A partial record of one message's attributes.
///
/// A server may spread one message's attributes over several FETCH
/// response lines; records for the same message are merged with
/// [`MessageData::merge`], where the newer non-empty field wins.
#[derive(Debug, Default)]
pub struct MessageData {
    pub uid: Option<u32>,
    pub modseq: Option<u64>,
    pub flags: Option<Flags>,
    pub internal_date: Option<DateTime<FixedOffset>>,
    pub rfc822_size: Option<u64>,
    pub envelope: Option<Envelope>,
    pub body_structure: Option<BodyStructure>,
    /// Body sections keyed by their section specifier (e.g. `HEADER`,
    /// `1.2`, `TEXT`).
    pub sections: HashMap<String, Vec<u8>>,
}

impl MessageData {
    pub fn new() -> Self {
        MessageData::default()
    }

    /// Fold `newer` into this record. Fields present in `newer` replace
    /// ours; absent fields keep the existing value. Body sections merge by
    /// section specifier.
    pub fn merge(&mut self, newer: MessageData) {
        if newer.uid.is_some() {
            self.uid = newer.uid;
        }
        if newer.modseq.is_some() {
            self.modseq = newer.modseq;
        }
        if newer.flags.is_some() {
            self.flags = newer.flags;
        }
        if newer.internal_date.is_some() {
            self.internal_date = newer.internal_date;
        }
        if newer.rfc822_size.is_some() {
            self.rfc822_size = newer.rfc822_size;
        }
        if newer.envelope.is_some() {
            self.envelope = newer.envelope;
        }
        if newer.body_structure.is_some() {
            self.body_structure = newer.body_structure;
        }
        for (section, bytes) in newer.sections {
            self.sections.insert(section, bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::flags::SystemFlag;

    #[test]
    fn test_merge_prefers_newer_nonempty_fields() {
        let mut first = MessageData::new();
        first.uid = Some(42);
        let mut old_flags = Flags::new();
        old_flags.set(SystemFlag::Recent);
        first.flags = Some(old_flags);
        first.rfc822_size = Some(1000);

        let mut second = MessageData::new();
        let mut new_flags = Flags::new();
        new_flags.set(SystemFlag::Seen);
        second.flags = Some(new_flags.clone());

        first.merge(second);

        // Updated by the second line.
        assert_eq!(first.flags, Some(new_flags));
        // Untouched by the second line.
        assert_eq!(first.uid, Some(42));
        assert_eq!(first.rfc822_size, Some(1000));
    }

    #[test]
    fn test_merge_accumulates_sections() {
        let mut first = MessageData::new();
        first.sections.insert("HEADER".into(), b"From: a\r\n".to_vec());

        let mut second = MessageData::new();
        second.sections.insert("TEXT".into(), b"body".to_vec());
        second.sections.insert("HEADER".into(), b"From: b\r\n".to_vec());

        first.merge(second);

        assert_eq!(first.sections.len(), 2);
        assert_eq!(first.sections["HEADER"], b"From: b\r\n");
        assert_eq!(first.sections["TEXT"], b"body");
    }
}
