//! IMAP protocol data types and the byte-level reader/writer.

pub mod envelope;
pub mod fetch;
pub mod flags;
pub mod reader;
pub mod response;
pub mod types;
pub mod writer;

pub use envelope::{Address, BodyStructure, Envelope};
pub use fetch::MessageData;
pub use flags::{Flags, SystemFlag};
pub use reader::{LiteralHeader, WireReader};
pub use response::{Response, ResponseCode, ResponseText, Status, UntaggedResponse};
pub use types::{Atom, ImapString, Literal};
pub use writer::WireWriter;
