//! ADC wire protocol: line codec, message model, session, identifiers.
//!
//! Every ADC message is one newline-terminated line: a type byte, a
//! three-letter command, and space-separated parameters. Free text inside
//! parameters is escaped (space, newline, backslash); binary payloads
//! follow SND messages as raw bytes on the same stream.

mod error;
mod identity;
mod message;
mod session;

pub use error::ProtocolError;
pub use identity::{base32_decode_loose, base32_encode, Identifier};
pub use message::{deescape, escape, format_fields, FieldMap, Message, MessageType};
pub use session::{AdcStream, Session, SessionWriter};
