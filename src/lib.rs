//! radc - An ADC (Advanced Direct Connect) client library
//!
//! ADC is a text-based peer-to-peer file sharing protocol. Clients hold a
//! long-lived session to a hub, search through it, and open direct
//! connections to other clients to transfer files identified by Tiger
//! tree hashes.
//!
//! # Modules
//!
//! - [`protocol`] - Wire codec, message model, session, identifiers
//! - [`treehash`] - Tiger tree hash roots, leaf verification, file hashing
//! - [`hub`] - Hub client state machine, peers, reverse connects, ping
//! - [`search`] - Broadcast searches and asynchronous result routing
//! - [`download`] - Multi-peer chunked download orchestration
//! - [`net`] - adc/adcs/magnet URL parsing and (TLS) dialing

pub mod constants;
pub mod download;
pub mod hub;
pub mod net;
pub mod protocol;
pub mod search;
pub mod treehash;

pub use download::{Download, DownloadConfig, DownloadError, FileChunk, FileSink};
pub use hub::{ClientConfig, HubClient, HubError, Peer};
pub use net::{dial, HubUrl, MagnetLink, NetError, Scheme};
pub use protocol::{
    deescape, escape, FieldMap, Identifier, Message, MessageType, ProtocolError, Session,
    SessionWriter,
};
pub use search::{Search, SearchResult};
pub use treehash::{TreeHash, VerificationError};
