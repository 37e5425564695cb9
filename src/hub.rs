//! Hub client: connection state machine, peer registry, peer channels.
//!
//! A hub session moves through PROTOCOL, IDENTIFY and VERIFY before
//! settling in NORMAL, where a pump task dispatches inbound messages to
//! built-in handling and registered handlers. Peers discovered through
//! the hub get on-demand direct connections (reverse connect) serialized
//! by a per-peer session gate.

mod client;
mod error;
mod handler;
mod peer;
mod ping;

pub use client::{ClientConfig, HubClient};
pub use error::HubError;
pub use handler::MessageHandler;
pub use peer::{Peer, SessionGate};
pub use ping::ping;

#[cfg(test)]
mod tests;
