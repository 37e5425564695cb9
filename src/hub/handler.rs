use std::sync::Arc;

use dashmap::DashMap;

use super::client::HubClient;
use super::error::HubError;
use crate::protocol::Message;

/// A capability object invoked for inbound messages it registered for.
///
/// Handlers run on the client pump; they must not block. Errors are
/// logged and never tear down the hub session.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, client: &HubClient, message: &Message) -> Result<(), HubError>;
}

/// Two-level handler registry: by command, and by command plus reference
/// token. Token handlers win. Reads vastly outnumber registrations, so
/// both tables are concurrent maps.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    by_command: DashMap<String, Arc<dyn MessageHandler>>,
    by_token: DashMap<(String, String), Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, command: &str, handler: Arc<dyn MessageHandler>) {
        self.by_command.insert(command.to_string(), handler);
    }

    pub fn register_token(&self, command: &str, token: &str, handler: Arc<dyn MessageHandler>) {
        self.by_token
            .insert((command.to_string(), token.to_string()), handler);
    }

    pub fn unregister(&self, command: &str) {
        self.by_command.remove(command);
    }

    pub fn unregister_token(&self, command: &str, token: &str) {
        self.by_token
            .remove(&(command.to_string(), token.to_string()));
    }

    pub fn lookup(&self, command: &str, token: Option<&str>) -> Option<Arc<dyn MessageHandler>> {
        if let Some(token) = token {
            if let Some(h) = self.by_token.get(&(command.to_string(), token.to_string())) {
                return Some(h.clone());
            }
        }
        self.by_command.get(command).map(|h| h.clone())
    }
}
