//! Last-value cache
//!
//! Holds at most one message per destination. Writers replace the entry
//! wholesale (`Arc<Message>`), so a reader sees either the previous message
//! or the new one, never a mix. Upserts for the same destination apply in
//! arrival order; nothing is ordered across destinations.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

use crate::message::Message;

#[derive(Debug, Default)]
pub struct MessageCache {
    entries: DashMap<String, Arc<Message>>,
}

impl MessageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `message` under `destination`, replacing whatever was there.
    pub fn upsert(&self, destination: impl Into<String>, message: Message) {
        let destination = destination.into();
        trace!(%destination, bytes = message.len(), "caching message");
        self.entries.insert(destination, Arc::new(message));
    }

    /// Cache a message under its own destination.
    pub fn store_message(&self, message: Message) {
        self.upsert(message.destination().to_string(), message);
    }

    /// Latest message for `destination`. `None` means nothing has arrived
    /// yet; it says nothing about the connection.
    pub fn lookup(&self, destination: &str) -> Option<Arc<Message>> {
        self.entries.get(destination).map(|entry| entry.value().clone())
    }

    /// Convenience: field `key` of the latest message for `destination`.
    pub fn field(&self, destination: &str, key: &str) -> Option<String> {
        self.lookup(destination)?.field(key)
    }

    pub fn remove(&self, destination: &str) -> Option<Arc<Message>> {
        self.entries.remove(destination).map(|(_, message)| message)
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
