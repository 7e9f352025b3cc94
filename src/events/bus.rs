//! Connection event fan-out
//!
//! Every observer owns its own unbounded channel, so a slow or stalled
//! consumer only ever delays itself. `broadcast` never awaits: it snapshots
//! the registered senders, pushes the event into each one, and drops the
//! observers whose receiving side has gone away.

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace};
use uuid::Uuid;

use super::ConnectionEvent;

pub type ObserverId = String;

/// Sending half of one observer's delivery path.
#[derive(Debug, Clone)]
pub struct Observer {
    pub id: ObserverId,
    pub sender: UnboundedSender<ConnectionEvent>,
}

impl Observer {
    pub fn new(sender: UnboundedSender<ConnectionEvent>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender,
        }
    }
}

#[derive(Debug, Default)]
pub struct EventBus {
    observers: Mutex<Vec<Observer>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an independent delivery path and hand back its receiving end.
    pub fn register_observer(&self) -> UnboundedReceiver<ConnectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let observer = Observer::new(tx);
        debug!(observer = %observer.id, "registered connection event observer");
        self.observers.lock().push(observer);
        rx
    }

    /// Enqueue `event` for every registered observer.
    ///
    /// Returns the number of observers the event reached.
    pub fn broadcast(&self, event: &ConnectionEvent) -> usize {
        let snapshot: Vec<Observer> = self.observers.lock().clone();

        let mut closed = Vec::new();
        let mut delivered = 0;
        for observer in &snapshot {
            if observer.sender.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                closed.push(observer.id.clone());
            }
        }

        if !closed.is_empty() {
            self.observers.lock().retain(|o| !closed.contains(&o.id));
            for id in &closed {
                trace!(observer = %id, "dropped closed connection event observer");
            }
        }

        delivered
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }
}
