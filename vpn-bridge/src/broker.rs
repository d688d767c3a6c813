//! Single-slot status publisher
//!
//! Exactly one subscriber at a time. Setting a new one silently replaces the
//! old one, and publishing with nobody attached is not an error.

use crate::types::SessionStatus;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// Value pushed to the subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    /// Session status change
    Stage(SessionStatus),
    /// Traffic counters as written by the tunnel provider
    Traffic(String),
}

impl StatusUpdate {
    /// Wire representation; both kinds travel as plain strings
    pub fn as_wire(&self) -> &str {
        match self {
            StatusUpdate::Stage(status) => status.as_str(),
            StatusUpdate::Traffic(stats) => stats,
        }
    }
}

/// Sending half held in the slot
pub type StatusSink = mpsc::UnboundedSender<StatusUpdate>;

/// Most-recent-listener broadcast
#[derive(Clone, Default)]
pub struct StatusBroker {
    slot: Arc<Mutex<Option<StatusSink>>>,
}

impl StatusBroker {
    /// Create a broker with an empty slot
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<StatusSink>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put `sink` in the slot, dropping whatever was there
    pub fn set_subscriber(&self, sink: StatusSink) {
        if self.slot().replace(sink).is_some() {
            log::debug!("Replaced previous status subscriber");
        }
    }

    /// Attach a fresh subscriber and hand back its receiving end
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StatusUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.set_subscriber(tx);
        rx
    }

    /// Empty the slot
    pub fn clear(&self) {
        self.slot().take();
    }

    /// Whether a subscriber is attached
    pub fn has_subscriber(&self) -> bool {
        self.slot().is_some()
    }

    /// Deliver to the current subscriber, if any
    pub fn publish(&self, update: StatusUpdate) {
        let mut slot = self.slot();
        let Some(sink) = slot.as_ref() else {
            log::trace!("No status subscriber, dropping {:?}", update);
            return;
        };
        if sink.send(update).is_err() {
            // Receiver is gone; forget it so later publishes are cheap no-ops
            *slot = None;
        }
    }
}
