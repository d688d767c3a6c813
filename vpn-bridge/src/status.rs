// Status observer for tunnel lifecycle notifications

//! OS status translation
//!
//! The OS is the authority on tunnel state: every notification is accepted
//! as-is, there is no transition validation. This module maps OS codes to
//! [`SessionStatus`], remembers the last known value and owns the
//! notification subscription.

use crate::backend::{status_code, StatusStream};
use crate::broker::{StatusBroker, StatusUpdate};
use crate::types::SessionStatus;
use futures_util::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;

/// Map an OS status code to the session vocabulary. Total: unrecognized codes are `Unknown`.
pub fn from_os_code(code: u32) -> SessionStatus {
    match code {
        status_code::CONNECTED => SessionStatus::Connected,
        status_code::CONNECTING => SessionStatus::Connecting,
        status_code::DISCONNECTED => SessionStatus::Disconnected,
        status_code::DISCONNECTING => SessionStatus::Disconnecting,
        status_code::INVALID => SessionStatus::Invalid,
        status_code::REASSERTING => SessionStatus::Reasserting,
        _ => SessionStatus::Unknown,
    }
}

/// Live status notification subscription. Cancelled on drop.
#[derive(Debug)]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    /// Stop receiving notifications
    pub fn cancel(self) {
        self.task.abort();
    }

    /// Whether the notification task is still running
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Tracks the last known session status and relays changes to the broker
#[derive(Clone)]
pub struct StatusObserver {
    /// `None` while no registration is loaded
    current: Arc<Mutex<Option<SessionStatus>>>,
    broker: StatusBroker,
}

impl StatusObserver {
    /// Create an observer publishing to `broker`
    pub fn new(broker: StatusBroker) -> Self {
        Self {
            current: Arc::new(Mutex::new(None)),
            broker,
        }
    }

    fn current_slot(&self) -> MutexGuard<'_, Option<SessionStatus>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Last known status; `Disconnected` when no registration is loaded
    pub fn current(&self) -> SessionStatus {
        self.current_slot().unwrap_or(SessionStatus::Disconnected)
    }

    /// Whether a registration has been attached
    pub fn is_attached(&self) -> bool {
        self.current_slot().is_some()
    }

    /// A registration was loaded; seed its status without publishing
    pub fn attach(&self, code: u32) {
        *self.current_slot() = Some(from_os_code(code));
    }

    /// Record a status and push it to the subscriber
    pub fn record(&self, status: SessionStatus) {
        *self.current_slot() = Some(status);
        self.broker.publish(StatusUpdate::Stage(status));
    }

    /// Start relaying codes from `stream`. The returned handle stops it.
    pub fn watch(&self, mut stream: StatusStream) -> Subscription {
        let observer = self.clone();
        let task = tokio::spawn(async move {
            while let Some(code) = stream.next().await {
                let status = from_os_code(code);
                log::debug!("OS status code {} -> {}", code, status);
                observer.record(status);
            }
            log::debug!("Status notification stream ended");
        });
        Subscription { task }
    }
}
