//! In-process VPN facility
//!
//! Keeps registrations in memory and plays the OS role for dry runs and
//! tests: `start` walks a registration through connecting → connected,
//! `stop` through disconnecting → disconnected. Failures can be injected per
//! operation, and an operation can be made to hang.

use super::{status_code, Registration, StatusStream, VpnBackend};
use crate::error::BackendError;
use crate::types::Credentials;
use async_trait::async_trait;
use futures_util::future;
use futures_util::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

/// Size of the status notification buffer per subscriber
const STATUS_CHANNEL_SIZE: usize = 64;

/// Number of most recent calls kept for inspection
const CALL_HISTORY_SIZE: usize = 256;

/// Backend operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// `load_all`
    LoadAll,
    /// `load`
    Load,
    /// `save`
    Save,
    /// `status`
    Status,
    /// `watch_status`
    Watch,
    /// `start`
    Start,
    /// `stop`
    Stop,
}

#[derive(Debug)]
struct Failure {
    /// Calls that still succeed before the error kicks in
    skip: usize,
    error: BackendError,
}

#[derive(Debug, Default)]
struct Inner {
    registrations: Vec<Registration>,
    statuses: HashMap<String, u32>,
    failures: HashMap<Op, Failure>,
    stalled: HashSet<Op>,
    calls: VecDeque<Op>,
    next_id: u64,
    last_username: Option<String>,
}

/// Simulated OS VPN facility
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<(String, u32)>,
    auto_progress: bool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create an empty backend that completes start/stop transitions on its own
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(STATUS_CHANNEL_SIZE);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            events,
            auto_progress: true,
        }
    }

    /// Create a backend whose start/stop leave the status untouched;
    /// transitions must then be driven with [`MemoryBackend::emit`]
    pub fn manual() -> Self {
        Self {
            auto_progress: false,
            ..Self::new()
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every call of `op` fail with `error`
    pub fn fail(&self, op: Op, error: BackendError) {
        self.fail_after(op, 0, error);
    }

    /// Let `skip` calls of `op` succeed, then fail every later one with `error`
    pub fn fail_after(&self, op: Op, skip: usize, error: BackendError) {
        self.lock().failures.insert(op, Failure { skip, error });
    }

    /// Remove all injected failures
    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Make every later call of `op` hang forever, as a wedged OS service would
    pub fn stall(&self, op: Op) {
        self.lock().stalled.insert(op);
    }

    /// Most recent operations called, oldest first
    pub fn calls(&self) -> Vec<Op> {
        self.lock().calls.iter().copied().collect()
    }

    /// Number of times `op` appears in the recent call history
    pub fn call_count(&self, op: Op) -> usize {
        self.lock().calls.iter().filter(|c| **c == op).count()
    }

    /// Stored registrations
    pub fn registrations(&self) -> Vec<Registration> {
        self.lock().registrations.clone()
    }

    /// Store a registration directly, as if another process had created it
    pub fn insert(&self, mut registration: Registration) -> Registration {
        let mut inner = self.lock();
        if registration.id.is_none() {
            registration.id = Some(Self::next_id(&mut inner));
        }
        inner.registrations.push(registration.clone());
        registration
    }

    /// Username passed to the last successful start
    pub fn last_username(&self) -> Option<String> {
        self.lock().last_username.clone()
    }

    /// Set a registration's status and notify watchers
    pub fn emit(&self, id: &str, code: u32) {
        self.lock().statuses.insert(id.to_string(), code);
        // No receivers is fine: nobody is watching yet
        let _ = self.events.send((id.to_string(), code));
    }

    fn next_id(inner: &mut Inner) -> String {
        inner.next_id += 1;
        format!("mem-{}", inner.next_id)
    }

    /// Record a call, hang if `op` is stalled, and return the injected failure if one is due
    async fn enter(&self, op: Op) -> Result<(), BackendError> {
        let (stalled, result) = {
            let mut inner = self.lock();
            if inner.calls.len() == CALL_HISTORY_SIZE {
                inner.calls.pop_front();
            }
            inner.calls.push_back(op);
            let result = match inner.failures.get_mut(&op) {
                Some(failure) if failure.skip > 0 => {
                    failure.skip -= 1;
                    Ok(())
                }
                Some(failure) => Err(failure.error.clone()),
                None => Ok(()),
            };
            (inner.stalled.contains(&op), result)
        };
        if stalled {
            future::pending::<()>().await;
        }
        result
    }

    fn saved_id(registration: &Registration) -> Result<&str, BackendError> {
        registration
            .id
            .as_deref()
            .ok_or_else(|| BackendError::Other("registration has not been saved".to_string()))
    }
}

#[async_trait]
impl VpnBackend for MemoryBackend {
    async fn load_all(&self, bundle_identifier: &str) -> Result<Vec<Registration>, BackendError> {
        self.enter(Op::LoadAll).await?;
        Ok(self
            .lock()
            .registrations
            .iter()
            .filter(|r| r.bundle_identifier() == Some(bundle_identifier))
            .cloned()
            .collect())
    }

    async fn load(&self, registration: &mut Registration) -> Result<(), BackendError> {
        self.enter(Op::Load).await?;
        let Some(id) = registration.id.clone() else {
            return Ok(());
        };
        let inner = self.lock();
        let stored = inner
            .registrations
            .iter()
            .find(|r| r.id.as_deref() == Some(id.as_str()))
            .ok_or_else(|| BackendError::Other(format!("registration {} not found", id)))?;
        *registration = stored.clone();
        Ok(())
    }

    async fn save(&self, registration: &mut Registration) -> Result<(), BackendError> {
        self.enter(Op::Save).await?;
        let mut inner = self.lock();
        if registration.id.is_none() {
            registration.id = Some(Self::next_id(&mut inner));
        }
        let id = registration.id.clone();
        match inner.registrations.iter_mut().find(|r| r.id == id) {
            Some(stored) => *stored = registration.clone(),
            None => inner.registrations.push(registration.clone()),
        }
        Ok(())
    }

    async fn status(&self, registration: &Registration) -> Result<u32, BackendError> {
        self.enter(Op::Status).await?;
        Ok(registration
            .id
            .as_ref()
            .and_then(|id| self.lock().statuses.get(id).copied())
            .unwrap_or(status_code::DISCONNECTED))
    }

    async fn watch_status(&self, registration: &Registration) -> Result<StatusStream, BackendError> {
        self.enter(Op::Watch).await?;
        let id = Self::saved_id(registration)?.to_string();
        let rx = self.events.subscribe();

        let stream = stream::unfold(rx, move |mut rx| {
            let id = id.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok((target, code)) if target == id => return Some((code, rx)),
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            log::warn!("Status watcher lagged, {} notifications dropped", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn start(
        &self,
        registration: &Registration,
        credentials: &Credentials,
    ) -> Result<(), BackendError> {
        self.enter(Op::Start).await?;
        let id = Self::saved_id(registration)?.to_string();
        if !registration.enabled {
            return Err(BackendError::Other("registration is disabled".to_string()));
        }
        self.lock().last_username = credentials.username.clone();

        if self.auto_progress {
            self.emit(&id, status_code::CONNECTING);
            self.emit(&id, status_code::CONNECTED);
        }
        Ok(())
    }

    async fn stop(&self, registration: &Registration) -> Result<(), BackendError> {
        self.enter(Op::Stop).await?;
        let Some(id) = registration.id.as_deref() else {
            return Ok(());
        };
        if self.auto_progress {
            self.emit(id, status_code::DISCONNECTING);
            self.emit(id, status_code::DISCONNECTED);
        }
        Ok(())
    }
}
