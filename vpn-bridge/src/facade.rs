//! Control entry point
//!
//! [`ControlFacade`] is what the transport layer calls. It validates
//! requests, keeps the "ready" flag and delegates to the profile store and
//! the tunnel controller. It is constructed explicitly around an injected
//! backend; there is no process-wide instance.

use crate::backend::VpnBackend;
use crate::broker::{StatusBroker, StatusUpdate};
use crate::error::{Error, Field, Result};
use crate::profile_store::ProfileStore;
use crate::shared_store::SharedStore;
use crate::status::StatusObserver;
use crate::tunnel_controller::{Stopper, TunnelController};
use crate::types::{Credentials, Profile, SessionStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Session control facade
pub struct ControlFacade<B: VpnBackend> {
    ready: AtomicBool,
    profiles: ProfileStore,
    shared: SharedStore,
    broker: StatusBroker,
    observer: StatusObserver,
    stopper: Stopper<B>,
    controller: Mutex<TunnelController<B>>,
}

fn require(value: &str, field: Field) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidArgument(field));
    }
    Ok(())
}

impl<B: VpnBackend> ControlFacade<B> {
    /// Build a facade around `backend`
    pub fn new(backend: Arc<B>, profiles: ProfileStore, shared: SharedStore) -> Self {
        let broker = StatusBroker::new();
        let observer = StatusObserver::new(broker.clone());
        let controller = TunnelController::new(backend, observer.clone());
        let stopper = controller.stopper();
        Self {
            ready: AtomicBool::new(false),
            profiles,
            shared,
            broker,
            observer,
            stopper,
            controller: Mutex::new(controller),
        }
    }

    /// Whether `initialize` has completed since the last `dispose`
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Stored profile, if any
    pub fn profile(&self) -> Option<Profile> {
        self.profiles.load()
    }

    /// Broker feeding the status stream
    pub fn broker(&self) -> &StatusBroker {
        &self.broker
    }

    /// Attach the status stream listener, replacing any previous one
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StatusUpdate> {
        self.broker.subscribe()
    }

    /// Detach the status stream listener
    pub fn unsubscribe(&self) {
        self.broker.clear();
    }

    /// Store the profile and load or create its OS registration
    pub async fn initialize(
        &self,
        bundle_identifier: &str,
        display_label: &str,
        group_identifier: &str,
    ) -> Result<SessionStatus> {
        require(bundle_identifier, Field::BundleIdentifier)?;
        require(display_label, Field::DisplayLabel)?;
        require(group_identifier, Field::GroupIdentifier)?;

        let profile = Profile {
            bundle_identifier: bundle_identifier.to_string(),
            group_identifier: group_identifier.to_string(),
            display_label: display_label.to_string(),
        };
        self.profiles.store(profile.clone())?;
        log::info!("Initializing profile {} ({})", bundle_identifier, display_label);

        let status = self.controller.lock().await.load_or_create(profile).await?;
        self.ready.store(true, Ordering::SeqCst);
        log::info!("Ready, current status: {}", status);
        Ok(status)
    }

    /// Configure the registration and start the tunnel
    pub async fn connect(&self, config: &str, credentials: Credentials) -> Result<()> {
        if !self.is_ready() {
            return Err(Error::NotInitialized);
        }
        require(config, Field::Config)?;

        self.controller
            .lock()
            .await
            .configure_and_start(config, credentials)
            .await
            .inspect_err(|e| log::error!("Connect failed: {}", e))
    }

    /// Report `disconnected` right away, then request tunnel deactivation.
    ///
    /// Does not wait for an in-flight `connect`.
    pub async fn disconnect(&self) {
        // Published ahead of OS confirmation; a later OS notification may still override it
        self.observer.record(SessionStatus::Disconnected);
        if let Err(e) = self.stopper.stop().await {
            log::warn!("Stop request failed: {}", e);
        }
    }

    /// Last known status; `disconnected` when nothing is loaded
    pub fn current_status(&self) -> SessionStatus {
        self.observer.current()
    }

    /// Latest provider traffic counters, also re-published to the subscriber
    pub fn traffic_stats(&self) -> Option<String> {
        let profile = self.profiles.load()?;
        match self.shared.traffic_stats(&profile.group_identifier) {
            Ok(Some(stats)) => {
                self.broker.publish(StatusUpdate::Traffic(stats.clone()));
                Some(stats)
            }
            Ok(None) => None,
            Err(e) => {
                log::warn!("Traffic stats unavailable: {:#}", e);
                None
            }
        }
    }

    /// Clear the ready flag; the tunnel is left as it is
    pub fn dispose(&self) {
        self.ready.store(false, Ordering::SeqCst);
        log::info!("Disposed");
    }
}
