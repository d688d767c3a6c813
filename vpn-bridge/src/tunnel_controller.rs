// Tunnel registration lifecycle controller

//! Tunnel registration control
//!
//! This module owns the one OS tunnel registration bound to the current
//! profile: finding or creating it, configuring and starting it, and
//! stopping it. Every OS step is awaited in turn and the first failure ends
//! the chain; nothing is rolled back or retried.
//!
//! Stopping goes through a [`Stopper`], which works from a snapshot of the
//! registration and so never waits for a configure chain that is still in
//! flight.

use crate::backend::{provider_key, ProviderProtocol, Registration, VpnBackend};
use crate::error::{BackendError, Error, Result};
use crate::status::{StatusObserver, Subscription};
use crate::types::{Credentials, Profile, SessionStatus};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Build the provider configuration map; absent values become empty bytes
pub fn provider_configuration(
    config: &str,
    group_identifier: &str,
    credentials: &Credentials,
) -> BTreeMap<String, Vec<u8>> {
    let bytes = |value: Option<&str>| value.unwrap_or_default().as_bytes().to_vec();

    let mut map = BTreeMap::new();
    map.insert(provider_key::CONFIG.to_string(), bytes(Some(config)));
    map.insert(
        provider_key::GROUP_IDENTIFIER.to_string(),
        bytes(Some(group_identifier)),
    );
    map.insert(
        provider_key::USERNAME.to_string(),
        bytes(credentials.username.as_deref()),
    );
    map.insert(
        provider_key::PASSWORD.to_string(),
        bytes(credentials.password.as_deref()),
    );
    map
}

/// Last registration known to the OS, shared with [`Stopper`]s
type Snapshot = Arc<Mutex<Option<Registration>>>;

fn update_snapshot(snapshot: &Snapshot, registration: &Registration) {
    *snapshot.lock().unwrap_or_else(PoisonError::into_inner) = Some(registration.clone());
}

/// Deactivation handle usable while the controller is busy
pub struct Stopper<B: VpnBackend> {
    backend: Arc<B>,
    snapshot: Snapshot,
}

impl<B: VpnBackend> Clone for Stopper<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            snapshot: Arc::clone(&self.snapshot),
        }
    }
}

impl<B: VpnBackend> Stopper<B> {
    /// Ask the OS to bring the tunnel down; no-op without a registration
    pub async fn stop(&self) -> Result<()> {
        let registration = self
            .snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(registration) = registration else {
            log::debug!("Stop requested with no registration loaded");
            return Ok(());
        };
        log::info!("Stopping tunnel {:?}", registration.id);
        self.backend
            .stop(&registration)
            .await
            .map_err(|e| Error::Unknown(e.to_string()))
    }
}

/// Controller for one OS tunnel registration
pub struct TunnelController<B: VpnBackend> {
    backend: Arc<B>,
    observer: StatusObserver,
    profile: Option<Profile>,
    registration: Option<Registration>,
    snapshot: Snapshot,
    subscription: Option<Subscription>,
}

impl<B: VpnBackend> TunnelController<B> {
    /// Create a controller with nothing loaded
    pub fn new(backend: Arc<B>, observer: StatusObserver) -> Self {
        Self {
            backend,
            observer,
            profile: None,
            registration: None,
            snapshot: Arc::new(Mutex::new(None)),
            subscription: None,
        }
    }

    /// Handle that stops the loaded tunnel without borrowing the controller
    pub fn stopper(&self) -> Stopper<B> {
        Stopper {
            backend: Arc::clone(&self.backend),
            snapshot: Arc::clone(&self.snapshot),
        }
    }

    /// Loaded registration, if any
    pub fn registration(&self) -> Option<&Registration> {
        self.registration.as_ref()
    }

    /// Whether a status subscription is installed
    pub fn is_watching(&self) -> bool {
        self.subscription.is_some()
    }

    /// Find the registration for `profile` or start a fresh one
    pub async fn load_or_create(&mut self, profile: Profile) -> Result<SessionStatus> {
        let mut found = self
            .backend
            .load_all(&profile.bundle_identifier)
            .await
            .map_err(|e| Error::ProfileLoad(e.to_string()))?;

        let registration = if found.is_empty() {
            log::info!(
                "No registration for {}, creating a new one",
                profile.bundle_identifier
            );
            Registration::default()
        } else {
            log::info!(
                "Using existing registration {:?} for {}",
                found[0].id,
                profile.bundle_identifier
            );
            found.swap_remove(0)
        };

        let code = self
            .backend
            .status(&registration)
            .await
            .map_err(|e| Error::ProfileLoad(e.to_string()))?;

        // A relay for another registration must not feed this one's status
        let same_registration = match (&self.registration, &registration.id) {
            (Some(current), Some(id)) => current.id.as_deref() == Some(id.as_str()),
            _ => false,
        };
        if !same_registration {
            self.teardown();
        }
        self.observer.attach(code);

        update_snapshot(&self.snapshot, &registration);
        self.profile = Some(profile);
        self.registration = Some(registration);
        Ok(self.observer.current())
    }

    /// Configure the registration with `config` and credentials, persist it and start the tunnel
    pub async fn configure_and_start(&mut self, config: &str, credentials: Credentials) -> Result<()> {
        let (Some(profile), Some(registration)) = (self.profile.as_ref(), self.registration.as_mut())
        else {
            return Err(Error::NotInitialized);
        };

        self.backend
            .load(registration)
            .await
            .map_err(|e| Error::ProfileLoad(e.to_string()))?;

        registration.protocol = Some(ProviderProtocol {
            provider_bundle_identifier: profile.bundle_identifier.clone(),
            server_address: String::new(),
            provider_configuration: provider_configuration(
                config,
                &profile.group_identifier,
                &credentials,
            ),
            disconnect_on_sleep: false,
        });
        registration.description = Some(profile.display_label.clone());
        registration.enabled = true;

        self.backend
            .save(registration)
            .await
            .map_err(|e| Error::ProfileSave(e.to_string()))?;
        log::info!("Saved registration {:?}", registration.id);
        update_snapshot(&self.snapshot, registration);

        self.backend
            .load(registration)
            .await
            .map_err(|e| Error::ProfileReload(e.to_string()))?;
        update_snapshot(&self.snapshot, registration);

        // Replacing the handle cancels the previous subscription
        let stream = self
            .backend
            .watch_status(registration)
            .await
            .map_err(|e| Error::Unknown(e.to_string()))?;
        self.subscription = Some(self.observer.watch(stream));

        if credentials.pair().is_none() {
            log::warn!("Refusing to start tunnel without username and password");
            return Err(Error::CredentialsMissing);
        }

        log::info!("Starting tunnel for {}", profile.bundle_identifier);
        self.backend
            .start(registration, &credentials)
            .await
            .map_err(|e| match e {
                BackendError::PermissionDenied(msg) => Error::PermissionDenied(msg),
                BackendError::Other(msg) => Error::Unknown(msg),
            })
    }

    /// Ask the OS to bring the tunnel down; no-op without a registration
    pub async fn stop(&self) -> Result<()> {
        self.stopper().stop().await
    }

    /// Cancel the status subscription, leaving the tunnel as it is
    pub fn teardown(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryBackend, Op};
    use crate::backend::status_code;
    use crate::broker::{StatusBroker, StatusUpdate};
    use std::time::Duration;

    fn profile() -> Profile {
        Profile {
            bundle_identifier: "com.example.tunnel".to_string(),
            group_identifier: "group.example".to_string(),
            display_label: "Example VPN".to_string(),
        }
    }

    fn creds() -> Credentials {
        Credentials::new(Some("user".into()), Some("pass".into()))
    }

    fn controller(backend: &MemoryBackend) -> (TunnelController<MemoryBackend>, StatusObserver) {
        let observer = StatusObserver::new(StatusBroker::new());
        (
            TunnelController::new(Arc::new(backend.clone()), observer.clone()),
            observer,
        )
    }

    async fn wait_for(observer: &StatusObserver, expected: SessionStatus) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while observer.current() != expected {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("status never reached");
    }

    #[test]
    fn test_provider_configuration_shape() {
        let map = provider_configuration("client\nremote x", "group.example", &creds());
        assert_eq!(map.len(), 4);
        assert_eq!(map["config"], b"client\nremote x".to_vec());
        assert_eq!(map["groupIdentifier"], b"group.example".to_vec());
        assert_eq!(map["username"], b"user".to_vec());
        assert_eq!(map["password"], b"pass".to_vec());
    }

    #[test]
    fn test_provider_configuration_absent_credentials_are_empty() {
        let map = provider_configuration("c", "g", &Credentials::default());
        assert_eq!(map["username"], Vec::<u8>::new());
        assert_eq!(map["password"], Vec::<u8>::new());
    }

    #[tokio::test]
    async fn test_load_or_create_creates_when_none_found() {
        let backend = MemoryBackend::new();
        let (mut controller, _) = controller(&backend);

        let status = controller.load_or_create(profile()).await.unwrap();

        assert_eq!(status, SessionStatus::Disconnected);
        assert!(!controller.registration().unwrap().is_saved());
    }

    #[tokio::test]
    async fn test_load_or_create_uses_first_match() {
        let backend = MemoryBackend::new();
        let existing = backend.insert(Registration {
            protocol: Some(ProviderProtocol {
                provider_bundle_identifier: "com.example.tunnel".into(),
                ..Default::default()
            }),
            enabled: true,
            ..Default::default()
        });
        backend.emit(existing.id.as_deref().unwrap(), status_code::CONNECTED);
        let (mut controller, _) = controller(&backend);

        let status = controller.load_or_create(profile()).await.unwrap();

        assert_eq!(status, SessionStatus::Connected);
        assert_eq!(controller.registration(), Some(&existing));
    }

    #[tokio::test]
    async fn test_load_or_create_failure() {
        let backend = MemoryBackend::new();
        backend.fail(Op::LoadAll, BackendError::Other("prefs unavailable".into()));
        let (mut controller, observer) = controller(&backend);

        let err = controller.load_or_create(profile()).await.unwrap_err();

        assert_eq!(err, Error::ProfileLoad("prefs unavailable".into()));
        assert!(controller.registration().is_none());
        assert!(!observer.is_attached());
    }

    #[tokio::test]
    async fn test_configure_without_registration() {
        let backend = MemoryBackend::new();
        let (mut controller, _) = controller(&backend);
        assert_eq!(
            controller.configure_and_start("c", creds()).await,
            Err(Error::NotInitialized)
        );
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_configure_and_start_saves_and_connects() {
        let backend = MemoryBackend::new();
        let (mut controller, observer) = controller(&backend);
        controller.load_or_create(profile()).await.unwrap();

        controller.configure_and_start("remote x", creds()).await.unwrap();

        let stored = backend.registrations();
        assert_eq!(stored.len(), 1);
        let stored = &stored[0];
        assert!(stored.enabled);
        assert_eq!(stored.description.as_deref(), Some("Example VPN"));
        let protocol = stored.protocol.as_ref().unwrap();
        assert_eq!(protocol.provider_bundle_identifier, "com.example.tunnel");
        assert_eq!(protocol.server_address, "");
        assert!(!protocol.disconnect_on_sleep);
        assert_eq!(protocol.provider_configuration["config"], b"remote x".to_vec());

        assert_eq!(
            backend.calls(),
            vec![Op::LoadAll, Op::Status, Op::Load, Op::Save, Op::Load, Op::Watch, Op::Start]
        );
        assert_eq!(backend.last_username().as_deref(), Some("user"));
        wait_for(&observer, SessionStatus::Connected).await;
    }

    #[tokio::test]
    async fn test_credentials_checked_after_reload_before_start() {
        let backend = MemoryBackend::new();
        let (mut controller, _) = controller(&backend);
        controller.load_or_create(profile()).await.unwrap();

        let missing_password = Credentials::new(Some("user".into()), None);
        let err = controller
            .configure_and_start("remote x", missing_password)
            .await
            .unwrap_err();

        assert_eq!(err, Error::CredentialsMissing);
        assert_eq!(backend.call_count(Op::Save), 1);
        assert_eq!(backend.call_count(Op::Load), 2);
        assert_eq!(backend.call_count(Op::Start), 0);
        // Subscription is installed before the credential check
        assert!(controller.is_watching());
    }

    #[tokio::test]
    async fn test_save_failure_stops_chain() {
        let backend = MemoryBackend::new();
        backend.fail(Op::Save, BackendError::Other("read-only".into()));
        let (mut controller, _) = controller(&backend);
        controller.load_or_create(profile()).await.unwrap();

        let err = controller.configure_and_start("c", creds()).await.unwrap_err();

        assert_eq!(err, Error::ProfileSave("read-only".into()));
        assert_eq!(backend.call_count(Op::Watch), 0);
        assert_eq!(backend.call_count(Op::Start), 0);
    }

    #[tokio::test]
    async fn test_reload_failure_is_distinct() {
        let backend = MemoryBackend::new();
        // First load (refresh) succeeds, second (after save) fails
        backend.fail_after(Op::Load, 1, BackendError::Other("vanished".into()));
        let (mut controller, _) = controller(&backend);
        controller.load_or_create(profile()).await.unwrap();

        let err = controller.configure_and_start("c", creds()).await.unwrap_err();

        assert_eq!(err, Error::ProfileReload("vanished".into()));
        assert_eq!(backend.call_count(Op::Start), 0);
    }

    #[tokio::test]
    async fn test_start_errors_pass_through() {
        let backend = MemoryBackend::new();
        let (mut controller, _) = controller(&backend);
        controller.load_or_create(profile()).await.unwrap();

        backend.fail(Op::Start, BackendError::PermissionDenied("user declined".into()));
        assert_eq!(
            controller.configure_and_start("c", creds()).await,
            Err(Error::PermissionDenied("user declined".into()))
        );

        backend.fail(Op::Start, BackendError::Other("provider missing".into()));
        assert_eq!(
            controller.configure_and_start("c", creds()).await,
            Err(Error::Unknown("provider missing".into()))
        );
    }

    #[tokio::test]
    async fn test_second_connect_replaces_subscription() {
        let backend = MemoryBackend::manual();
        let broker = StatusBroker::new();
        let mut rx = broker.subscribe();
        let mut controller =
            TunnelController::new(Arc::new(backend.clone()), StatusObserver::new(broker));
        controller.load_or_create(profile()).await.unwrap();
        controller.configure_and_start("c", creds()).await.unwrap();
        controller.configure_and_start("c", creds()).await.unwrap();
        assert_eq!(backend.call_count(Op::Watch), 2);

        let id = backend.registrations()[0].id.clone().unwrap();
        backend.emit(&id, status_code::REASSERTING);

        // Only one relay is alive, so the notification arrives exactly once
        let update = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update, StatusUpdate::Stage(SessionStatus::Reasserting));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_without_registration_is_noop() {
        let backend = MemoryBackend::new();
        let (controller, _) = controller(&backend);
        controller.stop().await.unwrap();
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_stop_reaches_backend() {
        let backend = MemoryBackend::new();
        let (mut controller, observer) = controller(&backend);
        controller.load_or_create(profile()).await.unwrap();
        controller.configure_and_start("c", creds()).await.unwrap();
        wait_for(&observer, SessionStatus::Connected).await;

        controller.stop().await.unwrap();

        assert_eq!(backend.call_count(Op::Stop), 1);
        wait_for(&observer, SessionStatus::Disconnected).await;
    }

    #[tokio::test]
    async fn test_stopper_does_not_wait_for_pending_start() {
        let backend = MemoryBackend::manual();
        backend.stall(Op::Start);
        let (mut controller, _) = controller(&backend);
        controller.load_or_create(profile()).await.unwrap();
        let stopper = controller.stopper();

        let connect = tokio::spawn(async move {
            let _ = controller.configure_and_start("c", creds()).await;
        });
        tokio::time::timeout(Duration::from_secs(1), async {
            while backend.call_count(Op::Start) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_millis(500), stopper.stop())
            .await
            .expect("stop waited for start")
            .unwrap();
        assert_eq!(backend.call_count(Op::Stop), 1);
        connect.abort();
    }

    #[tokio::test]
    async fn test_reload_for_other_registration_cancels_relay() {
        let backend = MemoryBackend::manual();
        let (mut controller, observer) = controller(&backend);
        controller.load_or_create(profile()).await.unwrap();
        controller.configure_and_start("c", creds()).await.unwrap();
        let old_id = backend.registrations()[0].id.clone().unwrap();

        let other = Profile {
            bundle_identifier: "com.example.other".to_string(),
            ..profile()
        };
        controller.load_or_create(other).await.unwrap();
        assert!(!controller.is_watching());

        backend.emit(&old_id, status_code::CONNECTED);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(observer.current(), SessionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_reload_for_same_registration_keeps_relay() {
        let backend = MemoryBackend::manual();
        let (mut controller, observer) = controller(&backend);
        controller.load_or_create(profile()).await.unwrap();
        controller.configure_and_start("c", creds()).await.unwrap();

        controller.load_or_create(profile()).await.unwrap();
        assert!(controller.is_watching());

        let id = backend.registrations()[0].id.clone().unwrap();
        backend.emit(&id, status_code::CONNECTED);
        wait_for(&observer, SessionStatus::Connected).await;
    }

    #[tokio::test]
    async fn test_teardown_cancels_subscription() {
        let backend = MemoryBackend::manual();
        let (mut controller, observer) = controller(&backend);
        controller.load_or_create(profile()).await.unwrap();
        controller.configure_and_start("c", creds()).await.unwrap();

        controller.teardown();
        assert!(!controller.is_watching());

        let id = backend.registrations()[0].id.clone().unwrap();
        backend.emit(&id, status_code::CONNECTED);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(observer.current(), SessionStatus::Disconnected);
    }
}
