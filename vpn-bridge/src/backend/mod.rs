//! OS VPN facility abstraction
//!
//! A [`VpnBackend`] persists tunnel registrations, starts and stops them, and
//! streams status changes. Status codes cross this boundary in a
//! backend-neutral table (see [`status_code`]); each backend translates its
//! native states at its own edge.

use crate::error::BackendError;
use crate::types::Credentials;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::collections::BTreeMap;

pub mod memory;
pub mod network_manager;

pub use memory::MemoryBackend;
pub use network_manager::NetworkManagerBackend;

/// Backend-neutral tunnel status codes
pub mod status_code {
    /// Registration is not usable
    pub const INVALID: u32 = 0;
    /// Tunnel is down
    pub const DISCONNECTED: u32 = 1;
    /// Tunnel is coming up
    pub const CONNECTING: u32 = 2;
    /// Tunnel is up
    pub const CONNECTED: u32 = 3;
    /// Tunnel is re-establishing after a network change
    pub const REASSERTING: u32 = 4;
    /// Tunnel is going down
    pub const DISCONNECTING: u32 = 5;
}

/// Keys of the provider configuration map
pub mod provider_key {
    /// Raw tunnel configuration text
    pub const CONFIG: &str = "config";
    /// Shared storage group identifier
    pub const GROUP_IDENTIFIER: &str = "groupIdentifier";
    /// Account name
    pub const USERNAME: &str = "username";
    /// Account password
    pub const PASSWORD: &str = "password";
}

/// Stream of status codes for one registration
pub type StatusStream = BoxStream<'static, u32>;

/// Provider-specific part of a registration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderProtocol {
    /// Provider that implements the tunnel
    pub provider_bundle_identifier: String,
    /// Server address shown by the OS; left empty, the provider reads it from its configuration
    pub server_address: String,
    /// Opaque values handed to the provider
    pub provider_configuration: BTreeMap<String, Vec<u8>>,
    /// Whether the OS drops the tunnel when the machine sleeps
    pub disconnect_on_sleep: bool,
}

/// Backend-neutral image of an OS tunnel registration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registration {
    /// OS identity, assigned on first save
    pub id: Option<String>,
    /// Title shown in the system settings
    pub description: Option<String>,
    /// Provider settings; `None` until first configured
    pub protocol: Option<ProviderProtocol>,
    /// Whether the OS may activate the registration
    pub enabled: bool,
}

impl Registration {
    /// Whether the OS has ever stored this registration
    pub fn is_saved(&self) -> bool {
        self.id.is_some()
    }

    /// Provider bundle identifier, if a protocol is configured
    pub fn bundle_identifier(&self) -> Option<&str> {
        self.protocol
            .as_ref()
            .map(|p| p.provider_bundle_identifier.as_str())
    }
}

/// Host VPN facility
#[async_trait]
pub trait VpnBackend: Send + Sync + 'static {
    /// All stored registrations bound to the given provider bundle identifier
    async fn load_all(&self, bundle_identifier: &str) -> Result<Vec<Registration>, BackendError>;

    /// Refresh a registration from the OS store. Unsaved registrations are left as they are.
    async fn load(&self, registration: &mut Registration) -> Result<(), BackendError>;

    /// Persist a registration, assigning its id on first save
    async fn save(&self, registration: &mut Registration) -> Result<(), BackendError>;

    /// Current status code of a registration
    async fn status(&self, registration: &Registration) -> Result<u32, BackendError>;

    /// Subscribe to status changes of a registration
    async fn watch_status(&self, registration: &Registration) -> Result<StatusStream, BackendError>;

    /// Ask the OS to bring the tunnel up with the given credentials
    async fn start(
        &self,
        registration: &Registration,
        credentials: &Credentials,
    ) -> Result<(), BackendError>;

    /// Ask the OS to bring the tunnel down
    async fn stop(&self, registration: &Registration) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registration_is_unsaved() {
        let registration = Registration::default();
        assert!(!registration.is_saved());
        assert!(!registration.enabled);
        assert_eq!(registration.bundle_identifier(), None);
    }

    #[test]
    fn test_bundle_identifier_from_protocol() {
        let registration = Registration {
            protocol: Some(ProviderProtocol {
                provider_bundle_identifier: "com.example.tunnel".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(registration.bundle_identifier(), Some("com.example.tunnel"));
    }

    #[test]
    fn test_status_codes_are_distinct() {
        let mut codes = vec![
            status_code::INVALID,
            status_code::DISCONNECTED,
            status_code::CONNECTING,
            status_code::CONNECTED,
            status_code::REASSERTING,
            status_code::DISCONNECTING,
        ];
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), 6);
    }
}
