// NetworkManager VPN backend via D-Bus

//! NetworkManager implementation of [`VpnBackend`]
//!
//! Registrations are NetworkManager connection profiles of type `vpn` whose
//! `vpn.service-type` names the provider (a NetworkManager VPN plugin). The
//! provider configuration lives in `vpn.data`; credentials are only ever
//! handed over with `UpdateUnsaved`, so NetworkManager keeps them in memory
//! and never writes them to disk.

use super::{provider_key, status_code, ProviderProtocol, Registration, StatusStream, VpnBackend};
use crate::error::BackendError;
use crate::types::Credentials;
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use zbus::zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value};
use zbus::{proxy, Connection, MatchRule, MessageStream};

const ACTIVE_CONNECTION_INTERFACE: &str = "org.freedesktop.NetworkManager.Connection.Active";

/// `vpn.data` flag value telling NetworkManager not to store the password
const SECRET_NOT_SAVED: &str = "2";

/// NetworkManager active connection states
mod nm_state {
    pub const ACTIVATING: u32 = 1;
    pub const ACTIVATED: u32 = 2;
    pub const DEACTIVATING: u32 = 3;
    pub const DEACTIVATED: u32 = 4;
}

/// Connection settings as returned by `GetSettings`
type NmSettings = HashMap<String, HashMap<String, OwnedValue>>;

/// D-Bus proxy for NetworkManager
#[proxy(
    interface = "org.freedesktop.NetworkManager",
    default_service = "org.freedesktop.NetworkManager",
    default_path = "/org/freedesktop/NetworkManager"
)]
trait NetworkManager {
    /// Activate a stored connection
    fn activate_connection(
        &self,
        connection: &ObjectPath<'_>,
        device: &ObjectPath<'_>,
        specific_object: &ObjectPath<'_>,
    ) -> zbus::Result<OwnedObjectPath>;

    /// Deactivate an active connection
    fn deactivate_connection(&self, active_connection: &ObjectPath<'_>) -> zbus::Result<()>;

    /// Get all active connections
    #[zbus(property)]
    fn active_connections(&self) -> zbus::Result<Vec<OwnedObjectPath>>;
}

/// D-Bus proxy for the connection settings service
#[proxy(
    interface = "org.freedesktop.NetworkManager.Settings",
    default_service = "org.freedesktop.NetworkManager",
    default_path = "/org/freedesktop/NetworkManager/Settings"
)]
trait Settings {
    /// List stored connection profiles
    fn list_connections(&self) -> zbus::Result<Vec<OwnedObjectPath>>;

    /// Store a new connection profile
    fn add_connection(
        &self,
        connection: HashMap<&str, HashMap<&str, Value<'_>>>,
    ) -> zbus::Result<OwnedObjectPath>;
}

/// D-Bus proxy for one stored connection profile
#[proxy(
    interface = "org.freedesktop.NetworkManager.Settings.Connection",
    default_service = "org.freedesktop.NetworkManager"
)]
trait SettingsConnection {
    /// Read settings, secrets excluded
    fn get_settings(&self) -> zbus::Result<NmSettings>;

    /// Replace settings and write them to disk
    fn update(&self, properties: HashMap<&str, HashMap<&str, Value<'_>>>) -> zbus::Result<()>;

    /// Replace settings in memory only
    fn update_unsaved(
        &self,
        properties: HashMap<&str, HashMap<&str, Value<'_>>>,
    ) -> zbus::Result<()>;
}

/// D-Bus proxy for active connection
#[proxy(
    interface = "org.freedesktop.NetworkManager.Connection.Active",
    default_service = "org.freedesktop.NetworkManager"
)]
trait ActiveConnection {
    /// Stored profile this activation belongs to
    #[zbus(property)]
    fn connection(&self) -> zbus::Result<OwnedObjectPath>;

    /// Activation state
    #[zbus(property)]
    fn state(&self) -> zbus::Result<u32>;
}

/// Translate a NetworkManager active connection state into the neutral code table
pub fn translate_state(state: u32) -> u32 {
    match state {
        nm_state::ACTIVATING => status_code::CONNECTING,
        nm_state::ACTIVATED => status_code::CONNECTED,
        nm_state::DEACTIVATING => status_code::DISCONNECTING,
        nm_state::DEACTIVATED => status_code::DISCONNECTED,
        // NM_ACTIVE_CONNECTION_STATE_UNKNOWN and anything newer
        _ => u32::MAX,
    }
}

fn string_setting(settings: &NmSettings, section: &str, key: &str) -> Option<String> {
    let value = settings.get(section)?.get(key)?;
    <&str>::try_from(value).ok().map(str::to_string)
}

fn vpn_data(settings: &NmSettings) -> HashMap<String, String> {
    settings
        .get("vpn")
        .and_then(|vpn| vpn.get("data"))
        .and_then(|data| data.try_clone().ok())
        .and_then(|data| HashMap::<String, String>::try_from(Value::from(data)).ok())
        .unwrap_or_default()
}

/// Build a registration from stored settings, if the profile is a VPN profile
pub fn registration_from_settings(path: &str, settings: &NmSettings) -> Option<Registration> {
    if string_setting(settings, "connection", "type").as_deref() != Some("vpn") {
        return None;
    }
    let bundle = string_setting(settings, "vpn", "service-type")?;

    let mut provider_configuration: BTreeMap<String, Vec<u8>> = vpn_data(settings)
        .into_iter()
        .filter(|(key, _)| !key.ends_with("-flags"))
        .map(|(key, value)| (key, value.into_bytes()))
        .collect();
    // The password is never stored; keep the key so the map shape is stable
    provider_configuration
        .entry(provider_key::PASSWORD.to_string())
        .or_default();

    let enabled = settings
        .get("connection")
        .and_then(|c| c.get("autoconnect"))
        .and_then(|v| bool::try_from(v).ok())
        .unwrap_or(true);

    Some(Registration {
        id: Some(path.to_string()),
        description: string_setting(settings, "connection", "id"),
        protocol: Some(ProviderProtocol {
            provider_bundle_identifier: bundle,
            server_address: String::new(),
            provider_configuration,
            disconnect_on_sleep: false,
        }),
        enabled,
    })
}

/// Build the settings dictionary for a registration.
///
/// The password entry of the provider configuration is replaced by a flag
/// telling NetworkManager not to save it.
pub fn settings_for<'a>(
    registration: &'a Registration,
    uuid: &'a str,
) -> HashMap<&'static str, HashMap<&'static str, Value<'a>>> {
    let mut connection = HashMap::new();
    connection.insert("type", Value::from("vpn"));
    connection.insert("uuid", Value::from(uuid));
    connection.insert(
        "id",
        Value::from(registration.description.as_deref().unwrap_or("VPN")),
    );
    connection.insert("autoconnect", Value::from(registration.enabled));

    let mut vpn = HashMap::new();
    if let Some(protocol) = &registration.protocol {
        let mut data: HashMap<String, String> = protocol
            .provider_configuration
            .iter()
            .filter(|(key, _)| key.as_str() != provider_key::PASSWORD)
            .map(|(key, value)| (key.clone(), String::from_utf8_lossy(value).into_owned()))
            .collect();
        data.insert(
            format!("{}-flags", provider_key::PASSWORD),
            SECRET_NOT_SAVED.to_string(),
        );
        vpn.insert(
            "service-type",
            Value::from(protocol.provider_bundle_identifier.as_str()),
        );
        vpn.insert("data", Value::from(data));
    }

    let mut settings = HashMap::new();
    settings.insert("connection", connection);
    settings.insert("vpn", vpn);
    settings
}

/// NetworkManager-backed VPN facility
pub struct NetworkManagerBackend {
    connection: Connection,
}

impl NetworkManagerBackend {
    /// Connect to NetworkManager on the system bus
    pub async fn new() -> Result<Self, BackendError> {
        let connection = Connection::system().await?;
        Ok(Self { connection })
    }

    async fn settings_proxy(
        &self,
        path: &str,
    ) -> Result<SettingsConnectionProxy<'static>, BackendError> {
        Ok(SettingsConnectionProxy::builder(&self.connection)
            .path(path.to_string())?
            .build()
            .await?)
    }

    /// Active connection objects bound to the stored profile at `path`
    async fn active_for(&self, path: &str) -> Result<Vec<(OwnedObjectPath, u32)>, BackendError> {
        let nm = NetworkManagerProxy::new(&self.connection).await?;
        let mut found = Vec::new();

        for active_path in nm.active_connections().await? {
            let active = ActiveConnectionProxy::builder(&self.connection)
                .path(&active_path)?
                .build()
                .await?;
            // Active connections can vanish between listing and querying
            match active.connection().await {
                Ok(conn) if conn.as_str() == path => {
                    let state = active.state().await.unwrap_or(nm_state::DEACTIVATED);
                    found.push((active_path, state));
                }
                Ok(_) => {}
                Err(e) => log::debug!("Skipping active connection {}: {}", active_path, e),
            }
        }

        Ok(found)
    }

    fn saved_path(registration: &Registration) -> Result<&str, BackendError> {
        registration
            .id
            .as_deref()
            .ok_or_else(|| BackendError::Other("registration has not been saved".to_string()))
    }
}

#[async_trait]
impl VpnBackend for NetworkManagerBackend {
    async fn load_all(&self, bundle_identifier: &str) -> Result<Vec<Registration>, BackendError> {
        let settings_service = SettingsProxy::new(&self.connection).await?;
        let mut registrations = Vec::new();

        for path in settings_service.list_connections().await? {
            let settings = self.settings_proxy(path.as_str()).await?.get_settings().await?;
            if let Some(registration) = registration_from_settings(path.as_str(), &settings) {
                if registration.bundle_identifier() == Some(bundle_identifier) {
                    registrations.push(registration);
                }
            }
        }

        log::debug!(
            "Found {} NetworkManager profile(s) for {}",
            registrations.len(),
            bundle_identifier
        );
        Ok(registrations)
    }

    async fn load(&self, registration: &mut Registration) -> Result<(), BackendError> {
        let Some(path) = registration.id.clone() else {
            return Ok(());
        };
        let settings = self.settings_proxy(&path).await?.get_settings().await?;
        *registration = registration_from_settings(&path, &settings).ok_or_else(|| {
            BackendError::Other(format!("{} is no longer a VPN profile", path))
        })?;
        Ok(())
    }

    async fn save(&self, registration: &mut Registration) -> Result<(), BackendError> {
        match registration.id.clone() {
            Some(path) => {
                let proxy = self.settings_proxy(&path).await?;
                let current = proxy.get_settings().await?;
                let uuid = string_setting(&current, "connection", "uuid")
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                proxy.update(settings_for(registration, &uuid)).await?;
                log::info!("Updated NetworkManager profile {}", path);
            }
            None => {
                let uuid = uuid::Uuid::new_v4().to_string();
                let settings_service = SettingsProxy::new(&self.connection).await?;
                let path = settings_service
                    .add_connection(settings_for(registration, &uuid))
                    .await?;
                log::info!("Created NetworkManager profile {}", path);
                registration.id = Some(path.to_string());
            }
        }
        Ok(())
    }

    async fn status(&self, registration: &Registration) -> Result<u32, BackendError> {
        let Some(path) = registration.id.as_deref() else {
            return Ok(status_code::DISCONNECTED);
        };
        Ok(self
            .active_for(path)
            .await?
            .first()
            .map(|(_, state)| translate_state(*state))
            .unwrap_or(status_code::DISCONNECTED))
    }

    async fn watch_status(&self, registration: &Registration) -> Result<StatusStream, BackendError> {
        let target = Self::saved_path(registration)?.to_string();
        let rule = MatchRule::builder()
            .msg_type(zbus::message::Type::Signal)
            .interface(ACTIVE_CONNECTION_INTERFACE)?
            .member("StateChanged")?
            .build();
        let messages = MessageStream::for_match_rule(rule, &self.connection, None).await?;
        let connection = self.connection.clone();

        // Active connection paths already known to belong to the target profile
        let known: HashSet<String> = HashSet::new();

        let stream = stream::unfold(
            (messages, connection, target, known),
            |(mut messages, connection, target, mut known)| async move {
                while let Some(message) = messages.next().await {
                    let message = match message {
                        Ok(m) => m,
                        Err(e) => {
                            log::warn!("NetworkManager signal error: {}", e);
                            continue;
                        }
                    };
                    let Some(active_path) = message.header().path().map(|p| p.to_string()) else {
                        continue;
                    };

                    if !known.contains(&active_path) {
                        let belongs = match ActiveConnectionProxy::builder(&connection)
                            .path(active_path.clone())
                        {
                            Ok(builder) => match builder.build().await {
                                Ok(active) => active
                                    .connection()
                                    .await
                                    .map(|conn| conn.as_str() == target)
                                    .unwrap_or(false),
                                Err(_) => false,
                            },
                            Err(_) => false,
                        };
                        if !belongs {
                            continue;
                        }
                        known.insert(active_path.clone());
                    }

                    match message.body().deserialize::<(u32, u32)>() {
                        Ok((state, reason)) => {
                            log::debug!(
                                "NetworkManager state {} (reason {}) on {}",
                                state,
                                reason,
                                active_path
                            );
                            if state == nm_state::DEACTIVATED {
                                known.remove(&active_path);
                            }
                            return Some((
                                translate_state(state),
                                (messages, connection, target, known),
                            ));
                        }
                        Err(e) => log::warn!("Malformed StateChanged signal: {}", e),
                    }
                }
                None
            },
        );

        Ok(stream.boxed())
    }

    async fn start(
        &self,
        registration: &Registration,
        credentials: &Credentials,
    ) -> Result<(), BackendError> {
        let path = Self::saved_path(registration)?;
        let proxy = self.settings_proxy(path).await?;
        let current = proxy.get_settings().await?;
        let uuid = string_setting(&current, "connection", "uuid")
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut settings = settings_for(registration, &uuid);
        if let Some((username, password)) = credentials.pair() {
            let mut secrets = HashMap::new();
            secrets.insert(provider_key::PASSWORD.to_string(), password.to_string());
            if let Some(vpn) = settings.get_mut("vpn") {
                vpn.insert("user-name", Value::from(username.to_string()));
                vpn.insert("secrets", Value::from(secrets));
            }
        }
        proxy.update_unsaved(settings).await?;

        let nm = NetworkManagerProxy::new(&self.connection).await?;
        let root = ObjectPath::try_from("/")?;
        let connection_path = ObjectPath::try_from(path)?;
        let active = nm
            .activate_connection(&connection_path, &root, &root)
            .await?;
        log::info!("Activation of {} started as {}", path, active);
        Ok(())
    }

    async fn stop(&self, registration: &Registration) -> Result<(), BackendError> {
        let Some(path) = registration.id.as_deref() else {
            return Ok(());
        };
        let nm = NetworkManagerProxy::new(&self.connection).await?;
        for (active_path, _) in self.active_for(path).await? {
            log::info!("Deactivating {}", active_path);
            nm.deactivate_connection(&active_path).await?;
        }
        Ok(())
    }
}
