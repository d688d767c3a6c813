// Error types for the VPN session bridge

//! Error taxonomy
//!
//! [`Error`] is what callers of the facade see. [`BackendError`] is what an
//! OS backend reports; the controller decides which caller-facing variant a
//! backend failure becomes, depending on which step failed.

use std::fmt;
use thiserror::Error;

/// Request field that failed validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// Provider bundle identifier
    BundleIdentifier,
    /// Label shown in the system settings
    DisplayLabel,
    /// Shared storage group identifier
    GroupIdentifier,
    /// Tunnel configuration text
    Config,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Field::BundleIdentifier => "providerBundleIdentifier",
            Field::DisplayLabel => "localizedDescription",
            Field::GroupIdentifier => "groupIdentifier",
            Field::Config => "config",
        })
    }
}

/// Errors surfaced to the caller of a facade operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A required request field was empty or missing
    #[error("{0} is empty or missing")]
    InvalidArgument(Field),

    /// `connect` before a successful `initialize`
    #[error("VPN engine must be initialized first")]
    NotInitialized,

    /// The OS registration could not be read
    #[error("Failed to load tunnel registration: {0}")]
    ProfileLoad(String),

    /// The OS registration could not be written
    #[error("Failed to save tunnel registration: {0}")]
    ProfileSave(String),

    /// The OS registration could not be read back after saving
    #[error("Failed to reload tunnel registration: {0}")]
    ProfileReload(String),

    /// Start attempted without both credentials
    #[error("Username or password is missing")]
    CredentialsMissing,

    /// The OS refused to activate the tunnel
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Any other OS failure, message kept verbatim
    #[error("{0}")]
    Unknown(String),
}

impl Error {
    /// Message of the underlying OS failure, when there is one
    pub fn detail(&self) -> Option<&str> {
        match self {
            Error::ProfileLoad(msg)
            | Error::ProfileSave(msg)
            | Error::ProfileReload(msg)
            | Error::PermissionDenied(msg)
            | Error::Unknown(msg) => Some(msg),
            _ => None,
        }
    }
}

/// Result type for facade and controller operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by an OS VPN backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The OS refused the request for the calling user
    #[error("{0}")]
    PermissionDenied(String),

    /// Any other failure, message kept verbatim
    #[error("{0}")]
    Other(String),
}

impl From<zbus::Error> for BackendError {
    fn from(err: zbus::Error) -> Self {
        if let zbus::Error::MethodError(name, detail, _) = &err {
            let name = name.as_str();
            if name.ends_with(".PermissionDenied") || name.ends_with(".AccessDenied") {
                return BackendError::PermissionDenied(
                    detail.clone().unwrap_or_else(|| name.to_string()),
                );
            }
        }
        BackendError::Other(err.to_string())
    }
}

impl From<zbus::zvariant::Error> for BackendError {
    fn from(err: zbus::zvariant::Error) -> Self {
        BackendError::Other(err.to_string())
    }
}

impl From<zbus::fdo::Error> for BackendError {
    fn from(err: zbus::fdo::Error) -> Self {
        match err {
            zbus::fdo::Error::AccessDenied(msg) => BackendError::PermissionDenied(msg),
            other => BackendError::Other(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_names_match_request_keys() {
        assert_eq!(Field::BundleIdentifier.to_string(), "providerBundleIdentifier");
        assert_eq!(Field::DisplayLabel.to_string(), "localizedDescription");
        assert_eq!(Field::GroupIdentifier.to_string(), "groupIdentifier");
        assert_eq!(Field::Config.to_string(), "config");
    }

    #[test]
    fn test_detail_only_for_os_failures() {
        assert_eq!(Error::ProfileSave("disk full".into()).detail(), Some("disk full"));
        assert_eq!(Error::Unknown("boom".into()).detail(), Some("boom"));
        assert_eq!(Error::NotInitialized.detail(), None);
        assert_eq!(Error::CredentialsMissing.detail(), None);
        assert_eq!(Error::InvalidArgument(Field::Config).detail(), None);
    }

    #[test]
    fn test_unknown_passes_message_verbatim() {
        let err = Error::Unknown("provider crashed".into());
        assert_eq!(err.to_string(), "provider crashed");
    }

    #[test]
    fn test_fdo_access_denied_is_permission_denied() {
        let err: BackendError = zbus::fdo::Error::AccessDenied("not authorized".into()).into();
        assert_eq!(err, BackendError::PermissionDenied("not authorized".into()));

        let err: BackendError = zbus::fdo::Error::Failed("nope".into()).into();
        assert!(matches!(err, BackendError::Other(_)));
    }
}
