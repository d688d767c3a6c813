// Configuration file parser

//! Configuration file parsing and validation
//!
//! This module loads the daemon's TOML configuration and checks the values
//! that would otherwise only fail later, at first use.

use crate::types::Config;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

const LOG_LEVELS: [&str; 6] = ["error", "warn", "info", "debug", "trace", "off"];

/// Load configuration from TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let contents = fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read config file {}", path.as_ref().display()))?;

    let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;

    validate_config(&config)?;
    Ok(config)
}

/// Validate configuration values
fn validate_config(config: &Config) -> Result<()> {
    let general = &config.general;

    if !LOG_LEVELS.contains(&general.log_level.to_ascii_lowercase().as_str()) {
        anyhow::bail!(
            "log_level must be one of {}, got '{}'",
            LOG_LEVELS.join(", "),
            general.log_level
        );
    }

    // Providers resolve the same directory independently
    if !general.shared_dir.is_absolute() {
        anyhow::bail!(
            "shared_dir must be an absolute path, got '{}'",
            general.shared_dir.display()
        );
    }

    if let Some(path) = &general.profile_path {
        if path.as_os_str().is_empty() || path.to_string_lossy().ends_with('/') {
            anyhow::bail!("profile_path must name a file, got '{}'", path.display());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BackendKind, GeneralConfig};
    use std::path::PathBuf;

    fn valid() -> Config {
        Config {
            general: GeneralConfig {
                log_level: "debug".to_string(),
                backend: BackendKind::Memory,
                shared_dir: PathBuf::from("/var/lib/vpn-bridge/shared"),
                profile_path: Some(PathBuf::from("/var/lib/vpn-bridge/profile.toml")),
            },
        }
    }

    #[test]
    fn test_validate_config() {
        let config = valid();
        assert!(validate_config(&config).is_ok());

        // Bad log level
        let mut bad_config = config.clone();
        bad_config.general.log_level = "verbose".to_string();
        assert!(validate_config(&bad_config).is_err());

        // Relative shared dir
        let mut bad_config = config.clone();
        bad_config.general.shared_dir = PathBuf::from("shared");
        assert!(validate_config(&bad_config).is_err());

        // Directory as profile path
        let mut bad_config = config.clone();
        bad_config.general.profile_path = Some(PathBuf::from("/var/lib/vpn-bridge/"));
        assert!(validate_config(&bad_config).is_err());
    }

    #[test]
    fn test_log_level_case_insensitive() {
        let mut config = valid();
        config.general.log_level = "WARN".to_string();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_load_config_full() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[general]
log_level = "trace"
backend = "memory"
shared_dir = "/tmp/vpn-bridge"
profile_path = "/tmp/vpn-bridge/profile.toml"
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.general.log_level, "trace");
        assert_eq!(config.general.backend, BackendKind::Memory);
        assert_eq!(config.general.shared_dir, PathBuf::from("/tmp/vpn-bridge"));
        assert_eq!(
            config.general.profile_path,
            Some(PathBuf::from("/tmp/vpn-bridge/profile.toml"))
        );
    }

    #[test]
    fn test_load_config_empty_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.general.backend, BackendKind::NetworkManager);
        assert!(config.general.profile_path.is_none());
    }

    #[test]
    fn test_load_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(dir.path().join("missing.toml")).is_err());

        let path = dir.path().join("config.toml");
        fs::write(&path, "[general]\nbackend = \"wireguard\"\n").unwrap();
        assert!(load_config(&path).is_err());
    }
}
