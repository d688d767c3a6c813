//! Tunnel profile descriptor storage
//!
//! Holds the single profile set by the last successful `initialize`
//! validation. With a backing path the profile is also written to disk as
//! TOML and restored on the next start.

use crate::error::{Error, Result};
use crate::types::Profile;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Single-slot profile store
#[derive(Debug, Default)]
pub struct ProfileStore {
    path: Option<PathBuf>,
    current: Mutex<Option<Profile>>,
}

impl ProfileStore {
    /// Store kept in memory only
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Store backed by a TOML file; a profile already on disk is restored
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let current = Self::read_file(&path)?;
        if let Some(profile) = &current {
            log::info!(
                "Restored profile {} from {}",
                profile.bundle_identifier,
                path.display()
            );
        }
        Ok(Self {
            path: Some(path),
            current: Mutex::new(current),
        })
    }

    fn read_file(path: &Path) -> Result<Option<Profile>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::ProfileLoad(format!("{}: {}", path.display(), e)))?;
        let profile = toml::from_str(&contents)
            .map_err(|e| Error::ProfileLoad(format!("{}: {}", path.display(), e)))?;
        Ok(Some(profile))
    }

    fn slot(&self) -> MutexGuard<'_, Option<Profile>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current profile, if one was stored
    pub fn load(&self) -> Option<Profile> {
        self.slot().clone()
    }

    /// Replace the stored profile wholesale
    pub fn store(&self, profile: Profile) -> Result<()> {
        if let Some(path) = &self.path {
            let contents =
                toml::to_string(&profile).map_err(|e| Error::ProfileSave(e.to_string()))?;
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)
                    .map_err(|e| Error::ProfileSave(format!("{}: {}", dir.display(), e)))?;
            }
            fs::write(path, contents)
                .map_err(|e| Error::ProfileSave(format!("{}: {}", path.display(), e)))?;
        }
        *self.slot() = Some(profile);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(bundle: &str) -> Profile {
        Profile {
            bundle_identifier: bundle.to_string(),
            group_identifier: "group.example".to_string(),
            display_label: "Example VPN".to_string(),
        }
    }

    #[test]
    fn test_in_memory_starts_empty() {
        let store = ProfileStore::in_memory();
        assert_eq!(store.load(), None);
    }

    #[test]
    fn test_store_overwrites_wholesale() {
        let store = ProfileStore::in_memory();
        store.store(profile("com.example.one")).unwrap();
        store.store(profile("com.example.two")).unwrap();
        assert_eq!(store.load(), Some(profile("com.example.two")));
    }

    #[test]
    fn test_file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("profile.toml");

        let store = ProfileStore::open(&path).unwrap();
        assert_eq!(store.load(), None);
        store.store(profile("com.example.vpn")).unwrap();

        let reopened = ProfileStore::open(&path).unwrap();
        assert_eq!(reopened.load(), Some(profile("com.example.vpn")));
    }

    #[test]
    fn test_corrupt_file_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.toml");
        fs::write(&path, "bundle_identifier = [").unwrap();

        assert!(matches!(
            ProfileStore::open(&path),
            Err(Error::ProfileLoad(_))
        ));
    }

    #[test]
    fn test_unwritable_path_is_save_error() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should go
        let path = dir.path().join("profile.toml");
        fs::create_dir(&path).unwrap();

        let store = ProfileStore {
            path: Some(path),
            current: Mutex::new(None),
        };
        assert!(matches!(
            store.store(profile("com.example.vpn")),
            Err(Error::ProfileSave(_))
        ));
        assert_eq!(store.load(), None);
    }
}
