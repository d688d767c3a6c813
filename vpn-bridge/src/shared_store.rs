// Shared storage directory access

//! Group-scoped values shared with the tunnel provider
//!
//! The tunnel provider publishes values such as its traffic counters under
//! `<root>/<group identifier>/<key>`. The bridge reads them back on request;
//! writing is provided for providers and tooling built on this crate.

use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Key under which the provider stores its latest traffic counters
pub const CONNECTION_UPDATE_KEY: &str = "connectionUpdate";

/// Reject names that would escape the shared root
fn validate_component(name: &str, field_name: &str) -> Result<()> {
    if name.is_empty() {
        anyhow::bail!("{} cannot be empty", field_name);
    }
    if name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        anyhow::bail!("{} is not a valid path component: '{}'", field_name, name);
    }
    Ok(())
}

/// Directory tree shared between the bridge and tunnel providers
#[derive(Debug, Clone)]
pub struct SharedStore {
    root: PathBuf,
}

impl SharedStore {
    /// Create a store rooted at `root`. Nothing is touched on disk until a write.
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn value_path(&self, group: &str, key: &str) -> Result<PathBuf> {
        validate_component(group, "Group identifier")?;
        validate_component(key, "Key")?;
        Ok(self.root.join(group).join(key))
    }

    /// Read a value; `None` if it was never written
    pub fn read(&self, group: &str, key: &str) -> Result<Option<String>> {
        let path = self.value_path(group, key)?;
        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    /// Write a value, creating the group directory if needed
    pub fn write(&self, group: &str, key: &str, value: &str) -> Result<()> {
        let path = self.value_path(group, key)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create shared group directory")?;
        }
        fs::write(&path, value).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Latest traffic counters published by the provider of `group`
    pub fn traffic_stats(&self, group: &str) -> Result<Option<String>> {
        self.read(group, CONNECTION_UPDATE_KEY)
    }
}
