//! Configuration snapshots.
//!
//! Every configuration PV (the un-prefixed lines of the PV file) is saved as a
//! string next to the data file, `<data file>.config`, and can be loaded back.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::ScanResult;
use crate::pv::DeviceRegistry;

/// Configuration PV values keyed by logical name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigSnapshot(pub BTreeMap<String, String>);

impl ConfigSnapshot {
    /// Read every configuration PV as a string.
    pub async fn capture(registry: &DeviceRegistry) -> ScanResult<Self> {
        let mut values = BTreeMap::new();
        for key in registry.config_keys() {
            values.insert(key.clone(), registry.get_string(key).await?);
        }
        Ok(Self(values))
    }

    /// Write as indented JSON.
    pub fn save(&self, path: &Path) -> ScanResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        info!(path = %path.display(), pvs = self.0.len(), "saved configuration");
        Ok(())
    }

    /// Read a snapshot written by [`save`](Self::save).
    pub fn load(path: &Path) -> ScanResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Write the values back to their PVs.
    ///
    /// Keys that are not configuration PVs of this registry are skipped.
    /// Returns the number of PVs written.
    pub async fn apply(&self, registry: &DeviceRegistry) -> ScanResult<usize> {
        let mut written = 0;
        for (key, value) in &self.0 {
            if !registry.config_keys().contains(key) {
                warn!(%key, "not a configuration PV; skipped");
                continue;
            }
            registry.put(key, value.as_str()).await?;
            written += 1;
        }
        info!(pvs = written, "loaded configuration");
        Ok(written)
    }

    /// Value of one key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

/// `<data file>.config`, replacing the data file's extension.
pub fn config_path_for(data_file: impl AsRef<Path>) -> PathBuf {
    data_file.as_ref().with_extension("config")
}
