//! Persisted local settings
//!
//! Key-value property store keyed by database identity. Read once at
//! startup so a restarting instance can rejoin through the hosts it knew
//! last time instead of always bootstrapping through the locator.

use crate::error::Result;
use crate::types::DatabaseId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Properties remembered for one instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSettings {
    /// Port the ring endpoint was last bound to
    pub ring_port: Option<u16>,
    /// Where the cluster descriptor / locator lives
    pub descriptor_location: Option<String>,
    /// Instance URLs seen the last time this instance ran
    #[serde(default)]
    pub known_hosts: Vec<String>,
}

pub struct LocalSettings {
    path: Option<PathBuf>,
    entries: RwLock<BTreeMap<String, InstanceSettings>>,
}

impl LocalSettings {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Open (or start) a JSON settings file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path: Some(path),
            entries: RwLock::new(entries),
        })
    }

    pub fn get(&self, database: &DatabaseId) -> InstanceSettings {
        self.entries
            .read()
            .get(&database.url())
            .cloned()
            .unwrap_or_default()
    }

    pub fn set(&self, database: &DatabaseId, settings: InstanceSettings) -> Result<()> {
        self.entries.write().insert(database.url(), settings);
        self.save()
    }

    pub fn update(&self, database: &DatabaseId, f: impl FnOnce(&mut InstanceSettings)) -> Result<()> {
        {
            let mut entries = self.entries.write();
            f(entries.entry(database.url()).or_default());
        }
        self.save()
    }

    fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let raw = serde_json::to_string_pretty(&*self.entries.read())?;
        std::fs::write(path, raw)?;
        Ok(())
    }
}
