//! Local copies of replicated metadata
//!
//! Every instance may hold a replica of the system table state and of any
//! number of table manager states. These copies are what a new host rebuilds
//! from when the previous one failed. Copies live in memory and, when a
//! directory is configured, also as JSON files so they survive restarts.

use crate::error::Result;
use crate::system_table::SystemTableSnapshot;
use crate::table_manager::TableManagerSnapshot;
use crate::types::TableInfo;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const SYSTEM_TABLE_FILE: &str = "system_table.json";
const TABLE_MANAGER_PREFIX: &str = "table_manager.";

/// Order of metadata snapshots. The epoch moves on every change of host,
/// the sequence on every snapshot taken by one host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MetadataVersion {
    pub epoch: u64,
    pub sequence: u64,
}

impl MetadataVersion {
    /// First version of a host that rebuilt from `self`
    pub fn next_epoch(&self) -> Self {
        Self {
            epoch: self.epoch + 1,
            sequence: 0,
        }
    }

    pub fn bump(&mut self) -> Self {
        self.sequence += 1;
        *self
    }
}

/// Metadata pushed from a host to a replica holder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MetadataReplica {
    SystemTable(SystemTableSnapshot),
    TableManager(TableManagerSnapshot),
}

impl MetadataReplica {
    pub fn kind(&self) -> &'static str {
        match self {
            MetadataReplica::SystemTable(_) => "system_table",
            MetadataReplica::TableManager(_) => "table_manager",
        }
    }
}

pub struct MetadataStore {
    dir: Option<PathBuf>,
    system_table: RwLock<Option<SystemTableSnapshot>>,
    table_managers: RwLock<BTreeMap<TableInfo, TableManagerSnapshot>>,
}

impl MetadataStore {
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            system_table: RwLock::new(None),
            table_managers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Open a metadata directory, loading whatever copies it already holds
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut system_table = None;
        let mut table_managers = BTreeMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            if name == SYSTEM_TABLE_FILE {
                let raw = std::fs::read_to_string(&path)?;
                system_table = Some(serde_json::from_str(&raw)?);
            } else if name.starts_with(TABLE_MANAGER_PREFIX) && name.ends_with(".json") {
                let raw = std::fs::read_to_string(&path)?;
                let snapshot: TableManagerSnapshot = serde_json::from_str(&raw)?;
                table_managers.insert(snapshot.table.clone(), snapshot);
            }
        }

        tracing::debug!(
            dir = %dir.display(),
            has_system_table = system_table.is_some(),
            table_managers = table_managers.len(),
            "metadata store opened"
        );

        Ok(Self {
            dir: Some(dir),
            system_table: RwLock::new(system_table),
            table_managers: RwLock::new(table_managers),
        })
    }

    /// Keep `replica` unless a newer copy is already held. Returns whether
    /// it was applied.
    pub fn store(&self, replica: MetadataReplica) -> Result<bool> {
        match replica {
            MetadataReplica::SystemTable(snapshot) => self.store_system_table(snapshot),
            MetadataReplica::TableManager(snapshot) => self.store_table_manager(snapshot),
        }
    }

    pub fn store_system_table(&self, snapshot: SystemTableSnapshot) -> Result<bool> {
        let mut held = self.system_table.write();
        if let Some(current) = held.as_ref() {
            if current.version > snapshot.version {
                tracing::debug!(
                    held = ?current.version,
                    offered = ?snapshot.version,
                    "older system table copy ignored"
                );
                return Ok(false);
            }
        }
        if let Some(dir) = &self.dir {
            std::fs::write(dir.join(SYSTEM_TABLE_FILE), serde_json::to_string_pretty(&snapshot)?)?;
        }
        *held = Some(snapshot);
        Ok(true)
    }

    pub fn store_table_manager(&self, snapshot: TableManagerSnapshot) -> Result<bool> {
        let mut held = self.table_managers.write();
        if let Some(current) = held.get(&snapshot.table) {
            if current.version > snapshot.version {
                tracing::debug!(
                    table = %snapshot.table,
                    held = ?current.version,
                    offered = ?snapshot.version,
                    "older table manager copy ignored"
                );
                return Ok(false);
            }
        }
        if let Some(dir) = &self.dir {
            std::fs::write(
                dir.join(table_manager_file(&snapshot.table)),
                serde_json::to_string_pretty(&snapshot)?,
            )?;
        }
        held.insert(snapshot.table.clone(), snapshot);
        Ok(true)
    }

    pub fn system_table(&self) -> Option<SystemTableSnapshot> {
        self.system_table.read().clone()
    }

    pub fn table_manager(&self, table: &TableInfo) -> Option<TableManagerSnapshot> {
        self.table_managers.read().get(table).cloned()
    }

    pub fn table_managers(&self) -> Vec<TableInfo> {
        self.table_managers.read().keys().cloned().collect()
    }

    pub fn remove_table_manager(&self, table: &TableInfo) -> Result<bool> {
        let removed = self.table_managers.write().remove(table).is_some();
        if removed {
            if let Some(dir) = &self.dir {
                let path = dir.join(table_manager_file(table));
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
            }
        }
        Ok(removed)
    }
}

fn table_manager_file(table: &TableInfo) -> String {
    let name: String = table
        .full_table_name()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' { c } else { '_' })
        .collect();
    format!("{}{}.json", TABLE_MANAGER_PREFIX, name)
}
