//! Replica Set Bookkeeping
//!
//! Tracks where copies of one replicated entity live (the system table, or
//! the data of one table) and which of those copies are up to date.
//! - `all` holds every known replica location with its last update ID
//! - `active` is the subset currently trusted to serve and accept writes
//! - exactly one primary, the first location added unless reassigned
//! - update IDs are issued strictly increasing
//!
//! Pure data structure: callers serialize access (the owning table manager
//! or system table holds it under its own lock).

use crate::types::{CommitResult, DatabaseId, ReplicaTarget};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Serializable form of a replica set, shipped inside metadata snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaManagerState {
    pub replicas: Vec<ReplicaTarget>,
    pub active: Vec<DatabaseId>,
    pub primary: Option<DatabaseId>,
    pub last_update_id: u64,
}

/// Replica set statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationStats {
    pub all_replicas: usize,
    pub active_replicas: usize,
    pub primary: Option<String>,
    pub last_update_id: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ReplicaManager {
    all: BTreeMap<DatabaseId, u64>,
    active: BTreeSet<DatabaseId>,
    primary: Option<DatabaseId>,
    last_update_id: u64,
}

impl ReplicaManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a snapshot, dropping active entries with no location
    pub fn from_state(state: &ReplicaManagerState) -> Self {
        let all: BTreeMap<DatabaseId, u64> = state
            .replicas
            .iter()
            .map(|t| (t.database.clone(), t.update_id))
            .collect();
        let active = state
            .active
            .iter()
            .filter(|db| all.contains_key(*db))
            .cloned()
            .collect();
        let primary = state
            .primary
            .clone()
            .filter(|p| all.contains_key(p))
            .or_else(|| all.keys().next().cloned());
        let last_update_id = all
            .values()
            .copied()
            .max()
            .unwrap_or(0)
            .max(state.last_update_id);

        Self {
            all,
            active,
            primary,
            last_update_id,
        }
    }

    pub fn state(&self) -> ReplicaManagerState {
        ReplicaManagerState {
            replicas: self
                .all
                .iter()
                .map(|(db, id)| ReplicaTarget {
                    database: db.clone(),
                    update_id: *id,
                })
                .collect(),
            active: self.active.iter().cloned().collect(),
            primary: self.primary.clone(),
            last_update_id: self.last_update_id,
        }
    }

    /// Add a freshly created, up-to-date replica. Returns false if it was
    /// already known, in which case nothing changes.
    pub fn add(&mut self, location: DatabaseId) -> bool {
        if self.all.contains_key(&location) {
            return false;
        }
        let current = self.current_update_id();
        self.insert(location, current, true);
        true
    }

    /// Add a replica with explicit state (used when rebuilding)
    pub fn add_with_state(&mut self, location: DatabaseId, update_id: u64, active: bool) {
        self.insert(location, update_id, active);
        self.last_update_id = self.last_update_id.max(update_id);
    }

    fn insert(&mut self, location: DatabaseId, update_id: u64, active: bool) {
        if self.primary.is_none() {
            self.primary = Some(location.clone());
        }
        if active {
            self.active.insert(location.clone());
        } else {
            self.active.remove(&location);
        }
        self.all.insert(location, update_id);
    }

    /// Forget a replica location entirely
    pub fn remove(&mut self, location: &DatabaseId) -> bool {
        if self.all.remove(location).is_none() {
            return false;
        }
        self.active.remove(location);
        if self.primary.as_ref() == Some(location) {
            self.primary = self
                .active
                .iter()
                .next()
                .or_else(|| self.all.keys().next())
                .cloned();
        }
        true
    }

    /// Keep the location but stop trusting it
    pub fn deactivate(&mut self, location: &DatabaseId) -> bool {
        self.active.remove(location)
    }

    pub fn set_primary(&mut self, location: &DatabaseId) -> bool {
        if !self.all.contains_key(location) {
            return false;
        }
        self.primary = Some(location.clone());
        true
    }

    /// Re-admit a replica that reports having applied `update_id`, provided
    /// no active replica is ahead of it.
    pub fn mark_caught_up(&mut self, location: &DatabaseId, update_id: u64) -> bool {
        if !self.all.contains_key(location) || update_id < self.current_update_id() {
            return false;
        }
        self.all.insert(location.clone(), update_id);
        self.active.insert(location.clone());
        true
    }

    /// Fold the outcome of a commit round into the replica set.
    ///
    /// Synchronous rounds stamp every still-active replica with `update_id`.
    /// Asynchronous rounds make the active set exactly the replicas that
    /// committed this round in order. Returns the replicas that dropped out.
    pub fn complete_update(&mut self, results: &[CommitResult], update_id: u64, synchronous: bool) -> Vec<DatabaseId> {
        let before = self.active.clone();

        if synchronous {
            for location in &self.active {
                if let Some(id) = self.all.get_mut(location) {
                    *id = update_id;
                }
            }
        } else {
            let acknowledged: BTreeSet<DatabaseId> = results
                .iter()
                .filter(|r| r.commit && r.is_in_order() && self.all.contains_key(&r.replica))
                .map(|r| r.replica.clone())
                .collect();
            for location in &acknowledged {
                self.all.insert(location.clone(), update_id);
            }
            self.active = acknowledged;
        }

        self.last_update_id = self.last_update_id.max(update_id);
        before.difference(&self.active).cloned().collect()
    }

    /// Next update ID; strictly increasing for the lifetime of this set
    pub fn get_new_update_id(&mut self) -> u64 {
        self.last_update_id += 1;
        self.last_update_id
    }

    /// Highest update ID held by an active replica
    pub fn current_update_id(&self) -> u64 {
        self.active
            .iter()
            .filter_map(|db| self.all.get(db))
            .copied()
            .max()
            .unwrap_or(0)
    }

    pub fn active_targets(&self) -> Vec<ReplicaTarget> {
        self.active
            .iter()
            .map(|db| ReplicaTarget {
                database: db.clone(),
                update_id: self.all.get(db).copied().unwrap_or(0),
            })
            .collect()
    }

    pub fn active_replicas(&self) -> Vec<DatabaseId> {
        self.active.iter().cloned().collect()
    }

    pub fn all_replicas(&self) -> Vec<DatabaseId> {
        self.all.keys().cloned().collect()
    }

    pub fn all_replicas_size(&self) -> usize {
        self.all.len()
    }

    pub fn active_size(&self) -> usize {
        self.active.len()
    }

    pub fn primary(&self) -> Option<&DatabaseId> {
        self.primary.as_ref()
    }

    pub fn contains(&self, location: &DatabaseId) -> bool {
        self.all.contains_key(location)
    }

    pub fn is_active(&self, location: &DatabaseId) -> bool {
        self.active.contains(location)
    }

    pub fn update_id_of(&self, location: &DatabaseId) -> Option<u64> {
        self.all.get(location).copied()
    }

    pub fn get_statistics(&self) -> ReplicationStats {
        ReplicationStats {
            all_replicas: self.all.len(),
            active_replicas: self.active.len(),
            primary: self.primary.as_ref().map(|p| p.to_string()),
            last_update_id: self.last_update_id,
        }
    }
}
