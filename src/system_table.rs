//! System Table
//!
//! Cluster-wide authority for two relations:
//! - TABLES: table name to table manager location, plus where the table's
//!   data replicas and the manager's metadata replicas live
//! - CONNECTIONS: every instance that joined, with liveness
//!
//! Exactly one instance hosts the active system table at a time. Every
//! mutation is persisted locally and pushed to the metadata replicas so a
//! successor can rebuild it.

use crate::distributed_recovery::MetaDataReplicationCoordinator;
use crate::error::{Result, RingDbError};
use crate::metadata_store::MetadataVersion;
use crate::remote::{RemoteResolver, SystemTableRemote};
use crate::types::{ConnectionInfo, DatabaseId, TableInfo, TableManagerRef};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One row of the TABLES relation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableEntrySnapshot {
    pub table: TableInfo,
    pub manager_location: DatabaseId,
    pub replicas: Vec<DatabaseId>,
    pub manager_replicas: Vec<DatabaseId>,
}

/// Replicated form of the system table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemTableSnapshot {
    pub host: DatabaseId,
    pub tables: Vec<TableEntrySnapshot>,
    pub connections: Vec<ConnectionInfo>,
    pub table_set_counter: i64,
    /// Instances holding a copy of this state, host included
    pub replica_locations: Vec<DatabaseId>,
    #[serde(default)]
    pub version: MetadataVersion,
}

#[derive(Debug, Clone)]
struct TableEntry {
    manager_location: DatabaseId,
    replicas: BTreeSet<DatabaseId>,
    manager_replicas: BTreeSet<DatabaseId>,
}

#[derive(Debug, Default)]
struct SystemTableState {
    tables: BTreeMap<TableInfo, TableEntry>,
    connections: BTreeMap<DatabaseId, ConnectionInfo>,
    table_set_counter: i64,
    version: MetadataVersion,
}

/// System table statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemTableStats {
    pub tables: usize,
    pub connections: usize,
    pub active_connections: usize,
    pub table_set_counter: i64,
}

pub struct SystemTable {
    host: DatabaseId,
    state: Mutex<SystemTableState>,
    resolver: RemoteResolver,
    coordinator: Arc<MetaDataReplicationCoordinator>,
    shut_down: AtomicBool,
}

impl SystemTable {
    /// Fresh system table; the host is its first connection
    pub fn new(host: DatabaseId, resolver: RemoteResolver, coordinator: Arc<MetaDataReplicationCoordinator>) -> Self {
        let mut state = SystemTableState {
            version: coordinator
                .store()
                .system_table()
                .map(|held| held.version.next_epoch())
                .unwrap_or_default(),
            ..SystemTableState::default()
        };
        state
            .connections
            .insert(host.clone(), ConnectionInfo::new(host.clone()));
        Self {
            host,
            state: Mutex::new(state),
            resolver,
            coordinator,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Rebuild from a replicated copy, now hosted at `host`
    pub fn from_snapshot(
        snapshot: SystemTableSnapshot,
        host: DatabaseId,
        resolver: RemoteResolver,
        coordinator: Arc<MetaDataReplicationCoordinator>,
    ) -> Self {
        let tables = snapshot
            .tables
            .into_iter()
            .map(|row| {
                (
                    row.table,
                    TableEntry {
                        manager_location: row.manager_location,
                        replicas: row.replicas.into_iter().collect(),
                        manager_replicas: row.manager_replicas.into_iter().collect(),
                    },
                )
            })
            .collect();
        let mut connections: BTreeMap<DatabaseId, ConnectionInfo> = snapshot
            .connections
            .into_iter()
            .map(|c| (c.database.clone(), c))
            .collect();
        connections.insert(host.clone(), ConnectionInfo::new(host.clone()));
        let version = coordinator
            .store()
            .system_table()
            .map_or(snapshot.version, |held| held.version.max(snapshot.version))
            .next_epoch();

        Self {
            host,
            state: Mutex::new(SystemTableState {
                tables,
                connections,
                table_set_counter: snapshot.table_set_counter,
                version,
            }),
            resolver,
            coordinator,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn host(&self) -> &DatabaseId {
        &self.host
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Current state under a fresh version
    pub fn snapshot_now(&self) -> SystemTableSnapshot {
        let mut state = self.state.lock();
        let version = state.version.bump();
        SystemTableSnapshot {
            host: self.host.clone(),
            tables: state
                .tables
                .iter()
                .map(|(table, entry)| TableEntrySnapshot {
                    table: table.clone(),
                    manager_location: entry.manager_location.clone(),
                    replicas: entry.replicas.iter().cloned().collect(),
                    manager_replicas: entry.manager_replicas.iter().cloned().collect(),
                })
                .collect(),
            connections: state.connections.values().cloned().collect(),
            table_set_counter: state.table_set_counter,
            replica_locations: self.coordinator.system_table_replicas(),
            version,
        }
    }

    async fn persist(&self) {
        let snapshot = self.snapshot_now();
        self.coordinator.propagate_system_table(snapshot).await;
    }

    fn check_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(RingDbError::SystemTableUnavailable(format!(
                "system table at {} has been shut down",
                self.host
            )));
        }
        Ok(())
    }

    /// State for a mutation. The shut-down flag is re-read under the lock
    /// so nothing changes once `shutdown` returned.
    fn state_for_update(&self) -> Result<MutexGuard<'_, SystemTableState>> {
        let state = self.state.lock();
        self.check_running()?;
        Ok(state)
    }

    /// Hosts to try when a table manager must be recreated: metadata
    /// holders first, then data replica holders, the old location last.
    fn recreation_candidates(entry: &TableEntry) -> Vec<DatabaseId> {
        let mut candidates: Vec<DatabaseId> = Vec::new();
        for db in entry.manager_replicas.iter().chain(entry.replicas.iter()) {
            if *db != entry.manager_location && !candidates.contains(db) {
                candidates.push(db.clone());
            }
        }
        candidates.push(entry.manager_location.clone());
        candidates
    }

    async fn recreate_manager(
        &self,
        table: TableInfo,
        old_location: DatabaseId,
        candidates: Vec<DatabaseId>,
    ) -> Result<TableManagerRef> {
        for candidate in candidates {
            let instance = self.resolver.instance(&candidate);
            match instance
                .recreate_table_manager(table.clone(), old_location.clone())
                .await
            {
                Ok(Some(manager)) => {
                    {
                        let mut state = self.state_for_update()?;
                        if let Some(entry) = state.tables.get_mut(&table) {
                            entry.manager_location = manager.location.clone();
                            entry.manager_replicas.insert(manager.location.clone());
                        }
                    }
                    tracing::info!(table = %table, from = %old_location, to = %manager.location, "table manager recreated");
                    self.persist().await;
                    return Ok(manager);
                }
                Ok(None) => {
                    tracing::debug!(table = %table, candidate = %candidate, "candidate holds no table manager state");
                }
                Err(e) => {
                    tracing::debug!(table = %table, candidate = %candidate, error = %e, "recreation attempt failed");
                }
            }
        }
        Err(RingDbError::Migration(format!(
            "no live host could recreate the table manager for {}",
            table
        )))
    }

    pub fn get_statistics(&self) -> SystemTableStats {
        let state = self.state.lock();
        SystemTableStats {
            tables: state.tables.len(),
            connections: state.connections.len(),
            active_connections: state.connections.values().filter(|c| c.active).count(),
            table_set_counter: state.table_set_counter,
        }
    }
}

#[async_trait]
impl SystemTableRemote for SystemTable {
    async fn lookup(&self, table: TableInfo) -> Result<Option<TableManagerRef>> {
        self.check_running()?;
        let found = {
            let state = self.state.lock();
            state.tables.get_key_value(&table).map(|(key, entry)| {
                (
                    TableManagerRef::new(key.clone(), entry.manager_location.clone()),
                    Self::recreation_candidates(entry),
                )
            })
        };
        let Some((manager, candidates)) = found else {
            return Ok(None);
        };

        match self.resolver.table_manager(&manager).exists().await {
            Ok(true) => return Ok(Some(manager)),
            Ok(false) => {
                tracing::warn!(table = %table, location = %manager.location, "table manager shut down, recreating");
            }
            Err(e) => {
                tracing::warn!(table = %table, location = %manager.location, error = %e, "table manager unreachable, recreating");
            }
        }

        let recreated = self
            .recreate_manager(manager.table, manager.location, candidates)
            .await?;
        Ok(Some(recreated))
    }

    async fn exists(&self, table: TableInfo) -> Result<bool> {
        self.check_running()?;
        Ok(self.state.lock().tables.contains_key(&table))
    }

    async fn add_table_information(&self, manager: TableManagerRef, replica: DatabaseId) -> Result<bool> {
        self.check_running()?;
        {
            let mut state = self.state_for_update()?;
            if state.tables.contains_key(&manager.table) {
                return Err(RingDbError::TableAlreadyExists(manager.table.full_table_name()));
            }
            state.tables.insert(
                manager.table.clone(),
                TableEntry {
                    manager_location: manager.location.clone(),
                    replicas: BTreeSet::from([replica.clone()]),
                    manager_replicas: BTreeSet::from([manager.location.clone()]),
                },
            );
        }
        tracing::info!(table = %manager.table, manager = %manager.location, replica = %replica, "table registered");
        self.persist().await;
        Ok(true)
    }

    async fn remove_table_information(&self, table: TableInfo) -> Result<bool> {
        self.check_running()?;
        let removed = self.state_for_update()?.tables.remove(&table).is_some();
        if removed {
            tracing::info!(table = %table, "table removed");
            self.persist().await;
        }
        Ok(removed)
    }

    async fn change_table_manager_location(&self, manager: TableManagerRef) -> Result<()> {
        self.check_running()?;
        {
            let mut state = self.state_for_update()?;
            let entry = state
                .tables
                .get_mut(&manager.table)
                .ok_or_else(|| RingDbError::TableNotFound(manager.table.full_table_name()))?;
            entry.manager_location = manager.location.clone();
            entry.manager_replicas.insert(manager.location.clone());
        }
        tracing::info!(table = %manager.table, location = %manager.location, "table manager moved");
        self.persist().await;
        Ok(())
    }

    async fn add_replica_location(&self, table: TableInfo, replica: DatabaseId) -> Result<bool> {
        self.check_running()?;
        let added = {
            let mut state = self.state_for_update()?;
            let entry = state
                .tables
                .get_mut(&table)
                .ok_or_else(|| RingDbError::TableNotFound(table.full_table_name()))?;
            entry.replicas.insert(replica)
        };
        if added {
            self.persist().await;
        }
        Ok(added)
    }

    async fn remove_replica_location(&self, table: TableInfo, replica: DatabaseId) -> Result<bool> {
        self.check_running()?;
        let removed = {
            let mut state = self.state_for_update()?;
            let entry = state
                .tables
                .get_mut(&table)
                .ok_or_else(|| RingDbError::TableNotFound(table.full_table_name()))?;
            entry.replicas.remove(&replica)
        };
        if removed {
            self.persist().await;
        }
        Ok(removed)
    }

    async fn add_table_manager_replica(&self, table: TableInfo, replica: DatabaseId) -> Result<bool> {
        self.check_running()?;
        let added = {
            let mut state = self.state_for_update()?;
            let entry = state
                .tables
                .get_mut(&table)
                .ok_or_else(|| RingDbError::TableNotFound(table.full_table_name()))?;
            entry.manager_replicas.insert(replica)
        };
        if added {
            self.persist().await;
        }
        Ok(added)
    }

    async fn add_connection_information(&self, mut info: ConnectionInfo) -> Result<bool> {
        self.check_running()?;
        info.active = true;
        info.last_seen = Utc::now();
        let database = info.database.clone();
        let fresh = self
            .state_for_update()?
            .connections
            .insert(database.clone(), info)
            .is_none();
        tracing::debug!(instance = %database, fresh, "connection recorded");
        self.persist().await;
        Ok(fresh)
    }

    async fn remove_connection_information(&self, database: DatabaseId) -> Result<bool> {
        self.check_running()?;
        let removed = self.state_for_update()?.connections.remove(&database).is_some();
        if removed {
            self.persist().await;
        }
        Ok(removed)
    }

    async fn get_connection_information(&self) -> Result<Vec<ConnectionInfo>> {
        self.check_running()?;
        Ok(self.state.lock().connections.values().cloned().collect())
    }

    async fn get_table_managers(&self) -> Result<Vec<TableManagerRef>> {
        self.check_running()?;
        Ok(self
            .state
            .lock()
            .tables
            .iter()
            .map(|(table, entry)| TableManagerRef::new(table.clone(), entry.manager_location.clone()))
            .collect())
    }

    /// Probe a reportedly failed instance; mark it inactive only if the probe
    /// fails too. Its table managers are recreated lazily on lookup.
    async fn suspected_machine_failure(&self, database: DatabaseId) -> Result<bool> {
        self.check_running()?;
        let alive = matches!(self.resolver.instance(&database).is_alive().await, Ok(true));

        {
            let mut state = self.state_for_update()?;
            let Some(connection) = state.connections.get_mut(&database) else {
                return Ok(false);
            };
            if alive {
                connection.last_seen = Utc::now();
            } else {
                connection.active = false;
            }
        }

        if alive {
            tracing::debug!(instance = %database, "suspected instance answered probe");
            return Ok(false);
        }
        tracing::warn!(instance = %database, "instance marked inactive");
        self.coordinator.prune_replica(&database);
        self.persist().await;
        Ok(true)
    }

    async fn check_connection(&self) -> Result<bool> {
        self.check_running()?;
        Ok(true)
    }

    /// Answers after shutdown too, so a successor can pull the frozen state
    async fn snapshot(&self) -> Result<SystemTableSnapshot> {
        Ok(self.snapshot_now())
    }

    async fn get_new_table_set_number(&self) -> Result<i64> {
        self.check_running()?;
        let number = {
            let mut state = self.state_for_update()?;
            state.table_set_counter += 1;
            state.table_set_counter
        };
        self.persist().await;
        Ok(number)
    }

    async fn shutdown(&self) -> Result<()> {
        {
            let _state = self.state.lock();
            self.shut_down.store(true, Ordering::SeqCst);
        }
        tracing::info!(host = %self.host, "system table shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LockConfig, ReplicationConfig};
    use crate::distributed_memnet::LocalNetwork;
    use crate::distributed_metrics::CoordinationMetrics;
    use crate::distributed_rpc::{table_manager_service, ServiceRegistry};
    use crate::metadata_store::MetadataStore;
    use crate::remote::TableManagerService;
    use crate::table_manager::{TableManager, TableManagerContext};

    fn db(n: u16) -> DatabaseId {
        DatabaseId::new("host", 9000 + n, "db")
    }

    struct Fixture {
        network: Arc<LocalNetwork>,
        resolver: RemoteResolver,
        coordinator: Arc<MetaDataReplicationCoordinator>,
        metrics: Arc<CoordinationMetrics>,
        store: Arc<MetadataStore>,
    }

    fn fixture() -> Fixture {
        let network = LocalNetwork::new();
        let resolver = RemoteResolver::new(network.clone());
        let store = Arc::new(MetadataStore::in_memory());
        let metrics = Arc::new(CoordinationMetrics::new().unwrap());
        let coordinator = Arc::new(MetaDataReplicationCoordinator::new(
            db(1),
            ReplicationConfig::default(),
            resolver.clone(),
            Arc::clone(&store),
            None,
            Arc::clone(&metrics),
        ));
        Fixture {
            network,
            resolver,
            coordinator,
            metrics,
            store,
        }
    }

    fn system_table(f: &Fixture) -> SystemTable {
        SystemTable::new(db(1), f.resolver.clone(), Arc::clone(&f.coordinator))
    }

    fn host_table_manager(f: &Fixture, table: &TableInfo, at: u16) {
        let manager = TableManager::create(
            table.clone(),
            db(at),
            TableManagerContext {
                coordinator: Arc::clone(&f.coordinator),
                resolver: f.resolver.clone(),
                store: Arc::clone(&f.store),
                metrics: Arc::clone(&f.metrics),
                lock_config: LockConfig::default(),
            },
        );
        let registry = Arc::new(ServiceRegistry::new(db(at).address()));
        registry.bind(
            table_manager_service(table),
            Arc::new(TableManagerService(Arc::new(manager))),
        );
        f.network.register(db(at).address(), registry).unwrap();
    }

    #[tokio::test]
    async fn test_register_and_lookup_live_manager() {
        let f = fixture();
        let st = system_table(&f);
        let table = TableInfo::from_full_name("PUBLIC.T");
        host_table_manager(&f, &table, 2);

        assert_eq!(st.lookup(table.clone()).await.unwrap(), None);
        st.add_table_information(TableManagerRef::new(table.clone(), db(2)), db(2))
            .await
            .unwrap();

        let found = st.lookup(table.clone()).await.unwrap().unwrap();
        assert_eq!(found.location, db(2));
        assert!(st.exists(table.clone()).await.unwrap());

        let again = st
            .add_table_information(TableManagerRef::new(table.clone(), db(3)), db(3))
            .await;
        assert!(matches!(again, Err(RingDbError::TableAlreadyExists(_))));
        assert!(f.store.system_table().is_some());
    }

    #[tokio::test]
    async fn test_lookup_fails_when_manager_cannot_be_recreated() {
        let f = fixture();
        let st = system_table(&f);
        let table = TableInfo::from_full_name("PUBLIC.GONE");
        st.add_table_information(TableManagerRef::new(table.clone(), db(5)), db(5))
            .await
            .unwrap();

        let err = st.lookup(table).await.unwrap_err();
        assert!(matches!(err, RingDbError::Migration(_)));
    }

    #[tokio::test]
    async fn test_replica_and_manager_locations() {
        let f = fixture();
        let st = system_table(&f);
        let table = TableInfo::from_full_name("PUBLIC.T");
        st.add_table_information(TableManagerRef::new(table.clone(), db(1)), db(1))
            .await
            .unwrap();

        assert!(st.add_replica_location(table.clone(), db(2)).await.unwrap());
        assert!(!st.add_replica_location(table.clone(), db(2)).await.unwrap());
        assert!(st.add_table_manager_replica(table.clone(), db(3)).await.unwrap());
        st.change_table_manager_location(TableManagerRef::new(table.clone(), db(3)))
            .await
            .unwrap();

        let snapshot = st.snapshot_now();
        let row = &snapshot.tables[0];
        assert_eq!(row.manager_location, db(3));
        assert_eq!(row.replicas, vec![db(1), db(2)]);
        assert_eq!(row.manager_replicas, vec![db(1), db(3)]);

        let missing = st
            .add_replica_location(TableInfo::from_full_name("PUBLIC.NONE"), db(2))
            .await;
        assert!(matches!(missing, Err(RingDbError::TableNotFound(_))));
        assert!(st.remove_table_information(table).await.unwrap());
        assert_eq!(st.get_statistics().tables, 0);
    }

    #[tokio::test]
    async fn test_suspected_failure_marks_inactive_only_when_dead() {
        let f = fixture();
        let st = system_table(&f);
        st.add_connection_information(ConnectionInfo::new(db(2)))
            .await
            .unwrap();

        assert!(st.suspected_machine_failure(db(2)).await.unwrap());
        let connections = st.get_connection_information().await.unwrap();
        let suspect = connections.iter().find(|c| c.database == db(2)).unwrap();
        assert!(!suspect.active);
        assert_eq!(st.get_statistics().active_connections, 1);

        // Unknown instances are ignored
        assert!(!st.suspected_machine_failure(db(7)).await.unwrap());
    }

    #[tokio::test]
    async fn test_snapshot_rebuild_and_shutdown() {
        let f = fixture();
        let st = system_table(&f);
        let table = TableInfo::from_full_name("SALES.ORDERS");
        st.add_table_information(TableManagerRef::new(table.clone(), db(1)), db(1))
            .await
            .unwrap();
        assert_eq!(st.get_new_table_set_number().await.unwrap(), 1);
        assert_eq!(st.get_new_table_set_number().await.unwrap(), 2);

        let rebuilt = SystemTable::from_snapshot(st.snapshot_now(), db(2), f.resolver.clone(), Arc::clone(&f.coordinator));
        assert!(rebuilt.exists(table.clone()).await.unwrap());
        assert_eq!(rebuilt.get_new_table_set_number().await.unwrap(), 3);
        assert_eq!(rebuilt.get_connection_information().await.unwrap().len(), 2);

        st.shutdown().await.unwrap();
        assert!(matches!(
            st.check_connection().await,
            Err(RingDbError::SystemTableUnavailable(_))
        ));
        assert!(st.lookup(table).await.unwrap_err().is_unavailable());
    }

    #[tokio::test]
    async fn test_shutdown_freezes_state_for_successor() {
        let f = fixture();
        let st = system_table(&f);
        let table = TableInfo::from_full_name("PUBLIC.T");
        st.add_table_information(TableManagerRef::new(table.clone(), db(1)), db(1))
            .await
            .unwrap();

        st.shutdown().await.unwrap();
        let late = st
            .add_connection_information(ConnectionInfo::new(db(4)))
            .await;
        assert!(late.unwrap_err().is_unavailable());
        assert!(st.get_new_table_set_number().await.is_err());

        let frozen = st.snapshot().await.unwrap();
        assert_eq!(frozen.tables.len(), 1);
        assert!(!frozen.connections.iter().any(|c| c.database == db(4)));
        assert_eq!(frozen.table_set_counter, 0);
    }

    #[tokio::test]
    async fn test_snapshot_versions_order_across_hosts() {
        let f = fixture();
        let st = system_table(&f);
        let first = st.snapshot_now();
        let second = st.snapshot_now();
        assert!(second.version > first.version);
        assert_eq!(second.version.epoch, first.version.epoch);

        let rebuilt = SystemTable::from_snapshot(second.clone(), db(2), f.resolver.clone(), Arc::clone(&f.coordinator));
        let after = rebuilt.snapshot_now();
        assert_eq!(after.version.epoch, second.version.epoch + 1);
        assert!(after.version > second.version);
    }
}
