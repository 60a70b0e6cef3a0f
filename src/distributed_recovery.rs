//! Metadata Replication and Recovery
//!
//! Keeps enough copies of the coordination metadata alive that a failed
//! host's role can be rebuilt elsewhere:
//! - the system table state, replicated from its active host
//! - each table manager's state, replicated from the manager's host
//!
//! Replication runs opportunistically: when ring membership changes, and
//! whenever the facade's maintenance pass asks for it. Which hosts to prefer
//! is up to a `HostRanker`.

use crate::config::ReplicationConfig;
use crate::distributed_metrics::CoordinationMetrics;
use crate::locator::LocatorService;
use crate::metadata_store::{MetadataReplica, MetadataStore};
use crate::remote::RemoteResolver;
use crate::replication::ReplicaManager;
use crate::system_table::SystemTableSnapshot;
use crate::table_manager::TableManagerSnapshot;
use crate::types::{ConnectionInfo, DatabaseId, TableInfo};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What a ranker must respect when proposing hosts
#[derive(Debug, Clone, Default)]
pub struct CandidateConstraints {
    /// Maximum number of hosts to return
    pub count: usize,
    /// Hosts that must not be proposed
    pub exclude: Vec<DatabaseId>,
}

/// Orders candidate hosts for new metadata replicas
pub trait HostRanker: Send + Sync {
    fn get_candidate_hosts(
        &self,
        available: &[ConnectionInfo],
        constraints: &CandidateConstraints,
    ) -> Vec<DatabaseId>;
}

/// Rotates over active connections so replicas spread across the cluster
#[derive(Debug, Default)]
pub struct RoundRobinRanker {
    next: AtomicUsize,
}

impl RoundRobinRanker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HostRanker for RoundRobinRanker {
    fn get_candidate_hosts(
        &self,
        available: &[ConnectionInfo],
        constraints: &CandidateConstraints,
    ) -> Vec<DatabaseId> {
        let eligible: Vec<&DatabaseId> = available
            .iter()
            .filter(|c| c.active && !constraints.exclude.contains(&c.database))
            .map(|c| &c.database)
            .collect();
        if eligible.is_empty() {
            return Vec::new();
        }

        let start = self.next.fetch_add(1, Ordering::Relaxed) % eligible.len();
        eligible
            .iter()
            .cycle()
            .skip(start)
            .take(eligible.len().min(constraints.count))
            .map(|db| (*db).clone())
            .collect()
    }
}

/// A metadata replica that was newly placed on another host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreatedReplica {
    SystemTable(DatabaseId),
    TableManager(TableInfo, DatabaseId),
}

#[derive(Default)]
struct ReplicationState {
    /// Present while this instance hosts the system table
    system_table: Option<ReplicaManager>,
    latest_system_table: Option<SystemTableSnapshot>,
    table_managers: BTreeMap<TableInfo, ReplicaManager>,
    latest_table_managers: BTreeMap<TableInfo, TableManagerSnapshot>,
}

/// Metadata replication statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataReplicationStats {
    pub system_table_replicas: Option<usize>,
    pub table_managers_replicated: usize,
    pub replicas_created: u64,
    pub replica_failures: u64,
}

pub struct MetaDataReplicationCoordinator {
    local: DatabaseId,
    config: ReplicationConfig,
    resolver: RemoteResolver,
    store: Arc<MetadataStore>,
    locator: Option<Arc<dyn LocatorService>>,
    metrics: Arc<CoordinationMetrics>,
    state: Mutex<ReplicationState>,
    replicas_created: AtomicU64,
    replica_failures: AtomicU64,
}

impl MetaDataReplicationCoordinator {
    pub fn new(
        local: DatabaseId,
        config: ReplicationConfig,
        resolver: RemoteResolver,
        store: Arc<MetadataStore>,
        locator: Option<Arc<dyn LocatorService>>,
        metrics: Arc<CoordinationMetrics>,
    ) -> Self {
        Self {
            local,
            config,
            resolver,
            store,
            locator,
            metrics,
            state: Mutex::new(ReplicationState::default()),
            replicas_created: AtomicU64::new(0),
            replica_failures: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    /// Begin replicating the system table this instance now hosts.
    /// Replica holders listed in the snapshot are kept until a push fails.
    pub fn start_replicating_system_table(&self, snapshot: SystemTableSnapshot) {
        let mut replicas = ReplicaManager::new();
        replicas.add(self.local.clone());
        for holder in &snapshot.replica_locations {
            replicas.add(holder.clone());
        }

        if let Err(e) = self.store.store_system_table(snapshot.clone()) {
            tracing::warn!(error = %e, "could not persist system table copy");
        }
        let mut state = self.state.lock();
        state.system_table = Some(replicas);
        state.latest_system_table = Some(snapshot);
        tracing::info!(local = %self.local, "system table replication started");
    }

    pub fn stop_replicating_system_table(&self) {
        let mut state = self.state.lock();
        state.system_table = None;
        state.latest_system_table = None;
    }

    pub fn is_replicating_system_table(&self) -> bool {
        self.state.lock().system_table.is_some()
    }

    /// Begin replicating a table manager hosted here
    pub fn start_replicating_table_manager(&self, snapshot: TableManagerSnapshot, known_holders: Vec<DatabaseId>) {
        let mut replicas = ReplicaManager::new();
        replicas.add(self.local.clone());
        for holder in known_holders {
            replicas.add(holder);
        }

        if let Err(e) = self.store.store_table_manager(snapshot.clone()) {
            tracing::warn!(table = %snapshot.table, error = %e, "could not persist table manager copy");
        }
        let mut state = self.state.lock();
        state.table_managers.insert(snapshot.table.clone(), replicas);
        state.latest_table_managers.insert(snapshot.table.clone(), snapshot);
    }

    pub fn stop_replicating_table_manager(&self, table: &TableInfo) {
        let mut state = self.state.lock();
        state.table_managers.remove(table);
        state.latest_table_managers.remove(table);
    }

    /// Active holders of the system table state, host included
    pub fn system_table_replicas(&self) -> Vec<DatabaseId> {
        self.state
            .lock()
            .system_table
            .as_ref()
            .map(|r| r.active_replicas())
            .unwrap_or_default()
    }

    /// Active holders of a table manager's state, host included
    pub fn get_active_replicas(&self, table: &TableInfo) -> Vec<DatabaseId> {
        self.state
            .lock()
            .table_managers
            .get(table)
            .map(|r| r.active_replicas())
            .unwrap_or_default()
    }

    /// Persist the latest system table state and push it to every active holder
    pub async fn propagate_system_table(&self, snapshot: SystemTableSnapshot) {
        if let Err(e) = self.store.store_system_table(snapshot.clone()) {
            tracing::warn!(error = %e, "could not persist system table copy");
        }

        let targets = {
            let mut state = self.state.lock();
            let Some(replicas) = state.system_table.as_ref() else {
                return;
            };
            let targets = self.remote_holders(replicas);
            if state
                .latest_system_table
                .as_ref()
                .map_or(true, |latest| latest.version <= snapshot.version)
            {
                state.latest_system_table = Some(snapshot.clone());
            }
            targets
        };

        let failed = self
            .push_to(&targets, MetadataReplica::SystemTable(snapshot))
            .await;
        if failed.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        if let Some(replicas) = state.system_table.as_mut() {
            for holder in &failed {
                replicas.deactivate(holder);
            }
        }
    }

    /// Persist the latest state of one table manager and push it to its holders
    pub async fn propagate_table_manager(&self, snapshot: TableManagerSnapshot) {
        if let Err(e) = self.store.store_table_manager(snapshot.clone()) {
            tracing::warn!(table = %snapshot.table, error = %e, "could not persist table manager copy");
        }

        let table = snapshot.table.clone();
        let targets = {
            let mut state = self.state.lock();
            let Some(replicas) = state.table_managers.get(&table) else {
                return;
            };
            let targets = self.remote_holders(replicas);
            if state
                .latest_table_managers
                .get(&table)
                .map_or(true, |latest| latest.version <= snapshot.version)
            {
                state.latest_table_managers.insert(table.clone(), snapshot.clone());
            }
            targets
        };

        let failed = self
            .push_to(&targets, MetadataReplica::TableManager(snapshot))
            .await;
        if failed.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        if let Some(replicas) = state.table_managers.get_mut(&table) {
            for holder in &failed {
                replicas.deactivate(holder);
            }
        }
    }

    fn remote_holders(&self, replicas: &ReplicaManager) -> Vec<DatabaseId> {
        replicas
            .active_replicas()
            .into_iter()
            .filter(|db| *db != self.local)
            .collect()
    }

    /// Push one replica to several holders; returns those that failed
    async fn push_to(&self, targets: &[DatabaseId], replica: MetadataReplica) -> Vec<DatabaseId> {
        let pushes = targets.iter().map(|target| {
            let remote = self.resolver.instance(target);
            let replica = replica.clone();
            async move {
                let outcome = remote.create_metadata_replica(replica).await;
                (target.clone(), outcome)
            }
        });

        let mut failed = Vec::new();
        for (target, outcome) in futures::future::join_all(pushes).await {
            match outcome {
                Ok(true) => {}
                Ok(false) => failed.push(target),
                Err(e) => {
                    tracing::warn!(replica = %target, kind = replica.kind(), error = %e, "metadata push failed");
                    failed.push(target);
                }
            }
        }
        self.replica_failures
            .fetch_add(failed.len() as u64, Ordering::Relaxed);
        failed
    }

    async fn create_replica_with_retry(&self, candidate: &DatabaseId, replica: MetadataReplica) -> bool {
        let remote = self.resolver.instance(candidate);
        let attempts = self.config.replica_creation_attempts.max(1);

        for attempt in 1..=attempts {
            match remote.create_metadata_replica(replica.clone()).await {
                Ok(true) => return true,
                Ok(false) => {
                    tracing::debug!(candidate = %candidate, attempt, "candidate not ready for metadata replica");
                }
                Err(e) => {
                    tracing::debug!(candidate = %candidate, attempt, error = %e, "metadata replica creation failed");
                }
            }
            if attempt < attempts {
                let backoff = self.config.replica_creation_backoff_ms * attempt as u64;
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
        }

        self.replica_failures.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(candidate = %candidate, kind = replica.kind(), attempts, "giving up on metadata replica");
        false
    }

    /// Place any metadata this instance hosts on `candidate` while the
    /// replication factor is unmet. Skips the local machine and inactive hosts.
    pub async fn replicate_metadata_if_possible(&self, candidate: &ConnectionInfo) -> Vec<CreatedReplica> {
        let mut created = Vec::new();
        if candidate.database == self.local || !candidate.active {
            return created;
        }
        let host = &candidate.database;

        let system_table_job = {
            let state = self.state.lock();
            match (&state.system_table, &state.latest_system_table) {
                (Some(replicas), Some(snapshot))
                    if replicas.active_size() < self.config.system_table_replication_factor
                        && !replicas.is_active(host) =>
                {
                    Some(snapshot.clone())
                }
                _ => None,
            }
        };

        if let Some(snapshot) = system_table_job {
            if self
                .create_replica_with_retry(host, MetadataReplica::SystemTable(snapshot))
                .await
            {
                let holders = {
                    let mut state = self.state.lock();
                    match state.system_table.as_mut() {
                        Some(replicas) => {
                            readmit(replicas, host);
                            Some(replicas.active_replicas())
                        }
                        None => None,
                    }
                };
                if let Some(holders) = holders {
                    self.record_created("system_table", host);
                    self.publish_system_table_holders(holders).await;
                    created.push(CreatedReplica::SystemTable(host.clone()));
                }
            }
        }

        let table_jobs: Vec<TableManagerSnapshot> = {
            let state = self.state.lock();
            state
                .table_managers
                .iter()
                .filter(|(_, replicas)| {
                    replicas.active_size() < self.config.table_manager_replication_factor
                        && !replicas.is_active(host)
                })
                .filter_map(|(table, _)| state.latest_table_managers.get(table).cloned())
                .collect()
        };

        for snapshot in table_jobs {
            let table = snapshot.table.clone();
            if !self
                .create_replica_with_retry(host, MetadataReplica::TableManager(snapshot))
                .await
            {
                continue;
            }
            let recorded = {
                let mut state = self.state.lock();
                match state.table_managers.get_mut(&table) {
                    Some(replicas) => {
                        readmit(replicas, host);
                        true
                    }
                    None => false,
                }
            };
            if recorded {
                self.record_created("table_manager", host);
                created.push(CreatedReplica::TableManager(table, host.clone()));
            }
        }

        created
    }

    /// Walk ranked candidates until every hosted entity meets its factor
    pub async fn ensure_replication_factor(
        &self,
        available: &[ConnectionInfo],
        ranker: &dyn HostRanker,
    ) -> Vec<CreatedReplica> {
        let constraints = CandidateConstraints {
            count: available.len(),
            exclude: vec![self.local.clone()],
        };
        let mut created = Vec::new();
        for candidate in ranker.get_candidate_hosts(available, &constraints) {
            if !self.has_unmet_factor() {
                break;
            }
            if let Some(info) = available.iter().find(|c| c.database == candidate) {
                created.extend(self.replicate_metadata_if_possible(info).await);
            }
        }
        created
    }

    fn has_unmet_factor(&self) -> bool {
        let state = self.state.lock();
        let system_table = state
            .system_table
            .as_ref()
            .map_or(false, |r| r.active_size() < self.config.system_table_replication_factor);
        system_table
            || state
                .table_managers
                .values()
                .any(|r| r.active_size() < self.config.table_manager_replication_factor)
    }

    /// Stop trusting a host for every entity it held a copy of
    pub fn prune_replica(&self, host: &DatabaseId) -> usize {
        let mut state = self.state.lock();
        let mut pruned = 0;
        if let Some(replicas) = state.system_table.as_mut() {
            pruned += usize::from(replicas.deactivate(host));
        }
        for replicas in state.table_managers.values_mut() {
            pruned += usize::from(replicas.deactivate(host));
        }
        if pruned > 0 {
            tracing::info!(host = %host, pruned, "unreachable metadata holder pruned");
        }
        pruned
    }

    async fn publish_system_table_holders(&self, holders: Vec<DatabaseId>) {
        let Some(locator) = &self.locator else {
            return;
        };
        let urls = holders.iter().map(|db| db.url()).collect();
        if let Err(e) = locator.set_locations(urls).await {
            tracing::warn!(error = %e, "could not publish system table replicas to locator");
        }
    }

    fn record_created(&self, kind: &str, host: &DatabaseId) {
        self.replicas_created.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_metadata_replica(kind);
        tracing::info!(kind, replica = %host, "metadata replica created");
    }

    pub fn get_statistics(&self) -> MetadataReplicationStats {
        let state = self.state.lock();
        MetadataReplicationStats {
            system_table_replicas: state.system_table.as_ref().map(|r| r.active_size()),
            table_managers_replicated: state.table_managers.len(),
            replicas_created: self.replicas_created.load(Ordering::Relaxed),
            replica_failures: self.replica_failures.load(Ordering::Relaxed),
        }
    }
}

fn readmit(replicas: &mut ReplicaManager, host: &DatabaseId) {
    if !replicas.add(host.clone()) {
        let current = replicas.current_update_id();
        replicas.add_with_state(host.clone(), current, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed_memnet::LocalNetwork;
    use crate::distributed_rpc::{ServiceRegistry, INSTANCE_SERVICE};
    use crate::error::{Result, RingDbError};
    use crate::locator::InMemoryLocator;
    use crate::metadata_store::MetadataVersion;
    use crate::remote::{DatabaseInstanceRemote, InstanceService};
    use crate::replication::ReplicaManagerState;
    use crate::types::{ExecutionAck, TableManagerRef, UpdateStamp};
    use async_trait::async_trait;

    /// Instance that only accepts metadata, after refusing a few times
    struct MetadataSink {
        store: MetadataStore,
        refusals: AtomicUsize,
    }

    #[async_trait]
    impl DatabaseInstanceRemote for MetadataSink {
        async fn get_database_id(&self) -> Result<DatabaseId> {
            Err(RingDbError::Internal("unused".into()))
        }
        async fn is_alive(&self) -> Result<bool> {
            Ok(true)
        }
        async fn execute_update(&self, _: String, _: String, _: Option<UpdateStamp>) -> Result<ExecutionAck> {
            Err(RingDbError::Internal("unused".into()))
        }
        async fn commit_transaction(&self, _: String, _: bool) -> Result<i32> {
            Err(RingDbError::Internal("unused".into()))
        }
        async fn get_system_table_location(&self) -> Result<Option<DatabaseId>> {
            Ok(None)
        }
        async fn set_system_table_location(&self, _: DatabaseId) -> Result<()> {
            Ok(())
        }
        async fn create_metadata_replica(&self, replica: MetadataReplica) -> Result<bool> {
            if self.refusals.load(Ordering::SeqCst) > 0 {
                self.refusals.fetch_sub(1, Ordering::SeqCst);
                return Ok(false);
            }
            self.store.store(replica)?;
            Ok(true)
        }
        async fn recreate_table_manager(&self, _: TableInfo, _: DatabaseId) -> Result<Option<TableManagerRef>> {
            Ok(None)
        }
        async fn take_over_table_manager(&self, _: TableManagerRef) -> Result<TableManagerRef> {
            Err(RingDbError::Internal("unused".into()))
        }
        async fn take_over_system_table(&self) -> Result<bool> {
            Ok(false)
        }
        async fn recover_system_table(&self, _: DatabaseId) -> Result<bool> {
            Ok(false)
        }
    }

    fn db(n: u16) -> DatabaseId {
        DatabaseId::new("host", 9000 + n, "db")
    }

    fn add_sink(network: &Arc<LocalNetwork>, n: u16, refusals: usize) -> Arc<MetadataSink> {
        let sink = Arc::new(MetadataSink {
            store: MetadataStore::in_memory(),
            refusals: AtomicUsize::new(refusals),
        });
        let registry = Arc::new(ServiceRegistry::new(db(n).address()));
        registry.bind(INSTANCE_SERVICE, Arc::new(InstanceService(sink.clone())));
        network.register(db(n).address(), registry).unwrap();
        sink
    }

    fn coordinator(network: &Arc<LocalNetwork>, locator: Option<Arc<dyn LocatorService>>) -> MetaDataReplicationCoordinator {
        MetaDataReplicationCoordinator::new(
            db(1),
            ReplicationConfig {
                replica_creation_backoff_ms: 1,
                ..Default::default()
            },
            RemoteResolver::new(network.clone()),
            Arc::new(MetadataStore::in_memory()),
            locator,
            Arc::new(CoordinationMetrics::new().unwrap()),
        )
    }

    fn st_snapshot() -> SystemTableSnapshot {
        SystemTableSnapshot {
            host: db(1),
            tables: Vec::new(),
            connections: vec![ConnectionInfo::new(db(1))],
            table_set_counter: 0,
            replica_locations: Vec::new(),
            version: MetadataVersion::default(),
        }
    }

    fn tm_snapshot(table: &str) -> TableManagerSnapshot {
        let mut replicas = ReplicaManager::new();
        replicas.add(db(1));
        TableManagerSnapshot {
            table: TableInfo::from_full_name(table),
            location: db(1),
            replicas: replicas.state(),
            version: MetadataVersion::default(),
        }
    }

    #[test]
    fn test_round_robin_excludes_and_rotates() {
        let ranker = RoundRobinRanker::new();
        let mut inactive = ConnectionInfo::new(db(4));
        inactive.active = false;
        let available = vec![
            ConnectionInfo::new(db(1)),
            ConnectionInfo::new(db(2)),
            ConnectionInfo::new(db(3)),
            inactive,
        ];
        let constraints = CandidateConstraints {
            count: 5,
            exclude: vec![db(1)],
        };

        let first = ranker.get_candidate_hosts(&available, &constraints);
        let second = ranker.get_candidate_hosts(&available, &constraints);
        assert_eq!(first, vec![db(2), db(3)]);
        assert_eq!(second, vec![db(3), db(2)]);

        let one = ranker.get_candidate_hosts(&available, &CandidateConstraints { count: 1, exclude: vec![] });
        assert_eq!(one.len(), 1);
    }

    #[tokio::test]
    async fn test_system_table_replica_created_and_published() {
        let network = LocalNetwork::new();
        let sink = add_sink(&network, 2, 2);
        let locator = Arc::new(InMemoryLocator::new());
        let coordinator = coordinator(&network, Some(locator.clone()));
        coordinator.start_replicating_system_table(st_snapshot());

        let created = coordinator
            .replicate_metadata_if_possible(&ConnectionInfo::new(db(2)))
            .await;
        assert_eq!(created, vec![CreatedReplica::SystemTable(db(2))]);
        assert_eq!(coordinator.system_table_replicas(), vec![db(1), db(2)]);
        assert!(sink.store.system_table().is_some());
        assert_eq!(
            locator.get_locations().await.unwrap(),
            vec![db(1).url(), db(2).url()]
        );

        // Factor of two already met
        add_sink(&network, 3, 0);
        let created = coordinator
            .replicate_metadata_if_possible(&ConnectionInfo::new(db(3)))
            .await;
        assert!(created.is_empty());
    }

    #[tokio::test]
    async fn test_skips_local_inactive_and_unreachable() {
        let network = LocalNetwork::new();
        let coordinator = coordinator(&network, None);
        coordinator.start_replicating_table_manager(tm_snapshot("PUBLIC.T"), Vec::new());

        assert!(coordinator
            .replicate_metadata_if_possible(&ConnectionInfo::new(db(1)))
            .await
            .is_empty());

        let mut inactive = ConnectionInfo::new(db(2));
        inactive.active = false;
        add_sink(&network, 2, 0);
        assert!(coordinator.replicate_metadata_if_possible(&inactive).await.is_empty());

        // Unregistered host exhausts its attempts
        assert!(coordinator
            .replicate_metadata_if_possible(&ConnectionInfo::new(db(9)))
            .await
            .is_empty());
        assert_eq!(coordinator.get_statistics().replica_failures, 1);
    }

    #[tokio::test]
    async fn test_table_manager_factor_through_ranker() {
        let network = LocalNetwork::new();
        let sink = add_sink(&network, 2, 0);
        add_sink(&network, 3, 0);
        let coordinator = coordinator(&network, None);
        let table = TableInfo::from_full_name("PUBLIC.T");
        coordinator.start_replicating_table_manager(tm_snapshot("PUBLIC.T"), Vec::new());

        let available = vec![
            ConnectionInfo::new(db(1)),
            ConnectionInfo::new(db(2)),
            ConnectionInfo::new(db(3)),
        ];
        let created = coordinator
            .ensure_replication_factor(&available, &RoundRobinRanker::new())
            .await;
        assert_eq!(created, vec![CreatedReplica::TableManager(table.clone(), db(2))]);
        assert_eq!(coordinator.get_active_replicas(&table), vec![db(1), db(2)]);
        assert!(sink.store.table_manager(&table).is_some());
    }

    #[tokio::test]
    async fn test_failed_push_deactivates_holder() {
        let network = LocalNetwork::new();
        let sink = add_sink(&network, 2, 0);
        let coordinator = coordinator(&network, None);
        let table = TableInfo::from_full_name("PUBLIC.T");
        coordinator.start_replicating_table_manager(tm_snapshot("PUBLIC.T"), vec![db(2)]);

        let mut snapshot = tm_snapshot("PUBLIC.T");
        snapshot.replicas = ReplicaManagerState::default();
        coordinator.propagate_table_manager(snapshot.clone()).await;
        assert_eq!(sink.store.table_manager(&table), Some(snapshot.clone()));

        network.crash(&db(2).address());
        coordinator.propagate_table_manager(snapshot).await;
        assert_eq!(coordinator.get_active_replicas(&table), vec![db(1)]);
        assert!(coordinator.store().table_manager(&table).is_some());
    }

    #[tokio::test]
    async fn test_prune_replica() {
        let network = LocalNetwork::new();
        let coordinator = coordinator(&network, None);
        coordinator.start_replicating_system_table(SystemTableSnapshot {
            replica_locations: vec![db(2)],
            ..st_snapshot()
        });
        coordinator.start_replicating_table_manager(tm_snapshot("PUBLIC.T"), vec![db(2)]);

        assert_eq!(coordinator.prune_replica(&db(2)), 2);
        assert_eq!(coordinator.system_table_replicas(), vec![db(1)]);
        assert_eq!(coordinator.prune_replica(&db(2)), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_pushes_keep_newest_copy() {
        let network = LocalNetwork::new();
        let holder = add_sink(&network, 2, 0);
        let coordinator = coordinator(&network, None);
        let table = TableInfo::from_full_name("PUBLIC.T");
        coordinator.start_replicating_table_manager(tm_snapshot("PUBLIC.T"), vec![db(2)]);

        let mut newer = tm_snapshot("PUBLIC.T");
        let mut replicas = ReplicaManager::from_state(&newer.replicas);
        replicas.add(db(3));
        replicas.get_new_update_id();
        newer.replicas = replicas.state();
        newer.version = MetadataVersion { epoch: 0, sequence: 2 };
        let older = TableManagerSnapshot {
            version: MetadataVersion { epoch: 0, sequence: 1 },
            ..tm_snapshot("PUBLIC.T")
        };

        coordinator.propagate_table_manager(newer.clone()).await;
        coordinator.propagate_table_manager(older).await;

        assert_eq!(holder.store.table_manager(&table).unwrap(), newer);
        assert_eq!(coordinator.store().table_manager(&table).unwrap(), newer);
        // A holder that already has a newer copy is still a healthy holder
        assert_eq!(coordinator.get_active_replicas(&table), vec![db(1), db(2)]);
    }
}
