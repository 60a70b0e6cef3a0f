//! Table Manager
//!
//! Per-table authority for locking and replica bookkeeping. One instance in
//! the cluster hosts the manager of a given table; the system table records
//! where. The manager's state is replicated as metadata so it can be rebuilt
//! on another host.
//!
//! Lock discipline:
//! - at most one WRITE or CREATE holder at a time
//! - READ holders coexist with each other, never with a writer
//! - the holder identity is (instance, session), so the same session can
//!   re-acquire or upgrade without deadlocking itself
//!
//! Every exclusive grant carries a fresh update ID; releasing the lock folds
//! the commit round's replica outcomes into the replica set.
//!
//! Shutdown drains first: no new grants, the current writer may still
//! release, and only then does the manager stop. A successor that pulls the
//! state afterwards sees every completed round.

use crate::config::LockConfig;
use crate::distributed_metrics::CoordinationMetrics;
use crate::distributed_recovery::MetaDataReplicationCoordinator;
use crate::error::{Result, RingDbError};
use crate::metadata_store::{MetadataStore, MetadataVersion};
use crate::remote::{RemoteResolver, TableManagerRemote};
use crate::replication::{ReplicaManager, ReplicaManagerState};
use crate::types::{CommitResult, DatabaseId, LockRequest, LockType, TableInfo, TableManagerRef, TableProxy};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Replicated form of a table manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableManagerSnapshot {
    pub table: TableInfo,
    pub location: DatabaseId,
    pub replicas: ReplicaManagerState,
    #[serde(default)]
    pub version: MetadataVersion,
}

/// Shared collaborators every table manager on an instance uses
#[derive(Clone)]
pub struct TableManagerContext {
    pub coordinator: Arc<MetaDataReplicationCoordinator>,
    pub resolver: RemoteResolver,
    pub store: Arc<MetadataStore>,
    pub metrics: Arc<CoordinationMetrics>,
    pub lock_config: LockConfig,
}

struct ExclusiveHolder {
    request: LockRequest,
    lock_type: LockType,
    update_id: Option<u64>,
}

#[derive(Default)]
struct LockTable {
    writer: Option<ExclusiveHolder>,
    readers: HashSet<LockRequest>,
}

impl LockTable {
    fn try_acquire(&mut self, lock_type: LockType, request: &LockRequest) -> bool {
        match lock_type {
            LockType::None => true,
            LockType::Read => match &self.writer {
                Some(holder) if holder.request != *request => false,
                _ => {
                    self.readers.insert(request.clone());
                    true
                }
            },
            LockType::Write | LockType::Create => {
                if let Some(holder) = &mut self.writer {
                    if holder.request == *request {
                        holder.lock_type = holder.lock_type.max(lock_type);
                        return true;
                    }
                    return false;
                }
                // A sole reader may upgrade
                if self.readers.iter().any(|r| r != request) {
                    return false;
                }
                self.writer = Some(ExclusiveHolder {
                    request: request.clone(),
                    lock_type,
                    update_id: None,
                });
                true
            }
        }
    }

    fn release(&mut self, request: &LockRequest) -> bool {
        let mut released = self.readers.remove(request);
        if self.writer.as_ref().map_or(false, |h| h.request == *request) {
            self.writer = None;
            released = true;
        }
        released
    }

    fn holder_update_id(&self, request: &LockRequest) -> Option<u64> {
        self.writer
            .as_ref()
            .filter(|h| h.request == *request)
            .and_then(|h| h.update_id)
    }
}

pub struct TableManager {
    table: TableInfo,
    location: DatabaseId,
    context: TableManagerContext,
    replicas: Mutex<ReplicaManager>,
    version: Mutex<MetadataVersion>,
    locks: Mutex<LockTable>,
    released: Notify,
    draining: AtomicBool,
    shut_down: AtomicBool,
}

impl TableManager {
    fn empty(table: TableInfo, location: DatabaseId, context: TableManagerContext) -> Self {
        // Continue past any copy held here so holders accept the new host
        let version = context
            .store
            .table_manager(&table)
            .map(|held| held.version.next_epoch())
            .unwrap_or_default();
        Self {
            table,
            location,
            context,
            replicas: Mutex::new(ReplicaManager::new()),
            version: Mutex::new(version),
            locks: Mutex::new(LockTable::default()),
            released: Notify::new(),
            draining: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Manager for a newly created table whose first replica is `location`
    pub fn create(table: TableInfo, location: DatabaseId, context: TableManagerContext) -> Self {
        let manager = Self::empty(table, location.clone(), context);
        manager.replicas.lock().add(location);
        manager
    }

    /// Migration: pull all state from a still-reachable manager
    pub async fn from_live_manager(
        old: &TableManagerRef,
        location: DatabaseId,
        context: TableManagerContext,
    ) -> Result<Self> {
        let manager = Self::empty(old.table.clone(), location, context);
        manager.build_table_manager_state(old).await?;
        Ok(manager)
    }

    /// Cold-start recovery from the local metadata copy
    pub fn from_local_metadata(
        table: TableInfo,
        old_primary: &DatabaseId,
        location: DatabaseId,
        context: TableManagerContext,
    ) -> Result<Self> {
        let manager = Self::empty(table, location, context);
        manager.recreate_replica_manager_state(old_primary)?;
        Ok(manager)
    }

    pub fn table(&self) -> &TableInfo {
        &self.table
    }

    pub fn manager_ref(&self) -> TableManagerRef {
        TableManagerRef::new(self.table.clone(), self.location.clone())
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Replace local state with that of the live manager at `old`
    pub async fn build_table_manager_state(&self, old: &TableManagerRef) -> Result<()> {
        let snapshot = self
            .context
            .resolver
            .table_manager(old)
            .snapshot()
            .await
            .map_err(|e| RingDbError::Migration(format!("could not pull state of {}: {}", old.table, e)))?;

        {
            let mut replicas = self.replicas.lock();
            *replicas = ReplicaManager::from_state(&snapshot.replicas);
            let mut version = self.version.lock();
            *version = (*version).max(snapshot.version.next_epoch());
        }
        tracing::info!(
            table = %self.table,
            from = %old.location,
            replicas = snapshot.replicas.replicas.len(),
            "table manager state pulled from previous host"
        );
        Ok(())
    }

    /// Rebuild the replica set from the locally persisted copy. The old
    /// primary is presumed gone with its host and is deactivated.
    pub fn recreate_replica_manager_state(&self, old_primary: &DatabaseId) -> Result<()> {
        let snapshot = self.context.store.table_manager(&self.table).ok_or_else(|| {
            RingDbError::Migration(format!("no persisted table manager state for {}", self.table))
        })?;

        let mut replicas = ReplicaManager::from_state(&snapshot.replicas);
        if *old_primary != self.location {
            replicas.deactivate(old_primary);
        }
        if replicas.is_active(&self.location) {
            replicas.set_primary(&self.location);
        }
        if replicas.active_size() == 0 {
            return Err(RingDbError::Migration(format!(
                "no active replica of {} survives in persisted state",
                self.table
            )));
        }

        tracing::info!(
            table = %self.table,
            old_primary = %old_primary,
            active = replicas.active_size(),
            "table manager recreated from local metadata"
        );
        let mut held = self.replicas.lock();
        *held = replicas;
        let mut version = self.version.lock();
        *version = (*version).max(snapshot.version.next_epoch());
        Ok(())
    }

    /// Current state under a fresh version
    pub fn snapshot_now(&self) -> TableManagerSnapshot {
        let replicas = self.replicas.lock();
        let version = self.version.lock().bump();
        TableManagerSnapshot {
            table: self.table.clone(),
            location: self.location.clone(),
            replicas: replicas.state(),
            version,
        }
    }

    async fn persist(&self) {
        let snapshot = self.snapshot_now();
        self.context.coordinator.propagate_table_manager(snapshot).await;
    }

    fn not_serving(&self) -> RingDbError {
        RingDbError::ServiceNotBound {
            address: self.location.address().to_string(),
            service: format!("table_manager/{}", self.table.full_table_name()),
        }
    }

    fn check_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(self.not_serving());
        }
        Ok(())
    }

    /// Running and not draining towards shutdown
    fn check_granting(&self) -> Result<()> {
        if self.is_shut_down() || self.draining.load(Ordering::SeqCst) {
            return Err(self.not_serving());
        }
        Ok(())
    }

    /// Wait for the exclusive holder to release, bounded by the lock timeout
    async fn wait_for_writer(&self) -> bool {
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.context.lock_config.lock_timeout_ms);
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.locks.lock().writer.is_none() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }

    async fn acquire(&self, lock_type: LockType, request: &LockRequest) -> Result<()> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.context.lock_config.lock_timeout_ms);

        loop {
            // Register interest before checking so a release in between is not missed
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut locks = self.locks.lock();
                self.check_granting()?;
                if locks.try_acquire(lock_type, request) {
                    return Ok(());
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                tracing::warn!(table = %self.table, lock = %lock_type, session = request.session_id, "lock wait timed out");
                return Err(RingDbError::LockTimeout {
                    table: self.table.full_table_name(),
                    lock: lock_type.to_string(),
                });
            }
        }
    }

    pub fn get_statistics(&self) -> TableManagerStats {
        let locks = self.locks.lock();
        let replicas = self.replicas.lock();
        TableManagerStats {
            table: self.table.full_table_name(),
            write_locked: locks.writer.is_some(),
            readers: locks.readers.len(),
            all_replicas: replicas.all_replicas_size(),
            active_replicas: replicas.active_size(),
            current_update_id: replicas.current_update_id(),
        }
    }
}

/// Table manager statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableManagerStats {
    pub table: String,
    pub write_locked: bool,
    pub readers: usize,
    pub all_replicas: usize,
    pub active_replicas: usize,
    pub current_update_id: u64,
}

#[async_trait]
impl TableManagerRemote for TableManager {
    async fn get_table_proxy(&self, lock_type: LockType, request: LockRequest) -> Result<TableProxy> {
        self.acquire(lock_type, &request).await?;

        let proxy = {
            let mut locks = self.locks.lock();
            let mut replicas = self.replicas.lock();
            let expected_update_id = replicas.current_update_id();

            let update_id = match locks.writer.as_mut() {
                Some(holder) if lock_type.is_exclusive() && holder.request == request => {
                    *holder
                        .update_id
                        .get_or_insert_with(|| replicas.get_new_update_id())
                }
                _ => expected_update_id,
            };

            TableProxy {
                manager: TableManagerRef::new(self.table.clone(), self.location.clone()),
                lock_granted: lock_type,
                lock_request: request.clone(),
                replicas: replicas.active_targets(),
                update_id,
                expected_update_id,
            }
        };

        if proxy.replicas.is_empty() && lock_type.is_exclusive() {
            self.locks.lock().release(&request);
            self.released.notify_waiters();
            return Err(RingDbError::TableNotFound(format!(
                "{} has no active replicas",
                self.table
            )));
        }

        tracing::debug!(
            table = %self.table,
            lock = %lock_type,
            session = request.session_id,
            update_id = proxy.update_id,
            replicas = proxy.replicas.len(),
            "lock granted"
        );
        Ok(proxy)
    }

    async fn release_lock_and_update_replica_state(
        &self,
        commit: bool,
        request: LockRequest,
        committed: Vec<CommitResult>,
        is_async: bool,
    ) -> Result<()> {
        self.check_running()?;
        let update_id = self.locks.lock().holder_update_id(&request);

        let evicted = {
            let mut replicas = self.replicas.lock();
            let mut evicted = Vec::new();
            for failed in committed.iter().filter(|r| !r.commit) {
                if replicas.deactivate(&failed.replica) {
                    evicted.push(failed.replica.clone());
                }
            }
            if commit {
                if let Some(update_id) = update_id {
                    evicted.extend(replicas.complete_update(&committed, update_id, !is_async));
                }
            }
            evicted
        };

        for replica in &evicted {
            tracing::warn!(table = %self.table, replica = %replica, "replica dropped from active set");
        }
        self.context.metrics.record_evictions(evicted.len());

        let released = self.locks.lock().release(&request);
        self.released.notify_waiters();
        if !released {
            tracing::debug!(table = %self.table, session = request.session_id, "release without a held lock");
        }

        if commit || !evicted.is_empty() {
            self.persist().await;
        }
        Ok(())
    }

    async fn record_late_replica_update(&self, update_id: u64, results: Vec<CommitResult>) -> Result<()> {
        self.check_running()?;
        {
            let mut replicas = self.replicas.lock();
            for result in &results {
                let caught_up = result.commit
                    && result.is_in_order()
                    && replicas.mark_caught_up(&result.replica, update_id);
                if !caught_up {
                    replicas.deactivate(&result.replica);
                    tracing::warn!(
                        table = %self.table,
                        replica = %result.replica,
                        observed = result.update_id,
                        expected = result.expected_update_id,
                        "late replica left inactive"
                    );
                }
                self.context.metrics.record_straggler(caught_up);
            }
        }
        self.persist().await;
        Ok(())
    }

    async fn add_replica_information(&self, table: TableInfo) -> Result<bool> {
        self.check_running()?;
        let owner = table
            .owner
            .ok_or_else(|| RingDbError::Internal("replica information without an owner".to_string()))?;
        let added = self.replicas.lock().add(owner.clone());
        if added {
            tracing::info!(table = %self.table, replica = %owner, "replica added");
            self.persist().await;
        }
        Ok(added)
    }

    async fn remove_replica_information(&self, table: TableInfo) -> Result<bool> {
        self.check_running()?;
        let owner = table
            .owner
            .ok_or_else(|| RingDbError::Internal("replica information without an owner".to_string()))?;
        let removed = self.replicas.lock().remove(&owner);
        if removed {
            tracing::info!(table = %self.table, replica = %owner, "replica removed");
            self.persist().await;
        }
        Ok(removed)
    }

    async fn get_table_info(&self) -> Result<TableInfo> {
        Ok(self.table.clone())
    }

    async fn get_active_replicas(&self) -> Result<Vec<DatabaseId>> {
        Ok(self.replicas.lock().active_replicas())
    }

    async fn get_all_replicas(&self) -> Result<Vec<DatabaseId>> {
        Ok(self.replicas.lock().all_replicas())
    }

    async fn snapshot(&self) -> Result<TableManagerSnapshot> {
        Ok(self.snapshot_now())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(!self.is_shut_down())
    }

    /// Stop granting, let the current writer finish, then stop. Refused if
    /// the writer holds on past the lock timeout.
    async fn shutdown(&self) -> Result<()> {
        if self.is_shut_down() {
            return Ok(());
        }
        self.draining.store(true, Ordering::SeqCst);
        self.released.notify_waiters();

        if !self.wait_for_writer().await {
            self.draining.store(false, Ordering::SeqCst);
            tracing::warn!(table = %self.table, "shutdown refused, write lock still held");
            return Err(RingDbError::LockTimeout {
                table: self.table.full_table_name(),
                lock: LockType::Write.to_string(),
            });
        }

        {
            let _locks = self.locks.lock();
            self.shut_down.store(true, Ordering::SeqCst);
        }
        self.draining.store(false, Ordering::SeqCst);
        self.released.notify_waiters();
        tracing::info!(table = %self.table, location = %self.location, "table manager shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplicationConfig;
    use crate::distributed_memnet::LocalNetwork;

    fn db(n: u16) -> DatabaseId {
        DatabaseId::new("host", 9000 + n, "db")
    }

    fn session(n: u64) -> LockRequest {
        LockRequest::new(db(1), n)
    }

    fn context(store: Arc<MetadataStore>) -> TableManagerContext {
        let network = LocalNetwork::new();
        let resolver = RemoteResolver::new(network);
        let metrics = Arc::new(CoordinationMetrics::new().unwrap());
        let coordinator = Arc::new(MetaDataReplicationCoordinator::new(
            db(1),
            ReplicationConfig::default(),
            resolver.clone(),
            Arc::clone(&store),
            None,
            Arc::clone(&metrics),
        ));
        TableManagerContext {
            coordinator,
            resolver,
            store,
            metrics,
            lock_config: LockConfig { lock_timeout_ms: 100 },
        }
    }

    fn manager_with_replicas(n: u16) -> TableManager {
        let tm = TableManager::create(
            TableInfo::from_full_name("PUBLIC.T"),
            db(1),
            context(Arc::new(MetadataStore::in_memory())),
        );
        for i in 2..=n {
            tm.replicas.lock().add(db(i));
        }
        tm
    }

    fn commit_result(n: u16, commit: bool, observed: u64, expected: u64) -> CommitResult {
        CommitResult {
            replica: db(n),
            commit,
            update_id: observed,
            expected_update_id: expected,
            table: Some(TableInfo::from_full_name("PUBLIC.T")),
        }
    }

    #[tokio::test]
    async fn test_write_lock_is_exclusive() {
        let tm = manager_with_replicas(1);
        let proxy = tm.get_table_proxy(LockType::Write, session(1)).await.unwrap();
        assert_eq!(proxy.update_id, 1);
        assert_eq!(proxy.expected_update_id, 0);

        let err = tm.get_table_proxy(LockType::Write, session(2)).await.unwrap_err();
        assert!(matches!(err, RingDbError::LockTimeout { .. }));
        let err = tm.get_table_proxy(LockType::Read, session(2)).await.unwrap_err();
        assert!(matches!(err, RingDbError::LockTimeout { .. }));
    }

    #[tokio::test]
    async fn test_same_session_reacquires() {
        let tm = manager_with_replicas(1);
        let first = tm.get_table_proxy(LockType::Write, session(1)).await.unwrap();
        let again = tm.get_table_proxy(LockType::Create, session(1)).await.unwrap();
        assert_eq!(first.update_id, again.update_id);
        assert!(tm.get_statistics().write_locked);
    }

    #[tokio::test]
    async fn test_readers_share_and_block_writers() {
        let tm = manager_with_replicas(1);
        tm.get_table_proxy(LockType::Read, session(1)).await.unwrap();
        tm.get_table_proxy(LockType::Read, session(2)).await.unwrap();
        assert_eq!(tm.get_statistics().readers, 2);

        assert!(tm.get_table_proxy(LockType::Write, session(3)).await.is_err());

        tm.release_lock_and_update_replica_state(false, session(1), Vec::new(), false)
            .await
            .unwrap();
        tm.release_lock_and_update_replica_state(false, session(2), Vec::new(), false)
            .await
            .unwrap();
        assert!(tm.get_table_proxy(LockType::Write, session(3)).await.is_ok());
    }

    #[tokio::test]
    async fn test_waiting_writer_granted_after_release() {
        let tm = Arc::new(manager_with_replicas(1));
        tm.get_table_proxy(LockType::Write, session(1)).await.unwrap();

        let waiter = {
            let tm = Arc::clone(&tm);
            tokio::spawn(async move { tm.get_table_proxy(LockType::Write, session(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        tm.release_lock_and_update_replica_state(true, session(1), Vec::new(), false)
            .await
            .unwrap();

        let proxy = waiter.await.unwrap().unwrap();
        assert_eq!(proxy.update_id, 2);
        assert_eq!(proxy.expected_update_id, 1);
    }

    #[tokio::test]
    async fn test_failed_replica_deactivated_on_release() {
        let tm = manager_with_replicas(3);
        let proxy = tm.get_table_proxy(LockType::Write, session(1)).await.unwrap();
        assert_eq!(proxy.replicas.len(), 3);

        let results = vec![
            commit_result(1, true, 0, 0),
            commit_result(2, true, 0, 0),
            commit_result(3, false, 0, 0),
        ];
        tm.release_lock_and_update_replica_state(true, session(1), results, false)
            .await
            .unwrap();

        let all = tm.get_all_replicas().await.unwrap();
        let active = tm.get_active_replicas().await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(active, vec![db(1), db(2)]);
        assert_eq!(tm.replicas.lock().update_id_of(&db(1)), Some(1));
    }

    #[tokio::test]
    async fn test_async_round_then_late_catch_up() {
        let tm = manager_with_replicas(2);
        let proxy = tm.get_table_proxy(LockType::Write, session(1)).await.unwrap();

        tm.release_lock_and_update_replica_state(true, session(1), vec![commit_result(1, true, 0, 0)], true)
            .await
            .unwrap();
        assert_eq!(tm.get_active_replicas().await.unwrap(), vec![db(1)]);

        tm.record_late_replica_update(proxy.update_id, vec![commit_result(2, true, 0, 0)])
            .await
            .unwrap();
        assert_eq!(tm.get_active_replicas().await.unwrap(), vec![db(1), db(2)]);
    }

    #[tokio::test]
    async fn test_recreate_from_local_metadata() {
        let store = Arc::new(MetadataStore::in_memory());
        let original = TableManager::create(TableInfo::from_full_name("PUBLIC.T"), db(1), context(Arc::clone(&store)));
        original.replicas.lock().add(db(2));
        store.store_table_manager(original.snapshot_now()).unwrap();

        let recreated = TableManager::from_local_metadata(
            TableInfo::from_full_name("PUBLIC.T"),
            &db(1),
            db(2),
            context(Arc::clone(&store)),
        )
        .unwrap();
        assert_eq!(recreated.get_active_replicas().await.unwrap(), vec![db(2)]);
        assert_eq!(recreated.get_all_replicas().await.unwrap().len(), 2);
        assert_eq!(recreated.replicas.lock().primary(), Some(&db(2)));

        let missing = TableManager::from_local_metadata(
            TableInfo::from_full_name("PUBLIC.OTHER"),
            &db(1),
            db(2),
            context(store),
        );
        assert!(matches!(missing, Err(RingDbError::Migration(_))));
    }

    #[tokio::test]
    async fn test_shut_down_manager_reports_unavailable() {
        let tm = manager_with_replicas(1);
        tm.shutdown().await.unwrap();
        assert!(!tm.exists().await.unwrap());
        let err = tm.get_table_proxy(LockType::Write, session(1)).await.unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_writer_then_stops() {
        let mut ctx = context(Arc::new(MetadataStore::in_memory()));
        ctx.lock_config.lock_timeout_ms = 2_000;
        let tm = Arc::new(TableManager::create(TableInfo::from_full_name("PUBLIC.T"), db(1), ctx));
        tm.replicas.lock().add(db(2));
        let proxy = tm.get_table_proxy(LockType::Write, session(1)).await.unwrap();

        let stopping = {
            let tm = Arc::clone(&tm);
            tokio::spawn(async move { tm.shutdown().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!stopping.is_finished());
        assert!(!tm.is_shut_down());

        // No new grants while draining
        let refused = tm.get_table_proxy(LockType::Write, session(2)).await.unwrap_err();
        assert!(refused.is_unavailable());

        let expected = proxy.expected_update_id;
        let results = vec![
            commit_result(1, true, expected, expected),
            commit_result(2, true, expected, expected),
        ];
        tm.release_lock_and_update_replica_state(true, session(1), results.clone(), false)
            .await
            .unwrap();
        stopping.await.unwrap().unwrap();
        assert!(tm.is_shut_down());

        let snapshot = tm.snapshot_now();
        assert_eq!(snapshot.replicas.last_update_id, proxy.update_id);
        assert_eq!(tm.replicas.lock().update_id_of(&db(2)), Some(proxy.update_id));

        let late = tm
            .release_lock_and_update_replica_state(true, session(1), results, false)
            .await
            .unwrap_err();
        assert!(late.is_unavailable());
        assert!(tm.record_late_replica_update(proxy.update_id, Vec::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_refused_while_writer_holds_on() {
        let tm = manager_with_replicas(1);
        tm.get_table_proxy(LockType::Write, session(1)).await.unwrap();

        let err = tm.shutdown().await.unwrap_err();
        assert!(matches!(err, RingDbError::LockTimeout { .. }));
        assert!(!tm.is_shut_down());

        tm.release_lock_and_update_replica_state(false, session(1), Vec::new(), false)
            .await
            .unwrap();
        assert!(tm.get_table_proxy(LockType::Write, session(2)).await.is_ok());
    }

    #[tokio::test]
    async fn test_rebuilt_manager_moves_to_next_epoch() {
        let store = Arc::new(MetadataStore::in_memory());
        let original = TableManager::create(TableInfo::from_full_name("PUBLIC.T"), db(1), context(Arc::clone(&store)));
        original.replicas.lock().add(db(2));
        let first = original.snapshot_now();
        let second = original.snapshot_now();
        assert!(second.version > first.version);
        store.store_table_manager(second.clone()).unwrap();

        let recreated =
            TableManager::from_local_metadata(TableInfo::from_full_name("PUBLIC.T"), &db(1), db(2), context(store))
                .unwrap();
        let after = recreated.snapshot_now();
        assert_eq!(after.version.epoch, second.version.epoch + 1);
        assert!(after.version > second.version);
    }
}
