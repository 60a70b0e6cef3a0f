//! System Table Reference
//!
//! Each instance's handle on the system table, wherever it runs:
//! - resolves the authoritative location (ring owner of the well-known key,
//!   then that node's recorded location, then a liveness check)
//! - caches table manager locations
//! - hosts the system table when this instance is, or becomes, its host
//! - hosts the table managers placed on this instance
//!
//! Role transitions relative to the system table:
//!
//! ```text
//! NotHosting -> KeyRangeOwner -> ActiveHost   (predecessor failed AND key now ours)
//! ActiveHost -> NotHosting                     (voluntary hand-off on shutdown)
//! ```
//!
//! Ownership is never assumed from a failed liveness probe alone; the ring
//! must also place the well-known key in the local range.

use crate::context::ClusterContext;
use crate::distributed_recovery::MetaDataReplicationCoordinator;
use crate::distributed_ring::{NodeRef, OverlayNode};
use crate::distributed_rpc::{table_manager_service, ServiceRegistry, SYSTEM_TABLE_SERVICE};
use crate::error::{Result, RingDbError, StartupError};
use crate::locator::LocatorService;
use crate::metadata_store::MetadataStore;
use crate::remote::{RemoteResolver, SystemTableRemote, SystemTableService, TableManagerRemote, TableManagerService};
use crate::system_table::SystemTable;
use crate::table_manager::{TableManager, TableManagerContext};
use crate::types::{DatabaseId, TableInfo, TableManagerRef};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

/// This instance's relation to the system table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemTableRole {
    NotHosting,
    /// Owns the well-known key but does not run the system table
    KeyRangeOwner,
    ActiveHost,
}

/// Reference statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceStats {
    pub role: SystemTableRole,
    pub system_table_location: Option<String>,
    pub cached_tables: usize,
    pub local_table_managers: usize,
    pub pending_suspects: usize,
}

pub struct SystemTableReference {
    ctx: ClusterContext,
    local: DatabaseId,
    ring: Arc<OverlayNode>,
    registry: Arc<ServiceRegistry>,
    tm_context: TableManagerContext,
    locator: Option<Arc<dyn LocatorService>>,
    system_table: RwLock<Option<Arc<SystemTable>>>,
    location: RwLock<Option<DatabaseId>>,
    cache: DashMap<TableInfo, TableManagerRef>,
    local_table_managers: DashMap<TableInfo, Arc<TableManager>>,
    /// Former system table hosts whose failure is not yet confirmed as ours to repair
    pending_suspects: Mutex<BTreeSet<DatabaseId>>,
    migration: tokio::sync::Mutex<()>,
}

impl SystemTableReference {
    pub fn new(
        ctx: ClusterContext,
        local: DatabaseId,
        ring: Arc<OverlayNode>,
        registry: Arc<ServiceRegistry>,
        tm_context: TableManagerContext,
        locator: Option<Arc<dyn LocatorService>>,
    ) -> Self {
        Self {
            ctx,
            local,
            ring,
            registry,
            tm_context,
            locator,
            system_table: RwLock::new(None),
            location: RwLock::new(None),
            cache: DashMap::new(),
            local_table_managers: DashMap::new(),
            pending_suspects: Mutex::new(BTreeSet::new()),
            migration: tokio::sync::Mutex::new(()),
        }
    }

    fn resolver(&self) -> &RemoteResolver {
        &self.tm_context.resolver
    }

    fn coordinator(&self) -> &Arc<MetaDataReplicationCoordinator> {
        &self.tm_context.coordinator
    }

    fn store(&self) -> &Arc<MetadataStore> {
        &self.tm_context.store
    }

    pub fn role(&self) -> SystemTableRole {
        if self.is_system_table_local() {
            SystemTableRole::ActiveHost
        } else if self.ring.in_local_key_range(self.ctx.system_table_key()) {
            SystemTableRole::KeyRangeOwner
        } else {
            SystemTableRole::NotHosting
        }
    }

    pub fn is_system_table_local(&self) -> bool {
        self.system_table
            .read()
            .as_ref()
            .map_or(false, |st| !st.is_shut_down())
    }

    /// Whether `node` is the ring member running the system table
    pub fn is_this_system_table_node(&self, node: &NodeRef) -> bool {
        self.location
            .read()
            .as_ref()
            .map_or(false, |location| location.address() == node.address)
    }

    pub fn get_system_table_url(&self) -> Option<DatabaseId> {
        self.location.read().clone()
    }

    pub fn set_system_table_url(&self, location: DatabaseId) {
        let mut location = location;
        location.is_system_table = true;
        let previous = self.location.write().replace(location.clone());
        if previous.as_ref() != Some(&location) {
            tracing::info!(local = %self.local, location = %location, "system table location updated");
        }
    }

    /// The locally hosted system table, if any
    pub fn local_system_table(&self) -> Option<Arc<SystemTable>> {
        self.system_table.read().clone()
    }

    /// Handle on the system table: in-process when hosted here, a proxy otherwise
    pub fn system_table_handle(&self) -> Result<Arc<dyn SystemTableRemote>> {
        if let Some(st) = self.local_system_table().filter(|st| !st.is_shut_down()) {
            return Ok(st);
        }
        match self.get_system_table_url() {
            Some(location) if location != self.local => Ok(self.resolver().system_table(&location)),
            _ => Err(RingDbError::SystemTableUnavailable(
                "system table location unknown".to_string(),
            )),
        }
    }

    /// Run `call` against the system table. If it is unavailable, recover
    /// it through the key-range owner and try once more.
    pub async fn call_system_table<T, F, Fut>(&self, call: F) -> Result<T>
    where
        F: Fn(Arc<dyn SystemTableRemote>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let first = match self.system_table_handle() {
            Ok(st) => call(st).await,
            Err(e) => Err(e),
        };
        match first {
            Err(e) if e.is_unavailable() => {
                tracing::warn!(local = %self.local, error = %e, "system table unavailable");
                self.handle_unreachable_system_table().await?;
                call(self.system_table_handle()?).await
            }
            other => other,
        }
    }

    /// Find the table manager for `table`
    pub async fn lookup(&self, table: &TableInfo, use_cache: bool, cache_only: bool) -> Result<Option<TableManagerRef>> {
        if use_cache {
            if let Some(cached) = self.cache.get(table) {
                return Ok(Some(cached.clone()));
            }
        }
        if cache_only {
            return Ok(None);
        }

        let found = self
            .call_system_table(|st| {
                let table = table.clone();
                async move { st.lookup(table).await }
            })
            .await?;
        match &found {
            Some(manager) => {
                self.cache.insert(table.clone(), manager.clone());
            }
            None => {
                self.cache.remove(table);
            }
        }
        Ok(found)
    }

    pub fn invalidate_cache(&self, table: &TableInfo) {
        self.cache.remove(table);
    }

    /// Start a brand new system table here
    pub async fn create_system_table(&self) -> Result<()> {
        let st = Arc::new(SystemTable::new(
            self.local.clone(),
            self.resolver().clone(),
            Arc::clone(self.coordinator()),
        ));
        self.install_system_table(Arc::clone(&st), Vec::new());
        self.coordinator()
            .propagate_system_table(st.snapshot_now())
            .await;
        tracing::info!(local = %self.local, "system table created");
        Ok(())
    }

    fn install_system_table(&self, st: Arc<SystemTable>, holders: Vec<DatabaseId>) {
        let mut seed = st.snapshot_now();
        seed.replica_locations = holders;
        self.coordinator().start_replicating_system_table(seed);

        self.registry
            .bind(SYSTEM_TABLE_SERVICE, Arc::new(SystemTableService(st.clone())));
        *self.system_table.write() = Some(st);
        self.set_system_table_url(self.local.clone());
        self.pending_suspects.lock().clear();
        self.ctx.metrics().set_system_table_hosted(true);
    }

    /// Resolve the live system table: ring owner of the well-known key, then
    /// the location that node records, then a liveness check. Falls back to
    /// hosts published in the locator.
    pub async fn find_system_table(&self) -> Result<DatabaseId> {
        if self.is_system_table_local() {
            return Ok(self.local.clone());
        }

        match self.ring.lookup(self.ctx.system_table_key()).await {
            Ok(owner) => {
                let recorded = if owner.address == self.local.address() {
                    self.get_system_table_url()
                } else {
                    self.resolver()
                        .instance_at(&owner.address)
                        .get_system_table_location()
                        .await
                        .unwrap_or_else(|e| {
                            tracing::debug!(owner = %owner, error = %e, "key owner did not answer");
                            None
                        })
                };
                if let Some(location) = recorded {
                    if self.confirm_system_table(&location).await {
                        return Ok(location);
                    }
                }
            }
            Err(e) => tracing::debug!(error = %e, "ring lookup for system table failed"),
        }

        if let Some(locator) = &self.locator {
            for url in locator.get_locations().await? {
                let Some(candidate) = DatabaseId::from_url(&url) else {
                    continue;
                };
                if candidate == self.local {
                    continue;
                }
                let recorded = self
                    .resolver()
                    .instance(&candidate)
                    .get_system_table_location()
                    .await
                    .ok()
                    .flatten();
                if let Some(location) = recorded {
                    if self.confirm_system_table(&location).await {
                        return Ok(location);
                    }
                }
            }
        }

        Err(StartupError::SystemTableNotFound.into())
    }

    async fn confirm_system_table(&self, location: &DatabaseId) -> bool {
        if *location == self.local {
            return self.is_system_table_local();
        }
        if self.system_table_alive(location).await {
            self.set_system_table_url(location.clone());
            return true;
        }
        false
    }

    async fn system_table_alive(&self, location: &DatabaseId) -> bool {
        if *location == self.local {
            return self.is_system_table_local();
        }
        matches!(
            self.resolver().system_table(location).check_connection().await,
            Ok(true)
        )
    }

    /// Become the system table host.
    ///
    /// With `recreate`, state comes from the local metadata copy (the old
    /// host is gone); with `create_tables` a fresh table is started when no
    /// copy exists. Without `recreate`, state is pulled from the live host,
    /// which is then shut down.
    pub async fn migrate_system_table_to_local_instance(&self, create_tables: bool, recreate: bool) -> Result<()> {
        let _guard = self.migration.lock().await;
        if self.is_system_table_local() {
            return Ok(());
        }
        let previous = self.get_system_table_url().filter(|p| *p != self.local);

        let (st, holders) = if recreate {
            match self.store().system_table() {
                Some(snapshot) => {
                    let holders = snapshot
                        .replica_locations
                        .iter()
                        .filter(|h| Some(*h) != previous.as_ref() && **h != self.local)
                        .cloned()
                        .collect();
                    let st = SystemTable::from_snapshot(
                        snapshot,
                        self.local.clone(),
                        self.resolver().clone(),
                        Arc::clone(self.coordinator()),
                    );
                    (st, holders)
                }
                None if create_tables => (
                    SystemTable::new(self.local.clone(), self.resolver().clone(), Arc::clone(self.coordinator())),
                    Vec::new(),
                ),
                None => {
                    return Err(RingDbError::Migration(
                        "no local copy of the system table to recreate from".to_string(),
                    ))
                }
            }
        } else {
            let old = previous.clone().ok_or_else(|| {
                RingDbError::Migration("no live system table to migrate from".to_string())
            })?;
            // Freeze first so nothing the old host acknowledges is missed
            let remote = self.resolver().system_table(&old);
            remote
                .shutdown()
                .await
                .map_err(|e| RingDbError::Migration(format!("could not stop system table at {}: {}", old, e)))?;
            let snapshot = match remote.snapshot().await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!(old = %old, error = %e, "frozen system table did not answer, using local copy");
                    self.store().system_table().ok_or_else(|| {
                        RingDbError::Migration(format!("could not pull system table from {}: {}", old, e))
                    })?
                }
            };
            let holders = snapshot.replica_locations.clone();
            let st = SystemTable::from_snapshot(
                snapshot,
                self.local.clone(),
                self.resolver().clone(),
                Arc::clone(self.coordinator()),
            );
            (st, holders)
        };

        let st = Arc::new(st);
        self.install_system_table(Arc::clone(&st), holders);
        self.ctx.metrics().record_migration("system_table");
        tracing::info!(local = %self.local, from = ?previous, recreate, "system table migrated to this instance");

        if recreate {
            if let Some(old) = &previous {
                if let Err(e) = st.suspected_machine_failure(old.clone()).await {
                    tracing::debug!(old = %old, error = %e, "could not record failed host");
                }
            }
        }
        self.coordinator()
            .propagate_system_table(st.snapshot_now())
            .await;
        self.publish_location(&st).await;
        Ok(())
    }

    /// Tell the locator and every active instance where the system table now runs
    async fn publish_location(&self, st: &SystemTable) {
        if let Some(locator) = &self.locator {
            let urls = self
                .coordinator()
                .system_table_replicas()
                .iter()
                .map(|db| db.url())
                .collect();
            if let Err(e) = locator.set_locations(urls).await {
                tracing::warn!(error = %e, "could not update locator");
            }
        }

        let connections = match st.get_connection_information().await {
            Ok(connections) => connections,
            Err(e) => {
                tracing::warn!(error = %e, "could not read connections");
                return;
            }
        };
        let notices = connections
            .into_iter()
            .filter(|c| c.active && c.database != self.local)
            .map(|c| {
                let instance = self.resolver().instance(&c.database);
                let location = self.local.clone();
                async move { (c.database, instance.set_system_table_location(location).await) }
            });
        for (database, outcome) in futures::future::join_all(notices).await {
            if let Err(e) = outcome {
                tracing::debug!(instance = %database, error = %e, "location notice not delivered");
            }
        }
    }

    /// A ring predecessor changed. If the old one ran the system table it
    /// becomes a suspect; suspects are acted on only once the well-known key
    /// is confirmed to be in the local range.
    pub async fn handle_predecessor_change(&self, old: Option<&NodeRef>, new: Option<&NodeRef>) -> Result<bool> {
        if let Some(old) = old {
            if self.is_this_system_table_node(old) && !self.is_system_table_local() {
                if let Some(location) = self.get_system_table_url() {
                    tracing::info!(local = %self.local, suspect = %location, new = ?new.map(|n| n.to_string()), "system table host left predecessor position");
                    self.pending_suspects.lock().insert(location);
                }
            }
        }
        self.reevaluate_pending_suspects().await
    }

    /// Act on suspects whose failure and key ownership are both confirmed
    pub async fn reevaluate_pending_suspects(&self) -> Result<bool> {
        let suspects: Vec<DatabaseId> = self.pending_suspects.lock().iter().cloned().collect();
        if suspects.is_empty() {
            return Ok(false);
        }
        if self.is_system_table_local() {
            self.pending_suspects.lock().clear();
            return Ok(false);
        }

        for suspect in suspects {
            if self.system_table_alive(&suspect).await {
                self.pending_suspects.lock().remove(&suspect);
                continue;
            }
            if !self.ring.in_local_key_range(self.ctx.system_table_key()) {
                tracing::debug!(suspect = %suspect, "system table key not yet in local range");
                continue;
            }
            self.handle_system_table_failure(&suspect).await?;
            self.pending_suspects.lock().clear();
            return Ok(true);
        }
        Ok(false)
    }

    /// Take over from a failed system table host
    pub async fn handle_system_table_failure(&self, failed: &DatabaseId) -> Result<()> {
        tracing::warn!(local = %self.local, failed = %failed, "system table host failed, recreating locally");
        if self.get_system_table_url().is_none() {
            self.set_system_table_url(failed.clone());
        }
        self.migrate_system_table_to_local_instance(true, true).await
    }

    /// Recover a system table reported unreachable by `failed`'s clients.
    /// Returns true when this instance hosts it afterwards.
    pub async fn recover_system_table(&self, failed: DatabaseId) -> Result<bool> {
        if self.is_system_table_local() {
            return Ok(true);
        }
        let current = self.get_system_table_url().unwrap_or(failed);
        if self.system_table_alive(&current).await {
            return Ok(false);
        }
        if !self.ring.in_local_key_range(self.ctx.system_table_key()) {
            self.pending_suspects.lock().insert(current);
            return Ok(false);
        }
        self.handle_system_table_failure(&current).await?;
        Ok(true)
    }

    /// A call hit an unreachable system table: ask the owner of the
    /// well-known key to recover it, then locate it again.
    pub async fn handle_unreachable_system_table(&self) -> Result<()> {
        let failed = self
            .get_system_table_url()
            .unwrap_or_else(|| self.local.clone());
        if failed != self.local && self.system_table_alive(&failed).await {
            return Ok(());
        }

        let owner = self.ring.lookup(self.ctx.system_table_key()).await?;
        let recovered = if owner.address == self.local.address() {
            self.recover_system_table(failed.clone()).await?
        } else {
            match self
                .resolver()
                .instance_at(&owner.address)
                .recover_system_table(failed.clone())
                .await
            {
                Ok(recovered) => recovered,
                Err(e) => {
                    tracing::warn!(owner = %owner, error = %e, "key owner could not recover system table");
                    false
                }
            }
        };

        match self.find_system_table().await {
            Ok(_) => Ok(()),
            Err(_) => Err(RingDbError::SystemTableUnavailable(format!(
                "system table at {} is unreachable (recovery {})",
                failed,
                if recovered { "started" } else { "pending" }
            ))),
        }
    }

    // -----------------------------------------------------------------------
    // Table managers hosted here
    // -----------------------------------------------------------------------

    pub fn table_manager_context(&self) -> &TableManagerContext {
        &self.tm_context
    }

    pub fn local_table_manager(&self, table: &TableInfo) -> Option<Arc<TableManager>> {
        self.local_table_managers
            .get(table)
            .map(|tm| Arc::clone(tm.value()))
    }

    pub fn local_table_managers(&self) -> Vec<TableInfo> {
        self.local_table_managers
            .iter()
            .map(|e| e.key().clone())
            .collect()
    }

    /// Bind a table manager on this instance and start replicating its state
    pub fn register_local_table_manager(&self, manager: Arc<TableManager>, holders: Vec<DatabaseId>) -> TableManagerRef {
        let manager_ref = manager.manager_ref();
        self.coordinator()
            .start_replicating_table_manager(manager.snapshot_now(), holders);
        self.registry.bind(
            table_manager_service(manager.table()),
            Arc::new(TableManagerService(manager.clone())),
        );
        self.local_table_managers
            .insert(manager.table().clone(), manager);
        self.cache
            .insert(manager_ref.table.clone(), manager_ref.clone());
        manager_ref
    }

    pub fn unregister_local_table_manager(&self, table: &TableInfo) -> Option<Arc<TableManager>> {
        let (_, manager) = self.local_table_managers.remove(table)?;
        self.registry.unbind(&table_manager_service(table));
        self.coordinator().stop_replicating_table_manager(table);
        self.cache.remove(table);
        Some(manager)
    }

    /// Host the manager of a new table whose first replica is local
    pub fn create_table_manager(&self, table: TableInfo) -> TableManagerRef {
        let manager = Arc::new(TableManager::create(
            table,
            self.local.clone(),
            self.tm_context.clone(),
        ));
        self.register_local_table_manager(manager, Vec::new())
    }

    /// Rebuild a table manager here from local metadata after its host failed
    pub async fn recreate_table_manager(&self, table: TableInfo, old_location: DatabaseId) -> Result<Option<TableManagerRef>> {
        if let Some(existing) = self.local_table_manager(&table) {
            if !existing.is_shut_down() {
                return Ok(Some(existing.manager_ref()));
            }
            self.unregister_local_table_manager(&table);
        }
        if self.store().table_manager(&table).is_none() {
            return Ok(None);
        }

        let manager = TableManager::from_local_metadata(
            table.clone(),
            &old_location,
            self.local.clone(),
            self.tm_context.clone(),
        )?;
        let manager_ref = self.register_local_table_manager(Arc::new(manager), Vec::new());
        self.ctx.metrics().record_migration("table_manager");
        tracing::info!(table = %table, old = %old_location, "table manager recreated on this instance");
        Ok(Some(manager_ref))
    }

    /// Stop a live table manager, pull its final state and host it here.
    /// Refused while the old manager still has a writer past its lock timeout.
    pub async fn take_over_table_manager(&self, manager: TableManagerRef) -> Result<TableManagerRef> {
        self.resolver()
            .table_manager(&manager)
            .shutdown()
            .await
            .map_err(|e| {
                RingDbError::Migration(format!(
                    "table manager for {} at {} could not be stopped: {}",
                    manager.table, manager.location, e
                ))
            })?;
        let local = Arc::new(
            TableManager::from_live_manager(&manager, self.local.clone(), self.tm_context.clone()).await?,
        );
        let holders = vec![manager.location.clone()];
        let new_ref = self.register_local_table_manager(local, holders);

        self.call_system_table(|st| {
            let new_ref = new_ref.clone();
            async move { st.change_table_manager_location(new_ref).await }
        })
        .await?;

        self.ctx.metrics().record_migration("table_manager");
        tracing::info!(table = %manager.table, from = %manager.location, "table manager taken over");
        Ok(new_ref)
    }

    /// Hand hosted roles to the ring successor and stop serving them
    pub async fn shutdown(&self) {
        let successor = self.ring.get_successor();
        let handoff = (successor.address != self.local.address())
            .then(|| self.resolver().instance_at(&successor.address));

        for table in self.local_table_managers() {
            let Some(manager) = self.local_table_manager(&table) else {
                continue;
            };
            if let Some(successor) = &handoff {
                match successor.take_over_table_manager(manager.manager_ref()).await {
                    Ok(new_ref) => tracing::info!(table = %table, to = %new_ref.location, "table manager handed off"),
                    Err(e) => tracing::warn!(table = %table, error = %e, "table manager hand-off failed"),
                }
            }
            if let Err(e) = manager.shutdown().await {
                tracing::debug!(table = %table, error = %e, "table manager shutdown failed");
            }
            self.unregister_local_table_manager(&table);
        }

        if let Some(st) = self.local_system_table() {
            if !st.is_shut_down() {
                if let Some(successor) = &handoff {
                    match successor.take_over_system_table().await {
                        Ok(true) => tracing::info!(to = %self.ring.get_successor(), "system table handed off"),
                        Ok(false) => tracing::warn!("successor declined system table"),
                        Err(e) => tracing::warn!(error = %e, "system table hand-off failed"),
                    }
                }
                if let Err(e) = st.shutdown().await {
                    tracing::debug!(error = %e, "system table shutdown failed");
                }
            }
            self.registry.unbind(SYSTEM_TABLE_SERVICE);
            *self.system_table.write() = None;
            self.coordinator().stop_replicating_system_table();
            self.ctx.metrics().set_system_table_hosted(false);
        }
    }

    pub fn get_statistics(&self) -> ReferenceStats {
        ReferenceStats {
            role: self.role(),
            system_table_location: self.get_system_table_url().map(|l| l.to_string()),
            cached_tables: self.cache.len(),
            local_table_managers: self.local_table_managers.len(),
            pending_suspects: self.pending_suspects.lock().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LockConfig, ReplicationConfig, RingConfig};
    use crate::distributed_memnet::LocalNetwork;
    use crate::distributed_ring::{OverlayKey, RingService};
    use crate::distributed_rpc::RING_SERVICE;
    use crate::metadata_store::MetadataStore;

    fn db(n: u16) -> DatabaseId {
        DatabaseId::new("host", 9000 + n, "db")
    }

    fn reference(network: &Arc<LocalNetwork>, n: u16) -> Arc<SystemTableReference> {
        reference_with_key(network, n, ClusterContext::new().unwrap().system_table_key())
    }

    fn reference_with_key(network: &Arc<LocalNetwork>, n: u16, key: OverlayKey) -> Arc<SystemTableReference> {
        let ctx = ClusterContext::new().unwrap().with_system_table_key(key);
        let registry = Arc::new(ServiceRegistry::new(db(n).address()));
        let (ring, _events) = OverlayNode::new(
            db(n).address(),
            network.clone(),
            RingConfig::default(),
            Arc::clone(ctx.metrics()),
        );
        registry.bind(RING_SERVICE, Arc::new(RingService::new(Arc::clone(&ring))));
        network.register(db(n).address(), Arc::clone(&registry)).unwrap();

        let resolver = RemoteResolver::new(network.clone());
        let store = Arc::new(MetadataStore::in_memory());
        let coordinator = Arc::new(MetaDataReplicationCoordinator::new(
            db(n),
            ReplicationConfig::default(),
            resolver.clone(),
            Arc::clone(&store),
            None,
            Arc::clone(ctx.metrics()),
        ));
        let tm_context = TableManagerContext {
            coordinator,
            resolver,
            store,
            metrics: Arc::clone(ctx.metrics()),
            lock_config: LockConfig::default(),
        };
        Arc::new(SystemTableReference::new(ctx, db(n), ring, registry, tm_context, None))
    }

    #[tokio::test]
    async fn test_alone_node_creates_and_hosts() {
        let network = LocalNetwork::new();
        let reference = reference(&network, 1);
        assert_eq!(reference.role(), SystemTableRole::KeyRangeOwner);
        assert!(reference.system_table_handle().is_err());

        reference.create_system_table().await.unwrap();
        assert_eq!(reference.role(), SystemTableRole::ActiveHost);
        assert!(reference.is_system_table_local());
        assert_eq!(reference.get_system_table_url(), Some(db(1)));
        assert!(reference.get_system_table_url().unwrap().is_system_table);
        assert!(reference.is_this_system_table_node(&NodeRef::new(db(1).address())));
        assert_eq!(reference.find_system_table().await.unwrap(), db(1));
    }

    #[tokio::test]
    async fn test_lookup_caches_table_managers() {
        let network = LocalNetwork::new();
        let reference = reference(&network, 1);
        reference.create_system_table().await.unwrap();

        let table = TableInfo::from_full_name("PUBLIC.T");
        let manager = reference.create_table_manager(table.clone());
        reference.invalidate_cache(&table);
        assert_eq!(reference.lookup(&table, true, true).await.unwrap(), None);

        reference
            .system_table_handle()
            .unwrap()
            .add_table_information(manager.clone(), db(1))
            .await
            .unwrap();
        assert_eq!(reference.lookup(&table, true, false).await.unwrap(), Some(manager.clone()));
        assert_eq!(reference.lookup(&table, true, true).await.unwrap(), Some(manager));

        let unknown = TableInfo::from_full_name("PUBLIC.NONE");
        assert_eq!(reference.lookup(&unknown, false, false).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_recreate_from_local_copy_requires_copy() {
        let network = LocalNetwork::new();
        let reference = reference(&network, 1);
        let err = reference
            .migrate_system_table_to_local_instance(false, true)
            .await
            .unwrap_err();
        assert!(matches!(err, RingDbError::Migration(_)));

        reference
            .migrate_system_table_to_local_instance(true, true)
            .await
            .unwrap();
        assert!(reference.is_system_table_local());
    }

    #[tokio::test]
    async fn test_failover_requires_failure_and_key_range() {
        let network = LocalNetwork::new();
        // The well-known key sits exactly on a, so a owns it while alive
        let key = OverlayKey::for_address(&db(1).address());
        let a = reference_with_key(&network, 1, key);
        let b = reference_with_key(&network, 2, key);
        a.create_system_table().await.unwrap();
        b.ring.join(&db(1).address()).await.unwrap();
        for _ in 0..4 {
            a.ring.run_maintenance_round().await;
            b.ring.run_maintenance_round().await;
        }
        b.set_system_table_url(db(1));
        assert!(b.system_table_handle().unwrap().check_connection().await.unwrap());
        assert_eq!(b.role(), SystemTableRole::NotHosting);

        // Live host: nothing to recover
        assert!(!b.recover_system_table(db(1)).await.unwrap());
        assert_eq!(b.get_statistics().pending_suspects, 0);

        // Host gone but the key is not yet ours: suspect kept, no takeover
        network.crash(&db(1).address());
        assert!(!b.recover_system_table(db(1)).await.unwrap());
        assert_eq!(b.get_statistics().pending_suspects, 1);
        assert!(!b.is_system_table_local());

        // Once the ring hands b the key range, the suspect is acted on
        b.ring.check_predecessor().await.unwrap();
        assert!(b.ring.in_local_key_range(key));
        assert!(b.reevaluate_pending_suspects().await.unwrap());
        assert_eq!(b.role(), SystemTableRole::ActiveHost);
        assert!(b
            .system_table_handle()
            .unwrap()
            .lookup(TableInfo::from_full_name("PUBLIC.T"))
            .await
            .unwrap()
            .is_none());
    }
}
