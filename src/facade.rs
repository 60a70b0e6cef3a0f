//! Database Remote Facade
//!
//! Wires one database instance into the cluster:
//! - binds an RPC endpoint (in-process or TCP), retrying upwards from the base port
//! - creates the ring, or joins it through known hosts with randomized back-off
//! - locates the system table and registers this instance with it
//! - consumes ring membership events from a queue and reacts to them
//! - routes replicated writes through the table manager and the 2PC coordinator
//!
//! Startup faults stop the instance before it half-joins the ring.

use crate::config::InstanceConfig;
use crate::context::ClusterContext;
use crate::distributed_2pc::{CommitOutcome, TwoPhaseCommitCoordinator, TwoPhaseCommitStats};
use crate::distributed_memnet::LocalNetwork;
use crate::distributed_metrics::CoordinationMetrics;
use crate::distributed_p2p::{TcpRpcServer, TcpTransport};
use crate::distributed_recovery::{
    CreatedReplica, HostRanker, MetaDataReplicationCoordinator, MetadataReplicationStats, RoundRobinRanker,
};
use crate::distributed_ring::{NodeRef, OverlayNode, RingEvent, RingService, RingStats};
use crate::distributed_rpc::{RpcTransport, ServiceRegistry, INSTANCE_SERVICE, RING_SERVICE};
use crate::error::{Result, RingDbError, StartupError};
use crate::executor::{MemoryQueryExecutor, QueryExecutor, StatementKind};
use crate::instance::DatabaseInstance;
use crate::locator::LocatorService;
use crate::metadata_store::MetadataStore;
use crate::remote::{InstanceService, RemoteResolver, TableManagerRemote};
use crate::settings::LocalSettings;
use crate::system_table_reference::{ReferenceStats, SystemTableReference};
use crate::table_manager::TableManagerContext;
use crate::types::{ConnectionInfo, DatabaseId, LockRequest, LockType, TableInfo, TableManagerRef};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How this instance reaches its peers
#[derive(Clone)]
pub enum Network {
    /// Peers live in the same process
    InProcess(Arc<LocalNetwork>),
    /// Length-prefixed bincode frames over TCP
    Tcp,
}

/// Collaborators an instance is started with
pub struct InstanceEnvironment {
    pub network: Network,
    pub locator: Option<Arc<dyn LocatorService>>,
    pub executor: Arc<dyn QueryExecutor>,
    pub settings: Arc<LocalSettings>,
    pub ranker: Arc<dyn HostRanker>,
    pub context: ClusterContext,
    /// Hosts to try joining through, ahead of remembered and published ones
    pub known_hosts: Vec<DatabaseId>,
}

impl InstanceEnvironment {
    /// In-process environment with an in-memory engine and settings
    pub fn in_process(network: Arc<LocalNetwork>) -> Result<Self> {
        Ok(Self {
            network: Network::InProcess(network),
            locator: None,
            executor: Arc::new(MemoryQueryExecutor::new()),
            settings: Arc::new(LocalSettings::in_memory()),
            ranker: Arc::new(RoundRobinRanker::new()),
            context: ClusterContext::new()?,
            known_hosts: Vec::new(),
        })
    }

    /// Same defaults, reaching peers over TCP
    pub fn tcp() -> Result<Self> {
        Ok(Self {
            network: Network::Tcp,
            locator: None,
            executor: Arc::new(MemoryQueryExecutor::new()),
            settings: Arc::new(LocalSettings::in_memory()),
            ranker: Arc::new(RoundRobinRanker::new()),
            context: ClusterContext::new()?,
            known_hosts: Vec::new(),
        })
    }

    pub fn with_locator(mut self, locator: Arc<dyn LocatorService>) -> Self {
        self.locator = Some(locator);
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn QueryExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_known_hosts(mut self, hosts: Vec<DatabaseId>) -> Self {
        self.known_hosts = hosts;
        self
    }

    pub fn with_context(mut self, context: ClusterContext) -> Self {
        self.context = context;
        self
    }
}

enum Endpoint {
    InProcess(Arc<LocalNetwork>),
    Tcp(TcpRpcServer),
}

/// Facade statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacadeStats {
    pub database: String,
    pub ring: RingStats,
    pub reference: ReferenceStats,
    pub commit: TwoPhaseCommitStats,
    pub replication: MetadataReplicationStats,
    pub ring_events_handled: u64,
}

pub struct DatabaseRemoteFacade {
    local: DatabaseId,
    config: InstanceConfig,
    context: ClusterContext,
    endpoint: Endpoint,
    registry: Arc<ServiceRegistry>,
    resolver: RemoteResolver,
    ring: Arc<OverlayNode>,
    reference: Arc<SystemTableReference>,
    replication: Arc<MetaDataReplicationCoordinator>,
    instance: Arc<DatabaseInstance>,
    commit: TwoPhaseCommitCoordinator,
    locator: Option<Arc<dyn LocatorService>>,
    settings: Arc<LocalSettings>,
    ranker: Arc<dyn HostRanker>,
    events: Mutex<Option<mpsc::Receiver<RingEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    sessions: AtomicU64,
    events_handled: AtomicU64,
    shut_down: AtomicBool,
}

impl DatabaseRemoteFacade {
    /// Bind, join or create the ring, locate the system table and register
    /// this instance. Any failure on the way is a startup fault.
    pub async fn start(config: InstanceConfig, env: InstanceEnvironment) -> Result<Arc<Self>> {
        config.validate()?;
        let remembered = env.settings.get(&config.database);
        let base_port = remembered.ring_port.unwrap_or(config.database.port);
        let store = Arc::new(match &config.metadata_dir {
            Some(dir) => MetadataStore::open(dir)?,
            None => MetadataStore::in_memory(),
        });

        let (local, registry, endpoint, transport) = Self::bind_endpoint(&config, &env.network, base_port).await?;
        tracing::info!(database = %local, "instance endpoint bound");

        let metrics = Arc::clone(env.context.metrics());
        let (ring, events) = OverlayNode::new(local.address(), Arc::clone(&transport), config.ring.clone(), Arc::clone(&metrics));
        registry.bind(RING_SERVICE, Arc::new(RingService::new(Arc::clone(&ring))));

        let resolver = RemoteResolver::new(transport);
        let replication = Arc::new(MetaDataReplicationCoordinator::new(
            local.clone(),
            config.replication.clone(),
            resolver.clone(),
            Arc::clone(&store),
            env.locator.clone(),
            Arc::clone(&metrics),
        ));
        let tm_context = TableManagerContext {
            coordinator: Arc::clone(&replication),
            resolver: resolver.clone(),
            store: Arc::clone(&store),
            metrics,
            lock_config: config.lock.clone(),
        };
        let reference = Arc::new(SystemTableReference::new(
            env.context.clone(),
            local.clone(),
            Arc::clone(&ring),
            Arc::clone(&registry),
            tm_context,
            env.locator.clone(),
        ));
        let instance = Arc::new(DatabaseInstance::new(
            local.clone(),
            env.executor,
            store,
            Arc::clone(&reference),
            config.commit.prepared_timeout(),
        ));
        registry.bind(INSTANCE_SERVICE, Arc::new(InstanceService(instance.clone())));

        let commit = TwoPhaseCommitCoordinator::new(
            local.clone(),
            instance.clone(),
            resolver.clone(),
            config.commit.clone(),
            env.context.clone(),
        );

        let facade = Arc::new(Self {
            local,
            config,
            context: env.context,
            endpoint,
            registry,
            resolver,
            ring,
            reference,
            replication,
            instance,
            commit,
            locator: env.locator,
            settings: env.settings,
            ranker: env.ranker,
            events: Mutex::new(Some(events)),
            tasks: Mutex::new(Vec::new()),
            sessions: AtomicU64::new(0),
            events_handled: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        });

        if let Err(e) = facade.bootstrap(env.known_hosts, remembered.known_hosts).await {
            tracing::error!(database = %facade.local, error = %e, "startup failed");
            facade.release_endpoint();
            return Err(e);
        }
        if facade.config.run_background_tasks {
            facade.spawn_background_tasks();
        }
        Ok(facade)
    }

    async fn bind_endpoint(
        config: &InstanceConfig,
        network: &Network,
        base_port: u16,
    ) -> Result<(DatabaseId, Arc<ServiceRegistry>, Endpoint, Arc<dyn RpcTransport>)> {
        let attempts = config.startup.max_bind_attempts.max(1);
        for attempt in 0..attempts {
            let port = base_port.saturating_add(attempt as u16);
            let candidate = config.database.with_port(port);
            match network {
                Network::InProcess(net) => {
                    let registry = Arc::new(ServiceRegistry::new(candidate.address()));
                    match net.register(candidate.address(), Arc::clone(&registry)) {
                        Ok(()) => {
                            let transport: Arc<dyn RpcTransport> = net.clone();
                            return Ok((candidate, registry, Endpoint::InProcess(Arc::clone(net)), transport));
                        }
                        Err(e) => tracing::debug!(port, error = %e, "port taken, trying next"),
                    }
                }
                Network::Tcp => {
                    let registry = Arc::new(ServiceRegistry::new(candidate.address()));
                    match TcpRpcServer::bind(&candidate.address(), Arc::clone(&registry), config.rpc.clone()).await {
                        Ok(server) => {
                            // Port 0 resolves to whatever the OS picked
                            let local = config.database.with_port(server.local_address().port);
                            let transport: Arc<dyn RpcTransport> = Arc::new(TcpTransport::new(config.rpc.clone()));
                            return Ok((local, registry, Endpoint::Tcp(server), transport));
                        }
                        Err(e) => tracing::debug!(port, error = %e, "bind failed, trying next port"),
                    }
                }
            }
        }
        Err(StartupError::BindFailed { attempts }.into())
    }

    fn release_endpoint(&self) {
        match &self.endpoint {
            Endpoint::InProcess(net) => net.deregister(&self.local.address()),
            Endpoint::Tcp(server) => server.stop(),
        }
    }

    // -----------------------------------------------------------------------
    // Bootstrap
    // -----------------------------------------------------------------------

    async fn bootstrap(&self, explicit: Vec<DatabaseId>, remembered: Vec<String>) -> Result<()> {
        let mut known = self.gather_known_hosts(explicit, remembered).await?;
        let mut waits = 0;

        let joined = loop {
            if !known.is_empty() {
                match self.join_ring(&known).await {
                    Ok(()) => break true,
                    Err(e) if e.is_transport() => {
                        tracing::warn!(database = %self.local, "no known host answered, starting a new ring");
                        if self.claim_ring_creation().await? {
                            break false;
                        }
                        return Err(e);
                    }
                    Err(e) => return Err(e),
                }
            }

            if self.claim_ring_creation().await? {
                break false;
            }
            // Another instance holds the creation lock; wait for it to publish
            waits += 1;
            if waits > self.config.startup.max_locator_waits {
                return Err(StartupError::NoKnownHosts.into());
            }
            tokio::time::sleep(self.backoff(waits)).await;
            known = self.gather_known_hosts(Vec::new(), Vec::new()).await?;
        };

        if joined {
            self.locate_system_table(&known).await?;
            let info = ConnectionInfo::new(self.local.clone());
            self.reference
                .call_system_table(|st| {
                    let info = info.clone();
                    async move { st.add_connection_information(info).await }
                })
                .await?;
        } else {
            self.create_ring().await?;
        }

        let known_hosts = self.known_host_urls().await;
        let ring_port = self.local.port;
        if let Err(e) = self.settings.update(&self.config.database, |s| {
            s.ring_port = Some(ring_port);
            s.known_hosts = known_hosts;
        }) {
            tracing::warn!(error = %e, "could not save local settings");
        }

        tracing::info!(
            database = %self.local,
            created = !joined,
            system_table = ?self.reference.get_system_table_url().map(|l| l.to_string()),
            "instance started"
        );
        Ok(())
    }

    /// Explicit hosts, then remembered ones, then those the locator publishes
    async fn gather_known_hosts(&self, explicit: Vec<DatabaseId>, remembered: Vec<String>) -> Result<Vec<DatabaseId>> {
        let mut hosts = explicit;
        hosts.extend(remembered.iter().filter_map(|url| DatabaseId::from_url(url)));

        if let Some(locator) = &self.locator {
            match locator.get_locations().await {
                Ok(urls) => hosts.extend(urls.iter().filter_map(|url| DatabaseId::from_url(url))),
                Err(e) if hosts.is_empty() => {
                    return Err(StartupError::LocatorUnreachable(e.to_string()).into());
                }
                Err(e) => tracing::warn!(error = %e, "locator unavailable, using known hosts"),
            }
        }

        let mut unique = Vec::new();
        for host in hosts {
            if host.address() != self.local.address() && !unique.contains(&host) {
                unique.push(host);
            }
        }
        Ok(unique)
    }

    async fn join_ring(&self, known: &[DatabaseId]) -> Result<()> {
        let attempts = self.config.startup.max_join_attempts.max(1);
        let mut only_transport_faults = true;
        for attempt in 1..=attempts {
            for host in known {
                match self.ring.join(&host.address()).await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        only_transport_faults &= e.is_unavailable();
                        tracing::warn!(database = %self.local, host = %host, attempt, error = %e, "join attempt failed");
                    }
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }
        if only_transport_faults {
            Err(RingDbError::transport(
                known.iter().map(|h| h.to_string()).collect::<Vec<_>>().join(","),
                "no known host reachable",
            ))
        } else {
            Err(StartupError::JoinFailed { attempts }.into())
        }
    }

    /// Randomized back-off that grows with the attempt number
    fn backoff(&self, attempt: usize) -> Duration {
        let base = self.config.startup.join_backoff_ms.max(1);
        let jitter = rand::thread_rng().gen_range(0..base);
        Duration::from_millis(base * attempt as u64 + jitter)
    }

    /// Whether this instance may create the ring: always without a locator,
    /// otherwise only while holding the locator's creation lock.
    async fn claim_ring_creation(&self) -> Result<bool> {
        match &self.locator {
            None => Ok(true),
            Some(locator) => locator
                .lock_locators(&self.local)
                .await
                .map_err(|e| StartupError::LocatorUnreachable(e.to_string()).into()),
        }
    }

    async fn create_ring(&self) -> Result<()> {
        self.ring.create();
        self.reference.create_system_table().await?;

        if let Some(locator) = &self.locator {
            locator.set_locations(vec![self.local.url()]).await?;
            if !locator.commit_locators(&self.local).await? {
                tracing::warn!(database = %self.local, "locator creation lock was not held at commit");
            }
        }
        Ok(())
    }

    async fn locate_system_table(&self, known: &[DatabaseId]) -> Result<DatabaseId> {
        let attempts = self.config.startup.max_locator_waits.max(1);
        let mut last = None;
        for attempt in 1..=attempts {
            match self.reference.find_system_table().await {
                Ok(location) => return Ok(location),
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "system table not found through the ring yet");
                    last = Some(e);
                }
            }
            if let Some(location) = self.ask_known_hosts(known).await {
                return Ok(location);
            }
            if attempt < attempts {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }
        Err(last.unwrap_or_else(|| StartupError::SystemTableNotFound.into()))
    }

    /// Ask the hosts we joined through where they last saw the system table
    async fn ask_known_hosts(&self, known: &[DatabaseId]) -> Option<DatabaseId> {
        for host in known {
            let recorded = self
                .resolver
                .instance(host)
                .get_system_table_location()
                .await
                .ok()
                .flatten();
            let Some(location) = recorded else {
                continue;
            };
            let alive = matches!(
                self.resolver.system_table(&location).check_connection().await,
                Ok(true)
            );
            if alive {
                self.reference.set_system_table_url(location.clone());
                return Some(location);
            }
        }
        None
    }

    async fn known_host_urls(&self) -> Vec<String> {
        match self
            .reference
            .call_system_table(|st| async move { st.get_connection_information().await })
            .await
        {
            Ok(connections) => connections
                .into_iter()
                .filter(|c| c.active && c.database != self.local)
                .map(|c| c.database.url())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Background work
    // -----------------------------------------------------------------------

    fn spawn_background_tasks(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        tasks.push(self.ring.start_maintenance());

        if let Some(mut events) = self.events.lock().take() {
            let facade = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    facade.handle_ring_event(event).await;
                }
            }));
        }

        let facade = Arc::clone(self);
        let interval = Duration::from_millis(self.config.replication.check_interval_ms.max(1));
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                facade.replicate_metadata().await;
            }
        }));
    }

    /// Handle every queued ring event; used when background tasks are off
    pub async fn drain_ring_events(&self) -> usize {
        let mut handled = 0;
        loop {
            let event = match self.events.lock().as_mut() {
                Some(events) => events.try_recv().ok(),
                None => None,
            };
            let Some(event) = event else {
                return handled;
            };
            self.handle_ring_event(event).await;
            handled += 1;
        }
    }

    /// React to one membership change. Runs on the event consumer, never on
    /// the stabilization path.
    pub async fn handle_ring_event(&self, event: RingEvent) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        self.events_handled.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(database = %self.local, ?event, "ring event");

        match event {
            RingEvent::PredecessorChanged { old, new } => {
                match self.reference.handle_predecessor_change(old.as_ref(), new.as_ref()).await {
                    Ok(true) => tracing::info!(database = %self.local, "system table recovered after predecessor change"),
                    Ok(false) => {}
                    Err(e) => tracing::warn!(database = %self.local, error = %e, "predecessor change handling failed"),
                }
                if let Some(new) = new {
                    self.replicate_to_node(&new).await;
                }
            }
            RingEvent::SuccessorChanged { new, .. } => {
                if let Err(e) = self.reference.reevaluate_pending_suspects().await {
                    tracing::warn!(database = %self.local, error = %e, "suspect re-evaluation failed");
                }
                self.replicate_to_node(&new).await;
            }
        }
    }

    async fn replicate_to_node(&self, node: &NodeRef) {
        if node.address == self.local.address() {
            return;
        }
        let database = match self.resolver.instance_at(&node.address).get_database_id().await {
            Ok(database) => database,
            Err(e) => {
                tracing::debug!(node = %node, error = %e, "ring neighbour did not identify itself");
                return;
            }
        };
        let created = self
            .replication
            .replicate_metadata_if_possible(&ConnectionInfo::new(database))
            .await;
        self.record_created_replicas(created).await;
    }

    async fn record_created_replicas(&self, created: Vec<CreatedReplica>) {
        for replica in created {
            if let CreatedReplica::TableManager(table, host) = replica {
                let recorded = self
                    .reference
                    .call_system_table(|st| {
                        let (table, host) = (table.clone(), host.clone());
                        async move { st.add_table_manager_replica(table, host).await }
                    })
                    .await;
                if let Err(e) = recorded {
                    tracing::warn!(table = %table, host = %host, error = %e, "table manager replica not recorded");
                }
            }
        }
    }

    /// Bring every locally hosted entity up to its replication factor
    pub async fn replicate_metadata(&self) -> usize {
        if self.shut_down.load(Ordering::SeqCst) {
            return 0;
        }
        if let Err(e) = self.reference.reevaluate_pending_suspects().await {
            tracing::debug!(error = %e, "suspect re-evaluation failed");
        }
        let connections = match self
            .reference
            .call_system_table(|st| async move { st.get_connection_information().await })
            .await
        {
            Ok(connections) => connections,
            Err(e) => {
                tracing::debug!(error = %e, "no connection list for replication");
                return 0;
            }
        };
        let created = self
            .replication
            .ensure_replication_factor(&connections, self.ranker.as_ref())
            .await;
        let count = created.len();
        self.record_created_replicas(created).await;
        count
    }

    /// One explicit pass of everything the background tasks do
    pub async fn run_maintenance(&self) {
        self.ring.run_maintenance_round().await;
        self.drain_ring_events().await;
        self.replicate_metadata().await;
    }

    // -----------------------------------------------------------------------
    // Tables
    // -----------------------------------------------------------------------

    fn next_session(&self) -> u64 {
        self.sessions.fetch_add(1, Ordering::Relaxed)
    }

    fn table_manager_handle(&self, manager: &TableManagerRef) -> Arc<dyn TableManagerRemote> {
        match self.reference.local_table_manager(&manager.table) {
            Some(local) if manager.location == self.local && !local.is_shut_down() => local as Arc<dyn TableManagerRemote>,
            _ => self.resolver.table_manager(manager),
        }
    }

    async fn find_table_manager(&self, table: &TableInfo, use_cache: bool) -> Result<TableManagerRef> {
        self.reference
            .lookup(table, use_cache, false)
            .await?
            .ok_or_else(|| RingDbError::TableNotFound(table.full_table_name()))
    }

    /// Create `table` with this instance as its first replica and table
    /// manager host, then run `ddl` through the commit protocol.
    pub async fn create_table(&self, table: &TableInfo, ddl: &str) -> Result<CommitOutcome> {
        let probe = table.clone();
        if self
            .reference
            .call_system_table(|st| {
                let probe = probe.clone();
                async move { st.exists(probe).await }
            })
            .await?
        {
            return Err(RingDbError::TableAlreadyExists(table.full_table_name()));
        }

        let table_set = self
            .reference
            .call_system_table(|st| async move { st.get_new_table_set_number().await })
            .await?;
        let table = table.with_owner(self.local.clone()).with_table_set(table_set);
        let manager = self.reference.create_table_manager(table.clone());

        let added = self
            .reference
            .call_system_table(|st| {
                let (manager, local) = (manager.clone(), self.local.clone());
                async move { st.add_table_information(manager, local).await }
            })
            .await;
        if let Err(e) = added {
            self.reference.unregister_local_table_manager(&table);
            return Err(e);
        }
        tracing::info!(table = %table, manager = %manager.location, "table created");

        self.execute_update(&table, ddl).await
    }

    /// Run a replicated write against every active replica of `table`
    pub async fn execute_update(&self, table: &TableInfo, sql: &str) -> Result<CommitOutcome> {
        let lock_type = if StatementKind::from_sql(sql).is_ddl() {
            LockType::Create
        } else {
            LockType::Write
        };
        let request = LockRequest::new(self.local.clone(), self.next_session());

        let manager_ref = self.find_table_manager(table, true).await?;
        let mut manager = self.table_manager_handle(&manager_ref);
        let proxy = match manager.get_table_proxy(lock_type, request.clone()).await {
            Ok(proxy) => proxy,
            Err(e) if e.is_unavailable() => {
                // Stale location: ask the system table again, which recreates
                // the manager if its host is gone
                tracing::warn!(table = %table, manager = %manager_ref.location, error = %e, "table manager unavailable");
                self.reference.invalidate_cache(table);
                let manager_ref = self.find_table_manager(table, false).await?;
                manager = self.table_manager_handle(&manager_ref);
                manager.get_table_proxy(lock_type, request).await?
            }
            Err(e) => return Err(e),
        };

        self.commit.execute_update(sql, &proxy, manager).await
    }

    /// Record this instance as holding a replica of `table`
    pub async fn register_replica(&self, table: &TableInfo) -> Result<bool> {
        let manager_ref = self.find_table_manager(table, true).await?;
        let added = self
            .table_manager_handle(&manager_ref)
            .add_replica_information(table.with_owner(self.local.clone()))
            .await?;
        let table = table.clone();
        self.reference
            .call_system_table(|st| {
                let (table, local) = (table.clone(), self.local.clone());
                async move { st.add_replica_location(table, local).await }
            })
            .await?;
        Ok(added)
    }

    pub async fn get_active_replicas(&self, table: &TableInfo) -> Result<Vec<DatabaseId>> {
        let manager_ref = self.find_table_manager(table, true).await?;
        self.table_manager_handle(&manager_ref).get_active_replicas().await
    }

    pub async fn get_all_replicas(&self, table: &TableInfo) -> Result<Vec<DatabaseId>> {
        let manager_ref = self.find_table_manager(table, true).await?;
        self.table_manager_handle(&manager_ref).get_all_replicas().await
    }

    /// Hosts holding a copy of `table`'s manager state, when it is hosted here
    pub fn metadata_replicas(&self, table: &TableInfo) -> Vec<DatabaseId> {
        self.replication.get_active_replicas(table)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn database_id(&self) -> &DatabaseId {
        &self.local
    }

    pub fn ring(&self) -> &Arc<OverlayNode> {
        &self.ring
    }

    pub fn reference(&self) -> &Arc<SystemTableReference> {
        &self.reference
    }

    pub fn instance(&self) -> &Arc<DatabaseInstance> {
        &self.instance
    }

    pub fn commit_coordinator(&self) -> &TwoPhaseCommitCoordinator {
        &self.commit
    }

    pub fn replication(&self) -> &Arc<MetaDataReplicationCoordinator> {
        &self.replication
    }

    pub fn metrics(&self) -> &Arc<CoordinationMetrics> {
        self.context.metrics()
    }

    pub fn is_system_table_local(&self) -> bool {
        self.reference.is_system_table_local()
    }

    pub fn get_system_table_url(&self) -> Option<DatabaseId> {
        self.reference.get_system_table_url()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Hand hosted roles to the ring successor, deregister and stop serving
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        self.reference.shutdown().await;

        // Roles are handed off by now, so this reaches the new host
        if !self.ring.is_alone() {
            let local = self.local.clone();
            if let Err(e) = self
                .reference
                .call_system_table(|st| {
                    let local = local.clone();
                    async move { st.remove_connection_information(local).await }
                })
                .await
            {
                tracing::debug!(error = %e, "could not deregister from the system table");
            }
        }

        for service in self.registry.bound_services() {
            self.registry.unbind(&service);
        }
        self.release_endpoint();
        tracing::info!(database = %self.local, "instance shut down");
    }

    pub fn get_statistics(&self) -> FacadeStats {
        FacadeStats {
            database: self.local.to_string(),
            ring: self.ring.get_statistics(),
            reference: self.reference.get_statistics(),
            commit: self.commit.get_statistics(),
            replication: self.replication.get_statistics(),
            ring_events_handled: self.events_handled.load(Ordering::Relaxed),
        }
    }
}
