//! Shared helpers for in-process cluster tests

#![allow(dead_code)]

use ringdb_core::*;
use std::collections::HashSet;
use std::sync::Arc;

pub fn database(n: u16) -> DatabaseId {
    DatabaseId::new("node", 9000 + n * 10, "db")
}

/// Background tasks off; tests drive maintenance themselves
pub fn test_config(n: u16) -> InstanceConfig {
    let mut config = InstanceConfig::new(database(n));
    config.run_background_tasks = false;
    config.startup.join_backoff_ms = 1;
    config.startup.max_join_attempts = 2;
    config.startup.max_locator_waits = 2;
    config.commit.quorum_wait_ms = 2000;
    config.commit.straggler_timeout_ms = 2000;
    config.replication.replica_creation_attempts = 1;
    config.replication.replica_creation_backoff_ms = 1;
    config
}

pub fn table(name: &str) -> TableInfo {
    TableInfo::from_full_name(&format!("PUBLIC.{}", name))
}

pub struct TestCluster {
    pub network: Arc<LocalNetwork>,
    pub nodes: Vec<Arc<DatabaseRemoteFacade>>,
    pub executors: Vec<MemoryQueryExecutor>,
    crashed: HashSet<usize>,
    system_table_key: OverlayKey,
}

impl TestCluster {
    pub async fn start(size: u16) -> Self {
        Self::start_with(size, |_| {}).await
    }

    /// Node 0 creates the ring; the others join through it. The system
    /// table key is pinned to node 0's ring key so node 0 owns it.
    pub async fn start_with(size: u16, configure: impl Fn(&mut InstanceConfig)) -> Self {
        logging::init_tracing(tracing::Level::WARN);
        let mut cluster = Self {
            network: LocalNetwork::new(),
            nodes: Vec::new(),
            executors: Vec::new(),
            crashed: HashSet::new(),
            system_table_key: OverlayKey::for_address(&database(0).address()),
        };
        for _ in 0..size {
            cluster.add_node(&configure).await;
        }
        cluster
    }

    pub async fn add_node(&mut self, configure: &impl Fn(&mut InstanceConfig)) -> Arc<DatabaseRemoteFacade> {
        let n = self.nodes.len() as u16;
        let mut config = test_config(n);
        configure(&mut config);

        let executor = MemoryQueryExecutor::new();
        let context = ClusterContext::new()
            .unwrap()
            .with_system_table_key(self.system_table_key);
        let known_hosts = self
            .nodes
            .first()
            .map(|first| vec![first.database_id().clone()])
            .unwrap_or_default();
        let env = InstanceEnvironment::in_process(self.network.clone())
            .unwrap()
            .with_executor(Arc::new(executor.clone()))
            .with_context(context)
            .with_known_hosts(known_hosts);

        let facade = DatabaseRemoteFacade::start(config, env).await.unwrap();
        self.nodes.push(Arc::clone(&facade));
        self.executors.push(executor);
        self.settle(4).await;
        facade
    }

    pub fn node(&self, i: usize) -> &Arc<DatabaseRemoteFacade> {
        &self.nodes[i]
    }

    pub fn system_table_key(&self) -> OverlayKey {
        self.system_table_key
    }

    /// Rounds of stabilization, event handling and replication on every live node
    pub async fn settle(&self, rounds: usize) {
        for _ in 0..rounds {
            for (i, node) in self.nodes.iter().enumerate() {
                if self.crashed.contains(&i) || node.is_shut_down() {
                    continue;
                }
                node.run_maintenance().await;
            }
        }
    }

    /// Stop answering any call, as if the process died
    pub fn crash(&mut self, i: usize) {
        self.network.crash(&self.nodes[i].database_id().address());
        self.crashed.insert(i);
    }

    pub fn index_of(&self, address: &NodeAddress) -> usize {
        self.nodes
            .iter()
            .position(|node| node.database_id().address() == *address)
            .unwrap()
    }
}
