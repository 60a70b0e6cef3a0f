//! RingDB - Coordination Layer for a Peer-to-Peer Distributed Database
//!
//! Instances form a structured overlay ring. The ring decides who hosts the
//! cluster-wide system table and where each table's manager lives, and every
//! replicated write goes through a two-phase commit across the table's replicas.
//!
//! # Architecture
//!
//! - Ring Layer: Chord-style overlay with stabilization and membership events
//! - RPC Layer: typed request/response services over TCP or an in-process network
//! - System Table: table directory, replica locations and instance registry
//! - Table Managers: per-table locks, replica sets and update IDs
//! - Commit Layer: 2PC with quorum commit and asynchronous straggler reconciliation
//! - Recovery Layer: metadata replication to ring neighbours and failover
//! - Facade: startup, ring bootstrap and event handling for one instance

pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod logging;
pub mod types;

// Ring and transport modules
pub mod distributed_memnet;
pub mod distributed_metrics;
pub mod distributed_p2p;
pub mod distributed_ring;
pub mod distributed_rpc;
pub mod remote;

// Directory and per-table metadata
pub mod locator;
pub mod metadata_store;
pub mod replication;
pub mod settings;
pub mod system_table;
pub mod system_table_reference;
pub mod table_manager;

// Commit and recovery
pub mod distributed_2pc;
pub mod distributed_recovery;

// Instance wiring
pub mod facade;
pub mod instance;

pub use config::{
    CommitConfig, InstanceConfig, LockConfig, ReplicationConfig, RingConfig, RpcConfig, StartupConfig,
};
pub use context::ClusterContext;
pub use error::{Result, RingDbError, StartupError};
pub use executor::{MemoryQueryExecutor, QueryExecutor, StatementKind};
pub use types::{
    CommitResult, ConnectionInfo, DatabaseId, LockRequest, LockType, NodeAddress, TableInfo, TableManagerRef,
    TableProxy, UpdateStamp,
};

// Ring and transport exports
pub use distributed_memnet::LocalNetwork;
pub use distributed_metrics::CoordinationMetrics;
pub use distributed_p2p::{TcpRpcServer, TcpTransport};
pub use distributed_ring::{NodeRef, OverlayKey, OverlayNode, RingEvent, RingStats};
pub use distributed_rpc::{RpcTransport, ServiceRegistry};
pub use remote::{DatabaseInstanceRemote, RemoteResolver, SystemTableRemote, TableManagerRemote};

// Metadata exports
pub use locator::{InMemoryLocator, LocatorService};
pub use metadata_store::{MetadataReplica, MetadataStore, MetadataVersion};
pub use replication::{ReplicaManager, ReplicationStats};
pub use settings::{InstanceSettings, LocalSettings};
pub use system_table::{SystemTable, SystemTableStats};
pub use system_table_reference::{ReferenceStats, SystemTableReference, SystemTableRole};
pub use table_manager::{TableManager, TableManagerStats};

// Commit and recovery exports
pub use distributed_2pc::{CommitOutcome, TwoPhaseCommitCoordinator, TwoPhaseCommitStats};
pub use distributed_recovery::{HostRanker, MetaDataReplicationCoordinator, MetadataReplicationStats, RoundRobinRanker};

// Instance exports
pub use facade::{DatabaseRemoteFacade, FacadeStats, InstanceEnvironment, Network};
pub use instance::DatabaseInstance;
