//! Generic Request/Response RPC Abstraction
//!
//! Every remote interface in the coordination layer (ring node, database
//! instance, system table, table manager) is expressed as a call with a
//! service name and a typed request, answered by a typed reply or a fault.
//!
//! Features:
//! - `RpcTransport`: pluggable client side (in-process or TCP)
//! - `ServiceRegistry`: per-process name -> handler binding
//! - Transport faults are distinguishable from application faults through
//!   `RingDbError::is_transport`

use crate::distributed_ring::{LookupStep, NodeRef, OverlayKey};
use crate::error::{Result, RingDbError};
use crate::metadata_store::MetadataReplica;
use crate::system_table::SystemTableSnapshot;
use crate::table_manager::TableManagerSnapshot;
use crate::types::{
    CommitResult, ConnectionInfo, DatabaseId, ExecutionAck, LockRequest, LockType, NodeAddress,
    TableInfo, TableManagerRef, TableProxy, UpdateStamp,
};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const RING_SERVICE: &str = "ring";
pub const INSTANCE_SERVICE: &str = "instance";
pub const SYSTEM_TABLE_SERVICE: &str = "system_table";

/// Service name a table manager is bound under
pub fn table_manager_service(table: &TableInfo) -> String {
    format!("table_manager/{}", table.full_table_name())
}

/// Ring maintenance and routing calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RingRequest {
    Ping,
    FindSuccessorStep(OverlayKey),
    GetPredecessor,
    GetSuccessorList,
    Notify(NodeRef),
}

/// Calls served by every database instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InstanceRequest {
    GetDatabaseId,
    IsAlive,
    ExecuteUpdate {
        sql: String,
        transaction_name: String,
        stamp: Option<UpdateStamp>,
    },
    CommitTransaction {
        transaction_name: String,
        commit: bool,
    },
    GetSystemTableLocation,
    SetSystemTableLocation(DatabaseId),
    CreateMetadataReplica(MetadataReplica),
    RecreateTableManager {
        table: TableInfo,
        old_location: DatabaseId,
    },
    TakeOverTableManager(TableManagerRef),
    TakeOverSystemTable,
    RecoverSystemTable(DatabaseId),
}

/// Calls served by the system table host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SystemTableRequest {
    Lookup(TableInfo),
    Exists(TableInfo),
    AddTableInformation {
        manager: TableManagerRef,
        replica: DatabaseId,
    },
    RemoveTableInformation(TableInfo),
    ChangeTableManagerLocation(TableManagerRef),
    AddReplicaLocation {
        table: TableInfo,
        replica: DatabaseId,
    },
    RemoveReplicaLocation {
        table: TableInfo,
        replica: DatabaseId,
    },
    AddTableManagerReplica {
        table: TableInfo,
        replica: DatabaseId,
    },
    AddConnectionInformation(ConnectionInfo),
    RemoveConnectionInformation(DatabaseId),
    GetConnectionInformation,
    GetTableManagers,
    SuspectedMachineFailure(DatabaseId),
    CheckConnection,
    Snapshot,
    NewTableSetNumber,
    Shutdown,
}

/// Calls served by one table manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TableManagerRequest {
    GetTableProxy {
        lock_type: LockType,
        request: LockRequest,
    },
    ReleaseLock {
        commit: bool,
        request: LockRequest,
        committed: Vec<CommitResult>,
        is_async: bool,
    },
    RecordLateReplicaUpdate {
        update_id: u64,
        results: Vec<CommitResult>,
    },
    AddReplicaInformation(TableInfo),
    RemoveReplicaInformation(TableInfo),
    GetTableInfo,
    GetActiveReplicas,
    GetAllReplicas,
    Snapshot,
    Exists,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcRequest {
    Ring(RingRequest),
    Instance(InstanceRequest),
    SystemTable(SystemTableRequest),
    TableManager(TableManagerRequest),
}

impl RpcRequest {
    /// Short label used in logs
    pub fn label(&self) -> &'static str {
        match self {
            RpcRequest::Ring(_) => "ring",
            RpcRequest::Instance(_) => "instance",
            RpcRequest::SystemTable(_) => "system_table",
            RpcRequest::TableManager(_) => "table_manager",
        }
    }
}

/// Typed reply values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcReply {
    Unit,
    Bool(bool),
    Int(i64),
    Ack(ExecutionAck),
    Database(DatabaseId),
    MaybeDatabase(Option<DatabaseId>),
    Databases(Vec<DatabaseId>),
    MaybeNode(Option<NodeRef>),
    Nodes(Vec<NodeRef>),
    Step(LookupStep),
    Manager(TableManagerRef),
    MaybeManager(Option<TableManagerRef>),
    Managers(Vec<TableManagerRef>),
    Connections(Vec<ConnectionInfo>),
    Proxy(TableProxy),
    Table(TableInfo),
    SystemTableState(SystemTableSnapshot),
    TableManagerState(TableManagerSnapshot),
}

macro_rules! reply_accessor {
    ($name:ident, $variant:ident, $ty:ty) => {
        pub fn $name(self) -> Result<$ty> {
            match self {
                RpcReply::$variant(value) => Ok(value),
                other => Err(RingDbError::Internal(format!(
                    "expected {} reply, got {:?}",
                    stringify!($variant),
                    other
                ))),
            }
        }
    };
}

impl RpcReply {
    pub fn into_unit(self) -> Result<()> {
        match self {
            RpcReply::Unit => Ok(()),
            other => Err(RingDbError::Internal(format!("expected Unit reply, got {:?}", other))),
        }
    }

    reply_accessor!(into_bool, Bool, bool);
    reply_accessor!(into_int, Int, i64);
    reply_accessor!(into_ack, Ack, ExecutionAck);
    reply_accessor!(into_database, Database, DatabaseId);
    reply_accessor!(into_maybe_database, MaybeDatabase, Option<DatabaseId>);
    reply_accessor!(into_databases, Databases, Vec<DatabaseId>);
    reply_accessor!(into_maybe_node, MaybeNode, Option<NodeRef>);
    reply_accessor!(into_nodes, Nodes, Vec<NodeRef>);
    reply_accessor!(into_step, Step, LookupStep);
    reply_accessor!(into_manager, Manager, TableManagerRef);
    reply_accessor!(into_maybe_manager, MaybeManager, Option<TableManagerRef>);
    reply_accessor!(into_managers, Managers, Vec<TableManagerRef>);
    reply_accessor!(into_connections, Connections, Vec<ConnectionInfo>);
    reply_accessor!(into_proxy, Proxy, TableProxy);
    reply_accessor!(into_table, Table, TableInfo);
    reply_accessor!(into_system_table_state, SystemTableState, SystemTableSnapshot);
    reply_accessor!(into_table_manager_state, TableManagerState, TableManagerSnapshot);
}

/// Request as it travels over a byte-oriented transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcEnvelope {
    pub service: String,
    pub request: RpcRequest,
}

/// Client side of the RPC abstraction
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn call(&self, target: &NodeAddress, service: &str, request: RpcRequest) -> Result<RpcReply>;
}

/// Server side handler bound under a service name
#[async_trait]
pub trait RpcService: Send + Sync {
    async fn handle(&self, request: RpcRequest) -> Result<RpcReply>;
}

/// Name -> handler bindings of one process
pub struct ServiceRegistry {
    address: NodeAddress,
    services: DashMap<String, Arc<dyn RpcService>>,
}

impl ServiceRegistry {
    pub fn new(address: NodeAddress) -> Self {
        Self {
            address,
            services: DashMap::new(),
        }
    }

    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    /// Bind a handler, replacing any previous one under that name
    pub fn bind(&self, name: impl Into<String>, service: Arc<dyn RpcService>) {
        let name = name.into();
        tracing::debug!(address = %self.address, service = %name, "binding service");
        self.services.insert(name, service);
    }

    pub fn unbind(&self, name: &str) -> bool {
        tracing::debug!(address = %self.address, service = %name, "unbinding service");
        self.services.remove(name).is_some()
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn bound_services(&self) -> Vec<String> {
        self.services.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Route a request to the handler bound under `service`
    pub async fn dispatch(&self, service: &str, request: RpcRequest) -> Result<RpcReply> {
        // Clone the handle out so no map guard is held across the await
        let handler = self
            .services
            .get(service)
            .map(|entry| Arc::clone(entry.value()));

        match handler {
            Some(handler) => handler.handle(request).await,
            None => Err(RingDbError::ServiceNotBound {
                address: self.address.to_string(),
                service: service.to_string(),
            }),
        }
    }
}
