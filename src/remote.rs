//! Remote call contracts
//!
//! The three remote interfaces of the coordination layer, each with:
//! - an async trait implemented by the local object and by a proxy
//! - a proxy that turns trait calls into `RpcRequest`s
//! - a service adapter that turns `RpcRequest`s back into trait calls
//!
//! `RemoteResolver` hands out proxies for a location, so callers hold
//! `Arc<dyn ...Remote>` and never care whether the target is local.

use crate::distributed_rpc::{
    table_manager_service, InstanceRequest, RpcReply, RpcRequest, RpcService, RpcTransport,
    SystemTableRequest, TableManagerRequest, INSTANCE_SERVICE, SYSTEM_TABLE_SERVICE,
};
use crate::error::{Result, RingDbError};
use crate::metadata_store::MetadataReplica;
use crate::system_table::SystemTableSnapshot;
use crate::table_manager::TableManagerSnapshot;
use crate::types::{
    CommitResult, ConnectionInfo, DatabaseId, ExecutionAck, LockRequest, LockType, NodeAddress,
    TableInfo, TableManagerRef, TableProxy, UpdateStamp,
};
use async_trait::async_trait;
use std::sync::Arc;

/// Calls every database instance answers
#[async_trait]
pub trait DatabaseInstanceRemote: Send + Sync {
    async fn get_database_id(&self) -> Result<DatabaseId>;

    async fn is_alive(&self) -> Result<bool>;

    /// Run `sql` then PREPARE it under `transaction_name`
    async fn execute_update(
        &self,
        sql: String,
        transaction_name: String,
        stamp: Option<UpdateStamp>,
    ) -> Result<ExecutionAck>;

    /// Second phase: COMMIT or ROLLBACK a prepared transaction
    async fn commit_transaction(&self, transaction_name: String, commit: bool) -> Result<i32>;

    async fn get_system_table_location(&self) -> Result<Option<DatabaseId>>;

    async fn set_system_table_location(&self, location: DatabaseId) -> Result<()>;

    /// Store a copy of replicated metadata locally
    async fn create_metadata_replica(&self, replica: MetadataReplica) -> Result<bool>;

    /// Host the table manager for `table` from local metadata
    async fn recreate_table_manager(
        &self,
        table: TableInfo,
        old_location: DatabaseId,
    ) -> Result<Option<TableManagerRef>>;

    /// Pull a live table manager's state and host it here
    async fn take_over_table_manager(&self, manager: TableManagerRef) -> Result<TableManagerRef>;

    /// Pull the live system table's state and host it here
    async fn take_over_system_table(&self) -> Result<bool>;

    /// Ask this instance to recover a system table that `failed` hosted
    async fn recover_system_table(&self, failed: DatabaseId) -> Result<bool>;
}

/// Cluster-wide table and connection authority
#[async_trait]
pub trait SystemTableRemote: Send + Sync {
    async fn lookup(&self, table: TableInfo) -> Result<Option<TableManagerRef>>;

    async fn exists(&self, table: TableInfo) -> Result<bool>;

    async fn add_table_information(&self, manager: TableManagerRef, replica: DatabaseId) -> Result<bool>;

    async fn remove_table_information(&self, table: TableInfo) -> Result<bool>;

    async fn change_table_manager_location(&self, manager: TableManagerRef) -> Result<()>;

    async fn add_replica_location(&self, table: TableInfo, replica: DatabaseId) -> Result<bool>;

    async fn remove_replica_location(&self, table: TableInfo, replica: DatabaseId) -> Result<bool>;

    async fn add_table_manager_replica(&self, table: TableInfo, replica: DatabaseId) -> Result<bool>;

    async fn add_connection_information(&self, info: ConnectionInfo) -> Result<bool>;

    async fn remove_connection_information(&self, database: DatabaseId) -> Result<bool>;

    async fn get_connection_information(&self) -> Result<Vec<ConnectionInfo>>;

    async fn get_table_managers(&self) -> Result<Vec<TableManagerRef>>;

    async fn suspected_machine_failure(&self, database: DatabaseId) -> Result<bool>;

    async fn check_connection(&self) -> Result<bool>;

    async fn snapshot(&self) -> Result<SystemTableSnapshot>;

    async fn get_new_table_set_number(&self) -> Result<i64>;

    async fn shutdown(&self) -> Result<()>;
}

/// Per-table lock and replica authority
#[async_trait]
pub trait TableManagerRemote: Send + Sync {
    async fn get_table_proxy(&self, lock_type: LockType, request: LockRequest) -> Result<TableProxy>;

    async fn release_lock_and_update_replica_state(
        &self,
        commit: bool,
        request: LockRequest,
        committed: Vec<CommitResult>,
        is_async: bool,
    ) -> Result<()>;

    /// Fold in outcomes of replicas that answered after the lock was released
    async fn record_late_replica_update(&self, update_id: u64, results: Vec<CommitResult>) -> Result<()>;

    async fn add_replica_information(&self, table: TableInfo) -> Result<bool>;

    async fn remove_replica_information(&self, table: TableInfo) -> Result<bool>;

    async fn get_table_info(&self) -> Result<TableInfo>;

    async fn get_active_replicas(&self) -> Result<Vec<DatabaseId>>;

    async fn get_all_replicas(&self) -> Result<Vec<DatabaseId>>;

    async fn snapshot(&self) -> Result<TableManagerSnapshot>;

    async fn exists(&self) -> Result<bool>;

    async fn shutdown(&self) -> Result<()>;
}

fn wrong_service(service: &str, request: &RpcRequest) -> RingDbError {
    RingDbError::Internal(format!("{} service cannot handle {} request", service, request.label()))
}

// ---------------------------------------------------------------------------
// Proxies
// ---------------------------------------------------------------------------

pub struct RemoteInstance {
    address: NodeAddress,
    transport: Arc<dyn RpcTransport>,
}

impl RemoteInstance {
    async fn call(&self, request: InstanceRequest) -> Result<RpcReply> {
        self.transport
            .call(&self.address, INSTANCE_SERVICE, RpcRequest::Instance(request))
            .await
    }
}

#[async_trait]
impl DatabaseInstanceRemote for RemoteInstance {
    async fn get_database_id(&self) -> Result<DatabaseId> {
        self.call(InstanceRequest::GetDatabaseId).await?.into_database()
    }

    async fn is_alive(&self) -> Result<bool> {
        self.call(InstanceRequest::IsAlive).await?.into_bool()
    }

    async fn execute_update(
        &self,
        sql: String,
        transaction_name: String,
        stamp: Option<UpdateStamp>,
    ) -> Result<ExecutionAck> {
        self.call(InstanceRequest::ExecuteUpdate {
            sql,
            transaction_name,
            stamp,
        })
        .await?
        .into_ack()
    }

    async fn commit_transaction(&self, transaction_name: String, commit: bool) -> Result<i32> {
        let result = self
            .call(InstanceRequest::CommitTransaction {
                transaction_name,
                commit,
            })
            .await?
            .into_int()?;
        Ok(result as i32)
    }

    async fn get_system_table_location(&self) -> Result<Option<DatabaseId>> {
        self.call(InstanceRequest::GetSystemTableLocation)
            .await?
            .into_maybe_database()
    }

    async fn set_system_table_location(&self, location: DatabaseId) -> Result<()> {
        self.call(InstanceRequest::SetSystemTableLocation(location))
            .await?
            .into_unit()
    }

    async fn create_metadata_replica(&self, replica: MetadataReplica) -> Result<bool> {
        self.call(InstanceRequest::CreateMetadataReplica(replica))
            .await?
            .into_bool()
    }

    async fn recreate_table_manager(
        &self,
        table: TableInfo,
        old_location: DatabaseId,
    ) -> Result<Option<TableManagerRef>> {
        self.call(InstanceRequest::RecreateTableManager { table, old_location })
            .await?
            .into_maybe_manager()
    }

    async fn take_over_table_manager(&self, manager: TableManagerRef) -> Result<TableManagerRef> {
        self.call(InstanceRequest::TakeOverTableManager(manager))
            .await?
            .into_manager()
    }

    async fn take_over_system_table(&self) -> Result<bool> {
        self.call(InstanceRequest::TakeOverSystemTable).await?.into_bool()
    }

    async fn recover_system_table(&self, failed: DatabaseId) -> Result<bool> {
        self.call(InstanceRequest::RecoverSystemTable(failed))
            .await?
            .into_bool()
    }
}

pub struct RemoteSystemTable {
    address: NodeAddress,
    transport: Arc<dyn RpcTransport>,
}

impl RemoteSystemTable {
    async fn call(&self, request: SystemTableRequest) -> Result<RpcReply> {
        self.transport
            .call(&self.address, SYSTEM_TABLE_SERVICE, RpcRequest::SystemTable(request))
            .await
    }
}

#[async_trait]
impl SystemTableRemote for RemoteSystemTable {
    async fn lookup(&self, table: TableInfo) -> Result<Option<TableManagerRef>> {
        self.call(SystemTableRequest::Lookup(table)).await?.into_maybe_manager()
    }

    async fn exists(&self, table: TableInfo) -> Result<bool> {
        self.call(SystemTableRequest::Exists(table)).await?.into_bool()
    }

    async fn add_table_information(&self, manager: TableManagerRef, replica: DatabaseId) -> Result<bool> {
        self.call(SystemTableRequest::AddTableInformation { manager, replica })
            .await?
            .into_bool()
    }

    async fn remove_table_information(&self, table: TableInfo) -> Result<bool> {
        self.call(SystemTableRequest::RemoveTableInformation(table))
            .await?
            .into_bool()
    }

    async fn change_table_manager_location(&self, manager: TableManagerRef) -> Result<()> {
        self.call(SystemTableRequest::ChangeTableManagerLocation(manager))
            .await?
            .into_unit()
    }

    async fn add_replica_location(&self, table: TableInfo, replica: DatabaseId) -> Result<bool> {
        self.call(SystemTableRequest::AddReplicaLocation { table, replica })
            .await?
            .into_bool()
    }

    async fn remove_replica_location(&self, table: TableInfo, replica: DatabaseId) -> Result<bool> {
        self.call(SystemTableRequest::RemoveReplicaLocation { table, replica })
            .await?
            .into_bool()
    }

    async fn add_table_manager_replica(&self, table: TableInfo, replica: DatabaseId) -> Result<bool> {
        self.call(SystemTableRequest::AddTableManagerReplica { table, replica })
            .await?
            .into_bool()
    }

    async fn add_connection_information(&self, info: ConnectionInfo) -> Result<bool> {
        self.call(SystemTableRequest::AddConnectionInformation(info))
            .await?
            .into_bool()
    }

    async fn remove_connection_information(&self, database: DatabaseId) -> Result<bool> {
        self.call(SystemTableRequest::RemoveConnectionInformation(database))
            .await?
            .into_bool()
    }

    async fn get_connection_information(&self) -> Result<Vec<ConnectionInfo>> {
        self.call(SystemTableRequest::GetConnectionInformation)
            .await?
            .into_connections()
    }

    async fn get_table_managers(&self) -> Result<Vec<TableManagerRef>> {
        self.call(SystemTableRequest::GetTableManagers).await?.into_managers()
    }

    async fn suspected_machine_failure(&self, database: DatabaseId) -> Result<bool> {
        self.call(SystemTableRequest::SuspectedMachineFailure(database))
            .await?
            .into_bool()
    }

    async fn check_connection(&self) -> Result<bool> {
        self.call(SystemTableRequest::CheckConnection).await?.into_bool()
    }

    async fn snapshot(&self) -> Result<SystemTableSnapshot> {
        self.call(SystemTableRequest::Snapshot)
            .await?
            .into_system_table_state()
    }

    async fn get_new_table_set_number(&self) -> Result<i64> {
        self.call(SystemTableRequest::NewTableSetNumber).await?.into_int()
    }

    async fn shutdown(&self) -> Result<()> {
        self.call(SystemTableRequest::Shutdown).await?.into_unit()
    }
}

pub struct RemoteTableManager {
    address: NodeAddress,
    service: String,
    transport: Arc<dyn RpcTransport>,
}

impl RemoteTableManager {
    async fn call(&self, request: TableManagerRequest) -> Result<RpcReply> {
        self.transport
            .call(&self.address, &self.service, RpcRequest::TableManager(request))
            .await
    }
}

#[async_trait]
impl TableManagerRemote for RemoteTableManager {
    async fn get_table_proxy(&self, lock_type: LockType, request: LockRequest) -> Result<TableProxy> {
        self.call(TableManagerRequest::GetTableProxy { lock_type, request })
            .await?
            .into_proxy()
    }

    async fn release_lock_and_update_replica_state(
        &self,
        commit: bool,
        request: LockRequest,
        committed: Vec<CommitResult>,
        is_async: bool,
    ) -> Result<()> {
        self.call(TableManagerRequest::ReleaseLock {
            commit,
            request,
            committed,
            is_async,
        })
        .await?
        .into_unit()
    }

    async fn record_late_replica_update(&self, update_id: u64, results: Vec<CommitResult>) -> Result<()> {
        self.call(TableManagerRequest::RecordLateReplicaUpdate { update_id, results })
            .await?
            .into_unit()
    }

    async fn add_replica_information(&self, table: TableInfo) -> Result<bool> {
        self.call(TableManagerRequest::AddReplicaInformation(table))
            .await?
            .into_bool()
    }

    async fn remove_replica_information(&self, table: TableInfo) -> Result<bool> {
        self.call(TableManagerRequest::RemoveReplicaInformation(table))
            .await?
            .into_bool()
    }

    async fn get_table_info(&self) -> Result<TableInfo> {
        self.call(TableManagerRequest::GetTableInfo).await?.into_table()
    }

    async fn get_active_replicas(&self) -> Result<Vec<DatabaseId>> {
        self.call(TableManagerRequest::GetActiveReplicas)
            .await?
            .into_databases()
    }

    async fn get_all_replicas(&self) -> Result<Vec<DatabaseId>> {
        self.call(TableManagerRequest::GetAllReplicas).await?.into_databases()
    }

    async fn snapshot(&self) -> Result<TableManagerSnapshot> {
        self.call(TableManagerRequest::Snapshot)
            .await?
            .into_table_manager_state()
    }

    async fn exists(&self) -> Result<bool> {
        self.call(TableManagerRequest::Exists).await?.into_bool()
    }

    async fn shutdown(&self) -> Result<()> {
        self.call(TableManagerRequest::Shutdown).await?.into_unit()
    }
}

// ---------------------------------------------------------------------------
// Service adapters
// ---------------------------------------------------------------------------

pub struct InstanceService(pub Arc<dyn DatabaseInstanceRemote>);

#[async_trait]
impl RpcService for InstanceService {
    async fn handle(&self, request: RpcRequest) -> Result<RpcReply> {
        let request = match request {
            RpcRequest::Instance(request) => request,
            other => return Err(wrong_service(INSTANCE_SERVICE, &other)),
        };
        let target = &self.0;
        Ok(match request {
            InstanceRequest::GetDatabaseId => RpcReply::Database(target.get_database_id().await?),
            InstanceRequest::IsAlive => RpcReply::Bool(target.is_alive().await?),
            InstanceRequest::ExecuteUpdate {
                sql,
                transaction_name,
                stamp,
            } => RpcReply::Ack(target.execute_update(sql, transaction_name, stamp).await?),
            InstanceRequest::CommitTransaction {
                transaction_name,
                commit,
            } => RpcReply::Int(target.commit_transaction(transaction_name, commit).await? as i64),
            InstanceRequest::GetSystemTableLocation => {
                RpcReply::MaybeDatabase(target.get_system_table_location().await?)
            }
            InstanceRequest::SetSystemTableLocation(location) => {
                target.set_system_table_location(location).await?;
                RpcReply::Unit
            }
            InstanceRequest::CreateMetadataReplica(replica) => {
                RpcReply::Bool(target.create_metadata_replica(replica).await?)
            }
            InstanceRequest::RecreateTableManager { table, old_location } => {
                RpcReply::MaybeManager(target.recreate_table_manager(table, old_location).await?)
            }
            InstanceRequest::TakeOverTableManager(manager) => {
                RpcReply::Manager(target.take_over_table_manager(manager).await?)
            }
            InstanceRequest::TakeOverSystemTable => RpcReply::Bool(target.take_over_system_table().await?),
            InstanceRequest::RecoverSystemTable(failed) => {
                RpcReply::Bool(target.recover_system_table(failed).await?)
            }
        })
    }
}

pub struct SystemTableService(pub Arc<dyn SystemTableRemote>);

#[async_trait]
impl RpcService for SystemTableService {
    async fn handle(&self, request: RpcRequest) -> Result<RpcReply> {
        let request = match request {
            RpcRequest::SystemTable(request) => request,
            other => return Err(wrong_service(SYSTEM_TABLE_SERVICE, &other)),
        };
        let st = &self.0;
        Ok(match request {
            SystemTableRequest::Lookup(table) => RpcReply::MaybeManager(st.lookup(table).await?),
            SystemTableRequest::Exists(table) => RpcReply::Bool(st.exists(table).await?),
            SystemTableRequest::AddTableInformation { manager, replica } => {
                RpcReply::Bool(st.add_table_information(manager, replica).await?)
            }
            SystemTableRequest::RemoveTableInformation(table) => {
                RpcReply::Bool(st.remove_table_information(table).await?)
            }
            SystemTableRequest::ChangeTableManagerLocation(manager) => {
                st.change_table_manager_location(manager).await?;
                RpcReply::Unit
            }
            SystemTableRequest::AddReplicaLocation { table, replica } => {
                RpcReply::Bool(st.add_replica_location(table, replica).await?)
            }
            SystemTableRequest::RemoveReplicaLocation { table, replica } => {
                RpcReply::Bool(st.remove_replica_location(table, replica).await?)
            }
            SystemTableRequest::AddTableManagerReplica { table, replica } => {
                RpcReply::Bool(st.add_table_manager_replica(table, replica).await?)
            }
            SystemTableRequest::AddConnectionInformation(info) => {
                RpcReply::Bool(st.add_connection_information(info).await?)
            }
            SystemTableRequest::RemoveConnectionInformation(database) => {
                RpcReply::Bool(st.remove_connection_information(database).await?)
            }
            SystemTableRequest::GetConnectionInformation => {
                RpcReply::Connections(st.get_connection_information().await?)
            }
            SystemTableRequest::GetTableManagers => RpcReply::Managers(st.get_table_managers().await?),
            SystemTableRequest::SuspectedMachineFailure(database) => {
                RpcReply::Bool(st.suspected_machine_failure(database).await?)
            }
            SystemTableRequest::CheckConnection => RpcReply::Bool(st.check_connection().await?),
            SystemTableRequest::Snapshot => RpcReply::SystemTableState(st.snapshot().await?),
            SystemTableRequest::NewTableSetNumber => RpcReply::Int(st.get_new_table_set_number().await?),
            SystemTableRequest::Shutdown => {
                st.shutdown().await?;
                RpcReply::Unit
            }
        })
    }
}

pub struct TableManagerService(pub Arc<dyn TableManagerRemote>);

#[async_trait]
impl RpcService for TableManagerService {
    async fn handle(&self, request: RpcRequest) -> Result<RpcReply> {
        let request = match request {
            RpcRequest::TableManager(request) => request,
            other => return Err(wrong_service("table_manager", &other)),
        };
        let tm = &self.0;
        Ok(match request {
            TableManagerRequest::GetTableProxy { lock_type, request } => {
                RpcReply::Proxy(tm.get_table_proxy(lock_type, request).await?)
            }
            TableManagerRequest::ReleaseLock {
                commit,
                request,
                committed,
                is_async,
            } => {
                tm.release_lock_and_update_replica_state(commit, request, committed, is_async)
                    .await?;
                RpcReply::Unit
            }
            TableManagerRequest::RecordLateReplicaUpdate { update_id, results } => {
                tm.record_late_replica_update(update_id, results).await?;
                RpcReply::Unit
            }
            TableManagerRequest::AddReplicaInformation(table) => {
                RpcReply::Bool(tm.add_replica_information(table).await?)
            }
            TableManagerRequest::RemoveReplicaInformation(table) => {
                RpcReply::Bool(tm.remove_replica_information(table).await?)
            }
            TableManagerRequest::GetTableInfo => RpcReply::Table(tm.get_table_info().await?),
            TableManagerRequest::GetActiveReplicas => RpcReply::Databases(tm.get_active_replicas().await?),
            TableManagerRequest::GetAllReplicas => RpcReply::Databases(tm.get_all_replicas().await?),
            TableManagerRequest::Snapshot => RpcReply::TableManagerState(tm.snapshot().await?),
            TableManagerRequest::Exists => RpcReply::Bool(tm.exists().await?),
            TableManagerRequest::Shutdown => {
                tm.shutdown().await?;
                RpcReply::Unit
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Builds proxies for remote locations over one transport
#[derive(Clone)]
pub struct RemoteResolver {
    transport: Arc<dyn RpcTransport>,
}

impl RemoteResolver {
    pub fn new(transport: Arc<dyn RpcTransport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<dyn RpcTransport> {
        &self.transport
    }

    pub fn instance(&self, database: &DatabaseId) -> Arc<dyn DatabaseInstanceRemote> {
        self.instance_at(&database.address())
    }

    pub fn instance_at(&self, address: &NodeAddress) -> Arc<dyn DatabaseInstanceRemote> {
        Arc::new(RemoteInstance {
            address: address.clone(),
            transport: Arc::clone(&self.transport),
        })
    }

    pub fn system_table(&self, location: &DatabaseId) -> Arc<dyn SystemTableRemote> {
        Arc::new(RemoteSystemTable {
            address: location.address(),
            transport: Arc::clone(&self.transport),
        })
    }

    pub fn table_manager(&self, manager: &TableManagerRef) -> Arc<dyn TableManagerRemote> {
        Arc::new(RemoteTableManager {
            address: manager.location.address(),
            service: table_manager_service(&manager.table),
            transport: Arc::clone(&self.transport),
        })
    }
}
