//! Local database instance
//!
//! The in-process end of the instance contract. Runs replicated writes
//! against the local engine through the PREPARE / COMMIT / ROLLBACK control
//! statements, and tracks per table the last update ID this replica applied
//! so out-of-order writes are reported to the coordinator.
//!
//! A prepared transaction whose decision never arrives is rolled back once
//! it is older than the prepared timeout.

use crate::error::Result;
use crate::executor::{QueryExecutor, StatementKind};
use crate::metadata_store::{MetadataReplica, MetadataStore};
use crate::remote::DatabaseInstanceRemote;
use crate::system_table_reference::SystemTableReference;
use crate::types::{DatabaseId, ExecutionAck, TableInfo, TableManagerRef, UpdateStamp};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct PreparedUpdate {
    stamp: UpdateStamp,
    prepared_at: Instant,
}

pub struct DatabaseInstance {
    local: DatabaseId,
    executor: Arc<dyn QueryExecutor>,
    store: Arc<MetadataStore>,
    reference: Arc<SystemTableReference>,
    /// Serializes statement + PREPARE pairs on the local engine
    execution: Mutex<()>,
    last_applied: DashMap<TableInfo, u64>,
    pending: DashMap<String, PreparedUpdate>,
    prepared_timeout: Duration,
}

impl DatabaseInstance {
    pub fn new(
        local: DatabaseId,
        executor: Arc<dyn QueryExecutor>,
        store: Arc<MetadataStore>,
        reference: Arc<SystemTableReference>,
        prepared_timeout: Duration,
    ) -> Self {
        Self {
            local,
            executor,
            store,
            reference,
            execution: Mutex::new(()),
            last_applied: DashMap::new(),
            pending: DashMap::new(),
            prepared_timeout,
        }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.local
    }

    /// Last update ID committed here for `table`
    pub fn last_applied_update_id(&self, table: &TableInfo) -> Option<u64> {
        self.last_applied.get(table).map(|id| *id)
    }

    /// Record that this replica holds `table` at `update_id` (new replicas)
    pub fn set_applied_update_id(&self, table: TableInfo, update_id: u64) {
        self.last_applied.insert(table, update_id);
    }

    /// Prepared transactions still waiting for their decision
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Roll back prepared transactions older than the prepared timeout.
    /// Returns how many were dropped.
    pub fn expire_pending(&self) -> usize {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.prepared_at.elapsed() >= self.prepared_timeout)
            .map(|entry| entry.key().clone())
            .collect();

        let mut dropped = 0;
        for transaction_name in expired {
            if self.pending.remove(&transaction_name).is_none() {
                continue;
            }
            dropped += 1;
            let _guard = self.execution.lock();
            if let Err(e) = self.run(&format!("ROLLBACK TRANSACTION {}", transaction_name)) {
                tracing::debug!(txn = %transaction_name, error = %e, "rollback of expired transaction failed");
            }
            tracing::warn!(instance = %self.local, txn = %transaction_name, "prepared transaction expired without a decision");
        }
        dropped
    }

    fn run(&self, sql: &str) -> Result<i32> {
        self.executor.prepare_command(sql)?.execute_update(false)
    }

    fn execute_and_prepare(&self, sql: &str, transaction_name: &str) -> Result<i32> {
        let _guard = self.execution.lock();
        if let Err(e) = self.run(sql) {
            if let Err(rollback) = self.run("ROLLBACK") {
                tracing::debug!(error = %rollback, "rollback after failed statement failed");
            }
            return Err(e);
        }
        self.run(&format!("PREPARE COMMIT {}", transaction_name))
    }
}

#[async_trait]
impl DatabaseInstanceRemote for DatabaseInstance {
    async fn get_database_id(&self) -> Result<DatabaseId> {
        Ok(self.local.clone())
    }

    async fn is_alive(&self) -> Result<bool> {
        Ok(true)
    }

    async fn execute_update(
        &self,
        sql: String,
        transaction_name: String,
        stamp: Option<UpdateStamp>,
    ) -> Result<ExecutionAck> {
        self.expire_pending();
        let observed = stamp.as_ref().map(|stamp| {
            self.last_applied_update_id(&stamp.table)
                .unwrap_or(stamp.previous_update_id)
        });

        let result = self.execute_and_prepare(&sql, &transaction_name)?;
        tracing::debug!(
            instance = %self.local,
            txn = %transaction_name,
            kind = ?StatementKind::from_sql(&sql),
            result,
            "statement prepared"
        );

        if let Some(stamp) = stamp {
            if let Some(observed) = observed {
                if observed != stamp.previous_update_id {
                    tracing::warn!(
                        instance = %self.local,
                        table = %stamp.table,
                        observed,
                        expected = stamp.previous_update_id,
                        "replica out of order"
                    );
                }
            }
            self.pending.insert(
                transaction_name,
                PreparedUpdate {
                    stamp,
                    prepared_at: Instant::now(),
                },
            );
        }

        Ok(ExecutionAck {
            result,
            observed_update_id: observed,
        })
    }

    async fn commit_transaction(&self, transaction_name: String, commit: bool) -> Result<i32> {
        let sql = if commit {
            format!("COMMIT TRANSACTION {}", transaction_name)
        } else {
            format!("ROLLBACK TRANSACTION {}", transaction_name)
        };
        let result = {
            let _guard = self.execution.lock();
            self.run(&sql)?
        };

        if let Some((_, prepared)) = self.pending.remove(&transaction_name) {
            if commit {
                self.last_applied
                    .insert(prepared.stamp.table, prepared.stamp.update_id);
            }
        }
        Ok(result)
    }

    async fn get_system_table_location(&self) -> Result<Option<DatabaseId>> {
        Ok(self.reference.get_system_table_url())
    }

    async fn set_system_table_location(&self, location: DatabaseId) -> Result<()> {
        self.reference.set_system_table_url(location);
        Ok(())
    }

    async fn create_metadata_replica(&self, replica: MetadataReplica) -> Result<bool> {
        let kind = replica.kind();
        let applied = self.store.store(replica)?;
        tracing::debug!(instance = %self.local, kind, applied, "metadata replica received");
        // A newer copy already held still counts as a healthy holder
        Ok(true)
    }

    async fn recreate_table_manager(
        &self,
        table: TableInfo,
        old_location: DatabaseId,
    ) -> Result<Option<TableManagerRef>> {
        self.reference.recreate_table_manager(table, old_location).await
    }

    async fn take_over_table_manager(&self, manager: TableManagerRef) -> Result<TableManagerRef> {
        self.reference.take_over_table_manager(manager).await
    }

    async fn take_over_system_table(&self) -> Result<bool> {
        self.reference
            .migrate_system_table_to_local_instance(false, false)
            .await?;
        Ok(true)
    }

    async fn recover_system_table(&self, failed: DatabaseId) -> Result<bool> {
        self.reference.recover_system_table(failed).await
    }
}
