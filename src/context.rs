//! Per-instance cluster context
//!
//! Everything that would otherwise be process-global lives here and is
//! handed to each component at construction: the well-known system table
//! key, the transaction name counter and the metrics registry.

use crate::distributed_metrics::CoordinationMetrics;
use crate::distributed_ring::{OverlayKey, SYSTEM_TABLE_KEY_NAME};
use crate::error::Result;
use crate::types::DatabaseId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone)]
pub struct ClusterContext {
    system_table_key: OverlayKey,
    transaction_counter: Arc<AtomicU64>,
    metrics: Arc<CoordinationMetrics>,
}

impl ClusterContext {
    pub fn new() -> Result<Self> {
        Ok(Self {
            system_table_key: OverlayKey::for_name(SYSTEM_TABLE_KEY_NAME),
            transaction_counter: Arc::new(AtomicU64::new(0)),
            metrics: Arc::new(CoordinationMetrics::new()?),
        })
    }

    /// Pin the system table to a chosen key (used to place it deterministically)
    pub fn with_system_table_key(mut self, key: OverlayKey) -> Self {
        self.system_table_key = key;
        self
    }

    pub fn system_table_key(&self) -> OverlayKey {
        self.system_table_key
    }

    pub fn metrics(&self) -> &Arc<CoordinationMetrics> {
        &self.metrics
    }

    /// Globally unique transaction name: requester identity plus a counter
    pub fn next_transaction_name(&self, requester: &DatabaseId) -> String {
        let n = self.transaction_counter.fetch_add(1, Ordering::SeqCst);
        format!("TXN_{}_{}_{}", requester.host, requester.port, n)
    }
}
