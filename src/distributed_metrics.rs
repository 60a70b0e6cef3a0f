//! Prometheus Metrics for the Coordination Layer
//!
//! Counts what operators need to see when a cluster churns:
//! - Commit rounds by outcome and replicas evicted from active sets
//! - Ring membership events
//! - System table / table manager migrations
//! - Metadata replicas created
//!
//! Each `ClusterContext` owns its own registry so several in-process
//! instances never collide on metric names.

use crate::error::{Result, RingDbError};
use prometheus::{Counter, CounterVec, Gauge, Histogram, HistogramOpts, Opts, Registry};

/// Prometheus metrics collector
pub struct CoordinationMetrics {
    registry: Registry,

    // Commit metrics
    transactions_total: CounterVec,
    transaction_duration: Histogram,
    replica_evictions: Counter,
    stragglers_reconciled: CounterVec,

    // Ring metrics
    ring_events: CounterVec,
    lookup_hops: Histogram,

    // Recovery metrics
    migrations_total: CounterVec,
    metadata_replicas_created: CounterVec,
    system_table_hosted: Gauge,
}

fn metric_error(e: prometheus::Error) -> RingDbError {
    RingDbError::Internal(format!("metrics: {}", e))
}

impl CoordinationMetrics {
    /// Create new metrics collector
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let transactions_total = CounterVec::new(
            Opts::new("ringdb_transactions_total", "Commit rounds by outcome"),
            &["outcome"],
        )
        .map_err(metric_error)?;

        let transaction_duration = Histogram::with_opts(
            HistogramOpts::new("ringdb_transaction_duration_seconds", "Time to reach a commit decision")
                .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0]),
        )
        .map_err(metric_error)?;

        let replica_evictions = Counter::new(
            "ringdb_replica_evictions_total",
            "Replicas dropped from an active set after a commit round",
        )
        .map_err(metric_error)?;

        let stragglers_reconciled = CounterVec::new(
            Opts::new("ringdb_stragglers_total", "Late replica outcomes folded back in"),
            &["result"],
        )
        .map_err(metric_error)?;

        let ring_events = CounterVec::new(
            Opts::new("ringdb_ring_events_total", "Ring membership events"),
            &["event"],
        )
        .map_err(metric_error)?;

        let lookup_hops = Histogram::with_opts(
            HistogramOpts::new("ringdb_lookup_hops", "Hops taken by ring lookups")
                .buckets(vec![0.0, 1.0, 2.0, 4.0, 8.0, 16.0, 32.0]),
        )
        .map_err(metric_error)?;

        let migrations_total = CounterVec::new(
            Opts::new("ringdb_migrations_total", "Role migrations into this instance"),
            &["kind"],
        )
        .map_err(metric_error)?;

        let metadata_replicas_created = CounterVec::new(
            Opts::new("ringdb_metadata_replicas_created_total", "Metadata replicas pushed to other instances"),
            &["kind"],
        )
        .map_err(metric_error)?;

        let system_table_hosted = Gauge::new(
            "ringdb_system_table_hosted",
            "Whether this instance hosts the system table (1=yes, 0=no)",
        )
        .map_err(metric_error)?;

        registry.register(Box::new(transactions_total.clone())).map_err(metric_error)?;
        registry.register(Box::new(transaction_duration.clone())).map_err(metric_error)?;
        registry.register(Box::new(replica_evictions.clone())).map_err(metric_error)?;
        registry.register(Box::new(stragglers_reconciled.clone())).map_err(metric_error)?;
        registry.register(Box::new(ring_events.clone())).map_err(metric_error)?;
        registry.register(Box::new(lookup_hops.clone())).map_err(metric_error)?;
        registry.register(Box::new(migrations_total.clone())).map_err(metric_error)?;
        registry.register(Box::new(metadata_replicas_created.clone())).map_err(metric_error)?;
        registry.register(Box::new(system_table_hosted.clone())).map_err(metric_error)?;

        Ok(Self {
            registry,
            transactions_total,
            transaction_duration,
            replica_evictions,
            stragglers_reconciled,
            ring_events,
            lookup_hops,
            migrations_total,
            metadata_replicas_created,
            system_table_hosted,
        })
    }

    /// Record the decision of one commit round
    pub fn record_transaction(&self, committed: bool, duration_secs: f64) {
        let outcome = if committed { "commit" } else { "abort" };
        self.transactions_total.with_label_values(&[outcome]).inc();
        self.transaction_duration.observe(duration_secs);
    }

    pub fn record_evictions(&self, count: usize) {
        self.replica_evictions.inc_by(count as f64);
    }

    pub fn record_straggler(&self, caught_up: bool) {
        let result = if caught_up { "caught_up" } else { "evicted" };
        self.stragglers_reconciled.with_label_values(&[result]).inc();
    }

    pub fn record_ring_event(&self, event: &str) {
        self.ring_events.with_label_values(&[event]).inc();
    }

    pub fn record_lookup_hops(&self, hops: usize) {
        self.lookup_hops.observe(hops as f64);
    }

    pub fn record_migration(&self, kind: &str) {
        self.migrations_total.with_label_values(&[kind]).inc();
    }

    pub fn record_metadata_replica(&self, kind: &str) {
        self.metadata_replicas_created.with_label_values(&[kind]).inc();
    }

    pub fn set_system_table_hosted(&self, hosted: bool) {
        self.system_table_hosted.set(if hosted { 1.0 } else { 0.0 });
    }

    /// Get registry for external exposure
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_text(&self) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();

        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder.encode(&metric_families, &mut buffer).map_err(metric_error)?;
        String::from_utf8(buffer).map_err(|e| RingDbError::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = CoordinationMetrics::new().unwrap();
        metrics.set_system_table_hosted(true);
        let output = metrics.gather_text().unwrap();
        assert!(output.contains("ringdb_system_table_hosted 1"));
    }

    #[test]
    fn test_record_transaction() {
        let metrics = CoordinationMetrics::new().unwrap();
        metrics.record_transaction(true, 0.02);
        metrics.record_transaction(false, 0.5);
        metrics.record_evictions(2);

        let output = metrics.gather_text().unwrap();
        assert!(output.contains("ringdb_transactions_total{outcome=\"commit\"} 1"));
        assert!(output.contains("ringdb_transactions_total{outcome=\"abort\"} 1"));
        assert!(output.contains("ringdb_replica_evictions_total 2"));
    }

    #[test]
    fn test_independent_registries() {
        let a = CoordinationMetrics::new().unwrap();
        let b = CoordinationMetrics::new().unwrap();
        a.record_migration("system_table");

        assert!(a.gather_text().unwrap().contains("ringdb_migrations_total"));
        assert!(!b.gather_text().unwrap().contains("kind=\"system_table\""));
    }
}
