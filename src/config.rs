//! Instance Configuration
//!
//! Every component takes its own config struct with sensible defaults.
//! `InstanceConfig` aggregates them and can be loaded from a JSON file.

use crate::error::{Result, RingDbError};
use crate::types::DatabaseId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Ring membership and stabilization
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Interval between stabilize / fix-fingers / check-predecessor rounds (ms)
    pub stabilize_interval_ms: u64,

    /// Length of the successor list kept for failover
    pub successor_list_len: usize,

    /// Maximum forwarding hops for one lookup
    pub max_lookup_hops: usize,

    /// Capacity of the membership event queue
    pub event_queue_capacity: usize,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            stabilize_interval_ms: 500,
            successor_list_len: 4,
            max_lookup_hops: 32,
            event_queue_capacity: 256,
        }
    }
}

impl RingConfig {
    pub fn stabilize_interval(&self) -> Duration {
        Duration::from_millis(self.stabilize_interval_ms)
    }
}

/// RPC transport timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Timeout for connection attempts (ms)
    pub connect_timeout_ms: u64,

    /// Timeout for a full request/response exchange (ms)
    pub call_timeout_ms: u64,

    /// Retries for calls that failed before any byte was sent
    pub max_retries: usize,

    /// Largest accepted frame
    pub max_frame_bytes: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 2000,
            call_timeout_ms: 10000,
            max_retries: 2,
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Two-phase commit behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitConfig {
    /// Replica acknowledgements needed before committing. `None` waits for
    /// every active replica (synchronous replication).
    pub asynchronous_replication_factor: Option<usize>,

    /// Upper bound on the wait for quorum (ms)
    pub quorum_wait_ms: u64,

    /// How long stragglers may take before their transaction is abandoned (ms)
    pub straggler_timeout_ms: u64,

    /// How long a replica keeps a prepared transaction with no decision (ms).
    /// Should exceed the quorum wait plus the straggler timeout.
    pub prepared_timeout_ms: u64,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            asynchronous_replication_factor: None,
            quorum_wait_ms: 10000,
            straggler_timeout_ms: 30000,
            prepared_timeout_ms: 60000,
        }
    }
}

impl CommitConfig {
    /// Acknowledgements required out of `replica_count`, clamped to [1, N]
    pub fn updates_needed(&self, replica_count: usize) -> usize {
        let wanted = self
            .asynchronous_replication_factor
            .unwrap_or(replica_count);
        wanted.clamp(1, replica_count.max(1))
    }

    pub fn quorum_wait(&self) -> Duration {
        Duration::from_millis(self.quorum_wait_ms)
    }

    pub fn straggler_timeout(&self) -> Duration {
        Duration::from_millis(self.straggler_timeout_ms)
    }

    pub fn prepared_timeout(&self) -> Duration {
        Duration::from_millis(self.prepared_timeout_ms)
    }
}

/// Table manager lock arbitration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Maximum time a request waits for a conflicting lock (ms)
    pub lock_timeout_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5000,
        }
    }
}

/// Metadata replication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Copies of the system table state, counting the host
    pub system_table_replication_factor: usize,

    /// Copies of each table manager's state, counting the host
    pub table_manager_replication_factor: usize,

    /// Attempts to create a replica on a candidate that is still starting
    pub replica_creation_attempts: usize,

    /// Pause between attempts (ms), multiplied by the attempt number
    pub replica_creation_backoff_ms: u64,

    /// Interval of the background replication-factor check (ms)
    pub check_interval_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            system_table_replication_factor: 2,
            table_manager_replication_factor: 2,
            replica_creation_attempts: 5,
            replica_creation_backoff_ms: 50,
            check_interval_ms: 2000,
        }
    }
}

/// Process bootstrap
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupConfig {
    /// Ports tried (base port upwards) before giving up on binding
    pub max_bind_attempts: usize,

    /// Full passes over the known hosts when joining
    pub max_join_attempts: usize,

    /// Base back-off between join passes (ms), randomized and multiplied by attempt
    pub join_backoff_ms: u64,

    /// Passes spent waiting for another instance to create the ring
    pub max_locator_waits: usize,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            max_bind_attempts: 5,
            max_join_attempts: 3,
            join_backoff_ms: 200,
            max_locator_waits: 5,
        }
    }
}

/// Full configuration of one database instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub database: DatabaseId,
    #[serde(default)]
    pub ring: RingConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub commit: CommitConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub startup: StartupConfig,
    /// Directory for persisted metadata replicas; in-memory when absent
    #[serde(default)]
    pub metadata_dir: Option<PathBuf>,
    /// Spawn stabilization, event consumer and maintenance tasks
    #[serde(default = "default_true")]
    pub run_background_tasks: bool,
}

fn default_true() -> bool {
    true
}

impl InstanceConfig {
    pub fn new(database: DatabaseId) -> Self {
        Self {
            database,
            ring: RingConfig::default(),
            rpc: RpcConfig::default(),
            commit: CommitConfig::default(),
            lock: LockConfig::default(),
            replication: ReplicationConfig::default(),
            startup: StartupConfig::default(),
            metadata_dir: None,
            run_background_tasks: true,
        }
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| RingDbError::Config(format!("{}: {}", path.display(), e)))?;
        let config: InstanceConfig = serde_json::from_str(&raw)
            .map_err(|e| RingDbError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.host.is_empty() {
            return Err(RingDbError::Config("database host must not be empty".to_string()));
        }
        if self.ring.successor_list_len == 0 {
            return Err(RingDbError::Config("successor_list_len must be at least 1".to_string()));
        }
        if self.commit.prepared_timeout_ms == 0 {
            return Err(RingDbError::Config("prepared_timeout_ms must be positive".to_string()));
        }
        if self.replication.replica_creation_attempts == 0 {
            return Err(RingDbError::Config(
                "replica_creation_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_updates_needed_defaults_to_all() {
        let config = CommitConfig::default();
        assert_eq!(config.updates_needed(3), 3);
        assert_eq!(config.updates_needed(0), 1);
    }

    #[test]
    fn test_updates_needed_clamped() {
        let config = CommitConfig {
            asynchronous_replication_factor: Some(5),
            ..Default::default()
        };
        assert_eq!(config.updates_needed(3), 3);

        let config = CommitConfig {
            asynchronous_replication_factor: Some(0),
            ..Default::default()
        };
        assert_eq!(config.updates_needed(3), 1);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "database": {{"host": "alpha", "port": 9100, "location": "db1", "is_system_table": false}},
                "commit": {{"asynchronous_replication_factor": 2}}
            }}"#
        )
        .unwrap();

        let config = InstanceConfig::from_file(file.path()).unwrap();
        assert_eq!(config.database.port, 9100);
        assert_eq!(config.commit.asynchronous_replication_factor, Some(2));
        assert_eq!(config.commit.quorum_wait_ms, 10000);
        assert_eq!(config.ring.successor_list_len, 4);
        assert!(config.run_background_tasks);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = InstanceConfig::new(DatabaseId::new("alpha", 9100, "db1"));
        config.ring.successor_list_len = 0;
        assert!(matches!(config.validate(), Err(RingDbError::Config(_))));
    }
}
