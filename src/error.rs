//! Error types for the coordination layer
//!
//! Faults are split the way callers need to react to them:
//! - Transport faults (peer unreachable, refused, timed out) shrink replica sets
//! - Application faults (SQL errors, failed PREPARE) turn into "no" votes
//! - Startup faults stop the local instance before it half-joins the ring
//!
//! Every variant is serializable so a fault raised on a remote instance
//! reaches the caller unchanged over the RPC transport.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Faults that make a local instance refuse to start
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartupError {
    #[error("no known hosts to join and the locator refused ring creation")]
    NoKnownHosts,

    #[error("locator service unreachable: {0}")]
    LocatorUnreachable(String),

    #[error("could not bind a local endpoint after {attempts} attempts")]
    BindFailed { attempts: usize },

    #[error("could not join the ring after {attempts} attempts")]
    JoinFailed { attempts: usize },

    #[error("joined the ring but no system table could be located")]
    SystemTableNotFound,
}

/// Crate-wide error type
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RingDbError {
    #[error("transport fault talking to {address}: {message}")]
    Transport { address: String, message: String },

    #[error("service '{service}' is not bound at {address}")]
    ServiceNotBound { address: String, service: String },

    #[error("SQL error: {0}")]
    Sql(String),

    #[error("timed out waiting for {lock} lock on {table}")]
    LockTimeout { table: String, lock: String },

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("table already exists: {0}")]
    TableAlreadyExists(String),

    #[error("system table unavailable: {0}")]
    SystemTableUnavailable(String),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("startup failed: {0}")]
    Startup(#[from] StartupError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RingDbError {
    pub fn transport(address: impl ToString, message: impl ToString) -> Self {
        RingDbError::Transport {
            address: address.to_string(),
            message: message.to_string(),
        }
    }

    /// True for faults that say nothing about the remote state, only that
    /// the remote could not be reached.
    pub fn is_transport(&self) -> bool {
        matches!(self, RingDbError::Transport { .. })
    }

    /// True when the peer is gone or no longer serves the requested role.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            RingDbError::Transport { .. }
                | RingDbError::ServiceNotBound { .. }
                | RingDbError::SystemTableUnavailable(_)
        )
    }
}

impl From<std::io::Error> for RingDbError {
    fn from(e: std::io::Error) -> Self {
        RingDbError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for RingDbError {
    fn from(e: serde_json::Error) -> Self {
        RingDbError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for RingDbError {
    fn from(e: bincode::Error) -> Self {
        RingDbError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RingDbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        let e = RingDbError::transport("db1:9000", "connection refused");
        assert!(e.is_transport());
        assert!(e.is_unavailable());

        let e = RingDbError::ServiceNotBound {
            address: "db1:9000".to_string(),
            service: "system_table".to_string(),
        };
        assert!(!e.is_transport());
        assert!(e.is_unavailable());

        assert!(!RingDbError::Sql("syntax".to_string()).is_unavailable());
    }

    #[test]
    fn test_startup_error_wraps() {
        let e: RingDbError = StartupError::BindFailed { attempts: 5 }.into();
        assert_eq!(e.to_string(), "startup failed: could not bind a local endpoint after 5 attempts");
    }

    #[test]
    fn test_error_survives_bincode() {
        let e = RingDbError::LockTimeout {
            table: "PUBLIC.ORDERS".to_string(),
            lock: "WRITE".to_string(),
        };
        let bytes = bincode::serialize(&e).unwrap();
        let back: RingDbError = bincode::deserialize(&bytes).unwrap();
        assert_eq!(e, back);
    }
}
