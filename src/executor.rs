//! Query execution collaborator
//!
//! The coordination layer never interprets SQL. It hands statements to a
//! `QueryExecutor`, which turns them into `Command`s, and drives the local
//! engine's two-phase commit through three control statements:
//! `PREPARE COMMIT <txn>`, `COMMIT TRANSACTION <txn>` and
//! `ROLLBACK TRANSACTION <txn>`.
//!
//! `MemoryQueryExecutor` is a small in-memory engine implementing that
//! contract, with fault injection for tests.

use crate::error::{Result, RingDbError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Coarse statement classification, used for logging and lock selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    PrepareCommit,
    CommitTransaction,
    Rollback,
    Create,
    Drop,
    Insert,
    Delete,
    Update,
    Select,
    Other,
}

impl StatementKind {
    pub fn from_sql(sql: &str) -> Self {
        let upper = sql.trim().to_ascii_uppercase();
        if upper.starts_with("PREPARE COMMIT") {
            StatementKind::PrepareCommit
        } else if upper.starts_with("COMMIT TRANSACTION") {
            StatementKind::CommitTransaction
        } else if upper.starts_with("ROLLBACK") {
            StatementKind::Rollback
        } else if upper.contains("CREATE") {
            StatementKind::Create
        } else if upper.contains("DROP") {
            StatementKind::Drop
        } else if upper.contains("INSERT") {
            StatementKind::Insert
        } else if upper.contains("DELETE") {
            StatementKind::Delete
        } else if upper.contains("UPDATE") {
            StatementKind::Update
        } else if upper.contains("SELECT") {
            StatementKind::Select
        } else {
            StatementKind::Other
        }
    }

    pub fn is_ddl(&self) -> bool {
        matches!(self, StatementKind::Create | StatementKind::Drop)
    }
}

/// A prepared statement against the local engine
pub trait Command: Send {
    /// Run the statement; returns a row count or PREPARE result
    fn execute_update(&self, wait_for_remote_commit: bool) -> Result<i32>;
}

/// Turns SQL into commands for the local engine
pub trait QueryExecutor: Send + Sync {
    fn prepare_command(&self, sql: &str) -> Result<Box<dyn Command>>;
}

#[derive(Default)]
struct EngineState {
    /// Statements executed since the last PREPARE
    open: Vec<String>,
    prepared: HashMap<String, Vec<String>>,
    committed: Vec<String>,
    /// Substring that makes matching statements fail
    failing_pattern: Option<String>,
    prepare_result: i32,
}

/// In-memory engine: records statements and honours the commit protocol
#[derive(Default, Clone)]
pub struct MemoryQueryExecutor {
    state: Arc<Mutex<EngineState>>,
}

impl MemoryQueryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every statement containing `pattern` fail with a SQL error
    pub fn fail_statements_matching(&self, pattern: impl Into<String>) {
        self.state.lock().failing_pattern = Some(pattern.into());
    }

    pub fn clear_faults(&self) {
        let mut state = self.state.lock();
        state.failing_pattern = None;
        state.prepare_result = 0;
    }

    /// Result PREPARE COMMIT reports; non-zero means "cannot commit"
    pub fn set_prepare_result(&self, result: i32) {
        self.state.lock().prepare_result = result;
    }

    pub fn committed_statements(&self) -> Vec<String> {
        self.state.lock().committed.clone()
    }

    pub fn prepared_transactions(&self) -> Vec<String> {
        self.state.lock().prepared.keys().cloned().collect()
    }
}

impl QueryExecutor for MemoryQueryExecutor {
    fn prepare_command(&self, sql: &str) -> Result<Box<dyn Command>> {
        if sql.trim().is_empty() {
            return Err(RingDbError::Sql("empty statement".to_string()));
        }
        Ok(Box::new(MemoryCommand {
            sql: sql.trim().to_string(),
            kind: StatementKind::from_sql(sql),
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemoryCommand {
    sql: String,
    kind: StatementKind,
    state: Arc<Mutex<EngineState>>,
}

impl MemoryCommand {
    fn transaction_name(&self) -> Result<String> {
        self.sql
            .split_whitespace()
            .nth(2)
            .map(str::to_string)
            .ok_or_else(|| RingDbError::Sql(format!("missing transaction name: {}", self.sql)))
    }
}

impl Command for MemoryCommand {
    fn execute_update(&self, _wait_for_remote_commit: bool) -> Result<i32> {
        let mut state = self.state.lock();

        if let Some(pattern) = &state.failing_pattern {
            if self.sql.contains(pattern.as_str()) {
                return Err(RingDbError::Sql(format!("injected failure: {}", self.sql)));
            }
        }

        match self.kind {
            StatementKind::PrepareCommit => {
                let txn = self.transaction_name()?;
                let statements = std::mem::take(&mut state.open);
                state.prepared.insert(txn, statements);
                Ok(state.prepare_result)
            }
            StatementKind::CommitTransaction => {
                let txn = self.transaction_name()?;
                if let Some(statements) = state.prepared.remove(&txn) {
                    state.committed.extend(statements);
                }
                Ok(0)
            }
            StatementKind::Rollback => {
                match self.transaction_name() {
                    Ok(txn) => {
                        state.prepared.remove(&txn);
                    }
                    Err(_) => state.open.clear(),
                }
                Ok(0)
            }
            kind => {
                state.open.push(self.sql.clone());
                Ok(if kind.is_ddl() { 0 } else { 1 })
            }
        }
    }
}
