//! Two-Phase Commit (2PC) across a table's replica set
//!
//! One round per replicated write:
//! 1. PREPARE: every active replica runs the statement and prepares it, concurrently
//! 2. COMMIT/ROLLBACK: once enough replicas answered, each one is told the outcome
//!
//! Replication modes:
//! - Synchronous (no asynchronous replication factor): wait for every replica;
//!   unreachable and out-of-order replicas are dropped from the round
//! - Asynchronous (factor `k`): commit after `k` in-order acknowledgements and
//!   hand the replicas still in flight to the `AsyncTransactionTracker`
//!
//! Votes:
//! - A non-zero PREPARE result or an SQL error vetoes the round
//! - An unreachable replica never vetoes; it only shrinks the surviving count
//! - An out-of-order replica is rolled back and dropped from the active set

use crate::config::CommitConfig;
use crate::context::ClusterContext;
use crate::error::Result;
use crate::remote::{DatabaseInstanceRemote, RemoteResolver, TableManagerRemote};
use crate::types::{CommitResult, DatabaseId, ExecutionAck, TableInfo, TableProxy};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinSet;

type InFlight = JoinSet<(DatabaseId, Result<ExecutionAck>)>;

/// 2PC transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TwoPhaseCommitState {
    /// Waiting for PREPARE answers
    Preparing,
    Committing,
    Committed,
    Aborting,
    Aborted,
}

/// How one replica answered PREPARE
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaVote {
    /// Prepared at the expected update ID
    Prepared { observed: u64 },
    /// Prepared, but the replica missed an earlier update
    OutOfOrder { observed: u64 },
    /// Non-zero PREPARE result (`prepared`) or a failed statement
    Rejected { reason: String, prepared: bool },
    /// Transport fault; says nothing about the replica's state
    Unreachable(String),
}

impl ReplicaVote {
    pub fn classify(outcome: Result<ExecutionAck>, expected_update_id: u64) -> Self {
        match outcome {
            Ok(ack) if ack.result != 0 => ReplicaVote::Rejected {
                reason: format!("PREPARE returned {}", ack.result),
                prepared: true,
            },
            Ok(ack) => {
                let observed = ack.observed_update_id.unwrap_or(expected_update_id);
                if observed == expected_update_id {
                    ReplicaVote::Prepared { observed }
                } else {
                    ReplicaVote::OutOfOrder { observed }
                }
            }
            Err(e) if e.is_unavailable() => ReplicaVote::Unreachable(e.to_string()),
            Err(e) => ReplicaVote::Rejected {
                reason: e.to_string(),
                prepared: false,
            },
        }
    }

    pub fn is_prepared(&self) -> bool {
        matches!(self, ReplicaVote::Prepared { .. })
    }

    pub fn is_veto(&self) -> bool {
        matches!(self, ReplicaVote::Rejected { .. })
    }

    /// Dropped from the round without vetoing it
    pub fn is_excluded(&self) -> bool {
        matches!(self, ReplicaVote::OutOfOrder { .. } | ReplicaVote::Unreachable(_))
    }

    /// Holds prepared work that needs a COMMIT or ROLLBACK
    fn holds_prepared_work(&self) -> bool {
        match self {
            ReplicaVote::Prepared { .. } | ReplicaVote::OutOfOrder { .. } => true,
            ReplicaVote::Rejected { prepared, .. } => *prepared,
            ReplicaVote::Unreachable(_) => false,
        }
    }

    fn observed(&self) -> Option<u64> {
        match self {
            ReplicaVote::Prepared { observed } | ReplicaVote::OutOfOrder { observed } => Some(*observed),
            _ => None,
        }
    }
}

/// In-flight commit round
#[derive(Debug, Clone)]
pub struct Transaction {
    pub name: String,
    pub table: TableInfo,
    pub participants: Vec<DatabaseId>,
    pub updates_needed: usize,
    pub state: TwoPhaseCommitState,
    pub started: Instant,
}

/// What the caller learns about a finished round
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub transaction_name: String,
    pub committed: bool,
    /// Update ID the round carried
    pub update_id: u64,
    /// One entry per replica that answered before the decision
    pub results: Vec<CommitResult>,
    /// Replicas that did not commit this round
    pub disagreeing: Vec<DatabaseId>,
    /// Replicas still in flight, reconciled in the background
    pub stragglers: Vec<DatabaseId>,
    pub is_async: bool,
}

/// Running tally of PREPARE answers
struct Tally {
    synchronous: bool,
    participants: usize,
    updates_needed: usize,
    votes: Vec<(DatabaseId, ReplicaVote)>,
}

impl Tally {
    fn prepared(&self) -> usize {
        self.votes.iter().filter(|(_, v)| v.is_prepared()).count()
    }

    fn vetoed(&self) -> bool {
        self.votes.iter().any(|(_, v)| v.is_veto())
    }

    /// Prepared answers required to commit
    fn needed(&self) -> usize {
        if self.synchronous {
            let excluded = self.votes.iter().filter(|(_, v)| v.is_excluded()).count();
            self.participants.saturating_sub(excluded).max(1)
        } else {
            self.updates_needed
        }
    }

    fn decided(&self, outstanding: usize) -> bool {
        let prepared = self.prepared();
        self.vetoed() || prepared >= self.needed() || prepared + outstanding < self.needed()
    }

    fn should_commit(&self) -> bool {
        !self.vetoed() && self.prepared() >= self.needed()
    }
}

/// Replicas of one round that answered after the decision
struct StragglerRound {
    transaction_name: String,
    table: TableInfo,
    update_id: u64,
    expected_update_id: u64,
    committed: bool,
    handles: HashMap<DatabaseId, Arc<dyn DatabaseInstanceRemote>>,
    outstanding: HashSet<DatabaseId>,
    in_flight: InFlight,
    manager: Arc<dyn TableManagerRemote>,
}

/// Finishes stragglers in the background.
///
/// Each straggler gets the round's decision once it answers. For committed
/// rounds the outcomes go back to the table manager, which re-admits the
/// replicas that caught up.
pub struct AsyncTransactionTracker {
    timeout: Duration,
    pending: AtomicUsize,
    idle: Notify,
    reconciled: AtomicU64,
    abandoned: AtomicU64,
}

impl AsyncTransactionTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
            reconciled: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
        }
    }

    /// Rounds still waiting on stragglers
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Wait until no round has stragglers left; false on timeout
    pub async fn wait_for_quiescence(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.pending_count() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.pending_count() == 0;
            }
        }
    }

    fn track(self: &Arc<Self>, round: StragglerRound) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            tracker.reconcile(round).await;
            if tracker.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                tracker.idle.notify_waiters();
            }
        });
    }

    async fn reconcile(&self, mut round: StragglerRound) {
        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut results = Vec::new();

        while !round.outstanding.is_empty() {
            let (replica, outcome) = match tokio::time::timeout_at(deadline, round.in_flight.join_next()).await {
                Ok(Some(Ok(answer))) => answer,
                Ok(Some(Err(e))) => {
                    tracing::error!(txn = %round.transaction_name, error = %e, "straggler task failed");
                    continue;
                }
                Ok(None) | Err(_) => break,
            };
            round.outstanding.remove(&replica);

            let vote = ReplicaVote::classify(outcome, round.expected_update_id);
            let commit = round.committed && vote.is_prepared();
            let mut applied = commit;
            if vote.holds_prepared_work() {
                if let Some(instance) = round.handles.get(&replica) {
                    if let Err(e) = instance
                        .commit_transaction(round.transaction_name.clone(), commit)
                        .await
                    {
                        tracing::warn!(txn = %round.transaction_name, replica = %replica, error = %e, "straggler phase two failed");
                        applied = false;
                    }
                }
            }
            tracing::debug!(txn = %round.transaction_name, replica = %replica, ?vote, applied, "straggler answered");

            results.push(CommitResult {
                replica,
                commit: applied,
                update_id: vote.observed().unwrap_or(round.expected_update_id),
                expected_update_id: round.expected_update_id,
                table: Some(round.table.clone()),
            });
        }

        round.in_flight.abort_all();
        for replica in round.outstanding.drain() {
            tracing::warn!(txn = %round.transaction_name, replica = %replica, "straggler abandoned");
            self.abandoned.fetch_add(1, Ordering::Relaxed);
            results.push(CommitResult {
                replica,
                commit: false,
                update_id: round.expected_update_id,
                expected_update_id: round.expected_update_id,
                table: Some(round.table.clone()),
            });
        }

        if round.committed && !results.is_empty() {
            if let Err(e) = round
                .manager
                .record_late_replica_update(round.update_id, results)
                .await
            {
                tracing::warn!(txn = %round.transaction_name, table = %round.table, error = %e, "late replica outcomes lost");
            }
        }
        self.reconciled.fetch_add(1, Ordering::Relaxed);
    }
}

/// Coordinator for 2PC
pub struct TwoPhaseCommitCoordinator {
    local: DatabaseId,
    local_instance: Arc<dyn DatabaseInstanceRemote>,
    resolver: RemoteResolver,
    config: CommitConfig,
    context: ClusterContext,
    tracker: Arc<AsyncTransactionTracker>,
    transactions: DashMap<String, Transaction>,
    committed: AtomicU64,
    aborted: AtomicU64,
}

impl TwoPhaseCommitCoordinator {
    pub fn new(
        local: DatabaseId,
        local_instance: Arc<dyn DatabaseInstanceRemote>,
        resolver: RemoteResolver,
        config: CommitConfig,
        context: ClusterContext,
    ) -> Self {
        let tracker = Arc::new(AsyncTransactionTracker::new(config.straggler_timeout()));
        Self {
            local,
            local_instance,
            resolver,
            config,
            context,
            tracker,
            transactions: DashMap::new(),
            committed: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
        }
    }

    pub fn tracker(&self) -> &Arc<AsyncTransactionTracker> {
        &self.tracker
    }

    /// Local replicas run in-process; the rest go over RPC
    fn instance_for(&self, replica: &DatabaseId) -> Arc<dyn DatabaseInstanceRemote> {
        if *replica == self.local {
            Arc::clone(&self.local_instance)
        } else {
            self.resolver.instance(replica)
        }
    }

    fn set_state(&self, name: &str, state: TwoPhaseCommitState) {
        if let Some(mut txn) = self.transactions.get_mut(name) {
            tracing::debug!(txn = %name, from = ?txn.state, to = ?state, "transaction state");
            txn.state = state;
        }
    }

    /// Run `sql` on every replica named by `proxy`, decide, tell each replica
    /// the decision and release the lock held through `manager`.
    ///
    /// The returned error is the lock release failing; the commit decision
    /// itself is always reported through `CommitOutcome`.
    pub async fn execute_update(
        &self,
        sql: &str,
        proxy: &TableProxy,
        manager: Arc<dyn TableManagerRemote>,
    ) -> Result<CommitOutcome> {
        let started = Instant::now();
        let name = self.context.next_transaction_name(&self.local);
        let table = proxy.table().clone();
        let participants: Vec<DatabaseId> = proxy.replicas.iter().map(|r| r.database.clone()).collect();
        let expected = proxy.expected_update_id;
        let stamp = proxy.lock_granted.is_exclusive().then(|| proxy.stamp());

        let mut tally = Tally {
            synchronous: self.config.asynchronous_replication_factor.is_none(),
            participants: participants.len(),
            updates_needed: self.config.updates_needed(participants.len()),
            votes: Vec::with_capacity(participants.len()),
        };

        self.transactions.insert(
            name.clone(),
            Transaction {
                name: name.clone(),
                table: table.clone(),
                participants: participants.clone(),
                updates_needed: tally.updates_needed,
                state: TwoPhaseCommitState::Preparing,
                started,
            },
        );

        // Phase 1: PREPARE everywhere at once
        let mut handles = HashMap::new();
        let mut in_flight: InFlight = JoinSet::new();
        for replica in &participants {
            let instance = self.instance_for(replica);
            handles.insert(replica.clone(), Arc::clone(&instance));
            let (sql, txn, stamp, replica) = (sql.to_string(), name.clone(), stamp.clone(), replica.clone());
            in_flight.spawn(async move {
                let outcome = instance.execute_update(sql, txn, stamp).await;
                (replica, outcome)
            });
        }

        let mut outstanding: HashSet<DatabaseId> = participants.iter().cloned().collect();
        let deadline = tokio::time::Instant::now() + self.config.quorum_wait();
        while !tally.decided(outstanding.len()) {
            match tokio::time::timeout_at(deadline, in_flight.join_next()).await {
                Ok(Some(Ok((replica, outcome)))) => {
                    outstanding.remove(&replica);
                    let vote = ReplicaVote::classify(outcome, expected);
                    match &vote {
                        ReplicaVote::Unreachable(reason) => {
                            tracing::warn!(txn = %name, replica = %replica, %reason, "replica unreachable")
                        }
                        ReplicaVote::OutOfOrder { observed } => {
                            tracing::warn!(txn = %name, replica = %replica, observed, expected, "replica out of order")
                        }
                        ReplicaVote::Rejected { reason, .. } => {
                            tracing::info!(txn = %name, replica = %replica, %reason, "replica voted no")
                        }
                        ReplicaVote::Prepared { .. } => {}
                    }
                    tally.votes.push((replica, vote));
                }
                Ok(Some(Err(e))) => {
                    tracing::error!(txn = %name, error = %e, "prepare task failed");
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(txn = %name, outstanding = outstanding.len(), "quorum wait expired");
                    break;
                }
            }
        }

        let committed = tally.should_commit();
        self.set_state(
            &name,
            if committed {
                TwoPhaseCommitState::Committing
            } else {
                TwoPhaseCommitState::Aborting
            },
        );

        // Phase 2: COMMIT in-order replicas, ROLLBACK everyone else
        let phase_two = tally
            .votes
            .iter()
            .filter(|(_, vote)| vote.holds_prepared_work())
            .filter_map(|(replica, vote)| {
                let instance = handles.get(replica).cloned()?;
                let commit = committed && vote.is_prepared();
                let (replica, txn) = (replica.clone(), name.clone());
                Some(async move {
                    let result = instance.commit_transaction(txn, commit).await;
                    (replica, commit, result)
                })
            });
        let mut phase_two_failed = HashSet::new();
        for (replica, commit, result) in join_all(phase_two).await {
            if let Err(e) = result {
                tracing::warn!(txn = %name, replica = %replica, commit, error = %e, "phase two failed");
                if commit {
                    phase_two_failed.insert(replica);
                }
            }
        }

        let results: Vec<CommitResult> = tally
            .votes
            .iter()
            .map(|(replica, vote)| CommitResult {
                replica: replica.clone(),
                commit: committed && vote.is_prepared() && !phase_two_failed.contains(replica),
                update_id: vote.observed().unwrap_or(expected),
                expected_update_id: expected,
                table: Some(table.clone()),
            })
            .collect();

        // Aborted rounds only report replicas that must leave the active set
        let forwarded: Vec<CommitResult> = if committed {
            results.clone()
        } else {
            tally
                .votes
                .iter()
                .zip(&results)
                .filter(|((_, vote), _)| vote.is_excluded())
                .map(|(_, result)| result.clone())
                .collect()
        };

        let stragglers: Vec<DatabaseId> = outstanding.iter().cloned().collect();
        let is_async = committed && !stragglers.is_empty();
        let released = manager
            .release_lock_and_update_replica_state(committed, proxy.lock_request.clone(), forwarded, is_async)
            .await;

        if !outstanding.is_empty() {
            self.tracker.track(StragglerRound {
                transaction_name: name.clone(),
                table: table.clone(),
                update_id: proxy.update_id,
                expected_update_id: expected,
                committed,
                handles,
                outstanding,
                in_flight,
                manager,
            });
        }

        let elapsed = started.elapsed();
        self.context.metrics().record_transaction(committed, elapsed.as_secs_f64());
        if committed {
            self.committed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.aborted.fetch_add(1, Ordering::Relaxed);
        }
        self.set_state(
            &name,
            if committed {
                TwoPhaseCommitState::Committed
            } else {
                TwoPhaseCommitState::Aborted
            },
        );
        self.transactions.remove(&name);

        let disagreeing: Vec<DatabaseId> = results
            .iter()
            .filter(|r| !r.commit)
            .map(|r| r.replica.clone())
            .collect();
        tracing::info!(
            txn = %name,
            table = %table,
            committed,
            replicas = participants.len(),
            disagreeing = disagreeing.len(),
            stragglers = stragglers.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "commit round finished"
        );

        released?;
        Ok(CommitOutcome {
            transaction_name: name,
            committed,
            update_id: proxy.update_id,
            results,
            disagreeing,
            stragglers,
            is_async,
        })
    }

    pub fn get_transaction(&self, name: &str) -> Option<Transaction> {
        self.transactions.get(name).map(|txn| txn.clone())
    }

    pub fn get_statistics(&self) -> TwoPhaseCommitStats {
        let committed = self.committed.load(Ordering::Relaxed);
        let aborted = self.aborted.load(Ordering::Relaxed);
        TwoPhaseCommitStats {
            total_transactions: committed + aborted + self.transactions.len() as u64,
            committed_transactions: committed,
            aborted_transactions: aborted,
            in_progress_transactions: self.transactions.len(),
            pending_straggler_rounds: self.tracker.pending_count(),
            reconciled_straggler_rounds: self.tracker.reconciled.load(Ordering::Relaxed),
            abandoned_stragglers: self.tracker.abandoned.load(Ordering::Relaxed),
        }
    }
}

/// 2PC statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwoPhaseCommitStats {
    pub total_transactions: u64,
    pub committed_transactions: u64,
    pub aborted_transactions: u64,
    pub in_progress_transactions: usize,
    pub pending_straggler_rounds: usize,
    pub reconciled_straggler_rounds: u64,
    pub abandoned_stragglers: u64,
}
