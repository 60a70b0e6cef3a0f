//! Structured Overlay Ring for Key Ownership and Lookup
//!
//! A Chord-style ring used purely as a lookup substrate: "which live node is
//! responsible for key K". Nodes are placed on a 64-bit key space by hashing
//! their `host:port`; a well-known name hashes to the key the system table
//! lives under.
//!
//! Features:
//! - Iterative successor lookup with finger table and successor list
//! - Periodic stabilize / notify / check-predecessor / fix-fingers
//! - Membership changes posted to a bounded event queue, never delivered
//!   through callbacks, so stabilization never runs recovery code
//! - Tolerates stale predecessor/successor views; callers re-check

use crate::config::RingConfig;
use crate::distributed_metrics::CoordinationMetrics;
use crate::distributed_rpc::{RingRequest, RpcReply, RpcRequest, RpcService, RpcTransport, RING_SERVICE};
use crate::error::{Result, RingDbError};
use crate::types::NodeAddress;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

/// Number of finger table entries (one per key bit)
pub const FINGER_COUNT: usize = 64;

/// Well-known name the system table key is derived from
pub const SYSTEM_TABLE_KEY_NAME: &str = "systemTable";

/// Position on the ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OverlayKey(pub u64);

impl OverlayKey {
    /// First 8 bytes of SHA-256 over `name`
    pub fn for_name(name: &str) -> Self {
        let digest = Sha256::digest(name.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        OverlayKey(u64::from_be_bytes(bytes))
    }

    pub fn for_address(address: &NodeAddress) -> Self {
        Self::for_name(&address.to_string())
    }

    /// Membership in `(from, to]`, wrapping around zero. `from == to` is the whole ring.
    pub fn in_range(&self, from: OverlayKey, to: OverlayKey) -> bool {
        if from == to {
            return true;
        }
        if from < to {
            from < *self && *self <= to
        } else {
            *self > from || *self <= to
        }
    }

    /// Membership in `(from, to)`. `from == to` is everything except `from`.
    pub fn in_open_range(&self, from: OverlayKey, to: OverlayKey) -> bool {
        if from == to {
            return *self != from;
        }
        if from < to {
            from < *self && *self < to
        } else {
            *self > from || *self < to
        }
    }

    /// Clockwise distance from `self` to `other`
    pub fn distance_to(&self, other: OverlayKey) -> u64 {
        other.0.wrapping_sub(self.0)
    }

    /// Start of finger `i`: self + 2^i mod 2^64
    pub fn finger_start(&self, i: usize) -> OverlayKey {
        OverlayKey(self.0.wrapping_add(1u64 << i))
    }
}

impl fmt::Display for OverlayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Reference to a ring member
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    pub key: OverlayKey,
    pub address: NodeAddress,
}

impl NodeRef {
    pub fn new(address: NodeAddress) -> Self {
        Self {
            key: OverlayKey::for_address(&address),
            address,
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.address, self.key)
    }
}

/// One hop of an iterative lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LookupStep {
    /// The responsible node
    Done(NodeRef),
    /// Ask this node next
    Forward(NodeRef),
}

/// Membership change posted by the ring
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RingEvent {
    PredecessorChanged {
        old: Option<NodeRef>,
        new: Option<NodeRef>,
    },
    SuccessorChanged {
        old: Option<NodeRef>,
        new: NodeRef,
    },
}

impl RingEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            RingEvent::PredecessorChanged { .. } => "predecessor_changed",
            RingEvent::SuccessorChanged { .. } => "successor_changed",
        }
    }
}

struct RingState {
    predecessor: Option<NodeRef>,
    /// Never empty; `[local]` when alone
    successors: Vec<NodeRef>,
    fingers: Vec<Option<NodeRef>>,
    next_finger: usize,
}

/// Ring statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingStats {
    pub local_address: String,
    pub local_key: String,
    pub predecessor: Option<String>,
    pub successor: String,
    pub successor_list_len: usize,
    pub known_fingers: usize,
    pub lookups: u64,
}

/// Ring member
pub struct OverlayNode {
    local: NodeRef,
    config: RingConfig,
    transport: Arc<dyn RpcTransport>,
    metrics: Arc<CoordinationMetrics>,
    state: RwLock<RingState>,
    events: mpsc::Sender<RingEvent>,
    lookups: AtomicU64,
}

impl OverlayNode {
    /// Create a node that is alone on its own ring until it joins another
    pub fn new(
        address: NodeAddress,
        transport: Arc<dyn RpcTransport>,
        config: RingConfig,
        metrics: Arc<CoordinationMetrics>,
    ) -> (Arc<Self>, mpsc::Receiver<RingEvent>) {
        let (events, receiver) = mpsc::channel(config.event_queue_capacity.max(1));
        let local = NodeRef::new(address);
        let node = Arc::new(Self {
            state: RwLock::new(RingState {
                predecessor: None,
                successors: vec![local.clone()],
                fingers: vec![None; FINGER_COUNT],
                next_finger: 0,
            }),
            local,
            config,
            transport,
            metrics,
            events,
            lookups: AtomicU64::new(0),
        });
        (node, receiver)
    }

    pub fn local(&self) -> &NodeRef {
        &self.local
    }

    /// Start a new ring with this node as its only member
    pub fn create(&self) {
        let mut state = self.state.write();
        state.predecessor = None;
        state.successors = vec![self.local.clone()];
        state.fingers = vec![None; FINGER_COUNT];
        tracing::info!(node = %self.local, "created new ring");
    }

    /// Join the ring `known` belongs to. Fails fast if `known` is unreachable.
    pub async fn join(&self, known: &NodeAddress) -> Result<()> {
        if *known == self.local.address {
            return Err(RingDbError::Internal("cannot join a ring through the local node".to_string()));
        }

        let first = self
            .ring_call(known, RingRequest::FindSuccessorStep(self.local.key))
            .await?
            .into_step()?;
        let successor = self.resolve(first, self.local.key).await?;

        {
            let mut state = self.state.write();
            state.predecessor = None;
            state.successors = vec![successor.clone()];
        }
        tracing::info!(node = %self.local, via = %known, successor = %successor, "joined ring");
        self.emit(RingEvent::SuccessorChanged {
            old: None,
            new: successor.clone(),
        });

        if successor != self.local {
            if let Err(e) = self.ring_call(&successor.address, RingRequest::Notify(self.local.clone())).await {
                tracing::warn!(successor = %successor, error = %e, "notify after join failed");
            }
        }
        Ok(())
    }

    /// Find the live node responsible for `key`
    pub async fn lookup(&self, key: OverlayKey) -> Result<NodeRef> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let first = self.find_successor_step(key);
        self.resolve(first, key).await
    }

    async fn resolve(&self, mut step: LookupStep, key: OverlayKey) -> Result<NodeRef> {
        let mut hops = 0;
        loop {
            match step {
                LookupStep::Done(node) => {
                    self.metrics.record_lookup_hops(hops);
                    return Ok(node);
                }
                LookupStep::Forward(next) => {
                    if hops >= self.config.max_lookup_hops {
                        return Err(RingDbError::Internal(format!(
                            "lookup for {} exceeded {} hops",
                            key, self.config.max_lookup_hops
                        )));
                    }
                    hops += 1;

                    let reply = if next == self.local {
                        Ok(self.find_successor_step(key))
                    } else {
                        self.ring_call(&next.address, RingRequest::FindSuccessorStep(key))
                            .await
                            .and_then(RpcReply::into_step)
                    };

                    step = match reply {
                        Ok(step) => step,
                        Err(e) if e.is_unavailable() => {
                            tracing::debug!(node = %next, error = %e, "lookup hop failed, routing around it");
                            self.forget_node(&next);
                            self.find_successor_step(key)
                        }
                        Err(e) => return Err(e),
                    };
                }
            }
        }
    }

    /// One routing step computed from local state
    pub fn find_successor_step(&self, key: OverlayKey) -> LookupStep {
        let state = self.state.read();

        if let Some(predecessor) = &state.predecessor {
            if key.in_range(predecessor.key, self.local.key) {
                return LookupStep::Done(self.local.clone());
            }
        }

        let successor = state
            .successors
            .first()
            .cloned()
            .unwrap_or_else(|| self.local.clone());
        if key.in_range(self.local.key, successor.key) {
            return LookupStep::Done(successor);
        }

        let closer = self.closest_preceding_node(&state, key);
        if closer == self.local {
            LookupStep::Done(successor)
        } else {
            LookupStep::Forward(closer)
        }
    }

    fn closest_preceding_node(&self, state: &RingState, key: OverlayKey) -> NodeRef {
        state
            .fingers
            .iter()
            .flatten()
            .chain(state.successors.iter())
            .filter(|node| node.key.in_open_range(self.local.key, key))
            .max_by_key(|node| self.local.key.distance_to(node.key))
            .cloned()
            .unwrap_or_else(|| self.local.clone())
    }

    pub fn get_predecessor(&self) -> Option<NodeRef> {
        self.state.read().predecessor.clone()
    }

    pub fn get_successor(&self) -> NodeRef {
        self.state
            .read()
            .successors
            .first()
            .cloned()
            .unwrap_or_else(|| self.local.clone())
    }

    pub fn successor_list(&self) -> Vec<NodeRef> {
        self.state.read().successors.clone()
    }

    /// True when this node is the only member it knows of
    pub fn is_alone(&self) -> bool {
        self.get_successor() == self.local
    }

    /// Whether `key` falls in `(predecessor, local]`. Without a predecessor
    /// this holds only for a node that is alone on its ring.
    pub fn in_local_key_range(&self, key: OverlayKey) -> bool {
        let state = self.state.read();
        match &state.predecessor {
            Some(predecessor) => key.in_range(predecessor.key, self.local.key),
            None => state.successors.first().map_or(true, |s| *s == self.local),
        }
    }

    /// A node believes it might be our predecessor
    pub fn notify(&self, candidate: NodeRef) {
        if candidate == self.local {
            return;
        }

        let old = {
            let mut state = self.state.write();
            let accept = match &state.predecessor {
                None => true,
                Some(current) => candidate.key.in_open_range(current.key, self.local.key),
            };
            if !accept || state.predecessor.as_ref() == Some(&candidate) {
                return;
            }
            state.predecessor.replace(candidate.clone())
        };

        tracing::debug!(node = %self.local, predecessor = %candidate, "predecessor updated");
        self.emit(RingEvent::PredecessorChanged {
            old,
            new: Some(candidate),
        });
    }

    /// Verify the successor and tell it about us
    pub async fn stabilize(&self) -> Result<()> {
        let successor = self.get_successor();

        let candidate = if successor == self.local {
            self.get_predecessor()
        } else {
            match self
                .ring_call(&successor.address, RingRequest::GetPredecessor)
                .await
                .and_then(RpcReply::into_maybe_node)
            {
                Ok(candidate) => candidate,
                Err(e) if e.is_unavailable() => {
                    tracing::debug!(successor = %successor, error = %e, "successor unreachable");
                    self.forget_node(&successor);
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        };

        if let Some(candidate) = candidate {
            if candidate != self.local && candidate.key.in_open_range(self.local.key, successor.key) {
                self.replace_successor(candidate);
            }
        }

        let successor = self.get_successor();
        if successor == self.local {
            return Ok(());
        }

        if let Err(e) = self
            .ring_call(&successor.address, RingRequest::Notify(self.local.clone()))
            .await
        {
            if e.is_unavailable() {
                self.forget_node(&successor);
                return Ok(());
            }
            return Err(e);
        }

        match self
            .ring_call(&successor.address, RingRequest::GetSuccessorList)
            .await
            .and_then(RpcReply::into_nodes)
        {
            Ok(list) => self.merge_successor_list(&successor, list),
            Err(e) => tracing::debug!(successor = %successor, error = %e, "could not refresh successor list"),
        }
        Ok(())
    }

    /// Clear the predecessor if it no longer answers
    pub async fn check_predecessor(&self) -> Result<()> {
        let predecessor = match self.get_predecessor() {
            Some(p) if p != self.local => p,
            _ => return Ok(()),
        };

        match self.ring_call(&predecessor.address, RingRequest::Ping).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_unavailable() => {
                tracing::info!(node = %self.local, predecessor = %predecessor, "predecessor failed");
                self.clear_predecessor(&predecessor);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Refresh the next finger table entry
    pub async fn fix_fingers(&self) -> Result<()> {
        let index = {
            let mut state = self.state.write();
            let index = state.next_finger;
            state.next_finger = (index + 1) % FINGER_COUNT;
            index
        };

        let node = self.lookup(self.local.key.finger_start(index)).await?;
        let mut state = self.state.write();
        state.fingers[index] = if node == self.local { None } else { Some(node) };
        Ok(())
    }

    /// One stabilize / fix-fingers / check-predecessor round
    pub async fn run_maintenance_round(&self) {
        if let Err(e) = self.stabilize().await {
            tracing::debug!(error = %e, "stabilize failed");
        }
        if let Err(e) = self.fix_fingers().await {
            tracing::debug!(error = %e, "fix_fingers failed");
        }
        if let Err(e) = self.check_predecessor().await {
            tracing::debug!(error = %e, "check_predecessor failed");
        }
    }

    /// Spawn periodic maintenance
    pub fn start_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(node.config.stabilize_interval());
            loop {
                interval.tick().await;
                node.run_maintenance_round().await;
            }
        })
    }

    /// Probe a node's ring endpoint
    pub async fn is_reachable(&self, address: &NodeAddress) -> bool {
        self.ring_call(address, RingRequest::Ping).await.is_ok()
    }

    fn replace_successor(&self, new: NodeRef) {
        let old = {
            let mut state = self.state.write();
            let old = state.successors.first().cloned();
            if old.as_ref() == Some(&new) {
                return;
            }
            state.successors.retain(|n| *n != new);
            state.successors.insert(0, new.clone());
            state.successors.truncate(self.config.successor_list_len.max(1));
            old
        };
        tracing::debug!(node = %self.local, successor = %new, "successor updated");
        self.emit(RingEvent::SuccessorChanged { old, new });
    }

    fn merge_successor_list(&self, successor: &NodeRef, remote: Vec<NodeRef>) {
        let mut state = self.state.write();
        if state.successors.first() != Some(successor) {
            return;
        }
        let mut merged = vec![successor.clone()];
        for node in remote {
            if node != self.local && !merged.contains(&node) {
                merged.push(node);
            }
        }
        merged.truncate(self.config.successor_list_len.max(1));
        state.successors = merged;
    }

    /// Drop a failed node from routing state
    fn forget_node(&self, failed: &NodeRef) {
        if *failed == self.local {
            return;
        }
        let change = {
            let mut state = self.state.write();
            for finger in state.fingers.iter_mut() {
                if finger.as_ref() == Some(failed) {
                    *finger = None;
                }
            }
            let was_first = state.successors.first() == Some(failed);
            state.successors.retain(|n| n != failed);
            if state.successors.is_empty() {
                state.successors.push(self.local.clone());
            }
            if was_first {
                state.successors.first().cloned()
            } else {
                None
            }
        };

        if let Some(new) = change {
            tracing::info!(node = %self.local, failed = %failed, successor = %new, "successor failed");
            self.emit(RingEvent::SuccessorChanged {
                old: Some(failed.clone()),
                new,
            });
        }
    }

    fn clear_predecessor(&self, expected: &NodeRef) {
        {
            let mut state = self.state.write();
            if state.predecessor.as_ref() != Some(expected) {
                return;
            }
            state.predecessor = None;
        }
        self.forget_node(expected);
        self.emit(RingEvent::PredecessorChanged {
            old: Some(expected.clone()),
            new: None,
        });
    }

    fn emit(&self, event: RingEvent) {
        self.metrics.record_ring_event(event.kind());
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::warn!(node = %self.local, event = ?event, "ring event queue full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(node = %self.local, "ring event consumer gone");
            }
        }
    }

    async fn ring_call(&self, target: &NodeAddress, request: RingRequest) -> Result<RpcReply> {
        self.transport
            .call(target, RING_SERVICE, RpcRequest::Ring(request))
            .await
    }

    /// Answer a ring request from another node
    pub fn handle(&self, request: RingRequest) -> RpcReply {
        match request {
            RingRequest::Ping => RpcReply::Unit,
            RingRequest::FindSuccessorStep(key) => RpcReply::Step(self.find_successor_step(key)),
            RingRequest::GetPredecessor => RpcReply::MaybeNode(self.get_predecessor()),
            RingRequest::GetSuccessorList => RpcReply::Nodes(self.successor_list()),
            RingRequest::Notify(candidate) => {
                self.notify(candidate);
                RpcReply::Unit
            }
        }
    }

    pub fn get_statistics(&self) -> RingStats {
        let state = self.state.read();
        RingStats {
            local_address: self.local.address.to_string(),
            local_key: self.local.key.to_string(),
            predecessor: state.predecessor.as_ref().map(|p| p.to_string()),
            successor: state
                .successors
                .first()
                .map(|s| s.to_string())
                .unwrap_or_default(),
            successor_list_len: state.successors.len(),
            known_fingers: state.fingers.iter().flatten().count(),
            lookups: self.lookups.load(Ordering::Relaxed),
        }
    }
}

/// Binds an `OverlayNode` under the `ring` service name
pub struct RingService {
    node: Arc<OverlayNode>,
}

impl RingService {
    pub fn new(node: Arc<OverlayNode>) -> Self {
        Self { node }
    }
}

#[async_trait]
impl RpcService for RingService {
    async fn handle(&self, request: RpcRequest) -> Result<RpcReply> {
        match request {
            RpcRequest::Ring(request) => Ok(self.node.handle(request)),
            other => Err(RingDbError::Internal(format!(
                "ring service cannot handle {} request",
                other.label()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed_memnet::LocalNetwork;
    use crate::distributed_rpc::ServiceRegistry;

    fn spawn_node(network: &Arc<LocalNetwork>, port: u16) -> (Arc<OverlayNode>, mpsc::Receiver<RingEvent>) {
        let address = NodeAddress::new("node", port);
        let metrics = Arc::new(CoordinationMetrics::new().unwrap());
        let transport: Arc<dyn RpcTransport> = network.clone();
        let (node, events) = OverlayNode::new(address.clone(), transport, RingConfig::default(), metrics);
        let registry = Arc::new(ServiceRegistry::new(address.clone()));
        registry.bind(RING_SERVICE, Arc::new(RingService::new(Arc::clone(&node))));
        network.register(address, registry).unwrap();
        (node, events)
    }

    async fn stabilize_all(nodes: &[Arc<OverlayNode>], rounds: usize) {
        for _ in 0..rounds {
            for node in nodes {
                node.stabilize().await.unwrap();
            }
        }
    }

    fn expected_owner(nodes: &[Arc<OverlayNode>], key: OverlayKey) -> NodeAddress {
        let mut keys: Vec<&NodeRef> = nodes.iter().map(|n| n.local()).collect();
        keys.sort_by_key(|n| n.key);
        keys.iter()
            .find(|n| n.key >= key)
            .or_else(|| keys.first())
            .map(|n| n.address.clone())
            .unwrap()
    }

    #[test]
    fn test_range_membership_wraps() {
        let a = OverlayKey(100);
        let b = OverlayKey(200);
        assert!(OverlayKey(150).in_range(a, b));
        assert!(OverlayKey(200).in_range(a, b));
        assert!(!OverlayKey(100).in_range(a, b));

        // Wrapping range (200, 100]
        assert!(OverlayKey(250).in_range(b, a));
        assert!(OverlayKey(5).in_range(b, a));
        assert!(!OverlayKey(150).in_range(b, a));

        // Degenerate range covers the whole ring
        assert!(OverlayKey(1).in_range(a, a));
        assert!(!a.in_open_range(a, a));
        assert!(OverlayKey(1).in_open_range(a, a));
    }

    #[test]
    fn test_key_hashing_is_stable() {
        let k1 = OverlayKey::for_name(SYSTEM_TABLE_KEY_NAME);
        let k2 = OverlayKey::for_name(SYSTEM_TABLE_KEY_NAME);
        assert_eq!(k1, k2);
        assert_ne!(k1, OverlayKey::for_address(&NodeAddress::new("a", 1)));
        assert_eq!(OverlayKey(u64::MAX).finger_start(0), OverlayKey(0));
    }

    #[tokio::test]
    async fn test_single_node_owns_everything() {
        let network = LocalNetwork::new();
        let (node, _events) = spawn_node(&network, 1);
        node.create();

        assert!(node.in_local_key_range(OverlayKey(42)));
        let owner = node.lookup(OverlayKey::for_name(SYSTEM_TABLE_KEY_NAME)).await.unwrap();
        assert_eq!(owner, *node.local());
    }

    #[tokio::test]
    async fn test_two_nodes_converge() {
        let network = LocalNetwork::new();
        let (a, mut a_events) = spawn_node(&network, 1);
        let (b, _b_events) = spawn_node(&network, 2);
        a.create();
        b.join(&a.local().address).await.unwrap();

        stabilize_all(&[a.clone(), b.clone()], 3).await;

        assert_eq!(a.get_successor(), *b.local());
        assert_eq!(b.get_successor(), *a.local());
        assert_eq!(a.get_predecessor(), Some(b.local().clone()));
        assert_eq!(b.get_predecessor(), Some(a.local().clone()));

        let mut saw_predecessor_change = false;
        while let Ok(event) = a_events.try_recv() {
            if matches!(event, RingEvent::PredecessorChanged { new: Some(ref n), .. } if n == b.local()) {
                saw_predecessor_change = true;
            }
        }
        assert!(saw_predecessor_change);
    }

    #[tokio::test]
    async fn test_lookups_agree_across_ring() {
        let network = LocalNetwork::new();
        let nodes: Vec<Arc<OverlayNode>> = (1..=4).map(|port| spawn_node(&network, port).0).collect();
        nodes[0].create();
        for node in &nodes[1..] {
            node.join(&nodes[0].local().address).await.unwrap();
            stabilize_all(&nodes, 2).await;
        }
        stabilize_all(&nodes, 4).await;

        for name in ["systemTable", "PUBLIC.ORDERS", "x", "y"] {
            let key = OverlayKey::for_name(name);
            let expected = expected_owner(&nodes, key);
            for node in &nodes {
                assert_eq!(node.lookup(key).await.unwrap().address, expected);
            }
        }
    }

    #[tokio::test]
    async fn test_join_dead_host_fails_fast() {
        let network = LocalNetwork::new();
        let (node, _events) = spawn_node(&network, 1);
        let err = node.join(&NodeAddress::new("node", 99)).await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_check_predecessor_clears_failed_node() {
        let network = LocalNetwork::new();
        let (a, _a_events) = spawn_node(&network, 1);
        let (b, mut b_events) = spawn_node(&network, 2);
        a.create();
        b.join(&a.local().address).await.unwrap();
        stabilize_all(&[a.clone(), b.clone()], 3).await;
        while b_events.try_recv().is_ok() {}

        network.crash(&a.local().address);
        b.check_predecessor().await.unwrap();

        assert_eq!(b.get_predecessor(), None);
        assert_eq!(b.get_successor(), *b.local());
        assert!(b.in_local_key_range(OverlayKey::for_name(SYSTEM_TABLE_KEY_NAME)));

        let mut events = Vec::new();
        while let Ok(event) = b_events.try_recv() {
            events.push(event);
        }
        assert!(events.contains(&RingEvent::PredecessorChanged {
            old: Some(a.local().clone()),
            new: None,
        }));
    }
}
