//! In-Process Network
//!
//! An `RpcTransport` that routes calls straight to the `ServiceRegistry` of
//! another instance living in the same process. Used by tests and embedded
//! clusters; it doubles as the node registry those clusters share.
//!
//! Faults can be injected per address:
//! - `crash` removes the instance as if its process died
//! - `set_unreachable` keeps the instance but refuses every call to it

use crate::distributed_rpc::{RpcReply, RpcRequest, RpcTransport, ServiceRegistry};
use crate::error::{Result, RingDbError};
use crate::types::NodeAddress;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared in-process node registry and transport
#[derive(Default)]
pub struct LocalNetwork {
    nodes: DashMap<NodeAddress, Arc<ServiceRegistry>>,
    unreachable: DashSet<NodeAddress>,
    calls: AtomicU64,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a registry at `address`; fails if the address is taken
    pub fn register(&self, address: NodeAddress, registry: Arc<ServiceRegistry>) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        match self.nodes.entry(address) {
            Entry::Occupied(entry) => Err(RingDbError::Io(format!("address {} already in use", entry.key()))),
            Entry::Vacant(entry) => {
                entry.insert(registry);
                Ok(())
            }
        }
    }

    pub fn deregister(&self, address: &NodeAddress) {
        self.nodes.remove(address);
    }

    pub fn is_registered(&self, address: &NodeAddress) -> bool {
        self.nodes.contains_key(address)
    }

    /// Simulate the process at `address` dying
    pub fn crash(&self, address: &NodeAddress) {
        tracing::info!(address = %address, "simulated crash");
        self.nodes.remove(address);
    }

    /// Refuse (or stop refusing) calls to `address`
    pub fn set_unreachable(&self, address: &NodeAddress, unreachable: bool) {
        if unreachable {
            self.unreachable.insert(address.clone());
        } else {
            self.unreachable.remove(address);
        }
    }

    pub fn registry(&self, address: &NodeAddress) -> Option<Arc<ServiceRegistry>> {
        self.nodes.get(address).map(|entry| Arc::clone(entry.value()))
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RpcTransport for LocalNetwork {
    async fn call(&self, target: &NodeAddress, service: &str, request: RpcRequest) -> Result<RpcReply> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        if self.unreachable.contains(target) {
            return Err(RingDbError::transport(target, "connection refused"));
        }
        let registry = self
            .registry(target)
            .ok_or_else(|| RingDbError::transport(target, "connection refused"))?;

        registry.dispatch(service, request).await
    }
}
