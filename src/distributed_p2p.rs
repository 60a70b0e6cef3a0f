//! TCP Transport for Inter-Instance RPC
//!
//! Implements the `RpcTransport` contract over plain TCP so instances on
//! different machines can reach each other's services.
//!
//! Features:
//! - Async TCP communication using Tokio
//! - Frames are a 4-byte big-endian length followed by a bincode body
//! - Connect and call timeouts, bounded retry of failed connects
//! - Remote application faults come back unchanged; only I/O problems
//!   surface as transport faults

use crate::config::RpcConfig;
use crate::distributed_rpc::{RpcEnvelope, RpcReply, RpcRequest, RpcTransport, ServiceRegistry};
use crate::error::{Result, RingDbError};
use crate::types::NodeAddress;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

type WireReply = std::result::Result<RpcReply, RingDbError>;

fn frame_too_large(len: usize, max_frame_bytes: usize) -> bool {
    len > max_frame_bytes || u32::try_from(len).is_err()
}

async fn write_frame(stream: &mut TcpStream, body: &[u8], max_frame_bytes: usize) -> std::io::Result<()> {
    let len = match u32::try_from(body.len()) {
        Ok(len) if body.len() <= max_frame_bytes => len,
        _ => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("frame of {} bytes exceeds limit {}", body.len(), max_frame_bytes),
            ))
        }
    };
    stream.write_u32(len).await?;
    stream.write_all(body).await?;
    stream.flush().await
}

async fn read_frame(stream: &mut TcpStream, max_frame_bytes: usize) -> std::io::Result<Vec<u8>> {
    let len = stream.read_u32().await? as usize;
    if len > max_frame_bytes {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit {}", len, max_frame_bytes),
        ));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

/// Client side TCP transport
pub struct TcpTransport {
    config: RpcConfig,
    calls: AtomicU64,
    failures: AtomicU64,
}

impl TcpTransport {
    pub fn new(config: RpcConfig) -> Self {
        Self {
            config,
            calls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    async fn connect(&self, target: &NodeAddress) -> Result<TcpStream> {
        let addr = target.to_string();
        tokio::time::timeout(
            Duration::from_millis(self.config.connect_timeout_ms),
            TcpStream::connect(&addr),
        )
        .await
        .map_err(|_| RingDbError::transport(&addr, "connection timeout"))?
        .map_err(|e| RingDbError::transport(&addr, e))
    }

    async fn exchange(&self, target: &NodeAddress, mut stream: TcpStream, body: &[u8]) -> Result<RpcReply> {
        let max_frame = self.config.max_frame_bytes;
        let round_trip = async {
            write_frame(&mut stream, body, max_frame).await?;
            read_frame(&mut stream, max_frame).await
        };

        let bytes = tokio::time::timeout(Duration::from_millis(self.config.call_timeout_ms), round_trip)
            .await
            .map_err(|_| RingDbError::transport(target, "response timeout"))?
            .map_err(|e| RingDbError::transport(target, e))?;

        let reply: WireReply = bincode::deserialize(&bytes)?;
        reply
    }

    pub fn get_stats(&self) -> TransportStats {
        TransportStats {
            calls: self.calls.load(Ordering::Relaxed),
            transport_failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl RpcTransport for TcpTransport {
    async fn call(&self, target: &NodeAddress, service: &str, request: RpcRequest) -> Result<RpcReply> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let envelope = RpcEnvelope {
            service: service.to_string(),
            request,
        };
        let body = bincode::serialize(&envelope)?;
        if frame_too_large(body.len(), self.config.max_frame_bytes) {
            return Err(RingDbError::Serialization(format!(
                "request of {} bytes for {} exceeds frame limit {}",
                body.len(),
                service,
                self.config.max_frame_bytes
            )));
        }

        // Only connection establishment is retried; once bytes are on the
        // wire the call may have taken effect remotely.
        let mut last_error = RingDbError::transport(target, "no connection attempt made");
        for attempt in 0..=self.config.max_retries {
            match self.connect(target).await {
                Ok(stream) => {
                    let result = self.exchange(target, stream, &body).await;
                    if matches!(&result, Err(e) if e.is_transport()) {
                        self.failures.fetch_add(1, Ordering::Relaxed);
                    }
                    return result;
                }
                Err(e) => {
                    tracing::debug!(target = %target, attempt, error = %e, "connect failed");
                    last_error = e;
                }
            }
        }

        self.failures.fetch_add(1, Ordering::Relaxed);
        Err(last_error)
    }
}

/// Transport statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportStats {
    pub calls: u64,
    pub transport_failures: u64,
}

/// Server side: accepts connections and dispatches frames to a registry
pub struct TcpRpcServer {
    local_address: NodeAddress,
    handle: JoinHandle<()>,
}

impl TcpRpcServer {
    /// Bind `address` and start serving `registry`. Port 0 picks a free port.
    pub async fn bind(address: &NodeAddress, registry: Arc<ServiceRegistry>, config: RpcConfig) -> Result<Self> {
        let listener = TcpListener::bind(address.to_string())
            .await
            .map_err(|e| RingDbError::Io(format!("failed to bind {}: {}", address, e)))?;
        let port = listener.local_addr()?.port();
        let local_address = NodeAddress::new(address.host.clone(), port);

        tracing::info!(address = %local_address, "RPC server listening");

        let max_frame = config.max_frame_bytes;
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let registry = Arc::clone(&registry);
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, registry, max_frame).await {
                                tracing::debug!(peer = %peer, error = %e, "connection closed with error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to accept connection");
                    }
                }
            }
        });

        Ok(Self { local_address, handle })
    }

    pub fn local_address(&self) -> &NodeAddress {
        &self.local_address
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for TcpRpcServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_connection(mut stream: TcpStream, registry: Arc<ServiceRegistry>, max_frame: usize) -> Result<()> {
    loop {
        let bytes = match read_frame(&mut stream, max_frame).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let reply: WireReply = match bincode::deserialize::<RpcEnvelope>(&bytes) {
            Ok(envelope) => registry.dispatch(&envelope.service, envelope.request).await,
            Err(e) => Err(RingDbError::Serialization(e.to_string())),
        };

        let mut body = bincode::serialize(&reply)?;
        if frame_too_large(body.len(), max_frame) {
            let refusal: WireReply = Err(RingDbError::Serialization(format!(
                "reply of {} bytes exceeds frame limit {}",
                body.len(),
                max_frame
            )));
            body = bincode::serialize(&refusal)?;
        }
        write_frame(&mut stream, &body, max_frame).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed_rpc::{RingRequest, RpcService, SystemTableRequest, RING_SERVICE};

    struct Pinger;

    #[async_trait]
    impl RpcService for Pinger {
        async fn handle(&self, request: RpcRequest) -> Result<RpcReply> {
            match request {
                RpcRequest::Ring(RingRequest::Ping) => Ok(RpcReply::Unit),
                _ => Err(RingDbError::Sql("unsupported".to_string())),
            }
        }
    }

    async fn start_server() -> TcpRpcServer {
        let registry = Arc::new(ServiceRegistry::new(NodeAddress::new("127.0.0.1", 0)));
        registry.bind(RING_SERVICE, Arc::new(Pinger));
        TcpRpcServer::bind(&NodeAddress::new("127.0.0.1", 0), registry, RpcConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_call_over_tcp() {
        let server = start_server().await;
        let transport = TcpTransport::new(RpcConfig::default());

        let reply = transport
            .call(server.local_address(), RING_SERVICE, RpcRequest::Ring(RingRequest::Ping))
            .await
            .unwrap();
        assert!(reply.into_unit().is_ok());
        assert_eq!(transport.get_stats().calls, 1);
    }

    #[tokio::test]
    async fn test_application_fault_is_not_transport() {
        let server = start_server().await;
        let transport = TcpTransport::new(RpcConfig::default());

        let err = transport
            .call(server.local_address(), RING_SERVICE, RpcRequest::Ring(RingRequest::GetPredecessor))
            .await
            .unwrap_err();
        assert_eq!(err, RingDbError::Sql("unsupported".to_string()));

        let err = transport
            .call(
                server.local_address(),
                "system_table",
                RpcRequest::SystemTable(SystemTableRequest::CheckConnection),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RingDbError::ServiceNotBound { .. }));
    }

    #[tokio::test]
    async fn test_refused_connection_is_transport_fault() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = RpcConfig {
            max_retries: 1,
            ..Default::default()
        };
        let transport = TcpTransport::new(config);
        let err = transport
            .call(&NodeAddress::new("127.0.0.1", port), RING_SERVICE, RpcRequest::Ring(RingRequest::Ping))
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert_eq!(transport.get_stats().transport_failures, 1);
    }

    #[tokio::test]
    async fn test_oversized_request_refused_before_sending() {
        let server = start_server().await;
        let transport = TcpTransport::new(RpcConfig {
            max_frame_bytes: 4,
            ..RpcConfig::default()
        });

        let err = transport
            .call(server.local_address(), RING_SERVICE, RpcRequest::Ring(RingRequest::Ping))
            .await
            .unwrap_err();
        assert!(matches!(err, RingDbError::Serialization(_)));
        assert!(!err.is_transport());
        assert_eq!(transport.get_stats().transport_failures, 0);
    }
}
