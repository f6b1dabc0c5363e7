//! In-memory transports for tests.
//!
//! A [`MemoryNetwork`] lets several runtimes in one process reach each other
//! by socket address without opening sockets.

use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicU16;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::sync::mpsc;

use crate::connection::Connection;
use crate::lock;
use crate::runtime::Runtime;
use crate::runtime::WeakRuntime;
use crate::transport;
use crate::transport::Connector;
use crate::transport::Transport;
use crate::transport::TransportError;

/// A duplex channel transport using tokio mpsc channels.
///
/// Bytes sent on one end appear on the other end's `recv()`.
pub struct DuplexChannelTransport {
    tx: StdMutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl DuplexChannelTransport {
    /// Creates a pair of transports connected to each other.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let a = Self { tx: StdMutex::new(Some(tx_a)), rx: Mutex::new(rx_b) };
        let b = Self { tx: StdMutex::new(Some(tx_b)), rx: Mutex::new(rx_a) };
        (a, b)
    }
}

#[async_trait::async_trait]
impl Transport for DuplexChannelTransport {
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        match lock(&self.tx).as_ref() {
            Some(tx) => tx
                .send(payload.to_vec())
                .map_err(|_| TransportError::ConnectionLost("Channel closed".into())),
            None => Err(TransportError::ConnectionLost("Transport closed".into())),
        }
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        Ok(self.rx.lock().await.recv().await)
    }

    async fn close(&self) -> transport::Result<()> {
        lock(&self.tx).take();
        Ok(())
    }
}

#[derive(Default)]
struct NetworkInner {
    hosts: DashMap<SocketAddr, WeakRuntime>,
    next_port: AtomicU16,
}

/// Runtimes reachable from each other by address, all in memory.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        let network = Self::default();
        network.inner.next_port.store(40000, Ordering::Relaxed);
        network
    }

    /// Makes `runtime` reachable at `endpoint` and lets it connect to the
    /// other hosts from `endpoint`'s address.
    pub fn host(&self, runtime: &Runtime, endpoint: SocketAddr) {
        self.inner.hosts.insert(endpoint, runtime.downgrade());
        runtime.add_local_endpoint(endpoint);
        runtime.set_connector(MemoryConnector {
            network: self.clone(),
            local_ip: endpoint.ip(),
            runtime: runtime.downgrade(),
        });
    }

    /// Makes `endpoint` unreachable; existing connections stay open.
    pub fn unhost(&self, endpoint: SocketAddr) {
        self.inner.hosts.remove(&endpoint);
    }
}

pub struct MemoryConnector {
    network: MemoryNetwork,
    local_ip: IpAddr,
    runtime: WeakRuntime,
}

#[async_trait::async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, endpoint: SocketAddr) -> transport::Result<Box<dyn Transport>> {
        let server = self
            .network
            .inner
            .hosts
            .get(&endpoint)
            .and_then(|entry| entry.upgrade())
            .ok_or_else(|| TransportError::Refused(format!("Nobody listens on {}", endpoint)))?;
        let port = self.network.inner.next_port.fetch_add(1, Ordering::Relaxed);
        let client_addr = SocketAddr::new(self.local_ip, port);
        if let Some(client) = self.runtime.upgrade() {
            client.add_local_endpoint(client_addr);
        }

        let (client_side, server_side) = DuplexChannelTransport::pair();
        Connection::start(&server, Arc::new(server_side), client_addr, Some(endpoint))
            .await
            .map_err(|e| TransportError::Refused(e.to_string()))?;
        Ok(Box::new(client_side))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplex_pair() {
        let (a, b) = DuplexChannelTransport::pair();
        a.send(b"ping").await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Some(b"ping".to_vec()));
        b.send(b"pong").await.unwrap();
        assert_eq!(a.recv().await.unwrap(), Some(b"pong".to_vec()));
    }

    #[tokio::test]
    async fn test_close_ends_peer_stream() {
        let (a, b) = DuplexChannelTransport::pair();
        a.close().await.unwrap();
        assert!(a.send(b"late").await.is_err());
        assert_eq!(b.recv().await.unwrap(), None);
    }
}
