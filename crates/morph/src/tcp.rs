//! TCP transport, the default connector, and listening for inbound connections.

use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::connection::Connection;
use crate::error::Result;
use crate::runtime::Runtime;
use crate::transport;
use crate::transport::Connector;
use crate::transport::Transport;
use crate::transport::TransportError;

const READ_CHUNK: usize = 64 * 1024;

pub struct TcpTransport {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%e, "could not disable Nagle");
        }
        let (reader, writer) = stream.into_split();
        Self { reader: Mutex::new(reader), writer: Mutex::new(writer) }
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        self.writer.lock().await.write_all(payload).await.map_err(|e| TransportError::ConnectionLost(e.to_string()))
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        let mut buf = vec![0; READ_CHUNK];
        let n = self.reader.lock().await.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf))
    }

    async fn close(&self) -> transport::Result<()> {
        self.writer.lock().await.shutdown().await?;
        Ok(())
    }
}

/// Opens plain TCP connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait::async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: SocketAddr) -> transport::Result<Box<dyn Transport>> {
        let stream = TcpStream::connect(endpoint).await.map_err(|e| TransportError::Refused(e.to_string()))?;
        Ok(Box::new(TcpTransport::new(stream)))
    }
}

/// Accepts connections until stopped.
pub struct Listener {
    local_addr: SocketAddr,
    stop: Arc<Notify>,
    task: JoinHandle<()>,
}

impl Listener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(self) {
        self.stop.notify_one();
        let _ = self.task.await;
    }
}

impl Runtime {
    /// Listens for peers on `addr`; its endpoint then counts as local.
    pub async fn listen(&self, addr: SocketAddr) -> Result<Listener> {
        let listener = TcpListener::bind(addr).await.map_err(TransportError::from)?;
        let local_addr = listener.local_addr().map_err(TransportError::from)?;
        self.add_local_endpoint(local_addr);
        if local_addr.ip().is_unspecified() {
            self.add_local_endpoint(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), local_addr.port()));
        }
        tracing::info!(%local_addr, "listening");

        let stop = Arc::new(Notify::new());
        let runtime = self.downgrade();
        let task = tokio::spawn({
            let stop = stop.clone();
            async move {
                loop {
                    tokio::select! {
                        _ = stop.notified() => break,
                        accepted = listener.accept() => {
                            let (stream, remote) = match accepted {
                                Ok(accepted) => accepted,
                                Err(e) => {
                                    tracing::warn!(%e, "accept failed");
                                    continue;
                                }
                            };
                            let Some(runtime) = runtime.upgrade() else {
                                break;
                            };
                            let local = stream.local_addr().ok();
                            let transport = Arc::new(TcpTransport::new(stream));
                            if let Err(e) = Connection::start(&runtime, transport, remote, local).await {
                                runtime.report("accept", &e);
                            }
                        }
                    }
                }
                tracing::info!(%local_addr, "listener stopped");
            }
        });
        Ok(Listener { local_addr, stop, task })
    }
}
