//! # Connections
//!
//! One connection per remote endpoint. Each owns two tasks: a receive task
//! copying transport chunks into a byte queue, and a pump task reading frames
//! off that queue and handing each message to dispatch.
//!
//! ## Return paths
//!
//! Every inbound message with a return path gets the sender's endpoint pushed
//! onto it, so replies find their way back even when the sender does not know
//! its own public address. Over IPv6 the sender records its own hop instead.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use dashmap::DashMap;

use crate::dispatch::Step;
use crate::dispatch::Walk;
use crate::error::Error;
use crate::error::Result;
use crate::framing;
use crate::framing::Frame;
use crate::link::Link;
use crate::message::LinkMessage;
use crate::registry::LinkAction;
use crate::runtime::Runtime;
use crate::runtime::WeakRuntime;
use crate::stream::ByteQueue;
use crate::transport::Transport;

pub struct Connection {
    remote: SocketAddr,
    local: Option<SocketAddr>,
    transport: Arc<dyn Transport>,
    closed: AtomicBool,
    runtime: WeakRuntime,
}

impl Connection {
    /// Sends our handshake, registers the connection and starts reading from it.
    pub(crate) async fn start(
        runtime: &Runtime,
        transport: Arc<dyn Transport>,
        remote: SocketAddr,
        local: Option<SocketAddr>,
    ) -> Result<Arc<Self>> {
        let (major, minor) = runtime.config().version;
        transport.send(&framing::handshake(major, minor)).await?;

        let connection = Arc::new(Self {
            remote,
            local,
            transport: transport.clone(),
            closed: AtomicBool::new(false),
            runtime: runtime.downgrade(),
        });
        runtime.connections().insert(connection.clone());
        tracing::debug!(%remote, "connection opened");

        let queue = Arc::new(ByteQueue::new());
        tokio::spawn(Self::receive(transport, queue.clone()));
        tokio::spawn(connection.clone().pump(queue));
        Ok(connection)
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn local(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn write(&self, message: &LinkMessage) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let bytes = message.encode()?;
        self.transport.send(&bytes).await?;
        Ok(())
    }

    /// Tells the peer we are done and releases the transport.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.transport.send(&[0x00]).await {
            tracing::debug!(remote = %self.remote, %e, "end frame not sent");
        }
        self.release().await;
    }

    async fn release(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.connections().remove(self);
        }
        if let Err(e) = self.transport.close().await {
            tracing::debug!(remote = %self.remote, %e, "transport close failed");
        }
        tracing::debug!(remote = %self.remote, "connection closed");
    }

    async fn receive(transport: Arc<dyn Transport>, queue: Arc<ByteQueue>) {
        loop {
            match transport.recv().await {
                Ok(Some(chunk)) => queue.push(&chunk),
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(%e, "receive failed");
                    break;
                }
            }
        }
        queue.close();
    }

    async fn pump(self: Arc<Self>, queue: Arc<ByteQueue>) {
        if let Err(e) = self.read_frames(&queue).await {
            if let Some(runtime) = self.runtime.upgrade() {
                runtime.report("connection", &e);
            }
        }
        self.release().await;
    }

    async fn read_frames(&self, queue: &ByteQueue) -> Result<()> {
        let Some(theirs) = queue.read_exact(8).await else {
            return Ok(());
        };
        let readers = {
            let runtime = self.runtime.runtime()?;
            let (major, minor) = runtime.config().version;
            framing::check_handshake(&theirs, major, minor)?;
            runtime.readers().clone()
        };

        loop {
            let Some(frame) = framing::read_frame(queue, &readers).await? else {
                return Ok(());
            };
            match frame {
                Frame::End => return Ok(()),
                Frame::Message(mut message) => {
                    if let (Some(from), true) = (message.path_from.as_mut(), self.remote.is_ipv4()) {
                        from.push(Link::internet(self.remote));
                    }
                    tracing::trace!(remote = %self.remote, "message received");
                    self.runtime.runtime()?.spawn_dispatch(message);
                }
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote", &self.remote)
            .field("local", &self.local)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Live connections by remote endpoint.
#[derive(Default)]
pub(crate) struct Connections {
    table: DashMap<SocketAddr, Arc<Connection>>,
    connecting: tokio::sync::Mutex<()>,
}

impl Connections {
    pub fn find(&self, endpoint: SocketAddr) -> Option<Arc<Connection>> {
        self.table.get(&endpoint).map(|entry| entry.clone()).filter(|c| !c.is_closed())
    }

    fn insert(&self, connection: Arc<Connection>) {
        self.table.insert(connection.remote, connection);
    }

    fn remove(&self, connection: &Connection) {
        self.table.remove_if(&connection.remote, |_, held| std::ptr::eq(Arc::as_ptr(held), connection));
    }

    /// The connection to `endpoint`, opened through the runtime's connector if needed.
    pub async fn obtain(&self, runtime: &Runtime, endpoint: SocketAddr) -> Result<Arc<Connection>> {
        if let Some(connection) = self.find(endpoint) {
            return Ok(connection);
        }
        let _connecting = self.connecting.lock().await;
        if let Some(connection) = self.find(endpoint) {
            return Ok(connection);
        }
        tracing::debug!(%endpoint, "connecting");
        let transport = runtime.connector().connect(endpoint).await?;
        Connection::start(runtime, Arc::from(transport), endpoint, None).await
    }

    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.table.iter().map(|entry| entry.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }
}

/// Moves a message to the next runtime along its path.
pub(crate) struct InternetAction;

#[async_trait::async_trait]
impl LinkAction for InternetAction {
    async fn act(&self, runtime: &Runtime, walk: &mut Walk, link: Link) -> Result<Step> {
        let Link::Internet(internet) = link else {
            return Err(Error::implementation("Internet action given another link"));
        };
        let endpoint = internet.endpoint;
        if runtime.is_local_endpoint(endpoint) {
            return Ok(Step::Skip);
        }
        let connection = match runtime.connections().find(endpoint) {
            Some(connection) => connection,
            None if walk.message.forceful => runtime
                .connections()
                .obtain(runtime, endpoint)
                .await
                .map_err(|e| Error::protocol(format!("Unable to reach {}: {}", endpoint, e)))?,
            None => {
                tracing::debug!(%endpoint, "no connection; message dropped");
                return Ok(Step::Stop);
            }
        };
        walk.message.path_to.pop()?;
        if endpoint.is_ipv6() {
            if let (Some(from), Some(local)) = (walk.message.path_from.as_mut(), connection.local()) {
                from.push(Link::internet(local));
            }
        }
        connection
            .write(&walk.message)
            .await
            .map_err(|e| Error::protocol(format!("Unable to send to {}: {}", endpoint, e)))?;
        Ok(Step::Stop)
    }
}
