//! # Transport Abstraction
//!
//! A minimal, async interface for moving bytes between runtimes.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: The Transport knows nothing about links, messages or framing.
//!   It moves opaque buffers. Chunk boundaries carry no meaning.
//! - **Duplex**: Either side may send at any time. Replies are ordinary messages routed
//!   by their own paths, not responses to a particular `send`.

use std::fmt;
use std::net::SocketAddr;

/// Errors that occur at the network/transport layer.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// The peer is unreachable or the connection was dropped.
    ConnectionLost(String),
    /// Nobody accepted the connection.
    Refused(String),
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::Refused(msg) => write!(f, "Connection refused: {}", msg),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// A bidirectional byte pipe to one peer.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends bytes to the peer.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Waits for the next chunk of bytes. `Ok(None)` means the peer closed.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Releases the underlying resource. Later sends fail.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Opens transports to remote endpoints on demand.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: SocketAddr) -> Result<Box<dyn Transport>>;
}
