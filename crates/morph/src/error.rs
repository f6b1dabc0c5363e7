//! # Errors
//!
//! One error type for the whole runtime, split the way failures are handled:
//!
//! - **Protocol**: bad frames, unknown apartments, servlets or members. Caught by the
//!   dispatcher and turned into an error reply when the message has a return path.
//! - **Remote**: an application fault raised on the far side, rebuilt locally.
//! - **Timeout**: no reply in time. Never retried by the runtime.
//! - **Implementation**: broken internal invariants. Reported to the error hooks.
//! - **Usage**: caller misuse, returned straight to the caller.

use std::fmt;

use crate::transport::TransportError;

/// Error code carried by protocol errors that have no specific code.
pub const CODE_ANY: i32 = -1;
/// Error code meaning "no code".
pub const CODE_NONE: i32 = 0;

/// Class name given to protocol errors when they travel as exception payloads.
pub const PROTOCOL_CLASS_NAME: &str = "MorphError";

#[derive(Debug, Clone)]
pub enum Error {
    Protocol { code: i32, message: String },
    Remote(RemoteError),
    Timeout,
    Implementation(String),
    Usage(String),
    Transport(TransportError),
    Wire(morphwire::Error),
    /// The runtime, proxy or connection has been shut down.
    Closed,
}

impl Error {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol { code: CODE_ANY, message: message.into() }
    }

    pub fn protocol_code(code: i32, message: impl Into<String>) -> Self {
        Self::Protocol { code, message: message.into() }
    }

    pub fn implementation(message: impl Into<String>) -> Self {
        Self::Implementation(message.into())
    }

    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage(message.into())
    }

    /// Numeric code sent along with an exception payload.
    pub fn code(&self) -> i32 {
        match self {
            Self::Protocol { code, .. } => *code,
            Self::Remote(remote) => remote.code,
            _ => CODE_ANY,
        }
    }

    /// True for failures the dispatcher answers with an error reply.
    pub fn is_replyable(&self) -> bool {
        matches!(self, Self::Protocol { .. } | Self::Wire(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol { message, .. } => write!(f, "{}", message),
            Self::Remote(remote) => write!(f, "{}", remote),
            Self::Timeout => write!(f, "Timeout"),
            Self::Implementation(message) => write!(f, "Morph implementation error: {}", message),
            Self::Usage(message) => write!(f, "Usage error: {}", message),
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Wire(e) => write!(f, "Wire error: {}", e),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

impl std::error::Error for Error {}

impl From<morphwire::Error> for Error {
    fn from(e: morphwire::Error) -> Self {
        Self::Wire(e)
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// An application fault rebuilt on the calling side.
///
/// `trace` is the remote trace followed by the hops the reply travelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub code: i32,
    pub class_name: String,
    pub message: String,
    pub trace: String,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// A failure raised by application code inside a servlet handler.
///
/// Faults travel back to the caller verbatim as exception payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub class_name: String,
    pub message: String,
    pub trace: String,
}

impl Fault {
    pub fn new(class_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self { class_name: class_name.into(), message: message.into(), trace: String::new() }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = trace.into();
        self
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class_name, self.message)
    }
}

impl std::error::Error for Fault {}

/// Lets handlers use `?` on runtime calls; the error becomes a protocol fault.
impl From<Error> for Fault {
    fn from(e: Error) -> Self {
        match e {
            Error::Remote(remote) => Fault {
                class_name: remote.class_name,
                message: remote.message,
                trace: remote.trace,
            },
            other => Fault::new(PROTOCOL_CLASS_NAME, other.to_string()),
        }
    }
}
