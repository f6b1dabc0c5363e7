//! # Morph
//!
//! A link-chain RPC runtime. Every message is a stack of typed links walked
//! one at a time: transport hops, then a service or apartment, then a servlet,
//! then a member and its arguments. Replies travel back along the return path
//! each hop records on the way in.
//!
//! ## Layout
//!
//! - **Links and stacks**: `link`, `stack`, `message`, with leaf encoding in `morphwire`.
//! - **Dispatch**: `registry` maps link types to actions; `dispatch` walks a message.
//! - **Server side**: `service`, `apartment`, `object`, `params`.
//! - **Client side**: `device`, `proxy`, `servlet_proxy`, `waits`.
//! - **Ordering**: `sequence` delivers one client's messages in order.
//! - **Transport**: `connection`, `framing`, `stream`, `tcp`, `mock_transport`.
//!
//! ## Example
//!
//! ```no_run
//! use morph::{ObjectBuilder, Runtime, ServiceDef, Value};
//!
//! # async fn demo() -> morph::Result<()> {
//! let greeter = ObjectBuilder::new()
//!     .method("Greet", |call| Ok(Value::String(format!("hello {}", call.str(0)?))))
//!     .build();
//! let runtime = Runtime::builder().service(ServiceDef::shared("Greeter", greeter)).build()?;
//! let proxy = runtime.via_local("Greeter").await?;
//! let reply = proxy.default_servlet().call("Greet", &[Value::from("you")]).await?;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

use std::sync::Mutex;
use std::sync::MutexGuard;

mod apartment;
mod builder;
mod connection;
mod device;
mod dispatch;
mod error;
mod framing;
mod ids;
mod link;
mod message;
mod object;
mod path;
mod proxy;
mod registry;
mod runtime;
mod sequence;
mod service;
mod servlet_proxy;
mod stack;
mod stream;
mod tcp;
mod transport;
mod waits;

pub mod mock_transport;
pub mod params;

#[cfg(test)]
mod tests;

pub use crate::error::CODE_ANY;
pub use crate::error::CODE_NONE;
pub use crate::error::Error;
pub use crate::error::Fault;
pub use crate::error::PROTOCOL_CLASS_NAME;
pub use crate::error::RemoteError;
pub use crate::error::Result;

pub use crate::ids::ApartmentId;
pub use crate::ids::ApartmentProxyId;
pub use crate::ids::SenderId;
pub use crate::ids::SequenceId;
pub use crate::ids::ServletId;

pub use crate::link::DEFAULT_PORT;
pub use crate::link::Link;
pub use crate::link::LinkData;
pub use crate::link::LinkInternet;
pub use crate::link::LinkMember;
pub use crate::link::LinkSequence;
pub use crate::link::LinkService;
pub use crate::link::MemberKind;
pub use crate::message::LinkMessage;
pub use crate::stack::LinkStack;

pub use crate::path::collapse;
pub use crate::path::device_path_of;
pub use crate::path::endpoint_path_of;

pub use crate::dispatch::Context;
pub use crate::dispatch::Step;
pub use crate::dispatch::Walk;
pub use crate::registry::LinkAction;
pub use crate::registry::LinkReaders;
pub use crate::registry::LinkRegistry;
pub use crate::registry::ReadFn;

pub use crate::apartment::Apartment;
pub use crate::apartment::Servlet;
pub use crate::apartment::Servlets;
pub use crate::object::Handler;
pub use crate::object::HandlerResult;
pub use crate::object::Invocation;
pub use crate::object::Object;
pub use crate::object::ObjectBuilder;
pub use crate::object::PANIC_CLASS_NAME;
pub use crate::params::InstanceFactories;
pub use crate::params::Value;
pub use crate::service::ObjectFactory;
pub use crate::service::SequenceLevel;
pub use crate::service::ServiceDef;

pub use crate::device::Device;
pub use crate::device::Devices;
pub use crate::proxy::ApartmentProxy;
pub use crate::servlet_proxy::ServletProxy;

pub use crate::sequence::SequenceReceiver;
pub use crate::sequence::SequenceSender;

pub use crate::builder::RuntimeBuilder;
pub use crate::connection::Connection;
pub use crate::runtime::Config;
pub use crate::runtime::ErrorHook;
pub use crate::runtime::Runtime;
pub use crate::runtime::WeakRuntime;
pub use crate::tcp::Listener;
pub use crate::tcp::TcpConnector;
pub use crate::tcp::TcpTransport;
pub use crate::transport::Connector;
pub use crate::transport::Transport;
pub use crate::transport::TransportError;

/// Locks a table mutex. Holders never panic while mutating, so a poisoned
/// lock still guards consistent data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
