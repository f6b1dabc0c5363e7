//! # Objects
//!
//! Servlets dispatch members through a registration table built once per
//! object: method name to handler, property name to getter and setter. Names
//! are matched without regard to case.
//!
//! Handlers receive an [`Invocation`] and return a [`Value`] or a [`Fault`]. A
//! fault travels back to the caller as an exception; a missing member is a
//! protocol error.

use std::collections::HashMap;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::apartment::Apartment;
use crate::apartment::Servlet;
use crate::dispatch::Walk;
use crate::dispatch::reply_to;
use crate::error::CODE_NONE;
use crate::error::Error;
use crate::error::Fault;
use crate::error::PROTOCOL_CLASS_NAME;
use crate::error::Result;
use crate::link::LinkData;
use crate::link::LinkMember;
use crate::link::MemberKind;
use crate::message::LinkMessage;
use crate::params;
use crate::params::Value;
use crate::path::device_path_of;
use crate::runtime::Runtime;
use crate::stack::LinkStack;

pub type HandlerResult = std::result::Result<Value, Fault>;

/// Class name of the fault sent back when a handler panics.
pub const PANIC_CLASS_NAME: &str = "Panic";

/// A method or property getter.
pub type Handler = Arc<dyn Fn(Invocation) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// A property setter; receives the new value.
pub type Setter = Arc<dyn Fn(Invocation, Value) -> BoxFuture<'static, std::result::Result<(), Fault>> + Send + Sync>;

/// Everything a handler gets to see about one call.
pub struct Invocation {
    pub runtime: Runtime,
    pub apartment: Arc<Apartment>,
    pub servlet: Arc<Servlet>,
    /// Method arguments, or a property's index values.
    pub args: Vec<Value>,
    pub call_number: Option<i32>,
    pub path_from: Option<LinkStack>,
}

impl Invocation {
    pub fn arg(&self, index: usize) -> std::result::Result<&Value, Fault> {
        self.args
            .get(index)
            .ok_or_else(|| Fault::new("ArgumentError", format!("Argument {} is missing", index)))
    }

    pub fn i32(&self, index: usize) -> std::result::Result<i32, Fault> {
        self.arg(index)?
            .as_i32()
            .ok_or_else(|| Fault::new("ArgumentError", format!("Argument {} is not an integer", index)))
    }

    pub fn str(&self, index: usize) -> std::result::Result<&str, Fault> {
        self.arg(index)?
            .as_str()
            .ok_or_else(|| Fault::new("ArgumentError", format!("Argument {} is not a string", index)))
    }

    /// A reference to `object` that callers can invoke later, registered in this
    /// apartment on first use.
    pub fn servlet_of(&self, object: Arc<Object>) -> Value {
        Value::Servlet(self.apartment.servlets().obtain(object))
    }
}

#[derive(Default)]
pub struct Object {
    type_name: Option<String>,
    methods: HashMap<String, Handler>,
    getters: HashMap<String, Handler>,
    setters: HashMap<String, Setter>,
}

impl Object {
    pub fn type_name(&self) -> Option<&str> {
        self.type_name.as_deref()
    }

    pub fn method(&self, name: &str) -> Option<&Handler> {
        self.methods.get(&name.to_lowercase())
    }

    pub fn getter(&self, name: &str) -> Option<&Handler> {
        self.getters.get(&name.to_lowercase())
    }

    pub fn setter(&self, name: &str) -> Option<&Setter> {
        self.setters.get(&name.to_lowercase())
    }
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut methods: Vec<&String> = self.methods.keys().collect();
        methods.sort();
        f.debug_struct("Object").field("type_name", &self.type_name).field("methods", &methods).finish()
    }
}

#[derive(Default)]
pub struct ObjectBuilder {
    object: Object,
}

impl ObjectBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn type_name(mut self, type_name: impl Into<String>) -> Self {
        self.object.type_name = Some(type_name.into());
        self
    }

    pub fn method<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Invocation) -> HandlerResult + Send + Sync + 'static,
    {
        self.async_method(name, move |invocation| std::future::ready(f(&invocation)))
    }

    pub fn async_method<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |invocation| f(invocation).boxed());
        self.object.methods.insert(name.into().to_lowercase(), handler);
        self
    }

    pub fn getter<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Invocation) -> HandlerResult + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(move |invocation| std::future::ready(f(&invocation)).boxed());
        self.object.getters.insert(name.into().to_lowercase(), handler);
        self
    }

    pub fn setter<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Invocation, Value) -> std::result::Result<(), Fault> + Send + Sync + 'static,
    {
        let setter: Setter = Arc::new(move |invocation, value| std::future::ready(f(&invocation, value)).boxed());
        self.object.setters.insert(name.into().to_lowercase(), setter);
        self
    }

    pub fn build(self) -> Arc<Object> {
        Arc::new(self.object)
    }
}

/// Runs a member and builds the reply for it.
pub(crate) async fn invoke_member(
    runtime: &Runtime,
    message: &LinkMessage,
    apartment: &Arc<Apartment>,
    servlet: &Arc<Servlet>,
    member: &LinkMember,
    data: Option<LinkData>,
) -> Result<Option<Walk>> {
    let payload = match invoke(runtime, message, apartment, servlet, member, data).await {
        Ok(Ok(payload)) => payload,
        Ok(Err(fault)) => {
            tracing::debug!(member = %member.name, %fault, "member raised a fault");
            Some(params::encode_fault(apartment.factories(), &fault, CODE_NONE)?)
        }
        Err(error) if error.is_replyable() => {
            let fault = Fault::new(PROTOCOL_CLASS_NAME, error.to_string());
            Some(params::encode_fault(apartment.factories(), &fault, error.code())?)
        }
        Err(error) => return Err(error),
    };
    reply_to(message, apartment, payload)
}

async fn invoke(
    runtime: &Runtime,
    message: &LinkMessage,
    apartment: &Arc<Apartment>,
    servlet: &Arc<Servlet>,
    member: &LinkMember,
    data: Option<LinkData>,
) -> Result<std::result::Result<Option<LinkData>, Fault>> {
    let factories = apartment.factories();
    let sender_path = apartment.path().or_else(|| message.path_from.clone());
    let device_path = match &sender_path {
        Some(path) => device_path_of(path)?,
        None => LinkStack::new(),
    };
    let (args, special) = match &data {
        Some(data) => params::decode(runtime, factories, &device_path, data)?,
        None => (Vec::new(), Value::Null),
    };
    let invocation = Invocation {
        runtime: runtime.clone(),
        apartment: apartment.clone(),
        servlet: servlet.clone(),
        args,
        call_number: message.call_number,
        path_from: message.path_from.clone(),
    };
    let object = servlet.object();

    match member.kind {
        MemberKind::Method => {
            let handler = object
                .method(&member.name)
                .ok_or_else(|| Error::protocol(format!("Method \"{}\" not found", member.name)))?;
            Ok(match guarded(&member.name, async move { handler(invocation).await }).await {
                Ok(result) => Ok(Some(params::encode(factories, Some(&result), &[])?)),
                Err(fault) => Err(fault),
            })
        }
        MemberKind::Property { is_set: false, .. } => {
            let getter = object
                .getter(&member.name)
                .ok_or_else(|| Error::protocol(format!("Property \"{}\" not found", member.name)))?;
            Ok(match guarded(&member.name, async move { getter(invocation).await }).await {
                Ok(result) => Ok(Some(params::encode(factories, Some(&result), &[])?)),
                Err(fault) => Err(fault),
            })
        }
        MemberKind::Property { is_set: true, .. } => {
            let setter = object
                .setter(&member.name)
                .ok_or_else(|| Error::protocol(format!("Property \"{}\" not found", member.name)))?;
            Ok(guarded(&member.name, async move { setter(invocation, special).await }).await.map(|()| None))
        }
    }
}

/// Runs a handler, turning a panic into a fault for the caller.
async fn guarded<T>(
    member: &str,
    run: impl Future<Output = std::result::Result<T, Fault>>,
) -> std::result::Result<T, Fault> {
    match AssertUnwindSafe(run).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::warn!(member, %message, "handler panicked");
            Err(Fault::new(PANIC_CLASS_NAME, message))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    match (panic.downcast_ref::<&str>(), panic.downcast_ref::<String>()) {
        (Some(message), _) => message.to_string(),
        (None, Some(message)) => message.clone(),
        (None, None) => "Handler panicked".to_string(),
    }
}
