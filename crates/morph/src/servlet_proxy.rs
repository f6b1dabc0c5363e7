//! Client-side handles to remote servlets.

use std::any::Any;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use crate::error::Error;
use crate::error::PROTOCOL_CLASS_NAME;
use crate::error::RemoteError;
use crate::error::Result;
use crate::ids::ServletId;
use crate::link::Link;
use crate::link::LinkMember;
use crate::lock;
use crate::message::LinkMessage;
use crate::params;
use crate::params::Native;
use crate::params::Value;
use crate::proxy::ApartmentProxy;
use crate::stack::LinkStack;
use crate::waits::Reply;

/// One servlet in a remote apartment, reached through an [`ApartmentProxy`].
pub struct ServletProxy {
    id: ServletId,
    type_name: Option<String>,
    proxy: Arc<ApartmentProxy>,
    facade: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
}

impl ServletProxy {
    pub(crate) fn new(id: ServletId, type_name: Option<String>, proxy: Arc<ApartmentProxy>) -> Self {
        Self { id, type_name, proxy, facade: Mutex::new(None) }
    }

    pub fn id(&self) -> ServletId {
        self.id
    }

    pub fn type_name(&self) -> Option<&str> {
        self.type_name.as_deref()
    }

    pub fn apartment_proxy(&self) -> &Arc<ApartmentProxy> {
        &self.proxy
    }

    pub async fn call(&self, method: &str, args: &[Value]) -> Result<Value> {
        self.invoke(LinkMember::method(method), None, args).await
    }

    /// Invokes `method` without waiting for it to finish.
    pub async fn send(&self, method: &str, args: &[Value]) -> Result<()> {
        let message = self.message(LinkMember::method(method), None, args)?;
        self.proxy.send(message).await
    }

    pub async fn get(&self, property: &str) -> Result<Value> {
        self.invoke(LinkMember::property(property, false, false), None, &[]).await
    }

    pub async fn get_indexed(&self, property: &str, index: &[Value]) -> Result<Value> {
        self.invoke(LinkMember::property(property, false, true), None, index).await
    }

    pub async fn set(&self, property: &str, value: Value) -> Result<()> {
        self.invoke(LinkMember::property(property, true, false), Some(&value), &[]).await.map(|_| ())
    }

    pub async fn set_indexed(&self, property: &str, index: &[Value], value: Value) -> Result<()> {
        self.invoke(LinkMember::property(property, true, true), Some(&value), index).await.map(|_| ())
    }

    /// Sets a property without waiting for it to be set.
    pub async fn send_set(&self, property: &str, value: Value) -> Result<()> {
        let message = self.message(LinkMember::property(property, true, false), Some(&value), &[])?;
        self.proxy.send(message).await
    }

    /// The wrapper a reference decoder built for this servlet, built once and
    /// shared while anyone holds it.
    pub(crate) fn facade(&self, make: impl FnOnce() -> Native) -> Native {
        let mut slot = lock(&self.facade);
        if let Some(existing) = slot.as_ref().and_then(Weak::upgrade) {
            return existing;
        }
        let facade = make();
        *slot = Some(Arc::downgrade(&facade));
        facade
    }

    fn message(&self, member: LinkMember, special: Option<&Value>, params: &[Value]) -> Result<LinkMessage> {
        let mut path_to = LinkStack::new();
        if special.is_some() || !params.is_empty() {
            path_to.push(Link::Data(params::encode(self.proxy.factories(), special, params)?));
        }
        path_to.push(Link::Member(member));
        path_to.push(Link::Servlet(self.id));
        Ok(LinkMessage::new(path_to, None, true))
    }

    async fn invoke(&self, member: LinkMember, special: Option<&Value>, params: &[Value]) -> Result<Value> {
        let message = self.message(member, special, params)?;
        let reply = self.proxy.call(message).await?;
        self.decode_reply(reply)
    }

    pub(crate) fn decode_reply(&self, reply: Reply) -> Result<Value> {
        let Some(data) = reply.data else {
            return Ok(Value::Null);
        };
        let runtime = self.proxy.runtime()?;
        let device_path = self.proxy.device().path();
        let factories = self.proxy.factories();
        match data.exception {
            Some(code) => {
                let fault = params::decode_fault(&runtime, factories, &device_path, &data)?;
                if fault.class_name == PROTOCOL_CLASS_NAME {
                    return Err(Error::Protocol { code, message: fault.message });
                }
                let hops = reply.path_from.map(|path| path.to_string()).unwrap_or_default();
                Err(Error::Remote(RemoteError {
                    code,
                    class_name: fault.class_name,
                    message: fault.message,
                    trace: format!("{}\n   at {}", fault.trace, hops),
                }))
            }
            None => Ok(params::decode(&runtime, factories, &device_path, &data)?.1),
        }
    }
}

impl std::fmt::Debug for ServletProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServletProxy")
            .field("id", &self.id)
            .field("type_name", &self.type_name)
            .field("proxy", &self.proxy.id())
            .finish()
    }
}
