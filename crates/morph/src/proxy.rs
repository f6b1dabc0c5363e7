//! # Apartment Proxies
//!
//! The client-side stand-in for one remote apartment. A proxy starts out
//! addressing a service by name; the first reply tells it which apartment it
//! landed in, and from then on it addresses that apartment directly.
//!
//! Outgoing messages are addressed as
//!
//! ```text
//! [ApartmentProxy(self)] [device path...] [Service | Apartment] [sequence...] [body...]
//! ```
//!
//! and the proxy link is moved to the return path before dispatch, so the
//! reply walks back into this proxy.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;

use crate::device::Device;
use crate::error::Error;
use crate::error::Result;
use crate::ids::ApartmentId;
use crate::ids::ApartmentProxyId;
use crate::ids::SenderId;
use crate::ids::SequenceId;
use crate::ids::ServletId;
use crate::link::Link;
use crate::link::LinkData;
use crate::link::LinkSequence;
use crate::lock;
use crate::message::LinkMessage;
use crate::params::InstanceFactories;
use crate::runtime::Runtime;
use crate::runtime::WeakRuntime;
use crate::sequence::SequenceSender;
use crate::servlet_proxy::ServletProxy;
use crate::stack::LinkStack;
use crate::waits::NumberedWaits;
use crate::waits::Reply;

/// What a proxy puts below the device path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Address {
    Service(String),
    Apartment(ApartmentId),
}

pub struct ApartmentProxy {
    id: ApartmentProxyId,
    runtime: WeakRuntime,
    device: Arc<Device>,
    address: Mutex<Address>,
    factories: Arc<InstanceFactories>,
    timeout: Mutex<Option<Duration>>,
    waits: NumberedWaits,
    servlets: DashMap<ServletId, Weak<ServletProxy>>,
    sequence: Mutex<Option<Arc<SequenceSender>>>,
    closed: AtomicBool,
}

impl ApartmentProxy {
    pub(crate) fn new(
        id: ApartmentProxyId,
        runtime: &Runtime,
        device: Arc<Device>,
        address: Address,
        factories: Arc<InstanceFactories>,
    ) -> Self {
        Self {
            id,
            runtime: runtime.downgrade(),
            device,
            address: Mutex::new(address),
            factories,
            timeout: Mutex::new(Some(runtime.config().call_timeout)),
            waits: NumberedWaits::new(),
            servlets: DashMap::new(),
            sequence: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ApartmentProxyId {
        self.id
    }

    /// The remote apartment, once known.
    pub fn apartment_id(&self) -> Option<ApartmentId> {
        match &*lock(&self.address) {
            Address::Apartment(id) => Some(*id),
            Address::Service(_) => None,
        }
    }

    /// The service still being addressed by name, if the apartment is not yet known.
    pub fn service(&self) -> Option<String> {
        match &*lock(&self.address) {
            Address::Service(name) => Some(name.clone()),
            Address::Apartment(_) => None,
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn factories(&self) -> &Arc<InstanceFactories> {
        &self.factories
    }

    pub fn timeout(&self) -> Option<Duration> {
        *lock(&self.timeout)
    }

    /// How long calls wait for a reply. `None` waits forever.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        *lock(&self.timeout) = timeout;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.waits.len()
    }

    pub fn sequence(&self) -> Option<Arc<SequenceSender>> {
        lock(&self.sequence).clone()
    }

    pub(crate) fn runtime(&self) -> Result<Runtime> {
        self.runtime.runtime()
    }

    /// The proxy for servlet `id` in the remote apartment, shared while alive.
    pub fn servlet(self: &Arc<Self>, id: ServletId, type_name: Option<String>) -> Arc<ServletProxy> {
        let mut entry = self.servlets.entry(id).or_default();
        if let Some(existing) = entry.upgrade() {
            return existing;
        }
        let servlet = Arc::new(ServletProxy::new(id, type_name, self.clone()));
        *entry = Arc::downgrade(&servlet);
        servlet
    }

    pub fn default_servlet(self: &Arc<Self>) -> Arc<ServletProxy> {
        self.servlet(ServletId::DEFAULT, None)
    }

    /// Resolves the service to its apartment without calling anything.
    pub async fn establish(self: &Arc<Self>) -> Result<()> {
        let reply = self.call(LinkMessage::default()).await?;
        if reply.data.is_some() {
            self.default_servlet().decode_reply(reply)?;
        }
        Ok(())
    }

    /// Sends `message` and waits for the reply to it.
    pub(crate) async fn call(&self, mut message: LinkMessage) -> Result<Reply> {
        self.check_open()?;
        let runtime = self.runtime()?;
        let pending = self.waits.prepare();
        message.call_number = Some(pending.number());
        message.forceful = true;
        if message.path_from.is_none() {
            message.path_from = Some(LinkStack::new());
        }
        self.address(&mut message, false)?;
        tracing::trace!(proxy = %self.id, call = pending.number(), "call");
        runtime.spawn_dispatch(message);
        pending.wait(self.timeout()).await
    }

    /// Sends `message` without waiting for anything.
    pub(crate) async fn send(&self, mut message: LinkMessage) -> Result<()> {
        self.send_indexed(&mut message, false).await
    }

    async fn send_indexed(&self, message: &mut LinkMessage, is_last: bool) -> Result<()> {
        self.check_open()?;
        let runtime = self.runtime()?;
        message.call_number = None;
        message.path_from = None;
        message.forceful = true;
        self.address(message, is_last)?;
        runtime.dispatch(std::mem::take(message)).await;
        Ok(())
    }

    /// Prefixes the proxy's addressing, and sequencing when a sequence is running.
    fn address(&self, message: &mut LinkMessage, is_last: bool) -> Result<()> {
        let sender = self.sequence();
        let indexed = match &sender {
            Some(sender) => sender.add_next_link(is_last, message)?,
            None => None,
        };
        match &*lock(&self.address) {
            Address::Service(name) => message.path_to.push(Link::service(name.clone())),
            Address::Apartment(id) => message.path_to.push(Link::Apartment(*id)),
        }
        message.path_to.push_stack(self.device.path())?;
        if message.path_from.is_some() {
            message.path_to.push(Link::ApartmentProxy(self.id));
            message.next_link()?;
        }
        if let (Some(sender), Some(index)) = (sender, indexed) {
            sender.retain(index, message.clone());
            if is_last {
                sender.expire();
                *lock(&self.sequence) = None;
            }
        }
        Ok(())
    }

    /// A reply walked back into this proxy.
    pub(crate) fn receive_reply(self: &Arc<Self>, message: &LinkMessage, data: Option<LinkData>) -> Result<()> {
        let Some(number) = message.call_number else {
            return Ok(());
        };
        let reply = match &message.path_from {
            Some(from) => self.set_path(from).map(|()| Reply { data, path_from: Some(from.clone()) }),
            None => Ok(Reply { data, path_from: None }),
        };
        if !self.waits.complete(number, reply) {
            tracing::debug!(proxy = %self.id, call = number, "late reply");
            if let Some(runtime) = self.runtime.upgrade() {
                runtime.report("reply", &Error::implementation("No one waiting for reply"));
            }
        }
        Ok(())
    }

    /// Learns the apartment and the device path from a reply's return path.
    ///
    /// The return path reads, bottom to top: the apartment, the hops the reply
    /// took, this proxy.
    fn set_path(self: &Arc<Self>, path_from: &LinkStack) -> Result<()> {
        let links = path_from.to_links()?;
        match links.last() {
            Some(Link::ApartmentProxy(id)) if *id == self.id => {}
            _ => return Err(Error::implementation("Apartment proxy path does not end at the proxy")),
        }
        let Some((at, apartment)) = links.iter().enumerate().find_map(|(i, link)| match link {
            Link::Apartment(id) => Some((i, *id)),
            _ => None,
        }) else {
            return Err(Error::protocol("Path did not include apartment link"));
        };
        let hops: Vec<Link> =
            links[at + 1..links.len() - 1].iter().filter(|link| matches!(link, Link::Internet(_))).cloned().collect();
        if self.device.path().to_links()? != hops {
            tracing::debug!(proxy = %self.id, "device path changed");
            self.device.set_path(LinkStack::from_links(hops));
        }

        let mut address = lock(&self.address);
        if *address != Address::Apartment(apartment) {
            tracing::debug!(proxy = %self.id, %apartment, "bound to apartment");
            *address = Address::Apartment(apartment);
            self.device.register(apartment, self);
        }
        Ok(())
    }

    /// Asks the remote apartment to order everything this proxy sends from now on.
    pub async fn start_sequence(&self, lossless: bool) -> Result<Arc<SequenceSender>> {
        let runtime = self.runtime()?;
        let sender = {
            let mut slot = lock(&self.sequence);
            if slot.is_some() {
                return Err(Error::usage("A sequence is already running"));
            }
            let sender = SequenceSender::create(&runtime, SequenceId(0), lossless);
            *slot = Some(sender.clone());
            sender
        };
        let mut path_to = LinkStack::new();
        path_to.push(Link::Sequence(LinkSequence::StartSend { sequence_id: SequenceId(0), sender_id: sender.id(), lossless }));
        let result = self.call(LinkMessage::new(path_to, None, true)).await;
        let started = match result {
            Ok(reply) if reply.data.as_ref().is_some_and(LinkData::is_exception) => {
                Err(Error::protocol("Remote refused to start a sequence"))
            }
            Ok(_) if sender.sequence_id().value() == 0 => Err(Error::protocol("Remote did not start a sequence")),
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            sender.halt();
            *lock(&self.sequence) = None;
            return Err(e);
        }
        tracing::debug!(proxy = %self.id, sequence = %sender.sequence_id(), lossless, "sequence started");
        Ok(sender)
    }

    /// Sends the final message of the running sequence.
    pub async fn end_sequence(&self) -> Result<()> {
        if self.sequence().is_none() {
            return Err(Error::usage("No sequence is running"));
        }
        self.send_indexed(&mut LinkMessage::default(), true).await
    }

    /// A `StartReply` walked into this proxy.
    pub(crate) fn sequence_started(&self, runtime: &Runtime, sequence_id: SequenceId, sender_id: SenderId, lossless: bool) {
        if sender_id.value() != 0 {
            match runtime.sender(sender_id) {
                Some(sender) => sender.set_sequence(sequence_id),
                None => tracing::debug!(proxy = %self.id, sender = %sender_id, "start reply for unknown sender"),
            }
            return;
        }
        let mut slot = lock(&self.sequence);
        if slot.is_none() {
            tracing::debug!(proxy = %self.id, sequence = %sequence_id, lossless, "remote started a sequence");
            *slot = Some(SequenceSender::create(runtime, sequence_id, lossless));
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() { Err(Error::Closed) } else { Ok(()) }
    }

    /// Tears the proxy down and tells a session apartment to end. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(proxy = %self.id, "closing");
        if let Some(sender) = lock(&self.sequence).take() {
            sender.halt();
        }
        self.servlets.clear();
        self.waits.fail_all(Error::Closed);
        let Some(runtime) = self.runtime.upgrade() else {
            return;
        };
        runtime.remove_proxy(self.id);
        if let Some(apartment) = self.apartment_id() {
            self.device.deregister(apartment, self);
            let mut path_to = LinkStack::new();
            path_to.push(Link::End);
            path_to.push(Link::Apartment(apartment));
            if let Err(e) = path_to.push_stack(self.device.path()) {
                runtime.report("close", &e);
                return;
            }
            runtime.dispatch(LinkMessage::new(path_to, None, false)).await;
        }
    }

    /// Drops a proxy that lost the race to be bound to its apartment.
    pub(crate) fn discard(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.remove_proxy(self.id);
        }
    }
}

impl std::fmt::Debug for ApartmentProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApartmentProxy")
            .field("id", &self.id)
            .field("address", &*lock(&self.address))
            .field("device", &self.device.path())
            .finish()
    }
}
