//! # Runtime
//!
//! One value owns every table a process needs: services, apartments, proxies,
//! devices, sequences and connections. Independent runtimes can coexist in one
//! process; nothing is global.
//!
//! Tables are concurrent maps keyed by ID, each with its own lock. No operation
//! holds two of them at once.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::DashSet;
use tokio::sync::Semaphore;

use crate::apartment::Apartment;
use crate::builder::RuntimeBuilder;
use crate::connection::Connections;
use crate::device::Devices;
use crate::error::Error;
use crate::error::Result;
use crate::ids::ApartmentId;
use crate::ids::ApartmentProxyId;
use crate::ids::IdSeed;
use crate::ids::SenderId;
use crate::ids::SequenceId;
use crate::link::Link;
use crate::lock;
use crate::message::LinkMessage;
use crate::params::InstanceFactories;
use crate::proxy::Address;
use crate::proxy::ApartmentProxy;
use crate::registry::LinkActions;
use crate::registry::LinkReaders;
use crate::sequence::SequenceReceiver;
use crate::sequence::SequenceSender;
use crate::service::Service;
use crate::service::ServiceDef;
use crate::stack::LinkStack;
use crate::transport::Connector;

/// Called with a context label for every failure nobody else can handle.
pub type ErrorHook = Arc<dyn Fn(&str, &Error) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct Config {
    /// How long a call waits for its reply.
    pub call_timeout: Duration,
    /// How long a lossless receiver waits for a gap before asking again.
    pub sequence_timeout: Duration,
    /// Inbound messages dispatched at once.
    pub action_concurrency: usize,
    /// Protocol version sent and expected in the handshake.
    pub version: (u8, u8),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(60),
            sequence_timeout: Duration::from_secs(5),
            action_concurrency: 64,
            version: (crate::framing::VERSION_MAJOR, crate::framing::VERSION_MINOR),
        }
    }
}

pub(crate) struct Inner {
    pub(crate) config: Config,
    pub(crate) readers: Arc<LinkReaders>,
    pub(crate) actions: LinkActions,
    factories: Arc<InstanceFactories>,
    services: DashMap<String, Arc<Service>>,
    apartments: DashMap<ApartmentId, Arc<Apartment>>,
    apartment_ids: IdSeed,
    proxies: DashMap<ApartmentProxyId, Arc<ApartmentProxy>>,
    proxy_ids: IdSeed,
    devices: Devices,
    receivers: DashMap<SequenceId, Arc<SequenceReceiver>>,
    receiver_ids: IdSeed,
    senders: DashMap<SenderId, Arc<SequenceSender>>,
    sender_ids: IdSeed,
    connections: Connections,
    connector: Mutex<Arc<dyn Connector>>,
    local_endpoints: DashSet<SocketAddr>,
    hooks: Mutex<Vec<ErrorHook>>,
    gate: Arc<Semaphore>,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct Runtime {
    pub(crate) inner: Arc<Inner>,
}

/// A handle that does not keep the runtime alive.
#[derive(Clone)]
pub struct WeakRuntime {
    inner: Weak<Inner>,
}

impl WeakRuntime {
    pub fn upgrade(&self) -> Option<Runtime> {
        self.inner.upgrade().map(|inner| Runtime { inner })
    }

    pub(crate) fn runtime(&self) -> Result<Runtime> {
        self.upgrade().ok_or(Error::Closed)
    }
}

impl Runtime {
    /// A runtime with default settings and the TCP connector.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub(crate) fn from_parts(
        config: Config,
        readers: LinkReaders,
        actions: LinkActions,
        factories: InstanceFactories,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let gate = Arc::new(Semaphore::new(config.action_concurrency.max(1)));
        Self {
            inner: Arc::new(Inner {
                config,
                readers: Arc::new(readers),
                actions,
                factories: Arc::new(factories),
                services: DashMap::new(),
                apartments: DashMap::new(),
                apartment_ids: IdSeed::new(1),
                proxies: DashMap::new(),
                proxy_ids: IdSeed::new(1),
                devices: Devices::default(),
                receivers: DashMap::new(),
                receiver_ids: IdSeed::new(1),
                senders: DashMap::new(),
                sender_ids: IdSeed::new(1),
                connections: Connections::default(),
                connector: Mutex::new(connector),
                local_endpoints: DashSet::new(),
                hooks: Mutex::new(Vec::new()),
                gate,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakRuntime {
        WeakRuntime { inner: Arc::downgrade(&self.inner) }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn factories(&self) -> &Arc<InstanceFactories> {
        &self.inner.factories
    }

    pub fn readers(&self) -> &Arc<LinkReaders> {
        &self.inner.readers
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------------
    //  Services and apartments
    // ------------------------------------------------------------------------

    /// Publishes a service. Names are matched without regard to case.
    pub fn register_service(&self, def: ServiceDef) -> Result<()> {
        let key = def.name().to_lowercase();
        if self.inner.services.contains_key(&key) {
            return Err(Error::usage(format!("Service \"{}\" is already registered", def.name())));
        }
        let service = Service::install(self, def);
        tracing::info!(service = %service.name(), "service registered");
        self.inner.services.insert(key, service);
        Ok(())
    }

    /// Withdraws a service and disposes its apartments.
    pub fn deregister_service(&self, name: &str) -> bool {
        match self.inner.services.remove(&name.to_lowercase()) {
            Some((_, service)) => {
                service.shutdown(self);
                tracing::info!(service = %service.name(), "service deregistered");
                true
            }
            None => false,
        }
    }

    pub(crate) fn service(&self, name: &str) -> Option<Arc<Service>> {
        self.inner.services.get(&name.to_lowercase()).map(|entry| entry.clone())
    }

    pub fn apartment(&self, id: ApartmentId) -> Option<Arc<Apartment>> {
        self.inner.apartments.get(&id).map(|entry| entry.clone())
    }

    pub fn apartment_count(&self) -> usize {
        self.inner.apartments.len()
    }

    pub(crate) fn add_apartment(&self, make: impl FnOnce(ApartmentId) -> Apartment) -> Arc<Apartment> {
        let inner = &self.inner;
        let id = ApartmentId(inner.apartment_ids.generate_free(|id| inner.apartments.contains_key(&ApartmentId(id))));
        let apartment = Arc::new(make(id));
        inner.apartments.insert(id, apartment.clone());
        apartment
    }

    pub(crate) fn dispose_apartment(&self, id: ApartmentId) {
        if let Some((_, apartment)) = self.inner.apartments.remove(&id) {
            apartment.dispose();
        }
    }

    // ------------------------------------------------------------------------
    //  Proxies and devices
    // ------------------------------------------------------------------------

    /// A connected proxy to a service hosted by this runtime.
    pub async fn via_local(&self, service: &str) -> Result<Arc<ApartmentProxy>> {
        self.connect(LinkStack::from_links(vec![Link::service(service)])).await
    }

    /// A connected proxy to a service hosted by the runtime at `endpoint`.
    pub async fn via_endpoint(&self, endpoint: SocketAddr, service: &str) -> Result<Arc<ApartmentProxy>> {
        let mut path = LinkStack::from_links(vec![Link::service(service)]);
        if !self.is_local_endpoint(endpoint) {
            path.push(Link::internet(endpoint));
        }
        self.connect(path).await
    }

    /// Builds a proxy for `path` and resolves it to an apartment with an empty
    /// call. Prefers a proxy already bound to that apartment on the same device.
    async fn connect(&self, path: LinkStack) -> Result<Arc<ApartmentProxy>> {
        let proxy = self.via_path(path)?;
        if let Err(e) = proxy.establish().await {
            proxy.discard();
            return Err(e);
        }
        let bound = proxy.apartment_id().and_then(|apartment| proxy.device().find(apartment));
        match bound {
            Some(existing) if existing.id() != proxy.id() => {
                proxy.discard();
                Ok(existing)
            }
            _ => Ok(proxy),
        }
    }

    /// A proxy for a full path: transport hops on top, then a service or an
    /// apartment at the bottom. Apartment proxies are shared per device.
    pub fn via_path(&self, path: LinkStack) -> Result<Arc<ApartmentProxy>> {
        let mut links = path.to_links()?;
        if links.is_empty() {
            return Err(Error::usage("Path must end at a service or an apartment"));
        }
        let address = match links.remove(0) {
            Link::Service(service) => Address::Service(service.name),
            Link::Apartment(id) if id != ApartmentId::DEFAULT => Address::Apartment(id),
            other => return Err(Error::usage(format!("Path must end at a service or an apartment, not {}", other))),
        };
        if let Some(hop) = links.iter().find(|link| !matches!(link, Link::Internet(_))) {
            return Err(Error::usage(format!("Only internet hops may lead to a device, not {}", hop)));
        }
        let device = self.inner.devices.obtain(LinkStack::from_links(links))?;
        match address {
            Address::Apartment(id) => device.obtain(self, id, self.factories()),
            address => Ok(self.add_proxy(device, address, self.factories().clone())),
        }
    }

    pub(crate) fn add_proxy(
        &self,
        device: Arc<crate::device::Device>,
        address: Address,
        factories: Arc<InstanceFactories>,
    ) -> Arc<ApartmentProxy> {
        let inner = &self.inner;
        let id = ApartmentProxyId(inner.proxy_ids.generate_free(|id| inner.proxies.contains_key(&ApartmentProxyId(id))));
        let proxy = Arc::new(ApartmentProxy::new(id, self, device, address, factories));
        inner.proxies.insert(id, proxy.clone());
        proxy
    }

    pub(crate) fn proxy(&self, id: ApartmentProxyId) -> Option<Arc<ApartmentProxy>> {
        self.inner.proxies.get(&id).map(|entry| entry.clone())
    }

    pub(crate) fn remove_proxy(&self, id: ApartmentProxyId) {
        self.inner.proxies.remove(&id);
    }

    pub fn proxy_count(&self) -> usize {
        self.inner.proxies.len()
    }

    pub fn devices(&self) -> &Devices {
        &self.inner.devices
    }

    // ------------------------------------------------------------------------
    //  Sequences
    // ------------------------------------------------------------------------

    pub(crate) fn register_receiver(&self, make: impl FnOnce(SequenceId) -> SequenceReceiver) -> Arc<SequenceReceiver> {
        let inner = &self.inner;
        let id = SequenceId(inner.receiver_ids.generate_free(|id| inner.receivers.contains_key(&SequenceId(id))));
        let receiver = Arc::new(make(id));
        inner.receivers.insert(id, receiver.clone());
        receiver
    }

    pub(crate) fn receiver(&self, id: SequenceId) -> Option<Arc<SequenceReceiver>> {
        self.inner.receivers.get(&id).map(|entry| entry.clone())
    }

    pub(crate) fn remove_receiver(&self, id: SequenceId) {
        self.inner.receivers.remove(&id);
    }

    pub fn receiver_count(&self) -> usize {
        self.inner.receivers.len()
    }

    pub(crate) fn register_sender(&self, make: impl FnOnce(SenderId) -> SequenceSender) -> Arc<SequenceSender> {
        let inner = &self.inner;
        let id = SenderId(inner.sender_ids.generate_free(|id| inner.senders.contains_key(&SenderId(id))));
        let sender = Arc::new(make(id));
        inner.senders.insert(id, sender.clone());
        sender
    }

    pub(crate) fn sender(&self, id: SenderId) -> Option<Arc<SequenceSender>> {
        self.inner.senders.get(&id).map(|entry| entry.clone())
    }

    pub(crate) fn remove_sender(&self, id: SenderId) {
        self.inner.senders.remove(&id);
    }

    pub fn sender_count(&self) -> usize {
        self.inner.senders.len()
    }

    // ------------------------------------------------------------------------
    //  Transport
    // ------------------------------------------------------------------------

    pub(crate) fn connections(&self) -> &Connections {
        &self.inner.connections
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    pub(crate) fn connector(&self) -> Arc<dyn Connector> {
        lock(&self.inner.connector).clone()
    }

    /// Replaces how outbound connections are opened.
    pub fn set_connector(&self, connector: impl Connector) {
        *lock(&self.inner.connector) = Arc::new(connector);
    }

    /// Counts `endpoint` as this runtime: internet links to it are skipped.
    pub fn add_local_endpoint(&self, endpoint: SocketAddr) {
        self.inner.local_endpoints.insert(endpoint);
    }

    pub fn is_local_endpoint(&self, endpoint: SocketAddr) -> bool {
        self.inner.local_endpoints.contains(&endpoint)
    }

    /// Serves a transport some other code accepted.
    pub async fn accept(
        &self,
        transport: Arc<dyn crate::transport::Transport>,
        remote: SocketAddr,
    ) -> Result<Arc<crate::connection::Connection>> {
        crate::connection::Connection::start(self, transport, remote, None).await
    }

    /// Dispatches an inbound message on its own task, within the concurrency limit.
    pub(crate) fn spawn_dispatch(&self, message: LinkMessage) {
        let runtime = self.clone();
        let gate = self.inner.gate.clone();
        tokio::spawn(async move {
            let Ok(_permit) = gate.acquire_owned().await else {
                return;
            };
            runtime.dispatch(message).await;
        });
    }

    // ------------------------------------------------------------------------
    //  Errors and shutdown
    // ------------------------------------------------------------------------

    pub fn on_error(&self, hook: impl Fn(&str, &Error) + Send + Sync + 'static) {
        lock(&self.inner.hooks).push(Arc::new(hook));
    }

    /// Logs a failure nobody is waiting for and passes it to the error hooks.
    pub(crate) fn report(&self, context: &str, error: &Error) {
        tracing::warn!(context, %error, "unhandled error");
        let hooks = lock(&self.inner.hooks).clone();
        for hook in hooks {
            hook(context, error);
        }
    }

    /// Closes proxies and connections and disposes every apartment.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("shutting down");
        let proxies: Vec<Arc<ApartmentProxy>> = self.inner.proxies.iter().map(|entry| entry.clone()).collect();
        for proxy in proxies {
            proxy.close().await;
        }
        let services: Vec<String> = self.inner.services.iter().map(|entry| entry.key().clone()).collect();
        for name in services {
            self.deregister_service(&name);
        }
        let apartments: Vec<ApartmentId> = self.inner.apartments.iter().map(|entry| *entry.key()).collect();
        for id in apartments {
            self.dispose_apartment(id);
        }
        let receivers: Vec<Arc<SequenceReceiver>> = self.inner.receivers.iter().map(|entry| entry.clone()).collect();
        for receiver in receivers {
            receiver.stop();
        }
        for connection in self.inner.connections.all() {
            connection.close().await;
        }
        self.inner.gate.close();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("services", &self.inner.services.len())
            .field("apartments", &self.inner.apartments.len())
            .field("proxies", &self.inner.proxies.len())
            .field("connections", &self.inner.connections.len())
            .finish()
    }
}
