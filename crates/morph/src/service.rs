//! # Services
//!
//! A service is a name clients resolve to an apartment. A shared service always
//! resolves to its one apartment. A session service builds a fresh apartment
//! for every client that asks by name, and disposes it after `timeout` of
//! silence.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::apartment::Apartment;
use crate::apartment::Session;
use crate::error::Result;
use crate::ids::ApartmentId;
use crate::lock;
use crate::object::Object;
use crate::params::InstanceFactories;
use crate::path::endpoint_path_of;
use crate::runtime::Runtime;
use crate::runtime::WeakRuntime;
use crate::sequence::SequenceReceiver;
use crate::stack::LinkStack;

/// Builds the default object of each new session apartment.
pub type ObjectFactory = Arc<dyn Fn() -> Arc<Object> + Send + Sync>;

/// How strictly a session orders the messages a client sends it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SequenceLevel {
    #[default]
    None,
    /// In order, skipping whatever is missing.
    Lossy,
    /// In order, asking for whatever is missing to be sent again.
    Lossless,
}

/// What to register: a name, a lifetime policy and the object behind it.
pub struct ServiceDef {
    pub(crate) name: String,
    pub(crate) factories: Option<Arc<InstanceFactories>>,
    pub(crate) kind: ServiceKindDef,
}

pub(crate) enum ServiceKindDef {
    Shared(Arc<Object>),
    Session { timeout: Duration, sequencing: SequenceLevel, object: ObjectFactory },
}

impl ServiceDef {
    /// Every client talks to the same apartment, whose default servlet is `object`.
    pub fn shared(name: impl Into<String>, object: Arc<Object>) -> Self {
        Self { name: name.into(), factories: None, kind: ServiceKindDef::Shared(object) }
    }

    /// Every client gets its own apartment around a fresh object from `object`.
    pub fn session<F>(name: impl Into<String>, timeout: Duration, object: F) -> Self
    where
        F: Fn() -> Arc<Object> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            factories: None,
            kind: ServiceKindDef::Session { timeout, sequencing: SequenceLevel::None, object: Arc::new(object) },
        }
    }

    /// Orders each session's incoming messages. No effect on shared services.
    pub fn sequencing(mut self, level: SequenceLevel) -> Self {
        if let ServiceKindDef::Session { sequencing, .. } = &mut self.kind {
            *sequencing = level;
        }
        self
    }

    /// Instance factories used when encoding and decoding this service's values.
    pub fn factories(mut self, factories: InstanceFactories) -> Self {
        self.factories = Some(Arc::new(factories));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

pub(crate) struct Service {
    name: String,
    kind: ServiceKind,
}

enum ServiceKind {
    Shared(Arc<Apartment>),
    Session(Arc<SessionFactory>),
}

impl Service {
    pub(crate) fn install(runtime: &Runtime, def: ServiceDef) -> Arc<Service> {
        let factories = def.factories.unwrap_or_else(|| runtime.factories().clone());
        let kind = match def.kind {
            ServiceKindDef::Shared(object) => {
                let name = def.name.clone();
                ServiceKind::Shared(
                    runtime.add_apartment(|id| Apartment::new(id, name, object, factories, None)),
                )
            }
            ServiceKindDef::Session { timeout, sequencing, object } => ServiceKind::Session(Arc::new(SessionFactory {
                service: def.name.clone(),
                runtime: runtime.downgrade(),
                object,
                factories,
                timeout,
                sequencing,
                deadlines: Mutex::new(Deadlines::default()),
                wake: Arc::new(Notify::new()),
                sweeping: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            })),
        };
        Arc::new(Service { name: def.name, kind })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// The apartment a by-name request lands in.
    pub(crate) fn obtain_apartment(&self, runtime: &Runtime, path_from: Option<&LinkStack>) -> Result<Arc<Apartment>> {
        match &self.kind {
            ServiceKind::Shared(apartment) => Ok(apartment.clone()),
            ServiceKind::Session(factory) => factory.create(runtime, path_from),
        }
    }

    /// Disposes every apartment this service created.
    pub(crate) fn shutdown(&self, runtime: &Runtime) {
        match &self.kind {
            ServiceKind::Shared(apartment) => runtime.dispose_apartment(apartment.id()),
            ServiceKind::Session(factory) => {
                factory.stop();
                for id in factory.live() {
                    runtime.dispose_apartment(id);
                }
            }
        }
    }
}

#[derive(Default)]
struct Deadlines {
    by_id: HashMap<ApartmentId, Instant>,
    queue: BTreeSet<(Instant, ApartmentId)>,
}

pub(crate) struct SessionFactory {
    service: String,
    runtime: WeakRuntime,
    object: ObjectFactory,
    factories: Arc<InstanceFactories>,
    timeout: Duration,
    sequencing: SequenceLevel,
    deadlines: Mutex<Deadlines>,
    wake: Arc<Notify>,
    sweeping: AtomicBool,
    stopped: AtomicBool,
}

impl SessionFactory {
    fn create(self: &Arc<Self>, runtime: &Runtime, path_from: Option<&LinkStack>) -> Result<Arc<Apartment>> {
        let path = path_from.map(endpoint_path_of).transpose()?;
        let sequence = match self.sequencing {
            SequenceLevel::None => None,
            SequenceLevel::Lossy => Some(SequenceReceiver::spawn(runtime, false)),
            SequenceLevel::Lossless => Some(SequenceReceiver::spawn(runtime, true)),
        };
        let object = (self.object)();
        let session = Session::new(self, path, sequence);
        let apartment = runtime.add_apartment(|id| {
            Apartment::new(id, self.service.clone(), object, self.factories.clone(), Some(session))
        });
        tracing::debug!(apartment = %apartment.id(), service = %self.service, "session created");
        self.touch(apartment.id());
        self.start_sweeping();
        Ok(apartment)
    }

    /// Pushes an apartment's deadline `timeout` into the future.
    pub(crate) fn touch(&self, id: ApartmentId) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        let due = Instant::now() + self.timeout;
        {
            let mut deadlines = lock(&self.deadlines);
            if let Some(old) = deadlines.by_id.insert(id, due) {
                deadlines.queue.remove(&(old, id));
            }
            deadlines.queue.insert((due, id));
        }
        self.wake.notify_one();
    }

    pub(crate) fn forget(&self, id: ApartmentId) {
        let mut deadlines = lock(&self.deadlines);
        if let Some(old) = deadlines.by_id.remove(&id) {
            deadlines.queue.remove(&(old, id));
        }
    }

    fn live(&self) -> Vec<ApartmentId> {
        lock(&self.deadlines).by_id.keys().copied().collect()
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    fn start_sweeping(self: &Arc<Self>) {
        if self.sweeping.swap(true, Ordering::AcqRel) {
            return;
        }
        tokio::spawn(Self::sweep(Arc::downgrade(self), self.wake.clone()));
    }

    /// Disposes apartments as their deadlines pass.
    async fn sweep(factory: Weak<Self>, wake: Arc<Notify>) {
        loop {
            let next = {
                let Some(factory) = factory.upgrade() else {
                    return;
                };
                if factory.stopped.load(Ordering::Acquire) {
                    return;
                }
                let Some(runtime) = factory.runtime.upgrade() else {
                    return;
                };
                let now = Instant::now();
                let expired: Vec<ApartmentId> = {
                    let mut deadlines = lock(&factory.deadlines);
                    let mut expired = Vec::new();
                    while let Some(&(due, id)) = deadlines.queue.first() {
                        if due > now {
                            break;
                        }
                        deadlines.queue.pop_first();
                        deadlines.by_id.remove(&id);
                        expired.push(id);
                    }
                    expired
                };
                for id in expired {
                    tracing::debug!(apartment = %id, service = %factory.service, "session timed out");
                    runtime.dispose_apartment(id);
                }
                lock(&factory.deadlines).queue.first().map(|(due, _)| *due)
            };
            match next {
                Some(due) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(due) => {}
                        _ = wake.notified() => {}
                    }
                }
                None => wake.notified().await,
            }
        }
    }
}
