//! # Apartments
//!
//! An apartment is the unit of addressing and isolation on the serving side. It
//! owns a table of servlets (addressable objects), starting with its default
//! servlet at ID 0.
//!
//! Shared apartments live as long as their service. Session apartments belong
//! to one client: they remember the path back to it, expire after a period of
//! silence, and may own a sequence receiver that orders the client's messages.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use dashmap::DashMap;

use crate::error::Error;
use crate::error::Result;
use crate::ids::ApartmentId;
use crate::ids::IdSeed;
use crate::ids::ServletId;
use crate::link::Link;
use crate::lock;
use crate::object::Object;
use crate::params::InstanceFactories;
use crate::path::endpoint_path_of;
use crate::sequence::SequenceReceiver;
use crate::service::SessionFactory;
use crate::stack::LinkStack;

/// An object registered in an apartment under a servlet ID.
pub struct Servlet {
    id: ServletId,
    apartment_id: ApartmentId,
    object: Arc<Object>,
    type_name: Option<String>,
}

impl Servlet {
    pub fn id(&self) -> ServletId {
        self.id
    }

    pub fn apartment_id(&self) -> ApartmentId {
        self.apartment_id
    }

    pub fn object(&self) -> &Arc<Object> {
        &self.object
    }

    pub fn type_name(&self) -> Option<&str> {
        self.type_name.as_deref()
    }
}

impl std::fmt::Debug for Servlet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Servlet")
            .field("id", &self.id)
            .field("apartment_id", &self.apartment_id)
            .field("type_name", &self.type_name)
            .finish()
    }
}

pub struct Servlets {
    apartment_id: ApartmentId,
    ids: IdSeed,
    table: DashMap<ServletId, Arc<Servlet>>,
    default: Arc<Servlet>,
    obtaining: Mutex<()>,
}

impl Servlets {
    fn new(apartment_id: ApartmentId, default: Arc<Object>) -> Self {
        let ids = IdSeed::new(ServletId::DEFAULT.value());
        let default = Arc::new(Servlet {
            id: ServletId(ids.generate()),
            apartment_id,
            type_name: default.type_name().map(str::to_string),
            object: default,
        });
        let table = DashMap::new();
        table.insert(default.id, default.clone());
        Self { apartment_id, ids, table, default, obtaining: Mutex::new(()) }
    }

    pub fn default_servlet(&self) -> &Arc<Servlet> {
        &self.default
    }

    pub fn find(&self, id: ServletId) -> Option<Arc<Servlet>> {
        self.table.get(&id).map(|entry| entry.clone())
    }

    /// Registers `object` under a fresh ID.
    pub fn add(&self, object: Arc<Object>, type_name: Option<String>) -> Arc<Servlet> {
        let id = ServletId(self.ids.generate_free(|id| self.table.contains_key(&ServletId(id))));
        let type_name = type_name.or_else(|| object.type_name().map(str::to_string));
        let servlet = Arc::new(Servlet { id, apartment_id: self.apartment_id, object, type_name });
        self.table.insert(id, servlet.clone());
        servlet
    }

    /// The servlet already holding `object`, or a new one.
    pub fn obtain(&self, object: Arc<Object>) -> Arc<Servlet> {
        let _guard = lock(&self.obtaining);
        let existing = self.table.iter().find(|entry| Arc::ptr_eq(entry.object(), &object)).map(|entry| entry.clone());
        existing.unwrap_or_else(|| self.add(object, None))
    }

    /// Removes a servlet. Removing the default servlet is a usage error.
    pub fn remove(&self, id: ServletId) -> Result<Option<Arc<Servlet>>> {
        if id.is_default() {
            return Err(Error::usage("Cannot deregister default servlet"));
        }
        Ok(self.table.remove(&id).map(|(_, servlet)| servlet))
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    fn clear(&self) {
        self.table.retain(|id, _| id.is_default());
    }
}

pub(crate) struct Session {
    factory: std::sync::Weak<SessionFactory>,
    /// How to reach the client, without the apartment link itself.
    path: Mutex<Option<LinkStack>>,
    sequence: Mutex<Option<Arc<SequenceReceiver>>>,
}

impl Session {
    pub(crate) fn new(factory: &Arc<SessionFactory>, path: Option<LinkStack>, sequence: Option<Arc<SequenceReceiver>>) -> Self {
        Self { factory: Arc::downgrade(factory), path: Mutex::new(path), sequence: Mutex::new(sequence) }
    }
}

pub struct Apartment {
    id: ApartmentId,
    service: String,
    factories: Arc<InstanceFactories>,
    servlets: Servlets,
    session: Option<Session>,
    disposed: AtomicBool,
}

impl Apartment {
    pub(crate) fn new(
        id: ApartmentId,
        service: String,
        object: Arc<Object>,
        factories: Arc<InstanceFactories>,
        session: Option<Session>,
    ) -> Self {
        Self { id, service, factories, servlets: Servlets::new(id, object), session, disposed: AtomicBool::new(false) }
    }

    pub fn id(&self) -> ApartmentId {
        self.id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn servlets(&self) -> &Servlets {
        &self.servlets
    }

    pub fn factories(&self) -> &Arc<InstanceFactories> {
        &self.factories
    }

    pub fn is_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Postpones expiry of a session apartment.
    pub(crate) fn touch(&self) {
        if let Some(factory) = self.session.as_ref().and_then(|s| s.factory.upgrade()) {
            factory.touch(self.id);
        }
    }

    /// Remembers how to reach the client. Shared apartments ignore this.
    pub(crate) fn set_path(&self, path_from: &LinkStack) -> Result<()> {
        if let Some(session) = &self.session {
            *lock(&session.path) = Some(endpoint_path_of(path_from)?);
        }
        Ok(())
    }

    pub fn path(&self) -> Option<LinkStack> {
        self.session.as_ref().and_then(|s| lock(&s.path).clone())
    }

    /// Where replies from a session apartment go: back to the client, starting
    /// from this apartment, with a pending sequencing handshake at the bottom.
    pub(crate) fn return_path(&self) -> Result<Option<LinkStack>> {
        let Some(mut path) = self.path() else {
            return Ok(None);
        };
        path.push(Link::Apartment(self.id));
        if let Some(start) = self.sequence().and_then(|receiver| receiver.start_link()) {
            path.append(Link::Sequence(start))?;
        }
        Ok(Some(path))
    }

    pub(crate) fn sequence(&self) -> Option<Arc<SequenceReceiver>> {
        self.session.as_ref().and_then(|s| lock(&s.sequence).clone())
    }

    /// The receiver ordering this session's messages, created on first use.
    pub(crate) fn obtain_sequence(&self, create: impl FnOnce() -> Arc<SequenceReceiver>) -> Option<Arc<SequenceReceiver>> {
        let session = self.session.as_ref()?;
        let mut slot = lock(&session.sequence);
        Some(slot.get_or_insert_with(create).clone())
    }

    /// Releases everything the apartment holds. Idempotent.
    pub(crate) fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(apartment = %self.id, service = %self.service, "apartment disposed");
        if let Some(session) = &self.session {
            if let Some(factory) = session.factory.upgrade() {
                factory.forget(self.id);
            }
            if let Some(receiver) = lock(&session.sequence).take() {
                receiver.stop();
            }
        }
        self.servlets.clear();
    }
}

impl std::fmt::Debug for Apartment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Apartment")
            .field("id", &self.id)
            .field("service", &self.service)
            .field("session", &self.is_session())
            .field("servlets", &self.servlets.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectBuilder;
    use crate::params::Value;

    fn apartment() -> Apartment {
        let object = ObjectBuilder::new().type_name("Root").method("Ping", |_| Ok(Value::Null)).build();
        Apartment::new(ApartmentId(9), "Test".into(), object, Arc::new(InstanceFactories::new()), None)
    }

    #[test]
    fn test_default_servlet_is_zero() {
        let apartment = apartment();
        let default = apartment.servlets().default_servlet();
        assert_eq!(default.id(), ServletId::DEFAULT);
        assert_eq!(default.apartment_id(), ApartmentId(9));
        assert_eq!(default.type_name(), Some("Root"));
        assert!(apartment.servlets().find(ServletId::DEFAULT).is_some());
    }

    #[test]
    fn test_obtain_reuses_servlet_for_same_object() {
        let apartment = apartment();
        let object = ObjectBuilder::new().build();
        let first = apartment.servlets().obtain(object.clone());
        let second = apartment.servlets().obtain(object);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.id(), ServletId(1));
        let other = apartment.servlets().obtain(ObjectBuilder::new().build());
        assert_eq!(other.id(), ServletId(2));
    }

    #[test]
    fn test_default_servlet_cannot_be_removed() {
        let apartment = apartment();
        let err = apartment.servlets().remove(ServletId::DEFAULT).unwrap_err();
        assert!(matches!(err, Error::Usage(_)), "{err:?}");
        assert!(apartment.servlets().find(ServletId::DEFAULT).is_some());

        let added = apartment.servlets().add(ObjectBuilder::new().build(), Some("Extra".into()));
        assert_eq!(added.type_name(), Some("Extra"));
        assert!(apartment.servlets().remove(added.id()).unwrap().is_some());
        assert!(apartment.servlets().find(added.id()).is_none());
        assert!(apartment.servlets().remove(added.id()).unwrap().is_none());
    }

    #[test]
    fn test_dispose_clears_servlets() {
        let apartment = apartment();
        apartment.servlets().add(ObjectBuilder::new().build(), None);
        apartment.dispose();
        assert!(apartment.is_disposed());
        assert_eq!(apartment.servlets().len(), 1);
    }

    #[test]
    fn test_shared_apartment_has_no_return_path() {
        let apartment = apartment();
        apartment.set_path(&LinkStack::from_links(vec![Link::Apartment(ApartmentId(1))])).unwrap();
        assert!(apartment.path().is_none());
        assert!(apartment.return_path().unwrap().is_none());
    }
}
