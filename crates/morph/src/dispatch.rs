//! # Dispatch
//!
//! Messages are processed by walking their `path_to` one link at a time. Each
//! link type has one action; the action inspects the walk's [`Context`] (what
//! the previous links resolved to) and returns a [`Step`] telling the loop what
//! to do next.
//!
//! The loop is a plain work queue: replies produced while walking are pushed as
//! new walks instead of being dispatched recursively.
//!
//! ## Errors
//!
//! A failing action ends its walk. Protocol and wire errors are answered with an
//! error reply when the message has a return path; everything else goes to the
//! runtime's error hooks.

use std::collections::VecDeque;
use std::sync::Arc;

use morphwire::LinkType;

use crate::apartment::Apartment;
use crate::apartment::Servlet;
use crate::error::Error;
use crate::error::Fault;
use crate::error::Result;
use crate::error::PROTOCOL_CLASS_NAME;
use crate::ids::ApartmentId;
use crate::link::Link;
use crate::link::LinkData;
use crate::link::LinkMember;
use crate::message::LinkMessage;
use crate::params;
use crate::path::endpoint_path_of;
use crate::proxy::ApartmentProxy;
use crate::registry::LinkAction;
use crate::registry::LinkRegistry;
use crate::runtime::Runtime;
use crate::stack::LinkStack;

/// What the links walked so far resolved to.
#[derive(Clone, Default)]
pub enum Context {
    #[default]
    None,
    Apartment(Arc<Apartment>),
    Proxy(Arc<ApartmentProxy>),
    Servlet { apartment: Arc<Apartment>, servlet: Arc<Servlet> },
    Member { apartment: Arc<Apartment>, servlet: Arc<Servlet>, member: LinkMember },
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Context::None => write!(f, "None"),
            Context::Apartment(a) => write!(f, "Apartment({})", a.id()),
            Context::Proxy(p) => write!(f, "Proxy({})", p.id()),
            Context::Servlet { apartment, servlet } => write!(f, "Servlet({}, {})", apartment.id(), servlet.id()),
            Context::Member { servlet, member, .. } => write!(f, "Member({}, {})", servlet.id(), member.name),
        }
    }
}

/// A message in flight through the local runtime.
#[derive(Debug, Default)]
pub struct Walk {
    pub message: LinkMessage,
    pub context: Context,
}

impl Walk {
    pub fn new(message: LinkMessage) -> Self {
        Self { message, context: Context::None }
    }
}

/// What the dispatch loop does after an action.
pub enum Step {
    /// Move the current link to the return path and continue.
    Next,
    /// Drop the current link without recording it and continue.
    Skip,
    /// Run the action for the (replaced) current link again.
    Again,
    /// This walk is finished.
    Stop,
    /// This walk is finished; start another one.
    Spawn(Walk),
}

impl Runtime {
    /// Processes a message arriving from anywhere: a connection, a proxy, a timer.
    pub async fn dispatch(&self, message: LinkMessage) {
        self.run(Walk::new(message)).await
    }

    /// Continues a walk, and every walk it spawns, until all have stopped.
    pub(crate) async fn run(&self, walk: Walk) {
        let mut queue = VecDeque::from([walk]);
        while let Some(mut walk) = queue.pop_front() {
            if let Err(error) = self.walk(&mut walk, &mut queue).await {
                self.fail(&walk.message, error, &mut queue);
            }
        }
    }

    async fn walk(&self, walk: &mut Walk, queue: &mut VecDeque<Walk>) -> Result<()> {
        loop {
            let link = match walk.message.current()? {
                Some(link) => link.clone(),
                None => return self.end_of_path(walk, queue).await,
            };
            let action = self.inner.actions.get(link.link_type())?;
            tracing::trace!(%link, context = ?walk.context, "action");
            match action.act(self, walk, link).await? {
                Step::Next => walk.message.next_link()?,
                Step::Skip => {
                    walk.message.path_to.pop()?;
                }
                Step::Again => {}
                Step::Stop => return Ok(()),
                Step::Spawn(next) => {
                    queue.push_back(next);
                    return Ok(());
                }
            }
        }
    }

    async fn end_of_path(&self, walk: &mut Walk, queue: &mut VecDeque<Walk>) -> Result<()> {
        match std::mem::take(&mut walk.context) {
            Context::Apartment(apartment) => {
                if let Some(reply) = reply_to(&walk.message, &apartment, None)? {
                    queue.push_back(reply);
                }
            }
            Context::Proxy(proxy) => proxy.receive_reply(&walk.message, None)?,
            Context::Member { apartment, servlet, member } => {
                let reply = crate::object::invoke_member(self, &walk.message, &apartment, &servlet, &member, None).await?;
                if let Some(reply) = reply {
                    queue.push_back(reply);
                }
            }
            Context::Servlet { .. } | Context::None => {}
        }
        Ok(())
    }

    fn fail(&self, message: &LinkMessage, error: Error, queue: &mut VecDeque<Walk>) {
        if error.is_replyable() {
            match self.error_reply(message, &error) {
                Ok(Some(reply)) => {
                    tracing::debug!(%error, "replying with error");
                    queue.push_back(reply);
                    return;
                }
                Ok(None) => {}
                Err(e) => self.report("error reply", &e),
            }
        }
        self.report("dispatch", &error);
    }

    /// Sends the error back to whoever is waiting, along the message's return path.
    fn error_reply(&self, message: &LinkMessage, error: &Error) -> Result<Option<Walk>> {
        let Some(from) = &message.path_from else {
            return Ok(None);
        };
        let fault = Fault::new(PROTOCOL_CLASS_NAME, error.to_string());
        let data = params::encode_fault(self.factories(), &fault, error.code())?;
        let mut path_to = endpoint_path_of(from)?;
        if matches!(path_to.peek()?, Some(Link::Apartment(_))) {
            path_to.pop()?;
        }
        path_to.append(Link::Data(data))?;
        let reply = LinkMessage {
            path_to,
            path_from: None,
            call_number: message.call_number,
            forceful: message.forceful,
        };
        Ok(Some(Walk::new(reply)))
    }
}

/// Builds the reply an apartment sends for `message`, if the sender expects one.
///
/// Session apartments answer along their remembered path, so a sequencing
/// handshake can ride along; everyone else reverses the return path.
pub(crate) fn reply_to(message: &LinkMessage, apartment: &Apartment, payload: Option<LinkData>) -> Result<Option<Walk>> {
    let Some(call_number) = message.call_number else {
        return Ok(None);
    };
    let mut path_to = match (apartment.return_path()?, &message.path_from) {
        (Some(path), _) => path,
        (None, Some(from)) => endpoint_path_of(from)?,
        (None, None) => return Ok(None),
    };
    if let Some(data) = payload {
        path_to.append(Link::Data(data))?;
    }
    let mut reply = LinkMessage {
        path_to,
        path_from: Some(LinkStack::new()),
        call_number: Some(call_number),
        forceful: message.forceful,
    };
    // The top is this apartment; start the reply just past it.
    reply.next_link()?;
    Ok(Some(Walk::new(reply)))
}

// ============================================================================
//  STANDARD ACTIONS
// ============================================================================

/// Registers readers and actions for every built-in link type.
pub(crate) fn register_standard(registry: &mut LinkRegistry) -> Result<()> {
    registry.register(LinkType::End, crate::link::read_end, Arc::new(EndAction))?;
    registry.readers.register(LinkType::Message, crate::message::read_message)?;
    registry.register(LinkType::Data, crate::link::read_data, Arc::new(DataAction))?;
    registry.register(LinkType::Service, crate::link::read_service, Arc::new(AddressAction))?;
    registry.register(LinkType::Servlet, crate::link::read_servlet, Arc::new(ServletAction))?;
    registry.register(LinkType::Member, crate::link::read_member, Arc::new(MemberAction))?;
    registry.register(LinkType::Internet, crate::link::read_internet, Arc::new(crate::connection::InternetAction))?;
    registry.register(LinkType::Sequence, crate::link::read_sequence, Arc::new(crate::sequence::SequenceAction))?;
    Ok(())
}

/// Ends a session.
struct EndAction;

#[async_trait::async_trait]
impl LinkAction for EndAction {
    async fn act(&self, runtime: &Runtime, walk: &mut Walk, _: Link) -> Result<Step> {
        if let Context::Apartment(apartment) = &walk.context {
            if apartment.is_session() {
                tracing::debug!(apartment = %apartment.id(), "session ended by peer");
                runtime.dispose_apartment(apartment.id());
            }
        }
        Ok(Step::Stop)
    }
}

/// Service, apartment and apartment proxy links share one tag.
struct AddressAction;

#[async_trait::async_trait]
impl LinkAction for AddressAction {
    async fn act(&self, runtime: &Runtime, walk: &mut Walk, link: Link) -> Result<Step> {
        match link {
            Link::Service(service) => {
                let found = runtime
                    .service(&service.name)
                    .ok_or_else(|| Error::protocol(format!("Service \"{}\" not found", service.name)))?;
                let apartment = found.obtain_apartment(runtime, walk.message.path_from.as_ref())?;
                walk.message.path_to.pop()?;
                walk.message.path_to.push(Link::Apartment(apartment.id()));
                Ok(Step::Again)
            }
            Link::Apartment(id) => {
                if id == ApartmentId::DEFAULT {
                    return Err(Error::protocol("Obtain a default apartment by specifing a service."));
                }
                let apartment = runtime.apartment(id).ok_or_else(|| Error::protocol("Apartment not found"))?;
                apartment.touch();
                if let Some(from) = &walk.message.path_from {
                    apartment.set_path(from)?;
                }
                walk.context = Context::Apartment(apartment);
                Ok(Step::Next)
            }
            Link::ApartmentProxy(id) => {
                let proxy = runtime
                    .proxy(id)
                    .ok_or_else(|| Error::implementation(format!("Apartment proxy {} not found", id)))?;
                walk.context = Context::Proxy(proxy);
                Ok(Step::Next)
            }
            other => Err(Error::implementation(format!("Unexpected link {} for address action", other))),
        }
    }
}

struct ServletAction;

#[async_trait::async_trait]
impl LinkAction for ServletAction {
    async fn act(&self, _: &Runtime, walk: &mut Walk, link: Link) -> Result<Step> {
        let Link::Servlet(id) = link else {
            return Err(Error::implementation("Servlet action given another link"));
        };
        let Context::Apartment(apartment) = &walk.context else {
            return Err(Error::protocol("Link type not supported by context"));
        };
        let servlet = apartment.servlets().find(id).ok_or_else(|| Error::protocol("Servlet not found"))?;
        walk.context = Context::Servlet { apartment: apartment.clone(), servlet };
        Ok(Step::Next)
    }
}

struct MemberAction;

#[async_trait::async_trait]
impl LinkAction for MemberAction {
    async fn act(&self, _: &Runtime, walk: &mut Walk, link: Link) -> Result<Step> {
        let Link::Member(member) = link else {
            return Err(Error::implementation("Member action given another link"));
        };
        let (apartment, servlet) = match &walk.context {
            Context::Apartment(apartment) => (apartment.clone(), apartment.servlets().default_servlet().clone()),
            Context::Servlet { apartment, servlet } => (apartment.clone(), servlet.clone()),
            _ => return Err(Error::protocol("Link type not supported by context")),
        };
        walk.context = Context::Member { apartment, servlet, member };
        Ok(Step::Next)
    }
}

/// A payload: arguments for a member, or the result a proxy is waiting for.
struct DataAction;

#[async_trait::async_trait]
impl LinkAction for DataAction {
    async fn act(&self, runtime: &Runtime, walk: &mut Walk, link: Link) -> Result<Step> {
        let Link::Data(data) = link else {
            return Err(Error::implementation("Data action given another link"));
        };
        match std::mem::take(&mut walk.context) {
            Context::Member { apartment, servlet, member } => {
                walk.message.path_to.pop()?;
                let reply =
                    crate::object::invoke_member(runtime, &walk.message, &apartment, &servlet, &member, Some(data))
                        .await?;
                Ok(reply.map(Step::Spawn).unwrap_or(Step::Stop))
            }
            Context::Proxy(proxy) => {
                proxy.receive_reply(&walk.message, Some(data))?;
                Ok(Step::Stop)
            }
            other => {
                walk.context = other;
                Err(Error::protocol("Link type not supported by context"))
            }
        }
    }
}
