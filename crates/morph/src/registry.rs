//! # Link Registry
//!
//! A fixed table of 16 slots, one per link type tag, each holding at most one
//! reader and one action.
//!
//! ## Invariants
//!
//! - Registration happens while building a runtime and is append-only.
//! - Registering a second reader or action for the same tag is a usage error.
//! - After `build()` the tables are frozen and shared without locks.

use std::fmt;
use std::sync::Arc;

use morphwire::LinkByte;
use morphwire::LinkType;
use morphwire::Reader;

use crate::dispatch::Step;
use crate::dispatch::Walk;
use crate::error::Error;
use crate::error::Result;
use crate::link::Link;
use crate::runtime::Runtime;

/// Decodes one link whose link byte has already been consumed.
pub type ReadFn = fn(&mut Reader<'_>, LinkByte, &Arc<LinkReaders>) -> Result<Link>;

/// The handler invoked when a walk reaches a link of a given type.
#[async_trait::async_trait]
pub trait LinkAction: Send + Sync + 'static {
    async fn act(&self, runtime: &Runtime, walk: &mut Walk, link: Link) -> Result<Step>;
}

pub struct LinkReaders {
    slots: [Option<ReadFn>; LinkType::COUNT],
}

impl LinkReaders {
    pub fn empty() -> Self {
        Self { slots: [None; LinkType::COUNT] }
    }

    pub fn register(&mut self, link_type: LinkType, reader: ReadFn) -> Result<()> {
        let slot = &mut self.slots[link_type.index()];
        if slot.is_some() {
            return Err(Error::usage(format!("Reader for {:?} links already registered", link_type)));
        }
        *slot = Some(reader);
        Ok(())
    }

    /// Reads the next link, whatever its type.
    pub fn read(self: &Arc<Self>, r: &mut Reader<'_>) -> Result<Link> {
        let lb = r.link_byte()?;
        let reader = self.slots[lb.link_type().index()]
            .ok_or_else(|| Error::protocol(format!("Link type {:?} not supported", lb.link_type())))?;
        reader(r, lb, self)
    }
}

impl fmt::Debug for LinkReaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registered: Vec<usize> = (0..LinkType::COUNT).filter(|i| self.slots[*i].is_some()).collect();
        f.debug_struct("LinkReaders").field("registered", &registered).finish()
    }
}

pub struct LinkActions {
    slots: [Option<Arc<dyn LinkAction>>; LinkType::COUNT],
}

impl LinkActions {
    pub fn empty() -> Self {
        Self { slots: std::array::from_fn(|_| None) }
    }

    pub fn register(&mut self, link_type: LinkType, action: Arc<dyn LinkAction>) -> Result<()> {
        let slot = &mut self.slots[link_type.index()];
        if slot.is_some() {
            return Err(Error::usage(format!("Action for {:?} links already registered", link_type)));
        }
        *slot = Some(action);
        Ok(())
    }

    pub fn get(&self, link_type: LinkType) -> Result<Arc<dyn LinkAction>> {
        self.slots[link_type.index()]
            .clone()
            .ok_or_else(|| Error::protocol(format!("No action for {:?} links", link_type)))
    }
}

/// Readers and actions, assembled before a runtime is built.
pub struct LinkRegistry {
    pub(crate) readers: LinkReaders,
    pub(crate) actions: LinkActions,
}

impl Default for LinkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self { readers: LinkReaders::empty(), actions: LinkActions::empty() }
    }

    /// Registers a reader and an action for one link type.
    pub fn register(&mut self, link_type: LinkType, reader: ReadFn, action: Arc<dyn LinkAction>) -> Result<()> {
        self.readers.register(link_type, reader)?;
        self.actions.register(link_type, action)
    }

    /// A registry holding only readers, for decoding outside a runtime.
    pub fn standard_readers() -> Arc<LinkReaders> {
        let mut registry = Self::new();
        // A fresh registry cannot hold duplicates.
        let _ = crate::dispatch::register_standard(&mut registry);
        Arc::new(registry.readers)
    }
}
