//! # Link Stacks
//!
//! An ordered chain of links materialized lazily from bytes.
//!
//! ## Invariants
//!
//! - The top of the stack (last element of `links`) is the next hop.
//! - Undecoded bytes always lie *below* every decoded link. They are stored
//!   top-first, exactly as written on the wire.
//! - `byte_size()` equals the length `write()` produces: the sum of link sizes
//!   plus the undecoded remainder.

use std::fmt;
use std::sync::Arc;

use morphwire::Reader;
use morphwire::Writer;

use crate::error::Result;
use crate::link::Link;
use crate::registry::LinkReaders;

/// Where the bottom of a stack comes from.
#[derive(Clone)]
enum LinkNode {
    /// Everything is in `links`.
    Decoded,
    /// `bytes[pos..]` still holds encoded links.
    Pending { bytes: Arc<[u8]>, pos: usize, readers: Arc<LinkReaders> },
}

#[derive(Clone)]
pub struct LinkStack {
    links: Vec<Link>,
    node: LinkNode,
}

impl Default for LinkStack {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkStack {
    pub fn new() -> Self {
        Self { links: Vec::new(), node: LinkNode::Decoded }
    }

    /// Builds a stack from links listed bottom first.
    pub fn from_links(links: Vec<Link>) -> Self {
        Self { links, node: LinkNode::Decoded }
    }

    /// Wraps encoded links; nothing is decoded until asked for.
    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>, readers: Arc<LinkReaders>) -> Self {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Self::new();
        }
        Self { links: Vec::new(), node: LinkNode::Pending { bytes, pos: 0, readers } }
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty() && matches!(self.node, LinkNode::Decoded)
    }

    fn decode_one(&mut self) -> Result<Option<Link>> {
        let (link, exhausted) = match &mut self.node {
            LinkNode::Decoded => return Ok(None),
            LinkNode::Pending { bytes, pos, readers } => {
                let mut r = Reader::new(&bytes[*pos..]);
                let link = readers.read(&mut r)?;
                *pos += r.pos();
                (link, *pos >= bytes.len())
            }
        };
        if exhausted {
            self.node = LinkNode::Decoded;
        }
        Ok(Some(link))
    }

    /// The next hop, decoding at most one link.
    pub fn peek(&mut self) -> Result<Option<&Link>> {
        if self.links.is_empty() {
            if let Some(link) = self.decode_one()? {
                self.links.push(link);
            }
        }
        Ok(self.links.last())
    }

    pub fn pop(&mut self) -> Result<Option<Link>> {
        self.peek()?;
        Ok(self.links.pop())
    }

    /// Places `link` on top, as the next hop.
    pub fn push(&mut self, link: Link) {
        self.links.push(link);
    }

    /// Places all of `other` on top, keeping its order.
    pub fn push_stack(&mut self, mut other: LinkStack) -> Result<()> {
        other.decode_all()?;
        self.links.append(&mut other.links);
        Ok(())
    }

    /// Places `link` at the bottom, after everything else.
    pub fn append(&mut self, link: Link) -> Result<()> {
        self.decode_all()?;
        self.links.insert(0, link);
        Ok(())
    }

    /// Places all of `other` at the bottom, keeping its order.
    pub fn append_stack(&mut self, mut other: LinkStack) -> Result<()> {
        self.decode_all()?;
        other.decode_all()?;
        self.links.splice(0..0, other.links);
        Ok(())
    }

    /// Forces the whole undecoded remainder into `links`.
    pub fn decode_all(&mut self) -> Result<()> {
        let mut tail = Vec::new();
        while let Some(link) = self.decode_one()? {
            tail.push(link);
        }
        tail.reverse();
        self.links.splice(0..0, tail);
        Ok(())
    }

    /// Keeps only the links matching `keep`.
    pub fn retain(&mut self, keep: impl Fn(&Link) -> bool) -> Result<()> {
        self.decode_all()?;
        self.links.retain(|link| keep(link));
        Ok(())
    }

    /// All links, bottom first. Does not disturb `self`.
    pub fn to_links(&self) -> Result<Vec<Link>> {
        let mut copy = self.clone();
        copy.decode_all()?;
        Ok(copy.links)
    }

    /// The same links in the opposite order.
    pub fn reversed(&self) -> Result<LinkStack> {
        let mut links = self.to_links()?;
        links.reverse();
        Ok(Self::from_links(links))
    }

    /// Structural equality. Decodes copies of both sides.
    pub fn same_path(&self, other: &LinkStack) -> Result<bool> {
        Ok(self.to_links()? == other.to_links()?)
    }

    pub fn byte_size(&self) -> Result<usize> {
        let mut size = 0;
        for link in &self.links {
            size += link.size()?;
        }
        if let LinkNode::Pending { bytes, pos, .. } = &self.node {
            size += bytes.len() - pos;
        }
        Ok(size)
    }

    /// Writes the links top first, then the undecoded remainder verbatim.
    pub fn write(&self, w: &mut Writer) -> Result<()> {
        for link in self.links.iter().rev() {
            link.write(w)?;
        }
        if let LinkNode::Pending { bytes, pos, .. } = &self.node {
            w.bytes(&bytes[*pos..]);
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut w = Writer::with_capacity(self.byte_size()?);
        self.write(&mut w)?;
        Ok(w.into_bytes())
    }
}

impl PartialEq for LinkStack {
    fn eq(&self, other: &Self) -> bool {
        self.same_path(other).unwrap_or(false)
    }
}

impl fmt::Display for LinkStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, link) in self.links.iter().rev().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", link)?;
        }
        if let LinkNode::Pending { bytes, pos, .. } = &self.node {
            if !self.links.is_empty() {
                write!(f, " ")?;
            }
            write!(f, "[{} B]", bytes.len() - pos)?;
        }
        write!(f, ")")
    }
}

impl fmt::Debug for LinkStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LinkStack{}", self)
    }
}
