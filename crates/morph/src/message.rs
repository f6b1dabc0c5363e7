//! # Messages
//!
//! The envelope that travels between runtimes:
//! `[lb x=call y=forceful z=from][call:i32?][to_len:i32][from_len:i32?][to][from]`.

use std::sync::Arc;

use morphwire::LinkByte;
use morphwire::LinkType;
use morphwire::Reader;
use morphwire::Writer;

use crate::error::Error;
use crate::error::Result;
use crate::link::Link;
use crate::link::LinkData;
use crate::registry::LinkReaders;
use crate::stack::LinkStack;

#[derive(Debug, Clone, Default)]
pub struct LinkMessage {
    /// Where the message is going; top is the next hop.
    pub path_to: LinkStack,
    /// How to get back, grown one hop at a time as `path_to` is consumed.
    pub path_from: Option<LinkStack>,
    /// Present exactly when the sender waits for a reply.
    pub call_number: Option<i32>,
    /// Open connections on demand instead of dropping the message.
    pub forceful: bool,
}

impl LinkMessage {
    pub fn new(path_to: LinkStack, path_from: Option<LinkStack>, forceful: bool) -> Self {
        Self { path_to, path_from, call_number: None, forceful }
    }

    pub fn current(&mut self) -> Result<Option<&Link>> {
        self.path_to.peek()
    }

    /// Consumes the current hop, recording it on the return path if there is one.
    pub fn next_link(&mut self) -> Result<()> {
        let link = self.path_to.pop()?;
        if let (Some(from), Some(link)) = (self.path_from.as_mut(), link) {
            from.push(link);
        }
        Ok(())
    }

    /// A reply travelling back along the return path, or `None` without one.
    pub fn create_reply(&self) -> Option<LinkMessage> {
        let path_to = self.path_from.clone()?;
        Some(LinkMessage {
            path_to,
            path_from: Some(LinkStack::new()),
            call_number: self.call_number,
            forceful: self.forceful,
        })
    }

    /// A reply with `payload` at the bottom of its path.
    pub fn create_reply_with(&self, payload: LinkData) -> Result<Option<LinkMessage>> {
        let Some(mut reply) = self.create_reply() else {
            return Ok(None);
        };
        reply.path_to.append(Link::Data(payload))?;
        Ok(Some(reply))
    }

    /// An error reply. It carries no return path, so it is never answered itself.
    pub fn create_error_reply(&self, payload: LinkData) -> Result<Option<LinkMessage>> {
        let reply = self.create_reply_with(payload)?;
        Ok(reply.map(|reply| LinkMessage { path_from: None, ..reply }))
    }

    fn link_byte(&self) -> LinkByte {
        LinkByte::new(LinkType::Message)
            .with_x(self.call_number.is_some())
            .with_y(self.forceful)
            .with_z(self.path_from.is_some())
    }

    pub fn size(&self) -> Result<usize> {
        let mut size = 1 + 4 + self.path_to.byte_size()?;
        if self.call_number.is_some() {
            size += 4;
        }
        if let Some(from) = &self.path_from {
            size += 4 + from.byte_size()?;
        }
        if size > i32::MAX as usize {
            return Err(Error::protocol("Message is too large"));
        }
        Ok(size)
    }

    pub fn write(&self, w: &mut Writer) -> Result<()> {
        self.size()?;
        w.link_byte(self.link_byte());
        if let Some(call_number) = self.call_number {
            w.i32(call_number);
        }
        w.i32(self.path_to.byte_size()? as i32);
        if let Some(from) = &self.path_from {
            w.i32(from.byte_size()? as i32);
        }
        self.path_to.write(w)?;
        if let Some(from) = &self.path_from {
            from.write(w)?;
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::with_capacity(self.size()?);
        self.write(&mut w)?;
        Ok(w.into_bytes())
    }

    /// Bytes that follow the link byte before the path sections begin.
    pub(crate) fn header_len(lb: LinkByte) -> usize {
        let mut len = 4;
        if lb.x() {
            len += 4;
        }
        if lb.z() {
            len += 4;
        }
        len
    }

    /// Reads the header fields that follow the link byte.
    pub(crate) fn read_header(r: &mut Reader<'_>, lb: LinkByte) -> Result<MessageHeader> {
        let call_number = if lb.x() { Some(r.i32()?) } else { None };
        let to_len = r.length()?;
        let from_len = if lb.z() { Some(r.length()?) } else { None };
        Ok(MessageHeader { call_number, forceful: lb.y(), to_len, from_len })
    }

    /// Assembles a message from its header and the path bytes that followed it.
    pub(crate) fn from_parts(header: &MessageHeader, body: &[u8], readers: &Arc<LinkReaders>) -> Result<Self> {
        let mut r = Reader::new(body);
        let to = r.bytes(header.to_len)?;
        let path_to = LinkStack::from_bytes(to, readers.clone());
        let path_from = match header.from_len {
            Some(len) => Some(LinkStack::from_bytes(r.bytes(len)?, readers.clone())),
            None => None,
        };
        Ok(LinkMessage { path_to, path_from, call_number: header.call_number, forceful: header.forceful })
    }
}

pub(crate) struct MessageHeader {
    pub call_number: Option<i32>,
    pub forceful: bool,
    pub to_len: usize,
    pub from_len: Option<usize>,
}

impl MessageHeader {
    pub fn body_len(&self) -> usize {
        self.to_len + self.from_len.unwrap_or(0)
    }
}

pub(crate) fn read_message(r: &mut Reader<'_>, lb: LinkByte, readers: &Arc<LinkReaders>) -> Result<Link> {
    let header = LinkMessage::read_header(r, lb)?;
    let body = r.bytes(header.body_len())?;
    let message = LinkMessage::from_parts(&header, body, readers)?;
    Ok(Link::Message(Box::new(message)))
}
