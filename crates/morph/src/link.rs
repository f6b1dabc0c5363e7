//! # Links
//!
//! A link is one self-describing hop or payload in a message path. Every link
//! starts with a link byte (type tag, three flags, byte order) except `End`,
//! which is the single raw byte `0x00`.
//!
//! ## Layouts
//!
//! - **Data**: `[lb x=exception][code:i32 if exception][len:i32][bytes]`
//! - **Service**: `[lb][name:string]`
//! - **Apartment**: `[lb x=1][id:i32]`, **ApartmentProxy**: `[lb x=1 y=1][id:i32]`
//! - **Servlet**: `[lb][id:i32]`
//! - **Member**: `[lb x=property y=set z=index][name:string]`
//! - **Internet**: `[lb x=v6 y=string z=port][address][port:i16 if not default]`
//! - **Sequence**: `[lb x=start y=to-sender z=flag][v1:i32][v2:i32]`

use std::fmt;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::net::SocketAddr;
use std::sync::Arc;

use morphwire::LinkByte;
use morphwire::LinkType;
use morphwire::Reader;
use morphwire::Writer;

use crate::error::Error;
use crate::error::Result;
use crate::ids::ApartmentId;
use crate::ids::ApartmentProxyId;
use crate::ids::SenderId;
use crate::ids::SequenceId;
use crate::ids::ServletId;
use crate::message::LinkMessage;
use crate::registry::LinkReaders;

/// Port assumed when an internet link does not carry one.
pub const DEFAULT_PORT: u16 = 0x3000;

#[derive(Debug, Clone)]
pub enum Link {
    End,
    Message(Box<LinkMessage>),
    Data(LinkData),
    Service(LinkService),
    Apartment(ApartmentId),
    ApartmentProxy(ApartmentProxyId),
    Servlet(ServletId),
    Member(LinkMember),
    Internet(LinkInternet),
    Sequence(LinkSequence),
}

impl Link {
    pub fn service(name: impl Into<String>) -> Self {
        Link::Service(LinkService { name: name.into() })
    }

    pub fn method(name: impl Into<String>) -> Self {
        Link::Member(LinkMember::method(name))
    }

    pub fn internet(endpoint: SocketAddr) -> Self {
        Link::Internet(LinkInternet { endpoint })
    }

    pub fn link_type(&self) -> LinkType {
        match self {
            Link::End => LinkType::End,
            Link::Message(_) => LinkType::Message,
            Link::Data(_) => LinkType::Data,
            Link::Service(_) | Link::Apartment(_) | Link::ApartmentProxy(_) => LinkType::Service,
            Link::Servlet(_) => LinkType::Servlet,
            Link::Member(_) => LinkType::Member,
            Link::Internet(_) => LinkType::Internet,
            Link::Sequence(_) => LinkType::Sequence,
        }
    }

    /// Exact number of bytes [`Link::write`] produces.
    pub fn size(&self) -> Result<usize> {
        Ok(match self {
            Link::End => 1,
            Link::Message(message) => message.size()?,
            Link::Data(data) => data.size(),
            Link::Service(service) => 1 + morphwire::string_size(&service.name),
            Link::Apartment(_) | Link::ApartmentProxy(_) | Link::Servlet(_) => 5,
            Link::Member(member) => 1 + morphwire::string_size(&member.name),
            Link::Internet(internet) => internet.size(),
            Link::Sequence(_) => 9,
        })
    }

    pub fn write(&self, w: &mut Writer) -> Result<()> {
        match self {
            Link::End => w.u8(0x00),
            Link::Message(message) => message.write(w)?,
            Link::Data(data) => data.write(w)?,
            Link::Service(service) => {
                w.link_byte(LinkByte::new(LinkType::Service));
                w.string(&service.name)?;
            }
            Link::Apartment(id) => {
                w.link_byte(LinkByte::new(LinkType::Service).with_x(true));
                w.i32(id.0);
            }
            Link::ApartmentProxy(id) => {
                w.link_byte(LinkByte::new(LinkType::Service).with_x(true).with_y(true));
                w.i32(id.0);
            }
            Link::Servlet(id) => {
                w.link_byte(LinkByte::new(LinkType::Servlet));
                w.i32(id.0);
            }
            Link::Member(member) => member.write(w)?,
            Link::Internet(internet) => internet.write(w)?,
            Link::Sequence(sequence) => sequence.write(w),
        }
        Ok(())
    }

    /// Hops that name something inside an apartment rather than how to reach it.
    pub(crate) fn is_inner_hop(&self) -> bool {
        matches!(self, Link::Servlet(_) | Link::Member(_) | Link::Data(_))
    }
}

impl PartialEq for Link {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Link::End, Link::End) => true,
            (Link::Data(a), Link::Data(b)) => a == b,
            (Link::Service(a), Link::Service(b)) => a == b,
            (Link::Apartment(a), Link::Apartment(b)) => a == b,
            (Link::ApartmentProxy(a), Link::ApartmentProxy(b)) => a == b,
            (Link::Servlet(a), Link::Servlet(b)) => a == b,
            (Link::Member(a), Link::Member(b)) => a == b,
            (Link::Internet(a), Link::Internet(b)) => a == b,
            (Link::Sequence(a), Link::Sequence(b)) => a == b,
            // Envelopes are never hops.
            _ => false,
        }
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Link::End => write!(f, "End"),
            Link::Message(_) => write!(f, "Message"),
            Link::Data(data) => {
                if data.exception.is_some() {
                    write!(f, "Data(exception {} B)", data.bytes.len())
                } else {
                    write!(f, "Data({} B)", data.bytes.len())
                }
            }
            Link::Service(service) => write!(f, "Service({})", service.name),
            Link::Apartment(id) => write!(f, "Apartment({})", id.0),
            Link::ApartmentProxy(id) => write!(f, "ApartmentProxy({})", id.0),
            Link::Servlet(id) => write!(f, "Servlet({})", id.0),
            Link::Member(member) => match member.kind {
                MemberKind::Method => write!(f, "Method({})", member.name),
                MemberKind::Property { is_set: true, .. } => write!(f, "Set({})", member.name),
                MemberKind::Property { is_set: false, .. } => write!(f, "Get({})", member.name),
            },
            Link::Internet(internet) => write!(f, "Internet({})", internet.endpoint),
            Link::Sequence(sequence) => write!(f, "{:?}", sequence),
        }
    }
}

// ============================================================================
//  DATA
// ============================================================================

/// An opaque, pre-encoded parameter blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkData {
    pub bytes: Vec<u8>,
    /// Byte order of the integers inside `bytes`.
    pub msb: bool,
    /// `Some(code)` when the blob is an encoded exception.
    pub exception: Option<i32>,
}

impl LinkData {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes, msb: true, exception: None }
    }

    pub fn exception(bytes: Vec<u8>, code: i32) -> Self {
        Self { bytes, msb: true, exception: Some(code) }
    }

    pub fn is_exception(&self) -> bool {
        self.exception.is_some()
    }

    pub fn reader(&self) -> Reader<'_> {
        Reader::with_msb(&self.bytes, self.msb)
    }

    fn size(&self) -> usize {
        let code = if self.exception.is_some() { 4 } else { 0 };
        1 + code + 4 + self.bytes.len()
    }

    fn write(&self, w: &mut Writer) -> Result<()> {
        w.link_byte(LinkByte::new(LinkType::Data).with_x(self.exception.is_some()));
        if let Some(code) = self.exception {
            w.i32(code);
        }
        w.blob(&self.bytes)?;
        Ok(())
    }
}

// ============================================================================
//  SERVICE / MEMBER
// ============================================================================

/// By-name addressing, resolved to an apartment on the first hop.
#[derive(Debug, Clone)]
pub struct LinkService {
    pub name: String,
}

impl PartialEq for LinkService {
    fn eq(&self, other: &Self) -> bool {
        self.name.to_lowercase() == other.name.to_lowercase()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Method,
    Property { is_set: bool, has_index: bool },
}

/// A method or property invocation descriptor.
#[derive(Debug, Clone)]
pub struct LinkMember {
    pub name: String,
    pub kind: MemberKind,
}

impl LinkMember {
    pub fn method(name: impl Into<String>) -> Self {
        Self { name: name.into(), kind: MemberKind::Method }
    }

    pub fn property(name: impl Into<String>, is_set: bool, has_index: bool) -> Self {
        Self { name: name.into(), kind: MemberKind::Property { is_set, has_index } }
    }

    fn write(&self, w: &mut Writer) -> Result<()> {
        let lb = match self.kind {
            MemberKind::Method => LinkByte::new(LinkType::Member),
            MemberKind::Property { is_set, has_index } => LinkByte::new(LinkType::Member)
                .with_x(true)
                .with_y(is_set)
                .with_z(has_index),
        };
        w.link_byte(lb);
        w.string(&self.name)?;
        Ok(())
    }
}

impl PartialEq for LinkMember {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.name.to_lowercase() == other.name.to_lowercase()
    }
}

// ============================================================================
//  INTERNET
// ============================================================================

/// A network endpoint hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkInternet {
    pub endpoint: SocketAddr,
}

impl LinkInternet {
    fn has_port(&self) -> bool {
        self.endpoint.port() != DEFAULT_PORT
    }

    fn size(&self) -> usize {
        let port = if self.has_port() { 2 } else { 0 };
        match self.endpoint.ip() {
            IpAddr::V4(_) => 1 + 4 + port,
            IpAddr::V6(ip) => 1 + morphwire::string_size(&ip.to_string()) + port,
        }
    }

    fn write(&self, w: &mut Writer) -> Result<()> {
        match self.endpoint.ip() {
            IpAddr::V4(ip) => {
                w.link_byte(LinkByte::new(LinkType::Internet).with_z(self.has_port()));
                w.bytes(&ip.octets());
            }
            IpAddr::V6(ip) => {
                let lb = LinkByte::new(LinkType::Internet)
                    .with_x(true)
                    .with_y(true)
                    .with_z(self.has_port());
                w.link_byte(lb);
                w.string(&ip.to_string())?;
            }
        }
        if self.has_port() {
            w.i16(self.endpoint.port() as i16);
        }
        Ok(())
    }
}

// ============================================================================
//  SEQUENCE
// ============================================================================

/// Sequencing control records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSequence {
    /// Sender to receiver: attach `sender_id` to `sequence_id` (0 asks for a new sequence).
    StartSend { sequence_id: SequenceId, sender_id: SenderId, lossless: bool },
    /// Receiver to sender: the sequence is `sequence_id` (a zero sender asks for a new sender).
    StartReply { sequence_id: SequenceId, sender_id: SenderId, lossless: bool },
    /// Sender to receiver: the message below this link is number `index`.
    IndexSend { sequence_id: SequenceId, index: i32, is_last: bool },
    /// Receiver to sender: `index` arrived, or must be sent again.
    IndexReply { sender_id: SenderId, index: i32, resend: bool },
}

impl LinkSequence {
    fn write(&self, w: &mut Writer) {
        let base = LinkByte::new(LinkType::Sequence);
        let (lb, v1, v2) = match *self {
            LinkSequence::StartSend { sequence_id, sender_id, lossless } => {
                (base.with_x(true).with_z(lossless), sequence_id.0, sender_id.0)
            }
            LinkSequence::StartReply { sequence_id, sender_id, lossless } => {
                (base.with_x(true).with_y(true).with_z(lossless), sequence_id.0, sender_id.0)
            }
            LinkSequence::IndexSend { sequence_id, index, is_last } => {
                (base.with_z(is_last), sequence_id.0, index)
            }
            LinkSequence::IndexReply { sender_id, index, resend } => {
                (base.with_y(true).with_z(resend), sender_id.0, index)
            }
        };
        w.link_byte(lb);
        w.i32(v1);
        w.i32(v2);
    }
}

// ============================================================================
//  READERS
// ============================================================================

pub(crate) fn read_end(_: &mut Reader<'_>, _: LinkByte, _: &Arc<LinkReaders>) -> Result<Link> {
    Ok(Link::End)
}

pub(crate) fn read_data(r: &mut Reader<'_>, lb: LinkByte, _: &Arc<LinkReaders>) -> Result<Link> {
    let exception = if lb.x() { Some(r.i32()?) } else { None };
    let bytes = r.blob()?.to_vec();
    Ok(Link::Data(LinkData { bytes, msb: lb.msb(), exception }))
}

pub(crate) fn read_service(r: &mut Reader<'_>, lb: LinkByte, _: &Arc<LinkReaders>) -> Result<Link> {
    if !lb.x() {
        return Ok(Link::Service(LinkService { name: r.string()? }));
    }
    let id = r.i32()?;
    if lb.y() {
        Ok(Link::ApartmentProxy(ApartmentProxyId(id)))
    } else {
        Ok(Link::Apartment(ApartmentId(id)))
    }
}

pub(crate) fn read_servlet(r: &mut Reader<'_>, _: LinkByte, _: &Arc<LinkReaders>) -> Result<Link> {
    Ok(Link::Servlet(ServletId(r.i32()?)))
}

pub(crate) fn read_member(r: &mut Reader<'_>, lb: LinkByte, _: &Arc<LinkReaders>) -> Result<Link> {
    let name = r.string()?;
    let kind = if lb.x() {
        MemberKind::Property { is_set: lb.y(), has_index: lb.z() }
    } else {
        MemberKind::Method
    };
    Ok(Link::Member(LinkMember { name, kind }))
}

pub(crate) fn read_internet(r: &mut Reader<'_>, lb: LinkByte, _: &Arc<LinkReaders>) -> Result<Link> {
    let ip = if lb.y() {
        let text = r.string()?;
        text.parse::<IpAddr>()
            .map_err(|_| Error::protocol(format!("Invalid internet address: {}", text)))?
    } else if lb.x() {
        let mut segments = [0u16; 8];
        for segment in segments.iter_mut() {
            *segment = r.i16()? as u16;
        }
        IpAddr::V6(Ipv6Addr::from(segments))
    } else {
        let b = r.bytes(4)?;
        IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
    };
    let port = if lb.z() { r.i16()? as u16 } else { DEFAULT_PORT };
    Ok(Link::internet(SocketAddr::new(ip, port)))
}

pub(crate) fn read_sequence(r: &mut Reader<'_>, lb: LinkByte, _: &Arc<LinkReaders>) -> Result<Link> {
    let v1 = r.i32()?;
    let v2 = r.i32()?;
    let sequence = match (lb.x(), lb.y()) {
        (true, false) => LinkSequence::StartSend {
            sequence_id: SequenceId(v1),
            sender_id: SenderId(v2),
            lossless: lb.z(),
        },
        (true, true) => LinkSequence::StartReply {
            sequence_id: SequenceId(v1),
            sender_id: SenderId(v2),
            lossless: lb.z(),
        },
        (false, false) => LinkSequence::IndexSend { sequence_id: SequenceId(v1), index: v2, is_last: lb.z() },
        (false, true) => LinkSequence::IndexReply { sender_id: SenderId(v1), index: v2, resend: lb.z() },
    };
    Ok(Link::Sequence(sequence))
}
