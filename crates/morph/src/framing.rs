//! # Framing
//!
//! A connection carries an 8-byte handshake, then a bare stream of links. The
//! message link's own length fields are the only framing: read the link byte,
//! then the fixed header, then both path sections. A lone `End` byte closes
//! the stream.

use std::sync::Arc;

use morphwire::LinkByte;
use morphwire::LinkType;
use morphwire::Reader;

use crate::error::Error;
use crate::error::Result;
use crate::message::LinkMessage;
use crate::registry::LinkReaders;
use crate::stream::ByteQueue;

const MAGIC: &[u8; 6] = b"Morph\0";

pub const VERSION_MAJOR: u8 = 1;
pub const VERSION_MINOR: u8 = 1;

pub(crate) fn handshake(major: u8, minor: u8) -> [u8; 8] {
    let mut bytes = [0; 8];
    bytes[..6].copy_from_slice(MAGIC);
    bytes[6] = major;
    bytes[7] = minor;
    bytes
}

/// Validates a peer's handshake against our own version.
pub(crate) fn check_handshake(bytes: &[u8], major: u8, minor: u8) -> Result<()> {
    if bytes.len() != 8 || &bytes[..6] != MAGIC {
        return Err(Error::protocol("Remote connection appears to not be a Morph connection."));
    }
    if bytes[6] != major {
        return Err(Error::protocol("Incompatible Major versions of Morph."));
    }
    if bytes[7] != minor {
        return Err(Error::protocol("Incompatible Minor versions of Morph."));
    }
    Ok(())
}

#[derive(Debug)]
pub(crate) enum Frame {
    Message(LinkMessage),
    End,
}

/// Reads the next frame. `None` when the stream ends between frames.
pub(crate) async fn read_frame(queue: &ByteQueue, readers: &Arc<LinkReaders>) -> Result<Option<Frame>> {
    let Some(first) = queue.read_exact(1).await else {
        return Ok(None);
    };
    let lb = LinkByte::from_raw(first[0]);
    match lb.link_type() {
        LinkType::End => return Ok(Some(Frame::End)),
        LinkType::Message => {}
        other => return Err(Error::protocol(format!("Unexpected link type {:?}", other))),
    }
    let truncated = || Error::protocol("Connection closed inside a message");
    let header_bytes = queue.read_exact(LinkMessage::header_len(lb)).await.ok_or_else(truncated)?;
    let header = LinkMessage::read_header(&mut Reader::with_msb(&header_bytes, lb.msb()), lb)?;
    let body = queue.read_exact(header.body_len()).await.ok_or_else(truncated)?;
    Ok(Some(Frame::Message(LinkMessage::from_parts(&header, &body, readers)?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Link;
    use crate::registry::LinkRegistry;
    use crate::stack::LinkStack;

    #[test]
    fn test_handshake_bytes() {
        assert_eq!(handshake(1, 1), [0x4D, 0x6F, 0x72, 0x70, 0x68, 0x00, 0x01, 0x01]);
    }

    #[test]
    fn test_handshake_mismatches() {
        assert!(check_handshake(&handshake(1, 1), 1, 1).is_ok());
        let err = check_handshake(b"HTTP/1.1", 1, 1).unwrap_err();
        assert_eq!(err.to_string(), "Remote connection appears to not be a Morph connection.");
        let err = check_handshake(&handshake(2, 1), 1, 1).unwrap_err();
        assert_eq!(err.to_string(), "Incompatible Major versions of Morph.");
        let err = check_handshake(&handshake(1, 0), 1, 1).unwrap_err();
        assert_eq!(err.to_string(), "Incompatible Minor versions of Morph.");
    }

    #[tokio::test]
    async fn test_frames_split_across_chunks() {
        let readers = LinkRegistry::standard_readers();
        let mut path_to = LinkStack::new();
        path_to.push(Link::method("Book"));
        path_to.push(Link::service("Library"));
        let mut message = LinkMessage::new(path_to, Some(LinkStack::new()), true);
        message.call_number = Some(7);
        let bytes = message.encode().unwrap();

        let queue = ByteQueue::new();
        for chunk in bytes.chunks(3) {
            queue.push(chunk);
        }
        queue.push(&[0x00]);
        queue.close();

        let Some(Frame::Message(mut read)) = read_frame(&queue, &readers).await.unwrap() else {
            panic!("expected a message");
        };
        assert_eq!(read.call_number, Some(7));
        assert!(read.forceful);
        assert_eq!(read.current().unwrap(), Some(&Link::service("Library")));
        assert!(matches!(read_frame(&queue, &readers).await.unwrap(), Some(Frame::End)));
        assert!(read_frame(&queue, &readers).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_message_is_an_error() {
        let readers = LinkRegistry::standard_readers();
        let message = LinkMessage::new(LinkStack::from_links(vec![Link::service("X")]), None, false);
        let bytes = message.encode().unwrap();
        let queue = ByteQueue::new();
        queue.push(&bytes[..bytes.len() - 1]);
        queue.close();
        assert!(read_frame(&queue, &readers).await.is_err());
    }
}
