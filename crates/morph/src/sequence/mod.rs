//! # Sequencing
//!
//! Orders the messages a proxy sends to one session apartment, optionally
//! with acknowledgements and resends.
//!
//! ## Handshake
//!
//! The receiver names the sequence, the sender names itself:
//!
//! - A session apartment with sequencing advertises `StartReply(seq, 0)` on its
//!   replies until the first indexed message arrives. The proxy answers by
//!   creating a sender.
//! - A proxy may also ask first with `StartSend(0, sender)`, which creates a
//!   receiver in the apartment; the `StartReply(seq, sender)` coming back names it.
//!
//! Every indexed message then carries `IndexSend(seq, n)`, the first one also
//! `StartSend(seq, sender)`. Lossless receivers answer each arrival with
//! `IndexReply(sender, n)` and ask for gaps with `IndexReply(sender, n, resend)`.
//!
//! Control links are consumed where they are read and never recorded on the
//! return path.

mod receiver;
mod sender;

pub use receiver::SequenceReceiver;
pub use sender::SequenceSender;

use crate::dispatch::Context;
use crate::dispatch::Step;
use crate::dispatch::Walk;
use crate::error::Error;
use crate::error::Result;
use crate::link::Link;
use crate::link::LinkSequence;
use crate::path::endpoint_path_of;
use crate::registry::LinkAction;
use crate::runtime::Runtime;

pub(crate) struct SequenceAction;

#[async_trait::async_trait]
impl LinkAction for SequenceAction {
    async fn act(&self, runtime: &Runtime, walk: &mut Walk, link: Link) -> Result<Step> {
        let Link::Sequence(sequence) = link else {
            return Err(Error::implementation("Sequence action given another link"));
        };
        match sequence {
            LinkSequence::StartSend { sequence_id, sender_id, lossless } => {
                let Context::Apartment(apartment) = &walk.context else {
                    return Err(Error::protocol("Link type not supported by context"));
                };
                if sender_id.value() == 0 {
                    return Err(Error::protocol("Sequence start is missing its sender"));
                }
                let receiver = if sequence_id.value() == 0 {
                    apartment
                        .obtain_sequence(|| SequenceReceiver::spawn(runtime, lossless))
                        .ok_or_else(|| Error::protocol("Apartment does not support sequences"))?
                } else {
                    runtime
                        .receiver(sequence_id)
                        .ok_or_else(|| Error::protocol(format!("SequenceID {} does not exist.", sequence_id.value())))?
                };
                // One-way sends have no return path; answer along the session's.
                let path = match &walk.message.path_from {
                    Some(from) => Some(endpoint_path_of(from)?),
                    None => apartment.path(),
                };
                for ack in receiver.start(sender_id, lossless, path)? {
                    runtime.dispatch(ack).await;
                }
                Ok(Step::Skip)
            }
            LinkSequence::StartReply { sequence_id, sender_id, lossless } => {
                let Context::Proxy(proxy) = &walk.context else {
                    return Err(Error::protocol("Link type not supported by context"));
                };
                proxy.sequence_started(runtime, sequence_id, sender_id, lossless);
                Ok(Step::Skip)
            }
            LinkSequence::IndexSend { sequence_id, index, is_last } => {
                let receiver = runtime
                    .receiver(sequence_id)
                    .ok_or_else(|| Error::protocol(format!("SequenceID {} does not exist.", sequence_id.value())))?;
                walk.message.path_to.pop()?;
                let parked = std::mem::take(walk);
                receiver.index(runtime, index, is_last, parked).await?;
                Ok(Step::Stop)
            }
            LinkSequence::IndexReply { sender_id, index, resend } => {
                match runtime.sender(sender_id) {
                    Some(sender) if resend => sender.resend(runtime, index).await,
                    Some(sender) => sender.ack(index),
                    None => tracing::debug!(sender = %sender_id, index, "reply for unknown sender"),
                }
                Ok(Step::Skip)
            }
        }
    }
}
