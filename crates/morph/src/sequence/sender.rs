use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

use crate::error::Error;
use crate::error::Result;
use crate::ids::SenderId;
use crate::ids::SequenceId;
use crate::link::Link;
use crate::link::LinkSequence;
use crate::lock;
use crate::message::LinkMessage;
use crate::runtime::Runtime;
use crate::runtime::WeakRuntime;

#[derive(Default)]
struct SenderState {
    /// Zero until the receiver has named the sequence.
    sequence_id: i32,
    index: i32,
    /// Lossless only: sent but not yet acknowledged.
    retained: BTreeMap<i32, LinkMessage>,
    expiring: bool,
    halted: bool,
    resend_requests: usize,
    acks: usize,
}

/// The sending half of a sequence, owned by an apartment proxy.
pub struct SequenceSender {
    id: SenderId,
    runtime: WeakRuntime,
    lossless: bool,
    state: Mutex<SenderState>,
}

impl SequenceSender {
    pub(crate) fn create(runtime: &Runtime, sequence_id: SequenceId, lossless: bool) -> Arc<Self> {
        runtime.register_sender(|id| Self {
            id,
            runtime: runtime.downgrade(),
            lossless,
            state: Mutex::new(SenderState { sequence_id: sequence_id.value(), ..Default::default() }),
        })
    }

    pub fn id(&self) -> SenderId {
        self.id
    }

    pub fn sequence_id(&self) -> SequenceId {
        SequenceId(lock(&self.state).sequence_id)
    }

    pub fn is_lossless(&self) -> bool {
        self.lossless
    }

    /// Messages still waiting for an acknowledgement.
    pub fn pending(&self) -> usize {
        lock(&self.state).retained.len()
    }

    pub fn resend_requests(&self) -> usize {
        lock(&self.state).resend_requests
    }

    pub fn acks(&self) -> usize {
        lock(&self.state).acks
    }

    pub fn is_halted(&self) -> bool {
        lock(&self.state).halted
    }

    pub(crate) fn set_sequence(&self, sequence_id: SequenceId) {
        lock(&self.state).sequence_id = sequence_id.value();
    }

    /// Tags `message` with the next index, and with the start record on the
    /// first one. Returns the index, or `None` while the sequence is unnamed.
    pub(crate) fn add_next_link(&self, is_last: bool, message: &mut LinkMessage) -> Result<Option<i32>> {
        let mut state = lock(&self.state);
        if state.halted {
            return Err(Error::usage("Sequence has been halted"));
        }
        if state.expiring {
            return Err(Error::usage("Sequence has already sent its last message"));
        }
        if state.sequence_id == 0 {
            return Ok(None);
        }
        state.index += 1;
        let index = state.index;
        let sequence_id = SequenceId(state.sequence_id);
        message.path_to.push(Link::Sequence(LinkSequence::IndexSend { sequence_id, index, is_last }));
        if index == 1 {
            message.path_to.push(Link::Sequence(LinkSequence::StartSend {
                sequence_id,
                sender_id: self.id,
                lossless: self.lossless,
            }));
        }
        if is_last {
            state.expiring = true;
        }
        Ok(Some(index))
    }

    /// Keeps a sent message until it is acknowledged.
    pub(crate) fn retain(&self, index: i32, message: LinkMessage) {
        if !self.lossless {
            return;
        }
        let mut state = lock(&self.state);
        if !state.halted {
            state.retained.insert(index, message);
        }
    }

    pub(crate) fn ack(&self, index: i32) {
        let done = {
            let mut state = lock(&self.state);
            state.acks += 1;
            state.retained.remove(&index);
            state.expiring && state.retained.is_empty()
        };
        if done {
            self.dispose();
        }
    }

    pub(crate) async fn resend(&self, runtime: &Runtime, index: i32) {
        let message = {
            let mut state = lock(&self.state);
            state.resend_requests += 1;
            state.retained.get(&index).cloned()
        };
        match message {
            Some(message) => {
                tracing::debug!(sender = %self.id, index, "resending");
                runtime.dispatch(message).await;
            }
            None => tracing::debug!(sender = %self.id, index, "resend requested for a message no longer retained"),
        }
    }

    /// No more messages will be sent. Disposes once nothing is left to acknowledge.
    pub(crate) fn expire(&self) {
        let done = {
            let mut state = lock(&self.state);
            state.expiring = true;
            state.retained.is_empty()
        };
        if done {
            self.dispose();
        }
    }

    /// Tears down at once, dropping unacknowledged messages.
    pub(crate) fn halt(&self) {
        {
            let mut state = lock(&self.state);
            state.halted = true;
            state.retained.clear();
        }
        self.dispose();
    }

    fn dispose(&self) {
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.remove_sender(self.id);
        }
    }
}

impl std::fmt::Debug for SequenceSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("SequenceSender")
            .field("id", &self.id)
            .field("sequence_id", &state.sequence_id)
            .field("index", &state.index)
            .field("pending", &state.retained.len())
            .finish()
    }
}
