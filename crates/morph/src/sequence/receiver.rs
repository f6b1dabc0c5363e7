//! The receiving half of a sequence: parks indexed messages and releases them
//! in index order from a single drain task.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::dispatch::Walk;
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
use crate::stack::LinkStack;

enum Slot {
    Ready(Walk),
    /// A gap; ask for it again at `due`.
    Missing { due: Instant },
}

struct ReceiverState {
    sender_id: SenderId,
    lossless: bool,
    path_to_proxy: Option<LinkStack>,
    /// Highest index handed to dispatch so far.
    delivered: i32,
    /// Highest index seen so far.
    furthest: i32,
    slots: BTreeMap<i32, Slot>,
    last: Option<i32>,
    /// Lossless arrivals that came in before the sender was known.
    unacked: Vec<i32>,
    stopped: bool,
}

enum Drain {
    Deliver(Walk),
    Wait(Option<Instant>),
    Finish,
}

pub struct SequenceReceiver {
    id: SequenceId,
    runtime: WeakRuntime,
    timeout: Duration,
    state: Mutex<ReceiverState>,
    wake: Notify,
}

impl SequenceReceiver {
    /// Registers a new receiver and starts its drain task.
    pub(crate) fn spawn(runtime: &Runtime, lossless: bool) -> Arc<Self> {
        let receiver = runtime.register_receiver(|id| Self {
            id,
            runtime: runtime.downgrade(),
            timeout: runtime.config().sequence_timeout,
            state: Mutex::new(ReceiverState {
                sender_id: SenderId(0),
                lossless,
                path_to_proxy: None,
                delivered: 0,
                furthest: 0,
                slots: BTreeMap::new(),
                last: None,
                unacked: Vec::new(),
                stopped: false,
            }),
            wake: Notify::new(),
        });
        tracing::debug!(sequence = %receiver.id, lossless, "sequence receiver started");
        tokio::spawn(receiver.clone().drain());
        receiver
    }

    pub fn id(&self) -> SequenceId {
        self.id
    }

    pub fn is_lossless(&self) -> bool {
        lock(&self.state).lossless
    }

    /// Attaches the sending side. A lossless sequence stays lossless.
    ///
    /// Returns the acknowledgements owed for messages that overtook the start record.
    pub(crate) fn start(
        &self,
        sender_id: SenderId,
        lossless: bool,
        path_to_proxy: Option<LinkStack>,
    ) -> Result<Vec<LinkMessage>> {
        let mut state = lock(&self.state);
        state.sender_id = sender_id;
        state.lossless |= lossless;
        if path_to_proxy.is_some() {
            state.path_to_proxy = path_to_proxy;
        }
        let owed = std::mem::take(&mut state.unacked);
        let mut acks = Vec::with_capacity(owed.len());
        for index in owed {
            if let Some(ack) = self.request(&state, index, false)? {
                acks.push(ack);
            }
        }
        Ok(acks)
    }

    /// The handshake to advertise while nothing has arrived yet.
    pub(crate) fn start_link(&self) -> Option<LinkSequence> {
        let state = lock(&self.state);
        let fresh = state.delivered == 0 && state.slots.is_empty() && !state.stopped;
        fresh.then_some(LinkSequence::StartReply {
            sequence_id: self.id,
            sender_id: state.sender_id,
            lossless: state.lossless,
        })
    }

    /// Accepts message `index`. Lossless sequences acknowledge it before it is processed.
    pub(crate) async fn index(&self, runtime: &Runtime, index: i32, is_last: bool, walk: Walk) -> Result<()> {
        if index < 1 {
            return Err(Error::protocol(format!("Invalid sequence index {}", index)));
        }
        let ack = {
            let mut state = lock(&self.state);
            if state.stopped {
                return Ok(());
            }
            let duplicate = index <= state.delivered || matches!(state.slots.get(&index), Some(Slot::Ready(_)));
            if duplicate {
                tracing::trace!(sequence = %self.id, index, "duplicate dropped");
            } else {
                if is_last {
                    state.last = Some(index);
                }
                if state.lossless {
                    let due = Instant::now() + self.timeout;
                    let first_gap = state.furthest.max(state.delivered) + 1;
                    for gap in first_gap..index {
                        state.slots.entry(gap).or_insert(Slot::Missing { due });
                    }
                }
                state.furthest = state.furthest.max(index);
                state.slots.insert(index, Slot::Ready(walk));
            }
            if !state.lossless {
                None
            } else {
                let ack = self.request(&state, index, false)?;
                if ack.is_none() && !duplicate {
                    state.unacked.push(index);
                }
                ack
            }
        };
        if let Some(ack) = ack {
            runtime.dispatch(ack).await;
        }
        self.wake.notify_one();
        Ok(())
    }

    /// Stops at once, dropping whatever is still parked.
    pub(crate) fn stop(&self) {
        {
            let mut state = lock(&self.state);
            state.stopped = true;
            state.slots.clear();
        }
        self.wake.notify_one();
    }

    /// An acknowledgement or resend request on its way back to the sender.
    fn request(&self, state: &ReceiverState, index: i32, resend: bool) -> Result<Option<LinkMessage>> {
        let Some(mut path_to) = state.path_to_proxy.clone() else {
            return Ok(None);
        };
        if state.sender_id.value() == 0 {
            return Ok(None);
        }
        if matches!(path_to.peek()?, Some(Link::Apartment(_))) {
            path_to.pop()?;
        }
        path_to.append(Link::Sequence(LinkSequence::IndexReply { sender_id: state.sender_id, index, resend }))?;
        Ok(Some(LinkMessage::new(path_to, None, true)))
    }

    fn next(&self) -> Result<(Drain, Vec<LinkMessage>)> {
        let mut state = lock(&self.state);
        if state.stopped {
            return Ok((Drain::Finish, Vec::new()));
        }
        if state.last.is_some_and(|last| state.delivered >= last) {
            state.stopped = true;
            return Ok((Drain::Finish, Vec::new()));
        }

        let next = if state.lossless {
            Some(state.delivered + 1).filter(|i| matches!(state.slots.get(i), Some(Slot::Ready(_))))
        } else {
            state.slots.iter().find(|(_, slot)| matches!(slot, Slot::Ready(_))).map(|(i, _)| *i)
        };
        if let Some(index) = next {
            if let Some(Slot::Ready(walk)) = state.slots.remove(&index) {
                state.delivered = index;
                return Ok((Drain::Deliver(walk), Vec::new()));
            }
        }

        let now = Instant::now();
        let mut overdue = Vec::new();
        let mut earliest: Option<Instant> = None;
        for (index, slot) in state.slots.iter_mut() {
            if let Slot::Missing { due } = slot {
                if *due <= now {
                    overdue.push(*index);
                    *due = now + self.timeout;
                }
                earliest = Some(earliest.map_or(*due, |e| e.min(*due)));
            }
        }
        let mut requests = Vec::with_capacity(overdue.len());
        for index in overdue {
            tracing::debug!(sequence = %self.id, index, "requesting resend");
            if let Some(request) = self.request(&state, index, true)? {
                requests.push(request);
            }
        }
        Ok((Drain::Wait(earliest), requests))
    }

    async fn drain(self: Arc<Self>) {
        loop {
            let (drain, requests) = match self.next() {
                Ok(next) => next,
                Err(e) => {
                    if let Some(runtime) = self.runtime.upgrade() {
                        runtime.report("sequence", &e);
                    }
                    (Drain::Finish, Vec::new())
                }
            };
            let Some(runtime) = self.runtime.upgrade() else {
                break;
            };
            for request in requests {
                runtime.dispatch(request).await;
            }
            match drain {
                Drain::Deliver(walk) => runtime.run(walk).await,
                Drain::Wait(due) => {
                    drop(runtime);
                    match due {
                        Some(due) => {
                            tokio::select! {
                                _ = tokio::time::sleep_until(due) => {}
                                _ = self.wake.notified() => {}
                            }
                        }
                        None => self.wake.notified().await,
                    }
                }
                Drain::Finish => break,
            }
        }
        tracing::debug!(sequence = %self.id, "sequence receiver finished");
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.remove_receiver(self.id);
        }
    }
}

impl std::fmt::Debug for SequenceReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("SequenceReceiver")
            .field("id", &self.id)
            .field("lossless", &state.lossless)
            .field("delivered", &state.delivered)
            .field("parked", &state.slots.len())
            .finish()
    }
}
