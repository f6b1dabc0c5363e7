//! Call-number correlation for one apartment proxy.
//!
//! A waiter is registered before its message is dispatched, so a reply from
//! the same process can never overtake its own registration.

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::error::Error;
use crate::error::Result;
use crate::ids::IdSeed;
use crate::link::LinkData;
use crate::stack::LinkStack;

/// What came back for one call.
#[derive(Debug)]
pub(crate) struct Reply {
    pub data: Option<LinkData>,
    pub path_from: Option<LinkStack>,
}

pub(crate) type ReplyReceiver = oneshot::Receiver<Result<Reply>>;

pub(crate) struct NumberedWaits {
    seed: IdSeed,
    pending: DashMap<i32, oneshot::Sender<Result<Reply>>>,
}

impl NumberedWaits {
    pub fn new() -> Self {
        Self { seed: IdSeed::new(1), pending: DashMap::new() }
    }

    /// Registers a waiter under a fresh call number. The waiter is
    /// unregistered when the returned guard is dropped.
    pub fn prepare(&self) -> PendingCall<'_> {
        let number = self.seed.generate_free(|n| self.pending.contains_key(&n));
        let (tx, rx) = oneshot::channel();
        self.pending.insert(number, tx);
        PendingCall { waits: self, number, rx, settled: false }
    }

    /// Hands a reply to whoever waits for `number`. False if nobody does.
    pub fn complete(&self, number: i32, reply: Result<Reply>) -> bool {
        match self.pending.remove(&number) {
            Some((_, tx)) => {
                let _ = tx.send(reply);
                true
            }
            None => false,
        }
    }

    /// Fails every outstanding call.
    pub fn fail_all(&self, error: Error) {
        let numbers: Vec<i32> = self.pending.iter().map(|entry| *entry.key()).collect();
        for number in numbers {
            self.complete(number, Err(error.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

/// One registered call. Dropping it before the reply arrives forgets the call.
pub(crate) struct PendingCall<'a> {
    waits: &'a NumberedWaits,
    number: i32,
    rx: ReplyReceiver,
    /// The entry is gone from the table; the number may already be reused.
    settled: bool,
}

impl PendingCall<'_> {
    pub fn number(&self) -> i32 {
        self.number
    }

    /// Waits for the reply. `None` waits forever.
    pub async fn wait(mut self, timeout: Option<Duration>) -> Result<Reply> {
        let received = match timeout {
            None => (&mut self.rx).await,
            Some(timeout) => match tokio::time::timeout(timeout, &mut self.rx).await {
                Ok(received) => received,
                Err(_) => {
                    if self.waits.pending.remove(&self.number).is_some() {
                        self.settled = true;
                        return Err(Error::Timeout);
                    }
                    // The reply won the race against the timer and is already in the channel.
                    (&mut self.rx).await
                }
            },
        };
        self.settled = true;
        received.map_err(|_| Error::Closed)?
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.waits.pending.remove(&self.number);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply() -> Result<Reply> {
        Ok(Reply { data: None, path_from: None })
    }

    #[test]
    fn test_call_numbers_are_distinct() {
        let waits = NumberedWaits::new();
        let calls: Vec<PendingCall<'_>> = (0..100).map(|_| waits.prepare()).collect();
        let numbers: Vec<i32> = calls.iter().map(PendingCall::number).collect();
        let mut sorted = numbers.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 100);
        assert!(!numbers.contains(&0));
        assert_eq!(waits.len(), 100);
    }

    #[tokio::test]
    async fn test_replies_reach_their_own_waiter() {
        let waits = NumberedWaits::new();
        let first = waits.prepare();
        let second = waits.prepare();
        let data = LinkData::new(vec![7]);
        assert!(waits.complete(second.number(), Ok(Reply { data: Some(data), path_from: None })));
        assert!(waits.complete(first.number(), reply()));

        let second_reply = second.wait(Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(second_reply.data.unwrap().bytes, vec![7]);
        let first_reply = first.wait(Some(Duration::from_secs(1))).await.unwrap();
        assert!(first_reply.data.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_leaves_no_entry() {
        let waits = NumberedWaits::new();
        let call = waits.prepare();
        let number = call.number();
        let result = call.wait(Some(Duration::from_millis(50))).await;
        assert!(matches!(result, Err(Error::Timeout)));
        assert_eq!(waits.len(), 0);
        assert!(!waits.complete(number, reply()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_wait_leaves_no_entry() {
        let waits = NumberedWaits::new();
        let call = waits.prepare();
        let number = call.number();
        let abandoned = tokio::time::timeout(Duration::from_millis(50), call.wait(None)).await;
        assert!(abandoned.is_err());
        assert_eq!(waits.len(), 0);
        assert!(!waits.complete(number, reply()));

        drop(waits.prepare());
        assert_eq!(waits.len(), 0);
    }

    #[tokio::test]
    async fn test_fail_all() {
        let waits = NumberedWaits::new();
        let call = waits.prepare();
        waits.fail_all(Error::Closed);
        assert!(matches!(call.wait(None).await, Err(Error::Closed)));
    }
}
