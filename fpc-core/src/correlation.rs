//! Endpoint correlation engine (C5): correlation-id allocation and the
//! pending-reply / pending-timeout tables.
//!
//! These tables are owned exclusively by the endpoint's actor task (see
//! `endpoint.rs`) — nothing here takes a lock, because nothing here is ever
//! touched by more than one task at a time. That's the actor-isolation
//! discipline the spec calls for: state mutation happens only inside the
//! command loop.

use std::collections::HashMap;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{FpcError, RequestError};
use crate::message::{CorrelationId, Message};

/// Monotonically increasing correlation-id source. Standardized on 64-bit
/// per the spec's resolution of a source ambiguity between 32- and 64-bit
/// counters; in practice this never wraps.
#[derive(Debug)]
pub struct CorrelationAllocator {
    next: CorrelationId,
}

impl CorrelationAllocator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Allocates the next id, skipping the reserved `0` (unsolicited) value
    /// on overflow.
    pub fn allocate(&mut self) -> CorrelationId {
        let id = self.next;
        self.next = match self.next.checked_add(1) {
            Some(0) | None => 1,
            Some(n) => n,
        };
        id
    }
}

impl Default for CorrelationAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// What a parked `request()` caller resolves with.
pub type ReplyResult = Result<Message, RequestError>;

/// One entry in the pending-reply table: the channel back to the waiting
/// caller.
struct PendingReply {
    reply_tx: oneshot::Sender<ReplyResult>,
}

/// Tracks in-flight requests: the pending-reply table and its
/// parallel pending-timeout table, kept in sync per the invariant that
/// every pending reply with a deadline has exactly one timeout entry.
#[derive(Default)]
pub struct PendingTables {
    replies: HashMap<CorrelationId, PendingReply>,
    timeouts: HashMap<CorrelationId, JoinHandle<()>>,
}

impl PendingTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter before the send is dispatched to the I/O pool —
    /// this ordering closes the lost-reply race where a reply arrives
    /// before the caller has parked.
    pub fn register(&mut self, id: CorrelationId, reply_tx: oneshot::Sender<ReplyResult>) {
        self.replies.insert(id, PendingReply { reply_tx });
    }

    pub fn register_timeout(&mut self, id: CorrelationId, handle: JoinHandle<()>) {
        self.timeouts.insert(id, handle);
    }

    /// Removes and returns the timeout task for `id`, if any, without
    /// aborting it — used when the caller wants to abort explicitly and
    /// distinguish "there was no timeout task" from "there was one".
    pub fn take_timeout(&mut self, id: CorrelationId) -> Option<JoinHandle<()>> {
        self.timeouts.remove(&id)
    }

    /// Removes a waiter's timeout task (if any) and aborts it. Called
    /// whenever the waiter resolves for a reason other than its own
    /// timeout firing.
    pub fn cancel_timeout(&mut self, id: CorrelationId) {
        if let Some(handle) = self.timeouts.remove(&id) {
            handle.abort();
        }
    }

    /// Dispatch of an incoming reply frame: removes the pending-reply entry
    /// and its timeout, and resolves the waiter. If there was no matching
    /// entry, hands `result` back unconsumed so the caller can deliver the
    /// frame to the unsolicited stream instead.
    pub fn resolve(&mut self, id: CorrelationId, result: ReplyResult) -> Result<(), ReplyResult> {
        self.cancel_timeout(id);
        match self.replies.remove(&id) {
            Some(pending) => {
                // The waiter may already have gone away (cancelled); a
                // failed send here just means the reply is dropped, which
                // is the documented behavior for orphaned replies.
                let _ = pending.reply_tx.send(result);
                Ok(())
            }
            None => Err(result),
        }
    }

    /// True if `id` currently has a pending-reply entry.
    pub fn has_pending(&self, id: CorrelationId) -> bool {
        self.replies.contains_key(&id)
    }

    /// Removes a waiter without resolving it — used when the caller itself
    /// is cancelling and will resolve the channel on its own.
    pub fn remove(&mut self, id: CorrelationId) {
        self.cancel_timeout(id);
        self.replies.remove(&id);
    }

    pub fn is_empty(&self) -> bool {
        self.replies.is_empty() && self.timeouts.is_empty()
    }

    /// Teardown: resolves every pending waiter with `err` and cancels every
    /// timeout task, leaving both tables empty.
    pub fn drain_with_error(&mut self, err: impl Fn() -> FpcError) {
        for (_, handle) in self.timeouts.drain() {
            handle.abort();
        }
        for (_, pending) in self.replies.drain() {
            let _ = pending.reply_tx.send(Err(err().into()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_starts_at_one_and_increments() {
        let mut alloc = CorrelationAllocator::new();
        assert_eq!(alloc.allocate(), 1);
        assert_eq!(alloc.allocate(), 2);
        assert_eq!(alloc.allocate(), 3);
    }

    #[test]
    fn allocator_skips_zero_on_overflow() {
        let mut alloc = CorrelationAllocator { next: u64::MAX };
        assert_eq!(alloc.allocate(), u64::MAX);
        assert_eq!(alloc.allocate(), 1);
    }

    #[tokio::test]
    async fn resolve_without_pending_entry_hands_result_back() {
        let mut tables = PendingTables::new();
        assert!(tables.resolve(5, Err(FpcError::Disconnected.into())).is_err());
    }

    #[tokio::test]
    async fn register_then_resolve_delivers_to_waiter() {
        let mut tables = PendingTables::new();
        let (tx, rx) = oneshot::channel();
        tables.register(1, tx);
        assert!(tables.has_pending(1));

        let message = Message::notification(crate::message::MessageId(2), vec![4], vec![]);
        assert!(tables.resolve(1, Ok(message)).is_ok());
        assert!(!tables.has_pending(1));

        let got = rx.await.unwrap().unwrap();
        assert_eq!(got.payload, vec![4]);
    }

    #[tokio::test]
    async fn drain_resolves_every_waiter_with_the_given_error() {
        let mut tables = PendingTables::new();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        tables.register(1, tx1);
        tables.register(2, tx2);

        tables.drain_with_error(|| FpcError::Disconnected);

        assert!(tables.is_empty());
        assert!(matches!(
            rx1.await.unwrap(),
            Err(RequestError::Transport(FpcError::Disconnected))
        ));
        assert!(matches!(
            rx2.await.unwrap(),
            Err(RequestError::Transport(FpcError::Disconnected))
        ));
    }
}
