//! # Event Broadcaster
//!
//! Multi-subscriber fan-out used to report vbucket state transitions to
//! whoever cares about them (mutation loggers, replication feeds, the REST
//! layer's streaming endpoints).
//!
//! ## Delivery Contract
//!
//! Delivery is best-effort and non-blocking. `submit` clones the message into
//! every registered channel with `try_send`; a subscriber whose channel is
//! full simply misses that message and a disconnected subscriber is pruned.
//! A slow subscriber can never stall the submitter or its peers, so
//! subscribers wanting lossless reception must register sufficiently
//! buffered channels.
//!
//! ## Ordering
//!
//! The subscriber set lock is held across the fanout, so for a single
//! submitting thread every subscriber observes messages in submission order.
//! Concurrent submitters interleave with no global order beyond each
//! submitter's own sequence.

use crossbeam_channel::{Sender, TrySendError};
use parking_lot::Mutex;

/// Fan-out of cloned messages to a set of subscriber channels.
///
/// Registration is idempotent per channel and unregistration is safe to
/// repeat; both are keyed on channel identity, not sender handle identity.
pub struct Broadcaster<T> {
    subscribers: Mutex<Vec<Sender<T>>>,
}

impl<T: Clone> Broadcaster<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Adds a subscriber channel. Registering the same channel twice keeps a
    /// single entry.
    pub fn register(&self, tx: &Sender<T>) {
        let mut subs = self.subscribers.lock();
        if !subs.iter().any(|s| s.same_channel(tx)) {
            subs.push(tx.clone());
        }
    }

    /// Removes a subscriber channel. Unknown channels are ignored.
    pub fn unregister(&self, tx: &Sender<T>) {
        self.subscribers.lock().retain(|s| !s.same_channel(tx));
    }

    /// Delivers `msg` to every registered subscriber without blocking.
    /// Subscribers with full channels miss the message; disconnected
    /// subscribers are dropped from the set.
    pub fn submit(&self, msg: T) {
        self.subscribers
            .lock()
            .retain(|s| !matches!(s.try_send(msg.clone()), Err(TrySendError::Disconnected(_))));
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.lock().is_empty()
    }
}

impl<T: Clone> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn submit_reaches_every_subscriber() {
        let b = Broadcaster::new();
        let (tx1, rx1) = bounded(4);
        let (tx2, rx2) = bounded(4);
        b.register(&tx1);
        b.register(&tx2);

        b.submit(7u32);

        assert_eq!(rx1.recv().unwrap(), 7);
        assert_eq!(rx2.recv().unwrap(), 7);
    }

    #[test]
    fn register_is_idempotent_per_channel() {
        let b = Broadcaster::new();
        let (tx, rx) = bounded(4);
        b.register(&tx);
        b.register(&tx);
        b.register(&tx.clone());

        assert_eq!(b.len(), 1);

        b.submit(1u32);
        assert_eq!(rx.recv().unwrap(), 1);
        assert!(rx.try_recv().is_err(), "one registration, one delivery");
    }

    #[test]
    fn unregister_is_safe_to_repeat() {
        let b = Broadcaster::new();
        let (tx, rx) = bounded::<u32>(4);
        b.register(&tx);
        b.unregister(&tx);
        b.unregister(&tx);

        b.submit(1);
        assert!(rx.try_recv().is_err());
        assert!(b.is_empty());
    }

    #[test]
    fn full_subscriber_does_not_block_others() {
        let b = Broadcaster::new();
        let (full_tx, full_rx) = bounded(1);
        let (roomy_tx, roomy_rx) = bounded(8);
        b.register(&full_tx);
        b.register(&roomy_tx);

        b.submit(1u32);
        b.submit(2u32);
        b.submit(3u32);

        // The full channel saw only the first message.
        assert_eq!(full_rx.try_recv().unwrap(), 1);
        assert!(full_rx.try_recv().is_err());

        // The buffered channel saw all of them, in order.
        assert_eq!(roomy_rx.try_recv().unwrap(), 1);
        assert_eq!(roomy_rx.try_recv().unwrap(), 2);
        assert_eq!(roomy_rx.try_recv().unwrap(), 3);
    }

    #[test]
    fn disconnected_subscribers_are_pruned() {
        let b = Broadcaster::new();
        let (tx, rx) = bounded::<u32>(4);
        b.register(&tx);
        drop(rx);

        b.submit(1);
        assert!(b.is_empty());
    }
}
