//! Outbound queue of a protocol instance
//!
//! Each queued item is a `Delivery`: an envelope bound to the node it is
//! sent to and to the channel its verdict goes to. A delivery reports
//! exactly one verdict. If it is dropped without one (queue cleared, task
//! aborted, instance rejected) it reports failure.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use crate::common::Node;
use crate::envelope::EnvelopeRef;
use crate::manager::Notification;
use crate::metrics::{ENVELOPES_FAILED, ENVELOPES_SENT};

/// One envelope on its way to one target
pub struct Delivery {
    envelope: EnvelopeRef,
    target: Node,
    notify: mpsc::UnboundedSender<Notification>,
    resolved: bool,
}

impl Delivery {
    pub fn new(
        envelope: EnvelopeRef,
        target: Node,
        notify: mpsc::UnboundedSender<Notification>,
    ) -> Self {
        Self {
            envelope,
            target,
            notify,
            resolved: false,
        }
    }

    pub fn envelope(&self) -> &EnvelopeRef {
        &self.envelope
    }

    pub fn target(&self) -> &Node {
        &self.target
    }

    /// Report that the envelope reached the target
    pub fn succeed(mut self) {
        self.resolve(true);
    }

    /// Report that the envelope could not be sent
    pub fn fail(mut self) {
        self.resolve(false);
    }

    fn resolve(&mut self, success: bool) {
        if self.resolved {
            return;
        }
        self.resolved = true;

        let envelope = self.envelope.clone();
        let target = self.target.clone();
        let notification = if success {
            ENVELOPES_SENT.inc();
            Notification::SendSuccess { envelope, target }
        } else {
            ENVELOPES_FAILED.inc();
            Notification::SendFailure { envelope, target }
        };
        // The owner may already be gone at shutdown
        let _ = self.notify.send(notification);
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if !self.resolved {
            debug!("Delivery to {} dropped unresolved", self.target);
            self.resolve(false);
        }
    }
}

/// FIFO of pending deliveries, closed when its instance winds down
#[derive(Default)]
pub struct SendQueue {
    items: Mutex<VecDeque<Delivery>>,
    notify: Notify,
    closed: AtomicBool,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delivery. A closed queue hands the delivery back.
    pub fn push(&self, delivery: Delivery) -> std::result::Result<(), Delivery> {
        let mut items = self.items.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(delivery);
        }
        items.push_back(delivery);
        drop(items);
        self.notify.notify_one();
        Ok(())
    }

    /// Take the next delivery without waiting
    pub fn try_pop(&self) -> Option<Delivery> {
        self.items.lock().pop_front()
    }

    /// Wait for the next delivery. Returns `None` once the queue is closed
    /// and empty.
    pub async fn pop(&self) -> Option<Delivery> {
        loop {
            if let Some(delivery) = self.try_pop() {
                return Some(delivery);
            }
            if self.is_closed() {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Refuse further pushes. Queued deliveries stay.
    pub fn close(&self) {
        let _items = self.items.lock();
        self.closed.store(true, Ordering::Release);
        drop(_items);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Close and fail everything still queued. Returns the number failed.
    pub fn close_and_clear(&self) -> usize {
        let drained: Vec<Delivery> = {
            let mut items = self.items.lock();
            self.closed.store(true, Ordering::Release);
            items.drain(..).collect()
        };
        self.notify.notify_waiters();
        self.notify.notify_one();

        let count = drained.len();
        for delivery in drained {
            delivery.fail();
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;

    fn delivery(tx: &mpsc::UnboundedSender<Notification>, node: &str) -> Delivery {
        Delivery::new(
            EnvelopeRef::new(Envelope::new()),
            Node::peer(node, Vec::new()),
            tx.clone(),
        )
    }

    #[test]
    fn test_delivery_resolves_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();

        delivery(&tx, "a").succeed();
        drop(delivery(&tx, "b"));

        assert!(matches!(rx.try_recv(), Ok(Notification::SendSuccess { .. })));
        match rx.try_recv() {
            Ok(Notification::SendFailure { target, .. }) => assert_eq!(target.id, "b"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_close_and_clear_fails_queued() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = SendQueue::new();
        assert!(queue.push(delivery(&tx, "a")).is_ok());
        assert!(queue.push(delivery(&tx, "b")).is_ok());

        assert_eq!(queue.close_and_clear(), 2);
        assert!(queue.is_empty());
        assert!(queue.push(delivery(&tx, "c")).is_err());

        let mut failures = 0;
        while let Ok(n) = rx.try_recv() {
            assert!(matches!(n, Notification::SendFailure { .. }));
            failures += 1;
        }
        // Two cleared plus the rejected push, dropped at the assert
        assert_eq!(failures, 3);
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push_and_close() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let queue = std::sync::Arc::new(SendQueue::new());

        let q = queue.clone();
        let waiter = tokio::spawn(async move {
            let first = q.pop().await.map(|d| d.target().id.clone());
            if let Some(d) = q.try_pop() {
                d.succeed();
            }
            let second = q.pop().await.map(|d| d.target().id.clone());
            (first, second)
        });

        tokio::task::yield_now().await;
        queue.push(delivery(&tx, "a")).ok();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        queue.close();

        let (first, second) = waiter.await.unwrap();
        assert_eq!(first.as_deref(), Some("a"));
        assert_eq!(second, None);
    }
}
