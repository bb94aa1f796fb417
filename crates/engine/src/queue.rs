// SPDX-License-Identifier: Apache-2.0

//! The ordered request queue between ingress and the dispatcher.
//!
//! Multi-producer, single-consumer. Messages pop strictly by scheduling
//! class; within one class the order is FIFO by enqueue time. The consumer
//! parks in [`OrderedQueue::wait`] and is woken by producers or by
//! [`OrderedQueue::forceful_awake`] at shutdown.

use crate::message::Message;
use parking_lot::{Condvar, Mutex};
use restune_common::QueuePriority;
use std::collections::{BTreeMap, VecDeque};

#[derive(Default)]
struct State {
    buckets: BTreeMap<QueuePriority, VecDeque<Message>>,
    force_wake: bool,
}

impl State {
    fn len(&self) -> usize {
        self.buckets.values().map(VecDeque::len).sum()
    }
}

/// The priority queue.
#[derive(Default)]
pub struct OrderedQueue {
    state: Mutex<State>,
    available: Condvar,
}

impl std::fmt::Debug for OrderedQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedQueue")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl OrderedQueue {
    /// An empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a message in its scheduling class and wakes the consumer.
    pub fn add_and_wakeup(&self, message: Message) {
        let mut state = self.state.lock();
        state
            .buckets
            .entry(message.priority())
            .or_default()
            .push_back(message);
        drop(state);
        let _ = self.available.notify_one();
    }

    /// Pops the highest-class, oldest message, if any.
    pub fn pop(&self) -> Option<Message> {
        let mut state = self.state.lock();
        let (&priority, _) = state.buckets.iter().find(|(_, q)| !q.is_empty())?;
        state
            .buckets
            .get_mut(&priority)
            .and_then(VecDeque::pop_front)
    }

    /// True when at least one message is queued.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.len() > 0
    }

    /// Number of queued messages across classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    /// True when no message is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocks the consumer until a message is available or a forceful wake
    /// arrives. Returns immediately when work is already queued.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        while state.len() == 0 && !state.force_wake {
            self.available.wait(&mut state);
        }
        state.force_wake = false;
    }

    /// Wakes the consumer without enqueueing anything.
    pub fn forceful_awake(&self) {
        let mut state = self.state.lock();
        state.force_wake = true;
        drop(state);
        let _ = self.available.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::UntuneOrigin;
    use crate::requests::test_support::tune;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    fn untune(handle: i64, priority: QueuePriority) -> Message {
        Message::Untune {
            handle,
            pid: 100,
            origin: UntuneOrigin::Client,
            priority,
        }
    }

    fn popped_handle(queue: &OrderedQueue) -> i64 {
        match queue.pop() {
            Some(Message::Untune { handle, .. }) => handle,
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn higher_class_pops_first() {
        let queue = OrderedQueue::new();
        queue.add_and_wakeup(untune(1, QueuePriority::ThirdPartyLow));
        queue.add_and_wakeup(untune(2, QueuePriority::SystemHigh));
        queue.add_and_wakeup(untune(3, QueuePriority::HighTransfer));

        assert_eq!(popped_handle(&queue), 3);
        assert_eq!(popped_handle(&queue), 2);
        assert_eq!(popped_handle(&queue), 1);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn same_class_is_fifo() {
        let queue = OrderedQueue::new();
        for handle in 1..=4 {
            queue.add_and_wakeup(untune(handle, QueuePriority::SystemLow));
        }
        for handle in 1..=4 {
            assert_eq!(popped_handle(&queue), handle);
        }
    }

    #[test]
    fn tune_message_inherits_request_priority() {
        let queue = OrderedQueue::new();
        let request = tune(1, 10, 0x0004_0000, 5);
        queue.add_and_wakeup(Message::Tune { request });
        queue.add_and_wakeup(untune(2, QueuePriority::HighTransfer));
        // The request carries third-party-low priority, so the untune wins.
        assert_eq!(popped_handle(&queue), 2);
        assert!(matches!(queue.pop(), Some(Message::Tune { .. })));
    }

    #[test]
    fn wait_returns_on_enqueue_from_another_thread() {
        let queue = Arc::new(OrderedQueue::new());
        let producer = queue.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.add_and_wakeup(Message::ServerCleanup);
        });
        queue.wait();
        assert!(queue.has_pending());
        handle.join().unwrap();
    }

    #[test]
    fn forceful_awake_unblocks_an_empty_queue() {
        let queue = Arc::new(OrderedQueue::new());
        let waker = queue.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.forceful_awake();
        });
        queue.wait();
        assert!(queue.is_empty());
        handle.join().unwrap();
    }
}
