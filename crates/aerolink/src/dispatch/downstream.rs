// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Local downstream subscribers.
//!
//! One entry per `subscribe()` call, each with fully independent state:
//! its own demand counter and its own backlog of undelivered items. The
//! backlog is what lets several local subscribers fan out one inbound
//! stream without coupling their pace - an entry that has not requested
//! yet parks items its siblings already consumed instead of losing them.
//! The dispatcher thread owns delivery; consumer threads only enqueue
//! request/cancel commands through the [`DownstreamSubscription`] handle,
//! so subscriber callbacks are never concurrent.

use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::Command;
use crate::error::Error;
use crate::flow::{Subscriber, Subscription};
use crate::protocol::UNBOUNDED;
use crate::wake::WakeNotifier;

static NEXT_ENTRY_ID: AtomicU64 = AtomicU64::new(1);

/// State for one local subscriber.
pub(crate) struct DownstreamEntry {
    id: u64,
    subscriber: Mutex<Box<dyn Subscriber<Vec<u8>>>>,
    requested: AtomicU64,
    pending: Mutex<VecDeque<Vec<u8>>>,
    complete_pending: AtomicBool,
    cancelled: AtomicBool,
    terminated: AtomicBool,
}

impl DownstreamEntry {
    pub fn new(subscriber: Box<dyn Subscriber<Vec<u8>>>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ENTRY_ID.fetch_add(1, Ordering::Relaxed),
            subscriber: Mutex::new(subscriber),
            requested: AtomicU64::new(0),
            pending: Mutex::new(VecDeque::new()),
            complete_pending: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn requested(&self) -> u64 {
        self.requested.load(Ordering::Acquire)
    }

    /// Saturating add; `UNBOUNDED` is absorbing.
    pub fn add_requested(&self, n: u64) {
        let _ = self
            .requested
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current == UNBOUNDED || n == UNBOUNDED {
                    Some(UNBOUNDED)
                } else {
                    Some(current.saturating_add(n))
                }
            });
    }

    pub fn is_live(&self) -> bool {
        !self.cancelled.load(Ordering::Acquire) && !self.terminated.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Fire `on_subscribe` on the caller thread, before the entry is active.
    pub fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.subscriber.lock().on_subscribe(subscription);
    }

    /// Hand one item to this entry. It lands in the entry's own backlog and
    /// is delivered as far as current demand allows; with zero demand the
    /// item waits instead of being lost to a faster sibling. Returns the
    /// number of items actually delivered.
    pub fn offer_next(&self, item: Vec<u8>) -> usize {
        if !self.is_live() {
            return 0;
        }
        self.pending.lock().push_back(item);
        self.drain()
    }

    /// Deliver backlogged items while demand remains, then a deferred
    /// Complete once the backlog is empty. Returns the items delivered.
    pub fn drain(&self) -> usize {
        if self.cancelled.load(Ordering::Acquire) || self.terminated.load(Ordering::Acquire) {
            self.pending.lock().clear();
            return 0;
        }
        let mut delivered = 0;
        loop {
            let item = {
                let mut pending = self.pending.lock();
                if pending.is_empty() {
                    break;
                }
                if !self.take_one_requested() {
                    return delivered;
                }
                pending.pop_front()
            };
            match item {
                Some(item) => {
                    self.subscriber.lock().on_next(item);
                    delivered += 1;
                }
                None => break,
            }
        }
        // Backlog drained; release a Complete that was waiting behind it.
        if self.complete_pending.load(Ordering::Acquire)
            && !self.terminated.swap(true, Ordering::AcqRel)
        {
            self.subscriber.lock().on_complete();
        }
        delivered
    }

    fn take_one_requested(&self) -> bool {
        let took = self
            .requested
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| match current {
                0 | UNBOUNDED => None,
                n => Some(n - 1),
            });
        matches!(took, Ok(_) | Err(UNBOUNDED))
    }

    /// Terminal error, delivered at most once. Errors preempt any backlog.
    pub fn deliver_error(&self, error: Error) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pending.lock().clear();
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        self.subscriber.lock().on_error(error);
    }

    /// Terminal completion, delivered at most once. A backlogged entry gets
    /// its Complete only after the backlog drains, so items a sibling has
    /// already consumed are not cut off.
    pub fn deliver_complete(&self) {
        if self.cancelled.load(Ordering::Acquire) || self.terminated.load(Ordering::Acquire) {
            return;
        }
        if self.pending.lock().is_empty() {
            if !self.terminated.swap(true, Ordering::AcqRel) {
                self.subscriber.lock().on_complete();
            }
        } else {
            self.complete_pending.store(true, Ordering::Release);
        }
    }

    /// True while this entry still holds undelivered items.
    pub fn has_backlog(&self) -> bool {
        !self.pending.lock().is_empty()
    }
}

/// The `Subscription` handed to local subscribers. Routes demand and
/// cancellation onto the dispatcher thread as commands.
pub(crate) struct DownstreamSubscription {
    entry_id: u64,
    commands: Arc<ArrayQueue<Command>>,
    wake: Arc<WakeNotifier>,
}

impl DownstreamSubscription {
    pub fn new(entry_id: u64, commands: Arc<ArrayQueue<Command>>, wake: Arc<WakeNotifier>) -> Self {
        Self {
            entry_id,
            commands,
            wake,
        }
    }

    fn push(&self, command: Command) {
        let mut command = command;
        let deadline = Instant::now() + Duration::from_secs(1);
        loop {
            match self.commands.push(command) {
                Ok(()) => break,
                Err(rejected) => {
                    if Instant::now() >= deadline {
                        log::warn!(
                            "[DownstreamSubscription] command queue full for entry {}, giving up",
                            self.entry_id
                        );
                        return;
                    }
                    command = rejected;
                    std::thread::sleep(Duration::from_micros(50));
                }
            }
        }
        self.wake.notify();
    }
}

impl Subscription for DownstreamSubscription {
    fn request(&self, n: u64) {
        if n == 0 {
            log::warn!(
                "[DownstreamSubscription] request(0) from entry {} ignored",
                self.entry_id
            );
            return;
        }
        self.push(Command::Request {
            entry_id: self.entry_id,
            n,
        });
    }

    fn cancel(&self) {
        self.push(Command::CancelDownstream {
            entry_id: self.entry_id,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe {
        items: Arc<Mutex<Vec<Vec<u8>>>>,
        errors: Arc<AtomicU64>,
        completes: Arc<AtomicU64>,
    }

    impl Subscriber<Vec<u8>> for Probe {
        fn on_subscribe(&mut self, _subscription: Arc<dyn Subscription>) {}
        fn on_next(&mut self, item: Vec<u8>) {
            self.items.lock().push(item);
        }
        fn on_error(&mut self, _error: Error) {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        fn on_complete(&mut self) {
            self.completes.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn probe() -> (Arc<Mutex<Vec<Vec<u8>>>>, Arc<AtomicU64>, Arc<AtomicU64>, Box<Probe>) {
        let items = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(AtomicU64::new(0));
        let completes = Arc::new(AtomicU64::new(0));
        let subscriber = Box::new(Probe {
            items: Arc::clone(&items),
            errors: Arc::clone(&errors),
            completes: Arc::clone(&completes),
        });
        (items, errors, completes, subscriber)
    }

    #[test]
    fn items_without_demand_are_backlogged_not_lost() {
        let (items, _, _, subscriber) = probe();
        let entry = DownstreamEntry::new(subscriber);

        assert_eq!(entry.offer_next(b"one".to_vec()), 0);
        assert_eq!(entry.offer_next(b"two".to_vec()), 0);
        assert!(items.lock().is_empty());
        assert!(entry.has_backlog());

        entry.add_requested(1);
        assert_eq!(entry.drain(), 1);
        assert_eq!(items.lock().clone(), vec![b"one".to_vec()]);
        assert!(entry.has_backlog());

        entry.add_requested(1);
        assert_eq!(entry.drain(), 1);
        assert_eq!(
            items.lock().clone(),
            vec![b"one".to_vec(), b"two".to_vec()]
        );
        assert!(!entry.has_backlog());
    }

    #[test]
    fn unbounded_demand_delivers_immediately() {
        let (items, _, _, subscriber) = probe();
        let entry = DownstreamEntry::new(subscriber);
        entry.add_requested(UNBOUNDED);
        for i in 0..10u8 {
            assert_eq!(entry.offer_next(vec![i]), 1);
        }
        assert_eq!(items.lock().len(), 10);
        assert_eq!(entry.requested(), UNBOUNDED);
        assert!(!entry.has_backlog());
    }

    #[test]
    fn terminal_signals_fire_once() {
        let (_, errors, completes, subscriber) = probe();
        let entry = DownstreamEntry::new(subscriber);
        entry.deliver_error(Error::TransportTimeout);
        entry.deliver_error(Error::TransportTimeout);
        entry.deliver_complete();
        assert_eq!(errors.load(Ordering::Relaxed), 1);
        assert_eq!(completes.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn complete_waits_behind_the_backlog() {
        let (items, _, completes, subscriber) = probe();
        let entry = DownstreamEntry::new(subscriber);

        entry.offer_next(b"one".to_vec());
        entry.deliver_complete();
        assert_eq!(completes.load(Ordering::Relaxed), 0, "Complete cut the backlog off");

        entry.add_requested(1);
        assert_eq!(entry.drain(), 1);
        assert_eq!(items.lock().len(), 1);
        assert_eq!(completes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn error_preempts_the_backlog() {
        let (items, errors, _, subscriber) = probe();
        let entry = DownstreamEntry::new(subscriber);

        entry.offer_next(b"one".to_vec());
        entry.deliver_error(Error::TransportTimeout);
        assert_eq!(errors.load(Ordering::Relaxed), 1);
        assert!(!entry.has_backlog());

        entry.add_requested(1);
        assert_eq!(entry.drain(), 0);
        assert!(items.lock().is_empty());
    }

    #[test]
    fn cancelled_entry_stops_delivering() {
        let (items, _, _, subscriber) = probe();
        let entry = DownstreamEntry::new(subscriber);
        entry.add_requested(5);
        entry.cancel();
        assert_eq!(entry.offer_next(b"x".to_vec()), 0);
        assert_eq!(entry.drain(), 0);
        assert!(items.lock().is_empty());
        assert!(!entry.has_backlog());
    }
}
