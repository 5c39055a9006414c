// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reactive-Streams traits.
//!
//! The processor is both a [`Publisher`] (frames in, items out) and a
//! [`Subscriber`] (items in, frames out). Demand-driven flow control runs
//! through [`Subscription::request`]; `u64::MAX` means unbounded.
//!
//! # Thread Safety
//! Subscriber callbacks are invoked from the processor's dispatcher thread
//! and are never concurrent for a given subscriber. `Subscription` methods
//! may be called from any thread, including processor-internal threads, so
//! implementations must not emit synchronously into the same processor from
//! `request` - schedule emission on a producer thread instead.

use std::sync::Arc;

use crate::error::Error;

/// Demand requested when a consumer wants every item the producer has.
pub const UNBOUNDED: u64 = u64::MAX;

/// Link between a subscriber and its producer.
pub trait Subscription: Send + Sync {
    /// Add `n` to the demand this subscriber grants its producer.
    fn request(&self, n: u64);

    /// Stop the flow. Items already in flight may still be delivered.
    fn cancel(&self);
}

/// Receiver of a stream of items and at most one terminal signal.
pub trait Subscriber<T>: Send {
    /// Called exactly once, before any other signal.
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>);

    /// Called once per item, never exceeding requested demand.
    fn on_next(&mut self, item: T);

    /// Terminal: the stream failed. No further signals follow.
    fn on_error(&mut self, error: Error);

    /// Terminal: the stream ended normally. No further signals follow.
    fn on_complete(&mut self);
}

/// Source of a stream of items.
pub trait Publisher<T> {
    /// Attach `subscriber` to this stream. `on_subscribe` fires before this
    /// call returns.
    fn subscribe(&self, subscriber: Box<dyn Subscriber<T>>);
}

/// Single-assignment cell holding the upstream subscription.
///
/// The processor binds its upstream exactly once, in `on_subscribe`; the
/// sender and dispatcher threads then drive it through this cell. An
/// explicit Unbound -> Bound transition replaces ad-hoc mutable sharing of
/// the subscription.
pub struct UpstreamCell {
    cell: std::sync::OnceLock<Arc<dyn Subscription>>,
    cancelled: std::sync::atomic::AtomicBool,
}

impl UpstreamCell {
    pub fn new() -> Self {
        Self {
            cell: std::sync::OnceLock::new(),
            cancelled: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Bind the upstream. Fails (returning the rejected subscription) when a
    /// binding already exists.
    pub fn bind(
        &self,
        subscription: Arc<dyn Subscription>,
    ) -> std::result::Result<(), Arc<dyn Subscription>> {
        self.cell.set(subscription)
    }

    pub fn is_bound(&self) -> bool {
        self.cell.get().is_some()
    }

    /// Forward demand upstream. No-op while unbound or after cancellation.
    pub fn request(&self, n: u64) {
        if self.cancelled.load(std::sync::atomic::Ordering::Acquire) {
            return;
        }
        if let Some(subscription) = self.cell.get() {
            subscription.request(n);
        }
    }

    /// Cancel the upstream once; later calls are no-ops.
    pub fn cancel(&self) {
        if self
            .cancelled
            .swap(true, std::sync::atomic::Ordering::AcqRel)
        {
            return;
        }
        if let Some(subscription) = self.cell.get() {
            subscription.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::Acquire)
    }
}

impl Default for UpstreamCell {
    fn default() -> Self {
        Self::new()
    }
}
