// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wake notification for the sender and dispatcher threads.
//!
//! Two tiers: an atomic flag producers set lock-free on every enqueue, and a
//! condvar the consumer falls back to once a poll round made no progress.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Two-tier wake notifier shared between queue producers and one consumer.
#[derive(Debug)]
pub struct WakeNotifier {
    pending: AtomicBool,
    sleeping: Mutex<bool>,
    condvar: Condvar,
}

impl WakeNotifier {
    #[inline]
    pub fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            sleeping: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Shared notifier ready to hand to producers.
    #[inline]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Signal that work is available. Lock-free unless the consumer sleeps;
    /// the racy sleeping check costs at worst one extra condvar signal.
    #[inline]
    pub fn notify(&self) {
        self.pending.store(true, Ordering::Release);
        if *self.sleeping.lock() {
            self.condvar.notify_one();
        }
    }

    /// Consume the pending flag without blocking.
    #[inline]
    pub fn check_and_clear(&self) -> bool {
        self.pending.swap(false, Ordering::Acquire)
    }

    /// Block until notified or `timeout` elapses. Returns immediately when a
    /// notification is already pending.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.pending.swap(false, Ordering::Acquire) {
            return true;
        }

        let mut sleeping = self.sleeping.lock();
        if self.pending.swap(false, Ordering::Acquire) {
            return true;
        }

        *sleeping = true;
        let result = self.condvar.wait_for(&mut sleeping, timeout);
        *sleeping = false;

        if self.pending.swap(false, Ordering::Acquire) {
            !result.timed_out()
        } else {
            false
        }
    }
}

impl Default for WakeNotifier {
    fn default() -> Self {
        Self::new()
    }
}
