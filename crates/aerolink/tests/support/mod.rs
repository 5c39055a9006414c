// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared fixtures for the end-to-end scenarios.

#![allow(dead_code)]

use aerolink::{
    Context, DriverConfig, DriverManager, Error, Processor, Subscriber, Subscription, UNBOUNDED,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A fresh driver manager so every test owns its transport.
pub fn fresh_manager(window: usize) -> Arc<DriverManager> {
    DriverManager::new(DriverConfig {
        retry_shutdown_millis: 20,
        shutdown_timeout: Duration::from_secs(5),
        auto_shutdown: true,
        publication_window: window,
    })
}

/// Context with fast heartbeats, both directions on one shared channel.
pub fn test_context(name: &str, channel: &str, manager: &Arc<DriverManager>) -> Context {
    Context::new(name)
        .sender_channel(channel)
        .receiver_channel(channel)
        .heartbeat_interval_millis(100)
        .heartbeat_timeout_millis(2_000)
        .driver_manager(Arc::clone(manager))
}

/// Poll `condition` until it holds or `bound` elapses.
pub fn wait_until(bound: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < bound {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

// ============================================================================
// Downstream probe
// ============================================================================

#[derive(Default)]
struct ProbeState {
    items: Mutex<Vec<Vec<u8>>>,
    errors: Mutex<Vec<Error>>,
    completes: AtomicU64,
    subscription: Mutex<Option<Arc<dyn Subscription>>>,
}

/// Test-side view of a subscriber: items seen, terminals seen, demand lever.
pub struct TestProbe {
    state: Arc<ProbeState>,
}

/// The subscriber half handed to `Processor::subscribe`.
pub struct ProbeSubscriber {
    state: Arc<ProbeState>,
    initial_request: Option<u64>,
}

impl Subscriber<Vec<u8>> for ProbeSubscriber {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        if let Some(n) = self.initial_request {
            subscription.request(n);
        }
        *self.state.subscription.lock().expect("probe lock") = Some(subscription);
    }

    fn on_next(&mut self, item: Vec<u8>) {
        self.state.items.lock().expect("probe lock").push(item);
    }

    fn on_error(&mut self, error: Error) {
        self.state.errors.lock().expect("probe lock").push(error);
    }

    fn on_complete(&mut self) {
        self.state.completes.fetch_add(1, Ordering::SeqCst);
    }
}

impl TestProbe {
    /// Probe that only requests when the test says so.
    pub fn manual() -> (TestProbe, Box<ProbeSubscriber>) {
        Self::with_initial(None)
    }

    /// Probe that requests unbounded demand at subscription time.
    pub fn unlimited() -> (TestProbe, Box<ProbeSubscriber>) {
        Self::with_initial(Some(UNBOUNDED))
    }

    fn with_initial(initial_request: Option<u64>) -> (TestProbe, Box<ProbeSubscriber>) {
        let state = Arc::new(ProbeState::default());
        (
            TestProbe {
                state: Arc::clone(&state),
            },
            Box::new(ProbeSubscriber {
                state,
                initial_request,
            }),
        )
    }

    pub fn request(&self, n: u64) {
        let guard = self.state.subscription.lock().expect("probe lock");
        guard
            .as_ref()
            .expect("probe requested before on_subscribe")
            .request(n);
    }

    pub fn cancel(&self) {
        let guard = self.state.subscription.lock().expect("probe lock");
        if let Some(subscription) = guard.as_ref() {
            subscription.cancel();
        }
    }

    pub fn item_count(&self) -> usize {
        self.state.items.lock().expect("probe lock").len()
    }

    pub fn items_utf8(&self) -> Vec<String> {
        self.state
            .items
            .lock()
            .expect("probe lock")
            .iter()
            .map(|item| String::from_utf8_lossy(item).into_owned())
            .collect()
    }

    pub fn complete_count(&self) -> u64 {
        self.state.completes.load(Ordering::SeqCst)
    }

    pub fn error_count(&self) -> usize {
        self.state.errors.lock().expect("probe lock").len()
    }

    pub fn has_timeout_error(&self) -> bool {
        self.state
            .errors
            .lock()
            .expect("probe lock")
            .iter()
            .any(|error| matches!(error, Error::TransportTimeout))
    }

    pub fn has_upstream_error(&self, text: &str) -> bool {
        self.state
            .errors
            .lock()
            .expect("probe lock")
            .iter()
            .any(|error| matches!(error, Error::Upstream(message) if message == text))
    }

    pub fn await_items(&self, n: usize, bound: Duration) -> bool {
        wait_until(bound, || self.item_count() >= n)
    }

    pub fn await_complete(&self, bound: Duration) -> bool {
        wait_until(bound, || self.complete_count() > 0)
    }

    pub fn await_error(&self, bound: Duration) -> bool {
        wait_until(bound, || self.error_count() > 0)
    }
}

// ============================================================================
// Upstream producer
// ============================================================================

/// What the producer signals after its items are drained.
pub enum Terminal {
    Complete,
    Error(String),
    /// Stay open; the stream never terminates on its own.
    Open,
}

struct ProducerSubscription {
    credit: Arc<AtomicU64>,
    cancelled: Arc<AtomicBool>,
}

impl Subscription for ProducerSubscription {
    fn request(&self, n: u64) {
        let _ = self
            .credit
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current == u64::MAX || n == u64::MAX {
                    Some(u64::MAX)
                } else {
                    Some(current.saturating_add(n))
                }
            });
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

/// Bind a demand-driven producer to the processor's subscriber side. Items
/// are emitted from a dedicated thread, strictly within requested credit,
/// followed by `terminal`.
pub fn bind_producer(processor: &Processor, items: Vec<Vec<u8>>, terminal: Terminal) {
    let credit = Arc::new(AtomicU64::new(0));
    let cancelled = Arc::new(AtomicBool::new(false));
    processor.on_subscribe(Arc::new(ProducerSubscription {
        credit: Arc::clone(&credit),
        cancelled: Arc::clone(&cancelled),
    }));

    let processor = processor.clone();
    std::thread::Builder::new()
        .name("test-producer".to_string())
        .spawn(move || {
            let mut queue = items.into_iter();
            loop {
                if cancelled.load(Ordering::Acquire) {
                    return;
                }
                let available = credit.load(Ordering::Acquire);
                if available == 0 {
                    std::thread::sleep(Duration::from_micros(200));
                    continue;
                }
                match queue.next() {
                    Some(item) => {
                        if available != u64::MAX {
                            let _ = credit.fetch_update(
                                Ordering::AcqRel,
                                Ordering::Acquire,
                                |current| {
                                    if current == u64::MAX {
                                        None
                                    } else {
                                        Some(current.saturating_sub(1))
                                    }
                                },
                            );
                        }
                        processor.on_next(item);
                    }
                    None => break,
                }
            }
            match terminal {
                Terminal::Complete => processor.on_complete(),
                Terminal::Error(message) => processor.on_error(Error::Upstream(message)),
                Terminal::Open => {}
            }
        })
        .expect("spawn producer thread");
}

/// UTF-8 payload helper.
pub fn payloads(items: &[&str]) -> Vec<Vec<u8>> {
    items.iter().map(|s| s.as_bytes().to_vec()).collect()
}
