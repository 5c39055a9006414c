// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Outbound signal sender.
//!
//! One thread per processor owns the data and error publications and drains
//! a bounded ring of pending signals. Producers (the facade's `on_next` /
//! `on_error` / `on_complete`) only touch the ring, which keeps the
//! publication single-writer no matter how many upstream threads exist in
//! `share` mode.
//!
//! Next frames are demand-gated: one is published only while every live
//! session still has demand, and each publish consumes one unit from every
//! session. Terminal signals ride the same ring, so they drain behind every
//! pending Next; Error goes out on the error stream so it reaches peers that
//! stopped reading data.

use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::protocol::{Frame, FRAME_HEADER_LEN};
use crate::session::{DemandPump, SessionSnapshot};
use crate::transport::{Offer, Publication, MTU};
use crate::wake::WakeNotifier;

/// One queued upstream signal.
#[derive(Debug)]
pub(crate) enum Signal {
    Next(Vec<u8>),
    Complete,
    Error(String),
}

/// Counters maintained by the sender thread.
#[derive(Debug, Default)]
pub struct SenderMetrics {
    offer_retries: AtomicU64,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl SenderMetrics {
    /// Offer attempts that hit back-pressure or a disconnected stream.
    pub fn offer_retries(&self) -> u64 {
        self.offer_retries.load(Ordering::Relaxed)
    }

    /// Next frames successfully published.
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    /// Frames dropped for lack of live sessions.
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    fn add_retry(&self) {
        self.offer_retries.fetch_add(1, Ordering::Relaxed);
    }
}

/// Everything the sender thread needs at start.
pub(crate) struct SenderSetup {
    pub name: String,
    pub data_publication: Publication,
    pub error_publication: Publication,
    pub sessions: Arc<SessionSnapshot>,
    pub pump: Arc<DemandPump>,
    pub retry: Duration,
    pub linger: Duration,
    pub ring_capacity: usize,
    pub on_fatal: Box<dyn Fn(Error) + Send>,
}

/// Handle to the sender thread. Stopping is idempotent; dropping stops and
/// joins.
pub(crate) struct SignalSender {
    ring: Arc<ArrayQueue<Signal>>,
    wake: Arc<WakeNotifier>,
    stop: Arc<AtomicBool>,
    terminated: Arc<AtomicBool>,
    metrics: Arc<SenderMetrics>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SignalSender {
    pub fn start(setup: SenderSetup) -> SignalSender {
        let ring = Arc::new(ArrayQueue::new(setup.ring_capacity));
        let wake = WakeNotifier::shared();
        let stop = Arc::new(AtomicBool::new(false));
        let terminated = Arc::new(AtomicBool::new(false));
        let metrics = Arc::new(SenderMetrics::default());

        let worker = Worker {
            name: setup.name.clone(),
            ring: Arc::clone(&ring),
            wake: Arc::clone(&wake),
            stop: Arc::clone(&stop),
            terminated: Arc::clone(&terminated),
            metrics: Arc::clone(&metrics),
            data_publication: setup.data_publication,
            error_publication: setup.error_publication,
            sessions: setup.sessions,
            pump: setup.pump,
            retry: setup.retry,
            linger: setup.linger,
            on_fatal: setup.on_fatal,
            buf: Vec::with_capacity(MTU),
        };

        let handle = std::thread::Builder::new()
            .name(format!("{}-sender", setup.name))
            .spawn(move || worker.run())
            .ok();
        if handle.is_none() {
            log::error!("[{}] failed to spawn sender thread", setup.name);
            terminated.store(true, Ordering::Release);
        }

        SignalSender {
            ring,
            wake,
            stop,
            terminated,
            metrics,
            handle: Mutex::new(handle),
        }
    }

    /// Queue one signal for the sender thread. Spins briefly while the ring
    /// is full; drops the signal once the sender terminated.
    pub fn enqueue(&self, signal: Signal) {
        let mut signal = signal;
        loop {
            if self.terminated.load(Ordering::Acquire) || self.stop.load(Ordering::Acquire) {
                log::debug!("[SignalSender] sender terminated, signal dropped");
                return;
            }
            match self.ring.push(signal) {
                Ok(()) => break,
                Err(rejected) => {
                    signal = rejected;
                    std::thread::sleep(Duration::from_micros(50));
                }
            }
        }
        self.wake.notify();
    }

    /// Wake notifier shared with the service dispatcher so fresh demand
    /// unparks a sender waiting on the gate.
    pub fn wake(&self) -> Arc<WakeNotifier> {
        Arc::clone(&self.wake)
    }

    pub fn metrics(&self) -> Arc<SenderMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Ask the thread to exit without draining.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.wake.notify();
    }

    /// Join the sender thread unless called from it.
    pub fn join(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            let _ = handle.join();
        }
    }
}

impl Drop for SignalSender {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

enum OfferEnd {
    Sent,
    Dropped,
    Stopped,
    Fatal(Error),
}

struct Worker {
    name: String,
    ring: Arc<ArrayQueue<Signal>>,
    wake: Arc<WakeNotifier>,
    stop: Arc<AtomicBool>,
    terminated: Arc<AtomicBool>,
    metrics: Arc<SenderMetrics>,
    data_publication: Publication,
    error_publication: Publication,
    sessions: Arc<SessionSnapshot>,
    pump: Arc<DemandPump>,
    retry: Duration,
    linger: Duration,
    on_fatal: Box<dyn Fn(Error) + Send>,
    buf: Vec<u8>,
}

impl Worker {
    fn run(mut self) {
        log::debug!("[{}] sender started", self.name);
        loop {
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            match self.ring.pop() {
                None => {
                    self.pump.pump();
                    self.wake.wait_timeout(Duration::from_millis(1));
                }
                Some(Signal::Next(payload)) => {
                    if !self.send_next(payload) {
                        break;
                    }
                }
                Some(Signal::Complete) => {
                    self.send_terminal(Frame::Complete { session_id: 0 }, false);
                    break;
                }
                Some(Signal::Error(message)) => {
                    self.send_terminal(
                        Frame::Error {
                            session_id: 0,
                            message,
                        },
                        true,
                    );
                    break;
                }
            }
        }
        self.data_publication.close();
        self.error_publication.close();
        self.terminated.store(true, Ordering::Release);
        log::debug!("[{}] sender stopped", self.name);
    }

    /// Returns false when the loop must exit.
    fn send_next(&mut self, payload: Vec<u8>) -> bool {
        if payload.len() + FRAME_HEADER_LEN > MTU {
            (self.on_fatal)(Error::ProtocolViolation(format!(
                "payload of {} bytes exceeds MTU",
                payload.len()
            )));
            return false;
        }

        // Demand gate: wait until every live session has credit. Fresh More
        // frames notify our wake through the dispatcher.
        loop {
            if self.stop.load(Ordering::Acquire) {
                return false;
            }
            match self.sessions.min_demand() {
                Some(demand) if demand > 0 => break,
                _ => {
                    self.wake.wait_timeout(Duration::from_millis(1));
                }
            }
        }

        Frame::Next {
            session_id: 0,
            payload,
        }
        .encode_into(&mut self.buf);

        match self.offer_with_retry(false) {
            OfferEnd::Sent => {
                self.sessions.take_one_each();
                self.pump.record_sent();
                self.metrics.frames_sent.fetch_add(1, Ordering::Relaxed);
                self.pump.pump();
                true
            }
            OfferEnd::Dropped => {
                self.metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("[{}] Next dropped: {}", self.name, Error::NoSubscribers);
                true
            }
            OfferEnd::Stopped => false,
            OfferEnd::Fatal(e) => {
                log::error!("[{}] fatal send error: {}", self.name, e);
                (self.on_fatal)(e);
                false
            }
        }
    }

    fn send_terminal(&mut self, frame: Frame, on_error_stream: bool) {
        let tag = frame.tag();
        frame.encode_into(&mut self.buf);
        match self.offer_with_retry(on_error_stream) {
            OfferEnd::Sent => log::debug!("[{}] terminal {:#04x} sent", self.name, tag),
            OfferEnd::Dropped => {
                self.metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("[{}] terminal {:#04x} dropped, no subscribers", self.name, tag);
            }
            OfferEnd::Stopped => return,
            OfferEnd::Fatal(e) => {
                log::error!("[{}] fatal terminal send error: {}", self.name, e);
                (self.on_fatal)(e);
                return;
            }
        }

        // Linger before closing so attached images drain the terminal frame.
        let deadline = Instant::now() + self.linger;
        while Instant::now() < deadline {
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10).min(self.linger));
        }
    }

    /// Offer `self.buf` until it lands or the policy says give up.
    fn offer_with_retry(&mut self, on_error_stream: bool) -> OfferEnd {
        let start = Instant::now();
        loop {
            if self.stop.load(Ordering::Acquire) {
                return OfferEnd::Stopped;
            }
            let publication = if on_error_stream {
                &self.error_publication
            } else {
                &self.data_publication
            };
            match publication.offer(&self.buf) {
                Offer::Ok(_) => return OfferEnd::Sent,
                Offer::Backpressured | Offer::AdminAction => {
                    self.metrics.add_retry();
                    if start.elapsed() >= self.linger {
                        return OfferEnd::Fatal(Error::PublicationBackpressured);
                    }
                    std::thread::sleep(self.retry);
                }
                Offer::NotConnected => {
                    // Keep retrying while somebody is registered; once the
                    // registry is empty the frame has no recipient.
                    if self.sessions.live_count() == 0 {
                        return OfferEnd::Dropped;
                    }
                    self.metrics.add_retry();
                    std::thread::sleep(self.retry);
                }
                Offer::Closed => return OfferEnd::Fatal(Error::PublicationClosed),
                Offer::MaxPositionExceeded => return OfferEnd::Fatal(Error::MaxPositionExceeded),
            }
        }
    }
}
