// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Inbound dispatcher.
//!
//! One background thread per processor drains every inbound stream and owns
//! all session and downstream state. Three logical poll loops cooperate on
//! it: the data stream (Next/Complete), the error stream (Error), and the
//! service stream (Join/More/Cancel/Heartbeat*). Each poll is bounded by the
//! configured batch size; when a full round makes no progress the thread
//! parks on the wake notifier.
//!
//! The server half answers service traffic for this processor's sender: it
//! registers joining sessions, applies demand, answers heartbeats, and reaps
//! silent sessions. The client half feeds local subscribers: it joins remote
//! senders, forwards local demand as More frames, delivers decoded items
//! under demand, and turns a heartbeat-reply gap into `TransportTimeout`.
//!
//! Delivery discipline: each downstream entry consumes a decoded Next only
//! while its own `requested > 0`, parking the item in its own backlog
//! otherwise, and the thread never holds a delivery in flight while polling
//! for the next frame, which is what makes subscriber signals
//! non-concurrent.

mod downstream;

pub(crate) use downstream::{DownstreamEntry, DownstreamSubscription};

use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::flow::UpstreamCell;
use crate::protocol::{Frame, UNBOUNDED};
use crate::session::{next_session_id, now_nanos, DemandLedger, DemandPump, SessionRegistry};
use crate::transport::{Offer, Publication, Subscription};
use crate::wake::WakeNotifier;

/// Counters maintained by the dispatcher thread.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    frames_routed: AtomicU64,
    frames_discarded: AtomicU64,
    protocol_violations: AtomicU64,
    heartbeats_sent: AtomicU64,
    sessions_reaped: AtomicU64,
}

impl DispatchMetrics {
    /// Next frames delivered to downstream subscribers.
    pub fn frames_routed(&self) -> u64 {
        self.frames_routed.load(Ordering::Relaxed)
    }

    /// Malformed frames logged and skipped.
    pub fn frames_discarded(&self) -> u64 {
        self.frames_discarded.load(Ordering::Relaxed)
    }

    /// Unknown-session service frames and other protocol surprises.
    pub fn protocol_violations(&self) -> u64 {
        self.protocol_violations.load(Ordering::Relaxed)
    }

    /// HeartbeatRequest frames emitted by the client half.
    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent.load(Ordering::Relaxed)
    }

    /// Sessions removed for missing their liveness bound.
    pub fn sessions_reaped(&self) -> u64 {
        self.sessions_reaped.load(Ordering::Relaxed)
    }

    fn discard(&self) {
        self.frames_discarded.fetch_add(1, Ordering::Relaxed);
    }

    fn violation(&self) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }
}

/// Work routed onto the dispatcher thread.
pub(crate) enum Command {
    InstallServer(Box<ServerHalf>),
    InstallClient(Box<ClientHalf>),
    AddDownstream(Arc<DownstreamEntry>),
    Request { entry_id: u64, n: u64 },
    CancelDownstream { entry_id: u64 },
}

// ============================================================================
// Server half
// ============================================================================

/// Sender-side service handling: session registry, demand, heartbeat replies.
pub(crate) struct ServerHalf {
    name: String,
    service_sub: Subscription,
    reply_pub: Publication,
    registry: SessionRegistry,
    pump: Arc<DemandPump>,
    sender_wake: Arc<WakeNotifier>,
    upstream: Arc<UpstreamCell>,
    auto_cancel: bool,
    heartbeat_timeout_nanos: u64,
    batch: usize,
    pending_replies: VecDeque<Vec<u8>>,
}

impl ServerHalf {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        service_sub: Subscription,
        reply_pub: Publication,
        registry: SessionRegistry,
        pump: Arc<DemandPump>,
        sender_wake: Arc<WakeNotifier>,
        upstream: Arc<UpstreamCell>,
        auto_cancel: bool,
        heartbeat_timeout: Duration,
        batch: usize,
    ) -> Self {
        Self {
            name,
            service_sub,
            reply_pub,
            registry,
            pump,
            sender_wake,
            upstream,
            auto_cancel,
            heartbeat_timeout_nanos: heartbeat_timeout.as_nanos() as u64,
            batch,
            pending_replies: VecDeque::new(),
        }
    }

    fn tick(&mut self, metrics: &DispatchMetrics) -> usize {
        let mut progressed = self.flush_replies();

        let name = &self.name;
        let mut frames = Vec::new();
        progressed += self.service_sub.poll(
            |bytes| match Frame::decode(bytes) {
                Ok(frame) => frames.push(frame),
                Err(e) => {
                    metrics.discard();
                    log::warn!("[{}] malformed service frame skipped: {}", name, e);
                }
            },
            self.batch,
        );

        let now = now_nanos();
        for frame in frames {
            self.on_frame(frame, now, metrics);
        }

        let reaped = self.registry.reap(now, self.heartbeat_timeout_nanos);
        if !reaped.is_empty() {
            metrics
                .sessions_reaped
                .fetch_add(reaped.len() as u64, Ordering::Relaxed);
            log::info!("[{}] reaped {} silent session(s)", self.name, reaped.len());
            self.pump.pump();
            self.sender_wake.notify();
            self.maybe_auto_cancel();
        }

        progressed
    }

    fn on_frame(&mut self, frame: Frame, now: u64, metrics: &DispatchMetrics) {
        match frame {
            Frame::Join { session_id } => {
                if self.registry.on_join(session_id, now) {
                    self.pump.pump();
                    self.sender_wake.notify();
                }
            }
            Frame::More { session_id, n } => {
                if self.registry.on_more(session_id, n, now) {
                    self.pump.pump();
                    self.sender_wake.notify();
                } else {
                    metrics.violation();
                    log::debug!("[{}] More for unknown session {}", self.name, session_id);
                }
            }
            Frame::Cancel { session_id } => {
                if self.registry.on_cancel(session_id) {
                    self.pump.pump();
                    self.sender_wake.notify();
                    self.maybe_auto_cancel();
                } else {
                    metrics.violation();
                    log::debug!("[{}] Cancel for unknown session {}", self.name, session_id);
                }
            }
            Frame::HeartbeatRequest {
                session_id,
                sender_nanos,
            } => {
                if self.registry.on_heartbeat_request(session_id, now) {
                    let reply = Frame::HeartbeatReply {
                        session_id,
                        echoed_sender_nanos: sender_nanos,
                    };
                    self.pending_replies.push_back(reply.encode());
                } else {
                    metrics.violation();
                    log::debug!(
                        "[{}] heartbeat from unknown session {}",
                        self.name,
                        session_id
                    );
                }
            }
            // Replies from other senders on the shared service stream.
            Frame::HeartbeatReply { .. } => {}
            other => {
                metrics.violation();
                log::debug!(
                    "[{}] unexpected frame {:#04x} on service stream",
                    self.name,
                    other.tag()
                );
            }
        }
    }

    fn flush_replies(&mut self) -> usize {
        let mut flushed = 0;
        while let Some(front) = self.pending_replies.front() {
            match self.reply_pub.offer(front) {
                Offer::Ok(_) => {
                    self.pending_replies.pop_front();
                    flushed += 1;
                }
                // Nobody listens for replies right now; they age out.
                Offer::NotConnected => {
                    self.pending_replies.pop_front();
                }
                Offer::Backpressured | Offer::AdminAction => break,
                Offer::Closed | Offer::MaxPositionExceeded => {
                    self.pending_replies.clear();
                    break;
                }
            }
        }
        flushed
    }

    fn maybe_auto_cancel(&mut self) {
        if self.auto_cancel && self.registry.saw_sessions() && self.registry.is_empty() {
            log::info!("[{}] last session gone, cancelling upstream", self.name);
            self.upstream.cancel();
        }
    }
}

// ============================================================================
// Client half
// ============================================================================

/// Receiver-side handling: join, demand forwarding, delivery, liveness.
///
/// Every local `subscribe()` adds an independent [`DownstreamEntry`]; each
/// entry paces itself through its own demand counter and backlog, so one
/// quiescent subscriber neither loses items nor stalls its siblings.
pub(crate) struct ClientHalf {
    name: String,
    session_id: u64,
    data_sub: Subscription,
    error_sub: Subscription,
    service_sub: Subscription,
    service_pub: Publication,
    entries: Vec<Arc<DownstreamEntry>>,
    ledger: DemandLedger,
    received: u64,
    pending_out: VecDeque<Vec<u8>>,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    next_heartbeat: Instant,
    last_reply: Option<Instant>,
    terminated: bool,
    batch: usize,
}

impl ClientHalf {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        data_sub: Subscription,
        error_sub: Subscription,
        service_sub: Subscription,
        service_pub: Publication,
        heartbeat_interval: Duration,
        heartbeat_timeout: Duration,
        batch: usize,
    ) -> Self {
        let session_id = next_session_id();
        let mut half = Self {
            name,
            session_id,
            data_sub,
            error_sub,
            service_sub,
            service_pub,
            entries: Vec::new(),
            ledger: DemandLedger::new(),
            received: 0,
            pending_out: VecDeque::new(),
            heartbeat_interval,
            heartbeat_timeout,
            next_heartbeat: Instant::now(),
            last_reply: None,
            terminated: false,
            batch,
        };
        half.enqueue_service(Frame::Join { session_id });
        log::debug!("[{}] client joining with session {}", half.name, session_id);
        half
    }

    fn tick(&mut self, metrics: &DispatchMetrics, fatal: &mut Option<Error>) -> usize {
        if self.terminated {
            return 0;
        }
        let mut progressed = self.flush_out();

        // Periodic liveness probe. The Join rides along so senders that
        // start late still learn this session (joins are idempotent); an
        // unbounded grant is repeated for the same reason.
        let tick_start = Instant::now();
        if tick_start >= self.next_heartbeat {
            self.enqueue_service(Frame::Join {
                session_id: self.session_id,
            });
            self.enqueue_service(Frame::HeartbeatRequest {
                session_id: self.session_id,
                sender_nanos: now_nanos(),
            });
            if self.ledger.is_unbounded() {
                self.enqueue_service(Frame::More {
                    session_id: self.session_id,
                    n: UNBOUNDED,
                });
            }
            metrics.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
            self.next_heartbeat = tick_start + self.heartbeat_interval;
            progressed += 1;
        }

        progressed += self.drain_entries(metrics);

        // Data stream: Next and Complete.
        let mut frames = Vec::new();
        progressed += self.data_sub.poll(
            |bytes| match Frame::decode(bytes) {
                Ok(frame) => frames.push(frame),
                Err(e) => {
                    metrics.discard();
                    log::warn!("malformed data frame skipped: {}", e);
                }
            },
            self.batch,
        );
        for frame in frames {
            match frame {
                Frame::Next { payload, .. } => {
                    self.received += 1;
                    self.route_next(payload, metrics);
                }
                Frame::Complete { .. } => {
                    log::debug!("[{}] Complete received", self.name);
                    self.complete_all(metrics);
                    return progressed;
                }
                other => {
                    metrics.violation();
                    log::debug!(
                        "[{}] unexpected frame {:#04x} on data stream",
                        self.name,
                        other.tag()
                    );
                }
            }
        }

        // Error stream: terminal for subscribers and fatal for the processor,
        // because the error fabric is shared with every peer on the channel.
        let mut error_message: Option<String> = None;
        progressed += self.error_sub.poll(
            |bytes| match Frame::decode(bytes) {
                Ok(Frame::Error { message, .. }) => {
                    if error_message.is_none() {
                        error_message = Some(message);
                    }
                }
                Ok(_) => metrics.violation(),
                Err(e) => {
                    metrics.discard();
                    log::warn!("malformed error frame skipped: {}", e);
                }
            },
            self.batch,
        );
        if let Some(message) = error_message {
            log::info!("[{}] Error received: {}", self.name, message);
            let text = message.clone();
            self.fail_all(move |entry| entry.deliver_error(Error::Upstream(text.clone())));
            *fatal = Some(Error::Upstream(message));
            return progressed;
        }

        // Service stream: only replies addressed to our session matter here.
        let session_id = self.session_id;
        let mut reply_seen = false;
        progressed += self.service_sub.poll(
            |bytes| {
                if let Ok(Frame::HeartbeatReply {
                    session_id: reply_session,
                    ..
                }) = Frame::decode(bytes)
                {
                    if reply_session == session_id {
                        reply_seen = true;
                    }
                }
            },
            self.batch,
        );
        if reply_seen {
            self.last_reply = Some(Instant::now());
        }

        // Liveness is armed by the first reply; before that no sender is
        // known and silence is not an error.
        if let Some(last) = self.last_reply {
            if last.elapsed() > self.heartbeat_timeout {
                log::warn!(
                    "[{}] no heartbeat reply for {:?}, erroring {} subscriber(s)",
                    self.name,
                    self.heartbeat_timeout,
                    self.entries.len()
                );
                self.fail_all(|entry| entry.deliver_error(Error::TransportTimeout));
            }
        }

        self.pump_more();
        progressed
    }

    fn add_entry(&mut self, entry: Arc<DownstreamEntry>) {
        if self.terminated {
            // The stream already ended; a late subscriber completes at once.
            entry.deliver_complete();
            return;
        }
        self.entries.push(entry);
    }

    fn on_request(&mut self, entry_id: u64, n: u64, metrics: &DispatchMetrics) {
        if let Some(entry) = self.entries.iter().find(|e| e.id() == entry_id) {
            entry.add_requested(n);
            let delivered = entry.drain();
            metrics
                .frames_routed
                .fetch_add(delivered as u64, Ordering::Relaxed);
            if !self.terminated {
                self.pump_more();
            }
        }
    }

    fn on_cancel_entry(&mut self, entry_id: u64) {
        if let Some(idx) = self.entries.iter().position(|e| e.id() == entry_id) {
            let entry = self.entries.remove(idx);
            entry.cancel();
            if self.entries.is_empty() {
                self.enqueue_service(Frame::Cancel {
                    session_id: self.session_id,
                });
            }
        }
    }

    /// Forward aggregated local demand to the remote senders as More frames.
    ///
    /// Local entries are independent fan-outs of one stream: a slow entry
    /// parks undelivered items in its own backlog, so the grant follows the
    /// fastest entry (the maximum). The slowest-participant minimum is the
    /// sender's cross-session rule, not the local one - applying it here
    /// would let a subscriber that never requested starve its siblings.
    fn pump_more(&mut self) {
        let max_remaining = self
            .entries
            .iter()
            .filter(|entry| entry.is_live())
            .map(|entry| entry.requested())
            .max();
        if let Some(delta) = self.ledger.pump(max_remaining, self.received) {
            self.enqueue_service(Frame::More {
                session_id: self.session_id,
                n: delta,
            });
        }
    }

    /// Hand one decoded payload to every live entry. Each entry delivers or
    /// backlogs it independently; nothing is lost to a demand mismatch.
    fn route_next(&mut self, payload: Vec<u8>, metrics: &DispatchMetrics) {
        if self.entries.is_empty() {
            // Only in-flight frames after the last entry cancelled end here.
            log::debug!("[{}] Next with no local subscribers dropped", self.name);
            return;
        }
        for entry in &self.entries {
            let delivered = entry.offer_next(payload.clone());
            metrics
                .frames_routed
                .fetch_add(delivered as u64, Ordering::Relaxed);
        }
    }

    /// Let every entry work off its backlog against fresh demand.
    fn drain_entries(&mut self, metrics: &DispatchMetrics) -> usize {
        let mut drained = 0;
        for entry in &self.entries {
            drained += entry.drain();
        }
        metrics
            .frames_routed
            .fetch_add(drained as u64, Ordering::Relaxed);
        drained
    }

    fn enqueue_service(&mut self, frame: Frame) {
        self.pending_out.push_back(frame.encode());
    }

    fn flush_out(&mut self) -> usize {
        let mut flushed = 0;
        while let Some(front) = self.pending_out.front() {
            match self.service_pub.offer(front) {
                Offer::Ok(_) => {
                    self.pending_out.pop_front();
                    flushed += 1;
                }
                // No sender listens yet; keep the frame for the next tick so
                // Join and More eventually reach a late-starting peer.
                Offer::NotConnected | Offer::Backpressured | Offer::AdminAction => break,
                Offer::Closed | Offer::MaxPositionExceeded => {
                    self.pending_out.clear();
                    break;
                }
            }
        }
        flushed
    }

    /// Normal end of stream. Entries are kept: one that still has a backlog
    /// receives its items (and then the deferred Complete) as its consumer
    /// requests them through the command queue.
    fn complete_all(&mut self, metrics: &DispatchMetrics) {
        self.terminated = true;
        self.drain_entries(metrics);
        for entry in &self.entries {
            if entry.has_backlog() {
                log::debug!(
                    "[{}] entry {} completes after its backlog drains",
                    self.name,
                    entry.id()
                );
            }
            entry.deliver_complete();
        }
    }

    /// Abnormal end of stream. Errors preempt backlogs; entries are dropped.
    fn fail_all(&mut self, deliver: impl Fn(&Arc<DownstreamEntry>)) {
        self.terminated = true;
        for entry in self.entries.drain(..) {
            deliver(&entry);
        }
    }
}

// ============================================================================
// Dispatcher thread
// ============================================================================

/// Owner of the dispatcher thread. The thread is spawned lazily when the
/// first half is installed.
pub(crate) struct Dispatcher {
    name: String,
    commands: Arc<ArrayQueue<Command>>,
    wake: Arc<WakeNotifier>,
    stop: Arc<AtomicBool>,
    terminated: Arc<AtomicBool>,
    started: AtomicBool,
    metrics: Arc<DispatchMetrics>,
    on_fatal: Arc<dyn Fn(Error) + Send + Sync>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        name: String,
        capacity: usize,
        on_fatal: Arc<dyn Fn(Error) + Send + Sync>,
    ) -> Self {
        Self {
            name,
            commands: Arc::new(ArrayQueue::new(capacity.max(16))),
            wake: WakeNotifier::shared(),
            stop: Arc::new(AtomicBool::new(false)),
            terminated: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            metrics: Arc::new(DispatchMetrics::default()),
            on_fatal,
            handle: Mutex::new(None),
        }
    }

    pub fn metrics(&self) -> Arc<DispatchMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn commands(&self) -> Arc<ArrayQueue<Command>> {
        Arc::clone(&self.commands)
    }

    pub fn wake(&self) -> Arc<WakeNotifier> {
        Arc::clone(&self.wake)
    }

    pub fn install_server(&self, half: ServerHalf) {
        self.push(Command::InstallServer(Box::new(half)));
    }

    pub fn install_client(&self, half: ClientHalf) {
        self.push(Command::InstallClient(Box::new(half)));
    }

    pub fn add_downstream(&self, entry: Arc<DownstreamEntry>) {
        self.push(Command::AddDownstream(entry));
    }

    fn push(&self, command: Command) {
        self.ensure_started();
        let mut command = command;
        loop {
            if self.stop.load(Ordering::Acquire) {
                return;
            }
            match self.commands.push(command) {
                Ok(()) => break,
                Err(rejected) => {
                    command = rejected;
                    std::thread::sleep(Duration::from_micros(50));
                }
            }
        }
        self.wake.notify();
    }

    fn ensure_started(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let worker = Worker {
            name: self.name.clone(),
            commands: Arc::clone(&self.commands),
            wake: Arc::clone(&self.wake),
            stop: Arc::clone(&self.stop),
            terminated: Arc::clone(&self.terminated),
            metrics: Arc::clone(&self.metrics),
            on_fatal: Arc::clone(&self.on_fatal),
            server: None,
            client: None,
        };
        let spawned = std::thread::Builder::new()
            .name(format!("{}-dispatch", self.name))
            .spawn(move || worker.run());
        match spawned {
            Ok(handle) => *self.handle.lock() = Some(handle),
            Err(e) => {
                log::error!("[{}] failed to spawn dispatcher thread: {}", self.name, e);
                self.terminated.store(true, Ordering::Release);
            }
        }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.wake.notify();
    }

    /// Join the dispatcher thread unless called from it.
    pub fn join(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            let _ = handle.join();
        }
    }

    pub fn is_terminated(&self) -> bool {
        !self.started.load(Ordering::Acquire) || self.terminated.load(Ordering::Acquire)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

struct Worker {
    name: String,
    commands: Arc<ArrayQueue<Command>>,
    wake: Arc<WakeNotifier>,
    stop: Arc<AtomicBool>,
    terminated: Arc<AtomicBool>,
    metrics: Arc<DispatchMetrics>,
    on_fatal: Arc<dyn Fn(Error) + Send + Sync>,
    server: Option<Box<ServerHalf>>,
    client: Option<Box<ClientHalf>>,
}

impl Worker {
    fn run(mut self) {
        log::debug!("[{}] dispatcher started", self.name);
        loop {
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            let mut progressed = self.drain_commands();
            if let Some(server) = self.server.as_mut() {
                progressed += server.tick(&self.metrics);
            }
            let mut fatal = None;
            if let Some(client) = self.client.as_mut() {
                progressed += client.tick(&self.metrics, &mut fatal);
            }
            if let Some(error) = fatal {
                (self.on_fatal)(error);
            }
            if progressed == 0 {
                self.wake.wait_timeout(Duration::from_millis(1));
            }
        }
        // Dropping the halves closes their publications and subscriptions,
        // releasing the driver position counters.
        self.server = None;
        self.client = None;
        self.terminated.store(true, Ordering::Release);
        log::debug!("[{}] dispatcher stopped", self.name);
    }

    fn drain_commands(&mut self) -> usize {
        let mut handled = 0;
        while let Some(command) = self.commands.pop() {
            handled += 1;
            match command {
                Command::InstallServer(half) => {
                    self.server = Some(half);
                }
                Command::InstallClient(half) => {
                    self.client = Some(half);
                }
                Command::AddDownstream(entry) => {
                    if let Some(client) = self.client.as_mut() {
                        client.add_entry(entry);
                    } else {
                        log::warn!("[{}] downstream entry without client half", self.name);
                    }
                }
                Command::Request { entry_id, n } => {
                    if let Some(client) = self.client.as_mut() {
                        client.on_request(entry_id, n, &self.metrics);
                    }
                }
                Command::CancelDownstream { entry_id } => {
                    if let Some(client) = self.client.as_mut() {
                        client.on_cancel_entry(entry_id);
                    }
                }
            }
        }
        handled
    }
}
