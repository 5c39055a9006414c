// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Processor facade.
//!
//! A [`Processor`] is simultaneously a Reactive-Streams Subscriber (items in
//! from a local upstream, frames out through the sender) and Publisher
//! (frames in through the dispatcher, items out to local subscribers). The
//! server side starts on the first outbound signal, the client side on the
//! first `subscribe()`; each side acquires the embedded driver through one
//! shared [`DriverHandle`] that is released when the processor shuts down.
//!
//! `create` expects a single-threaded producer; `share` admits concurrent
//! producers, serialized through the sender's bounded ring.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use crate::config::Context;
use crate::dispatch::{ClientHalf, Dispatcher, DownstreamEntry, DownstreamSubscription, ServerHalf};
use crate::driver::{DriverHandle, DriverManager};
use crate::error::{Error, Result};
use crate::flow::{Publisher, Subscriber, Subscription, UpstreamCell};
use crate::sender::{SenderSetup, Signal, SignalSender};
use crate::session::{DemandPump, SessionRegistry};
use crate::transport::MediaDriver;

/// Counter snapshot across the sender and dispatcher threads.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessorMetrics {
    pub offer_retries: u64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub frames_routed: u64,
    pub frames_discarded: u64,
    pub protocol_violations: u64,
    pub heartbeats_sent: u64,
    pub sessions_reaped: u64,
}

/// Bidirectional pub/sub processor over the embedded transport.
///
/// Cheap to clone; all clones drive the same processor.
#[derive(Clone)]
pub struct Processor {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: Context,
    weak: Weak<Inner>,
    alive: AtomicBool,
    driver: Mutex<Option<DriverHandle>>,
    upstream: Arc<UpstreamCell>,
    dispatcher: Dispatcher,
    sender: OnceLock<SignalSender>,
    server_init: std::sync::Once,
    client_init: std::sync::Once,
    server_ready: AtomicBool,
    client_ready: AtomicBool,
    in_signal: AtomicBool,
}

struct NoopSubscription;

impl Subscription for NoopSubscription {
    fn request(&self, _n: u64) {}
    fn cancel(&self) {}
}

impl Processor {
    /// Create a processor whose producer honors the single-threaded
    /// Reactive-Streams contract.
    pub fn create(context: Context) -> Result<Processor> {
        Self::build(context, false)
    }

    /// Create a processor that admits concurrent producers.
    pub fn share(context: Context) -> Result<Processor> {
        Self::build(context, true)
    }

    fn build(mut context: Context, multi_publishers: bool) -> Result<Processor> {
        context.validate()?;
        context.set_multi_publishers(multi_publishers);

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let fatal_weak = weak.clone();
            let on_fatal: Arc<dyn Fn(Error) + Send + Sync> = Arc::new(move |error| {
                if let Some(inner) = fatal_weak.upgrade() {
                    log::error!("[{}] fatal transport error: {}", inner.ctx.name(), error);
                    inner.shutdown_inner();
                }
            });
            let dispatcher = Dispatcher::new(
                context.name().to_string(),
                context.ring_buffer_size_value(),
                on_fatal,
            );
            Inner {
                weak: weak.clone(),
                alive: AtomicBool::new(true),
                driver: Mutex::new(None),
                upstream: Arc::new(UpstreamCell::new()),
                dispatcher,
                sender: OnceLock::new(),
                server_init: std::sync::Once::new(),
                client_init: std::sync::Once::new(),
                server_ready: AtomicBool::new(false),
                client_ready: AtomicBool::new(false),
                in_signal: AtomicBool::new(false),
                ctx: context,
            }
        });
        log::info!("[{}] processor initialized", inner.ctx.name());
        Ok(Processor { inner })
    }

    /// Processor name from the context.
    pub fn name(&self) -> &str {
        self.inner.ctx.name()
    }

    /// True until `shutdown()` or a fatal transport error.
    pub fn alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    /// True once the processor is shut down and its threads exited.
    pub fn is_terminated(&self) -> bool {
        if self.alive() {
            return false;
        }
        let sender_done = self
            .inner
            .sender
            .get()
            .map_or(true, SignalSender::is_terminated);
        sender_done && self.inner.dispatcher.is_terminated()
    }

    /// Stop both sides, release the driver handle. Idempotent: the alive
    /// flag transitions exactly once.
    pub fn shutdown(&self) {
        self.inner.shutdown_inner();
    }

    /// Counter snapshot for observability and tests.
    pub fn metrics(&self) -> ProcessorMetrics {
        let mut snapshot = ProcessorMetrics::default();
        if let Some(sender) = self.inner.sender.get() {
            let m = sender.metrics();
            snapshot.offer_retries = m.offer_retries();
            snapshot.frames_sent = m.frames_sent();
            snapshot.frames_dropped = m.frames_dropped();
        }
        let d = self.inner.dispatcher.metrics();
        snapshot.frames_routed = d.frames_routed();
        snapshot.frames_discarded = d.frames_discarded();
        snapshot.protocol_violations = d.protocol_violations();
        snapshot.heartbeats_sent = d.heartbeats_sent();
        snapshot.sessions_reaped = d.sessions_reaped();
        snapshot
    }

    // ===== Subscriber side (items in) =====

    /// Bind the upstream subscription and start the server side.
    pub fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        if !self.alive() {
            subscription.cancel();
            return;
        }
        if let Err(rejected) = self.inner.upstream.bind(subscription) {
            log::warn!("[{}] {}", self.name(), Error::AlreadyBound);
            rejected.cancel();
            return;
        }
        if let Err(e) = self.inner.ensure_server() {
            log::error!("[{}] failed to start sender side: {}", self.name(), e);
        }
    }

    /// Queue one item for publication.
    pub fn on_next(&self, item: Vec<u8>) {
        if !self.alive() {
            log::debug!("[{}] on_next after shutdown dropped", self.name());
            return;
        }
        if self.inner.ensure_server().is_err() {
            return;
        }
        let guard = !self.inner.ctx.is_multi_publishers();
        if guard && self.inner.in_signal.swap(true, Ordering::Acquire) {
            log::error!(
                "[{}] {}",
                self.name(),
                Error::ProtocolViolation("concurrent signal on a create-mode processor".into())
            );
        }
        if let Some(sender) = self.inner.sender.get() {
            sender.enqueue(Signal::Next(item));
        }
        if guard {
            self.inner.in_signal.store(false, Ordering::Release);
        }
    }

    /// Queue the terminal error; it travels on the error stream.
    pub fn on_error(&self, error: Error) {
        if !self.alive() {
            return;
        }
        if self.inner.ensure_server().is_err() {
            return;
        }
        let message = match error {
            Error::Upstream(message) => message,
            other => other.to_string(),
        };
        if let Some(sender) = self.inner.sender.get() {
            sender.enqueue(Signal::Error(message));
        }
    }

    /// Queue the terminal completion.
    pub fn on_complete(&self) {
        if !self.alive() {
            return;
        }
        if self.inner.ensure_server().is_err() {
            return;
        }
        if let Some(sender) = self.inner.sender.get() {
            sender.enqueue(Signal::Complete);
        }
    }

    // ===== Publisher side (items out) =====

    /// Attach a local subscriber and start the client side.
    pub fn subscribe(&self, subscriber: Box<dyn Subscriber<Vec<u8>>>) {
        let entry = DownstreamEntry::new(subscriber);
        if !self.alive() {
            entry.on_subscribe(Arc::new(NoopSubscription));
            entry.deliver_error(Error::PublicationClosed);
            return;
        }
        if let Err(e) = self.inner.ensure_client() {
            log::error!("[{}] failed to start receiver side: {}", self.name(), e);
            entry.on_subscribe(Arc::new(NoopSubscription));
            entry.deliver_error(e);
            return;
        }
        let subscription = Arc::new(DownstreamSubscription::new(
            entry.id(),
            self.inner.dispatcher.commands(),
            self.inner.dispatcher.wake(),
        ));
        self.inner.dispatcher.add_downstream(Arc::clone(&entry));
        entry.on_subscribe(subscription);
    }
}

impl Publisher<Vec<u8>> for Processor {
    fn subscribe(&self, subscriber: Box<dyn Subscriber<Vec<u8>>>) {
        Processor::subscribe(self, subscriber);
    }
}

impl Subscriber<Vec<u8>> for Processor {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        Processor::on_subscribe(self, subscription);
    }

    fn on_next(&mut self, item: Vec<u8>) {
        Processor::on_next(self, item);
    }

    fn on_error(&mut self, error: Error) {
        Processor::on_error(self, error);
    }

    fn on_complete(&mut self) {
        Processor::on_complete(self);
    }
}

impl Inner {
    fn ensure_driver(&self) -> Result<Arc<MediaDriver>> {
        let mut guard = self.driver.lock();
        if let Some(handle) = guard.as_ref() {
            return Ok(Arc::clone(handle.driver()));
        }
        let manager = match self.ctx.driver_manager_override() {
            Some(manager) => manager,
            None if self.ctx.launches_embedded_driver() => DriverManager::global(),
            None => return Err(Error::DriverNotLaunched),
        };
        let handle = manager.acquire()?;
        let driver = Arc::clone(handle.driver());
        *guard = Some(handle);
        Ok(driver)
    }

    fn ensure_server(&self) -> Result<()> {
        self.server_init.call_once(|| match self.start_server() {
            Ok(()) => self.server_ready.store(true, Ordering::Release),
            Err(e) => log::error!("[{}] sender side failed to start: {}", self.ctx.name(), e),
        });
        if self.server_ready.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::DriverNotLaunched)
        }
    }

    fn ensure_client(&self) -> Result<()> {
        self.client_init.call_once(|| match self.start_client() {
            Ok(()) => self.client_ready.store(true, Ordering::Release),
            Err(e) => log::error!("[{}] receiver side failed to start: {}", self.ctx.name(), e),
        });
        if self.client_ready.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::DriverNotLaunched)
        }
    }

    fn start_server(&self) -> Result<()> {
        let ctx = &self.ctx;
        let driver = self.ensure_driver()?;
        let channel = ctx.sender_channel_ref();

        let registry = SessionRegistry::new();
        let sessions = registry.snapshot_handle();
        let pump = Arc::new(DemandPump::new(
            registry.snapshot_handle(),
            Arc::clone(&self.upstream),
        ));

        let data_publication = driver.add_publication(channel, ctx.stream_id_value())?;
        let error_publication = driver.add_publication(channel, ctx.error_stream_id_value())?;
        let service_sub = driver.add_subscription(
            channel,
            ctx.service_request_stream_id_value(),
            Some(self.dispatcher.wake()),
        )?;
        let reply_pub = driver.add_publication(channel, ctx.service_request_stream_id_value())?;

        let fatal_weak = self.weak.clone();
        let sender = SignalSender::start(SenderSetup {
            name: ctx.name().to_string(),
            data_publication,
            error_publication,
            sessions,
            pump: Arc::clone(&pump),
            retry: ctx.publication_retry(),
            linger: ctx.publication_linger_timeout(),
            ring_capacity: ctx.ring_buffer_size_value(),
            on_fatal: Box::new(move |error| {
                if let Some(inner) = fatal_weak.upgrade() {
                    log::error!("[{}] fatal send error: {}", inner.ctx.name(), error);
                    inner.shutdown_inner();
                }
            }),
        });
        let sender_wake = sender.wake();
        let _ = self.sender.set(sender);

        self.dispatcher.install_server(ServerHalf::new(
            ctx.name().to_string(),
            service_sub,
            reply_pub,
            registry,
            pump,
            sender_wake,
            Arc::clone(&self.upstream),
            ctx.is_auto_cancel(),
            ctx.heartbeat_timeout(),
            ctx.ring_buffer_size_value(),
        ));
        log::debug!("[{}] sender side started", ctx.name());
        Ok(())
    }

    fn start_client(&self) -> Result<()> {
        let ctx = &self.ctx;
        let driver = self.ensure_driver()?;
        let channel = ctx.receiver_channel_ref();
        let wake = self.dispatcher.wake();

        let data_sub = driver.add_subscription(channel, ctx.stream_id_value(), Some(wake.clone()))?;
        let error_sub =
            driver.add_subscription(channel, ctx.error_stream_id_value(), Some(wake.clone()))?;
        let service_sub = driver.add_subscription(
            channel,
            ctx.service_request_stream_id_value(),
            Some(wake),
        )?;
        let service_pub = driver.add_publication(channel, ctx.service_request_stream_id_value())?;

        self.dispatcher.install_client(ClientHalf::new(
            ctx.name().to_string(),
            data_sub,
            error_sub,
            service_sub,
            service_pub,
            ctx.heartbeat_interval(),
            ctx.heartbeat_timeout(),
            ctx.ring_buffer_size_value(),
        ));
        log::debug!("[{}] receiver side started", ctx.name());
        Ok(())
    }

    /// Single-shot shutdown; safe to call from the worker threads.
    fn shutdown_inner(&self) {
        if self.alive.swap(false, Ordering::AcqRel) {
            log::info!("[{}] processor shutdown", self.ctx.name());
            self.upstream.cancel();
            if let Some(sender) = self.sender.get() {
                sender.stop();
            }
            self.dispatcher.stop();
            if let Some(sender) = self.sender.get() {
                sender.join();
            }
            self.dispatcher.join();
            *self.driver.lock() = None;
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}
