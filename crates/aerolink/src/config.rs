// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Processor configuration - single source of truth for tunables.
//!
//! All defaults live here as named constants. **NEVER hardcode elsewhere!**
//! A [`Context`] is validated once when a processor is created and is
//! immutable afterwards.

use std::sync::Arc;

use crate::driver::DriverManager;
use crate::error::{Error, Result};

/// Default stream id for Next/Complete frames.
pub const DEFAULT_STREAM_ID: u32 = 1;

/// Default stream id for Error frames.
///
/// Errors travel on their own stream so a broadcast error reaches peers that
/// have stopped reading the data stream.
pub const DEFAULT_ERROR_STREAM_ID: u32 = 2;

/// Default stream id for service frames (Join/More/Cancel/Heartbeat*).
pub const DEFAULT_SERVICE_REQUEST_STREAM_ID: u32 = 3;

/// Default capacity of the outbound signal ring (power of two).
pub const DEFAULT_RING_BUFFER_SIZE: usize = 1024;

/// Default sleep between publication offer retries (milliseconds).
pub const DEFAULT_PUBLICATION_RETRY_MILLIS: u64 = 100;

/// Default publication linger timeout (milliseconds).
///
/// Bounds the back-pressure retry loop and the grace period before a closing
/// publication is torn down.
pub const DEFAULT_PUBLICATION_LINGER_TIMEOUT_MILLIS: u64 = 5_000;

/// Default heartbeat emission interval (milliseconds).
pub const DEFAULT_HEARTBEAT_INTERVAL_MILLIS: u64 = 500;

/// Default liveness bound: a silent peer is declared dead after this long
/// without a heartbeat (milliseconds). Must exceed the interval.
pub const DEFAULT_HEARTBEAT_TIMEOUT_MILLIS: u64 = 3_000;

/// Processor configuration.
///
/// Built fluently, validated once:
///
/// ```no_run
/// use aerolink::Context;
///
/// let ctx = Context::new("telemetry")
///     .sender_channel("aeron:udp?endpoint=224.0.1.1:40456")
///     .receiver_channel("aeron:udp?endpoint=224.0.1.1:40456")
///     .stream_id(10)
///     .auto_cancel(true);
/// ```
#[derive(Clone)]
pub struct Context {
    name: String,
    sender_channel: String,
    receiver_channel: String,
    stream_id: u32,
    error_stream_id: u32,
    service_request_stream_id: u32,
    ring_buffer_size: usize,
    publication_retry_millis: u64,
    publication_linger_timeout_millis: u64,
    auto_cancel: bool,
    multi_publishers: bool,
    launch_embedded_driver: bool,
    heartbeat_interval_millis: u64,
    heartbeat_timeout_millis: u64,
    driver_manager: Option<Arc<DriverManager>>,
}

impl Context {
    /// Create a context with the documented defaults. `name` labels threads
    /// and log lines for this processor.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sender_channel: String::new(),
            receiver_channel: String::new(),
            stream_id: DEFAULT_STREAM_ID,
            error_stream_id: DEFAULT_ERROR_STREAM_ID,
            service_request_stream_id: DEFAULT_SERVICE_REQUEST_STREAM_ID,
            ring_buffer_size: DEFAULT_RING_BUFFER_SIZE,
            publication_retry_millis: DEFAULT_PUBLICATION_RETRY_MILLIS,
            publication_linger_timeout_millis: DEFAULT_PUBLICATION_LINGER_TIMEOUT_MILLIS,
            auto_cancel: false,
            multi_publishers: false,
            launch_embedded_driver: true,
            heartbeat_interval_millis: DEFAULT_HEARTBEAT_INTERVAL_MILLIS,
            heartbeat_timeout_millis: DEFAULT_HEARTBEAT_TIMEOUT_MILLIS,
            driver_manager: None,
        }
    }

    /// Channel URI the sender side publishes on.
    #[must_use]
    pub fn sender_channel(mut self, channel: impl Into<String>) -> Self {
        self.sender_channel = channel.into();
        self
    }

    /// Channel URI the receiver side subscribes on.
    #[must_use]
    pub fn receiver_channel(mut self, channel: impl Into<String>) -> Self {
        self.receiver_channel = channel.into();
        self
    }

    /// Stream id for Next/Complete frames.
    #[must_use]
    pub fn stream_id(mut self, id: u32) -> Self {
        self.stream_id = id;
        self
    }

    /// Stream id for Error frames.
    #[must_use]
    pub fn error_stream_id(mut self, id: u32) -> Self {
        self.error_stream_id = id;
        self
    }

    /// Stream id for service frames.
    #[must_use]
    pub fn service_request_stream_id(mut self, id: u32) -> Self {
        self.service_request_stream_id = id;
        self
    }

    /// Capacity of the outbound signal ring. Must be a power of two >= 2.
    #[must_use]
    pub fn ring_buffer_size(mut self, size: usize) -> Self {
        self.ring_buffer_size = size;
        self
    }

    /// Sleep between publication offer retries.
    #[must_use]
    pub fn publication_retry_millis(mut self, millis: u64) -> Self {
        self.publication_retry_millis = millis;
        self
    }

    /// Bound on the back-pressure retry loop and publication close grace.
    #[must_use]
    pub fn publication_linger_timeout_millis(mut self, millis: u64) -> Self {
        self.publication_linger_timeout_millis = millis;
        self
    }

    /// Cancel the upstream subscription once the last remote session is gone.
    #[must_use]
    pub fn auto_cancel(mut self, auto_cancel: bool) -> Self {
        self.auto_cancel = auto_cancel;
        self
    }

    /// Launch (or join) the process-wide embedded driver on first use.
    #[must_use]
    pub fn launch_embedded_driver(mut self, launch: bool) -> Self {
        self.launch_embedded_driver = launch;
        self
    }

    /// Heartbeat emission interval.
    #[must_use]
    pub fn heartbeat_interval_millis(mut self, millis: u64) -> Self {
        self.heartbeat_interval_millis = millis;
        self
    }

    /// Liveness bound for heartbeat replies and session reaping.
    #[must_use]
    pub fn heartbeat_timeout_millis(mut self, millis: u64) -> Self {
        self.heartbeat_timeout_millis = millis;
        self
    }

    /// Use a specific driver manager instead of the process-wide one.
    ///
    /// Lets tests run against a fresh manager with its own shutdown bounds
    /// and publication window.
    #[must_use]
    pub fn driver_manager(mut self, manager: Arc<DriverManager>) -> Self {
        self.driver_manager = Some(manager);
        self
    }

    pub(crate) fn set_multi_publishers(&mut self, multi: bool) {
        self.multi_publishers = multi;
    }

    // ===== Accessors =====

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sender_channel_ref(&self) -> &str {
        &self.sender_channel
    }

    pub fn receiver_channel_ref(&self) -> &str {
        &self.receiver_channel
    }

    pub fn stream_id_value(&self) -> u32 {
        self.stream_id
    }

    pub fn error_stream_id_value(&self) -> u32 {
        self.error_stream_id
    }

    pub fn service_request_stream_id_value(&self) -> u32 {
        self.service_request_stream_id
    }

    pub fn ring_buffer_size_value(&self) -> usize {
        self.ring_buffer_size
    }

    pub fn publication_retry(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.publication_retry_millis)
    }

    pub fn publication_linger_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.publication_linger_timeout_millis)
    }

    pub fn is_auto_cancel(&self) -> bool {
        self.auto_cancel
    }

    pub fn is_multi_publishers(&self) -> bool {
        self.multi_publishers
    }

    pub fn launches_embedded_driver(&self) -> bool {
        self.launch_embedded_driver
    }

    pub fn heartbeat_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.heartbeat_interval_millis)
    }

    pub fn heartbeat_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.heartbeat_timeout_millis)
    }

    pub(crate) fn driver_manager_override(&self) -> Option<Arc<DriverManager>> {
        self.driver_manager.clone()
    }

    /// Validate the context. Called once by `Processor::create`/`share`.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidContext("name must not be empty".into()));
        }
        if self.sender_channel.is_empty() {
            return Err(Error::InvalidContext(
                "sender_channel must not be empty".into(),
            ));
        }
        if self.receiver_channel.is_empty() {
            return Err(Error::InvalidContext(
                "receiver_channel must not be empty".into(),
            ));
        }
        let ids = [
            self.stream_id,
            self.error_stream_id,
            self.service_request_stream_id,
        ];
        if ids[0] == ids[1] || ids[0] == ids[2] || ids[1] == ids[2] {
            return Err(Error::InvalidContext(
                "stream_id, error_stream_id and service_request_stream_id must be distinct".into(),
            ));
        }
        if self.ring_buffer_size < 2 || !self.ring_buffer_size.is_power_of_two() {
            return Err(Error::InvalidContext(format!(
                "ring_buffer_size must be a power of two >= 2, got {}",
                self.ring_buffer_size
            )));
        }
        if self.publication_retry_millis == 0 || self.publication_linger_timeout_millis == 0 {
            return Err(Error::InvalidContext(
                "publication retry and linger timeouts must be non-zero".into(),
            ));
        }
        if self.heartbeat_interval_millis == 0 {
            return Err(Error::InvalidContext(
                "heartbeat_interval_millis must be non-zero".into(),
            ));
        }
        if self.heartbeat_timeout_millis <= self.heartbeat_interval_millis {
            return Err(Error::InvalidContext(format!(
                "heartbeat_timeout_millis ({}) must exceed heartbeat_interval_millis ({})",
                self.heartbeat_timeout_millis, self.heartbeat_interval_millis
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.name)
            .field("sender_channel", &self.sender_channel)
            .field("receiver_channel", &self.receiver_channel)
            .field("stream_id", &self.stream_id)
            .field("error_stream_id", &self.error_stream_id)
            .field("service_request_stream_id", &self.service_request_stream_id)
            .field("ring_buffer_size", &self.ring_buffer_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Context {
        Context::new("test")
            .sender_channel("aeron:ipc")
            .receiver_channel("aeron:ipc")
    }

    #[test]
    fn default_context_validates() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn empty_name_rejected() {
        let ctx = Context::new("")
            .sender_channel("aeron:ipc")
            .receiver_channel("aeron:ipc");
        assert!(matches!(ctx.validate(), Err(Error::InvalidContext(_))));
    }

    #[test]
    fn colliding_stream_ids_rejected() {
        let ctx = valid().error_stream_id(DEFAULT_STREAM_ID);
        assert!(matches!(ctx.validate(), Err(Error::InvalidContext(_))));
    }

    #[test]
    fn non_power_of_two_ring_rejected() {
        let ctx = valid().ring_buffer_size(1000);
        assert!(matches!(ctx.validate(), Err(Error::InvalidContext(_))));
    }

    #[test]
    fn timeout_must_exceed_interval() {
        let ctx = valid()
            .heartbeat_interval_millis(500)
            .heartbeat_timeout_millis(500);
        assert!(matches!(ctx.validate(), Err(Error::InvalidContext(_))));
    }
}
