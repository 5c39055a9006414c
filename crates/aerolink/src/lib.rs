// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # AeroLink - Reactive-Streams over an embedded frame transport
//!
//! A bidirectional pub/sub processor that is simultaneously a downstream
//! Subscriber (it accepts items from a local upstream, serializes them, and
//! writes them into the transport) and an upstream Publisher (it decodes
//! inbound frames, honors downstream demand, and emits items to local
//! subscribers). The full Reactive-Streams contract - per-subscriber demand
//! accounting, non-concurrent signal delivery, next/complete/error terminal
//! signals - is preserved across a lossy-but-ordered frame transport shared
//! between multiple independent processors on the same channel.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use aerolink::{Context, Processor};
//!
//! fn main() -> aerolink::Result<()> {
//!     let processor = Processor::create(
//!         Context::new("telemetry")
//!             .sender_channel("aeron:udp?endpoint=224.0.1.1:40456")
//!             .receiver_channel("aeron:udp?endpoint=224.0.1.1:40456"),
//!     )?;
//!
//!     // Publish one item into the transport.
//!     processor.on_next(b"sample".to_vec());
//!     processor.on_complete();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! upstream producer                              local subscribers
//!       |  on_next                                      ^  on_next
//!       v                                               |
//! +-----------+   ring    +--------+    frames   +------------+
//! | Processor | --------> | Sender | ----------> | Dispatcher |
//! |  facade   |           | thread |  transport  |   thread   |
//! +-----------+           +--------+             +------------+
//!       ^                      ^                        |
//!       |   request(n)         |  min session demand    |  More/Cancel/
//!       +----------------------+------<-----------------+  Heartbeat*
//! ```
//!
//! Control flow for demand: a downstream `request(n)` becomes a More frame on
//! the service stream; the remote session registry folds it into the minimum
//! demand across live sessions; that minimum becomes the upstream
//! `request(n)` on the sending side. The sender never publishes a Next frame
//! while any live session is out of demand.
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Processor`] | Bidirectional pub/sub facade (`create` / `share`) |
//! | [`Context`] | Validated processor configuration |
//! | [`DriverManager`] | Refcounted owner of the embedded media driver |
//! | [`flow::Subscriber`] | Reactive-Streams receiver trait |
//! | [`Frame`] | Wire frame model (Join/More/Cancel/Heartbeat*/Next/...) |
//!
//! ## Modules Overview
//!
//! - [`flow`] - Reactive-Streams traits (start here)
//! - [`protocol`] - frame model and wire codec
//! - [`transport`] - embedded media driver, publications, subscriptions
//! - [`driver`] - refcounted driver lifecycle

/// Processor configuration and defaults.
pub mod config;
/// Inbound dispatcher (poll loops, heartbeats, downstream fanout).
mod dispatch;
/// Refcounted lifecycle of the embedded media driver.
pub mod driver;
/// Crate error type.
pub mod error;
/// Reactive-Streams traits.
pub mod flow;
/// Processor facade.
mod processor;
/// Wire protocol frames and codec.
pub mod protocol;
/// Outbound signal sender.
mod sender;
/// Remote subscriber sessions and demand aggregation.
pub mod session;
/// Embedded frame transport (media driver, publications, subscriptions).
pub mod transport;
/// Wake notification for the worker threads.
pub mod wake;

pub use config::Context;
pub use dispatch::DispatchMetrics;
pub use driver::{scheduled_cleanups, DriverConfig, DriverHandle, DriverManager};
pub use error::{Error, Result};
pub use flow::{Publisher, Subscriber, Subscription, UNBOUNDED};
pub use processor::{Processor, ProcessorMetrics};
pub use protocol::Frame;
pub use sender::SenderMetrics;
pub use transport::{MediaDriver, Offer, MTU};

/// AeroLink version string.
pub const VERSION: &str = "0.3.0";
