// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Embedded frame transport.
//!
//! An in-process media driver hands out [`Publication`] (write side) and
//! [`Subscription`] (read side) handles keyed by `(channel, stream_id)`.
//! Frames offered on a publication are broadcast to every attached
//! subscription image; each image owns a bounded queue sized by the driver's
//! publication window, so the slowest consumer governs when offers report
//! back-pressure.
//!
//! # Architecture
//!
//! ```text
//! Publication.offer() --+--> image queue --> Subscription.poll()   (reader A)
//!                       +--> image queue --> Subscription.poll()   (reader B)
//!
//! MediaDriver
//! +-- streams: DashMap<StreamKey, StreamChannel>
//! +-- counters: "sender pos ..." / "subscriber pos ..." labels
//! +-- scratch directory (deleted at force-shutdown)
//! ```

mod counters;
mod media;

pub use counters::{CounterId, CountersRegistry};
pub use media::{MediaDriver, Publication, StreamKey, Subscription};

/// Maximum encoded frame length a publication accepts.
pub const MTU: usize = 4096;

/// Default per-image queue capacity (frames).
pub const DEFAULT_PUBLICATION_WINDOW: usize = 128;

/// Position limit per publication (bytes offered over its lifetime).
pub const PUBLICATION_MAX_POSITION: u64 = u64::MAX >> 1;

/// Outcome of a non-blocking [`Publication::offer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// Frame accepted; carries the publication position after the write.
    Ok(u64),
    /// At least one attached image has no room; retry after a pause.
    Backpressured,
    /// No subscription image is attached to the stream.
    NotConnected,
    /// The driver is reorganizing the stream (image attach in progress);
    /// retry after a pause.
    AdminAction,
    /// The publication or the driver is closed.
    Closed,
    /// The publication exhausted its position range.
    MaxPositionExceeded,
}
