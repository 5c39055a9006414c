// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Errors returned by aerolink operations.
//!
//! One enum covers the whole crate, from frame decoding to driver lifecycle.
//! Transient transport conditions (`PublicationBackpressured`, `NotConnected`)
//! are normally absorbed by the sender's retry loop and only surface when a
//! bound (the publication linger timeout) expires.

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by processors, the transport, and the driver manager.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Configuration
    // ========================================================================
    /// Context validation failed at construction.
    InvalidContext(String),

    // ========================================================================
    // Wire protocol
    // ========================================================================
    /// A frame could not be decoded (unknown tag or truncated body).
    MalformedFrame(String),
    /// A well-formed frame arrived that the protocol does not allow here
    /// (unknown session, unsolicited reply, concurrent signal in create mode).
    ProtocolViolation(String),
    /// An Error frame arrived from a remote upstream; carries its message text.
    Upstream(String),

    // ========================================================================
    // Transport
    // ========================================================================
    /// The publication was closed underneath the sender.
    PublicationClosed,
    /// Back-pressure persisted past the publication linger timeout.
    PublicationBackpressured,
    /// No subscription image is attached to the stream.
    NotConnected,
    /// The publication reached its maximum position.
    MaxPositionExceeded,
    /// A frame was dropped because no live session remained to receive it.
    NoSubscribers,

    // ========================================================================
    // Liveness
    // ========================================================================
    /// No heartbeat reply arrived within the heartbeat timeout.
    TransportTimeout,

    // ========================================================================
    // Driver lifecycle
    // ========================================================================
    /// `acquire()` was called while the driver manager is shutting down.
    ManagerShuttingDown,
    /// The processor needs the transport but no driver is available.
    DriverNotLaunched,
    /// `on_subscribe` was called on a processor that is already bound upstream.
    AlreadyBound,
    /// I/O error from the driver's scratch directory handling.
    Io(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidContext(msg) => write!(f, "Invalid context: {}", msg),
            Error::MalformedFrame(msg) => write!(f, "Malformed frame: {}", msg),
            Error::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
            Error::Upstream(msg) => write!(f, "Upstream error: {}", msg),
            Error::PublicationClosed => write!(f, "Publication closed"),
            Error::PublicationBackpressured => {
                write!(f, "Publication back-pressured past linger timeout")
            }
            Error::NotConnected => write!(f, "Publication not connected"),
            Error::MaxPositionExceeded => write!(f, "Publication max position exceeded"),
            Error::NoSubscribers => write!(f, "No live subscriber session"),
            Error::TransportTimeout => write!(f, "Heartbeat reply timeout"),
            Error::ManagerShuttingDown => write!(f, "Driver manager is shutting down"),
            Error::DriverNotLaunched => write!(f, "Embedded driver not launched"),
            Error::AlreadyBound => write!(f, "Processor already bound to an upstream"),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_message_text() {
        let err = Error::Upstream("boom".to_string());
        assert_eq!(err.to_string(), "Upstream error: boom");
    }

    #[test]
    fn io_error_exposes_source() {
        use std::error::Error as _;
        let err = Error::from(std::io::Error::other("disk gone"));
        assert!(err.source().is_some());
    }
}
