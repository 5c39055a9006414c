// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Demand aggregation.
//!
//! Both ends of the protocol run the same arithmetic: "how much new credit
//! can I forward without ever over-requesting". The sender side forwards
//! credit to its upstream subscription; the receiver side forwards credit to
//! its remote sender as More frames.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::SessionSnapshot;
use crate::flow::UpstreamCell;
use crate::protocol::UNBOUNDED;

/// Tracks credit already forwarded and computes the next delta.
///
/// `pump(remaining, consumed)` takes the remaining demand the caller wants
/// covered and the count of items consumed against earlier credit. The
/// delta keeps in-flight credit (`forwarded - consumed`) from exceeding
/// `remaining`. The sender side feeds it the minimum across remote sessions
/// (the slowest session bounds buffering); the receiver side feeds it the
/// maximum across its local fan-out entries (each entry has its own
/// backlog, so the fastest one paces the grant). Unbounded demand is
/// forwarded exactly once.
#[derive(Debug, Default)]
pub struct DemandLedger {
    forwarded: u64,
    unbounded_forwarded: bool,
}

impl DemandLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute the next credit delta, or `None` when nothing new can be
    /// forwarded. `remaining` is `None` while no participant exists.
    pub fn pump(&mut self, remaining: Option<u64>, consumed: u64) -> Option<u64> {
        if self.unbounded_forwarded {
            return None;
        }
        let remaining = remaining?;
        if remaining == UNBOUNDED {
            self.unbounded_forwarded = true;
            return Some(UNBOUNDED);
        }
        let in_flight = self.forwarded.saturating_sub(consumed);
        let delta = remaining.saturating_sub(in_flight);
        if delta == 0 {
            return None;
        }
        self.forwarded = self.forwarded.saturating_add(delta);
        Some(delta)
    }

    /// Total credit forwarded so far.
    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    pub fn is_unbounded(&self) -> bool {
        self.unbounded_forwarded
    }
}

/// Sender-side demand pump: session snapshot in, upstream requests out.
///
/// Shared between the service dispatcher (pumps after Join/More) and the
/// sender thread (pumps after each published Next).
pub(crate) struct DemandPump {
    sessions: Arc<SessionSnapshot>,
    ledger: Mutex<DemandLedger>,
    upstream: Arc<UpstreamCell>,
    consumed: AtomicU64,
}

impl DemandPump {
    pub fn new(sessions: Arc<SessionSnapshot>, upstream: Arc<UpstreamCell>) -> Self {
        Self {
            sessions,
            ledger: Mutex::new(DemandLedger::new()),
            upstream,
            consumed: AtomicU64::new(0),
        }
    }

    /// Record one Next frame published against earlier credit.
    pub fn record_sent(&self) {
        self.consumed.fetch_add(1, Ordering::AcqRel);
    }

    /// Forward any newly available credit to the upstream subscription.
    pub fn pump(&self) {
        let delta = {
            let mut ledger = self.ledger.lock();
            ledger.pump(
                self.sessions.min_demand(),
                self.consumed.load(Ordering::Acquire),
            )
        };
        if let Some(n) = delta {
            log::trace!("[DemandPump] requesting {} upstream", n);
            self.upstream.request(n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_participants_means_no_credit() {
        let mut ledger = DemandLedger::new();
        assert_eq!(ledger.pump(None, 0), None);
    }

    #[test]
    fn zero_demand_means_no_credit() {
        let mut ledger = DemandLedger::new();
        assert_eq!(ledger.pump(Some(0), 0), None);
    }

    #[test]
    fn forwards_min_and_never_over_requests() {
        let mut ledger = DemandLedger::new();
        assert_eq!(ledger.pump(Some(3), 0), Some(3));
        // Same state again: 3 in flight covers the remaining minimum.
        assert_eq!(ledger.pump(Some(3), 0), None);
        // One item consumed, minimum dropped accordingly: still covered.
        assert_eq!(ledger.pump(Some(2), 1), None);
        // Fresh demand raises the minimum past in-flight credit.
        assert_eq!(ledger.pump(Some(5), 1), Some(3));
        assert_eq!(ledger.forwarded(), 6);
    }

    #[test]
    fn unbounded_is_forwarded_once() {
        let mut ledger = DemandLedger::new();
        assert_eq!(ledger.pump(Some(UNBOUNDED), 0), Some(UNBOUNDED));
        assert!(ledger.is_unbounded());
        assert_eq!(ledger.pump(Some(UNBOUNDED), 10), None);
        assert_eq!(ledger.pump(Some(4), 10), None);
    }

    #[test]
    fn pump_tracks_consumption() {
        let mut ledger = DemandLedger::new();
        assert_eq!(ledger.pump(Some(2), 0), Some(2));
        // Both consumed, participant granted 2 more.
        assert_eq!(ledger.pump(Some(2), 2), Some(2));
        assert_eq!(ledger.forwarded(), 4);
    }
}
