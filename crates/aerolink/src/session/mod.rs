// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Remote subscriber sessions on a sender's outbound stream.
//!
//! The table itself is owned by the dispatcher thread draining the service
//! stream - that is the only place sessions are added or removed. Everyone
//! else (the sender thread, the demand pump) reads through an atomic snapshot
//! pointer. Demand and liveness live in atomics inside the shared session
//! entries so the sender can decrement demand as it publishes without
//! touching table membership.

mod demand;

pub use demand::DemandLedger;
pub(crate) use demand::DemandPump;

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use crate::protocol::UNBOUNDED;

/// Monotonic nanoseconds since process start. Heartbeat frames and liveness
/// bookkeeping use this clock; it never goes backwards.
pub(crate) fn now_nanos() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Session id proposed by a joining receiver. Unique within the process and
/// salted with the pid so independent processes sharing a channel do not
/// collide.
pub(crate) fn next_session_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    (u64::from(std::process::id()) << 32) | NEXT.fetch_add(1, Ordering::Relaxed)
}

/// One remote subscriber registered on this sender.
#[derive(Debug)]
pub struct Session {
    id: u64,
    demand: AtomicU64,
    last_heartbeat_nanos: AtomicU64,
    cancelled: AtomicBool,
}

impl Session {
    fn new(id: u64, now: u64) -> Self {
        Self {
            id,
            demand: AtomicU64::new(0),
            last_heartbeat_nanos: AtomicU64::new(now),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remaining demand; `UNBOUNDED` once any participant asked for all.
    pub fn demand(&self) -> u64 {
        self.demand.load(Ordering::Acquire)
    }

    /// Saturating add; `UNBOUNDED` is absorbing.
    pub fn add_demand(&self, n: u64) {
        let _ = self
            .demand
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current == UNBOUNDED || n == UNBOUNDED {
                    Some(UNBOUNDED)
                } else {
                    Some(current.saturating_add(n))
                }
            });
    }

    /// Consume one unit of demand for a published Next frame. Unbounded
    /// demand never decreases.
    pub fn take_one(&self) {
        let _ = self
            .demand
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current == UNBOUNDED {
                    None
                } else {
                    Some(current.saturating_sub(1))
                }
            });
    }

    pub fn refresh(&self, now: u64) {
        self.last_heartbeat_nanos.store(now, Ordering::Release);
    }

    pub fn last_heartbeat_nanos(&self) -> u64 {
        self.last_heartbeat_nanos.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Read-only view over the current session set, swapped atomically by the
/// registry after every mutation.
pub struct SessionSnapshot {
    sessions: ArcSwap<Vec<Arc<Session>>>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            sessions: ArcSwap::from_pointee(Vec::new()),
        }
    }
}

impl SessionSnapshot {
    /// Number of live (non-cancelled) sessions.
    pub fn live_count(&self) -> usize {
        self.sessions
            .load()
            .iter()
            .filter(|s| !s.is_cancelled())
            .count()
    }

    /// Minimum remaining demand across live sessions, or `None` when no live
    /// session exists. The sender moves only as fast as the slowest
    /// subscriber.
    pub fn min_demand(&self) -> Option<u64> {
        self.sessions
            .load()
            .iter()
            .filter(|s| !s.is_cancelled())
            .map(|s| s.demand())
            .min()
    }

    /// Consume one unit of demand from every live session for a Next frame
    /// that was just published to all of them.
    pub fn take_one_each(&self) {
        for session in self.sessions.load().iter() {
            if !session.is_cancelled() {
                session.take_one();
            }
        }
    }

    fn store(&self, sessions: Vec<Arc<Session>>) {
        self.sessions.store(Arc::new(sessions));
    }
}

/// Sender-side table of joined sessions. Mutated only on the dispatcher
/// thread for the service stream.
pub struct SessionRegistry {
    table: HashMap<u64, Arc<Session>>,
    snapshot: Arc<SessionSnapshot>,
    /// True once any session ever joined; distinguishes "nobody yet" from
    /// "everybody left" for auto-cancel.
    saw_sessions: bool,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            table: HashMap::new(),
            snapshot: Arc::new(SessionSnapshot::default()),
            saw_sessions: false,
        }
    }

    /// Shared read view for the sender thread and the demand pump.
    pub fn snapshot_handle(&self) -> Arc<SessionSnapshot> {
        Arc::clone(&self.snapshot)
    }

    /// Register a joining receiver. Re-joins refresh liveness instead of
    /// resetting demand.
    pub fn on_join(&mut self, session_id: u64, now: u64) -> bool {
        if let Some(existing) = self.table.get(&session_id) {
            existing.refresh(now);
            return false;
        }
        self.table
            .insert(session_id, Arc::new(Session::new(session_id, now)));
        self.saw_sessions = true;
        self.publish();
        log::debug!("[SessionRegistry] join session={}", session_id);
        true
    }

    /// Grant `n` more items to a session. Returns false for unknown ids.
    pub fn on_more(&mut self, session_id: u64, n: u64, now: u64) -> bool {
        match self.table.get(&session_id) {
            Some(session) => {
                session.add_demand(n);
                session.refresh(now);
                true
            }
            None => false,
        }
    }

    /// Cancel and remove a session. Returns false for unknown ids.
    pub fn on_cancel(&mut self, session_id: u64) -> bool {
        match self.table.remove(&session_id) {
            Some(session) => {
                session.cancel();
                self.publish();
                log::debug!("[SessionRegistry] cancel session={}", session_id);
                true
            }
            None => false,
        }
    }

    /// Refresh liveness for a heartbeat. Returns false for unknown ids.
    pub fn on_heartbeat_request(&mut self, session_id: u64, now: u64) -> bool {
        match self.table.get(&session_id) {
            Some(session) => {
                session.refresh(now);
                true
            }
            None => false,
        }
    }

    /// Remove sessions silent for longer than `timeout_nanos`, returning
    /// their ids.
    pub fn reap(&mut self, now: u64, timeout_nanos: u64) -> Vec<u64> {
        let stale: Vec<u64> = self
            .table
            .values()
            .filter(|s| now.saturating_sub(s.last_heartbeat_nanos()) > timeout_nanos)
            .map(|s| s.id())
            .collect();
        for id in &stale {
            if let Some(session) = self.table.remove(id) {
                session.cancel();
                log::debug!("[SessionRegistry] reaped session={}", id);
            }
        }
        if !stale.is_empty() {
            self.publish();
        }
        stale
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// True once a session joined at some point in the past.
    pub fn saw_sessions(&self) -> bool {
        self.saw_sessions
    }

    fn publish(&self) {
        self.snapshot.store(self.table.values().cloned().collect());
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_creates_with_zero_demand() {
        let mut registry = SessionRegistry::new();
        assert!(registry.on_join(1, 0));
        assert_eq!(registry.snapshot_handle().min_demand(), Some(0));
    }

    #[test]
    fn rejoin_refreshes_without_resetting_demand() {
        let mut registry = SessionRegistry::new();
        registry.on_join(1, 0);
        registry.on_more(1, 5, 0);
        assert!(!registry.on_join(1, 100));
        assert_eq!(registry.snapshot_handle().min_demand(), Some(5));
    }

    #[test]
    fn more_saturates_to_unbounded() {
        let mut registry = SessionRegistry::new();
        registry.on_join(1, 0);
        registry.on_more(1, UNBOUNDED, 0);
        registry.on_more(1, 3, 0);
        assert_eq!(registry.snapshot_handle().min_demand(), Some(UNBOUNDED));
    }

    #[test]
    fn min_demand_tracks_slowest_session() {
        let mut registry = SessionRegistry::new();
        registry.on_join(1, 0);
        registry.on_join(2, 0);
        registry.on_more(1, 10, 0);
        registry.on_more(2, 3, 0);
        let snapshot = registry.snapshot_handle();
        assert_eq!(snapshot.min_demand(), Some(3));

        snapshot.take_one_each();
        assert_eq!(snapshot.min_demand(), Some(2));
    }

    #[test]
    fn unbounded_demand_never_decreases() {
        let mut registry = SessionRegistry::new();
        registry.on_join(1, 0);
        registry.on_more(1, UNBOUNDED, 0);
        let snapshot = registry.snapshot_handle();
        snapshot.take_one_each();
        assert_eq!(snapshot.min_demand(), Some(UNBOUNDED));
    }

    #[test]
    fn cancel_removes_from_view() {
        let mut registry = SessionRegistry::new();
        registry.on_join(1, 0);
        registry.on_join(2, 0);
        assert!(registry.on_cancel(1));
        assert!(!registry.on_cancel(1));
        let snapshot = registry.snapshot_handle();
        assert_eq!(snapshot.live_count(), 1);
        assert!(!registry.is_empty());
    }

    #[test]
    fn reap_removes_silent_sessions() {
        let mut registry = SessionRegistry::new();
        registry.on_join(1, 0);
        registry.on_join(2, 0);
        registry.on_heartbeat_request(2, 900);

        let reaped = registry.reap(1_000, 500);
        assert_eq!(reaped, vec![1]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.snapshot_handle().live_count(), 1);
    }

    #[test]
    fn unknown_session_operations_report_false() {
        let mut registry = SessionRegistry::new();
        assert!(!registry.on_more(42, 1, 0));
        assert!(!registry.on_heartbeat_request(42, 0));
        assert!(!registry.on_cancel(42));
    }
}
