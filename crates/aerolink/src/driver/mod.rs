// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reference-counted lifecycle for the embedded media driver.
//!
//! One [`DriverManager`] owns one embedded driver. `acquire()` launches the
//! driver on first use and hands out [`DriverHandle`]s; dropping the last
//! handle (with auto-shutdown enabled) begins a bounded retry loop that tears
//! the driver down once no publication or subscription position counters
//! remain. Forcing shutdown while positions are still active risks tearing
//! buffers out from under live handles, so the probe waits for the counters
//! to drain, up to `shutdown_timeout`.
//!
//! # State machine
//!
//! ```text
//! NotStarted --acquire--> Started --last release--> ShuttingDown
//!      ^                                                 |
//!      +------------- force shutdown --------------------+
//! ```
//!
//! All transitions are serialized through one lock. `acquire()` during
//! ShuttingDown fails with [`Error::ManagerShuttingDown`] rather than
//! panicking; `release()` during ShuttingDown is a counted no-op.
//!
//! Managers are plain values: the process-wide default lives behind
//! [`DriverManager::global`], and tests inject fresh instances through
//! [`crate::Context::driver_manager`].

use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::transport::{MediaDriver, DEFAULT_PUBLICATION_WINDOW};

/// Default pause between shutdown probes (milliseconds).
pub const DEFAULT_RETRY_SHUTDOWN_MILLIS: u64 = 250;

/// Default bound on the whole shutdown sequence.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Driver manager tuning.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Pause between counter probes while shutting down.
    pub retry_shutdown_millis: u64,
    /// Force shutdown once this much time elapsed, counters or not.
    pub shutdown_timeout: Duration,
    /// Tear the driver down when the last handle is released.
    pub auto_shutdown: bool,
    /// Per-image queue capacity handed to the embedded driver.
    pub publication_window: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            retry_shutdown_millis: DEFAULT_RETRY_SHUTDOWN_MILLIS,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            auto_shutdown: true,
            publication_window: DEFAULT_PUBLICATION_WINDOW,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    NotStarted,
    Started,
    ShuttingDown,
}

struct Inner {
    state: State,
    refcount: usize,
    driver: Option<Arc<MediaDriver>>,
}

/// Process-wide refcounted owner of the embedded driver.
pub struct DriverManager {
    config: DriverConfig,
    self_weak: std::sync::Weak<DriverManager>,
    inner: Mutex<Inner>,
}

static GLOBAL: OnceLock<Arc<DriverManager>> = OnceLock::new();
static CLEANUPS: Mutex<Vec<PathBuf>> = Mutex::new(Vec::new());

/// Directories scheduled for deletion by past force-shutdowns.
pub fn scheduled_cleanups() -> Vec<PathBuf> {
    CLEANUPS.lock().clone()
}

impl DriverManager {
    /// Create a manager with explicit tuning.
    pub fn new(config: DriverConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            self_weak: weak.clone(),
            inner: Mutex::new(Inner {
                state: State::NotStarted,
                refcount: 0,
                driver: None,
            }),
        })
    }

    /// Create a manager with the documented defaults.
    pub fn with_defaults() -> Arc<Self> {
        Self::new(DriverConfig::default())
    }

    /// The process-wide default manager.
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(Self::with_defaults))
    }

    /// Acquire a handle, launching the driver on the first call.
    ///
    /// Fails with [`Error::ManagerShuttingDown`] while a previous teardown is
    /// still draining.
    pub fn acquire(&self) -> Result<DriverHandle> {
        let manager = self.self_weak.upgrade().ok_or(Error::ManagerShuttingDown)?;
        let mut inner = self.inner.lock();
        match inner.state {
            State::ShuttingDown => return Err(Error::ManagerShuttingDown),
            State::NotStarted => {
                let driver = MediaDriver::launch(self.config.publication_window)?;
                inner.driver = Some(driver);
                inner.state = State::Started;
                log::debug!("[DriverManager] media driver started");
            }
            State::Started => {}
        }
        inner.refcount += 1;
        let driver = match &inner.driver {
            Some(driver) => Arc::clone(driver),
            // Started implies a live driver; treat a missing one as a race
            // with force-shutdown.
            None => return Err(Error::ManagerShuttingDown),
        };
        Ok(DriverHandle {
            manager,
            driver,
            released: AtomicBool::new(false),
        })
    }

    /// Current refcount (test observability).
    pub fn counter(&self) -> usize {
        self.inner.lock().refcount
    }

    /// True once the manager is back in its initial state.
    pub fn is_terminated(&self) -> bool {
        self.inner.lock().state == State::NotStarted
    }

    /// Begin teardown regardless of refcount.
    ///
    /// No-op when the driver never started; fails with
    /// [`Error::ManagerShuttingDown`] when a teardown is already running.
    pub fn shutdown(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            State::NotStarted => Ok(()),
            State::ShuttingDown => Err(Error::ManagerShuttingDown),
            State::Started => {
                inner.refcount = 0;
                self.begin_shutdown(&mut inner);
                Ok(())
            }
        }
    }

    fn release_one(&self) {
        let mut inner = self.inner.lock();
        inner.refcount = inner.refcount.saturating_sub(1);
        if inner.refcount == 0 && self.config.auto_shutdown && inner.state == State::Started {
            self.begin_shutdown(&mut inner);
        }
    }

    /// Transition to ShuttingDown and spawn the probe thread. Caller holds
    /// the state lock.
    fn begin_shutdown(&self, inner: &mut Inner) {
        inner.state = State::ShuttingDown;
        let driver = match &inner.driver {
            Some(driver) => Arc::clone(driver),
            None => {
                inner.state = State::NotStarted;
                return;
            }
        };
        driver.close_client_view();

        let weak = self.self_weak.clone();
        let retry = Duration::from_millis(self.config.retry_shutdown_millis.max(1));
        let timeout = self.config.shutdown_timeout;
        let spawned = std::thread::Builder::new()
            .name("aerolink-driver-shutdown".to_string())
            .spawn(move || {
                let start = Instant::now();
                loop {
                    std::thread::sleep(retry);
                    if Self::can_shutdown(&driver) {
                        break;
                    }
                    if start.elapsed() >= timeout {
                        log::warn!(
                            "[DriverManager] shutdown timeout after {:?}, forcing with active positions",
                            timeout
                        );
                        break;
                    }
                }
                if let Some(manager) = weak.upgrade() {
                    manager.force_shutdown();
                }
            });
        if let Err(e) = spawned {
            log::error!("[DriverManager] failed to spawn shutdown probe: {}", e);
            // Fall back to forcing inline; the lock is already held.
            Self::force_shutdown_locked(inner);
        }
    }

    fn can_shutdown(driver: &MediaDriver) -> bool {
        let mut active = false;
        driver.counters().for_each(|_, label| {
            if label.starts_with("sender pos") || label.starts_with("subscriber pos") {
                active = true;
            }
        });
        !active
    }

    /// Close the driver, schedule its directory for deletion, reset state.
    fn force_shutdown(&self) {
        let mut inner = self.inner.lock();
        Self::force_shutdown_locked(&mut inner);
    }

    fn force_shutdown_locked(inner: &mut Inner) {
        if let Some(driver) = inner.driver.take() {
            driver.close();
            let dir = driver.dir().to_path_buf();
            CLEANUPS.lock().push(dir.clone());
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                log::error!(
                    "[DriverManager] failed to delete driver directory {}: {}",
                    dir.display(),
                    e
                );
            }
        }
        inner.state = State::NotStarted;
        log::debug!("[DriverManager] media driver shutdown");
    }
}

/// Scoped claim on the embedded driver. Dropping it releases one refcount.
pub struct DriverHandle {
    manager: Arc<DriverManager>,
    driver: Arc<MediaDriver>,
    released: AtomicBool,
}

impl DriverHandle {
    /// The driver this handle keeps alive.
    pub fn driver(&self) -> &Arc<MediaDriver> {
        &self.driver
    }
}

impl Drop for DriverHandle {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.manager.release_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> DriverConfig {
        DriverConfig {
            retry_shutdown_millis: 10,
            shutdown_timeout: Duration::from_secs(2),
            auto_shutdown: true,
            publication_window: 8,
        }
    }

    fn wait_terminated(manager: &Arc<DriverManager>, bound: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < bound {
            if manager.is_terminated() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        manager.is_terminated()
    }

    #[test]
    fn refcount_tracks_handles() {
        let manager = DriverManager::new(fast_config());
        assert_eq!(manager.counter(), 0);
        let a = manager.acquire().expect("acquire");
        let b = manager.acquire().expect("acquire");
        assert_eq!(manager.counter(), 2);
        drop(a);
        assert_eq!(manager.counter(), 1);
        drop(b);
        assert!(wait_terminated(&manager, Duration::from_secs(3)));
    }

    #[test]
    fn handles_share_one_driver() {
        let manager = DriverManager::new(fast_config());
        let a = manager.acquire().expect("acquire");
        let b = manager.acquire().expect("acquire");
        assert!(Arc::ptr_eq(a.driver(), b.driver()));
    }

    #[test]
    fn shutdown_waits_for_position_counters() {
        let manager = DriverManager::new(fast_config());
        let handle = manager.acquire().expect("acquire");
        let publication = handle
            .driver()
            .add_publication("aeron:ipc", 1)
            .expect("pub");

        drop(handle);
        // The publication still holds a "sender pos" counter, so the probe
        // must keep the driver alive.
        std::thread::sleep(Duration::from_millis(100));
        assert!(!manager.is_terminated());

        publication.close();
        assert!(wait_terminated(&manager, Duration::from_secs(3)));
    }

    #[test]
    fn acquire_during_shutdown_is_refused() {
        let manager = DriverManager::new(fast_config());
        let handle = manager.acquire().expect("acquire");
        let publication = handle
            .driver()
            .add_publication("aeron:ipc", 1)
            .expect("pub");
        drop(handle);

        // Counters pin the manager in ShuttingDown.
        std::thread::sleep(Duration::from_millis(50));
        assert!(matches!(
            manager.acquire(),
            Err(Error::ManagerShuttingDown)
        ));

        publication.close();
        assert!(wait_terminated(&manager, Duration::from_secs(3)));
        // Back to NotStarted, acquire works again.
        let again = manager.acquire().expect("acquire after restart");
        drop(again);
    }

    #[test]
    fn directory_cleanup_is_scheduled() {
        let manager = DriverManager::new(fast_config());
        let handle = manager.acquire().expect("acquire");
        let dir = handle.driver().dir().to_path_buf();
        assert!(dir.exists());
        drop(handle);
        assert!(wait_terminated(&manager, Duration::from_secs(3)));
        assert!(scheduled_cleanups().contains(&dir));
        assert!(!dir.exists());
    }

    #[test]
    fn manual_shutdown_is_idempotent_per_state() {
        let manager = DriverManager::new(DriverConfig {
            auto_shutdown: false,
            ..fast_config()
        });
        let handle = manager.acquire().expect("acquire");
        drop(handle);
        // auto_shutdown off: still Started.
        assert!(!manager.is_terminated());
        manager.shutdown().expect("manual shutdown");
        assert!(wait_terminated(&manager, Duration::from_secs(3)));
        // NotStarted: a second shutdown is a no-op.
        manager.shutdown().expect("noop shutdown");
    }
}
