// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process media driver: stream registry, publications, subscriptions.

use crossbeam::queue::ArrayQueue;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::counters::{CounterId, CountersRegistry};
use super::{Offer, MTU, PUBLICATION_MAX_POSITION};
use crate::error::{Error, Result};
use crate::wake::WakeNotifier;

static LAUNCH_SEQ: AtomicU64 = AtomicU64::new(0);

/// Identity of one stream inside the driver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub channel: Arc<str>,
    pub stream_id: u32,
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} stream={}", self.channel, self.stream_id)
    }
}

/// One subscription's view of a stream: a bounded frame queue plus its
/// position counter.
struct Image {
    queue: ArrayQueue<Arc<[u8]>>,
    position: AtomicU64,
    active: AtomicBool,
    notifier: Option<Arc<WakeNotifier>>,
}

/// All images attached to one (channel, stream_id).
#[derive(Default)]
struct StreamChannel {
    images: RwLock<Vec<Arc<Image>>>,
}

/// Embedded media driver shared by every processor in the process.
///
/// Launched and torn down by the driver manager; everything else holds it
/// through a [`crate::driver::DriverHandle`].
pub struct MediaDriver {
    streams: DashMap<StreamKey, Arc<StreamChannel>>,
    counters: Arc<CountersRegistry>,
    publication_window: usize,
    dir: PathBuf,
    closed: Arc<AtomicBool>,
    accepting: AtomicBool,
}

impl MediaDriver {
    /// Launch a driver with the given per-image queue capacity. Claims a
    /// scratch directory under the system temp dir.
    pub fn launch(publication_window: usize) -> Result<Arc<MediaDriver>> {
        let seq = LAUNCH_SEQ.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("aerolink-{}-{}", std::process::id(), seq));
        std::fs::create_dir_all(&dir)?;
        log::debug!(
            "[MediaDriver] launched window={} dir={}",
            publication_window,
            dir.display()
        );
        Ok(Arc::new(MediaDriver {
            streams: DashMap::new(),
            counters: Arc::new(CountersRegistry::new()),
            publication_window: publication_window.max(1),
            dir,
            closed: Arc::new(AtomicBool::new(false)),
            accepting: AtomicBool::new(true),
        }))
    }

    fn channel(&self, key: &StreamKey) -> Arc<StreamChannel> {
        self.streams
            .entry(key.clone())
            .or_insert_with(|| Arc::new(StreamChannel::default()))
            .clone()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::DriverNotLaunched);
        }
        if !self.accepting.load(Ordering::Acquire) {
            return Err(Error::ManagerShuttingDown);
        }
        Ok(())
    }

    /// Open an exclusive writer for `(channel, stream_id)`.
    pub fn add_publication(&self, channel: &str, stream_id: u32) -> Result<Publication> {
        self.check_open()?;
        let key = StreamKey {
            channel: Arc::from(channel),
            stream_id,
        };
        let counter = self.counters.register(format!("sender pos: {}", key));
        log::debug!("[MediaDriver] add_publication {}", key);
        Ok(Publication {
            chan: self.channel(&key),
            counters: Arc::clone(&self.counters),
            driver_closed: Arc::clone(&self.closed),
            key,
            counter,
            position: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Open a polling reader for `(channel, stream_id)`. The optional
    /// notifier fires on every frame broadcast into this image.
    pub fn add_subscription(
        &self,
        channel: &str,
        stream_id: u32,
        notifier: Option<Arc<WakeNotifier>>,
    ) -> Result<Subscription> {
        self.check_open()?;
        let key = StreamKey {
            channel: Arc::from(channel),
            stream_id,
        };
        let image = Arc::new(Image {
            queue: ArrayQueue::new(self.publication_window),
            position: AtomicU64::new(0),
            active: AtomicBool::new(true),
            notifier,
        });
        let chan = self.channel(&key);
        chan.images.write().push(Arc::clone(&image));
        let counter = self.counters.register(format!("subscriber pos: {}", key));
        log::debug!("[MediaDriver] add_subscription {}", key);
        Ok(Subscription {
            chan,
            image,
            counters: Arc::clone(&self.counters),
            key,
            counter,
            closed: AtomicBool::new(false),
        })
    }

    /// Counter registry used by the driver manager's shutdown probe.
    pub fn counters(&self) -> &Arc<CountersRegistry> {
        &self.counters
    }

    /// Scratch directory claimed at launch.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Refuse new publications and subscriptions; existing handles keep
    /// working. First step of the manager's shutdown sequence.
    pub fn close_client_view(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    /// Tear the driver down. Existing publications see `Offer::Closed`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.accepting.store(false, Ordering::Release);
            self.streams.clear();
            log::debug!("[MediaDriver] closed dir={}", self.dir.display());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Exclusive writer view over one stream.
///
/// Single-writer: at most one task calls [`Publication::offer`] at a time.
pub struct Publication {
    chan: Arc<StreamChannel>,
    counters: Arc<CountersRegistry>,
    driver_closed: Arc<AtomicBool>,
    key: StreamKey,
    counter: CounterId,
    position: AtomicU64,
    closed: AtomicBool,
}

impl Publication {
    /// Non-blocking offer of one encoded frame.
    pub fn offer(&self, frame: &[u8]) -> Offer {
        if self.closed.load(Ordering::Acquire) || self.driver_closed.load(Ordering::Acquire) {
            return Offer::Closed;
        }
        if frame.len() > MTU {
            log::error!(
                "[Publication] frame of {} bytes exceeds MTU {} on {}",
                frame.len(),
                MTU,
                self.key
            );
            return Offer::MaxPositionExceeded;
        }

        let images = match self.chan.images.try_read() {
            Some(guard) => guard,
            None => return Offer::AdminAction,
        };
        let live: Vec<&Arc<Image>> = images
            .iter()
            .filter(|image| image.active.load(Ordering::Acquire))
            .collect();
        if live.is_empty() {
            return Offer::NotConnected;
        }

        let new_pos = self.position.load(Ordering::Relaxed) + frame.len() as u64;
        if new_pos > PUBLICATION_MAX_POSITION {
            return Offer::MaxPositionExceeded;
        }
        if live.iter().any(|image| image.queue.is_full()) {
            return Offer::Backpressured;
        }

        let shared: Arc<[u8]> = Arc::from(frame);
        for image in live {
            // A racing writer on the same stream may have filled the slot
            // since the capacity check; the transport is lossy by contract.
            if image.queue.push(Arc::clone(&shared)).is_err() {
                log::debug!("[Publication] image overrun on {}, frame dropped", self.key);
                continue;
            }
            if let Some(notifier) = &image.notifier {
                notifier.notify();
            }
        }
        self.position.store(new_pos, Ordering::Relaxed);
        Offer::Ok(new_pos)
    }

    /// Position in bytes offered so far.
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Relaxed)
    }

    /// Close the publication and drop its counter. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.counters.unregister(self.counter);
            log::debug!("[Publication] closed {}", self.key);
        }
    }
}

impl Drop for Publication {
    fn drop(&mut self) {
        self.close();
    }
}

/// Polling reader view over one stream.
///
/// Single-reader: polled from exactly one task at a time.
pub struct Subscription {
    chan: Arc<StreamChannel>,
    image: Arc<Image>,
    counters: Arc<CountersRegistry>,
    key: StreamKey,
    counter: CounterId,
    closed: AtomicBool,
}

impl Subscription {
    /// Drain up to `limit` frames into `handler`. Returns the number read.
    pub fn poll<F: FnMut(&[u8])>(&self, mut handler: F, limit: usize) -> usize {
        let mut read = 0;
        while read < limit {
            match self.image.queue.pop() {
                Some(frame) => {
                    self.image
                        .position
                        .fetch_add(frame.len() as u64, Ordering::Relaxed);
                    handler(&frame);
                    read += 1;
                }
                None => break,
            }
        }
        read
    }

    /// Close the subscription, detach its image, drop its counter. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.image.active.store(false, Ordering::Release);
            self.chan
                .images
                .write()
                .retain(|image| !Arc::ptr_eq(image, &self.image));
            self.counters.unregister(self.counter);
            log::debug!("[Subscription] closed {}", self.key);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> Arc<MediaDriver> {
        MediaDriver::launch(4).expect("launch")
    }

    #[test]
    fn offer_without_images_is_not_connected() {
        let driver = driver();
        let publication = driver.add_publication("aeron:ipc", 1).expect("pub");
        assert_eq!(publication.offer(b"x"), Offer::NotConnected);
    }

    #[test]
    fn offer_reaches_every_image() {
        let driver = driver();
        let publication = driver.add_publication("aeron:ipc", 1).expect("pub");
        let sub_a = driver.add_subscription("aeron:ipc", 1, None).expect("sub");
        let sub_b = driver.add_subscription("aeron:ipc", 1, None).expect("sub");

        assert!(matches!(publication.offer(b"hello"), Offer::Ok(_)));

        for sub in [&sub_a, &sub_b] {
            let mut seen = Vec::new();
            assert_eq!(sub.poll(|frame| seen.push(frame.to_vec()), 8), 1);
            assert_eq!(seen, vec![b"hello".to_vec()]);
        }
    }

    #[test]
    fn full_image_backpressures_the_publication() {
        let driver = driver();
        let publication = driver.add_publication("aeron:ipc", 1).expect("pub");
        let sub = driver.add_subscription("aeron:ipc", 1, None).expect("sub");

        for _ in 0..4 {
            assert!(matches!(publication.offer(b"f"), Offer::Ok(_)));
        }
        assert_eq!(publication.offer(b"f"), Offer::Backpressured);

        assert_eq!(sub.poll(|_| {}, 1), 1);
        assert!(matches!(publication.offer(b"f"), Offer::Ok(_)));
    }

    #[test]
    fn closed_subscription_detaches_its_image() {
        let driver = driver();
        let publication = driver.add_publication("aeron:ipc", 1).expect("pub");
        let sub = driver.add_subscription("aeron:ipc", 1, None).expect("sub");
        assert!(matches!(publication.offer(b"x"), Offer::Ok(_)));
        sub.close();
        assert_eq!(publication.offer(b"x"), Offer::NotConnected);
    }

    #[test]
    fn counters_track_open_handles() {
        let driver = driver();
        let publication = driver.add_publication("aeron:ipc", 1).expect("pub");
        let sub = driver.add_subscription("aeron:ipc", 1, None).expect("sub");

        let mut sender = 0;
        let mut subscriber = 0;
        driver.counters().for_each(|_, label| {
            if label.starts_with("sender pos") {
                sender += 1;
            }
            if label.starts_with("subscriber pos") {
                subscriber += 1;
            }
        });
        assert_eq!((sender, subscriber), (1, 1));

        publication.close();
        sub.close();
        assert!(driver.counters().is_empty());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let driver = driver();
        let publication = driver.add_publication("aeron:ipc", 1).expect("pub");
        let _sub = driver.add_subscription("aeron:ipc", 1, None).expect("sub");
        let frame = vec![0u8; MTU + 1];
        assert_eq!(publication.offer(&frame), Offer::MaxPositionExceeded);
    }

    #[test]
    fn closed_driver_fails_offers_and_opens() {
        let driver = driver();
        let publication = driver.add_publication("aeron:ipc", 1).expect("pub");
        driver.close();
        assert_eq!(publication.offer(b"x"), Offer::Closed);
        assert!(driver.add_publication("aeron:ipc", 2).is_err());
    }

    #[test]
    fn notifier_fires_on_offer() {
        let driver = driver();
        let notifier = WakeNotifier::shared();
        let publication = driver.add_publication("aeron:ipc", 1).expect("pub");
        let _sub = driver
            .add_subscription("aeron:ipc", 1, Some(Arc::clone(&notifier)))
            .expect("sub");
        assert!(!notifier.check_and_clear());
        assert!(matches!(publication.offer(b"x"), Offer::Ok(_)));
        assert!(notifier.check_and_clear());
    }
}
