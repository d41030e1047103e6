//! Bounded drop-oldest frame queue

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;

use crate::Frame;

pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// Multi-consumer frame queue that never blocks its producer
///
/// When full, a push evicts the oldest frame so consumers always see the most recent
/// frames instead of a growing backlog.
pub struct FrameQueue {
    ring: Mutex<HeapRb<Frame>>,
    available: Condvar,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicUsize,
    frames_read: AtomicUsize,
    frames_dropped: AtomicUsize,
}

/// Counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub written: usize,
    pub read: usize,
    pub dropped: usize,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(HeapRb::new(capacity.max(1))),
            available: Condvar::new(),
            stats: CachePadded::new(Stats::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HeapRb<Frame>> {
        // frames are plain values, a panicking holder cannot leave one half-written
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Producer: push a frame, evicting the oldest when full
    ///
    /// Returns true when a frame was evicted.
    pub fn push(&self, frame: Frame) -> bool {
        let evicted = self.lock().push_overwrite(frame);
        self.available.notify_one();

        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
        let dropped = evicted.is_some();
        if dropped {
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
        // evicted frame is released here, outside the lock
        drop(evicted);
        dropped
    }

    /// Consumer: wait up to `timeout` for a frame
    ///
    /// `None` means the timeout elapsed with the queue empty.
    pub fn pop_wait(&self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        let mut ring = self.lock();
        loop {
            if let Some(frame) = ring.try_pop() {
                self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
                return Some(frame);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            ring = self
                .available
                .wait_timeout(ring, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Consumer: take a frame if one is ready
    pub fn try_pop(&self) -> Option<Frame> {
        let frame = self.lock().try_pop()?;
        self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    pub fn len(&self) -> usize {
        self.lock().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity().get()
    }

    /// Discard every queued frame
    pub fn clear(&self) -> usize {
        let drained: Vec<Frame> = self.lock().pop_iter().collect();
        drained.len()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            written: self.stats.frames_written.load(Ordering::Relaxed),
            read: self.stats.frames_read.load(Ordering::Relaxed),
            dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
