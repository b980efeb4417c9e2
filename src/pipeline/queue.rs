//! Bounded frame queue between the capture thread and inference workers

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam::utils::CachePadded;
use flume::{Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::Serialize;
use tracing::trace;

use crate::capture::Frame;

/// Fixed-capacity MPMC queue of captured frames.
///
/// When full, `put` rejects the incoming frame and leaves queued frames
/// untouched: older frames win over the newest one.
pub struct BoundedFrameQueue {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    capacity: usize,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_enqueued: AtomicU64,
    frames_dropped: AtomicU64,
    frames_dequeued: AtomicU64,
    frames_purged: AtomicU64,
}

/// Point-in-time view of queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub capacity: usize,
    pub len: usize,
    pub enqueued: u64,
    pub dropped: u64,
    pub dequeued: u64,
    pub purged: u64,
}

impl BoundedFrameQueue {
    pub fn new(capacity: usize) -> Self {
        // A zero-capacity flume channel is a rendezvous, which would make
        // every non-blocking put fail.
        let capacity = capacity.max(1);
        let (tx, rx) = flume::bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: enqueue without blocking. Returns false if the frame was dropped.
    pub fn put(&self, frame: Frame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.stats.frames_enqueued.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("hermes_frames_enqueued_total").increment(1);
                true
            }
            Err(TrySendError::Full(frame)) => {
                let dropped = self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                metrics::counter!("hermes_frames_dropped_total").increment(1);
                trace!(
                    ts_ns = frame.capture_timestamp_ns,
                    dropped,
                    "Frame queue full, dropping incoming frame"
                );
                false
            }
            // Both ends live in self, so the channel cannot disconnect
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Consumer: wait up to `timeout` for the oldest queued frame.
    pub fn get(&self, timeout: Duration) -> Option<Frame> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => {
                self.stats.frames_dequeued.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("hermes_frames_dequeued_total").increment(1);
                Some(frame)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Remove and return everything currently queued, oldest first.
    pub fn drain(&self) -> Vec<Frame> {
        let frames: Vec<Frame> = self.rx.try_iter().collect();
        self.stats
            .frames_purged
            .fetch_add(frames.len() as u64, Ordering::Relaxed);
        frames
    }

    /// Discard the current backlog, returning how many frames were removed.
    pub fn purge(&self) -> usize {
        self.drain().len()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            capacity: self.capacity,
            len: self.len(),
            enqueued: self.stats.frames_enqueued.load(Ordering::Relaxed),
            dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            dequeued: self.stats.frames_dequeued.load(Ordering::Relaxed),
            purged: self.stats.frames_purged.load(Ordering::Relaxed),
        }
    }
}
