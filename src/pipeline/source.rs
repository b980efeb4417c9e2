//! Pull-style video source over the push-fed frame queue

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::capture::VideoFrame;
use crate::pipeline::BoundedFrameQueue;

/// Static description of a source, independent of any single frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SourceProperties {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub is_file: bool,
    pub total_frames: u64,
}

/// Two-phase capture contract expected by pull-based consumers.
///
/// `grab` advances the source and parks one frame; `retrieve` hands that
/// frame over. Implementations are driven from a single consumer thread.
pub trait VideoSource: Send {
    fn start(&mut self);

    fn grab(&mut self) -> bool;

    /// Returns the frame parked by the last successful `grab`, at most once.
    fn retrieve(&mut self) -> Option<VideoFrame>;

    fn release(&mut self);

    fn is_opened(&self) -> bool;

    fn discover_properties(&self) -> SourceProperties;
}

/// Adapts the [`BoundedFrameQueue`] to [`VideoSource`].
///
/// Releasing only purges the backlog; the source stays open because frames
/// keep arriving from the capture thread. Only [`FrameSourceAdapter::stop`]
/// (or the shared running flag) closes it.
pub struct FrameSourceAdapter {
    queue: Arc<BoundedFrameQueue>,
    running: Arc<AtomicBool>,
    sequence: Arc<AtomicU64>,
    properties: SourceProperties,
    grab_timeout: Duration,
    held: Option<VideoFrame>,
}

impl FrameSourceAdapter {
    pub fn new(
        queue: Arc<BoundedFrameQueue>,
        running: Arc<AtomicBool>,
        properties: SourceProperties,
        grab_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            running,
            sequence: Arc::new(AtomicU64::new(0)),
            properties,
            grab_timeout,
            held: None,
        }
    }

    /// Another adapter over the same queue, running flag and frame counter,
    /// with its own holder. One per consumer thread.
    pub fn fork(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            running: self.running.clone(),
            sequence: self.sequence.clone(),
            properties: self.properties,
            grab_timeout: self.grab_timeout,
            held: None,
        }
    }

    /// Close the source. Consumers observe this within one grab timeout.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn next_frame_id(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl VideoSource for FrameSourceAdapter {
    fn start(&mut self) {
        if !self.running.swap(true, Ordering::SeqCst) {
            info!(
                "Frame source started: {}x{} @ {} fps",
                self.properties.width, self.properties.height, self.properties.fps
            );
        }
    }

    fn grab(&mut self) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            self.held = None;
            return false;
        }

        match self.queue.get(self.grab_timeout) {
            Some(frame) => {
                let frame_id = self.next_frame_id();
                debug!(frame_id, ts_ns = frame.capture_timestamp_ns, "Grabbed frame");
                self.held = Some(VideoFrame { frame_id, frame });
                true
            }
            None => {
                self.held = None;
                false
            }
        }
    }

    fn retrieve(&mut self) -> Option<VideoFrame> {
        self.held.take()
    }

    fn release(&mut self) {
        self.held = None;
        let purged = self.queue.purge();
        info!(
            "Frame source released: purged {} queued frames, running={}",
            purged,
            self.running.load(Ordering::SeqCst)
        );
    }

    fn is_opened(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn discover_properties(&self) -> SourceProperties {
        self.properties
    }
}
