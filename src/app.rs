//! Application context: every long-lived component, built once at startup
//! and shared by reference with handlers and background tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::broadcast::Broadcaster;
use crate::capture::{Frame, PixelFormat};
use crate::detect::Detector;
use crate::error::{Error, Result};
use crate::pipeline::{
    BoundedFrameQueue, FrameSourceAdapter, InferencePipeline, QueueStats, SourceProperties,
};
use crate::relay::{RelayStats, ResultRelay};
use crate::Config;

pub struct AppContext {
    config: Config,
    running: Arc<AtomicBool>,
    queue: Arc<BoundedFrameQueue>,
    relay: Arc<ResultRelay>,
    broadcaster: Broadcaster,
    shutdown: CancellationToken,
}

impl AppContext {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let queue = Arc::new(BoundedFrameQueue::new(config.pipeline.queue_capacity));
        let relay = Arc::new(ResultRelay::new(
            config.pipeline.relay_capacity,
            config.detection.min_confidence,
        ));
        let broadcaster = Broadcaster::from_config(&config.server);

        Ok(Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            queue,
            relay,
            broadcaster,
            shutdown: CancellationToken::new(),
        })
    }

    /// Bind the result relay to the current runtime. Call once, from inside it.
    pub fn attach_relay(&self) -> Result<()> {
        self.relay.attach(self.broadcaster.clone())
    }

    /// Producer handle for the capture collaborator
    pub fn frame_ingress(&self) -> FrameIngress {
        FrameIngress {
            queue: self.queue.clone(),
            format: self.config.capture.format,
        }
    }

    /// Pull-style view of the frame queue for a consumer runtime
    pub fn frame_source(&self) -> FrameSourceAdapter {
        FrameSourceAdapter::new(
            self.queue.clone(),
            self.running.clone(),
            self.source_properties(),
            self.config.pipeline.grab_timeout(),
        )
    }

    pub fn source_properties(&self) -> SourceProperties {
        SourceProperties {
            width: self.config.capture.width,
            height: self.config.capture.height,
            fps: f64::from(self.config.capture.fps),
            is_file: false,
            total_frames: 0,
        }
    }

    /// Start the configured number of inference workers over this context's
    /// queue and relay.
    pub fn spawn_inference<D, F>(&self, make_detector: F) -> Result<InferencePipeline>
    where
        D: Detector + 'static,
        F: FnMut(usize) -> Result<D>,
    {
        InferencePipeline::spawn(
            &self.frame_source(),
            self.relay.clone(),
            &self.config.pipeline,
            make_detector,
        )
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn relay(&self) -> &Arc<ResultRelay> {
        &self.relay
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.broadcaster.subscriber_count()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn relay_stats(&self) -> RelayStats {
        self.relay.stats()
    }

    /// Fires when the context starts shutting down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop consumers, drain the relay, then drop every subscriber.
    ///
    /// Inference threads observe the running flag within one grab timeout;
    /// join them through [`InferencePipeline::stop`] before calling this to
    /// have their last results delivered.
    pub async fn shutdown(&self) {
        info!("Shutting down application context");
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        self.relay.close().await;
        self.broadcaster.shutdown().await;
    }
}

/// Frame ingress for the capture collaborator. Cheap to clone; one per
/// capture thread.
#[derive(Clone)]
pub struct FrameIngress {
    queue: Arc<BoundedFrameQueue>,
    format: PixelFormat,
}

impl FrameIngress {
    /// Validate and enqueue one interleaved buffer without blocking.
    ///
    /// Fails with [`Error::InvalidFrame`] for a malformed buffer and
    /// [`Error::FrameDropped`] when the queue is full.
    pub fn push(
        &self,
        pixels: impl Into<Bytes>,
        width: u32,
        height: u32,
        capture_timestamp_ns: u64,
    ) -> Result<()> {
        let frame = Frame::new(pixels, width, height, self.format, capture_timestamp_ns)?;
        self.push_frame(frame)
    }

    pub fn push_frame(&self, frame: Frame) -> Result<()> {
        if self.queue.put(frame) {
            Ok(())
        } else {
            Err(Error::FrameDropped)
        }
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }
}
