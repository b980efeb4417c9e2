//! Device-free capture thread producing generated frames

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::app::FrameIngress;
use crate::error::{Error, Result};
use crate::utils::epoch_nanos;
use crate::CaptureConfig;

/// Totals for one capture run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub pushed: u64,
    pub dropped: u64,
}

/// Pushes a flat frame whose shade advances each tick, at the configured
/// rate, until stopped.
pub struct SyntheticCapture {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<CaptureStats>>,
}

impl SyntheticCapture {
    pub fn start(ingress: FrameIngress, config: &CaptureConfig) -> Result<Self> {
        if config.width == 0 || config.height == 0 || config.fps == 0 {
            return Err(Error::Initialization(format!(
                "synthetic capture needs non-zero geometry and rate, got {}x{} @ {}",
                config.width, config.height, config.fps
            )));
        }

        let running = Arc::new(AtomicBool::new(true));
        let (width, height) = (config.width, config.height);
        let period = Duration::from_secs_f64(1.0 / f64::from(config.fps));
        let len = width as usize * height as usize * ingress.format().channels() as usize;

        let flag = running.clone();
        let handle = thread::Builder::new()
            .name("capture".into())
            .spawn(move || run(ingress, flag, width, height, len, period))
            .map_err(|e| Error::Initialization(format!("failed to spawn capture thread: {e}")))?;

        info!(
            "Synthetic capture started: {}x{} @ {} fps",
            width, height, config.fps
        );

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) -> CaptureStats {
        self.shutdown()
    }

    fn shutdown(&mut self) -> CaptureStats {
        self.running.store(false, Ordering::SeqCst);
        let Some(handle) = self.handle.take() else {
            return CaptureStats::default();
        };
        let stats = handle.join().unwrap_or_else(|_| {
            warn!("Capture thread panicked");
            CaptureStats::default()
        });
        info!(
            "Synthetic capture stopped: {} pushed, {} dropped",
            stats.pushed, stats.dropped
        );
        stats
    }
}

impl Drop for SyntheticCapture {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown();
        }
    }
}

fn run(
    ingress: FrameIngress,
    running: Arc<AtomicBool>,
    width: u32,
    height: u32,
    len: usize,
    period: Duration,
) -> CaptureStats {
    let mut stats = CaptureStats::default();
    let mut shade: u8 = 0;
    let mut next = Instant::now();

    while running.load(Ordering::SeqCst) {
        let pixels = Bytes::from(vec![shade; len]);
        match ingress.push(pixels, width, height, epoch_nanos()) {
            Ok(()) => stats.pushed += 1,
            Err(Error::FrameDropped) => stats.dropped += 1,
            Err(e) => {
                warn!("Synthetic frame rejected: {}", e);
                break;
            }
        }
        shade = shade.wrapping_add(1);

        next += period;
        let now = Instant::now();
        if next > now {
            thread::sleep(next - now);
        } else {
            // Fell behind; do not burst to catch up
            debug!("Synthetic capture behind schedule by {:?}", now - next);
            next = now;
        }
    }

    stats
}
