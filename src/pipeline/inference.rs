//! Inference worker threads: the pull-based consumer of the frame source

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::detect::Detector;
use crate::error::{Error, Result};
use crate::pipeline::{FpsCounter, FrameSourceAdapter, VideoSource};
use crate::relay::{RelayJob, ResultRelay};
use crate::PipelineConfig;

/// Per-worker totals, returned when the pipeline is stopped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub worker: usize,
    pub processed: u64,
    pub failed: u64,
}

/// A running set of inference workers.
///
/// Each worker drives its own forked [`FrameSourceAdapter`] and detector
/// instance and hands every outcome to the [`ResultRelay`].
pub struct InferencePipeline {
    source: FrameSourceAdapter,
    workers: Vec<JoinHandle<WorkerStats>>,
}

struct WorkerSettings {
    min_interval: Option<Duration>,
    /// Longest single throttle sleep, so a stop is noticed promptly
    poll: Duration,
    core: Option<core_affinity::CoreId>,
}

impl InferencePipeline {
    /// Start `config.inference_workers` threads. `make_detector` is called
    /// once per worker, on the calling thread.
    pub fn spawn<D, F>(
        source: &FrameSourceAdapter,
        relay: Arc<ResultRelay>,
        config: &PipelineConfig,
        mut make_detector: F,
    ) -> Result<Self>
    where
        D: Detector + 'static,
        F: FnMut(usize) -> Result<D>,
    {
        if config.inference_workers == 0 {
            return Err(Error::Initialization(
                "at least one inference worker is required".into(),
            ));
        }

        let min_interval = config
            .max_fps
            .filter(|fps| *fps > 0.0)
            .map(|fps| Duration::from_secs_f64(1.0 / fps));

        let cores = if config.pin_workers {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut parent = source.fork();
        parent.start();

        let mut workers = Vec::with_capacity(config.inference_workers);
        for n in 0..config.inference_workers {
            let detector = match make_detector(n) {
                Ok(detector) => detector,
                Err(e) => {
                    stop_workers(&parent, workers);
                    return Err(Error::Initialization(format!(
                        "detector for worker {n}: {e}"
                    )));
                }
            };

            let settings = WorkerSettings {
                min_interval,
                poll: config.grab_timeout().max(Duration::from_millis(1)),
                core: (!cores.is_empty()).then(|| cores[n % cores.len()]),
            };
            let worker_source = parent.fork();
            let relay = relay.clone();

            let spawned = thread::Builder::new()
                .name(format!("inference-{n}"))
                .spawn(move || run_worker(n, worker_source, detector, relay, settings));

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    stop_workers(&parent, workers);
                    return Err(Error::Initialization(format!(
                        "failed to spawn inference worker {n}: {e}"
                    )));
                }
            }
        }

        info!(
            "Inference pipeline started: {} workers, max_fps={:?}",
            workers.len(),
            config.max_fps
        );

        Ok(Self {
            source: parent,
            workers,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn is_running(&self) -> bool {
        self.source.is_opened()
    }

    /// Close the source and join every worker. Workers notice within one
    /// grab timeout.
    pub fn stop(self) -> Vec<WorkerStats> {
        stop_workers(&self.source, self.workers)
    }
}

fn stop_workers(source: &FrameSourceAdapter, workers: Vec<JoinHandle<WorkerStats>>) -> Vec<WorkerStats> {
    source.stop();

    let mut stats = Vec::with_capacity(workers.len());
    for handle in workers {
        match handle.join() {
            Ok(worker) => stats.push(worker),
            Err(_) => error!("Inference worker panicked"),
        }
    }
    info!("Inference pipeline stopped");
    stats
}

fn run_worker<D: Detector>(
    worker: usize,
    mut source: FrameSourceAdapter,
    mut detector: D,
    relay: Arc<ResultRelay>,
    settings: WorkerSettings,
) -> WorkerStats {
    if let Some(core) = settings.core {
        if core_affinity::set_for_current(core) {
            debug!(worker, core = core.id, "Pinned inference worker");
        } else {
            warn!(worker, core = core.id, "Failed to pin inference worker");
        }
    }

    info!(worker, detector = detector.name(), "Inference worker started");

    let mut stats = WorkerStats {
        worker,
        ..Default::default()
    };
    let mut fps = FpsCounter::default();
    let mut last_inference: Option<Instant> = None;

    while source.is_opened() {
        if let (Some(interval), Some(last)) = (settings.min_interval, last_inference) {
            let elapsed = last.elapsed();
            if elapsed < interval {
                thread::sleep((interval - elapsed).min(settings.poll));
                continue;
            }
        }

        if !source.grab() {
            continue;
        }
        let Some(frame) = source.retrieve() else {
            continue;
        };

        last_inference = Some(Instant::now());
        fps.tick();
        let descriptor = frame.descriptor();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| detector.infer(&frame)));
        let job = match outcome {
            Ok(Ok(raw)) => {
                stats.processed += 1;
                RelayJob::detected(descriptor, fps.fps(), raw)
            }
            Ok(Err(e)) => {
                stats.failed += 1;
                warn!(worker, frame_id = descriptor.frame_id, "Detection failed: {}", e);
                RelayJob::failed(descriptor, fps.fps(), e.to_string())
            }
            Err(_) => {
                stats.failed += 1;
                error!(worker, frame_id = descriptor.frame_id, "Detector panicked");
                RelayJob::failed(descriptor, fps.fps(), "detector panicked")
            }
        };

        // Rejections are logged and counted by the relay
        let _ = relay.schedule(job);
    }

    source.release();
    info!(
        worker,
        processed = stats.processed,
        failed = stats.failed,
        "Inference worker stopped"
    );
    stats
}
