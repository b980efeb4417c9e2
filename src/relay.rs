//! Hand-off of detection outcomes from inference threads to the async runtime
//!
//! Worker threads never touch runtime-owned state. They push a [`RelayJob`]
//! into a bounded channel whose receiving end is owned by one dispatcher task
//! on the runtime. The dispatcher normalizes and broadcasts each job in
//! order, and a panic in one job is contained to that job.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;
use flume::{Receiver, Sender, TrySendError};
use futures_util::FutureExt;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broadcast::Broadcaster;
use crate::capture::FrameDescriptor;
use crate::detect::{DetectionResult, RawPredictions};
use crate::error::{Error, Result};

/// One frame's detection outcome, produced on an inference thread
#[derive(Debug, Clone)]
pub struct RelayJob {
    pub descriptor: FrameDescriptor,
    pub fps_estimate: f64,
    pub outcome: std::result::Result<RawPredictions, String>,
}

impl RelayJob {
    pub fn detected(descriptor: FrameDescriptor, fps_estimate: f64, raw: RawPredictions) -> Self {
        Self {
            descriptor,
            fps_estimate,
            outcome: Ok(raw),
        }
    }

    pub fn failed(descriptor: FrameDescriptor, fps_estimate: f64, error: impl Into<String>) -> Self {
        Self {
            descriptor,
            fps_estimate,
            outcome: Err(error.into()),
        }
    }

    /// Normalize into the subscriber-facing result
    pub fn into_result(self, min_confidence: f64) -> DetectionResult {
        match &self.outcome {
            Ok(raw) => {
                let (result, skipped) = DetectionResult::from_predictions(
                    &self.descriptor,
                    self.fps_estimate,
                    raw,
                    min_confidence,
                );
                for item in &skipped {
                    debug!(
                        frame_id = self.descriptor.frame_id,
                        index = item.index,
                        "Skipped prediction: {}",
                        item.reason
                    );
                }
                if let Some(err) = &result.error {
                    warn!(frame_id = self.descriptor.frame_id, "Unusable predictions: {}", err);
                }
                result
            }
            Err(err) => DetectionResult::failed(&self.descriptor, self.fps_estimate, err.clone()),
        }
    }
}

#[derive(Default)]
struct Stats {
    scheduled: AtomicU64,
    dropped: AtomicU64,
    processed: AtomicU64,
    panicked: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub attached: bool,
    pub capacity: usize,
    pub pending: usize,
    pub scheduled: u64,
    pub dropped: u64,
    pub processed: u64,
    pub panicked: u64,
}

/// Cross-runtime relay from inference threads to the [`Broadcaster`].
///
/// `schedule` is callable from any thread and never blocks: with no target
/// attached, a closed target, or a full backlog the job is dropped and
/// counted.
pub struct ResultRelay {
    target: ArcSwapOption<Sender<RelayJob>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    capacity: usize,
    min_confidence: f64,
    stats: Arc<CachePadded<Stats>>,
}

impl ResultRelay {
    pub fn new(capacity: usize, min_confidence: f64) -> Self {
        Self {
            target: ArcSwapOption::empty(),
            dispatcher: Mutex::new(None),
            capacity: capacity.max(1),
            min_confidence,
            stats: Arc::new(CachePadded::new(Stats::default())),
        }
    }

    /// Bind the relay to the current runtime and start the dispatcher task.
    ///
    /// Must be called from inside the runtime, exactly once.
    pub fn attach(&self, broadcaster: Broadcaster) -> Result<()> {
        let handle = Handle::try_current().map_err(|_| {
            Error::Initialization("result relay must be attached inside the async runtime".into())
        })?;

        let mut dispatcher = lock(&self.dispatcher);
        if dispatcher.is_some() {
            return Err(Error::Initialization("result relay already attached".into()));
        }

        let (tx, rx) = flume::bounded(self.capacity);
        *dispatcher = Some(handle.spawn(dispatch(
            rx,
            broadcaster,
            self.min_confidence,
            self.stats.clone(),
        )));
        self.target.store(Some(Arc::new(tx)));

        info!("Result relay attached (capacity {})", self.capacity);
        Ok(())
    }

    pub fn is_attached(&self) -> bool {
        self.target.load().is_some()
    }

    /// Hand a job to the runtime. Safe to call from any thread.
    pub fn schedule(&self, job: RelayJob) -> Result<()> {
        let frame_id = job.descriptor.frame_id;
        let guard = self.target.load();
        let Some(tx) = guard.as_ref() else {
            return Err(self.reject(frame_id, "no runtime attached"));
        };

        match tx.try_send(job) {
            Ok(()) => {
                self.stats.scheduled.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("hermes_results_scheduled_total").increment(1);
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(self.reject(frame_id, "relay backlog full")),
            Err(TrySendError::Disconnected(_)) => Err(self.reject(frame_id, "runtime shut down")),
        }
    }

    fn reject(&self, frame_id: u64, reason: &'static str) -> Error {
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("hermes_results_dropped_total").increment(1);
        warn!(frame_id, "Dropping detection result: {}", reason);
        Error::SchedulingUnavailable(reason)
    }

    /// Detach from the runtime and wait for already scheduled jobs to finish.
    pub async fn close(&self) {
        self.target.store(None);
        let dispatcher = lock(&self.dispatcher).take();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                error!("Relay dispatcher ended abnormally: {}", e);
            }
        }
    }

    pub fn stats(&self) -> RelayStats {
        let guard = self.target.load();
        RelayStats {
            attached: guard.is_some(),
            capacity: self.capacity,
            pending: guard.as_ref().map_or(0, |tx| tx.len()),
            scheduled: self.stats.scheduled.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            processed: self.stats.processed.load(Ordering::Relaxed),
            panicked: self.stats.panicked.load(Ordering::Relaxed),
        }
    }
}

/// Runtime-side owner of the receiving end. Exits once every sender is gone
/// and the backlog is empty.
///
/// Jobs run one at a time, so a stalled subscriber holds back every later
/// result by at most one `send_timeout_ms` before it is evicted.
async fn dispatch(
    rx: Receiver<RelayJob>,
    broadcaster: Broadcaster,
    min_confidence: f64,
    stats: Arc<CachePadded<Stats>>,
) {
    debug!("Relay dispatcher running");
    while let Ok(job) = rx.recv_async().await {
        let frame_id = job.descriptor.frame_id;
        let unit = async {
            let result = job.into_result(min_confidence);
            broadcaster.broadcast_ai_result(result).await
        };

        match AssertUnwindSafe(unit).catch_unwind().await {
            Ok(report) => {
                debug!(
                    frame_id,
                    delivered = report.delivered,
                    evicted = report.evicted,
                    "Relayed detection result"
                );
                stats.processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                error!(frame_id, "Relaying detection result panicked");
                stats.panicked.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    debug!("Relay dispatcher stopped");
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    use super::*;
    use crate::broadcast::SubscriberSink;
    use crate::detect::RawPrediction;

    fn descriptor(frame_id: u64) -> FrameDescriptor {
        FrameDescriptor {
            frame_id,
            capture_timestamp_ns: 1_700_000_000_000_000_000,
            width: 640,
            height: 480,
        }
    }

    fn job(frame_id: u64) -> RelayJob {
        let raw = RawPredictions::new(vec![RawPrediction::Record(json!({
            "class": "go", "confidence": 0.9, "x": 320, "y": 240, "width": 64, "height": 48
        }))]);
        RelayJob::detected(descriptor(frame_id), 10.0, raw)
    }

    fn broadcaster() -> Broadcaster {
        Broadcaster::new(Duration::from_secs(30), Duration::from_secs(1))
    }

    async fn next_json(rx: &mut mpsc::Receiver<String>) -> Value {
        let text = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[test]
    fn schedule_without_runtime_drops() {
        let relay = ResultRelay::new(4, 0.0);
        let err = relay.schedule(job(1)).unwrap_err();
        assert!(matches!(err, Error::SchedulingUnavailable(_)));

        let stats = relay.stats();
        assert!(!stats.attached);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.scheduled, 0);
    }

    #[test]
    fn attach_outside_runtime_fails() {
        let relay = ResultRelay::new(4, 0.0);
        let err = relay.attach(broadcaster()).unwrap_err();
        assert!(matches!(err, Error::Initialization(_)));
        assert!(!relay.is_attached());
    }

    #[tokio::test]
    async fn attach_twice_fails() {
        let relay = ResultRelay::new(4, 0.0);
        relay.attach(broadcaster()).unwrap();
        assert!(relay.attach(broadcaster()).is_err());
        relay.close().await;
    }

    #[tokio::test]
    async fn job_from_foreign_thread_reaches_subscriber() {
        let hub = broadcaster();
        let (_id, mut rx) = hub.subscribe_channel(16).await.unwrap();
        let relay = Arc::new(ResultRelay::new(4, 0.0));
        relay.attach(hub.clone()).unwrap();

        let worker = {
            let relay = relay.clone();
            std::thread::spawn(move || relay.schedule(job(7)))
        };
        worker.join().unwrap().unwrap();

        assert_eq!(next_json(&mut rx).await["type"], "connection_status");
        let msg = next_json(&mut rx).await;
        assert_eq!(msg["type"], "ai_detection");
        assert_eq!(msg["data"]["frame_id"], 7);
        assert_eq!(msg["data"]["timestamp"], 1_700_000_000_000u64);
        assert_eq!(msg["data"]["detections"][0]["x_center"], 0.5);

        relay.close().await;
        assert_eq!(relay.stats().processed, 1);
    }

    #[tokio::test]
    async fn detector_failure_is_still_broadcast() {
        let hub = broadcaster();
        let (_id, mut rx) = hub.subscribe_channel(16).await.unwrap();
        let relay = ResultRelay::new(4, 0.0);
        relay.attach(hub).unwrap();

        relay
            .schedule(RelayJob::failed(descriptor(3), 0.0, "model unavailable"))
            .unwrap();
        relay.close().await;

        next_json(&mut rx).await;
        let msg = next_json(&mut rx).await;
        assert_eq!(msg["data"]["frame_id"], 3);
        assert_eq!(msg["data"]["error"], "model unavailable");
        assert!(msg["data"]["detections"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn close_drains_backlog_in_order() {
        let hub = broadcaster();
        let (_id, mut rx) = hub.subscribe_channel(16).await.unwrap();
        let relay = ResultRelay::new(8, 0.0);
        relay.attach(hub).unwrap();

        for frame_id in 1..=3 {
            relay.schedule(job(frame_id)).unwrap();
        }
        relay.close().await;
        assert!(relay.schedule(job(4)).is_err());

        next_json(&mut rx).await;
        for frame_id in 1..=3 {
            assert_eq!(next_json(&mut rx).await["data"]["frame_id"], frame_id);
        }
        assert!(rx.try_recv().is_err());

        let stats = relay.stats();
        assert_eq!((stats.scheduled, stats.processed, stats.dropped), (3, 3, 1));
    }

    #[tokio::test]
    async fn full_backlog_drops_without_blocking() {
        let relay = ResultRelay::new(1, 0.0);
        relay.attach(broadcaster()).unwrap();

        // The dispatcher cannot run until this task yields
        relay.schedule(job(1)).unwrap();
        assert!(relay.schedule(job(2)).is_err());
        assert_eq!(relay.stats().dropped, 1);
        relay.close().await;
    }

    struct PanicOnce {
        armed: AtomicBool,
    }

    #[async_trait]
    impl SubscriberSink for PanicOnce {
        async fn send_text(&mut self, text: String) -> crate::Result<()> {
            if text.contains("ai_detection") && self.armed.swap(false, Ordering::SeqCst) {
                panic!("sink exploded");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn panic_in_one_job_spares_the_next() {
        let hub = broadcaster();
        hub.connect(Box::new(PanicOnce {
            armed: AtomicBool::new(true),
        }))
        .await
        .unwrap();
        let (_id, mut rx) = hub.subscribe_channel(16).await.unwrap();

        let relay = ResultRelay::new(8, 0.0);
        relay.attach(hub).unwrap();
        relay.schedule(job(1)).unwrap();
        relay.schedule(job(2)).unwrap();
        relay.close().await;

        let stats = relay.stats();
        assert_eq!(stats.panicked, 1);
        assert_eq!(stats.processed, 1);

        // Frame 1 may or may not have reached this subscriber first
        next_json(&mut rx).await;
        let mut last = next_json(&mut rx).await;
        if last["data"]["frame_id"] == 1 {
            last = next_json(&mut rx).await;
        }
        assert_eq!(last["data"]["frame_id"], 2);
    }
}
