//! Fan-out of relay results to connected subscribers
//!
//! Every subscriber send is isolated: a failed or slow subscriber is evicted
//! after the pass and never stops delivery to the others. A keepalive task
//! pings subscribers while at least one is connected.

pub mod message;
pub mod registry;

pub use message::{ServerMessage, SubscriberState};
pub use registry::{ChannelSink, Subscriber, SubscriberRegistry, SubscriberSink};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::detect::DetectionResult;
use crate::error::{Error, Result};
use crate::ServerConfig;
use registry::lock;

/// Outcome of one broadcast pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub evicted: usize,
}

#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

struct Inner {
    registry: SubscriberRegistry,
    keepalive: Mutex<Option<Keepalive>>,
    keepalive_interval: Duration,
    send_timeout: Duration,
    generation: AtomicU64,
}

struct Keepalive {
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Broadcaster {
    pub fn new(keepalive_interval: Duration, send_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: SubscriberRegistry::default(),
                keepalive: Mutex::new(None),
                keepalive_interval,
                send_timeout,
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(
            Duration::from_secs(config.keepalive_interval_secs),
            Duration::from_millis(config.send_timeout_ms),
        )
    }

    /// Register a subscriber and greet it with a `connection_status` message.
    ///
    /// The greeting is sent before any broadcast can reach the subscriber.
    /// If it cannot be delivered the subscriber is removed again.
    #[instrument(skip(self, sink))]
    pub async fn connect(&self, sink: Box<dyn SubscriberSink>) -> Result<Uuid> {
        let subscriber = Arc::new(Subscriber::new(Uuid::new_v4(), sink));
        let id = subscriber.id;

        let greeting = ServerMessage::connected(id)
            .to_text()
            .map_err(|e| Error::Transmit(e.to_string()))?;

        let sent = {
            // Hold the sink before publishing so broadcasts queue behind the greeting
            let mut sink = subscriber.sink.lock().await;
            self.inner.registry.insert(subscriber.clone());
            tokio::time::timeout(self.inner.send_timeout, sink.send_text(greeting)).await
        };

        match sent {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Greeting subscriber {} failed: {}", id, e);
                self.disconnect(id).await;
                return Err(e);
            }
            Err(_) => {
                warn!("Greeting subscriber {} timed out", id);
                self.disconnect(id).await;
                return Err(Error::Transmit("greeting timed out".into()));
            }
        }

        subscriber.set_state(SubscriberState::Connected);
        let count = self.inner.registry.len();
        metrics::gauge!("hermes_subscribers").set(count as f64);
        info!("Subscriber {} connected. Active subscribers: {}", id, count);

        self.ensure_keepalive();
        Ok(id)
    }

    /// Register an in-process subscriber backed by a bounded channel.
    pub async fn subscribe_channel(&self, capacity: usize) -> Result<(Uuid, mpsc::Receiver<String>)> {
        let (sink, rx) = ChannelSink::new(capacity);
        let id = self.connect(Box::new(sink)).await?;
        Ok((id, rx))
    }

    /// Remove a subscriber. Returns false if it was already gone.
    ///
    /// Removing the last subscriber cancels the keepalive task and waits for
    /// it to finish.
    pub async fn disconnect(&self, id: Uuid) -> bool {
        let Some(subscriber) = self.inner.registry.remove(&id) else {
            return false;
        };
        subscriber.set_state(SubscriberState::Disconnected);
        // A sink still held by a concurrent send is closed by its owner
        if let Ok(mut sink) = subscriber.sink.try_lock() {
            let _ = tokio::time::timeout(self.inner.send_timeout, sink.close()).await;
        }

        let remaining = self.inner.registry.len();
        metrics::gauge!("hermes_subscribers").set(remaining as f64);
        info!(
            "Subscriber {} disconnected. Active subscribers: {}",
            id, remaining
        );

        let stale = {
            let mut slot = lock(&self.inner.keepalive);
            if self.inner.registry.is_empty() {
                slot.take()
            } else {
                None
            }
        };
        if let Some(keepalive) = stale {
            stop_keepalive(keepalive).await;
        }

        true
    }

    /// Deliver `message` to every subscriber, evicting those that fail.
    pub async fn broadcast(&self, message: &ServerMessage) -> BroadcastReport {
        match message.to_text() {
            Ok(text) => self.broadcast_text(text).await,
            Err(e) => {
                error!("Failed to encode broadcast message: {}", e);
                BroadcastReport::default()
            }
        }
    }

    pub async fn broadcast_ai_result(&self, result: DetectionResult) -> BroadcastReport {
        self.broadcast(&ServerMessage::from(result)).await
    }

    async fn broadcast_text(&self, text: String) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();

        for subscriber in self.inner.registry.snapshot() {
            match subscriber
                .transmit(text.clone(), self.inner.send_timeout)
                .await
            {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!("Broadcast to subscriber {} failed: {}", subscriber.id, e);
                    failed.push(subscriber.id);
                }
            }
        }

        for id in failed {
            if self.disconnect(id).await {
                report.evicted += 1;
            }
        }

        metrics::counter!("hermes_broadcasts_total").increment(1);
        if report.evicted > 0 {
            metrics::counter!("hermes_subscribers_evicted_total").increment(report.evicted as u64);
        }
        report
    }

    /// Deliver to a single subscriber; a failure disconnects it.
    pub async fn send_to(&self, id: Uuid, message: &ServerMessage) -> Result<()> {
        let subscriber = self
            .inner
            .registry
            .get(&id)
            .ok_or_else(|| Error::Transmit(format!("unknown subscriber {id}")))?;
        let text = message
            .to_text()
            .map_err(|e| Error::Transmit(e.to_string()))?;

        if let Err(e) = subscriber.transmit(text, self.inner.send_timeout).await {
            warn!("Send to subscriber {} failed: {}", id, e);
            self.disconnect(id).await;
            return Err(e);
        }
        Ok(())
    }

    pub fn subscriber(&self, id: &Uuid) -> Option<Arc<Subscriber>> {
        self.inner.registry.get(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn keepalive_active(&self) -> bool {
        lock(&self.inner.keepalive)
            .as_ref()
            .is_some_and(|k| !k.handle.is_finished())
    }

    /// Generation of the running keepalive task; each fresh task gets a new one
    pub fn keepalive_generation(&self) -> Option<u64> {
        lock(&self.inner.keepalive).as_ref().map(|k| k.generation)
    }

    /// Stop keepalive and drop every subscriber
    pub async fn shutdown(&self) {
        let keepalive = lock(&self.inner.keepalive).take();
        if let Some(keepalive) = keepalive {
            stop_keepalive(keepalive).await;
        }

        let drained = self.inner.registry.drain();
        for subscriber in &drained {
            subscriber.set_state(SubscriberState::Disconnected);
            if let Ok(mut sink) = subscriber.sink.try_lock() {
                let _ = tokio::time::timeout(self.inner.send_timeout, sink.close()).await;
            }
        }
        metrics::gauge!("hermes_subscribers").set(0.0);
        info!("Broadcaster shut down, {} subscribers dropped", drained.len());
    }

    fn ensure_keepalive(&self) {
        let mut slot = lock(&self.inner.keepalive);
        if slot.as_ref().is_some_and(|k| !k.handle.is_finished()) {
            return;
        }
        if self.inner.registry.is_empty() {
            return;
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(keepalive_loop(
            Arc::downgrade(&self.inner),
            cancel.clone(),
            self.inner.keepalive_interval,
        ));
        debug!("Keepalive task {} started", generation);

        *slot = Some(Keepalive {
            generation,
            cancel,
            handle,
        });
    }
}

async fn stop_keepalive(keepalive: Keepalive) {
    keepalive.cancel.cancel();
    // The keepalive task itself may have evicted the last subscriber
    if tokio::task::try_id() != Some(keepalive.handle.id()) {
        let _ = keepalive.handle.await;
    }
    debug!("Keepalive task {} stopped", keepalive.generation);
}

async fn keepalive_loop(inner: Weak<Inner>, cancel: CancellationToken, interval: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                let broadcaster = Broadcaster { inner };
                if broadcaster.subscriber_count() == 0 {
                    continue;
                }
                let report = broadcaster.broadcast(&ServerMessage::ping()).await;
                debug!(delivered = report.delivered, evicted = report.evicted, "Keepalive ping");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::detect::Detection;

    struct FailingSink;

    #[async_trait::async_trait]
    impl SubscriberSink for FailingSink {
        async fn send_text(&mut self, _text: String) -> Result<()> {
            Err(Error::Transmit("broken pipe".into()))
        }
    }

    /// Accepts the greeting, then fails every later send
    struct FailAfterGreeting {
        sent: usize,
    }

    #[async_trait::async_trait]
    impl SubscriberSink for FailAfterGreeting {
        async fn send_text(&mut self, _text: String) -> Result<()> {
            self.sent += 1;
            if self.sent > 1 {
                Err(Error::Transmit("connection reset".into()))
            } else {
                Ok(())
            }
        }
    }

    fn broadcaster() -> Broadcaster {
        Broadcaster::new(Duration::from_secs(30), Duration::from_millis(200))
    }

    fn parse(text: &str) -> Value {
        serde_json::from_str(text).unwrap()
    }

    fn result(frame_id: u64) -> DetectionResult {
        DetectionResult {
            frame_id,
            timestamp_ms: 1,
            fps_estimate: 0.0,
            detections: vec![Detection {
                class_name: "go".into(),
                confidence: 0.9,
                x_center: 0.5,
                y_center: 0.5,
                width: 0.1,
                height: 0.1,
            }],
            error: None,
        }
    }

    #[tokio::test]
    async fn connect_greets_only_the_new_subscriber() {
        let hub = broadcaster();
        let (first, mut rx1) = hub.subscribe_channel(8).await.unwrap();
        let (_second, mut rx2) = hub.subscribe_channel(8).await.unwrap();

        let greeting = parse(&rx1.recv().await.unwrap());
        assert_eq!(greeting["type"], "connection_status");
        assert_eq!(greeting["client_id"], first.to_string());
        assert!(rx1.try_recv().is_err());

        assert_eq!(parse(&rx2.recv().await.unwrap())["type"], "connection_status");
        assert_eq!(hub.subscriber_count(), 2);
        assert_eq!(
            hub.subscriber(&first).unwrap().state(),
            SubscriberState::Connected
        );
    }

    #[tokio::test]
    async fn subscriber_sees_detection_after_greeting() {
        let hub = broadcaster();
        let (_id, mut rx) = hub.subscribe_channel(8).await.unwrap();

        let report = hub.broadcast_ai_result(result(7)).await;
        assert_eq!(report.delivered, 1);

        assert_eq!(parse(&rx.recv().await.unwrap())["type"], "connection_status");
        let detection = parse(&rx.recv().await.unwrap());
        assert_eq!(detection["type"], "ai_detection");
        assert_eq!(detection["data"]["frame_id"], 7);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failing_subscriber_is_isolated() {
        let hub = broadcaster();
        let (s1, mut rx1) = hub.subscribe_channel(8).await.unwrap();
        let s2 = hub
            .connect(Box::new(FailAfterGreeting { sent: 0 }))
            .await
            .unwrap();
        let (s3, mut rx3) = hub.subscribe_channel(8).await.unwrap();

        let report = hub.broadcast(&ServerMessage::echo("msg")).await;
        assert_eq!(
            report,
            BroadcastReport {
                delivered: 2,
                evicted: 1
            }
        );

        for rx in [&mut rx1, &mut rx3] {
            assert_eq!(parse(&rx.recv().await.unwrap())["type"], "connection_status");
            assert_eq!(parse(&rx.recv().await.unwrap())["message"], "msg");
            assert!(rx.try_recv().is_err());
        }

        assert!(hub.subscriber(&s1).is_some());
        assert!(hub.subscriber(&s2).is_none());
        assert!(hub.subscriber(&s3).is_some());
        assert_eq!(hub.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn failed_greeting_is_not_registered() {
        let hub = broadcaster();
        assert!(hub.connect(Box::new(FailingSink)).await.is_err());
        assert_eq!(hub.subscriber_count(), 0);
        assert!(!hub.keepalive_active());
    }

    #[tokio::test]
    async fn slow_subscriber_is_evicted() {
        let hub = Broadcaster::new(Duration::from_secs(30), Duration::from_millis(50));
        // Room for the greeting only, and nobody reads
        let (slow, _rx_slow) = hub.subscribe_channel(1).await.unwrap();
        let (fast, mut rx_fast) = hub.subscribe_channel(8).await.unwrap();

        let report = hub.broadcast(&ServerMessage::echo("x")).await;
        assert_eq!(report.evicted, 1);
        assert!(hub.subscriber(&slow).is_none());
        assert!(hub.subscriber(&fast).is_some());

        rx_fast.recv().await.unwrap();
        assert_eq!(parse(&rx_fast.recv().await.unwrap())["message"], "x");
    }

    #[tokio::test]
    async fn send_to_failure_disconnects() {
        let hub = broadcaster();
        let id = hub
            .connect(Box::new(FailAfterGreeting { sent: 0 }))
            .await
            .unwrap();

        assert!(hub.send_to(id, &ServerMessage::echo("hi")).await.is_err());
        assert_eq!(hub.subscriber_count(), 0);
        assert!(hub.send_to(id, &ServerMessage::echo("hi")).await.is_err());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let hub = broadcaster();
        let (id, _rx) = hub.subscribe_channel(8).await.unwrap();
        let subscriber = hub.subscriber(&id).unwrap();

        assert!(hub.disconnect(id).await);
        assert!(!hub.disconnect(id).await);
        assert_eq!(subscriber.state(), SubscriberState::Disconnected);
        assert!(subscriber.closed().is_cancelled());
    }

    #[tokio::test]
    async fn keepalive_follows_occupancy() {
        let hub = broadcaster();
        assert!(!hub.keepalive_active());

        let (a, _rx_a) = hub.subscribe_channel(8).await.unwrap();
        assert!(hub.keepalive_active());
        let first = hub.keepalive_generation().unwrap();

        let (b, _rx_b) = hub.subscribe_channel(8).await.unwrap();
        assert_eq!(hub.keepalive_generation(), Some(first));

        hub.disconnect(a).await;
        assert!(hub.keepalive_active());
        hub.disconnect(b).await;
        assert!(!hub.keepalive_active());
        assert_eq!(hub.keepalive_generation(), None);

        let (_c, _rx_c) = hub.subscribe_channel(8).await.unwrap();
        let second = hub.keepalive_generation().unwrap();
        assert!(hub.keepalive_active());
        assert_ne!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_pings_on_interval() {
        let hub = broadcaster();
        let (_id, mut rx) = hub.subscribe_channel(8).await.unwrap();
        assert_eq!(parse(&rx.recv().await.unwrap())["type"], "connection_status");

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(parse(&rx.recv().await.unwrap())["type"], "ping");
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_evicting_last_subscriber_stops_itself() {
        let hub = broadcaster();
        hub.connect(Box::new(FailAfterGreeting { sent: 0 }))
            .await
            .unwrap();
        assert!(hub.keepalive_active());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(hub.subscriber_count(), 0);
        assert!(!hub.keepalive_active());
    }

    #[tokio::test]
    async fn shutdown_drops_everyone() {
        let hub = broadcaster();
        let (id, _rx) = hub.subscribe_channel(8).await.unwrap();
        let subscriber = hub.subscriber(&id).unwrap();

        hub.shutdown().await;
        assert_eq!(hub.subscriber_count(), 0);
        assert!(!hub.keepalive_active());
        assert!(subscriber.closed().is_cancelled());
    }
}
