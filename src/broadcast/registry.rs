//! Subscriber handles and the id -> subscriber map

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::message::SubscriberState;
use crate::error::{Error, Result};

/// Transport seam for one subscriber connection
#[async_trait]
pub trait SubscriberSink: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Called once after the subscriber leaves the registry
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// In-process subscriber fed through a bounded channel.
///
/// A full channel stalls the send until the broadcaster's send timeout
/// evicts the subscriber.
pub struct ChannelSink {
    tx: mpsc::Sender<String>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl SubscriberSink for ChannelSink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.tx
            .send(text)
            .await
            .map_err(|_| Error::Transmit("receiver dropped".into()))
    }
}

pub struct Subscriber {
    pub id: Uuid,
    pub connected_at: SystemTime,
    pub(crate) sink: tokio::sync::Mutex<Box<dyn SubscriberSink>>,
    state: Mutex<SubscriberState>,
    closed: CancellationToken,
}

impl Subscriber {
    pub(crate) fn new(id: Uuid, sink: Box<dyn SubscriberSink>) -> Self {
        Self {
            id,
            connected_at: SystemTime::now(),
            sink: tokio::sync::Mutex::new(sink),
            state: Mutex::new(SubscriberState::Connecting),
            closed: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> SubscriberState {
        *lock(&self.state)
    }

    pub(crate) fn set_state(&self, next: SubscriberState) {
        let mut state = lock(&self.state);
        if *state != SubscriberState::Disconnected {
            *state = next;
        }
        if next == SubscriberState::Disconnected {
            self.closed.cancel();
        }
    }

    /// Fires once the subscriber has been removed from the registry
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Send under the subscriber's own lock so concurrent broadcasts keep
    /// per-subscriber order. Waiting for the lock counts against `timeout`.
    pub(crate) async fn transmit(&self, text: String, timeout: Duration) -> Result<()> {
        let send = async {
            let mut sink = self.sink.lock().await;
            sink.send_text(text).await
        };
        match tokio::time::timeout(timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(Error::Transmit(format!("send timed out after {timeout:?}"))),
        }
    }
}

/// Map of live subscribers, guarded by its own lock
#[derive(Default)]
pub struct SubscriberRegistry {
    subscribers: Mutex<HashMap<Uuid, Arc<Subscriber>>>,
}

impl SubscriberRegistry {
    pub fn insert(&self, subscriber: Arc<Subscriber>) {
        lock(&self.subscribers).insert(subscriber.id, subscriber);
    }

    pub fn remove(&self, id: &Uuid) -> Option<Arc<Subscriber>> {
        lock(&self.subscribers).remove(id)
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<Subscriber>> {
        lock(&self.subscribers).get(id).cloned()
    }

    /// Copy of the current subscribers; sends happen without the map lock held
    pub fn snapshot(&self) -> Vec<Arc<Subscriber>> {
        lock(&self.subscribers).values().cloned().collect()
    }

    pub fn drain(&self) -> Vec<Arc<Subscriber>> {
        lock(&self.subscribers).drain().map(|(_, s)| s).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.subscribers).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.subscribers).is_empty()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
