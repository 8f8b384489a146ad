//! In-process message bus.
//!
//! Publishing fans a payload out to every source subscribed to its topic.
//! Sources only see messages published after they subscribed, which matches the
//! latest-offset behaviour of the Kafka source.

use super::{MessageSource, Polled, SourceFactory};
use crate::error::SourceError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug)]
enum BusItem {
    Record(Vec<u8>),
    EndOfPartition,
    Fault(String),
}

struct Subscription {
    id: u64,
    topics: Vec<String>,
    tx: mpsc::UnboundedSender<BusItem>,
}

#[derive(Default)]
struct BusInner {
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn subscriptions(&self) -> std::sync::MutexGuard<'_, Vec<Subscription>> {
        // a poisoned lock only means a publisher panicked mid-push
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send_where(&self, mut wanted: impl FnMut(&Subscription) -> bool, item: impl Fn() -> BusItem) -> usize {
        let mut subs = self.subscriptions();
        subs.retain(|s| !s.tx.is_closed());
        subs.iter()
            .filter(|s| wanted(s))
            .filter(|s| s.tx.send(item()).is_ok())
            .count()
    }
}

/// Handle to an in-process bus. Cloning shares the same bus.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new, unsubscribed consumer on this bus.
    pub fn source(&self) -> MemorySource {
        MemorySource {
            bus: Arc::clone(&self.inner),
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            rx: None,
        }
    }

    pub fn source_factory(&self) -> impl SourceFactory {
        let bus = self.clone();
        move || Ok::<_, SourceError>(Box::new(bus.source()) as Box<dyn MessageSource>)
    }

    /// Publishes raw bytes; returns how many subscribers received them.
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> usize {
        let payload = payload.into();
        self.inner.send_where(
            |s| s.topics.iter().any(|t| t == topic),
            || BusItem::Record(payload.clone()),
        )
    }

    pub fn publish_json(&self, topic: &str, payload: &Value) -> usize {
        self.publish(topic, payload.to_string())
    }

    /// Signals end of partition to subscribers of `topic`.
    pub fn end_of_partition(&self, topic: &str) -> usize {
        self.inner
            .send_where(|s| s.topics.iter().any(|t| t == topic), || BusItem::EndOfPartition)
    }

    /// Delivers a broker failure to every subscriber.
    pub fn fail(&self, reason: &str) -> usize {
        self.inner
            .send_where(|_| true, || BusItem::Fault(reason.to_string()))
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subs = self.inner.subscriptions();
        subs.retain(|s| !s.tx.is_closed());
        subs.len()
    }
}

/// Consumer side of a [`MemoryBus`].
pub struct MemorySource {
    bus: Arc<BusInner>,
    id: u64,
    rx: Option<mpsc::UnboundedReceiver<BusItem>>,
}

impl MemorySource {
    fn detach(&mut self) {
        self.bus.subscriptions().retain(|s| s.id != self.id);
        self.rx = None;
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), SourceError> {
        self.detach();
        let (tx, rx) = mpsc::unbounded_channel();
        self.bus.subscriptions().push(Subscription {
            id: self.id,
            topics: topics.to_vec(),
            tx,
        });
        self.rx = Some(rx);
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Polled, SourceError> {
        let Some(rx) = self.rx.as_mut() else {
            tokio::time::sleep(timeout).await;
            return Ok(Polled::Empty);
        };
        match tokio::time::timeout(timeout, rx.recv()).await {
            Err(_) => Ok(Polled::Empty),
            Ok(None) => Err(SourceError::Closed),
            Ok(Some(BusItem::Record(payload))) => Ok(Polled::Message(payload)),
            Ok(Some(BusItem::EndOfPartition)) => Ok(Polled::EndOfPartition),
            Ok(Some(BusItem::Fault(reason))) => Err(SourceError::Broker(reason)),
        }
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        self.detach();
        Ok(())
    }
}

impl Drop for MemorySource {
    fn drop(&mut self) {
        self.detach();
    }
}
