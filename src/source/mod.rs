//! Message bus consumption.
//!
//! [`MessageSource`] is the seam to a concrete bus; [`StreamSourceAdapter`]
//! wraps one source with the subscribe/poll/decode/close contract the
//! dispatcher relies on:
//! - "no message" and "end of partition" are not errors, they poll as `None`
//! - any other broker failure is returned as [`SourceError::Broker`]
//! - closing is idempotent and never fails
//!
//! Sources start from the latest offset on every assignment. The bus is a live
//! feed; history is served by the store.

pub mod memory;

#[cfg(feature = "kafka")]
pub mod kafka;

use crate::error::SourceError;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

pub use memory::{MemoryBus, MemorySource};

#[cfg(feature = "kafka")]
pub use kafka::KafkaSource;

/// Result of one bounded poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Polled {
    Message(Vec<u8>),
    Empty,
    EndOfPartition,
}

/// A consumer handle on a message bus.
#[async_trait]
pub trait MessageSource: Send {
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), SourceError>;

    /// Waits at most `timeout` for the next message.
    async fn poll(&mut self, timeout: Duration) -> Result<Polled, SourceError>;

    async fn close(&mut self) -> Result<(), SourceError>;
}

/// Creates a fresh source each time the dispatcher starts.
pub trait SourceFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn MessageSource>, SourceError>;
}

impl<F> SourceFactory for F
where
    F: Fn() -> Result<Box<dyn MessageSource>, SourceError> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn MessageSource>, SourceError> {
        self()
    }
}

/// Owns one source and applies the poll/decode/close contract.
pub struct StreamSourceAdapter {
    source: Box<dyn MessageSource>,
    poll_timeout: Duration,
    closed: bool,
}

impl StreamSourceAdapter {
    pub fn new(source: Box<dyn MessageSource>, poll_timeout: Duration) -> Self {
        Self {
            source,
            poll_timeout,
            closed: false,
        }
    }

    pub async fn subscribe(&mut self, topics: &[String]) -> Result<(), SourceError> {
        if self.closed {
            return Err(SourceError::Closed);
        }
        self.source.subscribe(topics).await?;
        tracing::info!(?topics, "subscribed");
        Ok(())
    }

    /// Raw payload of the next message, `None` on timeout or end of partition.
    pub async fn poll(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, SourceError> {
        if self.closed {
            return Err(SourceError::Closed);
        }
        match self.source.poll(timeout).await? {
            Polled::Message(payload) => Ok(Some(payload)),
            Polled::Empty => Ok(None),
            Polled::EndOfPartition => {
                tracing::debug!("end of partition reached");
                Ok(None)
            }
        }
    }

    /// Polls once with the configured timeout and decodes the payload as JSON.
    pub async fn receive(&mut self) -> Result<Option<Value>, SourceError> {
        let Some(payload) = self.poll(self.poll_timeout).await? else {
            return Ok(None);
        };
        let text = String::from_utf8(payload)?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    /// Releases the underlying consumer. Errors are logged, never returned.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        match self.source.close().await {
            Ok(()) => tracing::info!("message source closed"),
            Err(e) => tracing::warn!(error = %e, "error closing message source"),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
