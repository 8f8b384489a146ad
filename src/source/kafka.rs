//! Kafka consumer built on `rdkafka`.
//!
//! Offsets are never committed, so every assignment falls back to the
//! `auto.offset.reset` policy (`latest` by default) and the consumer always
//! starts at the head of each partition.

use super::{MessageSource, Polled, SourceFactory};
use crate::config::BusSettings;
use crate::error::SourceError;
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use std::time::Duration;

pub struct KafkaSource {
    consumer: Option<StreamConsumer>,
}

impl KafkaSource {
    pub fn new(settings: &BusSettings) -> Result<Self, SourceError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &settings.bootstrap_servers)
            .set("group.id", &settings.group_id)
            .set("auto.offset.reset", &settings.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "true")
            .create()
            .map_err(|e| SourceError::Broker(e.to_string()))?;
        Ok(Self {
            consumer: Some(consumer),
        })
    }

    /// Factory building a new consumer from `settings` on every start.
    pub fn factory(settings: BusSettings) -> impl SourceFactory {
        move || KafkaSource::new(&settings).map(|s| Box::new(s) as Box<dyn MessageSource>)
    }

    fn consumer(&self) -> Result<&StreamConsumer, SourceError> {
        self.consumer.as_ref().ok_or(SourceError::Closed)
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), SourceError> {
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer()?
            .subscribe(&topics)
            .map_err(|e| SourceError::Broker(e.to_string()))
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Polled, SourceError> {
        let consumer = self.consumer()?;
        match tokio::time::timeout(timeout, consumer.recv()).await {
            Err(_) => Ok(Polled::Empty),
            Ok(Ok(message)) => Ok(match message.payload() {
                Some(payload) => Polled::Message(payload.to_vec()),
                None => Polled::Empty,
            }),
            Ok(Err(KafkaError::PartitionEOF(_))) => Ok(Polled::EndOfPartition),
            Ok(Err(e)) => Err(SourceError::Broker(e.to_string())),
        }
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        if let Some(consumer) = self.consumer.take() {
            consumer.unsubscribe();
        }
        Ok(())
    }
}
