//! FabStream: live telemetry dispatch and historical queries
//!
//! This library drains device telemetry from a message bus into a per-device
//! latest-value cache, serves that cache to pull and push readers, and answers
//! historical range queries against an InfluxDB 2.x store.
//!
//! # Example
//!
//! ```rust,no_run
//! use fabstream::{DispatcherConfig, LiveCacheDispatcher, MemoryBus};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // In-process bus standing in for Kafka
//!     let bus = MemoryBus::new();
//!
//!     let dispatcher = LiveCacheDispatcher::new(bus.source_factory(), DispatcherConfig::default());
//!     dispatcher.start().await?;
//!
//!     bus.publish_json("sensor_data", &json!({"device_name": "pump-1", "temp": 72.5}));
//!     tokio::time::sleep(Duration::from_millis(100)).await;
//!
//!     println!("latest: {:?}", dispatcher.get_latest_for("pump-1"));
//!
//!     dispatcher.stop().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod history;
pub mod http;
pub mod logging;
pub mod query_builder;
pub mod source;
pub mod store;
pub mod time_parser;

#[cfg(test)]
mod tests;

pub use config::{CliArgs, Settings};
pub use dispatcher::{
    ControlOutcome, DeviceCache, DispatcherConfig, DispatcherState, LiveCacheDispatcher, StreamStatus,
};
pub use error::{QueryError, SourceError, StoreError, TimeParseError};
pub use history::{FormatOptions, HistoricalQueryEngine, RangeChunk, TimedRecord};
pub use query_builder::{FieldFilter, QueryBuilder, QuerySpec, TimeRange};
pub use source::{MemoryBus, MessageSource, SourceFactory, StreamSourceAdapter};
pub use store::{FluxRecord, FluxTable, InfluxClient, TimeSeriesStore};
pub use time_parser::{parse_time_expr, TimeExpr};
