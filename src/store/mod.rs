//! Time-series store access.
//!
//! The engine talks to the store through [`TimeSeriesStore`]; results come
//! back as Flux tables, one record per row of the store's annotated CSV.

pub mod annotated_csv;
pub mod influx;

use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;

pub use influx::InfluxClient;

/// One row of a Flux result table.
#[derive(Debug, Clone, PartialEq)]
pub struct FluxRecord {
    pub table: i64,
    pub time: Option<DateTime<Utc>>,
    pub measurement: Option<String>,
    pub field: Option<String>,
    pub value: Value,
    /// Remaining non-system columns, usually tags.
    pub tags: BTreeMap<String, String>,
}

impl FluxRecord {
    pub fn new(table: i64, time: DateTime<Utc>, field: &str, value: Value) -> Self {
        Self {
            table,
            time: Some(time),
            measurement: None,
            field: Some(field.to_string()),
            value,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_measurement(mut self, measurement: &str) -> Self {
        self.measurement = Some(measurement.to_string());
        self
    }
}

/// Records sharing one table id, in store order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FluxTable {
    pub index: i64,
    pub records: Vec<FluxRecord>,
}

impl FluxTable {
    pub fn new(index: i64, records: Vec<FluxRecord>) -> Self {
        Self { index, records }
    }
}

/// A queryable time-series store.
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// Runs a Flux query and returns its tables.
    async fn query(&self, flux: &str) -> Result<Vec<FluxTable>, StoreError>;
}
