mod dispatcher;

use crate::dispatcher::{DispatcherConfig, LiveCacheDispatcher};
use crate::error::StoreError;
use crate::source::MemoryBus;
use crate::store::{FluxRecord, FluxTable, TimeSeriesStore};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use mockall::mock;
use std::time::Duration;

mock! {
    pub Store {}
    #[async_trait]
    impl TimeSeriesStore for Store {
        async fn query(&self, flux: &str) -> Result<Vec<FluxTable>, StoreError>;
    }
}

/// 2024-03-04T00:00:00Z
pub const BASE_EPOCH: i64 = 1_709_510_400;

pub fn at(offset_secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(BASE_EPOCH + offset_secs, 0).unwrap()
}

/// One table holding a single `temp` reading at `offset_secs`.
pub fn temp_table(offset_secs: i64, value: f64) -> Vec<FluxTable> {
    vec![FluxTable::new(
        0,
        vec![FluxRecord::new(0, at(offset_secs), "temp", serde_json::json!(value)).with_measurement("pump-1")],
    )]
}

pub fn fast_config() -> DispatcherConfig {
    DispatcherConfig {
        poll_timeout: Duration::from_millis(20),
        stop_grace: Duration::from_millis(500),
        default_sample_interval: Duration::from_millis(20),
        ..DispatcherConfig::default()
    }
}

pub fn memory_dispatcher(bus: &MemoryBus) -> LiveCacheDispatcher {
    LiveCacheDispatcher::new(bus.source_factory(), fast_config())
}

/// Polls `condition` until it holds, failing the test after two seconds.
pub async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
