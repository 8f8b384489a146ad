//! Live cache dispatcher.
//!
//! One background worker drains the message bus into a per-device cache of the
//! latest payload. Control operations start, stop, pause and resume the worker;
//! readers query the cache or follow a device as a sampled stream.
//!
//! Each cached record carries a version drawn from a global sequence. Live
//! streams keep their own cursor, so several followers of one device each see
//! every new record once and never block each other.

use crate::config::Settings;
use crate::error::SourceError;
use crate::source::{SourceFactory, StreamSourceAdapter};
use async_stream::stream;
use dashmap::DashMap;
use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Lifecycle of the drain worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatcherState {
    Stopped,
    Running,
    Paused,
}

/// Result of a control operation. Repeated or out-of-order calls are reported,
/// never treated as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    Started,
    AlreadyRunning,
    Stopped,
    AlreadyStopped,
    Paused,
    NoStreamToPause,
    Resumed,
    NoStreamToResume,
}

impl ControlOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            ControlOutcome::Started => "Stream started",
            ControlOutcome::AlreadyRunning => "Stream is already running",
            ControlOutcome::Stopped => "Stream stopped",
            ControlOutcome::AlreadyStopped => "Stream is already stopped",
            ControlOutcome::Paused => "Stream paused",
            ControlOutcome::NoStreamToPause => "No stream to pause",
            ControlOutcome::Resumed => "Stream resumed",
            ControlOutcome::NoStreamToResume => "No stream to resume",
        }
    }
}

/// Health of the drain worker as reported to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StreamStatus {
    Running,
    Paused,
    Stopped,
    /// The worker exited on a broker error; `state()` still reads running
    /// until someone calls stop.
    Faulted { reason: String },
}

#[derive(Debug, Clone)]
struct CachedRecord {
    payload: Value,
    version: u64,
}

/// Latest payload per device.
#[derive(Debug, Default)]
pub struct DeviceCache {
    records: DashMap<String, CachedRecord>,
    sequence: AtomicU64,
}

impl DeviceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the record for `device`; returns the new version.
    pub fn store(&self, device: String, payload: Value) -> u64 {
        let version = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.records.insert(device, CachedRecord { payload, version });
        version
    }

    pub fn get(&self, device: &str) -> Option<Value> {
        self.records.get(device).map(|r| r.payload.clone())
    }

    /// The record for `device` if it is newer than `cursor`, with its version.
    pub fn get_if_newer(&self, device: &str, cursor: u64) -> Option<(Value, u64)> {
        self.records
            .get(device)
            .filter(|r| r.version > cursor)
            .map(|r| (r.payload.clone(), r.version))
    }

    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().payload.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Counters kept by the drain worker.
#[derive(Debug, Default)]
pub struct DrainStats {
    received: AtomicU64,
    applied: AtomicU64,
    discarded_while_paused: AtomicU64,
    skipped_unidentified: AtomicU64,
    decode_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DrainStatsSnapshot {
    pub received: u64,
    pub applied: u64,
    pub discarded_while_paused: u64,
    pub skipped_unidentified: u64,
    pub decode_failures: u64,
}

impl DrainStats {
    pub fn snapshot(&self) -> DrainStatsSnapshot {
        DrainStatsSnapshot {
            received: self.received.load(Ordering::SeqCst),
            applied: self.applied.load(Ordering::SeqCst),
            discarded_while_paused: self.discarded_while_paused.load(Ordering::SeqCst),
            skipped_unidentified: self.skipped_unidentified.load(Ordering::SeqCst),
            decode_failures: self.decode_failures.load(Ordering::SeqCst),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub topics: Vec<String>,
    pub poll_timeout: Duration,
    /// How long `stop` waits for the worker before aborting it.
    pub stop_grace: Duration,
    /// Payload field holding the device identifier.
    pub device_field: String,
    /// Used by live streams requested with a zero interval.
    pub default_sample_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            topics: vec!["sensor_data".to_string(), "ml_result".to_string()],
            poll_timeout: Duration::from_secs(1),
            stop_grace: Duration::from_secs(2),
            device_field: "device_name".to_string(),
            default_sample_interval: Duration::from_secs(1),
        }
    }
}

impl From<&Settings> for DispatcherConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            topics: settings.bus.topics.clone(),
            poll_timeout: settings.bus.poll_timeout(),
            stop_grace: settings.stream.stop_grace(),
            device_field: settings.bus.device_field.clone(),
            default_sample_interval: settings.stream.sample_interval(),
        }
    }
}

struct Worker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
    /// Locked by the drain loop for its whole run; free again once the task
    /// has finished or been aborted.
    adapter: Arc<tokio::sync::Mutex<StreamSourceAdapter>>,
}

/// Everything the drain loop needs, shared with the dispatcher.
#[derive(Clone)]
struct DrainContext {
    cache: Arc<DeviceCache>,
    stats: Arc<DrainStats>,
    fault: Arc<Mutex<Option<String>>>,
    state: watch::Receiver<DispatcherState>,
    device_field: String,
}

pub struct LiveCacheDispatcher {
    factory: Box<dyn SourceFactory>,
    config: DispatcherConfig,
    cache: Arc<DeviceCache>,
    stats: Arc<DrainStats>,
    fault: Arc<Mutex<Option<String>>>,
    state: watch::Sender<DispatcherState>,
    worker: tokio::sync::Mutex<Option<Worker>>,
}

impl LiveCacheDispatcher {
    pub fn new(factory: impl SourceFactory + 'static, config: DispatcherConfig) -> Self {
        let (state, _) = watch::channel(DispatcherState::Stopped);
        Self {
            factory: Box::new(factory),
            config,
            cache: Arc::new(DeviceCache::new()),
            stats: Arc::new(DrainStats::default()),
            fault: Arc::new(Mutex::new(None)),
            state,
            worker: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Subscribes and launches the drain worker.
    ///
    /// Returns `AlreadyRunning` without side effects if a worker exists, even a
    /// paused or faulted one.
    pub async fn start(&self) -> Result<ControlOutcome, SourceError> {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return Ok(ControlOutcome::AlreadyRunning);
        }

        let source = self.factory.create()?;
        let mut adapter = StreamSourceAdapter::new(source, self.config.poll_timeout);
        if let Err(e) = adapter.subscribe(&self.config.topics).await {
            adapter.close().await;
            return Err(e);
        }

        self.set_fault(None);
        self.state.send_replace(DispatcherState::Running);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let ctx = DrainContext {
            cache: Arc::clone(&self.cache),
            stats: Arc::clone(&self.stats),
            fault: Arc::clone(&self.fault),
            state: self.state.subscribe(),
            device_field: self.config.device_field.clone(),
        };
        let adapter = Arc::new(tokio::sync::Mutex::new(adapter));
        let handle = tokio::spawn(drain(Arc::clone(&adapter), ctx, shutdown_rx));
        *worker = Some(Worker {
            shutdown,
            handle,
            adapter,
        });

        tracing::info!(topics = ?self.config.topics, "stream started");
        Ok(ControlOutcome::Started)
    }

    /// Signals the worker to exit, waits up to the grace period, then releases
    /// the source. A worker that overruns the grace period is aborted and
    /// given one more grace period to let go of the source. Always leaves the
    /// dispatcher stopped.
    pub async fn stop(&self) -> ControlOutcome {
        let mut worker = self.worker.lock().await;
        let Some(Worker {
            shutdown,
            mut handle,
            adapter,
        }) = worker.take()
        else {
            return ControlOutcome::AlreadyStopped;
        };

        let grace = self.config.stop_grace;
        let _ = shutdown.send(true);
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "drain worker panicked"),
            Err(_) => {
                tracing::warn!(?grace, "drain worker did not exit in time; aborting");
                handle.abort();
                if tokio::time::timeout(grace, handle).await.is_err() {
                    tracing::warn!("drain worker still running after abort");
                }
            }
        }

        match adapter.try_lock() {
            Ok(mut adapter) => adapter.close().await,
            Err(_) => tracing::error!("message source still held by drain worker; left open"),
        }

        self.state.send_replace(DispatcherState::Stopped);
        tracing::info!("stream stopped");
        ControlOutcome::Stopped
    }

    /// Only a running stream can be paused.
    pub fn pause(&self) -> ControlOutcome {
        let mut outcome = ControlOutcome::NoStreamToPause;
        self.state.send_if_modified(|state| match *state {
            DispatcherState::Running => {
                *state = DispatcherState::Paused;
                outcome = ControlOutcome::Paused;
                true
            }
            DispatcherState::Paused | DispatcherState::Stopped => false,
        });
        if outcome == ControlOutcome::Paused {
            tracing::info!("stream paused");
        }
        outcome
    }

    /// Only a paused stream can be resumed.
    pub fn resume(&self) -> ControlOutcome {
        let mut outcome = ControlOutcome::NoStreamToResume;
        self.state.send_if_modified(|state| match *state {
            DispatcherState::Paused => {
                *state = DispatcherState::Running;
                outcome = ControlOutcome::Resumed;
                true
            }
            DispatcherState::Running | DispatcherState::Stopped => false,
        });
        if outcome == ControlOutcome::Resumed {
            tracing::info!("stream resumed");
        }
        outcome
    }

    pub fn state(&self) -> DispatcherState {
        *self.state.borrow()
    }

    pub fn status(&self) -> StreamStatus {
        let state = self.state();
        if state == DispatcherState::Stopped {
            return StreamStatus::Stopped;
        }
        if let Some(reason) = self.fault() {
            return StreamStatus::Faulted { reason };
        }
        match state {
            DispatcherState::Stopped => StreamStatus::Stopped,
            DispatcherState::Paused => StreamStatus::Paused,
            DispatcherState::Running => {
                let exited = self
                    .worker
                    .try_lock()
                    .map(|w| w.as_ref().map_or(false, |w| w.handle.is_finished()))
                    .unwrap_or(false);
                if exited {
                    StreamStatus::Faulted {
                        reason: "drain worker exited".to_string(),
                    }
                } else {
                    StreamStatus::Running
                }
            }
        }
    }

    pub fn stats(&self) -> DrainStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn cache(&self) -> &DeviceCache {
        &self.cache
    }

    /// Latest cached payload for `device`.
    pub fn get_latest_for(&self, device: &str) -> Option<Value> {
        self.cache.get(device)
    }

    /// Copy of the whole cache, independent of later writes.
    pub fn get_latest_for_all(&self) -> BTreeMap<String, Value> {
        self.cache.snapshot()
    }

    /// Follows `device`, yielding each new cached record at most once per
    /// `interval`.
    ///
    /// A new follower starts with an empty cursor, so its first tick yields
    /// the record already cached for `device`, if any; after that only
    /// records written since the previous yield come through.
    ///
    /// The stream ends once the dispatcher leaves the running state. A zero
    /// interval falls back to the configured sample interval.
    pub fn live_stream_for(&self, device: &str, interval: Duration) -> BoxStream<'static, Value> {
        let interval = if interval.is_zero() {
            self.config.default_sample_interval
        } else {
            interval
        };
        let cache = Arc::clone(&self.cache);
        let state = self.state.subscribe();
        let device = device.to_string();

        stream! {
            let _guard = FollowGuard(device.clone());
            let mut cursor = 0_u64;
            loop {
                tokio::time::sleep(interval).await;
                if *state.borrow() != DispatcherState::Running {
                    break;
                }
                if let Some((payload, version)) = cache.get_if_newer(&device, cursor) {
                    cursor = version;
                    yield payload;
                }
            }
        }
        .boxed()
    }

    fn fault(&self) -> Option<String> {
        self.fault.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_fault(&self, reason: Option<String>) {
        *self.fault.lock().unwrap_or_else(|e| e.into_inner()) = reason;
    }
}

struct FollowGuard(String);

impl Drop for FollowGuard {
    fn drop(&mut self) {
        tracing::debug!(device = %self.0, "live stream closed");
    }
}

/// Extracts the device identifier; numeric identifiers are stringified.
fn device_id(payload: &Value, field: &str) -> Option<String> {
    match payload.get(field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

async fn drain(
    adapter: Arc<tokio::sync::Mutex<StreamSourceAdapter>>,
    ctx: DrainContext,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut adapter = adapter.lock().await;
    loop {
        if *shutdown.borrow() {
            break;
        }

        let received = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            received = adapter.receive() => received,
        };

        match received {
            Ok(None) => continue,
            Ok(Some(payload)) => {
                DrainStats::bump(&ctx.stats.received);
                if *ctx.state.borrow() == DispatcherState::Paused {
                    DrainStats::bump(&ctx.stats.discarded_while_paused);
                    continue;
                }
                match device_id(&payload, &ctx.device_field) {
                    Some(device) => {
                        ctx.cache.store(device, payload);
                        DrainStats::bump(&ctx.stats.applied);
                    }
                    None => {
                        tracing::debug!(field = %ctx.device_field, "message has no device identifier");
                        DrainStats::bump(&ctx.stats.skipped_unidentified);
                    }
                }
            }
            Err(e) if e.is_fatal() => {
                tracing::error!(error = %e, "message source failed; drain worker exiting");
                *ctx.fault.lock().unwrap_or_else(|p| p.into_inner()) = Some(e.to_string());
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable message");
                DrainStats::bump(&ctx.stats.decode_failures);
            }
        }
    }
}
