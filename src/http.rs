//! HTTP surface over the dispatcher and the historical query engine.
//!
//! Live routes live under `/api/v1/stream`, historical routes under
//! `/api/v1/influx`. Streams are served as `text/event-stream` with one
//! `data:<json>` frame per record.

use crate::dispatcher::{DispatcherState, LiveCacheDispatcher};
use crate::error::QueryError;
use crate::history::{FormatOptions, HistoricalQueryEngine};
use crate::query_builder::{QuerySpec, TimeRange};
use crate::source::MemoryBus;
use crate::time_parser::parse_time_expr;
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use futures::stream::{BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Column the historical routes filter devices on.
const DEVICE_COLUMN: &str = "measurement";

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<LiveCacheDispatcher>,
    pub history: HistoricalQueryEngine,
    /// Sub-interval used by chunked exports.
    pub chunk: Duration,
    pub allow_raw_query: bool,
    /// Present when the in-process bus feeds the dispatcher.
    pub bus: Option<MemoryBus>,
    pub shutdown: Shutdown,
}

/// Server-wide shutdown flag. Event streams end once it is raised.
#[derive(Clone)]
pub struct Shutdown(Arc<watch::Sender<bool>>);

impl Default for Shutdown {
    fn default() -> Self {
        Self(Arc::new(watch::channel(false).0))
    }
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once [`trigger`](Self::trigger) has been called.
    pub fn triggered(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.0.subscribe();
        async move {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Errors returned by handlers, rendered as JSON bodies.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(Value),
    Unavailable(String),
    BadGateway(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            ApiError::NotFound(body) => (StatusCode::NOT_FOUND, body),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, json!({ "error": msg })),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, json!({ "error": msg })),
        };
        (status, Json(body)).into_response()
    }
}

impl From<QueryError> for ApiError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::InvalidInput(msg) => ApiError::BadRequest(msg),
            QueryError::Store(e) => {
                tracing::error!(error = %e, "store query failed");
                ApiError::BadGateway(e.to_string())
            }
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    let stream_routes = Router::new()
        .route("/start", get(start_stream))
        .route("/stop", get(stop_stream))
        .route("/pause", get(pause_stream))
        .route("/resume", get(resume_stream))
        .route("/status", get(stream_status))
        .route("/latest", get(latest_all))
        .route("/latest/:device", get(latest_one))
        .route("/live/:device", get(live_stream));

    let mut influx_routes = Router::new()
        .route("/query", get(history_query))
        .route("/query/latest", get(history_latest))
        .route("/csv", get(history_csv))
        .route("/large-csv", get(history_large_csv))
        .route("/follow", get(history_follow));

    if state.allow_raw_query {
        influx_routes = influx_routes.route("/raw", get(history_raw));
    }

    let mut app = Router::new().route("/health", get(|| async { "ok" }));
    if state.bus.is_some() {
        app = app.route("/api/v1/bus/:topic", post(publish_to_bus));
    }
    app.nest("/api/v1/stream", stream_routes)
        .nest("/api/v1/influx", influx_routes)
        .with_state(state)
}

/// Serves `state` on `listener` until `signal` resolves.
///
/// On the signal, open event streams are ended and the dispatcher is stopped
/// before in-flight responses are drained, so shutdown never waits on a
/// follower.
pub async fn serve<F>(listener: TcpListener, state: AppState, signal: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let dispatcher = Arc::clone(&state.dispatcher);
    let shutdown = state.shutdown.clone();
    let graceful = async move {
        signal.await;
        tracing::info!("shutdown requested; closing streams");
        shutdown.trigger();
        dispatcher.stop().await;
    };
    axum::serve(listener, router(state))
        .with_graceful_shutdown(graceful)
        .await
}

/// Frames one record as a server-sent event.
pub fn sse_frame(record: &Value) -> String {
    format!("data:{}\n\n", record)
}

fn event_stream(records: BoxStream<'static, Value>, shutdown: &Shutdown) -> Response {
    let frames = records
        .take_until(shutdown.triggered())
        .map(|record| Ok::<_, Infallible>(sse_frame(&record)));
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(frames),
    )
        .into_response()
}

fn csv_attachment(device: &str, body: Body) -> Response {
    let disposition = format!("attachment; filename=\"{}_data.csv\"", device);
    (
        [
            (header::CONTENT_TYPE, "text/csv".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response()
}

fn flag(value: &Option<String>) -> bool {
    value.as_deref().map_or(false, |v| v.eq_ignore_ascii_case("true"))
}

fn ensure_streaming(dispatcher: &LiveCacheDispatcher) -> ApiResult<()> {
    if dispatcher.state() == DispatcherState::Stopped {
        return Err(ApiError::Unavailable("Stream is not running".into()));
    }
    Ok(())
}

fn outcome(message: &str) -> Json<Value> {
    Json(json!({ "status": message }))
}

async fn start_stream(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    match state.dispatcher.start().await {
        Ok(result) => Ok(outcome(result.message())),
        Err(e) => {
            tracing::error!(error = %e, "failed to start stream");
            Err(ApiError::Unavailable(e.to_string()))
        }
    }
}

async fn stop_stream(State(state): State<AppState>) -> Json<Value> {
    outcome(state.dispatcher.stop().await.message())
}

async fn pause_stream(State(state): State<AppState>) -> Json<Value> {
    outcome(state.dispatcher.pause().message())
}

async fn resume_stream(State(state): State<AppState>) -> Json<Value> {
    outcome(state.dispatcher.resume().message())
}

async fn stream_status(State(state): State<AppState>) -> Json<Value> {
    let dispatcher = &state.dispatcher;
    let mut body = serde_json::to_value(dispatcher.status()).unwrap_or_else(|_| json!({}));
    if let Value::Object(ref mut map) = body {
        map.insert("state".into(), json!(dispatcher.state()));
        map.insert("cached_devices".into(), json!(dispatcher.cache().len()));
        map.insert("counters".into(), json!(dispatcher.stats()));
    }
    Json(body)
}

async fn latest_all(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    ensure_streaming(&state.dispatcher)?;
    Ok(Json(json!(state.dispatcher.get_latest_for_all())))
}

async fn latest_one(State(state): State<AppState>, Path(device): Path<String>) -> ApiResult<Json<Value>> {
    ensure_streaming(&state.dispatcher)?;
    state
        .dispatcher
        .get_latest_for(&device)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(json!({ "status": "Device not ready" })))
}

#[derive(Debug, Deserialize)]
struct LiveParams {
    /// Seconds between samples; 0 uses the configured default.
    frequency: Option<f64>,
}

async fn live_stream(
    State(state): State<AppState>,
    Path(device): Path<String>,
    Query(params): Query<LiveParams>,
) -> ApiResult<Response> {
    ensure_streaming(&state.dispatcher)?;
    let interval = Duration::try_from_secs_f64(params.frequency.unwrap_or(0.0))
        .map_err(|_| ApiError::BadRequest("frequency must be a non-negative number of seconds".into()))?;
    tracing::debug!(%device, ?interval, "live stream opened");
    Ok(event_stream(
        state.dispatcher.live_stream_for(&device, interval),
        &state.shutdown,
    ))
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    device_name: String,
    start_time: Option<String>,
    end_time: Option<String>,
    /// Aggregation window such as `10s`.
    frequency: Option<String>,
    /// Keep every Nth record per table.
    decimate: Option<usize>,
    local_time: Option<String>,
    iso_format: Option<String>,
}

impl HistoryParams {
    fn spec(&self, default_start: &str) -> Result<QuerySpec, QueryError> {
        let start = self.start_time.as_deref().unwrap_or(default_start);
        let range = TimeRange::parse(start, self.end_time.as_deref())?;
        QuerySpec::new(DEVICE_COLUMN, self.device_name.as_str(), range).with_window_str(self.frequency.as_deref())
    }

    fn options(&self) -> FormatOptions {
        FormatOptions {
            decimation: self.decimate,
            use_local_time: flag(&self.local_time),
            iso_format: flag(&self.iso_format),
        }
    }

    fn not_found(&self, default_start: &str) -> ApiError {
        let start = self.start_time.as_deref().unwrap_or(default_start);
        let end = self.end_time.as_deref().unwrap_or("now");
        ApiError::NotFound(json!({
            "error": format!(
                "No data found for {} in the {} to {} time range.",
                self.device_name, start, end
            )
        }))
    }
}

async fn run_history_query(state: &AppState, params: &HistoryParams, spec: QuerySpec, default_start: &str) -> ApiResult<Json<Value>> {
    let tables = state.history.query_tables(&spec).await?;
    let results = state.history.format_results(&tables, params.options());
    if results.is_empty() {
        return Err(params.not_found(default_start));
    }
    Ok(Json(Value::Object(results)))
}

async fn history_query(State(state): State<AppState>, Query(params): Query<HistoryParams>) -> ApiResult<Json<Value>> {
    let Some(start) = params.start_time.as_deref() else {
        return Err(ApiError::BadRequest("start_time is required".into()));
    };
    let spec = params.spec(start)?;
    run_history_query(&state, &params, spec, start).await
}

async fn history_latest(State(state): State<AppState>, Query(params): Query<HistoryParams>) -> ApiResult<Json<Value>> {
    const DEFAULT_START: &str = "-24h";
    let spec = params.spec(DEFAULT_START)?.latest();
    run_history_query(&state, &params, spec, DEFAULT_START).await
}

async fn history_csv(State(state): State<AppState>, Query(params): Query<HistoryParams>) -> ApiResult<Response> {
    let Some(start) = params.start_time.as_deref() else {
        return Err(ApiError::BadRequest("start_time is required".into()));
    };
    let spec = params.spec(start)?;
    let records = state.history.query(&spec).await?;
    if records.is_empty() {
        return Err(params.not_found(start));
    }
    let body = state.history.to_csv(&records, flag(&params.iso_format))?;
    Ok(csv_attachment(&params.device_name, Body::from(body)))
}

async fn history_large_csv(State(state): State<AppState>, Query(params): Query<HistoryParams>) -> ApiResult<Response> {
    let bad_time = || ApiError::BadRequest("time string should be ISO format in UTC time".into());
    let start = params.start_time.as_deref().ok_or_else(bad_time)?;
    parse_time_expr(start).map_err(|_| bad_time())?;
    if let Some(end) = params.end_time.as_deref().filter(|e| !e.trim().is_empty()) {
        parse_time_expr(end).map_err(|_| bad_time())?;
    }

    let spec = params.spec(start)?;
    let pieces = state
        .history
        .stream_csv(&spec, state.chunk, flag(&params.iso_format))?;
    let body = Body::from_stream(pieces.map(Ok::<_, Infallible>));
    Ok(csv_attachment(&params.device_name, body))
}

#[derive(Debug, Deserialize)]
struct FollowParams {
    device_name: String,
    /// Seconds between polls.
    rate: Option<u64>,
}

async fn history_follow(State(state): State<AppState>, Query(params): Query<FollowParams>) -> Response {
    let rate = Duration::from_secs(params.rate.unwrap_or(1));
    event_stream(
        state.history.follow_latest(DEVICE_COLUMN, &params.device_name, rate),
        &state.shutdown,
    )
}

#[derive(Debug, Deserialize)]
struct RawParams {
    query: String,
}

async fn history_raw(State(state): State<AppState>, Query(params): Query<RawParams>) -> ApiResult<Json<Value>> {
    tracing::warn!("executing caller-supplied query");
    let results = state.history.execute_raw(&params.query).await?;
    Ok(Json(Value::Object(results)))
}

async fn publish_to_bus(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    Json(payload): Json<Value>,
) -> ApiResult<Json<Value>> {
    let bus = state
        .bus
        .as_ref()
        .ok_or_else(|| ApiError::Unavailable("in-process bus is not enabled".into()))?;
    let delivered = bus.publish_json(&topic, &payload);
    tracing::debug!(%topic, delivered, "published to in-process bus");
    Ok(Json(json!({ "topic": topic, "delivered": delivered })))
}
