//! Historical query engine.
//!
//! Turns [`QuerySpec`]s into store queries and reshapes the resulting tables:
//! - pivoted into one record per timestamp ([`HistoricalQueryEngine::query`])
//! - keyed by formatted timestamp for JSON responses ([`format_results`])
//! - rendered as CSV, either whole or chunk by chunk over long ranges
//!
//! Long ranges are walked in fixed sub-intervals, one store query each, so a
//! multi-day export never holds more than one chunk in memory.
//!
//! [`format_results`]: HistoricalQueryEngine::format_results

use crate::error::QueryError;
use crate::query_builder::{QueryBuilder, QuerySpec, TimeRange};
use crate::store::{FluxTable, TimeSeriesStore};
use crate::time_parser::TimeExpr;
use async_stream::stream;
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use futures::stream::{BoxStream, StreamExt};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::IntervalStream;

const PLAIN_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Extra lookback on follow-latest queries so a point written just before a
/// tick is still inside the window.
const FOLLOW_SLACK_SECS: u64 = 5;

/// All fields observed at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedRecord {
    pub time: DateTime<Utc>,
    pub fields: Map<String, Value>,
}

/// How [`HistoricalQueryEngine::format_results`] renders tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FormatOptions {
    /// Keep every Nth record of each table.
    pub decimation: Option<usize>,
    /// Add a `local_time` field in the configured timezone.
    pub use_local_time: bool,
    /// Render timestamps as RFC 3339 instead of `YYYY-mm-dd HH:MM:SS.ffffff`.
    pub iso_format: bool,
}

/// One sub-interval of a chunked range query.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeChunk {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub records: Vec<TimedRecord>,
    /// Only the first non-empty chunk carries the header.
    pub include_header: bool,
}

#[derive(Clone)]
pub struct HistoricalQueryEngine {
    store: Arc<dyn TimeSeriesStore>,
    builder: QueryBuilder,
    timezone: Tz,
}

impl HistoricalQueryEngine {
    pub fn new(store: Arc<dyn TimeSeriesStore>, bucket: impl Into<String>, timezone: Tz) -> Self {
        Self {
            store,
            builder: QueryBuilder::new(bucket),
            timezone,
        }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn build_query(&self, spec: &QuerySpec) -> Result<String, QueryError> {
        self.builder.build(spec)
    }

    /// Runs `spec` and returns the raw tables.
    pub async fn query_tables(&self, spec: &QuerySpec) -> Result<Vec<FluxTable>, QueryError> {
        let flux = self.build_query(spec)?;
        Ok(self.store.query(&flux).await?)
    }

    /// Runs `spec` and pivots the rows into one record per timestamp, oldest
    /// first. An empty vector means no data.
    pub async fn query(&self, spec: &QuerySpec) -> Result<Vec<TimedRecord>, QueryError> {
        let tables = self.query_tables(spec).await?;
        Ok(pivot(&tables))
    }

    /// Runs caller-supplied query text unchanged.
    pub async fn execute_raw(&self, flux: &str) -> Result<Map<String, Value>, QueryError> {
        if flux.trim().is_empty() {
            return Err(QueryError::InvalidInput("query must not be empty".into()));
        }
        let tables = self.store.query(flux).await?;
        Ok(self.format_results(&tables, FormatOptions::default()))
    }

    /// Keys every record by its formatted UTC timestamp.
    ///
    /// Records whose timestamps render to the same key are merged into one
    /// entry by field name; a later table overwrites an earlier one. Entries
    /// come out oldest first.
    pub fn format_results(&self, tables: &[FluxTable], options: FormatOptions) -> Map<String, Value> {
        let step = options.decimation.filter(|n| *n > 0).unwrap_or(1);
        let mut by_key: BTreeMap<String, (DateTime<Utc>, Map<String, Value>)> = BTreeMap::new();

        for table in tables {
            for record in table.records.iter().step_by(step) {
                let Some(time) = record.time else {
                    continue;
                };
                let (first_seen, entry) = by_key
                    .entry(format_time(&time, options.iso_format))
                    .or_insert_with(|| (time, Map::new()));
                *first_seen = (*first_seen).min(time);
                if options.use_local_time {
                    let local = time.with_timezone(&self.timezone);
                    entry.insert("local_time".into(), Value::String(format_time(&local, options.iso_format)));
                }
                let field = record.field.clone().unwrap_or_else(|| "_value".to_string());
                entry.insert(field, record.value.clone());
            }
        }

        ordered_by_time(by_key)
    }

    /// Walks the range of `spec` in `chunk`-sized sub-intervals.
    ///
    /// Each sub-interval is one store query. Empty sub-intervals are skipped and
    /// a failing sub-interval is logged and skipped. A spec that cannot be
    /// turned into a query is rejected before any chunk runs. Chunks are yielded as soon
    /// as their query returns.
    pub fn stream_large_range(
        &self,
        spec: &QuerySpec,
        chunk: Duration,
    ) -> Result<BoxStream<'static, RangeChunk>, QueryError> {
        let now = Utc::now();
        let start = spec.range.start.resolve(now)?;
        let end = spec.range.end.resolve(now)?;
        let step = chrono::Duration::from_std(chunk.max(Duration::from_secs(1)))
            .map_err(|_| QueryError::InvalidInput("chunk duration is too large".into()))?;
        // a spec the builder rejects would fail every chunk
        self.build_query(spec)?;

        let engine = self.clone();
        let spec = spec.clone();

        Ok(stream! {
            let mut current = start;
            let mut first = true;
            while current < end {
                let next = (current + step).min(end);
                let sub = spec.with_range(TimeRange::between(current, next));
                match engine.query(&sub).await {
                    Ok(records) if records.is_empty() => {
                        tracing::debug!(start = %current, end = %next, "no data in chunk");
                    }
                    Ok(records) => {
                        yield RangeChunk {
                            start: current,
                            end: next,
                            records,
                            include_header: first,
                        };
                        first = false;
                    }
                    Err(e) => {
                        tracing::warn!(start = %current, end = %next, error = %e, "skipping chunk");
                    }
                }
                current = next;
            }
        }
        .boxed())
    }

    /// Renders records as one CSV document with a header row.
    pub fn to_csv(&self, records: &[TimedRecord], iso_format: bool) -> Result<String, QueryError> {
        let layout = CsvLayout::from_records(records);
        layout.render(records, true, iso_format, self.timezone)
    }

    /// Chunked CSV over a long range; concatenating the pieces gives one
    /// document. The column set is taken from the first non-empty chunk.
    pub fn stream_csv(
        &self,
        spec: &QuerySpec,
        chunk: Duration,
        iso_format: bool,
    ) -> Result<BoxStream<'static, String>, QueryError> {
        let chunks = self.stream_large_range(spec, chunk)?;
        let timezone = self.timezone;
        let mut layout: Option<CsvLayout> = None;

        Ok(chunks
            .filter_map(move |chunk| {
                let layout = layout.get_or_insert_with(|| CsvLayout::from_records(&chunk.records));
                let rendered = layout.render(&chunk.records, chunk.include_header, iso_format, timezone);
                let piece = match rendered {
                    Ok(text) => Some(text),
                    Err(e) => {
                        tracing::warn!(start = %chunk.start, error = %e, "failed to render chunk");
                        None
                    }
                };
                futures::future::ready(piece)
            })
            .boxed())
    }

    /// Polls the store every `rate` for the newest record matching the filter
    /// and yields it, keyed by formatted timestamp, whenever one exists.
    pub fn follow_latest(&self, field_name: &str, field_value: &str, rate: Duration) -> BoxStream<'static, Value> {
        let rate = rate.max(Duration::from_secs(1));
        let lookback = format!("-{}s", rate.as_secs() + FOLLOW_SLACK_SECS);
        let spec = QuerySpec::new(
            field_name,
            field_value,
            TimeRange::new(TimeExpr::Relative(lookback), TimeExpr::now()),
        )
        .latest();

        let mut ticker = tokio::time::interval(rate);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let engine = self.clone();

        IntervalStream::new(ticker)
            .then(move |_| {
                let engine = engine.clone();
                let spec = spec.clone();
                async move { engine.query(&spec).await }
            })
            .filter_map(|result| async move {
                match result {
                    Ok(records) if records.is_empty() => None,
                    Ok(records) => Some(Value::Object(records_by_time(&records))),
                    Err(e) => {
                        tracing::warn!(error = %e, "follow query failed");
                        None
                    }
                }
            })
            .boxed()
    }
}

/// Keys pivoted records by formatted UTC timestamp, merging records that
/// render to the same key.
pub fn records_by_time(records: &[TimedRecord]) -> Map<String, Value> {
    let mut by_key: BTreeMap<String, (DateTime<Utc>, Map<String, Value>)> = BTreeMap::new();
    for record in records {
        let (_, entry) = by_key
            .entry(format_time(&record.time, false))
            .or_insert_with(|| (record.time, Map::new()));
        entry.extend(record.fields.clone());
    }
    ordered_by_time(by_key)
}

fn ordered_by_time(by_key: BTreeMap<String, (DateTime<Utc>, Map<String, Value>)>) -> Map<String, Value> {
    let mut entries: Vec<_> = by_key.into_iter().collect();
    entries.sort_by_key(|(_, (time, _))| *time);
    entries
        .into_iter()
        .map(|(key, (_, fields))| (key, Value::Object(fields)))
        .collect()
}

fn pivot(tables: &[FluxTable]) -> Vec<TimedRecord> {
    let mut by_time: BTreeMap<DateTime<Utc>, Map<String, Value>> = BTreeMap::new();
    for record in tables.iter().flat_map(|t| &t.records) {
        let (Some(time), Some(field)) = (record.time, record.field.as_ref()) else {
            continue;
        };
        by_time
            .entry(time)
            .or_default()
            .insert(field.clone(), record.value.clone());
    }
    by_time
        .into_iter()
        .map(|(time, fields)| TimedRecord { time, fields })
        .collect()
}

fn format_time<T>(time: &DateTime<T>, iso_format: bool) -> String
where
    T: TimeZone,
    T::Offset: Display,
{
    if iso_format {
        time.to_rfc3339()
    } else {
        time.format(PLAIN_TIME_FORMAT).to_string()
    }
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Column order for CSV output: `time`, `local_time`, then fields by name.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CsvLayout {
    fields: Vec<String>,
}

impl CsvLayout {
    fn from_records(records: &[TimedRecord]) -> Self {
        let fields: BTreeSet<&String> = records.iter().flat_map(|r| r.fields.keys()).collect();
        Self {
            fields: fields.into_iter().cloned().collect(),
        }
    }

    fn render(
        &self,
        records: &[TimedRecord],
        include_header: bool,
        iso_format: bool,
        timezone: Tz,
    ) -> Result<String, QueryError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        let invalid = |e: csv::Error| QueryError::InvalidInput(format!("csv rendering failed: {}", e));

        if include_header {
            let header = ["time", "local_time"]
                .into_iter()
                .chain(self.fields.iter().map(String::as_str));
            writer.write_record(header).map_err(invalid)?;
        }
        for record in records {
            let local = record.time.with_timezone(&timezone);
            let row = [format_time(&record.time, iso_format), format_time(&local, iso_format)]
                .into_iter()
                .chain(
                    self.fields
                        .iter()
                        .map(|f| record.fields.get(f).map(cell).unwrap_or_default()),
                );
            writer.write_record(row).map_err(invalid)?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| QueryError::InvalidInput(format!("csv rendering failed: {}", e)))?;
        String::from_utf8(bytes).map_err(|e| QueryError::InvalidInput(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FluxRecord;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_709_510_400 + secs, 0).unwrap()
    }

    fn engine() -> HistoricalQueryEngine {
        struct Unused;
        #[async_trait::async_trait]
        impl TimeSeriesStore for Unused {
            async fn query(&self, _flux: &str) -> Result<Vec<FluxTable>, crate::error::StoreError> {
                Ok(Vec::new())
            }
        }
        HistoricalQueryEngine::new(Arc::new(Unused), "sensor_data", chrono_tz::America::Los_Angeles)
    }

    fn tables() -> Vec<FluxTable> {
        vec![
            FluxTable::new(
                0,
                (0..4)
                    .map(|i| FluxRecord::new(0, at(i * 10), "temp", json!(70 + i)))
                    .collect(),
            ),
            FluxTable::new(
                1,
                vec![
                    FluxRecord::new(1, at(0), "vibration", json!(0.5)),
                    FluxRecord::new(1, at(10), "temp", json!(99)),
                ],
            ),
        ]
    }

    #[test]
    fn test_format_merges_tables_last_write_wins() {
        let out = engine().format_results(&tables(), FormatOptions::default());
        assert_eq!(out.len(), 4);
        assert_eq!(
            out["2024-03-04 00:00:00.000000"],
            json!({"temp": 70, "vibration": 0.5})
        );
        assert_eq!(out["2024-03-04 00:00:10.000000"], json!({"temp": 99}));
        let keys: Vec<&String> = out.keys().collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_format_merges_instants_that_render_alike() {
        let base = at(0);
        let tables = vec![
            FluxTable::new(
                0,
                vec![FluxRecord::new(0, base + chrono::Duration::nanoseconds(100), "temp", json!(70))],
            ),
            FluxTable::new(
                1,
                vec![FluxRecord::new(1, base + chrono::Duration::nanoseconds(200), "vibration", json!(0.5))],
            ),
        ];

        let out = engine().format_results(&tables, FormatOptions::default());
        assert_eq!(out.len(), 1);
        assert_eq!(out["2024-03-04 00:00:00.000000"], json!({"temp": 70, "vibration": 0.5}));
    }

    #[test]
    fn test_records_by_time_merges_sub_microsecond_instants() {
        let base = at(0);
        let records = vec![
            TimedRecord {
                time: base,
                fields: json!({"temp": 70}).as_object().cloned().unwrap(),
            },
            TimedRecord {
                time: base + chrono::Duration::nanoseconds(400),
                fields: json!({"vibration": 0.5}).as_object().cloned().unwrap(),
            },
        ];
        let out = records_by_time(&records);
        assert_eq!(out.len(), 1);
        assert_eq!(out["2024-03-04 00:00:00.000000"], json!({"temp": 70, "vibration": 0.5}));
    }

    #[test]
    fn test_format_decimates_per_table() {
        let options = FormatOptions {
            decimation: Some(2),
            ..Default::default()
        };
        let out = engine().format_results(&tables(), options);
        // table 0 keeps indices 0 and 2, table 1 keeps index 0
        assert_eq!(out.len(), 2);
        assert_eq!(out["2024-03-04 00:00:00.000000"], json!({"temp": 70, "vibration": 0.5}));
        assert_eq!(out["2024-03-04 00:00:20.000000"], json!({"temp": 72}));
    }

    #[test]
    fn test_format_local_and_iso() {
        let options = FormatOptions {
            use_local_time: true,
            iso_format: true,
            ..Default::default()
        };
        let out = engine().format_results(&tables()[..1], options);
        let first = &out["2024-03-04T00:00:00+00:00"];
        assert_eq!(first["local_time"], json!("2024-03-03T16:00:00-08:00"));
        assert_eq!(first["temp"], json!(70));
    }

    #[test]
    fn test_pivot_orders_by_time() {
        let records = pivot(&tables());
        assert_eq!(records.len(), 4);
        assert!(records.windows(2).all(|w| w[0].time < w[1].time));
        assert_eq!(records[0].fields["vibration"], json!(0.5));
    }

    #[test]
    fn test_csv_layout() {
        let records = pivot(&tables());
        let csv = engine().to_csv(&records[..2], false).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "time,local_time,temp,vibration");
        assert_eq!(
            lines[1],
            "2024-03-04 00:00:00.000000,2024-03-03 16:00:00.000000,70,0.5"
        );
        assert_eq!(lines[2], "2024-03-04 00:00:10.000000,2024-03-03 16:00:10.000000,99,");
    }

    #[test]
    fn test_csv_without_header() {
        let records = pivot(&tables());
        let layout = CsvLayout::from_records(&records);
        let body = layout
            .render(&records[3..], false, true, chrono_tz::UTC)
            .unwrap();
        assert_eq!(body, "2024-03-04T00:00:30+00:00,2024-03-04T00:00:30+00:00,73,\n");
    }
}
