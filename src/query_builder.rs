//! Flux query generation.
//!
//! A [`QuerySpec`] fully determines the query text: one `from`, one `range`,
//! one `filter` per field filter in the order given, then either a
//! window-and-last downsampling stage or a bare `last()` for latest-only
//! queries.

use crate::error::QueryError;
use crate::time_parser::{parse_time_expr, TimeExpr};
use chrono::{DateTime, Utc};
use std::borrow::Cow;

/// Column names that live under an underscore prefix in the store.
pub const RESERVED_COLUMNS: [&str; 3] = ["field", "measurement", "value"];

/// A window must move forward: no sign and a non-zero magnitude.
fn is_positive_window(every: &str) -> bool {
    !every.starts_with('-') && every.bytes().any(|b| b.is_ascii_digit() && b != b'0')
}

/// Maps a caller-facing column name to the store column name.
pub fn column_name(name: &str) -> Cow<'_, str> {
    if RESERVED_COLUMNS.contains(&name) {
        Cow::Owned(format!("_{}", name))
    } else {
        Cow::Borrowed(name)
    }
}

/// Equality filter on one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldFilter {
    pub field_name: String,
    pub field_value: String,
}

impl FieldFilter {
    pub fn new(field_name: impl Into<String>, field_value: impl Into<String>) -> Self {
        Self {
            field_name: field_name.into(),
            field_value: field_value.into(),
        }
    }
}

/// Query time bounds; `end` defaults to now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeRange {
    pub start: TimeExpr,
    pub end: TimeExpr,
}

impl TimeRange {
    pub fn new(start: TimeExpr, end: TimeExpr) -> Self {
        Self { start, end }
    }

    /// Parses caller-supplied bounds. A missing or blank end means now.
    pub fn parse(start: &str, end: Option<&str>) -> Result<Self, QueryError> {
        let start = parse_time_expr(start)?;
        let end = match end.map(str::trim).filter(|e| !e.is_empty()) {
            Some(end) => parse_time_expr(end)?,
            None => TimeExpr::now(),
        };
        Ok(Self { start, end })
    }

    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: TimeExpr::at(start),
            end: TimeExpr::at(end),
        }
    }
}

/// Everything needed to produce one store query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySpec {
    pub filters: Vec<FieldFilter>,
    pub range: TimeRange,
    /// Downsampling window; the last value of each window is kept.
    pub window: Option<TimeExpr>,
    pub latest_only: bool,
}

impl QuerySpec {
    pub fn new(field_name: impl Into<String>, field_value: impl Into<String>, range: TimeRange) -> Self {
        Self {
            filters: vec![FieldFilter::new(field_name, field_value)],
            range,
            window: None,
            latest_only: false,
        }
    }

    pub fn with_filter(mut self, field_name: impl Into<String>, field_value: impl Into<String>) -> Self {
        self.filters.push(FieldFilter::new(field_name, field_value));
        self
    }

    pub fn with_window(mut self, window: Option<TimeExpr>) -> Self {
        self.window = window;
        self
    }

    /// Parses an aggregation window such as `10s` or `1h`.
    pub fn with_window_str(self, window: Option<&str>) -> Result<Self, QueryError> {
        let window = match window.map(str::trim).filter(|w| !w.is_empty()) {
            Some(w) => Some(parse_time_expr(w)?),
            None => None,
        };
        Ok(self.with_window(window))
    }

    pub fn latest(mut self) -> Self {
        self.latest_only = true;
        self
    }

    /// Same filters and window over different bounds.
    pub fn with_range(&self, range: TimeRange) -> Self {
        Self {
            range,
            ..self.clone()
        }
    }

    /// The value of the first filter, used in caller-facing messages.
    pub fn subject(&self) -> &str {
        self.filters.first().map(|f| f.field_value.as_str()).unwrap_or_default()
    }
}

/// Builds query text against one bucket.
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    bucket: String,
}

impl QueryBuilder {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self { bucket: bucket.into() }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Renders `spec` as a Flux query.
    pub fn build(&self, spec: &QuerySpec) -> Result<String, QueryError> {
        if spec.filters.is_empty() {
            return Err(QueryError::InvalidInput("at least one filter is required".into()));
        }

        let mut query = format!("from(bucket: \"{}\")", escape(&self.bucket));
        query.push_str(&format!(
            "\n  |> range(start: {}, stop: {})",
            spec.range.start, spec.range.end
        ));

        for filter in &spec.filters {
            if filter.field_name.trim().is_empty() {
                return Err(QueryError::InvalidInput("filter field name must not be empty".into()));
            }
            query.push_str(&format!(
                "\n  |> filter(fn: (r) => r[\"{}\"] == \"{}\")",
                escape(&column_name(&filter.field_name)),
                escape(&filter.field_value)
            ));
        }

        match &spec.window {
            Some(TimeExpr::Relative(every)) if is_positive_window(every) => {
                query.push_str(&format!("\n  |> window(every: {})", every));
                query.push_str("\n  |> last()");
            }
            Some(other) => {
                return Err(QueryError::InvalidInput(format!(
                    "aggregation window must be a positive duration, got '{}'",
                    other
                )));
            }
            None if spec.latest_only => query.push_str("\n  |> last()"),
            None => {}
        }

        Ok(query)
    }
}

fn escape(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('"', "\\\"")
}
