//! Time expressions accepted by the query surface.
//!
//! A time expression is either a relative duration (`-1h`, `30m`, `-0s`) that is
//! handed to the store untouched, or an absolute timestamp that is normalised to
//! Unix epoch seconds. Relative durations are only sniffed for shape; the
//! store's own grammar decides what they mean.

use crate::error::TimeParseError;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use std::fmt::{Display, Formatter};

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

const OFFSET_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z"];

/// A normalised time expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeExpr {
    /// Signed offset from now, kept verbatim (`-5m`).
    Relative(String),
    /// Unix timestamp in seconds.
    Absolute(i64),
}

impl Display for TimeExpr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeExpr::Relative(expr) => write!(f, "{}", expr),
            TimeExpr::Absolute(secs) => write!(f, "{}", secs),
        }
    }
}

impl TimeExpr {
    pub fn now() -> Self {
        TimeExpr::Relative("-0s".to_string())
    }

    pub fn at(instant: DateTime<Utc>) -> Self {
        TimeExpr::Absolute(instant.timestamp())
    }

    /// Resolves the expression against `now`.
    pub fn resolve(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, TimeParseError> {
        match self {
            TimeExpr::Relative(expr) => relative_offset(expr)
                .and_then(|offset| now.checked_add_signed(offset))
                .ok_or_else(|| TimeParseError(expr.clone())),
            TimeExpr::Absolute(secs) => Utc
                .timestamp_opt(*secs, 0)
                .single()
                .ok_or_else(|| TimeParseError(secs.to_string())),
        }
    }

    pub fn is_relative(&self) -> bool {
        matches!(self, TimeExpr::Relative(_))
    }
}

/// Returns true for strings shaped like `-?N[smhd]`.
pub fn is_relative_duration(input: &str) -> bool {
    let body = input.strip_prefix('-').unwrap_or(input);
    let Some(unit) = body.chars().last() else {
        return false;
    };
    let digits = &body[..body.len() - unit.len_utf8()];
    matches!(unit, 's' | 'm' | 'h' | 'd')
        && !digits.is_empty()
        && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Normalises a time string for query construction.
///
/// Relative durations come back unchanged; anything else must parse as an
/// absolute timestamp and comes back as epoch seconds. A one-character input
/// is never valid.
pub fn parse_time_expr(input: &str) -> Result<TimeExpr, TimeParseError> {
    let input = input.trim();
    if input.chars().count() <= 1 {
        tracing::warn!(input, "rejecting time expression");
        return Err(TimeParseError(input.to_string()));
    }
    if is_relative_duration(input) {
        return Ok(TimeExpr::Relative(input.to_string()));
    }
    match parse_absolute(input) {
        Ok(instant) => Ok(TimeExpr::Absolute(instant.timestamp())),
        Err(e) => {
            tracing::warn!(input, "unable to parse time expression");
            Err(e)
        }
    }
}

/// Parses an absolute timestamp. Inputs without an offset are taken as UTC.
pub fn parse_absolute(input: &str) -> Result<DateTime<Utc>, TimeParseError> {
    let input = input.trim();
    let invalid = || TimeParseError(input.to_string());

    if let Ok(instant) = DateTime::parse_from_rfc3339(input) {
        return Ok(instant.with_timezone(&Utc));
    }
    for format in OFFSET_FORMATS {
        if let Ok(instant) = DateTime::parse_from_str(input, format) {
            return Ok(instant.with_timezone(&Utc));
        }
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        let midnight = date.and_hms_opt(0, 0, 0).ok_or_else(invalid)?;
        return Ok(Utc.from_utc_datetime(&midnight));
    }
    // bare epoch seconds
    if let Ok(secs) = input.parse::<i64>() {
        return Utc.timestamp_opt(secs, 0).single().ok_or_else(invalid);
    }
    Err(invalid())
}

/// Parses a time string straight to an instant, resolving relative durations
/// against `now`.
pub fn resolve_instant(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, TimeParseError> {
    parse_time_expr(input)?.resolve(now)
}

fn relative_offset(expr: &str) -> Option<Duration> {
    if !is_relative_duration(expr) {
        return None;
    }
    let (negative, body) = match expr.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, expr),
    };
    let (digits, unit) = body.split_at(body.len() - 1);
    let magnitude: i64 = digits.parse().ok()?;
    let offset = match unit {
        "s" => Duration::try_seconds(magnitude)?,
        "m" => Duration::try_minutes(magnitude)?,
        "h" => Duration::try_hours(magnitude)?,
        "d" => Duration::try_days(magnitude)?,
        _ => return None,
    };
    Some(if negative { -offset } else { offset })
}
