use std::fmt;

use basalt_common::{BasaltError, Result};
use chrono::{TimeZone, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Rendering of the eternity interval endpoints, which sit outside the range
/// representable by calendar timestamps.
const ETERNITY_START: &str = "-146136543-09-08T08:23:32.096Z";
const ETERNITY_END: &str = "146140482-04-24T15:36:27.903Z";

/// A half-open `[start, end)` time interval in UTC milliseconds.
///
/// Serialized as `"start/end"` with ISO-8601 endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interval {
    pub start: i64,
    pub end: i64,
}

impl Interval {
    /// The unbounded interval used when no time condition restricts a query.
    pub const ETERNITY: Interval = Interval {
        start: i64::MIN,
        end: i64::MAX,
    };

    pub fn new(start: i64, end: i64) -> Interval {
        Interval { start, end }
    }

    pub fn is_eternity(&self) -> bool {
        *self == Interval::ETERNITY
    }
}

fn render_instant(millis: i64) -> String {
    if millis == i64::MIN {
        return ETERNITY_START.to_string();
    }
    if millis == i64::MAX {
        return ETERNITY_END.to_string();
    }
    match Utc.timestamp_millis_opt(millis).single() {
        Some(dt) => dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        None => millis.to_string(),
    }
}

fn parse_instant(s: &str) -> Result<i64> {
    if s == ETERNITY_START {
        return Ok(i64::MIN);
    }
    if s == ETERNITY_END {
        return Ok(i64::MAX);
    }
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| BasaltError::invalid_input(format!("invalid interval instant [{s}]: {e}")))
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}",
            render_instant(self.start),
            render_instant(self.end)
        )
    }
}

impl std::str::FromStr for Interval {
    type Err = BasaltError;

    fn from_str(s: &str) -> Result<Self> {
        let (start, end) = s
            .split_once('/')
            .ok_or_else(|| BasaltError::invalid_input(format!("invalid interval [{s}]")))?;
        Ok(Interval {
            start: parse_instant(start)?,
            end: parse_instant(end)?,
        })
    }
}

impl Serialize for Interval {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Interval {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Time bucketing applied by timeseries and grouping queries.
///
/// `All` serializes as the plain string `"all"`; period granularities as
/// `{"type":"period","period":"P1D","timeZone":"America/Los_Angeles"}`.
#[derive(Debug, Clone, PartialEq)]
pub enum Granularity {
    All,
    Period {
        period: String,
        time_zone: String,
        origin: Option<String>,
    },
}

impl Serialize for Granularity {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Granularity::All => serializer.serialize_str("all"),
            Granularity::Period {
                period,
                time_zone,
                origin,
            } => {
                use serde::ser::SerializeMap;
                let mut map = serializer.serialize_map(None)?;
                map.serialize_entry("type", "period")?;
                map.serialize_entry("period", period)?;
                map.serialize_entry("timeZone", time_zone)?;
                if let Some(origin) = origin {
                    map.serialize_entry("origin", origin)?;
                }
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Granularity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::String(s) if s == "all" => Ok(Granularity::All),
            serde_json::Value::Object(map) => {
                let get_str = |key: &str| {
                    map.get(key)
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                };
                if map.get("type").and_then(|v| v.as_str()) != Some("period") {
                    return Err(D::Error::custom("unrecognized granularity object"));
                }
                Ok(Granularity::Period {
                    period: get_str("period")
                        .ok_or_else(|| D::Error::custom("period granularity missing period"))?,
                    time_zone: get_str("timeZone").unwrap_or_else(|| "UTC".to_string()),
                    origin: get_str("origin"),
                })
            }
            other => Err(D::Error::custom(format!(
                "unrecognized granularity [{other}]"
            ))),
        }
    }
}

/// Validate an ISO-8601 period string such as `P1D`, `PT1H` or `P3M`.
///
/// Rejects empty designator lists and unknown designator characters; used to
/// surface invalid period constants as compile-time `InvalidInput` instead of
/// execution failures.
pub fn validate_period(period: &str) -> Result<()> {
    let err = || BasaltError::invalid_input(format!("invalid period string [{period}]"));
    let rest = period.strip_prefix('P').ok_or_else(err)?;
    if rest.is_empty() {
        return Err(err());
    }
    let mut saw_designator = false;
    let mut digits = 0usize;
    let mut in_time = false;
    for c in rest.chars() {
        match c {
            '0'..='9' => digits += 1,
            'T' if !in_time => {
                if digits > 0 {
                    return Err(err());
                }
                in_time = true;
            }
            'Y' | 'W' | 'D' if !in_time => {
                if digits == 0 {
                    return Err(err());
                }
                saw_designator = true;
                digits = 0;
            }
            'M' => {
                // month before T, minute after
                if digits == 0 {
                    return Err(err());
                }
                saw_designator = true;
                digits = 0;
            }
            'H' | 'S' if in_time => {
                if digits == 0 {
                    return Err(err());
                }
                saw_designator = true;
                digits = 0;
            }
            _ => return Err(err()),
        }
    }
    if digits > 0 || !saw_designator {
        return Err(err());
    }
    Ok(())
}
