//! Human-readable durations ("500ms", "30s", "5m", "1h") used in fleet.toml.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid duration {0:?}: expected a number with an optional ms/s/m/h suffix")]
pub struct DurationError(pub String);

/// Parse a duration string. A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Result<Duration, DurationError> {
    let s = s.trim();
    let err = || DurationError(s.to_string());

    let (digits, scale_ms) = if let Some(ms) = s.strip_suffix("ms") {
        (ms, 1)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1_000)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60_000)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 3_600_000)
    } else {
        (s, 1_000)
    };

    let value: u64 = digits.trim().parse().map_err(|_| err())?;
    value
        .checked_mul(scale_ms)
        .map(Duration::from_millis)
        .ok_or_else(err)
}

/// Format a duration in the shortest unit that represents it exactly.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms % 1_000 != 0 {
        format!("{ms}ms")
    } else if ms != 0 && ms % 3_600_000 == 0 {
        format!("{}h", ms / 3_600_000)
    } else if ms != 0 && ms % 60_000 == 0 {
        format!("{}m", ms / 60_000)
    } else {
        format!("{}s", ms / 1_000)
    }
}

/// `#[serde(with = "...")]` adapter storing a `Duration` as a string.
pub mod serde_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(de)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
