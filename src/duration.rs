//! Cache durations.
//!
//! The engine accepts a TTL as raw milliseconds or as a human string like
//! `"45 minutes"`. Units: `ms`, `second`, `minute`, `hour`, `day`, `week`,
//! `month` (optionally pluralized, any case), with a month counted as 30
//! days.

const MS_PER_SECOND: u64 = 1_000;
const MS_PER_MINUTE: u64 = 60 * MS_PER_SECOND;
const MS_PER_HOUR: u64 = 60 * MS_PER_MINUTE;
const MS_PER_DAY: u64 = 24 * MS_PER_HOUR;
const MS_PER_WEEK: u64 = 7 * MS_PER_DAY;
const MS_PER_MONTH: u64 = 30 * MS_PER_DAY;

/// TTL argument accepted by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Ttl {
    /// The engine's configured default duration.
    #[default]
    Default,
    Millis(u64),
    /// The human grammar; unparseable text falls back to the default.
    Text(String),
}

impl Ttl {
    pub(crate) fn resolve_ms(&self, default_ms: u64) -> u64 {
        match self {
            Self::Default => default_ms,
            Self::Millis(ms) => *ms,
            Self::Text(text) => parse_duration(text, default_ms),
        }
    }
}

impl From<u64> for Ttl {
    fn from(ms: u64) -> Self {
        Self::Millis(ms)
    }
}

impl From<&str> for Ttl {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for Ttl {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

/// Parse a `"<count> <unit>"` string into milliseconds.
///
/// Fractional counts are allowed (`"1.5 seconds"` is 1500). A zero or
/// unreadable count falls back to one unit; anything that is not two
/// whitespace-separated tokens with a known unit falls back to
/// `default_ms`.
pub fn parse_duration(text: &str, default_ms: u64) -> u64 {
    let mut parts = text.split_whitespace();
    let (count, unit) = match (parts.next(), parts.next(), parts.next()) {
        (Some(count), Some(unit), None) => (count, unit),
        _ => return default_ms,
    };
    let Some(unit_ms) = unit_millis(unit) else {
        return default_ms;
    };
    let count = match count.parse::<f64>() {
        Ok(value) if value.is_finite() && value > 0.0 => value,
        _ => 1.0,
    };
    (count * unit_ms as f64).round() as u64
}

fn unit_millis(unit: &str) -> Option<u64> {
    let lower = unit.to_ascii_lowercase();
    if lower == "ms" {
        return Some(1);
    }
    let singular = lower.strip_suffix('s').unwrap_or(&lower);
    match singular {
        "second" => Some(MS_PER_SECOND),
        "minute" => Some(MS_PER_MINUTE),
        "hour" => Some(MS_PER_HOUR),
        "day" => Some(MS_PER_DAY),
        "week" => Some(MS_PER_WEEK),
        "month" => Some(MS_PER_MONTH),
        _ => None,
    }
}
