//! Bar interval parsing

use crate::error::EngineError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

const MINUTE_MS: i64 = 60_000;

/// Fixed bar interval (e.g., "5m", "1h", "1d")
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timeframe {
    millis: i64,
}

impl Timeframe {
    /// Build from a raw millisecond duration
    pub fn from_millis(millis: i64) -> Result<Self, EngineError> {
        if millis <= 0 {
            return Err(EngineError::validation(format!(
                "timeframe must be positive, got {millis}ms"
            )));
        }
        Ok(Self { millis })
    }

    /// Clamped to at least one minute and at most `i64::MAX` milliseconds
    pub fn minutes(minutes: i64) -> Self {
        Self {
            millis: minutes.max(1).saturating_mul(MINUTE_MS),
        }
    }

    /// Duration in milliseconds
    pub fn as_millis(&self) -> i64 {
        self.millis
    }

    /// Start of the bucket containing `time`
    pub fn bucket_start(&self, time: i64) -> i64 {
        time.div_euclid(self.millis) * self.millis
    }

    /// Canonical short label, also used in cache file names
    pub fn label(&self) -> String {
        let m = self.millis;
        if m % (7 * 86_400_000) == 0 {
            format!("{}w", m / (7 * 86_400_000))
        } else if m % 86_400_000 == 0 {
            format!("{}d", m / 86_400_000)
        } else if m % 3_600_000 == 0 {
            format!("{}h", m / 3_600_000)
        } else if m % MINUTE_MS == 0 {
            format!("{}m", m / MINUTE_MS)
        } else if m % 1000 == 0 {
            format!("{}s", m / 1000)
        } else {
            format!("{m}ms")
        }
    }
}

impl FromStr for Timeframe {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let lower = value.trim().to_lowercase();
        let split = lower
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| EngineError::validation(format!("timeframe has no unit: {value}")))?;
        let (number, unit) = lower.split_at(split);
        let count: i64 = number
            .parse()
            .map_err(|_| EngineError::validation(format!("invalid timeframe: {value}")))?;

        let unit_ms = match unit {
            "ms" => 1,
            "s" | "sec" => 1000,
            "m" | "min" => MINUTE_MS,
            "h" | "hour" => 60 * MINUTE_MS,
            "d" | "day" => 24 * 60 * MINUTE_MS,
            "w" | "week" => 7 * 24 * 60 * MINUTE_MS,
            _ => {
                return Err(EngineError::validation(format!(
                    "unsupported timeframe unit: {value}"
                )))
            }
        };

        let millis = count
            .checked_mul(unit_ms)
            .ok_or_else(|| EngineError::validation(format!("timeframe too large: {value}")))?;
        Self::from_millis(millis)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

impl Serialize for Timeframe {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.label())
    }
}

impl<'de> Deserialize<'de> for Timeframe {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
