//! Wall-clock time expressed in a series' unit of time

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DriverError;

/// Resolution of the integer timestamps a series reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitOfTime {
    Seconds,
    Milliseconds,
    Microseconds,
    Nanoseconds,
}

impl UnitOfTime {
    pub const ALL: [UnitOfTime; 4] = [
        UnitOfTime::Seconds,
        UnitOfTime::Milliseconds,
        UnitOfTime::Microseconds,
        UnitOfTime::Nanoseconds,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Seconds => "seconds",
            Self::Milliseconds => "milliseconds",
            Self::Microseconds => "microseconds",
            Self::Nanoseconds => "nanoseconds",
        }
    }

    /// Abbreviation the archiver expects in the `UnitofTime` property
    pub fn property_value(&self) -> &'static str {
        match self {
            Self::Seconds => "s",
            Self::Milliseconds => "ms",
            Self::Microseconds => "us",
            Self::Nanoseconds => "ns",
        }
    }
}

impl fmt::Display for UnitOfTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitOfTime {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|unit| unit.as_str() == wanted)
            .ok_or_else(|| {
                DriverError::Validation(format!(
                    "unit of time must be one of seconds, milliseconds, microseconds, nanoseconds; got '{}'",
                    s
                ))
            })
    }
}

/// `at` as an integer count of `unit` since the Unix epoch
pub fn timestamp_in(unit: UnitOfTime, at: &DateTime<Utc>) -> i64 {
    match unit {
        UnitOfTime::Seconds => at.timestamp(),
        UnitOfTime::Milliseconds => at.timestamp_millis(),
        UnitOfTime::Microseconds => at.timestamp_micros(),
        // out of range after 2262
        UnitOfTime::Nanoseconds => at.timestamp_nanos_opt().unwrap_or(i64::MAX),
    }
}

pub fn now_as(unit: UnitOfTime) -> i64 {
    timestamp_in(unit, &Utc::now())
}
