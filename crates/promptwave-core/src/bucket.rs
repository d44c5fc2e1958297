//! Time-of-day buckets.
//!
//! A bucket is a contiguous time-of-day window written as `"HH:MM-HH:MM"`
//! (single-digit hours are accepted, study definitions contain both forms).
//! Buckets are used to spread randomized notifications across the day.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::calendar::at_time_of_day;
use crate::error::ScheduleError;

/// A same-day time window, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeBucket {
    start_hour: u32,
    start_minute: u32,
    end_hour: u32,
    end_minute: u32,
}

impl TimeBucket {
    /// Concrete bounds of this bucket on the calendar day of `day`.
    pub fn bounds_on(&self, day: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        (
            at_time_of_day(day, self.start_hour, self.start_minute),
            at_time_of_day(day, self.end_hour, self.end_minute),
        )
    }

    /// Whether `instant` falls inside this bucket on its own calendar day.
    /// Inclusive on both ends.
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        let (start, end) = self.bounds_on(instant);
        start <= instant && instant <= end
    }
}

fn parse_time_of_day(part: &str, spec: &str) -> Result<(u32, u32), ScheduleError> {
    let malformed = |message: &str| ScheduleError::MalformedBucket {
        spec: spec.to_string(),
        message: message.to_string(),
    };

    let (hour, minute) = part
        .split_once(':')
        .ok_or_else(|| malformed("expected HH:MM"))?;
    let hour: u32 = hour.parse().map_err(|_| malformed("invalid hour"))?;
    let minute: u32 = minute.parse().map_err(|_| malformed("invalid minute"))?;
    if hour > 23 || minute > 59 {
        return Err(malformed("time of day out of range"));
    }
    Ok((hour, minute))
}

impl FromStr for TimeBucket {
    type Err = ScheduleError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = spec.split('-').collect();
        if parts.len() != 2 {
            return Err(ScheduleError::MalformedBucket {
                spec: spec.to_string(),
                message: "expected exactly two HH:MM parts separated by '-'".to_string(),
            });
        }
        let (start_hour, start_minute) = parse_time_of_day(parts[0], spec)?;
        let (end_hour, end_minute) = parse_time_of_day(parts[1], spec)?;
        Ok(TimeBucket {
            start_hour,
            start_minute,
            end_hour,
            end_minute,
        })
    }
}

impl fmt::Display for TimeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}-{:02}:{:02}",
            self.start_hour, self.start_minute, self.end_hour, self.end_minute
        )
    }
}

impl TryFrom<String> for TimeBucket {
    type Error = ScheduleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeBucket> for String {
    fn from(bucket: TimeBucket) -> Self {
        bucket.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn instant(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, minute, 0).unwrap()
    }

    #[test]
    fn parses_both_hour_forms() {
        let bucket: TimeBucket = "9:00-11:29".parse().unwrap();
        assert_eq!(bucket.to_string(), "09:00-11:29");
        let bucket: TimeBucket = "19:00-21:29".parse().unwrap();
        assert_eq!(bucket.to_string(), "19:00-21:29");
    }

    #[test]
    fn rejects_malformed_specs() {
        for spec in ["", "08:00", "08:00-12:00-16:00", "8-23", "25:00-26:00", "08:61-09:00"] {
            assert!(
                spec.parse::<TimeBucket>().is_err(),
                "expected '{spec}' to be rejected"
            );
        }
    }

    #[test]
    fn contains_is_inclusive_on_both_ends() {
        let bucket: TimeBucket = "08:00-23:00".parse().unwrap();
        assert!(bucket.contains(instant(10, 0)));
        assert!(bucket.contains(instant(22, 0)));
        assert!(bucket.contains(instant(8, 0)));
        assert!(bucket.contains(instant(23, 0)));
        assert!(!bucket.contains(instant(7, 59)));
        assert!(!bucket.contains(instant(23, 1)));
    }

    #[test]
    fn bounds_follow_the_reference_day() {
        let bucket: TimeBucket = "09:00-11:29".parse().unwrap();
        let (start, end) = bucket.bounds_on(instant(15, 45));
        assert_eq!(start, instant(9, 0));
        assert_eq!(end, instant(11, 29));
    }
}
