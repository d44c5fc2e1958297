//! Calendar arithmetic for notification scheduling.
//!
//! Pure functions over an injected wall-clock reading. Nothing in this
//! module reads the system clock; the caller passes the current instant so
//! the whole scheduling path is a function of its inputs.

use chrono::{DateTime, Duration, Timelike, Utc};

/// Pin `day` to the given time of day, zeroing seconds and nanoseconds.
///
/// Hour and minute are validated at the configuration boundary; out-of-range
/// values leave `day` unchanged.
pub fn at_time_of_day(day: DateTime<Utc>, hour: u32, minute: u32) -> DateTime<Utc> {
    day.with_hour(hour)
        .and_then(|d| d.with_minute(minute))
        .and_then(|d| d.with_second(0))
        .and_then(|d| d.with_nanosecond(0))
        .unwrap_or(day)
}

/// The target time of day on the day after `from`.
///
/// Always advances exactly one calendar day; never returns a same-day
/// instant. The same-day decision is [`is_before_time_of_day`].
pub fn next_occurrence(from: DateTime<Utc>, hour: u32, minute: u32) -> DateTime<Utc> {
    at_time_of_day(from + Duration::days(1), hour, minute)
}

/// True iff `from`'s time of day is strictly earlier than `hour:minute`.
///
/// Used to decide whether a schedule may still start "today".
pub fn is_before_time_of_day(from: DateTime<Utc>, hour: u32, minute: u32) -> bool {
    from < at_time_of_day(from, hour, minute)
}

/// One step of a countdown schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextOccurrence {
    pub at: DateTime<Utc>,
    /// Occurrences left after this one. The caller stops scheduling at 0.
    pub remaining: u32,
}

/// Next occurrence of a countdown schedule with `total` occurrences.
///
/// On the first call (`remaining == total`) the occurrence lands today when
/// the target time is still ahead; every other call advances one day from
/// `from`. Decrements the countdown; terminal when it reaches 0.
pub fn next_with_countdown(
    from: DateTime<Utc>,
    hour: u32,
    minute: u32,
    total: u32,
    remaining: u32,
) -> NextOccurrence {
    let at = if remaining == total && is_before_time_of_day(from, hour, minute) {
        at_time_of_day(from, hour, minute)
    } else {
        next_occurrence(from, hour, minute)
    };
    NextOccurrence {
        at,
        remaining: remaining.saturating_sub(1),
    }
}

/// Stateless periodic variant: next occurrence of `hour:minute` (today if
/// still ahead, otherwise tomorrow), or `None` once it would fall past
/// `study_end`.
pub fn next_periodic_before(
    from: DateTime<Utc>,
    study_end: DateTime<Utc>,
    hour: u32,
    minute: u32,
) -> Option<DateTime<Utc>> {
    let next = if is_before_time_of_day(from, hour, minute) {
        at_time_of_day(from, hour, minute)
    } else {
        next_occurrence(from, hour, minute)
    };
    (next <= study_end).then_some(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone};

    fn instant(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, minute, 0).unwrap()
    }

    #[test]
    fn next_occurrence_walks_consecutive_days() {
        let mut cursor = instant(2, 10, 17);
        let mut days = Vec::new();
        for _ in 0..7 {
            cursor = next_occurrence(cursor, 19, 30);
            assert_eq!(cursor.hour(), 19);
            assert_eq!(cursor.minute(), 30);
            days.push(cursor.day());
        }
        assert_eq!(days, vec![3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn before_time_of_day_is_strict() {
        assert!(is_before_time_of_day(instant(2, 10, 0), 19, 0));
        assert!(!is_before_time_of_day(instant(2, 20, 0), 19, 0));
        assert!(!is_before_time_of_day(instant(2, 19, 0), 19, 0));
    }

    #[test]
    fn countdown_starts_today_when_target_still_ahead() {
        let start = instant(2, 10, 0);
        let mut remaining = 7;
        let mut cursor = start;
        let mut occurrences = Vec::new();
        while remaining > 0 {
            let next = next_with_countdown(cursor, 19, 0, 7, remaining);
            occurrences.push(next.at);
            cursor = next.at;
            remaining = next.remaining;
        }
        assert_eq!(occurrences.len(), 7);
        // first occurrence on day 0, at the target time
        assert_eq!(occurrences[0], instant(2, 19, 0));
        assert_eq!(occurrences[6], instant(8, 19, 0));
    }

    #[test]
    fn countdown_starts_tomorrow_when_target_passed() {
        let start = instant(2, 20, 0);
        let mut remaining = 7;
        let mut cursor = start;
        let mut occurrences = Vec::new();
        while remaining > 0 {
            let next = next_with_countdown(cursor, 19, 0, 7, remaining);
            occurrences.push(next.at);
            cursor = next.at;
            remaining = next.remaining;
        }
        assert_eq!(occurrences.len(), 7);
        assert_eq!(occurrences[0], instant(3, 19, 0));
        assert_eq!(occurrences[6], instant(9, 19, 0));
    }

    #[test]
    fn periodic_lands_today_before_target() {
        let end = instant(10, 23, 59);
        let next = next_periodic_before(instant(2, 10, 0), end, 19, 0);
        assert_eq!(next, Some(instant(2, 19, 0)));
    }

    #[test]
    fn periodic_lands_tomorrow_after_target() {
        let end = instant(10, 23, 59);
        let next = next_periodic_before(instant(2, 20, 0), end, 19, 0);
        assert_eq!(next, Some(instant(3, 19, 0)));
    }

    #[test]
    fn periodic_stops_at_study_end() {
        // study already over
        let ended = instant(1, 23, 59);
        assert_eq!(next_periodic_before(instant(2, 10, 0), ended, 19, 0), None);
        // next occurrence would overshoot the end
        let end = instant(2, 11, 0);
        assert_eq!(next_periodic_before(instant(2, 10, 0), end, 23, 0), None);
    }
}
