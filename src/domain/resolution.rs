//! Data resolutions and time rounding.

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::fmt;

/// Granularity of a data subscription, ordered finest to coarsest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Resolution {
    Tick,
    Second,
    Minute,
    Hour,
    Daily,
}

impl Resolution {
    pub fn to_duration(self) -> Duration {
        match self {
            Resolution::Tick => Duration::zero(),
            Resolution::Second => Duration::seconds(1),
            Resolution::Minute => Duration::minutes(1),
            Resolution::Hour => Duration::hours(1),
            Resolution::Daily => Duration::days(1),
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "tick" => Some(Resolution::Tick),
            "second" => Some(Resolution::Second),
            "minute" => Some(Resolution::Minute),
            "hour" => Some(Resolution::Hour),
            "daily" | "day" => Some(Resolution::Daily),
            _ => None,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resolution::Tick => "Tick",
            Resolution::Second => "Second",
            Resolution::Minute => "Minute",
            Resolution::Hour => "Hour",
            Resolution::Daily => "Daily",
        };
        f.write_str(name)
    }
}

/// Round a naive time down to a multiple of `increment` counted from midnight.
pub fn round_down(time: NaiveDateTime, increment: Duration) -> NaiveDateTime {
    if increment <= Duration::zero() {
        return time;
    }
    let midnight = time.date().and_hms_opt(0, 0, 0).unwrap_or(time);
    if increment >= Duration::days(1) {
        return midnight;
    }
    let since_midnight = (time - midnight).num_nanoseconds().unwrap_or(0);
    let step = increment.num_nanoseconds().unwrap_or(1).max(1);
    midnight + Duration::nanoseconds(since_midnight - since_midnight % step)
}

/// Round a UTC instant down to `increment` as observed in `time_zone`.
///
/// Daily and hourly boundaries fall on exchange-local clock times, so the
/// rounding happens on the local wall clock before converting back.
pub fn round_down_in_time_zone(
    time: DateTime<Utc>,
    increment: Duration,
    time_zone: Tz,
) -> DateTime<Utc> {
    let local = time.with_timezone(&time_zone).naive_local();
    let rounded = round_down(local, increment);
    match time_zone.from_local_datetime(&rounded).earliest() {
        Some(dt) => dt.with_timezone(&Utc),
        None => time,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn naive(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 4)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn resolutions_order_finest_first() {
        assert!(Resolution::Tick < Resolution::Second);
        assert!(Resolution::Minute < Resolution::Daily);
        assert_eq!(
            [Resolution::Hour, Resolution::Minute].iter().min(),
            Some(&Resolution::Minute)
        );
    }

    #[test]
    fn round_down_to_minute() {
        assert_eq!(round_down(naive(9, 31, 45), Duration::minutes(1)), naive(9, 31, 0));
        assert_eq!(round_down(naive(9, 31, 0), Duration::minutes(5)), naive(9, 30, 0));
    }

    #[test]
    fn round_down_daily_goes_to_midnight() {
        assert_eq!(round_down(naive(16, 0, 0), Duration::days(1)), naive(0, 0, 0));
    }

    #[test]
    fn round_down_in_exchange_time_zone() {
        // 2024-03-04 21:00 UTC is 16:00 in New York; the daily boundary is local midnight.
        let utc = Utc.with_ymd_and_hms(2024, 3, 4, 21, 0, 0).unwrap();
        let rounded = round_down_in_time_zone(utc, Duration::days(1), chrono_tz::America::New_York);
        assert_eq!(rounded, Utc.with_ymd_and_hms(2024, 3, 4, 5, 0, 0).unwrap());
    }

    #[test]
    fn parse_resolution() {
        assert_eq!(Resolution::parse("Minute"), Some(Resolution::Minute));
        assert_eq!(Resolution::parse("day"), Some(Resolution::Daily));
        assert_eq!(Resolution::parse("weekly"), None);
    }
}
