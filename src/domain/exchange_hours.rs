//! Exchange trading hours and time zone.

use chrono::{
    DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc, Weekday,
};
use chrono_tz::Tz;

/// Regular session of an exchange, expressed on its local wall clock.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeHours {
    pub time_zone: Tz,
    pub open: NaiveTime,
    pub close: NaiveTime,
    /// Trades every day around the clock (crypto, most FX venues).
    pub always_open: bool,
}

impl ExchangeHours {
    pub fn new(time_zone: Tz, open: NaiveTime, close: NaiveTime) -> Self {
        ExchangeHours {
            time_zone,
            open,
            close,
            always_open: false,
        }
    }

    pub fn always_open(time_zone: Tz) -> Self {
        ExchangeHours {
            time_zone,
            open: NaiveTime::MIN,
            close: NaiveTime::MIN,
            always_open: true,
        }
    }

    /// New York cash equity session, 09:30 to 16:00.
    pub fn us_equity() -> Self {
        let open = NaiveTime::from_hms_opt(9, 30, 0).unwrap_or(NaiveTime::MIN);
        let close = NaiveTime::from_hms_opt(16, 0, 0).unwrap_or(NaiveTime::MIN);
        ExchangeHours::new(chrono_tz::America::New_York, open, close)
    }

    pub fn local_time(&self, time: DateTime<Utc>) -> NaiveDateTime {
        time.with_timezone(&self.time_zone).naive_local()
    }

    pub fn to_utc(&self, local: NaiveDateTime) -> DateTime<Utc> {
        self.time_zone
            .from_local_datetime(&local)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&local))
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        self.always_open || !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
    }

    /// Close of the session on a local `date`. Round-the-clock venues close at
    /// the following local midnight.
    pub fn market_close_on(&self, date: NaiveDate) -> DateTime<Utc> {
        if self.always_open {
            let next = date.succ_opt().unwrap_or(date);
            return self.to_utc(next.and_time(NaiveTime::MIN));
        }
        self.to_utc(date.and_time(self.close))
    }

    /// First session close strictly after `time`.
    pub fn next_market_close(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        let mut date = self.local_time(time).date();
        for _ in 0..14 {
            if self.is_trading_day(date) {
                let close = self.market_close_on(date);
                if close > time {
                    return close;
                }
            }
            match date.succ_opt() {
                Some(next) => date = next,
                None => break,
            }
        }
        time + Duration::days(1)
    }

    pub fn is_open(&self, time: DateTime<Utc>) -> bool {
        if self.always_open {
            return true;
        }
        let local = self.local_time(time);
        self.is_trading_day(local.date()) && local.time() >= self.open && local.time() < self.close
    }
}

impl Default for ExchangeHours {
    fn default() -> Self {
        ExchangeHours::always_open(chrono_tz::UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_close_same_day() {
        let hours = ExchangeHours::us_equity();
        // Monday 15:00 UTC = 10:00 New York
        let now = Utc.with_ymd_and_hms(2024, 3, 4, 15, 0, 0).unwrap();
        assert_eq!(
            hours.next_market_close(now),
            Utc.with_ymd_and_hms(2024, 3, 4, 21, 0, 0).unwrap()
        );
    }

    #[test]
    fn next_close_skips_weekend() {
        let hours = ExchangeHours::us_equity();
        // Friday after the close
        let now = Utc.with_ymd_and_hms(2024, 3, 8, 22, 0, 0).unwrap();
        assert_eq!(
            hours.next_market_close(now),
            Utc.with_ymd_and_hms(2024, 3, 11, 20, 0, 0).unwrap()
        );
    }

    #[test]
    fn always_open_closes_at_midnight() {
        let hours = ExchangeHours::default();
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(
            hours.market_close_on(date),
            Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap()
        );
        assert!(hours.is_open(Utc.with_ymd_and_hms(2024, 3, 9, 3, 0, 0).unwrap()));
    }

    #[test]
    fn equity_session_open_check() {
        let hours = ExchangeHours::us_equity();
        assert!(hours.is_open(Utc.with_ymd_and_hms(2024, 3, 4, 15, 0, 0).unwrap()));
        assert!(!hours.is_open(Utc.with_ymd_and_hms(2024, 3, 4, 22, 0, 0).unwrap()));
    }
}
