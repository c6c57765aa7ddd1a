//! Timeframe parsing and bucket alignment.
//!
//! Strategy throttling works in time buckets aligned to the strategy's minimum
//! timeframe. Minute and hour buckets truncate in UTC; day, week, quarter and
//! year buckets align to US-market boundaries in America/New_York.

use crate::error::{AlertError, Result};
use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, TimeZone, Utc};
use chrono_tz::America::New_York;

/// A strategy's minimum evaluation timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timeframe {
    Minutes(u32),
    Hours(u32),
    Days(u32),
    Weeks(u32),
    Quarters(u32),
    Years(u32),
}

/// 1970-01-05, the first Monday on or after the epoch. Multi-week buckets
/// index from here so every bucket boundary lands on a Monday.
fn anchor_monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 5).expect("valid calendar date")
}

fn epoch_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).expect("valid calendar date")
}

impl Timeframe {
    /// Parse a timeframe string such as `"15m"`, `"4h"`, `"1d"`, `"2w"`,
    /// `"1q"` or `"1y"`.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.len() < 2 || !s.is_ascii() {
            return Err(AlertError::Config(format!("invalid timeframe: {s:?}")));
        }
        let (count, unit) = s.split_at(s.len() - 1);
        let n: u32 = count
            .parse()
            .map_err(|_| AlertError::Config(format!("invalid timeframe count: {s:?}")))?;
        if n == 0 {
            return Err(AlertError::Config(format!("timeframe count must be positive: {s:?}")));
        }
        match unit {
            "m" => Ok(Timeframe::Minutes(n)),
            "h" => Ok(Timeframe::Hours(n)),
            "d" => Ok(Timeframe::Days(n)),
            "w" => Ok(Timeframe::Weeks(n)),
            "q" => Ok(Timeframe::Quarters(n)),
            "y" => Ok(Timeframe::Years(n)),
            other => Err(AlertError::Config(format!("unknown timeframe unit: {other:?}"))),
        }
    }

    /// Start of the bucket containing `t`.
    ///
    /// Idempotent (`bucket_start(bucket_start(t)) == bucket_start(t)`) and
    /// monotone in `t`.
    pub fn bucket_start(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Timeframe::Minutes(n) => truncate_utc(t, i64::from(n) * 60),
            Timeframe::Hours(n) => truncate_utc(t, i64::from(n) * 3600),
            Timeframe::Days(n) => {
                let date = t.with_timezone(&New_York).date_naive();
                let day_index = (date - epoch_date()).num_days();
                let bucket = day_index.div_euclid(i64::from(n)) * i64::from(n);
                et_midnight(epoch_date() + Duration::days(bucket))
            }
            Timeframe::Weeks(n) => {
                let date = t.with_timezone(&New_York).date_naive();
                let monday =
                    date - Duration::days(i64::from(date.weekday().num_days_from_monday()));
                let week_index = (monday - anchor_monday()).num_days().div_euclid(7);
                let bucket = week_index.div_euclid(i64::from(n)) * i64::from(n);
                et_midnight(anchor_monday() + Duration::weeks(bucket))
            }
            Timeframe::Quarters(n) => {
                let et = t.with_timezone(&New_York);
                let quarter_index = (et.year() - 1970) * 4 + (et.month0() / 3) as i32;
                let bucket = quarter_index.div_euclid(n as i32) * n as i32;
                let year = 1970 + bucket.div_euclid(4);
                let month = bucket.rem_euclid(4) as u32 * 3 + 1;
                et_midnight(NaiveDate::from_ymd_opt(year, month, 1).expect("valid calendar date"))
            }
            Timeframe::Years(n) => {
                let et = t.with_timezone(&New_York);
                let year = (et.year() - 1970).div_euclid(n as i32) * n as i32 + 1970;
                et_midnight(NaiveDate::from_ymd_opt(year, 1, 1).expect("valid calendar date"))
            }
        }
    }

    /// Bucket start in epoch milliseconds (the unit the shared cache stores).
    pub fn bucket_start_ms(&self, t: DateTime<Utc>) -> i64 {
        self.bucket_start(t).timestamp_millis()
    }
}

impl std::str::FromStr for Timeframe {
    type Err = AlertError;

    fn from_str(s: &str) -> Result<Self> {
        Timeframe::parse(s)
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Timeframe::Minutes(n) => write!(f, "{n}m"),
            Timeframe::Hours(n) => write!(f, "{n}h"),
            Timeframe::Days(n) => write!(f, "{n}d"),
            Timeframe::Weeks(n) => write!(f, "{n}w"),
            Timeframe::Quarters(n) => write!(f, "{n}q"),
            Timeframe::Years(n) => write!(f, "{n}y"),
        }
    }
}

/// Truncate to a multiple of `period_secs` since the epoch, in UTC.
fn truncate_utc(t: DateTime<Utc>, period_secs: i64) -> DateTime<Utc> {
    let ts = t.timestamp();
    let start = ts.div_euclid(period_secs) * period_secs;
    Utc.timestamp_opt(start, 0).single().unwrap_or(t)
}

/// Midnight of `date` in America/New_York, as UTC.
///
/// US DST transitions happen at 02:00 local, so midnight is never skipped;
/// the Ambiguous/None arms are kept for completeness.
fn et_midnight(date: NaiveDate) -> DateTime<Utc> {
    let naive = date.and_hms_opt(0, 0, 0).expect("midnight exists");
    match New_York.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            let shifted = naive + Duration::hours(1);
            New_York
                .from_local_datetime(&shifted)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_valid() {
        assert_eq!(Timeframe::parse("15m").unwrap(), Timeframe::Minutes(15));
        assert_eq!(Timeframe::parse("4h").unwrap(), Timeframe::Hours(4));
        assert_eq!(Timeframe::parse("1d").unwrap(), Timeframe::Days(1));
        assert_eq!(Timeframe::parse("2w").unwrap(), Timeframe::Weeks(2));
        assert_eq!(Timeframe::parse("1q").unwrap(), Timeframe::Quarters(1));
        assert_eq!(Timeframe::parse("1y").unwrap(), Timeframe::Years(1));
        assert_eq!(Timeframe::parse(" 30m ").unwrap(), Timeframe::Minutes(30));
    }

    #[test]
    fn test_parse_invalid() {
        for bad in ["", "m", "0m", "5x", "-1d", "1.5h", "d1"] {
            assert!(Timeframe::parse(bad).is_err(), "expected error for {bad:?}");
        }
    }

    #[test]
    fn test_display_round_trip() {
        for tf in [
            Timeframe::Minutes(15),
            Timeframe::Hours(4),
            Timeframe::Days(3),
            Timeframe::Weeks(2),
            Timeframe::Quarters(1),
            Timeframe::Years(5),
        ] {
            assert_eq!(Timeframe::parse(&tf.to_string()).unwrap(), tf);
        }
    }

    #[test]
    fn test_minute_truncation() {
        let tf = Timeframe::Minutes(15);
        assert_eq!(
            tf.bucket_start(utc("2025-03-12T12:34:56Z")),
            utc("2025-03-12T12:30:00Z")
        );
        assert_eq!(
            tf.bucket_start(utc("2025-03-12T12:00:00Z")),
            utc("2025-03-12T12:00:00Z")
        );
    }

    #[test]
    fn test_hour_truncation() {
        let tf = Timeframe::Hours(4);
        assert_eq!(
            tf.bucket_start(utc("2025-03-12T13:10:00Z")),
            utc("2025-03-12T12:00:00Z")
        );
    }

    #[test]
    fn test_daily_dst_spring_forward() {
        // 2025-03-09 is the US spring-forward Sunday. 06:00 EST == 11:00 UTC.
        let tf = Timeframe::Days(1);
        let morning = tf.bucket_start(utc("2025-03-09T11:00:00Z"));
        // Midnight ET that day is still EST (UTC-5).
        assert_eq!(morning, utc("2025-03-09T05:00:00Z"));

        // 23:59 ET the same day is EDT (UTC-4), i.e. 03:59 UTC next day.
        let evening = tf.bucket_start(utc("2025-03-10T03:59:00Z"));
        assert_eq!(evening, morning);
    }

    #[test]
    fn test_weekly_aligns_to_monday() {
        // 2025-03-12 is a Wednesday; the week starts Monday 2025-03-10 EDT.
        let tf = Timeframe::Weeks(1);
        assert_eq!(
            tf.bucket_start(utc("2025-03-12T15:00:00Z")),
            utc("2025-03-10T04:00:00Z")
        );
    }

    #[test]
    fn test_multi_week_anchor_is_monday() {
        let tf = Timeframe::Weeks(2);
        let start = tf.bucket_start(utc("2025-03-12T15:00:00Z"));
        let et_date = start.with_timezone(&New_York).date_naive();
        assert_eq!(et_date.weekday(), chrono::Weekday::Mon);
        assert_eq!((et_date - anchor_monday()).num_days().rem_euclid(14), 0);
    }

    #[test]
    fn test_quarterly() {
        let tf = Timeframe::Quarters(1);
        // 2025-05-15 falls in Q2, which starts April 1 00:00 EDT.
        assert_eq!(
            tf.bucket_start(utc("2025-05-15T12:00:00Z")),
            utc("2025-04-01T04:00:00Z")
        );
    }

    #[test]
    fn test_yearly() {
        let tf = Timeframe::Years(1);
        assert_eq!(
            tf.bucket_start(utc("2025-05-15T12:00:00Z")),
            utc("2025-01-01T05:00:00Z")
        );
    }

    #[test]
    fn test_multi_day_floors_day_index() {
        let tf = Timeframe::Days(2);
        let start = tf.bucket_start(utc("2025-03-12T15:00:00Z"));
        let et_date = start.with_timezone(&New_York).date_naive();
        assert_eq!((et_date - epoch_date()).num_days().rem_euclid(2), 0);
    }

    #[test]
    fn test_idempotent_and_monotone() {
        let frames = [
            Timeframe::Minutes(5),
            Timeframe::Minutes(90),
            Timeframe::Hours(1),
            Timeframe::Days(1),
            Timeframe::Days(3),
            Timeframe::Weeks(1),
            Timeframe::Weeks(2),
            Timeframe::Quarters(1),
            Timeframe::Quarters(2),
            Timeframe::Years(1),
        ];
        let times = [
            utc("2024-12-31T23:59:59Z"),
            utc("2025-01-01T00:00:00Z"),
            utc("2025-03-09T06:59:00Z"),
            utc("2025-03-09T07:01:00Z"),
            utc("2025-06-15T12:00:00Z"),
            utc("2025-11-02T05:30:00Z"),
        ];
        for tf in frames {
            let mut prev: Option<DateTime<Utc>> = None;
            for t in times {
                let b = tf.bucket_start(t);
                assert!(b <= t, "{tf}: bucket {b} after input {t}");
                assert_eq!(tf.bucket_start(b), b, "{tf}: not idempotent at {t}");
                if let Some(p) = prev {
                    assert!(p <= b, "{tf}: not monotone at {t}");
                }
                prev = Some(b);
            }
        }
    }
}
