//! Statistic periods and their local-time boundaries.
//!
//! Every period is anchored to a park's own timezone: a "day" is the local
//! calendar day, not the collection server's.

use crate::error::{EngineError, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl Granularity {
    pub const ALL: [Granularity; 5] = [
        Granularity::Hour,
        Granularity::Day,
        Granularity::Week,
        Granularity::Month,
        Granularity::Year,
    ];

    /// Granularities built by rolling up daily rows.
    pub const ROLLUPS: [Granularity; 3] = [Granularity::Week, Granularity::Month, Granularity::Year];

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Hour => "hourly",
            Granularity::Day => "daily",
            Granularity::Week => "weekly",
            Granularity::Month => "monthly",
            Granularity::Year => "yearly",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Granularity {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hour" | "hourly" => Ok(Granularity::Hour),
            "day" | "daily" => Ok(Granularity::Day),
            "week" | "weekly" => Ok(Granularity::Week),
            "month" | "monthly" => Ok(Granularity::Month),
            "year" | "yearly" => Ok(Granularity::Year),
            other => Err(EngineError::Malformed(format!("unknown granularity '{other}'"))),
        }
    }
}

/// A single statistics period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Period {
    Hour { date: NaiveDate, hour: u32 },
    Day(NaiveDate),
    Week { iso_year: i32, week: u32 },
    Month { year: i32, month: u32 },
    Year(i32),
}

impl Period {
    /// The period of `granularity` containing `date`. Hourly periods start
    /// at local midnight of `date`.
    pub fn containing(granularity: Granularity, date: NaiveDate) -> Self {
        match granularity {
            Granularity::Hour => Period::Hour { date, hour: 0 },
            Granularity::Day => Period::Day(date),
            Granularity::Week => {
                let iso = date.iso_week();
                Period::Week {
                    iso_year: iso.year(),
                    week: iso.week(),
                }
            }
            Granularity::Month => Period::Month {
                year: date.year(),
                month: date.month(),
            },
            Granularity::Year => Period::Year(date.year()),
        }
    }

    pub fn granularity(&self) -> Granularity {
        match self {
            Period::Hour { .. } => Granularity::Hour,
            Period::Day(_) => Granularity::Day,
            Period::Week { .. } => Granularity::Week,
            Period::Month { .. } => Granularity::Month,
            Period::Year(_) => Granularity::Year,
        }
    }

    /// Storage key, unique within a granularity.
    pub fn key(&self) -> String {
        match self {
            Period::Hour { date, hour } => format!("{}T{:02}", date.format("%Y-%m-%d"), hour),
            Period::Day(date) => date.format("%Y-%m-%d").to_string(),
            Period::Week { iso_year, week } => format!("{iso_year}-W{week:02}"),
            Period::Month { year, month } => format!("{year}-{month:02}"),
            Period::Year(year) => format!("{year}"),
        }
    }

    /// First and last local calendar day of the period.
    pub fn date_range(&self) -> (NaiveDate, NaiveDate) {
        match *self {
            Period::Hour { date, .. } | Period::Day(date) => (date, date),
            Period::Week { iso_year, week } => {
                let start = NaiveDate::from_isoywd_opt(iso_year, week, Weekday::Mon)
                    .unwrap_or(NaiveDate::MIN);
                (start, start + Duration::days(6))
            }
            Period::Month { year, month } => {
                let start = NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(NaiveDate::MIN);
                let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
                let next = NaiveDate::from_ymd_opt(next_year, next_month, 1).unwrap_or(NaiveDate::MAX);
                (start, next.pred_opt().unwrap_or(start))
            }
            Period::Year(year) => (
                NaiveDate::from_ymd_opt(year, 1, 1).unwrap_or(NaiveDate::MIN),
                NaiveDate::from_ymd_opt(year, 12, 31).unwrap_or(NaiveDate::MAX),
            ),
        }
    }

    /// Every local calendar day the period covers.
    pub fn days(&self) -> Vec<NaiveDate> {
        let (first, last) = self.date_range();
        first.iter_days().take_while(|d| *d <= last).collect()
    }

    /// Local wall-clock bounds `[start, end)`.
    pub fn local_bounds(&self) -> (NaiveDateTime, NaiveDateTime) {
        match *self {
            Period::Hour { date, hour } => {
                let start = date.and_time(NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or(NaiveTime::MIN));
                (start, start + Duration::hours(1))
            }
            _ => {
                let (first, last) = self.date_range();
                (
                    first.and_time(NaiveTime::MIN),
                    (last + Duration::days(1)).and_time(NaiveTime::MIN),
                )
            }
        }
    }

    /// UTC bounds `[start, end)` of the period in `tz`.
    pub fn utc_bounds(&self, tz: Tz) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let (start, end) = self.local_bounds();
        Ok((local_to_utc(tz, start)?, local_to_utc(tz, end)?))
    }

    /// The immediately preceding period of the same granularity.
    pub fn previous(&self) -> Self {
        match *self {
            Period::Hour { date, hour } => {
                if hour == 0 {
                    Period::Hour {
                        date: date.pred_opt().unwrap_or(date),
                        hour: 23,
                    }
                } else {
                    Period::Hour { date, hour: hour - 1 }
                }
            }
            Period::Day(date) => Period::Day(date.pred_opt().unwrap_or(date)),
            Period::Week { .. } => {
                let (start, _) = self.date_range();
                Period::containing(Granularity::Week, start - Duration::days(7))
            }
            Period::Month { year, month } => {
                if month == 1 {
                    Period::Month { year: year - 1, month: 12 }
                } else {
                    Period::Month { year, month: month - 1 }
                }
            }
            Period::Year(year) => Period::Year(year - 1),
        }
    }

    /// The 24 local hours of `date`.
    pub fn hours_of(date: NaiveDate) -> impl Iterator<Item = Period> {
        (0..24).map(move |hour| Period::Hour { date, hour })
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.granularity(), self.key())
    }
}

/// Maps a local wall-clock time to UTC. Ambiguous times take the earlier
/// instant; times inside a DST gap move forward to the first valid minute.
pub fn local_to_utc(tz: Tz, local: NaiveDateTime) -> Result<DateTime<Utc>> {
    let mut candidate = local;
    for _ in 0..=8 {
        if let Some(dt) = tz.from_local_datetime(&candidate).earliest() {
            return Ok(dt.with_timezone(&Utc));
        }
        candidate += Duration::minutes(15);
    }
    Err(EngineError::Malformed(format!(
        "local time {local} does not exist in {tz}"
    )))
}

/// Local calendar date of a UTC instant in `tz`.
pub fn local_date(tz: Tz, at: DateTime<Utc>) -> NaiveDate {
    at.with_timezone(&tz).date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_keys() {
        let d = date(2024, 7, 4);
        assert_eq!(Period::Hour { date: d, hour: 9 }.key(), "2024-07-04T09");
        assert_eq!(Period::Day(d).key(), "2024-07-04");
        assert_eq!(Period::containing(Granularity::Week, d).key(), "2024-W27");
        assert_eq!(Period::containing(Granularity::Month, d).key(), "2024-07");
        assert_eq!(Period::containing(Granularity::Year, d).key(), "2024");
    }

    #[test]
    fn test_week_spans_monday_to_sunday() {
        let week = Period::containing(Granularity::Week, date(2024, 7, 4));
        assert_eq!(week.date_range(), (date(2024, 7, 1), date(2024, 7, 7)));
        assert_eq!(week.days().len(), 7);
    }

    #[test]
    fn test_iso_week_crossing_year() {
        // 2024-12-30 belongs to ISO week 1 of 2025.
        let week = Period::containing(Granularity::Week, date(2024, 12, 30));
        assert_eq!(week.key(), "2025-W01");
        assert_eq!(week.previous().key(), "2024-W52");
    }

    #[test]
    fn test_month_range_and_previous() {
        let feb = Period::containing(Granularity::Month, date(2024, 2, 10));
        assert_eq!(feb.date_range(), (date(2024, 2, 1), date(2024, 2, 29)));
        let jan = Period::containing(Granularity::Month, date(2024, 1, 10));
        assert_eq!(jan.previous().key(), "2023-12");
    }

    #[test]
    fn test_previous_hour_and_day() {
        let d = date(2024, 7, 4);
        assert_eq!(Period::Hour { date: d, hour: 0 }.previous().key(), "2024-07-03T23");
        assert_eq!(Period::Day(d).previous().key(), "2024-07-03");
        assert_eq!(Period::Year(2024).previous().key(), "2023");
    }

    #[test]
    fn test_day_bounds_follow_park_timezone() {
        let tz: Tz = "America/Los_Angeles".parse().unwrap();
        let (start, end) = Period::Day(date(2024, 1, 15)).utc_bounds(tz).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 1, 16, 8, 0, 0).unwrap());
    }

    #[test]
    fn test_dst_spring_forward_day_is_23_hours() {
        let tz: Tz = "America/New_York".parse().unwrap();
        let (start, end) = Period::Day(date(2024, 3, 10)).utc_bounds(tz).unwrap();
        assert_eq!((end - start).num_hours(), 23);
    }

    #[test]
    fn test_gap_hour_moves_forward() {
        let tz: Tz = "America/New_York".parse().unwrap();
        let (start, _) = Period::Hour { date: date(2024, 3, 10), hour: 2 }.utc_bounds(tz).unwrap();
        // 02:00 does not exist; 03:00 EDT is 07:00 UTC.
        assert_eq!(start.hour(), 7);
    }

    #[test]
    fn test_local_date() {
        let tz: Tz = "America/Los_Angeles".parse().unwrap();
        let at = Utc.with_ymd_and_hms(2024, 1, 16, 7, 30, 0).unwrap();
        assert_eq!(local_date(tz, at), date(2024, 1, 15));
    }
}
