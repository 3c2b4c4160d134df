//! Budgeting windows.
//!
//! A window is the closed range `[start, end]` where `start` is midnight of
//! the first day and `end` is the last millisecond of the last day. All
//! computations are done on naive (server local) date-times.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Days, Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum Period {
    Daily,
    #[default]
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
    /// Currently behaves like `Weekly`.
    Custom,
}

impl Period {
    pub const ALL: [Period; 6] = [
        Period::Daily,
        Period::Weekly,
        Period::Monthly,
        Period::Quarterly,
        Period::Yearly,
        Period::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "DAILY",
            Self::Weekly => "WEEKLY",
            Self::Monthly => "MONTHLY",
            Self::Quarterly => "QUARTERLY",
            Self::Yearly => "YEARLY",
            Self::Custom => "CUSTOM",
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Period::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown period: {s}"))
    }
}

/// Returns the window of `period` that contains `reference`.
pub fn compute_window(period: Period, reference: NaiveDateTime) -> (NaiveDateTime, NaiveDateTime) {
    let day = reference.date();

    let (first, next) = match period {
        Period::Daily => (day, day + Days::new(1)),
        Period::Weekly | Period::Custom => {
            let monday = day - Days::new(u64::from(day.weekday().num_days_from_monday()));
            (monday, monday + Days::new(7))
        }
        Period::Monthly => {
            let first = first_of_month(day);
            (first, first_of_next_month(first))
        }
        Period::Quarterly => {
            let mut first = first_of_month(day);
            while first.month0() % 3 != 0 {
                first = first_of_month(first - Days::new(1));
            }
            let next = (0..3).fold(first, |d, _| first_of_next_month(d));
            (first, next)
        }
        Period::Yearly => {
            let first = day - Days::new(u64::from(day.ordinal0()));
            let later = first + Days::new(366);
            (first, later - Days::new(u64::from(later.ordinal0())))
        }
    };

    let start = first.and_time(NaiveTime::MIN);
    let end = next.and_time(NaiveTime::MIN) - Duration::milliseconds(1);
    (start, end)
}

fn first_of_month(day: NaiveDate) -> NaiveDate {
    day - Days::new(u64::from(day.day0()))
}

fn first_of_next_month(first: NaiveDate) -> NaiveDate {
    // day 32 of any month lands in the following month
    first_of_month(first + Days::new(32))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32, mi: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, mi, 0)
            .unwrap()
    }

    fn end_of(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_milli_opt(23, 59, 59, 999)
            .unwrap()
    }

    #[test]
    fn daily_covers_the_calendar_day() {
        let (start, end) = compute_window(Period::Daily, at(2024, 3, 14, 15, 9));
        assert_eq!(start, at(2024, 3, 14, 0, 0));
        assert_eq!(end, end_of(2024, 3, 14));
    }

    #[test]
    fn weekly_starts_on_monday() {
        // 2024-03-17 is a Sunday
        let (start, end) = compute_window(Period::Weekly, at(2024, 3, 17, 22, 0));
        assert_eq!(start, at(2024, 3, 11, 0, 0));
        assert_eq!(end, end_of(2024, 3, 17));

        let (start, _) = compute_window(Period::Weekly, at(2024, 3, 11, 0, 0));
        assert_eq!(start, at(2024, 3, 11, 0, 0));
    }

    #[test]
    fn custom_matches_weekly() {
        let now = at(2025, 1, 1, 9, 30);
        assert_eq!(
            compute_window(Period::Custom, now),
            compute_window(Period::Weekly, now)
        );
    }

    #[test]
    fn monthly_handles_leap_february() {
        let (start, end) = compute_window(Period::Monthly, at(2024, 2, 10, 8, 0));
        assert_eq!(start, at(2024, 2, 1, 0, 0));
        assert_eq!(end, end_of(2024, 2, 29));
    }

    #[test]
    fn quarterly_uses_calendar_quarters() {
        let (start, end) = compute_window(Period::Quarterly, at(2024, 8, 31, 12, 0));
        assert_eq!(start, at(2024, 7, 1, 0, 0));
        assert_eq!(end, end_of(2024, 9, 30));

        let (start, end) = compute_window(Period::Quarterly, at(2024, 12, 31, 23, 59));
        assert_eq!(start, at(2024, 10, 1, 0, 0));
        assert_eq!(end, end_of(2024, 12, 31));
    }

    #[test]
    fn yearly_spans_jan_to_dec() {
        let (start, end) = compute_window(Period::Yearly, at(2023, 6, 1, 0, 0));
        assert_eq!(start, at(2023, 1, 1, 0, 0));
        assert_eq!(end, end_of(2023, 12, 31));
    }

    #[test]
    fn every_window_contains_its_reference_and_has_calendar_length() {
        let mut day = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
        let last = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        while day <= last {
            let reference = day.and_hms_opt(13, 37, 0).unwrap();
            for period in Period::ALL {
                let (start, end) = compute_window(period, reference);
                assert!(start <= reference && reference <= end, "{period} {reference}");
                assert_eq!(compute_window(period, reference), (start, end));

                let days = (end + Duration::milliseconds(1) - start).num_days();
                let expected = match period {
                    Period::Daily => 1,
                    Period::Weekly | Period::Custom => 7,
                    Period::Monthly => {
                        let next = first_of_next_month(first_of_month(day));
                        (next - first_of_month(day)).num_days()
                    }
                    Period::Quarterly => {
                        let q = day.month0() / 3;
                        let first = NaiveDate::from_ymd_opt(day.year(), q * 3 + 1, 1).unwrap();
                        let next = if q == 3 {
                            NaiveDate::from_ymd_opt(day.year() + 1, 1, 1).unwrap()
                        } else {
                            NaiveDate::from_ymd_opt(day.year(), q * 3 + 4, 1).unwrap()
                        };
                        (next - first).num_days()
                    }
                    Period::Yearly => {
                        if NaiveDate::from_ymd_opt(day.year(), 2, 29).is_some() {
                            366
                        } else {
                            365
                        }
                    }
                };
                assert_eq!(days, expected, "{period} window for {day}");
            }
            day = day + Days::new(1);
        }
    }

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("monthly".parse::<Period>().unwrap(), Period::Monthly);
        assert!("fortnightly".parse::<Period>().is_err());
    }
}
