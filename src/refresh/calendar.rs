//! NYSE trading-day calendar and intraday session grid.
//!
//! Weekends plus the fixed NYSE holiday set, with weekend observation
//! shifts. Good Friday comes from the Gregorian computus. Unscheduled
//! closures are out of reach here; the continuity checks treat those days as
//! warnings, not errors.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc, Weekday};
use chrono_tz::America::New_York;

/// Anonymous Gregorian computus.
fn easter_sunday(year: i32) -> NaiveDate {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = ((h + l - 7 * m + 114) % 31) + 1;
    NaiveDate::from_ymd_opt(year, month as u32, day as u32).expect("valid computus date")
}

/// Saturday holidays observed Friday, Sunday holidays observed Monday.
fn observed(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date - Duration::days(1),
        Weekday::Sun => date + Duration::days(1),
        _ => date,
    }
}

fn nth_weekday(year: i32, month: u32, weekday: Weekday, nth: u32) -> NaiveDate {
    let first = NaiveDate::from_ymd_opt(year, month, 1).expect("valid month start");
    let offset = (7 + weekday.num_days_from_monday() - first.weekday().num_days_from_monday()) % 7;
    first + Duration::days(i64::from(offset + (nth - 1) * 7))
}

fn last_weekday(year: i32, month: u32, weekday: Weekday) -> NaiveDate {
    let next_month = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .expect("valid month start");
    let mut date = next_month - Duration::days(1);
    while date.weekday() != weekday {
        date -= Duration::days(1);
    }
    date
}

fn nyse_holidays(year: i32) -> Vec<NaiveDate> {
    let mut holidays = vec![
        observed(NaiveDate::from_ymd_opt(year, 1, 1).expect("new year")),
        nth_weekday(year, 1, Weekday::Mon, 3),
        nth_weekday(year, 2, Weekday::Mon, 3),
        easter_sunday(year) - Duration::days(2),
        last_weekday(year, 5, Weekday::Mon),
        observed(NaiveDate::from_ymd_opt(year, 7, 4).expect("independence day")),
        nth_weekday(year, 9, Weekday::Mon, 1),
        nth_weekday(year, 11, Weekday::Thu, 4),
        observed(NaiveDate::from_ymd_opt(year, 12, 25).expect("christmas")),
    ];
    // Juneteenth became an NYSE holiday in 2022.
    if year >= 2022 {
        holidays.push(observed(
            NaiveDate::from_ymd_opt(year, 6, 19).expect("juneteenth"),
        ));
    }
    holidays.sort_unstable();
    holidays
}

pub fn is_trading_day(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
        && !nyse_holidays(date.year()).contains(&date)
}

/// Trading days in `[start, end]`, ascending.
pub fn trading_days(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut days = Vec::new();
    let mut date = start;
    while date <= end {
        if is_trading_day(date) {
            days.push(date);
        }
        date += Duration::days(1);
    }
    days
}

pub fn previous_trading_day(date: NaiveDate) -> NaiveDate {
    let mut cursor = date - Duration::days(1);
    while !is_trading_day(cursor) {
        cursor -= Duration::days(1);
    }
    cursor
}

/// 15-minute bar timestamps (UTC) for the regular 09:30–16:00 ET session of
/// each trading day. Bars are stamped at interval start, so the last one is
/// 15:45 ET.
pub fn session_grid_15m(days: &[NaiveDate]) -> Vec<DateTime<Utc>> {
    let mut grid = Vec::with_capacity(days.len() * 26);
    for day in days {
        for slot in 0..26 {
            let minutes = 9 * 60 + 30 + slot * 15;
            let time = day
                .and_hms_opt((minutes / 60) as u32, (minutes % 60) as u32, 0)
                .expect("session time");
            if let Some(local) = New_York.from_local_datetime(&time).earliest() {
                grid.push(local.with_timezone(&Utc));
            }
        }
    }
    grid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weekends_are_not_trading_days() {
        // 2024-01-06 is a Saturday, 2024-01-07 a Sunday.
        assert!(!is_trading_day(NaiveDate::from_ymd_opt(2024, 1, 6).unwrap()));
        assert!(!is_trading_day(NaiveDate::from_ymd_opt(2024, 1, 7).unwrap()));
        assert!(is_trading_day(NaiveDate::from_ymd_opt(2024, 1, 8).unwrap()));
    }

    #[test]
    fn fixed_holidays_2024() {
        // New Year, MLK, Presidents, Good Friday, Memorial, Juneteenth,
        // July 4th, Labor, Thanksgiving, Christmas.
        let expected = [
            (1, 1),
            (1, 15),
            (2, 19),
            (3, 29),
            (5, 27),
            (6, 19),
            (7, 4),
            (9, 2),
            (11, 28),
            (12, 25),
        ];
        for (month, day) in expected {
            let date = NaiveDate::from_ymd_opt(2024, month, day).unwrap();
            assert!(!is_trading_day(date), "{date} should be a holiday");
        }
    }

    #[test]
    fn observed_shift_for_weekend_holidays() {
        // 2022-06-19 fell on a Sunday; observed Monday 2022-06-20.
        assert!(!is_trading_day(NaiveDate::from_ymd_opt(2022, 6, 20).unwrap()));
        // 2021-07-04 fell on a Sunday; observed Monday 2021-07-05.
        assert!(!is_trading_day(NaiveDate::from_ymd_opt(2021, 7, 5).unwrap()));
    }

    #[test]
    fn trading_day_count_for_a_known_week() {
        // Week of 2024-01-08: five ordinary weekdays.
        let days = trading_days(
            NaiveDate::from_ymd_opt(2024, 1, 8).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 14).unwrap(),
        );
        assert_eq!(days.len(), 5);
    }

    #[test]
    fn previous_trading_day_skips_weekend() {
        // Monday's previous trading day is Friday.
        assert_eq!(
            previous_trading_day(NaiveDate::from_ymd_opt(2024, 1, 8).unwrap()),
            NaiveDate::from_ymd_opt(2024, 1, 5).unwrap()
        );
    }

    #[test]
    fn session_grid_has_26_slots_per_day() {
        let day = NaiveDate::from_ymd_opt(2024, 1, 8).unwrap();
        let grid = session_grid_15m(&[day]);
        assert_eq!(grid.len(), 26);
        // First slot is 09:30 ET = 14:30 UTC in January (EST).
        assert_eq!(grid[0].time().to_string(), "14:30:00");
        // Last slot is 15:45 ET = 20:45 UTC.
        assert_eq!(grid[25].time().to_string(), "20:45:00");
    }
}
