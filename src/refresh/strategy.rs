//! Refresh strategies: `should_refresh` per mode.

use chrono::{DateTime, Duration, NaiveTime, Utc};

use crate::model::{DataType, RefreshMode};

/// Half-width of the daily scheduled window.
const SCHEDULED_WINDOW_MINUTES: i64 = 30;
/// A scheduled dataset older than this refreshes regardless of the window.
const SCHEDULED_STALE_HOURS: i64 = 23;
/// Live mode default maximum age.
const LIVE_MAX_AGE_SECONDS: i64 = 60;

/// Decide whether a refresh is due. `force` is handled by the caller: the
/// manager bypasses the strategy entirely when forced.
pub fn should_refresh(
    mode: RefreshMode,
    data_type: DataType,
    last_success: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    schedule_time: NaiveTime,
) -> bool {
    match mode {
        RefreshMode::OnDemand => true,
        RefreshMode::Scheduled => {
            let Some(last) = last_success else {
                return true;
            };
            if now - last > Duration::hours(SCHEDULED_STALE_HOURS) {
                return true;
            }
            within_schedule_window(now, schedule_time)
        }
        RefreshMode::Periodic => match last_success {
            Some(last) => now - last > data_type.periodic_interval(),
            None => true,
        },
        RefreshMode::Live => match last_success {
            Some(last) => now - last > Duration::seconds(LIVE_MAX_AGE_SECONDS),
            None => true,
        },
    }
}

/// True within ±30 minutes of the configured daily schedule time.
fn within_schedule_window(now: DateTime<Utc>, schedule_time: NaiveTime) -> bool {
    let today_scheduled = now.date_naive().and_time(schedule_time).and_utc();
    let delta = (now - today_scheduled).num_minutes().abs();
    delta <= SCHEDULED_WINDOW_MINUTES
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, h, m, 0).unwrap()
    }

    fn schedule() -> NaiveTime {
        NaiveTime::from_hms_opt(17, 30, 0).unwrap()
    }

    #[test]
    fn on_demand_always_refreshes() {
        assert!(should_refresh(
            RefreshMode::OnDemand,
            DataType::Fundamentals,
            Some(at(17, 0)),
            at(17, 1),
            schedule(),
        ));
    }

    #[test]
    fn scheduled_only_inside_window_when_fresh() {
        let last = at(10, 0);
        // Inside the ±30 min window.
        assert!(should_refresh(
            RefreshMode::Scheduled,
            DataType::PriceHistorical,
            Some(last),
            at(17, 45),
            schedule(),
        ));
        // Outside the window, data still fresh.
        assert!(!should_refresh(
            RefreshMode::Scheduled,
            DataType::PriceHistorical,
            Some(last),
            at(12, 0),
            schedule(),
        ));
    }

    #[test]
    fn scheduled_stale_data_overrides_window() {
        let last = at(12, 0) - Duration::hours(24);
        assert!(should_refresh(
            RefreshMode::Scheduled,
            DataType::PriceHistorical,
            Some(last),
            at(12, 0),
            schedule(),
        ));
    }

    #[test]
    fn scheduled_never_fetched_refreshes() {
        assert!(should_refresh(
            RefreshMode::Scheduled,
            DataType::PriceHistorical,
            None,
            at(3, 0),
            schedule(),
        ));
    }

    #[test]
    fn periodic_cadence_per_data_type() {
        let now = at(12, 0);
        // price_current: 1 minute.
        assert!(should_refresh(
            RefreshMode::Periodic,
            DataType::PriceCurrent,
            Some(now - Duration::seconds(90)),
            now,
            schedule(),
        ));
        assert!(!should_refresh(
            RefreshMode::Periodic,
            DataType::PriceCurrent,
            Some(now - Duration::seconds(30)),
            now,
            schedule(),
        ));
        // intraday: 15 minutes.
        assert!(!should_refresh(
            RefreshMode::Periodic,
            DataType::PriceIntraday15m,
            Some(now - Duration::minutes(10)),
            now,
            schedule(),
        ));
        // indicators: 60 minutes.
        assert!(should_refresh(
            RefreshMode::Periodic,
            DataType::Indicators,
            Some(now - Duration::minutes(61)),
            now,
            schedule(),
        ));
        // everything else: 6 hours.
        assert!(!should_refresh(
            RefreshMode::Periodic,
            DataType::Fundamentals,
            Some(now - Duration::hours(5)),
            now,
            schedule(),
        ));
    }

    #[test]
    fn live_max_age_one_minute() {
        let now = at(12, 0);
        assert!(should_refresh(
            RefreshMode::Live,
            DataType::PriceCurrent,
            Some(now - Duration::seconds(61)),
            now,
            schedule(),
        ));
        assert!(!should_refresh(
            RefreshMode::Live,
            DataType::PriceCurrent,
            Some(now - Duration::seconds(59)),
            now,
            schedule(),
        ));
    }
}
