use chrono::{Datelike, Duration, NaiveDate};

/// Current billing period boundaries. `start` is the first day counted;
/// `end` is the first day of the next period (exclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// First day of the billing period containing `today`.
///
/// If today has reached `start_day` the period began this month, otherwise
/// on `start_day` of the previous month. A `start_day` beyond the month's
/// length clamps to its last valid day (start_day=31 in April yields
/// April 30). The comparison uses the clamped date, so the clamped day
/// itself already belongs to the new period.
pub fn period_start(today: NaiveDate, start_day: u32) -> NaiveDate {
    let this_month = clamp_to_month(today.year(), today.month(), start_day);
    if today >= this_month {
        this_month
    } else {
        let (year, month) = previous_month(today.year(), today.month());
        clamp_to_month(year, month, start_day)
    }
}

/// First day of the next billing period (the exclusive upper bound).
pub fn period_end(today: NaiveDate, start_day: u32) -> NaiveDate {
    let start = period_start(today, start_day);
    let (year, month) = next_month(start.year(), start.month());
    clamp_to_month(year, month, start_day)
}

pub fn billing_period(today: NaiveDate, start_day: u32) -> BillingPeriod {
    BillingPeriod {
        start: period_start(today, start_day),
        end: period_end(today, start_day),
    }
}

impl BillingPeriod {
    pub fn duration(&self) -> Duration {
        Duration::days((self.end - self.start).num_days())
    }
}

fn previous_month(year: i32, month: u32) -> (i32, u32) {
    if month == 1 {
        (year - 1, 12)
    } else {
        (year, month - 1)
    }
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

fn clamp_to_month(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day)
        .unwrap_or_else(|| last_day_of_month(year, month))
}

fn last_day_of_month(year: i32, month: u32) -> NaiveDate {
    let (next_year, next_month) = next_month(year, month);
    // The 1st always exists; stepping back one day lands on the last day.
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .expect("first of month is always a valid date")
        - Duration::days(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn start_day_reached_this_month() {
        assert_eq!(period_start(date(2025, 7, 20), 17), date(2025, 7, 17));
        assert_eq!(period_start(date(2025, 7, 17), 17), date(2025, 7, 17));
    }

    #[test]
    fn start_day_not_yet_reached_rolls_to_previous_month() {
        assert_eq!(period_start(date(2025, 7, 4), 17), date(2025, 6, 17));
        assert_eq!(period_start(date(2025, 1, 4), 17), date(2024, 12, 17));
    }

    #[test]
    fn start_day_clamps_in_short_months() {
        // startDay=31 in a 30-day month clamps to day 30
        assert_eq!(period_start(date(2025, 4, 30), 31), date(2025, 4, 30));
        // February clamps to 28 (or 29 in leap years)
        assert_eq!(period_start(date(2025, 3, 1), 31), date(2025, 2, 28));
        assert_eq!(period_start(date(2024, 3, 1), 31), date(2024, 2, 29));
    }

    #[test]
    fn end_is_the_next_period_start() {
        assert_eq!(period_end(date(2025, 7, 4), 17), date(2025, 7, 17));
        assert_eq!(period_end(date(2025, 7, 20), 17), date(2025, 8, 17));
        assert_eq!(period_end(date(2025, 12, 20), 17), date(2026, 1, 17));
    }

    #[test]
    fn duration_covers_the_whole_window() {
        let period = billing_period(date(2025, 7, 4), 17);
        assert_eq!(period.duration(), Duration::days(30));
    }

    proptest! {
        #[test]
        fn start_never_exceeds_today(
            year in 2020i32..2030,
            month in 1u32..=12,
            day in 1u32..=28,
            start_day in 1u32..=31,
        ) {
            let today = date(year, month, day);
            prop_assert!(period_start(today, start_day) <= today);
        }

        #[test]
        fn start_is_idempotent_within_a_period(
            year in 2020i32..2030,
            month in 1u32..=12,
            day in 1u32..=28,
            start_day in 1u32..=31,
        ) {
            let today = date(year, month, day);
            let start = period_start(today, start_day);
            // Re-evaluating from the period's own start day gives the same answer.
            prop_assert_eq!(period_start(start, start_day), start);
        }

        #[test]
        fn today_always_falls_inside_its_period(
            year in 2020i32..2030,
            month in 1u32..=12,
            day in 1u32..=28,
            start_day in 1u32..=31,
        ) {
            let today = date(year, month, day);
            let period = billing_period(today, start_day);
            prop_assert!(period.start <= today);
            prop_assert!(today < period.end);
        }
    }
}
