use std::collections::HashSet;

use chrono::{Datelike, Days, NaiveDate, Weekday};
use thiserror::Error;

use crate::types::{CountingMethod, DayPart, WorkSchedule};

/// Errors raised while counting leave days.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CountingError {
    #[error("leave end date {end} is before start date {start}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },
}

/// Inputs for a counted-days calculation.
#[derive(Debug, Clone)]
pub struct CountingInput<'a> {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub half_day_start: Option<DayPart>,
    pub half_day_end: Option<DayPart>,
    pub method: CountingMethod,
    pub schedule: &'a WorkSchedule,
    pub holidays: &'a HashSet<NaiveDate>,
}

/// Counts the days a leave request debits from the user's balance.
///
/// `CONTINUOUS_ALL_DAYS` counts every calendar day in the range.
/// `WEEKDAYS_IF_WORKING` excludes weekends and public holidays and only
/// counts days the user's schedule marks as working. A half-day marker on
/// either end contributes 0.5; a single-day request with any half-day marker
/// counts 0.5 in total.
pub fn counted_days(input: &CountingInput<'_>) -> Result<f64, CountingError> {
    if input.end < input.start {
        return Err(CountingError::InvalidRange {
            start: input.start,
            end: input.end,
        });
    }

    let mut total = 0.0;
    let mut day = input.start;
    loop {
        if day_counts(input, day) {
            total += day_weight(input, day);
        }
        if day == input.end {
            break;
        }
        day = day
            .checked_add_days(Days::new(1))
            .expect("date range stays within chrono bounds");
    }

    Ok(total)
}

fn day_counts(input: &CountingInput<'_>, day: NaiveDate) -> bool {
    match input.method {
        CountingMethod::ContinuousAllDays => true,
        CountingMethod::WeekdaysIfWorking => {
            !is_weekend(day) && !input.holidays.contains(&day) && input.schedule.works_on(day)
        }
    }
}

fn day_weight(input: &CountingInput<'_>, day: NaiveDate) -> f64 {
    if input.start == input.end {
        if input.half_day_start.is_some() || input.half_day_end.is_some() {
            return 0.5;
        }
        return 1.0;
    }
    if day == input.start && input.half_day_start.is_some() {
        return 0.5;
    }
    if day == input.end && input.half_day_end.is_some() {
        return 0.5;
    }
    1.0
}

fn is_weekend(day: NaiveDate) -> bool {
    matches!(day.weekday(), Weekday::Sat | Weekday::Sun)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{WorkPattern, WorkSchedule};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn input<'a>(
        start: NaiveDate,
        end: NaiveDate,
        method: CountingMethod,
        schedule: &'a WorkSchedule,
        holidays: &'a HashSet<NaiveDate>,
    ) -> CountingInput<'a> {
        CountingInput {
            start,
            end,
            half_day_start: None,
            half_day_end: None,
            method,
            schedule,
            holidays,
        }
    }

    #[test]
    fn continuous_counts_every_calendar_day() {
        let schedule = WorkSchedule::full_time();
        let holidays = HashSet::new();
        // Friday to Monday spans a weekend.
        let result = counted_days(&input(
            date(2024, 6, 7),
            date(2024, 6, 10),
            CountingMethod::ContinuousAllDays,
            &schedule,
            &holidays,
        ))
        .unwrap();
        assert_eq!(result, 4.0);
    }

    #[test]
    fn working_days_skip_weekends_and_holidays() {
        let schedule = WorkSchedule::full_time();
        let mut holidays = HashSet::new();
        // Whit Monday.
        holidays.insert(date(2024, 5, 20));

        // 2024-05-16 (Thu) to 2024-05-21 (Tue): Thu, Fri, Tue count.
        let result = counted_days(&input(
            date(2024, 5, 16),
            date(2024, 5, 21),
            CountingMethod::WeekdaysIfWorking,
            &schedule,
            &holidays,
        ))
        .unwrap();
        assert_eq!(result, 3.0);
    }

    #[test]
    fn alternating_weeks_only_count_scheduled_days() {
        let schedule = WorkSchedule {
            pattern: WorkPattern::AlternatingWeeks,
            weekdays_even: vec![Weekday::Mon, Weekday::Tue, Weekday::Wed],
            weekdays_odd: vec![Weekday::Thu, Weekday::Fri],
        };
        let holidays = HashSet::new();

        // 2024-01-08 .. 2024-01-19 covers ISO weeks 2 (even) and 3 (odd):
        // Mon/Tue/Wed of week 2 plus Thu/Fri of week 3.
        let result = counted_days(&input(
            date(2024, 1, 8),
            date(2024, 1, 19),
            CountingMethod::WeekdaysIfWorking,
            &schedule,
            &holidays,
        ))
        .unwrap();
        assert_eq!(result, 5.0);
    }

    #[test]
    fn half_days_reduce_the_ends() {
        let schedule = WorkSchedule::full_time();
        let holidays = HashSet::new();
        let mut request = input(
            date(2024, 6, 3),
            date(2024, 6, 5),
            CountingMethod::WeekdaysIfWorking,
            &schedule,
            &holidays,
        );
        request.half_day_start = Some(DayPart::Pm);
        request.half_day_end = Some(DayPart::Am);

        let result = counted_days(&request).unwrap();
        assert_eq!(result, 2.0);
    }

    #[test]
    fn single_half_day_counts_half() {
        let schedule = WorkSchedule::full_time();
        let holidays = HashSet::new();
        let mut request = input(
            date(2024, 6, 3),
            date(2024, 6, 3),
            CountingMethod::WeekdaysIfWorking,
            &schedule,
            &holidays,
        );
        request.half_day_start = Some(DayPart::Am);

        assert_eq!(counted_days(&request).unwrap(), 0.5);

        // Both markers on a single day still count half, not zero.
        request.half_day_end = Some(DayPart::Pm);
        assert_eq!(counted_days(&request).unwrap(), 0.5);
    }

    #[test]
    fn reversed_range_is_an_error() {
        let schedule = WorkSchedule::full_time();
        let holidays = HashSet::new();
        let err = counted_days(&input(
            date(2024, 6, 10),
            date(2024, 6, 7),
            CountingMethod::WeekdaysIfWorking,
            &schedule,
            &holidays,
        ))
        .unwrap_err();
        assert!(matches!(err, CountingError::InvalidRange { .. }));
    }

    #[test]
    fn half_day_on_non_counted_day_is_ignored() {
        let schedule = WorkSchedule::full_time();
        let holidays = HashSet::new();
        // Saturday start with a half-day marker; only Monday counts.
        let mut request = input(
            date(2024, 6, 8),
            date(2024, 6, 10),
            CountingMethod::WeekdaysIfWorking,
            &schedule,
            &holidays,
        );
        request.half_day_start = Some(DayPart::Pm);

        assert_eq!(counted_days(&request).unwrap(), 1.0);
    }
}
