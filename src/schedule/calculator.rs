//! Pure next-occurrence arithmetic.
//!
//! No state, no I/O. Every computation happens on the local calendar of the
//! recurrence's timezone and converts back to UTC at the end.
//!
//! Edge policies:
//! - monthly targets past the month's length clamp to the month's last day,
//!   never rolling into the following month
//! - yearly Feb 29 clamps to Feb 28 on non-leap years, never March 1
//! - weekly scans the remainder of the reference week, then jumps ahead by
//!   the configured number of weeks before re-scanning
//! - an exhausted custom date list yields `None` (end condition met)
//! - for `DaysAfterCompletion` the reference is the completion time of the
//!   previous generated instance

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use super::shape::{
    parse_rule, CustomRule, FiringBehavior, MonthlyTarget, RuleUnit, ScheduleShape,
};
use crate::error::EngineError;

/// Compute the next occurrence strictly after `reference`.
///
/// Returns `Ok(None)` only for a custom date list with no remaining future
/// dates; every other shape always has a next occurrence.
pub fn next_occurrence(
    shape: &ScheduleShape,
    due_time: NaiveTime,
    tz: Tz,
    reference: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, EngineError> {
    let local_date = reference.with_timezone(&tz).date_naive();

    let date = match shape {
        ScheduleShape::Daily { interval_days } => {
            Some(local_date + Duration::days(i64::from(*interval_days)))
        }
        ScheduleShape::Weekly {
            interval_weeks,
            weekdays,
        } => {
            let in_set =
                |d: NaiveDate| weekdays.contains(&super::shape::Weekday::from_chrono(d.weekday()));
            // Scan the remainder of the reference week (through Sunday).
            let days_to_sunday = 6 - local_date.weekday().num_days_from_monday();
            let mut found = None;
            for offset in 1..=i64::from(days_to_sunday) {
                let candidate = local_date + Duration::days(offset);
                if in_set(candidate) {
                    found = Some(candidate);
                    break;
                }
            }
            if found.is_none() {
                // Window exhausted: advance by `interval` weeks and re-scan.
                let week_start = local_date
                    - Duration::days(i64::from(local_date.weekday().num_days_from_monday()))
                    + Duration::weeks(i64::from(*interval_weeks));
                for offset in 0..7 {
                    let candidate = week_start + Duration::days(offset);
                    if in_set(candidate) {
                        found = Some(candidate);
                        break;
                    }
                }
            }
            found
        }
        ScheduleShape::Monthly {
            interval_months,
            target,
        } => {
            let (year, month) = add_months(local_date.year(), local_date.month(), *interval_months);
            monthly_date(year, month, target)
        }
        ScheduleShape::Yearly { month, day } => {
            let this_year = yearly_date(local_date.year(), *month, *day);
            match this_year {
                Some(d) if at_due_time(d, due_time, tz) > reference => Some(d),
                _ => yearly_date(local_date.year() + 1, *month, *day),
            }
        }
        ScheduleShape::DaysAfterCompletion { days } => {
            Some(local_date + Duration::days(i64::from(*days)))
        }
        ScheduleShape::Custom { dates, rule } => {
            if let Some(rule) = rule {
                Some(apply_rule(local_date, parse_rule(rule)?))
            } else {
                let next = dates
                    .iter()
                    .copied()
                    .find(|d| at_due_time(*d, due_time, tz) > reference);
                match next {
                    Some(d) => Some(d),
                    None => return Ok(None),
                }
            }
        }
    };

    let date = date.ok_or_else(|| {
        EngineError::InvalidSchedule(format!(
            "could not compute a next occurrence for a {} schedule",
            shape.label()
        ))
    })?;
    Ok(Some(at_due_time(date, due_time, tz)))
}

/// Compute the first occurrence for a newly created (or resumed) definition.
///
/// After-completion schedules have no prior completion to anchor to, so the
/// first instance fires immediately (or at the configured start). Calendar
/// shapes honor a future start date by landing on its day at the due time.
pub fn initial_occurrence(
    shape: &ScheduleShape,
    behavior: FiringBehavior,
    due_time: NaiveTime,
    tz: Tz,
    start_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, EngineError> {
    if behavior == FiringBehavior::AfterCompletion {
        return Ok(Some(start_at.filter(|s| *s > now).unwrap_or(now)));
    }
    if matches!(shape, ScheduleShape::Custom { .. }) {
        // The explicit list (or rule) governs; start dates do not shift it.
        return next_occurrence(shape, due_time, tz, now);
    }
    if let Some(start) = start_at.filter(|s| *s > now) {
        let local = start.with_timezone(&tz).date_naive();
        return Ok(Some(at_due_time(local, due_time, tz)));
    }
    next_occurrence(shape, due_time, tz, now)
}

/// Resolve a local calendar day + due time to a UTC instant.
///
/// Ambiguous local times (DST fall-back) resolve to the earliest offset; a
/// due time inside a spring-forward gap shifts forward one hour.
pub fn at_due_time(date: NaiveDate, due_time: NaiveTime, tz: Tz) -> DateTime<Utc> {
    let naive = date.and_time(due_time);
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            let shifted = naive + Duration::hours(1);
            match tz.from_local_datetime(&shifted) {
                LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => {
                    dt.with_timezone(&Utc)
                }
                LocalResult::None => Utc.from_utc_datetime(&naive),
            }
        }
    }
}

fn add_months(year: i32, month: u32, months: u32) -> (i32, u32) {
    let total = year * 12 + month as i32 - 1 + months as i32;
    (total.div_euclid(12), total.rem_euclid(12) as u32 + 1)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = add_months(year, month, 1);
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

fn monthly_date(year: i32, month: u32, target: &MonthlyTarget) -> Option<NaiveDate> {
    match target {
        MonthlyTarget::DayOfMonth { day } => {
            let day = (*day).min(days_in_month(year, month));
            NaiveDate::from_ymd_opt(year, month, day)
        }
        MonthlyTarget::OrdinalWeekday { ordinal, weekday } => {
            let first = NaiveDate::from_ymd_opt(year, month, 1)?;
            let first_wd = first.weekday().num_days_from_monday();
            let target_wd = weekday.to_chrono().num_days_from_monday();
            let mut day = 1 + (target_wd + 7 - first_wd) % 7 + ordinal.saturating_sub(1) * 7;
            // An Nth weekday past the month's end clamps to the last one.
            let last = days_in_month(year, month);
            while day > last {
                day -= 7;
            }
            NaiveDate::from_ymd_opt(year, month, day)
        }
    }
}

fn yearly_date(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day).or_else(|| {
        if month == 2 && day == 29 {
            NaiveDate::from_ymd_opt(year, 2, 28)
        } else {
            None
        }
    })
}

fn apply_rule(local_date: NaiveDate, rule: CustomRule) -> NaiveDate {
    match rule.unit {
        RuleUnit::Days => local_date + Duration::days(i64::from(rule.every)),
        RuleUnit::Weeks => local_date + Duration::weeks(i64::from(rule.every)),
        RuleUnit::Months => {
            let (year, month) = add_months(local_date.year(), local_date.month(), rule.every);
            let day = local_date.day().min(days_in_month(year, month));
            NaiveDate::from_ymd_opt(year, month, day).unwrap_or(local_date)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::shape::Weekday;
    use std::collections::BTreeSet;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn nine() -> NaiveTime {
        NaiveTime::from_hms_opt(9, 0, 0).unwrap()
    }

    fn next(shape: &ScheduleShape, reference: DateTime<Utc>) -> DateTime<Utc> {
        next_occurrence(shape, nine(), Tz::UTC, reference)
            .unwrap()
            .unwrap()
    }

    #[test]
    fn daily_advances_by_interval_at_due_time() {
        let shape = ScheduleShape::Daily { interval_days: 3 };
        assert_eq!(
            next(&shape, utc(2024, 1, 10, 14, 30)),
            utc(2024, 1, 13, 9, 0)
        );
    }

    #[test]
    fn weekly_picks_next_configured_weekday() {
        // [Mon, Wed] starting from Tuesday 2024-01-02.
        let shape = ScheduleShape::Weekly {
            interval_weeks: 1,
            weekdays: BTreeSet::from([Weekday::Mon, Weekday::Wed]),
        };
        let first = next(&shape, utc(2024, 1, 2, 10, 0));
        assert_eq!(first, utc(2024, 1, 3, 9, 0)); // Wednesday

        // After firing on the Wednesday, the week is exhausted for this set;
        // the following Monday comes next.
        let second = next(&shape, first);
        assert_eq!(second, utc(2024, 1, 8, 9, 0));
    }

    #[test]
    fn weekly_interval_skips_whole_weeks() {
        // Every 2 weeks on Friday, reference is a Friday afternoon.
        let shape = ScheduleShape::Weekly {
            interval_weeks: 2,
            weekdays: BTreeSet::from([Weekday::Fri]),
        };
        // 2024-01-05 is a Friday; the rest of its week has no Friday, so the
        // scan jumps two weeks ahead.
        assert_eq!(
            next(&shape, utc(2024, 1, 5, 15, 0)),
            utc(2024, 1, 19, 9, 0)
        );
    }

    #[test]
    fn monthly_day_clamps_to_month_end() {
        let shape = ScheduleShape::Monthly {
            interval_months: 1,
            target: MonthlyTarget::DayOfMonth { day: 31 },
        };
        // Leap year: Jan 31 -> Feb 29, never March.
        assert_eq!(
            next(&shape, utc(2024, 1, 31, 9, 0)),
            utc(2024, 2, 29, 9, 0)
        );
        // Non-leap year: Jan 31 -> Feb 28.
        assert_eq!(
            next(&shape, utc(2023, 1, 31, 9, 0)),
            utc(2023, 2, 28, 9, 0)
        );
    }

    #[test]
    fn monthly_ordinal_weekday() {
        // 2nd Tuesday of the month following a mid-March reference.
        let shape = ScheduleShape::Monthly {
            interval_months: 1,
            target: MonthlyTarget::OrdinalWeekday {
                ordinal: 2,
                weekday: Weekday::Tue,
            },
        };
        assert_eq!(
            next(&shape, utc(2024, 3, 15, 9, 0)),
            utc(2024, 4, 9, 9, 0)
        );
    }

    #[test]
    fn monthly_fifth_weekday_clamps_to_last() {
        // February 2024 has no 5th Friday; the last one is the 23rd.
        let shape = ScheduleShape::Monthly {
            interval_months: 1,
            target: MonthlyTarget::OrdinalWeekday {
                ordinal: 5,
                weekday: Weekday::Fri,
            },
        };
        assert_eq!(
            next(&shape, utc(2024, 1, 10, 9, 0)),
            utc(2024, 2, 23, 9, 0)
        );
    }

    #[test]
    fn yearly_feb_29_clamps_on_non_leap_years() {
        let shape = ScheduleShape::Yearly { month: 2, day: 29 };
        // Reference in a non-leap year before the target: clamp to Feb 28.
        assert_eq!(
            next(&shape, utc(2023, 1, 15, 9, 0)),
            utc(2023, 2, 28, 9, 0)
        );
        // Reference after this year's occurrence: 2024 is leap, real Feb 29.
        assert_eq!(
            next(&shape, utc(2023, 6, 1, 9, 0)),
            utc(2024, 2, 29, 9, 0)
        );
    }

    #[test]
    fn days_after_completion_counts_from_completion_time() {
        let shape = ScheduleShape::DaysAfterCompletion { days: 5 };
        assert_eq!(
            next(&shape, utc(2024, 3, 10, 16, 45)),
            utc(2024, 3, 15, 9, 0)
        );
    }

    #[test]
    fn custom_list_pops_next_future_date_and_exhausts() {
        let shape = ScheduleShape::Custom {
            dates: vec![
                NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
                NaiveDate::from_ymd_opt(2024, 2, 20).unwrap(),
            ],
            rule: None,
        };
        assert_eq!(
            next(&shape, utc(2024, 1, 10, 9, 0)),
            utc(2024, 2, 20, 9, 0)
        );
        // Past the last entry the list is exhausted.
        assert_eq!(
            next_occurrence(&shape, nine(), Tz::UTC, utc(2024, 2, 20, 9, 0)).unwrap(),
            None
        );
    }

    #[test]
    fn custom_rule_takes_precedence_over_list() {
        let shape = ScheduleShape::Custom {
            dates: vec![NaiveDate::from_ymd_opt(2030, 1, 1).unwrap()],
            rule: Some("every 10 days".into()),
        };
        assert_eq!(
            next(&shape, utc(2024, 5, 1, 12, 0)),
            utc(2024, 5, 11, 9, 0)
        );
    }

    #[test]
    fn custom_monthly_rule_clamps_day() {
        let shape = ScheduleShape::Custom {
            dates: vec![],
            rule: Some("every 1 months".into()),
        };
        assert_eq!(
            next(&shape, utc(2024, 1, 31, 9, 0)),
            utc(2024, 2, 29, 9, 0)
        );
    }

    #[test]
    fn next_is_strictly_greater_than_reference() {
        let shapes = vec![
            ScheduleShape::Daily { interval_days: 1 },
            ScheduleShape::Weekly {
                interval_weeks: 1,
                weekdays: BTreeSet::from([Weekday::Mon]),
            },
            ScheduleShape::Monthly {
                interval_months: 1,
                target: MonthlyTarget::DayOfMonth { day: 15 },
            },
            ScheduleShape::Yearly { month: 6, day: 15 },
        ];
        for shape in &shapes {
            let mut reference = utc(2024, 1, 1, 0, 0);
            for _ in 0..40 {
                let occurrence = next(shape, reference);
                assert!(
                    occurrence > reference,
                    "{:?} produced {} from {}",
                    shape,
                    occurrence,
                    reference
                );
                reference = occurrence;
            }
        }
    }

    #[test]
    fn due_time_evaluated_in_recurrence_timezone() {
        let shape = ScheduleShape::Daily { interval_days: 1 };
        let tz: Tz = "America/New_York".parse().unwrap();
        let occurrence = next_occurrence(&shape, nine(), tz, utc(2024, 1, 10, 12, 0))
            .unwrap()
            .unwrap();
        // 09:00 in New York (EST, UTC-5) is 14:00 UTC.
        assert_eq!(occurrence, utc(2024, 1, 11, 14, 0));
    }

    #[test]
    fn spring_forward_gap_shifts_one_hour() {
        let shape = ScheduleShape::Daily { interval_days: 1 };
        let tz: Tz = "America/New_York".parse().unwrap();
        // 2024-03-10 02:30 local does not exist (clocks jump 02:00 -> 03:00).
        let due = NaiveTime::from_hms_opt(2, 30, 0).unwrap();
        let occurrence = next_occurrence(&shape, due, tz, utc(2024, 3, 9, 12, 0))
            .unwrap()
            .unwrap();
        // Resolves to 03:30 EDT = 07:30 UTC.
        assert_eq!(occurrence, utc(2024, 3, 10, 7, 30));
    }

    #[test]
    fn initial_occurrence_honors_future_start_date() {
        let shape = ScheduleShape::Daily { interval_days: 1 };
        let start = utc(2024, 6, 1, 0, 0);
        let first = initial_occurrence(
            &shape,
            FiringBehavior::OnSchedule,
            nine(),
            Tz::UTC,
            Some(start),
            utc(2024, 5, 1, 10, 0),
        )
        .unwrap()
        .unwrap();
        assert_eq!(first, utc(2024, 6, 1, 9, 0));
    }

    #[test]
    fn initial_occurrence_for_after_completion_is_immediate() {
        let shape = ScheduleShape::DaysAfterCompletion { days: 7 };
        let now = utc(2024, 5, 1, 10, 0);
        let first = initial_occurrence(
            &shape,
            FiringBehavior::AfterCompletion,
            nine(),
            Tz::UTC,
            None,
            now,
        )
        .unwrap()
        .unwrap();
        assert_eq!(first, now);
    }
}
