//! Schedule shape definitions.
//!
//! Each recurrence carries exactly one shape variant with only the options
//! relevant to it; the calculator matches exhaustively. Validation happens
//! at create/update time so firing never sees a malformed shape.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Day of week for weekly schedules.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Weekday {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl Weekday {
    pub fn from_chrono(day: chrono::Weekday) -> Self {
        match day {
            chrono::Weekday::Mon => Self::Mon,
            chrono::Weekday::Tue => Self::Tue,
            chrono::Weekday::Wed => Self::Wed,
            chrono::Weekday::Thu => Self::Thu,
            chrono::Weekday::Fri => Self::Fri,
            chrono::Weekday::Sat => Self::Sat,
            chrono::Weekday::Sun => Self::Sun,
        }
    }

    pub fn to_chrono(self) -> chrono::Weekday {
        match self {
            Self::Mon => chrono::Weekday::Mon,
            Self::Tue => chrono::Weekday::Tue,
            Self::Wed => chrono::Weekday::Wed,
            Self::Thu => chrono::Weekday::Thu,
            Self::Fri => chrono::Weekday::Fri,
            Self::Sat => chrono::Weekday::Sat,
            Self::Sun => chrono::Weekday::Sun,
        }
    }
}

/// Target day for monthly schedules: a fixed day-of-month or an ordinal
/// weekday (e.g. the 2nd Tuesday).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum MonthlyTarget {
    DayOfMonth { day: u32 },
    OrdinalWeekday { ordinal: u32, weekday: Weekday },
}

/// One variant per supported schedule shape, each carrying only its
/// relevant options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "camelCase")]
pub enum ScheduleShape {
    Daily {
        interval_days: u32,
    },
    Weekly {
        interval_weeks: u32,
        weekdays: BTreeSet<Weekday>,
    },
    Monthly {
        interval_months: u32,
        target: MonthlyTarget,
    },
    Yearly {
        month: u32,
        day: u32,
    },
    DaysAfterCompletion {
        days: u32,
    },
    Custom {
        /// Explicit ascending date list; each occurrence lands at the
        /// configured due time on the listed day.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        dates: Vec<NaiveDate>,
        /// Rule expression (`every N days|weeks|months`). Takes precedence
        /// over the date list when present.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rule: Option<String>,
    },
}

impl ScheduleShape {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Daily { .. } => "daily",
            Self::Weekly { .. } => "weekly",
            Self::Monthly { .. } => "monthly",
            Self::Yearly { .. } => "yearly",
            Self::DaysAfterCompletion { .. } => "daysAfterCompletion",
            Self::Custom { .. } => "custom",
        }
    }
}

/// When a recurrence fires relative to the calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FiringBehavior {
    /// Fire strictly by calendar time.
    OnSchedule,
    /// Fire N days after the previous generated instance is marked complete.
    /// Only meaningful combined with `DaysAfterCompletion`.
    AfterCompletion,
}

/// When a recurrence completes its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EndCondition {
    Never,
    AfterOccurrenceCount { count: u32 },
    OnOrAfterDate { date: DateTime<Utc> },
}

/// Parsed form of the custom `rule` expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CustomRule {
    pub every: u32,
    pub unit: RuleUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleUnit {
    Days,
    Weeks,
    Months,
}

/// Parse a custom rule expression of the form `every N days|weeks|months`.
pub fn parse_rule(rule: &str) -> Result<CustomRule, EngineError> {
    let parts: Vec<&str> = rule.split_whitespace().collect();
    let invalid = || {
        EngineError::InvalidSchedule(format!(
            "unsupported rule expression {rule:?}; expected `every N days|weeks|months`"
        ))
    };
    let [keyword, count, unit] = parts.as_slice() else {
        return Err(invalid());
    };
    if !keyword.eq_ignore_ascii_case("every") {
        return Err(invalid());
    }
    let every: u32 = count.parse().map_err(|_| invalid())?;
    if every == 0 {
        return Err(invalid());
    }
    let unit = match unit.to_ascii_lowercase().as_str() {
        "day" | "days" => RuleUnit::Days,
        "week" | "weeks" => RuleUnit::Weeks,
        "month" | "months" => RuleUnit::Months,
        _ => return Err(invalid()),
    };
    Ok(CustomRule { every, unit })
}

/// Validate a shape/behavior combination. Called at create and update time;
/// a definition that passed validation never fails calendar arithmetic.
pub fn validate(shape: &ScheduleShape, behavior: FiringBehavior) -> Result<(), EngineError> {
    match shape {
        ScheduleShape::Daily { interval_days } => {
            if *interval_days == 0 {
                return Err(EngineError::InvalidSchedule(
                    "daily interval must be at least 1 day".into(),
                ));
            }
        }
        ScheduleShape::Weekly {
            interval_weeks,
            weekdays,
        } => {
            if *interval_weeks == 0 {
                return Err(EngineError::InvalidSchedule(
                    "weekly interval must be at least 1 week".into(),
                ));
            }
            if weekdays.is_empty() {
                return Err(EngineError::InvalidSchedule(
                    "weekly schedule requires a non-empty weekday set".into(),
                ));
            }
        }
        ScheduleShape::Monthly {
            interval_months,
            target,
        } => {
            if *interval_months == 0 {
                return Err(EngineError::InvalidSchedule(
                    "monthly interval must be at least 1 month".into(),
                ));
            }
            match target {
                MonthlyTarget::DayOfMonth { day } => {
                    if !(1..=31).contains(day) {
                        return Err(EngineError::InvalidSchedule(format!(
                            "day of month must be 1..=31, got {day}"
                        )));
                    }
                }
                MonthlyTarget::OrdinalWeekday { ordinal, .. } => {
                    if !(1..=5).contains(ordinal) {
                        return Err(EngineError::InvalidSchedule(format!(
                            "ordinal weekday must be 1..=5, got {ordinal}"
                        )));
                    }
                }
            }
        }
        ScheduleShape::Yearly { month, day } => {
            if !(1..=12).contains(month) {
                return Err(EngineError::InvalidSchedule(format!(
                    "month must be 1..=12, got {month}"
                )));
            }
            // Feb 29 is allowed; it clamps to Feb 28 on non-leap years.
            let max_day = match month {
                2 => 29,
                4 | 6 | 9 | 11 => 30,
                _ => 31,
            };
            if !(1..=max_day).contains(day) {
                return Err(EngineError::InvalidSchedule(format!(
                    "day {day} is out of range for month {month}"
                )));
            }
        }
        ScheduleShape::DaysAfterCompletion { days } => {
            if *days == 0 {
                return Err(EngineError::InvalidSchedule(
                    "daysAfterCompletion requires at least 1 day".into(),
                ));
            }
            if behavior != FiringBehavior::AfterCompletion {
                return Err(EngineError::InvalidSchedule(
                    "daysAfterCompletion is only valid with afterCompletion firing".into(),
                ));
            }
        }
        ScheduleShape::Custom { dates, rule } => {
            if dates.is_empty() && rule.is_none() {
                return Err(EngineError::InvalidSchedule(
                    "custom schedule requires a date list or a rule expression".into(),
                ));
            }
            if !dates.windows(2).all(|w| w[0] < w[1]) {
                return Err(EngineError::InvalidSchedule(
                    "custom date list must be strictly ascending".into(),
                ));
            }
            if let Some(rule) = rule {
                parse_rule(rule)?;
            }
        }
    }

    // afterCompletion firing only pairs with the daysAfterCompletion shape.
    if behavior == FiringBehavior::AfterCompletion
        && !matches!(shape, ScheduleShape::DaysAfterCompletion { .. })
    {
        return Err(EngineError::InvalidSchedule(format!(
            "afterCompletion firing is not valid for {} schedules",
            shape.label()
        )));
    }

    Ok(())
}
