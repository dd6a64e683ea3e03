//! Cron expression parsing, normalization and evaluation.
//!
//! Expressions have five fields, or six with a leading seconds field:
//! ```text
//! ┌───────────── second (0-59, six-field form only)
//! │ ┌───────────── minute (0-59)
//! │ │ ┌───────────── hour (0-23)
//! │ │ │ ┌───────────── day of month (1-31)
//! │ │ │ │ ┌───────────── month (1-12 or JAN-DEC)
//! │ │ │ │ │ ┌───────────── day of week (0-7 or SUN-SAT, 0 and 7 = Sunday)
//! │ │ │ │ │ │
//! 0 0 2 * * ?
//! ```
//!
//! Exactly one of day-of-month and day-of-week must be `?` ("no specific
//! value"). [`normalize`] rewrites the common `* *` form into that shape.

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Timelike, Utc};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// How many days ahead `next_after` searches before giving up.
const SEARCH_HORIZON_DAYS: u32 = 5 * 366;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronParseError {
    #[error("invalid cron expression: expected 5 or 6 fields, got {0}")]
    InvalidFieldCount(usize),
    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: String, reason: String },
    #[error("value {value} is out of range [{min}, {max}] in '{field}'")]
    OutOfRange {
        field: String,
        value: u32,
        min: u32,
        max: u32,
    },
    #[error("invalid range: {0}-{1}")]
    InvalidRange(u32, u32),
    #[error("invalid step value: {0}")]
    InvalidStep(String),
    #[error("exactly one of day-of-month and day-of-week must be '?'")]
    DayFieldsNotExclusive,
    #[error("day-of-month '{0}' and day-of-week '{1}' cannot both be restricted")]
    ConflictingDayFields(String, String),
}

/// The set of values one cron field accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronField {
    values: BTreeSet<u32>,
    min: u32,
    max: u32,
}

impl CronField {
    fn parse(expr: &str, min: u32, max: u32, names: &[&str], name_base: u32) -> Result<Self, CronParseError> {
        let mut field = Self {
            values: BTreeSet::new(),
            min,
            max,
        };
        for part in expr.split(',') {
            field.parse_part(part.trim(), names, name_base)?;
        }
        Ok(field)
    }

    fn parse_part(&mut self, part: &str, names: &[&str], name_base: u32) -> Result<(), CronParseError> {
        if part.is_empty() {
            return Err(CronParseError::InvalidField {
                field: part.to_string(),
                reason: "empty list element".to_string(),
            });
        }

        let (range_part, step) = match part.split_once('/') {
            Some((range, step_str)) => {
                let step = step_str
                    .parse::<u32>()
                    .map_err(|_| CronParseError::InvalidStep(step_str.to_string()))?;
                if step == 0 || step > self.max - self.min {
                    return Err(CronParseError::InvalidStep(step_str.to_string()));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if range_part == "*" {
            (self.min, self.max)
        } else if let Some((lo, hi)) = range_part.split_once('-') {
            let start = parse_value(lo, names, name_base)?;
            let end = parse_value(hi, names, name_base)?;
            if start > end {
                return Err(CronParseError::InvalidRange(start, end));
            }
            (start, end)
        } else {
            let value = parse_value(range_part, names, name_base)?;
            // "5/15" means "from 5, every 15"
            if step.is_some() {
                (value, self.max)
            } else {
                (value, value)
            }
        };

        if start < self.min || end > self.max {
            return Err(CronParseError::OutOfRange {
                field: part.to_string(),
                value: if start < self.min { start } else { end },
                min: self.min,
                max: self.max,
            });
        }

        let step = step.unwrap_or(1);
        let mut value = start;
        while value <= end {
            self.values.insert(value);
            match value.checked_add(step) {
                Some(next) => value = next,
                None => break,
            }
        }
        Ok(())
    }

    pub fn matches(&self, value: u32) -> bool {
        self.values.contains(&value)
    }

    /// Smallest accepted value that is >= `value`.
    pub fn next(&self, value: u32) -> Option<u32> {
        self.values.range(value..).next().copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn parse_value(token: &str, names: &[&str], name_base: u32) -> Result<u32, CronParseError> {
    if let Ok(value) = token.parse::<u32>() {
        return Ok(value);
    }
    let upper = token.to_ascii_uppercase();
    names
        .iter()
        .position(|name| *name == upper)
        .map(|idx| idx as u32 + name_base)
        .ok_or_else(|| CronParseError::InvalidField {
            field: token.to_string(),
            reason: "invalid value".to_string(),
        })
}

/// A validated cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    expr: String,
    second: CronField,
    minute: CronField,
    hour: CronField,
    /// `None` when the field is `?`.
    day_of_month: Option<CronField>,
    month: CronField,
    day_of_week: Option<CronField>,
}

impl CronExpr {
    /// Parse and validate an expression. This is the validator: it rejects
    /// expressions that do not leave exactly one day field as `?`.
    pub fn parse(expr: &str) -> Result<Self, CronParseError> {
        let fields = split_fields(expr)?;
        let (second, rest) = if fields.len() == 6 {
            (CronField::parse(fields[0], 0, 59, &[], 0)?, &fields[1..])
        } else {
            (CronField::parse("0", 0, 59, &[], 0)?, &fields[..])
        };

        let day_of_month = match rest[2] {
            "?" => None,
            dom => Some(CronField::parse(dom, 1, 31, &[], 0)?),
        };
        let day_of_week = match rest[4] {
            "?" => None,
            dow => {
                let mut field = CronField::parse(dow, 0, 7, &DAY_NAMES, 0)?;
                if field.values.remove(&7) {
                    field.values.insert(0);
                }
                Some(field)
            }
        };
        if day_of_month.is_some() == day_of_week.is_some() {
            return Err(CronParseError::DayFieldsNotExclusive);
        }

        Ok(Self {
            expr: fields.join(" "),
            second,
            minute: CronField::parse(rest[0], 0, 59, &[], 0)?,
            hour: CronField::parse(rest[1], 0, 23, &[], 0)?,
            day_of_month,
            month: CronField::parse(rest[3], 1, 12, &MONTH_NAMES, 1)?,
            day_of_week,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.expr
    }

    pub fn matches(&self, dt: &DateTime<Utc>) -> bool {
        self.second.matches(dt.second())
            && self.minute.matches(dt.minute())
            && self.hour.matches(dt.hour())
            && self.day_matches(dt.date_naive())
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        if !self.month.matches(date.month()) {
            return false;
        }
        let dom_ok = self
            .day_of_month
            .as_ref()
            .is_none_or(|f| f.matches(date.day()));
        let dow_ok = self
            .day_of_week
            .as_ref()
            .is_none_or(|f| f.matches(date.weekday().num_days_from_sunday()));
        dom_ok && dow_ok
    }

    /// First time-of-day at or after `from` that the time fields accept.
    fn first_time_from(&self, from: NaiveTime) -> Option<NaiveTime> {
        for hour in self.hour.values.range(from.hour()..) {
            let same_hour = *hour == from.hour();
            let minute_start = if same_hour { from.minute() } else { 0 };
            for minute in self.minute.values.range(minute_start..) {
                let second_start = if same_hour && *minute == from.minute() {
                    from.second()
                } else {
                    0
                };
                if let Some(second) = self.second.next(second_start) {
                    return NaiveTime::from_hms_opt(*hour, *minute, second);
                }
            }
        }
        None
    }

    /// The next fire time strictly after `after`, if any within five years.
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.with_nanosecond(0)? + chrono::Duration::seconds(1);
        let mut date = start.date_naive();
        let mut from = start.time();

        for _ in 0..SEARCH_HORIZON_DAYS {
            if self.day_matches(date) {
                if let Some(time) = self.first_time_from(from) {
                    return Some(date.and_time(time).and_utc());
                }
            }
            date = date.succ_opt()?;
            from = NaiveTime::MIN;
        }
        None
    }
}

impl FromStr for CronExpr {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronExpr::parse(s)
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)
    }
}

fn split_fields(expr: &str) -> Result<Vec<&str>, CronParseError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 && fields.len() != 6 {
        return Err(CronParseError::InvalidFieldCount(fields.len()));
    }
    Ok(fields)
}

/// Rewrite the day fields so exactly one of them is `?`.
///
/// `* *` becomes `* ?`; a wildcard next to a restricted field becomes `?`;
/// `? ?` becomes `* ?`. Two restricted day fields are rejected rather than
/// guessed at. The result is checked with [`CronExpr::parse`].
pub fn normalize(expr: &str) -> Result<String, CronParseError> {
    let mut fields = split_fields(expr)?;
    let offset = fields.len() - 5;
    let (dom_idx, dow_idx) = (offset + 2, offset + 4);

    match (fields[dom_idx], fields[dow_idx]) {
        ("?", "?") => fields[dom_idx] = "*",
        ("?", _) | (_, "?") => {}
        ("*", "*") => fields[dow_idx] = "?",
        ("*", _) => fields[dom_idx] = "?",
        (_, "*") => fields[dow_idx] = "?",
        (dom, dow) => {
            return Err(CronParseError::ConflictingDayFields(
                dom.to_string(),
                dow.to_string(),
            ));
        }
    }

    let normalized = fields.join(" ");
    CronExpr::parse(&normalized)?;
    Ok(normalized)
}

/// Normalize then parse; the form used when registering triggers.
pub fn compile(expr: &str) -> Result<CronExpr, CronParseError> {
    CronExpr::parse(&normalize(expr)?)
}
