//! Schedule expressions and next-fire computation.
//!
//! Accepted forms:
//!
//! | Form                         | Example                     |
//! |------------------------------|-----------------------------|
//! | Five-field cron              | `0 2 * * *`, `*/15 * * * 1-5` |
//! | Descriptor                   | `@hourly`, `@daily`, `weekly` |
//! | Fixed interval               | `@every 90s`, `every 1 hour`  |
//!
//! Cron expressions are evaluated in UTC by the `cron` crate. That crate uses
//! a seconds-first dialect with Sunday = 1, so five-field expressions are
//! rewritten before parsing: the day-of-week field (0-7, both 0 and 7 are
//! Sunday, names allowed) is expanded to an explicit list of day names.
//!
//! When both day-of-month and day-of-week are restricted, a day matches if
//! either field matches. The `cron` crate requires both, so such expressions
//! are split into two schedules and the earlier fire wins.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule as CronSchedule;

use crate::error::{Result, SchedulerError};

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// A parsed schedule. Holds no mutable state.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// One schedule, or two when day-of-month and day-of-week are both
    /// restricted.
    Cron(Vec<CronSchedule>),
    Every(Duration),
}

impl Trigger {
    /// Parse a schedule expression, failing fast on anything unrecognised.
    pub fn parse(expr: &str) -> Result<Self> {
        let trimmed = expr.trim();
        if trimmed.is_empty() {
            return Err(SchedulerError::invalid_schedule(expr, "empty expression"));
        }

        let lower = trimmed.to_ascii_lowercase();
        if let Some(rest) = lower.strip_prefix("@every") {
            return Self::every(expr, rest);
        }
        if let Some(rest) = lower.strip_prefix("every ") {
            return Self::every(expr, rest);
        }

        let cron_expr = match lower.as_str() {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" | "weekly" => "0 0 * * 0",
            "@daily" | "@midnight" | "daily" => "0 0 * * *",
            "@hourly" | "hourly" => "0 * * * *",
            _ if trimmed.starts_with('@') => {
                return Err(SchedulerError::invalid_schedule(expr, "unknown descriptor"))
            }
            _ => trimmed,
        };

        let schedules = to_cron_dialect(expr, cron_expr)?
            .iter()
            .map(|normalized| {
                CronSchedule::from_str(normalized)
                    .map_err(|e| SchedulerError::invalid_schedule(expr, e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Trigger::Cron(schedules))
    }

    fn every(expr: &str, rest: &str) -> Result<Self> {
        let interval = parse_interval(rest.trim())
            .ok_or_else(|| SchedulerError::invalid_schedule(expr, "unparsable interval"))?;
        if interval <= Duration::zero() {
            return Err(SchedulerError::invalid_schedule(expr, "interval must be positive"));
        }
        Ok(Trigger::Every(interval))
    }

    /// Next fire strictly after `from`, or `None` if the schedule never fires again.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Cron(schedules) => schedules
                .iter()
                .filter_map(|s| s.after(&from).next())
                .min(),
            Trigger::Every(interval) => from.checked_add_signed(*interval),
        }
    }

    /// The next `count` fire times after `from`.
    pub fn upcoming(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut out = Vec::with_capacity(count);
        let mut cursor = from;
        while out.len() < count {
            match self.next_after(cursor) {
                Some(next) => {
                    out.push(next);
                    cursor = next;
                }
                None => break,
            }
        }
        out
    }
}

/// Rewrite `min hour dom month dow` into one or two seconds-first expressions.
fn to_cron_dialect(original: &str, expr: &str) -> Result<Vec<String>> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(SchedulerError::invalid_schedule(
            original,
            format!("expected 5 fields, found {}", fields.len()),
        ));
    }
    let (minute, hour, dom, month) = (fields[0], fields[1], fields[2], fields[3]);
    let dow = day_of_week_list(original, fields[4])?;

    // A field starting with `*` is unrestricted for the either-day rule.
    let dom_restricted = !(dom.starts_with('*') || dom == "?");
    let dow_restricted = !(fields[4].starts_with('*') || fields[4] == "?");

    if dom_restricted && dow_restricted {
        Ok(vec![
            format!("0 {minute} {hour} {dom} {month} *"),
            format!("0 {minute} {hour} * {month} {dow}"),
        ])
    } else {
        Ok(vec![format!("0 {minute} {hour} {dom} {month} {dow}")])
    }
}

/// Expand a day-of-week field into `*` or a list of day names.
fn day_of_week_list(original: &str, field: &str) -> Result<String> {
    let mut days = [false; 7];
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((b, s)) => {
                let step = s.parse::<usize>().ok().filter(|n| *n > 0).ok_or_else(|| {
                    SchedulerError::invalid_schedule(original, format!("bad day-of-week step '{s}'"))
                })?;
                (b, step)
            }
            None => (item, 1),
        };

        let (lo, hi) = if base == "*" || base == "?" {
            (0, 7)
        } else if let Some((lo, hi)) = base.split_once('-') {
            let (lo, hi) = (day_value(original, lo)?, day_value(original, hi)?);
            if lo > hi {
                return Err(SchedulerError::invalid_schedule(
                    original,
                    format!("day-of-week range '{base}' is reversed"),
                ));
            }
            (lo, hi)
        } else {
            let day = day_value(original, base)?;
            // `N/step` runs from N to the end of the week.
            if item.contains('/') {
                (day, 7)
            } else {
                (day, day)
            }
        };

        for day in (lo..=hi).step_by(step) {
            days[day % 7] = true;
        }
    }

    if days.iter().all(|d| *d) {
        return Ok("*".to_string());
    }
    let names: Vec<&str> = days
        .iter()
        .zip(DAY_NAMES)
        .filter_map(|(on, name)| on.then_some(name))
        .collect();
    Ok(names.join(","))
}

/// Map a day token to 0..=7 (0 and 7 are Sunday). Accepts numbers and
/// English day names or their three-letter abbreviations.
fn day_value(original: &str, token: &str) -> Result<usize> {
    if token.chars().all(|c| c.is_ascii_digit()) && !token.is_empty() {
        return match token.parse::<usize>() {
            Ok(n @ 0..=7) => Ok(n),
            _ => Err(SchedulerError::invalid_schedule(
                original,
                format!("day-of-week value '{token}' out of range 0-7"),
            )),
        };
    }
    let lower = token.to_ascii_lowercase();
    const FULL: [&str; 7] = [
        "sunday", "monday", "tuesday", "wednesday", "thursday", "friday", "saturday",
    ];
    FULL.iter()
        .position(|full| lower.len() >= 3 && (lower == *full || lower == full[..3]))
        .ok_or_else(|| {
            SchedulerError::invalid_schedule(original, format!("unknown day-of-week '{token}'"))
        })
}

/// Parse `90s`, `15m`, `1h30m`, `2 days`, `1 hour` and similar.
fn parse_interval(s: &str) -> Option<Duration> {
    let mut total = Duration::zero();
    let mut chars = s.chars().peekable();
    let mut matched = false;

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut digits = String::new();
        while let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
            digits.push(c);
            chars.next();
        }
        let amount: i64 = digits.parse().ok()?;

        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        let mut unit = String::new();
        while let Some(c) = chars.peek().copied().filter(char::is_ascii_alphabetic) {
            unit.push(c);
            chars.next();
        }

        let part = match unit.as_str() {
            "s" | "sec" | "secs" | "second" | "seconds" => Duration::try_seconds(amount)?,
            "m" | "min" | "mins" | "minute" | "minutes" => Duration::try_minutes(amount)?,
            "h" | "hr" | "hrs" | "hour" | "hours" => Duration::try_hours(amount)?,
            "d" | "day" | "days" => Duration::try_days(amount)?,
            "w" | "week" | "weeks" => Duration::try_weeks(amount)?,
            _ => return None,
        };
        total = total.checked_add(&part)?;
        matched = true;
    }

    matched.then_some(total)
}
