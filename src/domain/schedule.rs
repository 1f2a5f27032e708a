//! Cron schedule parsing.
//!
//! Endpoints accept the standard five-field form (`min hour dom month dow`),
//! the seconds-first six/seven-field form understood by the `cron` crate, and
//! the `@hourly`-style descriptors.

use std::str::FromStr;

use apalis_cron::Schedule;
use chrono::{DateTime, Utc};

use super::error::DomainError;

/// Parse a schedule expression, normalizing the five-field form.
pub fn parse_schedule(expr: &str) -> Result<Schedule, DomainError> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(DomainError::validation("schedule expression is empty"));
    }

    let normalized = normalize(expr)?;
    Schedule::from_str(&normalized)
        .map_err(|err| DomainError::validation(format!("invalid schedule `{expr}`: {err}")))
}

/// The first fire time strictly after `after`, if the schedule has one.
pub fn next_fire(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

fn normalize(expr: &str) -> Result<String, DomainError> {
    if expr.starts_with('@') {
        return Ok(expr.to_string());
    }

    let fields: Vec<&str> = expr.split_whitespace().collect();
    match fields.len() {
        5 => {
            let day_of_week = shift_day_of_week(fields[4])?;
            Ok(format!(
                "0 {} {} {} {} {}",
                fields[0], fields[1], fields[2], fields[3], day_of_week
            ))
        }
        6 | 7 => Ok(fields.join(" ")),
        n => Err(DomainError::validation(format!(
            "invalid schedule `{expr}`: expected 5, 6 or 7 fields, found {n}"
        ))),
    }
}

// Standard cron numbers weekdays 0-7 from Sunday; the `cron` crate uses 1-7.
fn shift_day_of_week(field: &str) -> Result<String, DomainError> {
    let mut items = Vec::new();
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => (base, Some(step)),
            None => (item, None),
        };

        let shifted_base = base
            .split('-')
            .map(shift_weekday)
            .collect::<Result<Vec<_>, _>>()?
            .join("-");

        items.push(match step {
            Some(step) => format!("{shifted_base}/{step}"),
            None => shifted_base,
        });
    }
    Ok(items.join(","))
}

fn shift_weekday(token: &str) -> Result<String, DomainError> {
    match token.parse::<u8>() {
        Ok(day @ 0..=6) => Ok((day + 1).to_string()),
        Ok(7) => Ok("1".to_string()),
        Ok(day) => Err(DomainError::validation(format!(
            "day of week `{day}` is out of range 0-7"
        ))),
        Err(_) => Ok(token.to_string()),
    }
}
