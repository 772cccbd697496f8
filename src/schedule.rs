//! Cron arithmetic for the backup scheduler.
//!
//! Expressions use the standard five-field dialect (`min hour dom month dow`)
//! or `@daily`-style descriptors. They are translated to the seven-field
//! dialect of the `cron` crate before parsing.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use thiserror::Error;

/// Upper bound on fire times walked between the last known run and now.
pub const MAX_MISSED_RUNS: usize = 100;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("Unparseable schedule {expr:?}: {source}")]
    InvalidSchedule {
        expr: String,
        #[source]
        source: cron::error::Error,
    },
    #[error("Too many missed start times (> 100), check clock skew or the schedule")]
    TooManyMissedRuns,
    #[error("Next schedule not found")]
    NextScheduleNotFound,
}

pub fn parse(expr: &str) -> Result<Schedule, ScheduleError> {
    Schedule::from_str(&normalize(expr)).map_err(|source| ScheduleError::InvalidSchedule {
        expr: expr.to_string(),
        source,
    })
}

/// Returns (last missed run, next run).
///
/// Fire times are walked forward from `last_executed`, or `created_at` when
/// nothing has run yet. The missed run is the latest fire time not after
/// `now`; `None` means nothing is due.
pub fn next_schedule(
    expr: &str,
    last_executed: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(Option<DateTime<Utc>>, DateTime<Utc>), ScheduleError> {
    let sched = parse(expr)?;
    let earliest_time = last_executed.unwrap_or(created_at);

    let mut missed_run = None;
    let mut walked = 0;
    for fire_time in sched.after(&earliest_time) {
        if fire_time > now {
            return Ok((missed_run, fire_time));
        }
        walked += 1;
        if walked > MAX_MISSED_RUNS {
            return Err(ScheduleError::TooManyMissedRuns);
        }
        missed_run = Some(fire_time);
    }

    Err(ScheduleError::NextScheduleNotFound)
}

fn normalize(expr: &str) -> String {
    let expr = expr.trim();
    if expr.starts_with('@') {
        return expr.to_string();
    }
    let fields = expr.split_whitespace().collect::<Vec<_>>();
    if fields.len() != 5 {
        return expr.to_string();
    }
    format!(
        "0 {} {} {} {} {}",
        fields[0],
        fields[1],
        fields[2],
        fields[3],
        translate_day_of_week(fields[4])
    )
}

/// Standard cron numbers Sunday as 0 (or 7); the `cron` crate uses 1..=7
/// starting at Sunday. Names and wildcards pass through unchanged.
fn translate_day_of_week(field: &str) -> String {
    field
        .split(',')
        .map(translate_day_of_week_part)
        .collect::<Vec<_>>()
        .join(",")
}

fn translate_day_of_week_part(part: &str) -> String {
    let (range, step) = match part.split_once('/') {
        Some((range, step)) => (range, Some(step)),
        None => (part, None),
    };
    let step_by = match step.map(str::parse::<usize>) {
        None => 1,
        Some(Ok(step_by)) if step_by > 0 => step_by,
        Some(_) => return part.to_string(),
    };
    let (start, end) = match range.split_once('-') {
        Some((start, end)) => match (start.parse::<u32>(), end.parse::<u32>()) {
            (Ok(start), Ok(end)) if start <= end && end <= 7 => (start, end),
            _ => return part.to_string(),
        },
        None => match range.parse::<u32>() {
            Ok(day) if day <= 7 && step.is_none() => return shift_day(day).to_string(),
            Ok(day) if day <= 7 => return format!("{}/{step_by}", shift_day(day)),
            _ => return part.to_string(),
        },
    };

    if end < 7 {
        let shifted = format!("{}-{}", shift_day(start), shift_day(end));
        return match step {
            Some(_) => format!("{shifted}/{step_by}"),
            None => shifted,
        };
    }

    // 7 and 0 are both Sunday, so ranges ending at 7 wrap and are listed out.
    let days = (start..=end)
        .step_by(step_by)
        .map(shift_day)
        .collect::<BTreeSet<_>>();
    if days.len() == 7 {
        return "*".to_string();
    }
    days.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn shift_day(day: u32) -> u32 {
    day % 7 + 1
}

#[cfg(test)]
mod tests {
    use chrono::{Datelike, TimeZone, Weekday};

    use super::*;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn daily_schedule_reports_latest_missed_run() {
        let (missed, next) = next_schedule(
            "0 0 * * *",
            Some(at("2020-04-01T00:00:00Z")),
            at("2020-03-01T00:00:00Z"),
            at("2020-04-02T00:00:30Z"),
        )
        .unwrap();
        assert_eq!(missed, Some(at("2020-04-02T00:00:00Z")));
        assert_eq!(next, at("2020-04-03T00:00:00Z"));
    }

    #[test]
    fn falls_back_to_creation_time() {
        let (missed, next) = next_schedule(
            "*/15 * * * *",
            None,
            at("2020-04-01T10:05:00Z"),
            at("2020-04-01T10:40:00Z"),
        )
        .unwrap();
        assert_eq!(missed, Some(at("2020-04-01T10:30:00Z")));
        assert_eq!(next, at("2020-04-01T10:45:00Z"));
    }

    #[test]
    fn nothing_due_yields_no_missed_run() {
        let (missed, next) = next_schedule(
            "0 0 * * *",
            Some(at("2020-04-02T00:00:00Z")),
            at("2020-03-01T00:00:00Z"),
            at("2020-04-02T12:00:00Z"),
        )
        .unwrap();
        assert_eq!(missed, None);
        assert_eq!(next, at("2020-04-03T00:00:00Z"));
    }

    #[test]
    fn invalid_expression_is_rejected() {
        let err = next_schedule(
            "a b * * *",
            None,
            at("2020-04-01T00:00:00Z"),
            at("2020-04-02T00:00:00Z"),
        )
        .unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidSchedule { .. }));
    }

    #[test]
    fn long_backlog_is_rejected() {
        let err = next_schedule(
            "* * * * *",
            Some(at("2020-04-01T00:00:00Z")),
            at("2020-04-01T00:00:00Z"),
            at("2020-04-01T03:00:00Z"),
        )
        .unwrap_err();
        assert!(matches!(err, ScheduleError::TooManyMissedRuns));
    }

    #[test]
    fn exactly_one_hundred_missed_runs_is_allowed() {
        let (missed, _) = next_schedule(
            "* * * * *",
            Some(at("2020-04-01T00:00:00Z")),
            at("2020-04-01T00:00:00Z"),
            at("2020-04-01T01:40:30Z"),
        )
        .unwrap();
        assert_eq!(missed, Some(at("2020-04-01T01:40:00Z")));
    }

    #[test]
    fn descriptors_are_accepted() {
        let sched = parse("@daily").unwrap();
        let next = sched
            .after(&Utc.with_ymd_and_hms(2020, 4, 1, 6, 0, 0).unwrap())
            .next()
            .unwrap();
        assert_eq!(next, at("2020-04-02T00:00:00Z"));
    }

    #[test]
    fn day_of_week_follows_standard_numbering() {
        assert_eq!(translate_day_of_week("0"), "1");
        assert_eq!(translate_day_of_week("7"), "1");
        assert_eq!(translate_day_of_week("1-5"), "2-6");
        assert_eq!(translate_day_of_week("5-7"), "1,6,7");
        assert_eq!(translate_day_of_week("0-7"), "*");
        assert_eq!(translate_day_of_week("1-7"), "*");
        assert_eq!(translate_day_of_week("1-7/2"), "1,2,4,6");
        assert_eq!(translate_day_of_week("0-6/2"), "1-7/2");
        assert_eq!(translate_day_of_week("1,3-7/2"), "2,1,4,6");
        assert_eq!(translate_day_of_week("MON,WED"), "MON,WED");
        assert_eq!(translate_day_of_week("*"), "*");

        // 2020-04-05 is a Sunday.
        let sched = parse("30 2 * * 0").unwrap();
        let next = sched
            .after(&Utc.with_ymd_and_hms(2020, 4, 1, 0, 0, 0).unwrap())
            .next()
            .unwrap();
        assert_eq!(next.weekday(), Weekday::Sun);
        assert_eq!(next, at("2020-04-05T02:30:00Z"));
    }

    #[test]
    fn full_week_and_stepped_ranges_fire_on_the_right_days() {
        let from = Utc.with_ymd_and_hms(2020, 4, 1, 0, 0, 0).unwrap();

        // 2020-04-01 is a Wednesday.
        let every_day = parse("30 2 * * 0-7").unwrap();
        assert_eq!(every_day.after(&from).next(), Some(at("2020-04-01T02:30:00Z")));

        let odd_days = parse("30 2 * * 1-7/2").unwrap();
        let weekdays = odd_days
            .after(&from)
            .take(4)
            .map(|fire| fire.weekday())
            .collect::<Vec<_>>();
        assert_eq!(weekdays, [Weekday::Wed, Weekday::Fri, Weekday::Sun, Weekday::Mon]);

        let even_days = parse("30 2 * * 0-6/2").unwrap();
        let weekdays = even_days
            .after(&from)
            .take(4)
            .map(|fire| fire.weekday())
            .collect::<Vec<_>>();
        assert_eq!(weekdays, [Weekday::Thu, Weekday::Sat, Weekday::Sun, Weekday::Tue]);
    }
}
