//! Pure schedule arithmetic for the CronOperation controller.

use std::str::FromStr as _;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use thiserror::Error;

/// How many due times are scanned before the controller gives up. Reaching
/// this means the clock jumped or the controller was down for a very long
/// time; firing is skipped rather than guessing.
const MAX_SCANNED_TIMES: u32 = 100;

/// Ways schedule arithmetic can fail.
#[derive(Debug, Error)]
pub enum Error {
    /// The expression is not a standard five field cron expression.
    #[error("invalid schedule {expression:?}")]
    InvalidSchedule {
        /// The rejected expression.
        expression: String,
        /// Why it was rejected.
        #[source]
        source: cron::error::Error,
    },
    /// The expression has the wrong number of fields.
    #[error("expected 5 cron fields (minute hour day month weekday), got {0}")]
    WrongFieldCount(usize),
    /// More than [`MAX_SCANNED_TIMES`] runs came due since the last one.
    #[error("more than {MAX_SCANNED_TIMES} runs came due; skipping them all")]
    TooManyDueTimes,
}

/// Parse a standard five field cron expression.
///
/// The cron crate wants seconds and year fields, so the expression is
/// widened to `0 <expr> *` first: fire at second zero, any year.
pub fn parse(expression: &str) -> Result<Schedule, Error> {
    let fields = expression.split_whitespace().count();
    if fields != 5 {
        return Err(Error::WrongFieldCount(fields));
    }
    Schedule::from_str(&format!("0 {expression} *")).map_err(|source| Error::InvalidSchedule {
        expression: expression.to_string(),
        source,
    })
}

/// What is due at `now` for a schedule last fired at `earliest`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Due {
    /// The most recent due time still inside the starting deadline, if any.
    /// Older unfired times are skipped rather than backfilled.
    pub scheduled: Option<DateTime<Utc>>,
    /// Due times that fell outside the starting deadline.
    pub missed: u32,
}

/// Scan the due times in `(earliest, now]`.
///
/// `deadline` is the starting deadline: a due time older than `now -
/// deadline` is missed, not fired. `None` means no deadline.
pub fn due_times(
    schedule: &Schedule,
    earliest: DateTime<Utc>,
    now: DateTime<Utc>,
    deadline: Option<Duration>,
) -> Result<Due, Error> {
    let cutoff = deadline.map(|d| now - d);
    let mut due = Due::default();
    let mut scanned = 0u32;
    for time in schedule.after(&earliest) {
        if time > now {
            break;
        }
        scanned += 1;
        if scanned > MAX_SCANNED_TIMES {
            return Err(Error::TooManyDueTimes);
        }
        match cutoff {
            Some(cutoff) if time < cutoff => due.missed += 1,
            _ => due.scheduled = Some(time),
        }
    }
    Ok(due)
}

/// The next time after `now` the schedule fires, and how long that is from
/// `now`. Cron expressions always have a next time within a few years, but
/// the iterator is not guaranteed non-empty, hence the option.
pub fn next_after(schedule: &Schedule, now: DateTime<Utc>) -> Option<(DateTime<Utc>, Duration)> {
    let next = schedule.after(&now).next()?;
    Some((next, (next - now).to_std().unwrap_or(Duration::ZERO)))
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn five_field_expressions_parse() {
        assert!(parse("0 * * * *").is_ok());
        assert!(parse("*/5 1-3 * * mon-fri").is_ok());
        assert!(matches!(parse("* * * *"), Err(Error::WrongFieldCount(4))));
        assert!(matches!(
            parse("99 * * * *"),
            Err(Error::InvalidSchedule { .. })
        ));
    }

    #[test]
    fn the_latest_due_time_wins() {
        let schedule = parse("0 * * * *").unwrap();
        // Three runs came due since the last fire; only the latest fires.
        let due = due_times(
            &schedule,
            utc(2024, 5, 1, 9, 30, 0),
            utc(2024, 5, 1, 12, 30, 0),
            None,
        )
        .unwrap();
        assert_eq!(due.scheduled, Some(utc(2024, 5, 1, 12, 0, 0)));
        assert_eq!(due.missed, 0);
    }

    #[test]
    fn nothing_is_due_before_the_first_tick() {
        let schedule = parse("0 * * * *").unwrap();
        let due = due_times(
            &schedule,
            utc(2024, 5, 1, 12, 5, 0),
            utc(2024, 5, 1, 12, 30, 0),
            None,
        )
        .unwrap();
        assert_eq!(due.scheduled, None);
    }

    #[test]
    fn the_starting_deadline_turns_old_runs_into_misses() {
        let schedule = parse("0 * * * *").unwrap();
        // Due at 10:00, 11:00, 12:00; a 30 minute deadline at 12:10 only
        // leaves 12:00 eligible.
        let due = due_times(
            &schedule,
            utc(2024, 5, 1, 9, 30, 0),
            utc(2024, 5, 1, 12, 10, 0),
            Some(Duration::from_secs(30 * 60)),
        )
        .unwrap();
        assert_eq!(due.scheduled, Some(utc(2024, 5, 1, 12, 0, 0)));
        assert_eq!(due.missed, 2);
    }

    #[test]
    fn a_tick_exactly_at_now_is_due() {
        let schedule = parse("0 * * * *").unwrap();
        let due = due_times(
            &schedule,
            utc(2024, 5, 1, 11, 30, 0),
            utc(2024, 5, 1, 12, 0, 0),
            None,
        )
        .unwrap();
        assert_eq!(due.scheduled, Some(utc(2024, 5, 1, 12, 0, 0)));
    }

    #[test]
    fn a_deadline_can_miss_everything() {
        let schedule = parse("0 * * * *").unwrap();
        let due = due_times(
            &schedule,
            utc(2024, 5, 1, 11, 30, 0),
            utc(2024, 5, 1, 12, 45, 0),
            Some(Duration::from_secs(10 * 60)),
        )
        .unwrap();
        assert_eq!(due.scheduled, None);
        assert_eq!(due.missed, 1);
    }

    #[test]
    fn runaway_backlogs_are_refused() {
        let schedule = parse("* * * * *").unwrap();
        let result = due_times(
            &schedule,
            utc(2024, 5, 1, 0, 0, 0),
            utc(2024, 5, 2, 0, 0, 0),
            None,
        );
        assert!(matches!(result, Err(Error::TooManyDueTimes)));
    }

    #[test]
    fn next_fire_time_is_strictly_after_now() {
        let schedule = parse("0 * * * *").unwrap();
        let (next, wait) = next_after(&schedule, utc(2024, 5, 1, 12, 30, 0)).unwrap();
        assert_eq!(next, utc(2024, 5, 1, 13, 0, 0));
        assert_eq!(wait, Duration::from_secs(30 * 60));

        // Exactly on a tick, the next one is an hour out.
        let (next, _) = next_after(&schedule, utc(2024, 5, 1, 12, 0, 0)).unwrap();
        assert_eq!(next, utc(2024, 5, 1, 13, 0, 0));
    }
}
