use std::fmt;
use std::time::Duration;

use chrono::{
    DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime, TimeDelta, Utc, Weekday,
};
use reading::parse_date_of_record;
use tracing::debug;

use crate::config::ScheduleConfig;
use crate::state::SchedulerState;

/// Floor for every computed sleep so a wake exactly on a boundary cannot spin.
pub const MIN_SLEEP: Duration = Duration::from_secs(1);

/// Where the scheduler stands at one wake. Derived fresh on every wake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Weekend,
    /// The last known reading applies to this later banking day.
    FutureDated(NaiveDate),
    OffHours,
    Preventive,
    Intensive,
    /// Intensive window after an early find: keep watching for a same-day revision.
    IntensiveWatch,
    Rested,
}

impl Phase {
    pub fn polls(self) -> bool {
        matches!(
            self,
            Phase::OffHours | Phase::Preventive | Phase::Intensive | Phase::IntensiveWatch
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Weekend => f.write_str("weekend"),
            Phase::FutureDated(date) => write!(f, "future-dated({date})"),
            Phase::OffHours => f.write_str("off-hours"),
            Phase::Preventive => f.write_str("preventive"),
            Phase::Intensive => f.write_str("intensive"),
            Phase::IntensiveWatch => f.write_str("intensive-watch"),
            Phase::Rested => f.write_str("rested"),
        }
    }
}

pub fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// First Monday-to-Friday date strictly after `date`.
pub fn next_weekday_after(date: NaiveDate) -> NaiveDate {
    let mut next = date + TimeDelta::days(1);
    while is_weekend(next) {
        next += TimeDelta::days(1);
    }
    next
}

pub fn local_to_utc(offset: FixedOffset, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    let local = date.and_time(time);
    (local - TimeDelta::seconds(i64::from(offset.local_minus_utc()))).and_utc()
}

fn until(now: DateTime<Utc>, target: DateTime<Utc>) -> Duration {
    (target - now).to_std().unwrap_or(Duration::ZERO)
}

fn future_date_of_record(state: &SchedulerState, today: NaiveDate) -> Option<NaiveDate> {
    let reading = state.last_known.as_ref()?;
    match parse_date_of_record(&reading.date_of_record) {
        Ok(date) if date > today => Some(date),
        Ok(_) => None,
        Err(err) => {
            debug!(error = %err, "date-of-record not usable for scheduling");
            None
        }
    }
}

/// Decides the phase for a wake at local time `now`.
///
/// A future-dated reading outranks the weekend rule: it is the more specific
/// condition, and its target may skip a holiday Monday.
pub fn classify(config: &ScheduleConfig, state: &SchedulerState, now: DateTime<FixedOffset>) -> Phase {
    let today = now.date_naive();
    if let Some(date) = future_date_of_record(state, today) {
        return Phase::FutureDated(date);
    }
    if is_weekend(today) {
        return Phase::Weekend;
    }

    let time = now.time();
    if time < config.preventive_start || time >= config.intensive_end {
        Phase::OffHours
    } else if time < config.intensive_start {
        Phase::Preventive
    } else if !state.found_today {
        Phase::Intensive
    } else if state.found_early {
        Phase::IntensiveWatch
    } else {
        Phase::Rested
    }
}

/// How long to sleep after handling `phase` at local time `now`.
pub fn next_delay(config: &ScheduleConfig, phase: Phase, now: DateTime<FixedOffset>) -> Duration {
    let offset = config.utc_offset;
    let now_utc = now.with_timezone(&Utc);
    let today = now.date_naive();
    let at = |date: NaiveDate, time: NaiveTime| until(now_utc, local_to_utc(offset, date, time));

    let delay = match phase {
        Phase::Weekend | Phase::Rested => at(next_weekday_after(today), config.preventive_start),
        Phase::FutureDated(date) => at(date, config.preventive_start),
        Phase::OffHours if now.time() < config.preventive_start => config
            .off_hours_interval
            .min(at(today, config.preventive_start)),
        Phase::OffHours => config.off_hours_interval,
        Phase::Preventive => config
            .preventive_interval
            .min(at(today, config.intensive_start)),
        Phase::Intensive => config
            .intensive_interval
            .min(at(today, config.intensive_end)),
        Phase::IntensiveWatch => config
            .early_found_interval
            .min(at(today, config.intensive_end)),
    };
    delay.max(MIN_SLEEP)
}
