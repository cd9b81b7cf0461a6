use std::time::Duration;

use chrono::{FixedOffset, NaiveTime, Offset, Utc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("utc offset of {0} minutes is out of range")]
    InvalidOffset(i32),
    #[error("windows must satisfy preventive start < intensive start < intensive end")]
    WindowOrder,
    #[error("interval `{0}` must be non-zero")]
    ZeroInterval(&'static str),
}

/// Window boundaries and polling cadence.
///
/// Boundaries are wall-clock times in the operating timezone. The preventive
/// window is `[preventive_start, intensive_start)`, the intensive window is
/// `[intensive_start, intensive_end)`; anything else on a weekday is off-hours.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub utc_offset: FixedOffset,
    pub preventive_start: NaiveTime,
    pub intensive_start: NaiveTime,
    pub intensive_end: NaiveTime,
    pub off_hours_interval: Duration,
    pub preventive_interval: Duration,
    pub intensive_interval: Duration,
    pub early_found_interval: Duration,
    pub failure_cooldown: Duration,
    pub notify_timeout: Duration,
    pub shutdown_notify_timeout: Duration,
}

pub const DEFAULT_UTC_OFFSET_MINUTES: i32 = -4 * 60;

const fn minutes(n: u64) -> Duration {
    Duration::from_secs(n * 60)
}

fn hm(hour: u32, min: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, min, 0).unwrap_or(NaiveTime::MIN)
}

pub fn utc_offset_from_minutes(offset_minutes: i32) -> Result<FixedOffset, ConfigError> {
    offset_minutes
        .checked_mul(60)
        .and_then(FixedOffset::east_opt)
        .ok_or(ConfigError::InvalidOffset(offset_minutes))
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            utc_offset: utc_offset_from_minutes(DEFAULT_UTC_OFFSET_MINUTES)
                .unwrap_or_else(|_| Utc.fix()),
            preventive_start: hm(8, 0),
            intensive_start: hm(15, 0),
            intensive_end: hm(20, 0),
            off_hours_interval: minutes(30),
            preventive_interval: minutes(120),
            intensive_interval: minutes(5),
            early_found_interval: minutes(30),
            failure_cooldown: minutes(60),
            notify_timeout: Duration::from_secs(10),
            shutdown_notify_timeout: Duration::from_secs(5),
        }
    }
}

impl ScheduleConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.preventive_start < self.intensive_start
            && self.intensive_start < self.intensive_end)
        {
            return Err(ConfigError::WindowOrder);
        }
        let intervals = [
            ("off_hours_interval", self.off_hours_interval),
            ("preventive_interval", self.preventive_interval),
            ("intensive_interval", self.intensive_interval),
            ("early_found_interval", self.early_found_interval),
            ("notify_timeout", self.notify_timeout),
            ("shutdown_notify_timeout", self.shutdown_notify_timeout),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(ConfigError::ZeroInterval(name));
            }
        }
        Ok(())
    }
}
