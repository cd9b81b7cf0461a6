mod clock;
mod config;
mod engine;
pub mod messages;
mod phase;
mod state;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{utc_offset_from_minutes, ConfigError, ScheduleConfig, DEFAULT_UTC_OFFSET_MINUTES};
pub use engine::{Collaborators, PollRequest, Scheduler, StatusSnapshot, Wake};
pub use phase::{classify, is_weekend, local_to_utc, next_delay, next_weekday_after, Phase, MIN_SLEEP};
pub use state::SchedulerState;
