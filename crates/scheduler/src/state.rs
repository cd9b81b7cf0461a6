use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use reading::Reading;

/// Everything the polling loop remembers between wakes.
///
/// Owned by the loop and threaded through it by value; nothing else holds it.
/// None of it is persisted: the day flags are re-derived by polling again,
/// and change detection compares against `last_known`, not the flags.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerState {
    pub last_known: Option<Reading>,
    pub current_day: NaiveDate,
    pub found_today: bool,
    pub found_early: bool,
    /// The once-a-day intensive window check-in has been sent.
    pub checked_in_today: bool,
    pub last_error_notified_at: Option<DateTime<Utc>>,
    /// New readings whose store append failed, oldest first.
    pub pending_appends: Vec<Reading>,
}

impl SchedulerState {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            last_known: None,
            current_day: today,
            found_today: false,
            found_early: false,
            checked_in_today: false,
            last_error_notified_at: None,
            pending_appends: Vec::new(),
        }
    }

    /// Resets the day flags when `today` is past `current_day`. Returns whether it did.
    pub fn roll_over(&mut self, today: NaiveDate) -> bool {
        if today <= self.current_day {
            return false;
        }
        self.current_day = today;
        self.found_today = false;
        self.found_early = false;
        self.checked_in_today = false;
        true
    }

    pub fn failure_notice_due(&self, now: DateTime<Utc>, cooldown: Duration) -> bool {
        match self.last_error_notified_at {
            None => true,
            Some(last) => (now - last).to_std().map_or(false, |elapsed| elapsed >= cooldown),
        }
    }
}
