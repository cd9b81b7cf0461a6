use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, TimeDelta, Utc};
use metrics::SchedulerMetrics;
use reading::{is_new, FallbackCache, Fetcher, Notifier, Reading, ReadingStore};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::ScheduleConfig;
use crate::messages;
use crate::phase::{classify, next_delay, Phase};
use crate::state::SchedulerState;

const INTENSIVE_CHECK_IN: &str = "Intensive polling window is open.";
const ON_DEMAND_CHECK: &str = "On-demand check requested.";

pub struct Collaborators {
    pub fetcher: Arc<dyn Fetcher>,
    pub store: Arc<dyn ReadingStore>,
    pub cache: Arc<dyn FallbackCache>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}

/// Outcome of one wake: what the scheduler saw and how long it will sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wake {
    pub phase: Phase,
    pub delay: Duration,
}

/// Operator request for an immediate poll; the note frames the reply.
#[derive(Debug, Clone, Default)]
pub struct PollRequest {
    pub note: Option<String>,
}

/// Read-only copy of the loop's state, published after every wake.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    pub phase: String,
    pub found_today: bool,
    pub found_early: bool,
    pub last_date_of_record: Option<String>,
    pub last_primary: Option<String>,
    pub next_wake_at: Option<DateTime<Utc>>,
    pub pending_appends: usize,
}

impl StatusSnapshot {
    fn capture(state: &SchedulerState, phase: Phase, next_wake_at: DateTime<Utc>) -> Self {
        Self {
            phase: phase.to_string(),
            found_today: state.found_today,
            found_early: state.found_early,
            last_date_of_record: state.last_known.as_ref().map(|r| r.date_of_record.clone()),
            last_primary: state.last_known.as_ref().map(|r| r.primary().to_string()),
            next_wake_at: Some(next_wake_at),
            pending_appends: state.pending_appends.len(),
        }
    }
}

pub struct Scheduler {
    config: ScheduleConfig,
    deps: Collaborators,
    metrics: SchedulerMetrics,
}

impl Scheduler {
    pub fn new(config: ScheduleConfig, deps: Collaborators, metrics: SchedulerMetrics) -> Self {
        Self {
            config,
            deps,
            metrics,
        }
    }

    pub fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    fn local_now(&self) -> DateTime<FixedOffset> {
        self.deps.clock.now().with_timezone(&self.config.utc_offset)
    }

    /// Seeds the state, announces the start and polls once regardless of window.
    pub async fn start(&self) -> SchedulerState {
        let state = SchedulerState::new(self.local_now().date_naive());
        let state = self.load_last_known(state).await;
        self.notify(&messages::startup(state.last_known.as_ref())).await;
        self.poll(state, None).await
    }

    async fn load_last_known(&self, mut state: SchedulerState) -> SchedulerState {
        match self.deps.store.latest().await {
            Ok(Some(reading)) => {
                info!(
                    date_of_record = %reading.date_of_record,
                    primary = %reading.primary(),
                    "last known reading loaded from store"
                );
                state.last_known = Some(reading);
                return state;
            }
            Ok(None) => info!("store holds no readings; checking local cache"),
            Err(err) => {
                self.metrics.store_failures.inc();
                warn!(error = %err, "store unavailable at startup; falling back to local cache");
            }
        }

        match self.deps.cache.load().await {
            Ok(Some(reading)) => {
                info!(date_of_record = %reading.date_of_record, "last known reading loaded from local cache");
                state.last_known = Some(reading);
            }
            Ok(None) => info!("no last known reading"),
            Err(err) => warn!(error = %err, "local cache unreadable"),
        }
        state
    }

    /// Handles one wake: day rollover, phase decision, an optional poll.
    pub async fn tick(&self, mut state: SchedulerState) -> (SchedulerState, Wake) {
        let now = self.local_now();
        if state.roll_over(now.date_naive()) {
            info!(day = %state.current_day, "new operating day");
        }

        let phase = classify(&self.config, &state, now);
        if phase.polls() {
            let check_in = phase == Phase::Intensive && !state.checked_in_today;
            if check_in {
                state.checked_in_today = true;
            }
            state = self
                .poll(state, check_in.then_some(INTENSIVE_CHECK_IN))
                .await;
        }

        let delay = next_delay(&self.config, phase, self.local_now());
        info!(%phase, delay_secs = delay.as_secs(), "next wake scheduled");
        (state, Wake { phase, delay })
    }

    /// One fetch plus its consequences. With a `context`, an unchanged result
    /// is reported to the operator instead of staying silent.
    pub async fn poll(&self, state: SchedulerState, context: Option<&str>) -> SchedulerState {
        self.metrics.polls.inc();
        let mut state = self.flush_pending(state).await;

        let reading = match self.deps.fetcher.fetch().await {
            Ok(reading) if reading.is_valid() => reading,
            Ok(reading) => {
                self.metrics.invalid_readings.inc();
                warn!(primary = %reading.primary(), "fetched reading is invalid; discarded");
                let detail = format!(
                    "publisher returned an invalid reading (primary value {})",
                    reading.primary()
                );
                return self.report_failure(state, &detail).await;
            }
            Err(err) => {
                self.metrics.fetch_failures.inc();
                warn!(error = %err, "fetch failed");
                return self.report_failure(state, &err.to_string()).await;
            }
        };

        if !is_new(state.last_known.as_ref(), &reading) {
            debug!(date_of_record = %reading.date_of_record, "no change");
            if let Some(context) = context {
                self.notify(&messages::no_change(context, state.last_known.as_ref()))
                    .await;
            }
            return state;
        }

        let early = self.local_now().time() < self.config.intensive_start;
        info!(
            date_of_record = %reading.date_of_record,
            primary = %reading.primary(),
            early,
            "new reading detected"
        );

        state = self.persist(state, &reading).await;
        state.found_today = true;
        if early {
            state.found_early = true;
        }
        self.notify(&messages::new_reading(&reading, early)).await;
        state.last_known = Some(reading);
        state
    }

    async fn persist(&self, mut state: SchedulerState, reading: &Reading) -> SchedulerState {
        if let Err(err) = self.deps.cache.save(reading).await {
            warn!(error = %err, "local cache update failed");
        }
        if !state.pending_appends.is_empty() {
            // The queue was retried at the start of this poll; older readings land first.
            state.pending_appends.push(reading.clone());
            return state;
        }
        match self.deps.store.append(reading).await {
            Ok(()) => {
                self.metrics.readings_stored.inc();
                state
            }
            Err(err) => {
                self.metrics.store_failures.inc();
                warn!(error = %err, "store append failed; reading kept for a later cycle");
                state.pending_appends.push(reading.clone());
                let detail = format!("could not store the new reading: {err}");
                self.report_failure(state, &detail).await
            }
        }
    }

    async fn flush_pending(&self, mut state: SchedulerState) -> SchedulerState {
        let mut failure = None;
        while let Some(reading) = state.pending_appends.first() {
            match self.deps.store.append(reading).await {
                Ok(()) => {
                    info!(date_of_record = %reading.date_of_record, "deferred reading stored");
                    self.metrics.readings_stored.inc();
                    state.pending_appends.remove(0);
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        match failure {
            Some(err) => {
                self.metrics.store_failures.inc();
                let pending = state.pending_appends.len();
                warn!(error = %err, pending, "store still unavailable");
                let detail = format!("could not store {pending} queued reading(s): {err}");
                self.report_failure(state, &detail).await
            }
            None => state,
        }
    }

    async fn report_failure(&self, mut state: SchedulerState, detail: &str) -> SchedulerState {
        let now = self.deps.clock.now();
        if state.failure_notice_due(now, self.config.failure_cooldown) {
            state.last_error_notified_at = Some(now);
            self.notify(&messages::failure(detail)).await;
        } else {
            debug!(detail, "failure notice suppressed by cooldown");
        }
        state
    }

    async fn notify(&self, text: &str) {
        self.notify_within(text, self.config.notify_timeout).await;
    }

    async fn notify_within(&self, text: &str, limit: Duration) {
        match tokio::time::timeout(limit, self.deps.notifier.send(text)).await {
            Ok(Ok(())) => self.metrics.notifications_sent.inc(),
            Ok(Err(err)) => {
                self.metrics.notification_failures.inc();
                warn!(error = %err, "notification failed");
            }
            Err(_) => {
                self.metrics.notification_failures.inc();
                warn!(timeout = ?limit, "notification timed out");
            }
        }
    }

    /// Best-effort goodbye, bounded by the shutdown timeout.
    pub async fn shutdown(&self, state: &SchedulerState) {
        info!("scheduler stopping");
        self.notify_within(
            &messages::shutdown(state.last_known.as_ref()),
            self.config.shutdown_notify_timeout,
        )
        .await;
    }

    /// The long-lived loop. Sleeps are cut short by `cancel`; a poll request
    /// is served without moving the scheduled wake.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        mut requests: mpsc::Receiver<PollRequest>,
        status: watch::Sender<StatusSnapshot>,
    ) -> SchedulerState {
        let mut state = self.start().await;

        'wakes: while !cancel.is_cancelled() {
            let (next, wake) = self.tick(state).await;
            state = next;
            let deadline = Instant::now() + wake.delay;
            self.publish(&status, &state, wake.phase, deadline);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break 'wakes,
                    _ = tokio::time::sleep_until(deadline) => break,
                    Some(request) = requests.recv() => {
                        let note = request.note.unwrap_or_else(|| ON_DEMAND_CHECK.to_string());
                        info!(%note, "on-demand poll");
                        state = self.poll(state, Some(&note)).await;
                        self.publish(&status, &state, wake.phase, deadline);
                    }
                }
            }
        }

        self.shutdown(&state).await;
        state
    }

    fn publish(
        &self,
        status: &watch::Sender<StatusSnapshot>,
        state: &SchedulerState,
        phase: Phase,
        deadline: Instant,
    ) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let next_wake_at = self.deps.clock.now()
            + TimeDelta::from_std(remaining).unwrap_or(TimeDelta::zero());
        status.send_replace(StatusSnapshot::capture(state, phase, next_wake_at));
    }
}
