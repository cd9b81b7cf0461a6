#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use metrics::SchedulerMetrics;
use reading::{
    Currency, FallbackCache, FetchError, Fetcher, Notifier, NotifyError, Reading, ReadingStore,
    StoreError,
};
use rust_decimal::Decimal;
use scheduler::{Collaborators, ManualClock, ScheduleConfig, Scheduler};

pub fn reading(date: &str, usd_cents: i64) -> Reading {
    Reading::new(
        date,
        [
            (Currency::Usd, Decimal::new(usd_cents, 2)),
            (Currency::Eur, Decimal::new(5812, 2)),
        ],
        Utc::now(),
    )
}

pub fn local(config: &ScheduleConfig, y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    let offset: FixedOffset = config.utc_offset;
    offset
        .with_ymd_and_hms(y, m, d, h, min, 0)
        .single()
        .expect("valid local time")
        .with_timezone(&Utc)
}

#[derive(Default)]
pub struct ScriptedFetcher {
    script: Mutex<VecDeque<Result<Reading, FetchError>>>,
    repeat: Mutex<Option<Reading>>,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn repeating(reading: Reading) -> Self {
        Self {
            repeat: Mutex::new(Some(reading)),
            ..Self::default()
        }
    }

    pub fn sequence(items: Vec<Result<Reading, FetchError>>) -> Self {
        Self {
            script: Mutex::new(items.into()),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self) -> Result<Reading, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(next) = self.script.lock().expect("script lock").pop_front() {
            return next;
        }
        match self.repeat.lock().expect("repeat lock").clone() {
            Some(reading) => Ok(reading),
            None => Err(FetchError::Http("connection refused".into())),
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<Vec<Reading>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn with(reading: Reading) -> Self {
        let store = Self::default();
        store.rows.lock().expect("rows lock").push(reading);
        store
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn rows(&self) -> Vec<Reading> {
        self.rows.lock().expect("rows lock").clone()
    }
}

#[async_trait]
impl ReadingStore for MemoryStore {
    async fn latest(&self) -> Result<Option<Reading>, StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Database("connection reset".into()));
        }
        Ok(self.rows.lock().expect("rows lock").last().cloned())
    }

    async fn append(&self, reading: &Reading) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Database("connection reset".into()));
        }
        self.rows.lock().expect("rows lock").push(reading.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCache {
    slot: Mutex<Option<Reading>>,
}

impl MemoryCache {
    pub fn with(reading: Reading) -> Self {
        Self {
            slot: Mutex::new(Some(reading)),
        }
    }

    pub fn get(&self) -> Option<Reading> {
        self.slot.lock().expect("slot lock").clone()
    }
}

#[async_trait]
impl FallbackCache for MemoryCache {
    async fn save(&self, reading: &Reading) -> Result<(), StoreError> {
        *self.slot.lock().expect("slot lock") = Some(reading.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<Reading>, StoreError> {
        Ok(self.get())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Delivery {
    #[default]
    Ok,
    Rejected,
    Stalled,
}

/// Records every attempted message, then delivers, rejects or never returns.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<String>>,
    delivery: Delivery,
}

impl RecordingNotifier {
    pub fn with_delivery(delivery: Delivery) -> Self {
        Self {
            delivery,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().expect("sent lock").clone()
    }

    pub fn count_containing(&self, needle: &str) -> usize {
        self.sent().iter().filter(|m| m.contains(needle)).count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        self.sent.lock().expect("sent lock").push(text.to_string());
        match self.delivery {
            Delivery::Ok => Ok(()),
            Delivery::Rejected => Err(NotifyError::Rejected("chat not found".into())),
            Delivery::Stalled => std::future::pending().await,
        }
    }
}

pub struct Harness {
    pub scheduler: Scheduler,
    pub fetcher: Arc<ScriptedFetcher>,
    pub store: Arc<MemoryStore>,
    pub cache: Arc<MemoryCache>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: ManualClock,
}

impl Harness {
    pub fn new(
        start: DateTime<Utc>,
        fetcher: ScriptedFetcher,
        store: MemoryStore,
        cache: MemoryCache,
    ) -> Self {
        Self::with_notifier(start, fetcher, store, cache, RecordingNotifier::default())
    }

    pub fn with_notifier(
        start: DateTime<Utc>,
        fetcher: ScriptedFetcher,
        store: MemoryStore,
        cache: MemoryCache,
        notifier: RecordingNotifier,
    ) -> Self {
        let fetcher = Arc::new(fetcher);
        let store = Arc::new(store);
        let cache = Arc::new(cache);
        let notifier = Arc::new(notifier);
        let clock = ManualClock::new(start);
        let scheduler = Scheduler::new(
            ScheduleConfig::default(),
            Collaborators {
                fetcher: fetcher.clone(),
                store: store.clone(),
                cache: cache.clone(),
                notifier: notifier.clone(),
                clock: Arc::new(clock.clone()),
            },
            SchedulerMetrics::detached().expect("metrics"),
        );
        Self {
            scheduler,
            fetcher,
            store,
            cache,
            notifier,
            clock,
        }
    }
}
