use async_trait::async_trait;
use thiserror::Error;

use crate::Reading;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("publisher request failed: {0}")]
    Http(String),
    #[error("publisher responded with status {0}")]
    Status(u16),
    #[error("publisher page could not be parsed: {0}")]
    Parse(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored reading is malformed: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification transport failed: {0}")]
    Transport(String),
    #[error("notification rejected: {0}")]
    Rejected(String),
}

/// One request to the publisher, no retries.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self) -> Result<Reading, FetchError>;
}

#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Most recently captured reading.
    async fn latest(&self) -> Result<Option<Reading>, StoreError>;
    async fn append(&self, reading: &Reading) -> Result<(), StoreError>;
}

/// Single-slot on-disk copy of the last known reading.
#[async_trait]
pub trait FallbackCache: Send + Sync {
    async fn save(&self, reading: &Reading) -> Result<(), StoreError>;
    async fn load(&self) -> Result<Option<Reading>, StoreError>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str) -> Result<(), NotifyError>;
}
