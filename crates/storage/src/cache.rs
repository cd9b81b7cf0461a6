use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reading::{FallbackCache, Reading, StoreError};
use tokio::fs;
use tracing::debug;

/// Last known reading as a JSON file, used when the database is unreachable.
#[derive(Debug, Clone)]
pub struct LocalCache {
    path: PathBuf,
}

impl LocalCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl FallbackCache for LocalCache {
    async fn save(&self, reading: &Reading) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let body = serde_json::to_vec_pretty(reading)
            .map_err(|err| StoreError::Malformed(err.to_string()))?;
        // The slot is replaced by rename, never rewritten in place.
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, body).await?;
        fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), "local cache updated");
        Ok(())
    }

    async fn load(&self) -> Result<Option<Reading>, StoreError> {
        let body = match fs::read(&self.path).await {
            Ok(body) => body,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let reading =
            serde_json::from_slice(&body).map_err(|err| StoreError::Malformed(err.to_string()))?;
        Ok(Some(reading))
    }
}
