use std::time::Duration;

use async_trait::async_trait;
use reading::{Notifier, NotifyError};
use serde::Deserialize;
use tracing::info;

pub const TELEGRAM_API: &str = "https://api.telegram.org";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: i64,
    pub api_base: String,
    pub timeout: Duration,
}

impl TelegramConfig {
    pub fn new(bot_token: impl Into<String>, chat_id: i64) -> Self {
        Self {
            bot_token: bot_token.into(),
            chat_id,
            api_base: TELEGRAM_API.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Sends operator messages through the Telegram Bot API.
///
/// One attempt per message; the client timeout bounds how long a send can take.
pub struct TelegramNotifier {
    client: reqwest::Client,
    config: TelegramConfig,
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| NotifyError::Transport(err.to_string()))?;
        Ok(Self { client, config })
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token,
            method
        )
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        let body = serde_json::json!({
            "chat_id": self.config.chat_id,
            "text": text,
            "disable_web_page_preview": true,
        });
        let response = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|err| NotifyError::Transport(err.to_string()))?;
        let status = response.status();
        let result: ApiResponse = response
            .json()
            .await
            .map_err(|err| NotifyError::Transport(format!("status {status}: {err}")))?;
        if !result.ok {
            return Err(NotifyError::Rejected(
                result.description.unwrap_or_else(|| status.to_string()),
            ));
        }
        Ok(())
    }
}

/// Used when no bot token is configured: messages only reach the log.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        info!(text, "notification");
        Ok(())
    }
}
