use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reading::{Currency, FetchError, Fetcher, Reading};
use rust_decimal::Decimal;
use scraper::{Html, Selector};
use tracing::debug;

pub const DEFAULT_URL: &str = "https://www.bcv.org.ve/";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);
const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko)";

const DATE_SELECTOR: &str = "span.date-display-single";
const VALUE_SELECTORS: [(Currency, &str); 5] = [
    (Currency::Usd, "#dolar strong"),
    (Currency::Eur, "#euro strong"),
    (Currency::Cny, "#yuan strong"),
    (Currency::Try, "#lira strong"),
    (Currency::Rub, "#rublo strong"),
];

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub url: String,
    pub timeout: Duration,
    /// The publisher has a history of serving incomplete certificate chains.
    pub accept_invalid_certs: bool,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
            accept_invalid_certs: false,
        }
    }
}

pub struct PublisherFetcher {
    client: reqwest::Client,
    url: String,
}

impl PublisherFetcher {
    pub fn new(config: FetcherConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(USER_AGENT)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|err| FetchError::Http(err.to_string()))?;
        Ok(Self {
            client,
            url: config.url,
        })
    }
}

#[async_trait]
impl Fetcher for PublisherFetcher {
    async fn fetch(&self) -> Result<Reading, FetchError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|err| FetchError::Http(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let body = response
            .text()
            .await
            .map_err(|err| FetchError::Http(err.to_string()))?;
        debug!(url = %self.url, bytes = body.len(), "publisher page fetched");
        parse_page(&body, Utc::now())
    }
}

/// Extracts a reading from the publisher's HTML.
///
/// A missing date label is an error. Missing or unparsable values are left
/// out; validity is judged by the caller.
pub fn parse_page(html: &str, captured_at: DateTime<Utc>) -> Result<Reading, FetchError> {
    let document = Html::parse_document(html);

    let date_of_record = select_text(&document, DATE_SELECTOR)?
        .filter(|text| !text.is_empty())
        .ok_or_else(|| FetchError::Parse("date-of-record label not found".into()))?;

    let mut values = Vec::new();
    for (currency, selector) in VALUE_SELECTORS {
        if let Some(value) = select_text(&document, selector)?.and_then(|t| parse_amount(&t)) {
            values.push((currency, value));
        }
    }

    Ok(Reading::new(date_of_record, values, captured_at))
}

fn select_text(document: &Html, selector: &str) -> Result<Option<String>, FetchError> {
    let selector =
        Selector::parse(selector).map_err(|err| FetchError::Parse(format!("{selector}: {err}")))?;
    Ok(document.select(&selector).next().map(|el| {
        el.text()
            .collect::<Vec<_>>()
            .join(" ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }))
}

/// `"36,12345678"` style amounts: dots group thousands, the comma is decimal.
pub fn parse_amount(text: &str) -> Option<Decimal> {
    let cleaned: String = text
        .trim()
        .chars()
        .filter(|c| *c != '.' && !c.is_whitespace())
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    Decimal::from_str(&cleaned).ok()
}
