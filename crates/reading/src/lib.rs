use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

mod date;
mod detect;
mod ports;

pub use date::{parse_date_of_record, render_date_of_record, DateParseError};
pub use detect::is_new;
pub use ports::{
    FallbackCache, FetchError, Fetcher, Notifier, NotifyError, ReadingStore, StoreError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Usd,
    Eur,
    Cny,
    Try,
    Rub,
}

impl Currency {
    /// Gates validity: a reading without a positive primary value is discarded.
    pub const PRIMARY: Currency = Currency::Usd;
    pub const SECONDARY: Currency = Currency::Eur;
    pub const ALL: [Currency; 5] = [
        Currency::Usd,
        Currency::Eur,
        Currency::Cny,
        Currency::Try,
        Currency::Rub,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Cny => "CNY",
            Currency::Try => "TRY",
            Currency::Rub => "RUB",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// One snapshot of the published reference values.
///
/// Readings are immutable once built; a newer publication produces a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reading {
    pub date_of_record: String,
    pub values: BTreeMap<Currency, Decimal>,
    pub captured_at: DateTime<Utc>,
}

impl Reading {
    pub fn new(
        date_of_record: impl Into<String>,
        values: impl IntoIterator<Item = (Currency, Decimal)>,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            date_of_record: date_of_record.into(),
            values: values.into_iter().collect(),
            captured_at,
        }
    }

    pub fn value(&self, currency: Currency) -> Decimal {
        self.values.get(&currency).copied().unwrap_or(Decimal::ZERO)
    }

    pub fn primary(&self) -> Decimal {
        self.value(Currency::PRIMARY)
    }

    pub fn secondary(&self) -> Decimal {
        self.value(Currency::SECONDARY)
    }

    pub fn is_valid(&self) -> bool {
        self.primary() > Decimal::ZERO
    }
}
