use chrono::NaiveDate;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DateParseError {
    #[error("date-of-record `{0}` has fewer than 3 usable tokens")]
    TooFewTokens(String),
    #[error("date-of-record `{0}` has no month name with a day before and a year after it")]
    MissingMonth(String),
    #[error("invalid day-of-month `{0}`")]
    InvalidDay(String),
    #[error("invalid year `{0}`")]
    InvalidYear(String),
    #[error("no such calendar date: {year}-{month:02}-{day:02}")]
    OutOfRange { year: i32, month: u32, day: u32 },
}

const MONTHS: [(&str, u32); 25] = [
    ("enero", 1),
    ("febrero", 2),
    ("marzo", 3),
    ("abril", 4),
    ("mayo", 5),
    ("junio", 6),
    ("julio", 7),
    ("agosto", 8),
    ("septiembre", 9),
    ("setiembre", 9),
    ("octubre", 10),
    ("noviembre", 11),
    ("diciembre", 12),
    ("january", 1),
    ("february", 2),
    ("march", 3),
    ("april", 4),
    ("may", 5),
    ("june", 6),
    ("july", 7),
    ("august", 8),
    ("september", 9),
    ("october", 10),
    ("november", 11),
    ("december", 12),
];

fn month_number(token: &str) -> Option<u32> {
    let lower = token.to_lowercase();
    MONTHS
        .iter()
        .find(|(name, _)| *name == lower)
        .map(|(_, number)| *number)
}

/// Parses the publisher's free-text date-of-record, e.g.
/// `"Martes, 13 Enero 2026"` or `"13 January 2026"`.
///
/// The month name anchors the parse: the token before it is the day and the
/// token after it is the year, so weekday tokens may be missing or moved.
pub fn parse_date_of_record(label: &str) -> Result<NaiveDate, DateParseError> {
    let cleaned: String = label
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let tokens: Vec<&str> = cleaned.split_whitespace().collect();
    if tokens.len() < 3 {
        return Err(DateParseError::TooFewTokens(label.to_string()));
    }

    let (idx, month) = tokens
        .iter()
        .enumerate()
        .filter(|(idx, _)| *idx > 0 && idx + 1 < tokens.len())
        .find_map(|(idx, token)| month_number(token).map(|m| (idx, m)))
        .ok_or_else(|| DateParseError::MissingMonth(label.to_string()))?;

    let day_token = tokens[idx - 1];
    let year_token = tokens[idx + 1];
    let day: u32 = day_token
        .parse()
        .map_err(|_| DateParseError::InvalidDay(day_token.to_string()))?;
    let year: i32 = year_token
        .parse()
        .map_err(|_| DateParseError::InvalidYear(year_token.to_string()))?;

    NaiveDate::from_ymd_opt(year, month, day)
        .ok_or(DateParseError::OutOfRange { year, month, day })
}

/// Canonical rendering accepted by [`parse_date_of_record`].
pub fn render_date_of_record(date: NaiveDate) -> String {
    date.format("%A, %-d %B %Y").to_string()
}
