//! Identifier newtypes and the ledger clock.

use chrono::{DateTime, SubsecRound, Utc};
use std::fmt;

use super::error::LedgerError;

const MAX_TICKER_LEN: usize = 12;

/// Opaque user identifier supplied by the identity collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(String);

impl UserId {
    pub fn new(raw: impl Into<String>) -> Result<Self, LedgerError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(LedgerError::validation("user id is required"));
        }
        Ok(UserId(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Instrument symbol, stored upper case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticker(String);

impl Ticker {
    pub fn new(raw: &str) -> Result<Self, LedgerError> {
        let symbol = raw.trim().to_uppercase();
        if symbol.is_empty() {
            return Err(LedgerError::validation("ticker is required"));
        }
        if symbol.len() > MAX_TICKER_LEN {
            return Err(LedgerError::validation(format!(
                "ticker {symbol} is longer than {MAX_TICKER_LEN} characters"
            )));
        }
        if !symbol
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        {
            return Err(LedgerError::validation(format!(
                "ticker {symbol} contains invalid characters"
            )));
        }
        Ok(Ticker(symbol))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ticker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Current time at microsecond precision, which every store round-trips exactly.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}
