//! CSV quote file pricing adapter.
//!
//! The file holds a `ticker,price` header followed by one row per ticker.
//! A later row for the same ticker replaces an earlier one.

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::domain::error::LedgerError;
use crate::domain::identifiers::Ticker;
use crate::ports::pricing_port::PricingPort;

pub struct CsvQuoteAdapter {
    quotes: HashMap<Ticker, Decimal>,
}

impl CsvQuoteAdapter {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        Self::from_string(&content).map_err(|e| match e {
            LedgerError::Validation { reason } => LedgerError::Validation {
                reason: format!("{}: {reason}", path.display()),
            },
            other => other,
        })
    }

    pub fn from_string(content: &str) -> Result<Self, LedgerError> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(content.as_bytes());
        let mut quotes = HashMap::new();

        for (index, result) in rdr.records().enumerate() {
            let line = index + 2;
            let record = result.map_err(|e| {
                LedgerError::validation(format!("CSV parse error on line {line}: {e}"))
            })?;

            let symbol = record.get(0).ok_or_else(|| {
                LedgerError::validation(format!("missing ticker column on line {line}"))
            })?;
            let ticker = Ticker::new(symbol)?;

            let raw_price = record.get(1).ok_or_else(|| {
                LedgerError::validation(format!("missing price column on line {line}"))
            })?;
            let price = Decimal::from_str(raw_price).map_err(|e| {
                LedgerError::validation(format!("invalid price on line {line}: {e}"))
            })?;
            if price <= Decimal::ZERO {
                return Err(LedgerError::validation(format!(
                    "price for {ticker} on line {line} must be positive"
                )));
            }

            quotes.insert(ticker, price);
        }

        tracing::debug!(count = quotes.len(), "quotes loaded");
        Ok(Self { quotes })
    }

    pub fn len(&self) -> usize {
        self.quotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }
}

impl PricingPort for CsvQuoteAdapter {
    fn get_price(&self, ticker: &Ticker) -> Result<Decimal, LedgerError> {
        self.quotes
            .get(ticker)
            .copied()
            .ok_or_else(|| LedgerError::PriceUnavailable {
                ticker: ticker.to_string(),
            })
    }
}
