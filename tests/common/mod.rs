#![allow(dead_code)]

use rust_decimal::Decimal;
use std::collections::HashMap;
use tradeledger::adapters::memory_adapter::MemoryLedgerAdapter;
use tradeledger::domain::account::BuyingPower;
use tradeledger::domain::error::LedgerError;
use tradeledger::domain::identifiers::{Ticker, UserId};
use tradeledger::domain::position::Position;
use tradeledger::domain::transaction::{BankDetails, Transaction};
use tradeledger::ports::ledger_port::LedgerStore;
use tradeledger::ports::pricing_port::PricingPort;

pub fn user(name: &str) -> UserId {
    UserId::new(name).unwrap()
}

pub fn ticker(symbol: &str) -> Ticker {
    Ticker::new(symbol).unwrap()
}

pub fn bank() -> BankDetails {
    BankDetails::new("First Bank", "021000021", "12345678").unwrap()
}

pub struct FixedQuotes(pub HashMap<String, Decimal>);

impl FixedQuotes {
    pub fn new(quotes: &[(&str, Decimal)]) -> Self {
        FixedQuotes(
            quotes
                .iter()
                .map(|(t, p)| (t.to_string(), *p))
                .collect(),
        )
    }
}

impl PricingPort for FixedQuotes {
    fn get_price(&self, ticker: &Ticker) -> Result<Decimal, LedgerError> {
        self.0
            .get(ticker.as_str())
            .copied()
            .ok_or_else(|| LedgerError::PriceUnavailable {
                ticker: ticker.to_string(),
            })
    }
}

/// Every store a test can run against without external services.
pub fn backends() -> Vec<(&'static str, Box<dyn LedgerStore>)> {
    let mut stores: Vec<(&'static str, Box<dyn LedgerStore>)> =
        vec![("memory", Box::new(MemoryLedgerAdapter::new()))];
    #[cfg(feature = "sqlite")]
    {
        use tradeledger::adapters::sqlite_adapter::SqliteLedgerAdapter;
        let sqlite = SqliteLedgerAdapter::in_memory().unwrap();
        sqlite.initialize_schema().unwrap();
        stores.push(("sqlite", Box::new(sqlite)));
    }
    stores
}

/// Full observable state of one user, for before/after comparisons.
#[derive(Debug, PartialEq)]
pub struct Snapshot {
    pub buying_power: Option<BuyingPower>,
    pub positions: Vec<Position>,
    pub transactions: Vec<Transaction>,
}

pub fn snapshot(store: &dyn LedgerStore, user_id: &UserId) -> Snapshot {
    Snapshot {
        buying_power: store.buying_power(user_id).unwrap(),
        positions: store.positions(user_id).unwrap(),
        transactions: store.transactions(user_id).unwrap(),
    }
}

pub fn cash(store: &dyn LedgerStore, user_id: &UserId) -> Decimal {
    store.buying_power(user_id).unwrap().unwrap().amount
}

pub fn shares(store: &dyn LedgerStore, user_id: &UserId, symbol: &str) -> Option<u64> {
    store
        .positions(user_id)
        .unwrap()
        .into_iter()
        .find(|p| p.ticker.as_str() == symbol)
        .map(|p| p.shares)
}
