//! Runtime parameters of the ledger services.

use rust_decimal::Decimal;

use super::retry::RetryPolicy;

/// Default opening balance for new accounts.
pub const DEFAULT_INITIAL_BUYING_POWER: Decimal = Decimal::from_parts(10_000, 0, 0, false, 0);

/// How bank transfers move through their lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SettlementPolicy {
    /// Cash moves at request time and the entry is recorded completed.
    #[default]
    Immediate,
    /// The entry is recorded pending until settled. Withdrawals reserve their
    /// cash at request time; deposits credit only once completed.
    Deferred,
}

impl SettlementPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "immediate" => Some(SettlementPolicy::Immediate),
            "deferred" => Some(SettlementPolicy::Deferred),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerConfig {
    pub initial_buying_power: Decimal,
    pub settlement: SettlementPolicy,
    pub retry: RetryPolicy,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            initial_buying_power: DEFAULT_INITIAL_BUYING_POWER,
            settlement: SettlementPolicy::Immediate,
            retry: RetryPolicy::default(),
        }
    }
}
