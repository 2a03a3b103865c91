//! Read-only projections over the ledger.

use rust_decimal::Decimal;

use super::account::BuyingPower;
use super::error::LedgerError;
use super::identifiers::UserId;
use super::portfolio::PortfolioValuation;
use super::position::Position;
use super::transaction::Transaction;
use crate::ports::ledger_port::LedgerStore;
use crate::ports::pricing_port::PricingPort;

/// Outcome of replaying a user's ledger against their balance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub opening_amount: Decimal,
    pub ledger_delta: Decimal,
    pub expected: Decimal,
    pub actual: Decimal,
    pub transaction_count: usize,
}

impl Reconciliation {
    pub fn discrepancy(&self) -> Decimal {
        self.actual - self.expected
    }

    pub fn is_balanced(&self) -> bool {
        self.discrepancy().is_zero()
    }
}

pub struct LedgerReader<'a> {
    store: &'a dyn LedgerStore,
}

impl<'a> LedgerReader<'a> {
    pub fn new(store: &'a dyn LedgerStore) -> Self {
        LedgerReader { store }
    }

    pub fn buying_power(&self, user_id: &UserId) -> Result<BuyingPower, LedgerError> {
        self.store
            .buying_power(user_id)?
            .ok_or_else(|| LedgerError::NoSuchAccount {
                user: user_id.to_string(),
            })
    }

    pub fn positions(&self, user_id: &UserId) -> Result<Vec<Position>, LedgerError> {
        self.store.positions(user_id)
    }

    /// Every ledger entry for the user, newest first.
    pub fn transactions(&self, user_id: &UserId) -> Result<Vec<Transaction>, LedgerError> {
        self.store.transactions(user_id)
    }

    pub fn reconcile(&self, user_id: &UserId) -> Result<Reconciliation, LedgerError> {
        let account = self.buying_power(user_id)?;
        let transactions = self.store.transactions(user_id)?;
        let ledger_delta: Decimal = transactions.iter().map(Transaction::cash_delta).sum();
        let reconciliation = Reconciliation {
            opening_amount: account.opening_amount,
            ledger_delta,
            expected: account.opening_amount + ledger_delta,
            actual: account.amount,
            transaction_count: transactions.len(),
        };
        if !reconciliation.is_balanced() {
            tracing::error!(
                user = %user_id,
                expected = %reconciliation.expected,
                actual = %reconciliation.actual,
                "ledger does not reconcile with buying power"
            );
        }
        Ok(reconciliation)
    }

    pub fn valuation(
        &self,
        user_id: &UserId,
        pricing: &dyn PricingPort,
    ) -> Result<PortfolioValuation, LedgerError> {
        let account = self.buying_power(user_id)?;
        let positions = self.store.positions(user_id)?;
        PortfolioValuation::compute(account.amount, positions, pricing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_adapter::MemoryLedgerAdapter;
    use crate::domain::config::LedgerConfig;
    use crate::domain::executor::TradeExecutor;
    use crate::domain::identifiers::Ticker;
    use crate::domain::transaction::BankDetails;
    use crate::domain::transfer::CashTransferProcessor;
    use rust_decimal_macros::dec;

    fn user() -> UserId {
        UserId::new("carol").unwrap()
    }

    #[test]
    fn missing_account_is_reported() {
        let store = MemoryLedgerAdapter::new();
        let reader = LedgerReader::new(&store);
        assert!(matches!(
            reader.buying_power(&user()),
            Err(LedgerError::NoSuchAccount { .. })
        ));
        assert!(reader.transactions(&user()).unwrap().is_empty());
    }

    #[test]
    fn transactions_newest_first() {
        let store = MemoryLedgerAdapter::new();
        let transfers = CashTransferProcessor::new(&store, LedgerConfig::default());
        let executor = TradeExecutor::new(&store, Default::default());
        let bank = BankDetails::new("Bank", "1", "2").unwrap();
        let ticker = Ticker::new("AAPL").unwrap();

        transfers.deposit(&user(), dec!(1000), bank).unwrap();
        executor.buy(&user(), &ticker, 2, dec!(100)).unwrap();
        executor.sell(&user(), &ticker, 1, dec!(110)).unwrap();

        let reader = LedgerReader::new(&store);
        let kinds: Vec<_> = reader
            .transactions(&user())
            .unwrap()
            .iter()
            .map(|t| t.kind.as_str())
            .collect();
        assert_eq!(kinds, vec!["sell", "buy", "deposit"]);

        let again = reader.transactions(&user()).unwrap();
        assert_eq!(again.len(), 3);
    }

    #[test]
    fn reconcile_balances_after_activity() {
        let store = MemoryLedgerAdapter::new();
        let transfers = CashTransferProcessor::new(&store, LedgerConfig::default());
        let executor = TradeExecutor::new(&store, Default::default());
        let bank = BankDetails::new("Bank", "1", "2").unwrap();
        let ticker = Ticker::new("AAPL").unwrap();

        transfers.open_account(&user(), Some(dec!(500))).unwrap();
        transfers.deposit(&user(), dec!(250), bank.clone()).unwrap();
        executor.buy(&user(), &ticker, 3, dec!(99.99)).unwrap();
        executor.sell(&user(), &ticker, 2, dec!(101.5)).unwrap();
        transfers.withdraw(&user(), dec!(12.34), bank).unwrap();

        let reconciliation = LedgerReader::new(&store).reconcile(&user()).unwrap();
        assert!(reconciliation.is_balanced());
        assert_eq!(reconciliation.opening_amount, dec!(500));
        assert_eq!(reconciliation.transaction_count, 4);
        assert_eq!(
            reconciliation.actual,
            dec!(500) + dec!(250) - dec!(299.97) + dec!(203) - dec!(12.34)
        );
    }
}
