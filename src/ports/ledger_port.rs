//! Persistence port for buying power, positions, and the transaction ledger.

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::domain::account::BuyingPower;
use crate::domain::error::LedgerError;
use crate::domain::identifiers::{Ticker, UserId};
use crate::domain::position::Position;
use crate::domain::transaction::{Transaction, TransactionStatus};

/// Reads and writes available inside one atomic unit-of-work.
///
/// A unit is scoped to the user it was opened for. Nothing written through it
/// is visible to other units until the closure passed to
/// [`LedgerStore::transact`] returns `Ok`; an `Err` discards every write.
pub trait UnitOfWork {
    fn get_buying_power(&mut self) -> Result<Option<BuyingPower>, LedgerError>;

    fn create_buying_power(&mut self, account: &BuyingPower) -> Result<(), LedgerError>;

    /// Applies `delta` to the balance and returns the new record.
    ///
    /// Fails with `NoSuchAccount` if the user has none and with
    /// `InsufficientFunds` if the balance would go negative.
    fn adjust_buying_power(&mut self, delta: Decimal) -> Result<BuyingPower, LedgerError>;

    fn get_position(&mut self, ticker: &Ticker) -> Result<Option<Position>, LedgerError>;

    fn upsert_position(&mut self, position: &Position) -> Result<(), LedgerError>;

    fn delete_position(&mut self, ticker: &Ticker) -> Result<(), LedgerError>;

    fn append_transaction(&mut self, transaction: &Transaction) -> Result<(), LedgerError>;

    fn get_transaction(&mut self, id: Uuid) -> Result<Option<Transaction>, LedgerError>;

    /// Moves a pending transaction to a final status.
    fn update_transaction_status(
        &mut self,
        id: Uuid,
        status: TransactionStatus,
    ) -> Result<(), LedgerError>;
}

pub type Work<'a> = dyn FnMut(&mut dyn UnitOfWork) -> Result<(), LedgerError> + 'a;

/// A ledger store handle. Constructed explicitly and passed to the services.
pub trait LedgerStore: Send + Sync {
    /// Runs `work` as one all-or-nothing unit for `user_id`.
    ///
    /// Units for the same user serialize; units for different users do not
    /// wait on each other beyond what the backing engine imposes. A unit that
    /// cannot serialize fails with `ConcurrencyConflict`.
    fn transact(&self, user_id: &UserId, work: &mut Work<'_>) -> Result<(), LedgerError>;

    fn buying_power(&self, user_id: &UserId) -> Result<Option<BuyingPower>, LedgerError>;

    /// Open positions ordered by ticker.
    fn positions(&self, user_id: &UserId) -> Result<Vec<Position>, LedgerError>;

    /// Ledger entries, newest first.
    fn transactions(&self, user_id: &UserId) -> Result<Vec<Transaction>, LedgerError>;
}

/// Runs `work` in a unit-of-work and hands back its result.
pub fn in_unit_of_work<T>(
    store: &dyn LedgerStore,
    user_id: &UserId,
    mut work: impl FnMut(&mut dyn UnitOfWork) -> Result<T, LedgerError>,
) -> Result<T, LedgerError> {
    let mut output = None;
    store.transact(user_id, &mut |unit| {
        output = Some(work(unit)?);
        Ok(())
    })?;
    output.ok_or_else(|| LedgerError::StoreQuery {
        reason: "unit-of-work committed without running".into(),
    })
}
