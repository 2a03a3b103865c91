//! Cash transfers between a user's bank and their buying power.

use rust_decimal::Decimal;
use uuid::Uuid;

use super::account::BuyingPower;
use super::config::{LedgerConfig, SettlementPolicy};
use super::error::LedgerError;
use super::identifiers::{UserId, now};
use super::transaction::{BankDetails, Transaction, TransactionStatus};
use crate::ports::ledger_port::{LedgerStore, UnitOfWork, in_unit_of_work};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub buying_power: BuyingPower,
    pub transaction: Transaction,
}

pub struct CashTransferProcessor<'a> {
    store: &'a dyn LedgerStore,
    config: LedgerConfig,
}

impl<'a> CashTransferProcessor<'a> {
    pub fn new(store: &'a dyn LedgerStore, config: LedgerConfig) -> Self {
        CashTransferProcessor { store, config }
    }

    /// Creates the user's buying power with `initial_amount`, or the configured
    /// default when `None`.
    pub fn open_account(
        &self,
        user_id: &UserId,
        initial_amount: Option<Decimal>,
    ) -> Result<BuyingPower, LedgerError> {
        let amount = initial_amount.unwrap_or(self.config.initial_buying_power);
        let account = BuyingPower::open(user_id.clone(), amount, now())?;

        self.config.retry.run("open_account", || {
            in_unit_of_work(self.store, user_id, |unit| {
                if unit.get_buying_power()?.is_some() {
                    return Err(LedgerError::AccountExists {
                        user: user_id.to_string(),
                    });
                }
                unit.create_buying_power(&account)
            })
        })?;

        tracing::info!(user = %user_id, amount = %amount, "account opened");
        Ok(account)
    }

    pub fn deposit(
        &self,
        user_id: &UserId,
        amount: Decimal,
        bank: BankDetails,
    ) -> Result<TransferReceipt, LedgerError> {
        let status = self.initial_status();
        let template = Transaction::deposit(user_id.clone(), amount, bank, status, now())?;

        let result = self.config.retry.run("deposit", || {
            in_unit_of_work(self.store, user_id, |unit| {
                let at = now();
                if unit.get_buying_power()?.is_none() {
                    unit.create_buying_power(&BuyingPower::open(
                        user_id.clone(),
                        Decimal::ZERO,
                        at,
                    )?)?;
                }
                let transaction = Transaction {
                    created_at: at,
                    ..template.clone()
                };
                let buying_power = unit.adjust_buying_power(transaction.cash_delta())?;
                unit.append_transaction(&transaction)?;
                Ok(TransferReceipt {
                    buying_power,
                    transaction,
                })
            })
        });
        log_outcome("deposit", user_id, amount, &result);
        result
    }

    pub fn withdraw(
        &self,
        user_id: &UserId,
        amount: Decimal,
        bank: BankDetails,
    ) -> Result<TransferReceipt, LedgerError> {
        let status = self.initial_status();
        let template = Transaction::withdrawal(user_id.clone(), amount, bank, status, now())?;

        let result = self.config.retry.run("withdraw", || {
            in_unit_of_work(self.store, user_id, |unit| {
                let account = require_account(unit, user_id)?;
                if amount > account.amount {
                    return Err(LedgerError::InsufficientFunds {
                        required: amount,
                        available: account.amount,
                    });
                }
                let transaction = Transaction {
                    created_at: now(),
                    ..template.clone()
                };
                let buying_power = unit.adjust_buying_power(transaction.cash_delta())?;
                unit.append_transaction(&transaction)?;
                Ok(TransferReceipt {
                    buying_power,
                    transaction,
                })
            })
        });
        log_outcome("withdraw", user_id, amount, &result);
        result
    }

    /// Records the external outcome of a pending transfer.
    ///
    /// `outcome` must be `Completed` or `Failed`. The balance moves by the
    /// difference between the entry's cash delta before and after the change.
    pub fn settle(
        &self,
        user_id: &UserId,
        transaction_id: Uuid,
        outcome: TransactionStatus,
    ) -> Result<TransferReceipt, LedgerError> {
        if !outcome.is_final() {
            return Err(LedgerError::validation(
                "settlement outcome must be completed or failed",
            ));
        }

        let result = self.config.retry.run("settle", || {
            in_unit_of_work(self.store, user_id, |unit| {
                let pending = unit.get_transaction(transaction_id)?.ok_or(
                    LedgerError::NoSuchTransaction { id: transaction_id },
                )?;
                if !pending.kind.is_transfer() {
                    return Err(LedgerError::validation(format!(
                        "{} transactions are not settled",
                        pending.kind.as_str()
                    )));
                }
                if pending.status.is_final() {
                    return Err(LedgerError::TransactionNotPending {
                        id: transaction_id,
                        status: pending.status,
                    });
                }

                let settled = Transaction {
                    status: outcome,
                    ..pending.clone()
                };
                let delta = settled.cash_delta() - pending.cash_delta();
                let buying_power = unit.adjust_buying_power(delta)?;
                unit.update_transaction_status(transaction_id, outcome)?;
                Ok(TransferReceipt {
                    buying_power,
                    transaction: settled,
                })
            })
        });

        match &result {
            Ok(receipt) => tracing::info!(
                user = %user_id,
                transaction = %transaction_id,
                kind = receipt.transaction.kind.as_str(),
                outcome = %outcome,
                "transfer settled"
            ),
            Err(e) => tracing::warn!(
                user = %user_id,
                transaction = %transaction_id,
                "settlement rejected: {e}"
            ),
        }
        result
    }

    fn initial_status(&self) -> TransactionStatus {
        match self.config.settlement {
            SettlementPolicy::Immediate => TransactionStatus::Completed,
            SettlementPolicy::Deferred => TransactionStatus::Pending,
        }
    }
}

fn require_account(
    unit: &mut dyn UnitOfWork,
    user_id: &UserId,
) -> Result<BuyingPower, LedgerError> {
    unit.get_buying_power()?
        .ok_or_else(|| LedgerError::NoSuchAccount {
            user: user_id.to_string(),
        })
}

fn log_outcome(
    operation: &str,
    user_id: &UserId,
    amount: Decimal,
    result: &Result<TransferReceipt, LedgerError>,
) {
    match result {
        Ok(receipt) => tracing::info!(
            user = %user_id,
            amount = %amount,
            status = %receipt.transaction.status,
            balance = %receipt.buying_power.amount,
            "{operation} recorded"
        ),
        Err(e) => tracing::warn!(user = %user_id, amount = %amount, "{operation} rejected: {e}"),
    }
}
