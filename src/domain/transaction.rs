//! Ledger entries.
//!
//! Each transaction kind carries only the fields it needs: bank details for
//! transfers, ticker/shares/price for trades. Malformed shapes are refused at
//! construction time instead of being validated after the fact.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::fmt;
use uuid::Uuid;

use super::error::LedgerError;
use super::identifiers::{Ticker, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TransactionStatus::Pending),
            "completed" => Some(TransactionStatus::Completed),
            "failed" => Some(TransactionStatus::Failed),
            _ => None,
        }
    }

    pub fn is_final(self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bank routing for a deposit or withdrawal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BankDetails {
    pub bank_name: String,
    pub routing_number: String,
    pub bank_account: String,
}

impl BankDetails {
    pub fn new(
        bank_name: &str,
        routing_number: &str,
        bank_account: &str,
    ) -> Result<Self, LedgerError> {
        Ok(BankDetails {
            bank_name: required(bank_name, "bank name")?,
            routing_number: required(routing_number, "routing number")?,
            bank_account: required(bank_account, "bank account")?,
        })
    }
}

fn required(value: &str, field: &str) -> Result<String, LedgerError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(LedgerError::validation(format!("{field} is required")));
    }
    Ok(trimmed.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeDetails {
    pub ticker: Ticker,
    pub shares: u64,
    pub price_per_share: Decimal,
}

impl TradeDetails {
    pub fn new(ticker: Ticker, shares: u64, price_per_share: Decimal) -> Result<Self, LedgerError> {
        if shares == 0 {
            return Err(LedgerError::validation("shares must be positive"));
        }
        if shares > i64::MAX as u64 {
            return Err(LedgerError::validation("share count is too large"));
        }
        if price_per_share <= Decimal::ZERO {
            return Err(LedgerError::validation("price per share must be positive"));
        }
        Decimal::from(shares)
            .checked_mul(price_per_share)
            .ok_or_else(|| LedgerError::validation("trade value overflows"))?;
        Ok(TradeDetails {
            ticker,
            shares,
            price_per_share,
        })
    }

    /// `shares * price_per_share`; cannot overflow once constructed.
    pub fn value(&self) -> Decimal {
        Decimal::from(self.shares) * self.price_per_share
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionKind {
    Deposit(BankDetails),
    Withdrawal(BankDetails),
    Buy(TradeDetails),
    Sell(TradeDetails),
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Deposit(_) => "deposit",
            TransactionKind::Withdrawal(_) => "withdrawal",
            TransactionKind::Buy(_) => "buy",
            TransactionKind::Sell(_) => "sell",
        }
    }

    pub fn is_transfer(&self) -> bool {
        matches!(
            self,
            TransactionKind::Deposit(_) | TransactionKind::Withdrawal(_)
        )
    }

    pub fn trade(&self) -> Option<&TradeDetails> {
        match self {
            TransactionKind::Buy(t) | TransactionKind::Sell(t) => Some(t),
            _ => None,
        }
    }

    pub fn bank(&self) -> Option<&BankDetails> {
        match self {
            TransactionKind::Deposit(b) | TransactionKind::Withdrawal(b) => Some(b),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: UserId,
    pub kind: TransactionKind,
    pub amount: Decimal,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// A completed buy; `amount` is the trade value.
    pub fn buy(user_id: UserId, trade: TradeDetails, at: DateTime<Utc>) -> Self {
        Self::new(
            user_id,
            trade.value(),
            TransactionKind::Buy(trade),
            TransactionStatus::Completed,
            at,
        )
    }

    /// A completed sell; `amount` is the proceeds.
    pub fn sell(user_id: UserId, trade: TradeDetails, at: DateTime<Utc>) -> Self {
        Self::new(
            user_id,
            trade.value(),
            TransactionKind::Sell(trade),
            TransactionStatus::Completed,
            at,
        )
    }

    pub fn deposit(
        user_id: UserId,
        amount: Decimal,
        bank: BankDetails,
        status: TransactionStatus,
        at: DateTime<Utc>,
    ) -> Result<Self, LedgerError> {
        positive_amount(amount)?;
        Ok(Self::new(
            user_id,
            amount,
            TransactionKind::Deposit(bank),
            status,
            at,
        ))
    }

    pub fn withdrawal(
        user_id: UserId,
        amount: Decimal,
        bank: BankDetails,
        status: TransactionStatus,
        at: DateTime<Utc>,
    ) -> Result<Self, LedgerError> {
        positive_amount(amount)?;
        Ok(Self::new(
            user_id,
            amount,
            TransactionKind::Withdrawal(bank),
            status,
            at,
        ))
    }

    /// Rebuilds a stored transaction. Adapters use this when reading rows back.
    pub fn restore(
        id: Uuid,
        user_id: UserId,
        kind: TransactionKind,
        amount: Decimal,
        status: TransactionStatus,
        created_at: DateTime<Utc>,
    ) -> Self {
        Transaction {
            id,
            user_id,
            kind,
            amount,
            status,
            created_at,
        }
    }

    fn new(
        user_id: UserId,
        amount: Decimal,
        kind: TransactionKind,
        status: TransactionStatus,
        at: DateTime<Utc>,
    ) -> Self {
        Transaction {
            id: Uuid::new_v4(),
            user_id,
            kind,
            amount,
            status,
            created_at: at,
        }
    }

    /// Signed effect of this entry on buying power.
    ///
    /// Withdrawals reserve their cash while pending, deposits only count
    /// once completed, and failed entries never count.
    pub fn cash_delta(&self) -> Decimal {
        match (&self.kind, self.status) {
            (_, TransactionStatus::Failed) => Decimal::ZERO,
            (TransactionKind::Withdrawal(_), _) => -self.amount,
            (TransactionKind::Deposit(_), TransactionStatus::Completed) => self.amount,
            (TransactionKind::Deposit(_), TransactionStatus::Pending) => Decimal::ZERO,
            (TransactionKind::Buy(_), TransactionStatus::Completed) => -self.amount,
            (TransactionKind::Sell(_), TransactionStatus::Completed) => self.amount,
            (_, TransactionStatus::Pending) => Decimal::ZERO,
        }
    }
}

fn positive_amount(amount: Decimal) -> Result<(), LedgerError> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::validation("amount must be positive"));
    }
    Ok(())
}
