//! Open positions and average-cost accounting.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::error::LedgerError;
use super::identifiers::{Ticker, UserId};

/// A user's holding in one ticker. Only exists while `shares > 0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    pub user_id: UserId,
    pub ticker: Ticker,
    pub shares: u64,
    pub avg_cost: Decimal,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What remains after a sell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SellOutcome {
    Remaining(Position),
    Closed,
}

impl Position {
    pub fn open(
        user_id: UserId,
        ticker: Ticker,
        shares: u64,
        price: Decimal,
        at: DateTime<Utc>,
    ) -> Self {
        Position {
            user_id,
            ticker,
            shares,
            avg_cost: price,
            opened_at: at,
            updated_at: at,
        }
    }

    /// Adds shares bought at `price`, recomputing the volume-weighted average cost.
    pub fn with_buy(
        &self,
        shares: u64,
        price: Decimal,
        at: DateTime<Utc>,
    ) -> Result<Self, LedgerError> {
        let total_shares = self
            .shares
            .checked_add(shares)
            .ok_or_else(|| LedgerError::validation("share count overflow"))?;
        let held_cost = Decimal::from(self.shares)
            .checked_mul(self.avg_cost)
            .ok_or_else(|| LedgerError::validation("cost basis overflow"))?;
        let new_cost = Decimal::from(shares)
            .checked_mul(price)
            .ok_or_else(|| LedgerError::validation("cost basis overflow"))?;
        let avg_cost = held_cost
            .checked_add(new_cost)
            .and_then(|total| total.checked_div(Decimal::from(total_shares)))
            .ok_or_else(|| LedgerError::validation("cost basis overflow"))?
            .normalize();

        Ok(Position {
            shares: total_shares,
            avg_cost,
            updated_at: at,
            ..self.clone()
        })
    }

    /// Removes `shares`; average cost of the remainder is unchanged.
    pub fn with_sell(&self, shares: u64, at: DateTime<Utc>) -> Result<SellOutcome, LedgerError> {
        if shares > self.shares {
            return Err(LedgerError::InsufficientShares {
                ticker: self.ticker.to_string(),
                requested: shares,
                held: self.shares,
            });
        }
        if shares == self.shares {
            return Ok(SellOutcome::Closed);
        }
        Ok(SellOutcome::Remaining(Position {
            shares: self.shares - shares,
            updated_at: at,
            ..self.clone()
        }))
    }

    pub fn cost_basis(&self) -> Decimal {
        Decimal::from(self.shares) * self.avg_cost
    }

    pub fn market_value(&self, price: Decimal) -> Decimal {
        Decimal::from(self.shares) * price
    }

    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        Decimal::from(self.shares) * (price - self.avg_cost)
    }

    /// Gain realized by selling `shares` at `price` against the average cost.
    pub fn realized_pnl(&self, shares: u64, price: Decimal) -> Decimal {
        Decimal::from(shares) * (price - self.avg_cost)
    }
}
