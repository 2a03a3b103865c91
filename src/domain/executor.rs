//! Trade execution: immediate market fills against buying power.
//!
//! Each buy or sell is a single unit-of-work that reads the account and the
//! position, checks funds or shares, then writes the new balance, the new
//! position, and the ledger entry together. Nothing is written when a check
//! fails, and the check and the writes can never interleave with another
//! unit for the same user.

use rust_decimal::Decimal;

use super::error::LedgerError;
use super::identifiers::{Ticker, UserId, now};
use super::position::{Position, SellOutcome};
use super::retry::RetryPolicy;
use super::transaction::{TradeDetails, Transaction};
use crate::ports::ledger_port::{LedgerStore, UnitOfWork, in_unit_of_work};
use crate::ports::pricing_port::PricingPort;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuyReceipt {
    pub position: Position,
    pub transaction: Transaction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SellReceipt {
    /// `None` when the sell closed the position.
    pub remaining: Option<Position>,
    pub transaction: Transaction,
    pub realized_pnl: Decimal,
}

pub struct TradeExecutor<'a> {
    store: &'a dyn LedgerStore,
    retry: RetryPolicy,
}

impl<'a> TradeExecutor<'a> {
    pub fn new(store: &'a dyn LedgerStore, retry: RetryPolicy) -> Self {
        TradeExecutor { store, retry }
    }

    pub fn buy(
        &self,
        user_id: &UserId,
        ticker: &Ticker,
        shares: u64,
        price_per_share: Decimal,
    ) -> Result<BuyReceipt, LedgerError> {
        let trade = TradeDetails::new(ticker.clone(), shares, price_per_share)?;

        let result = self.retry.run("buy", || {
            in_unit_of_work(self.store, user_id, |unit| apply_buy(unit, user_id, &trade))
        });

        match &result {
            Ok(receipt) => tracing::info!(
                user = %user_id,
                ticker = %ticker,
                shares,
                price = %price_per_share,
                held = receipt.position.shares,
                avg_cost = %receipt.position.avg_cost,
                "buy executed"
            ),
            Err(e) => tracing::warn!(user = %user_id, ticker = %ticker, shares, "buy rejected: {e}"),
        }
        result
    }

    pub fn sell(
        &self,
        user_id: &UserId,
        ticker: &Ticker,
        shares: u64,
        price_per_share: Decimal,
    ) -> Result<SellReceipt, LedgerError> {
        let trade = TradeDetails::new(ticker.clone(), shares, price_per_share)?;

        let result = self.retry.run("sell", || {
            in_unit_of_work(self.store, user_id, |unit| apply_sell(unit, user_id, &trade))
        });

        match &result {
            Ok(receipt) => tracing::info!(
                user = %user_id,
                ticker = %ticker,
                shares,
                price = %price_per_share,
                held = receipt.remaining.as_ref().map_or(0, |p| p.shares),
                realized_pnl = %receipt.realized_pnl,
                "sell executed"
            ),
            Err(e) => tracing::warn!(user = %user_id, ticker = %ticker, shares, "sell rejected: {e}"),
        }
        result
    }

    /// Buys at the price quoted by `pricing`.
    pub fn buy_at_market(
        &self,
        pricing: &dyn PricingPort,
        user_id: &UserId,
        ticker: &Ticker,
        shares: u64,
    ) -> Result<BuyReceipt, LedgerError> {
        let price = quote(pricing, ticker)?;
        self.buy(user_id, ticker, shares, price)
    }

    /// Sells at the price quoted by `pricing`.
    pub fn sell_at_market(
        &self,
        pricing: &dyn PricingPort,
        user_id: &UserId,
        ticker: &Ticker,
        shares: u64,
    ) -> Result<SellReceipt, LedgerError> {
        let price = quote(pricing, ticker)?;
        self.sell(user_id, ticker, shares, price)
    }
}

fn quote(pricing: &dyn PricingPort, ticker: &Ticker) -> Result<Decimal, LedgerError> {
    let price = pricing.get_price(ticker)?;
    if price <= Decimal::ZERO {
        return Err(LedgerError::PriceUnavailable {
            ticker: ticker.to_string(),
        });
    }
    Ok(price)
}

fn apply_buy(
    unit: &mut dyn UnitOfWork,
    user_id: &UserId,
    trade: &TradeDetails,
) -> Result<BuyReceipt, LedgerError> {
    let at = now();
    let cost = trade.value();

    let account = unit
        .get_buying_power()?
        .ok_or_else(|| LedgerError::NoSuchAccount {
            user: user_id.to_string(),
        })?;
    if cost > account.amount {
        return Err(LedgerError::InsufficientFunds {
            required: cost,
            available: account.amount,
        });
    }

    let position = match unit.get_position(&trade.ticker)? {
        Some(held) => held.with_buy(trade.shares, trade.price_per_share, at)?,
        None => Position::open(
            user_id.clone(),
            trade.ticker.clone(),
            trade.shares,
            trade.price_per_share,
            at,
        ),
    };

    unit.adjust_buying_power(-cost)?;
    unit.upsert_position(&position)?;
    let transaction = Transaction::buy(user_id.clone(), trade.clone(), at);
    unit.append_transaction(&transaction)?;

    Ok(BuyReceipt {
        position,
        transaction,
    })
}

fn apply_sell(
    unit: &mut dyn UnitOfWork,
    user_id: &UserId,
    trade: &TradeDetails,
) -> Result<SellReceipt, LedgerError> {
    let at = now();

    let held = unit
        .get_position(&trade.ticker)?
        .ok_or_else(|| LedgerError::NoSuchPosition {
            ticker: trade.ticker.to_string(),
        })?;
    let outcome = held.with_sell(trade.shares, at)?;
    let realized_pnl = held.realized_pnl(trade.shares, trade.price_per_share);

    unit.adjust_buying_power(trade.value())?;
    let remaining = match outcome {
        SellOutcome::Remaining(position) => {
            unit.upsert_position(&position)?;
            Some(position)
        }
        SellOutcome::Closed => {
            unit.delete_position(&trade.ticker)?;
            None
        }
    };
    let transaction = Transaction::sell(user_id.clone(), trade.clone(), at);
    unit.append_transaction(&transaction)?;

    Ok(SellReceipt {
        remaining,
        transaction,
        realized_pnl,
    })
}
