//! Portfolio valuation against current quotes.

use rust_decimal::Decimal;

use super::error::LedgerError;
use super::position::Position;
use crate::ports::pricing_port::PricingPort;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionValuation {
    pub position: Position,
    pub last_price: Option<Decimal>,
    pub market_value: Option<Decimal>,
    pub unrealized_pnl: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortfolioValuation {
    pub cash: Decimal,
    pub positions: Vec<PositionValuation>,
    /// Cash plus market value; positions without a quote count at cost basis.
    pub total_equity: Decimal,
}

impl PortfolioValuation {
    /// Values `positions` with `pricing`. A missing quote leaves that
    /// position unpriced; any other pricing error is returned.
    pub fn compute(
        cash: Decimal,
        positions: Vec<Position>,
        pricing: &dyn PricingPort,
    ) -> Result<Self, LedgerError> {
        let mut total_equity = cash;
        let mut valued = Vec::with_capacity(positions.len());

        for position in positions {
            let last_price = match pricing.get_price(&position.ticker) {
                Ok(price) if price > Decimal::ZERO => Some(price),
                Ok(_) | Err(LedgerError::PriceUnavailable { .. }) => None,
                Err(e) => return Err(e),
            };
            let market_value = last_price.map(|price| position.market_value(price));
            total_equity += market_value.unwrap_or_else(|| position.cost_basis());
            valued.push(PositionValuation {
                unrealized_pnl: last_price.map(|price| position.unrealized_pnl(price)),
                market_value,
                last_price,
                position,
            });
        }

        Ok(PortfolioValuation {
            cash,
            positions: valued,
            total_equity,
        })
    }

    pub fn unpriced(&self) -> impl Iterator<Item = &Position> {
        self.positions
            .iter()
            .filter(|v| v.last_price.is_none())
            .map(|v| &v.position)
    }
}
