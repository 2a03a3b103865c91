//! Quote source port.

use rust_decimal::Decimal;

use crate::domain::error::LedgerError;
use crate::domain::identifiers::Ticker;

pub trait PricingPort {
    /// Current positive price for `ticker`, or `PriceUnavailable`.
    fn get_price(&self, ticker: &Ticker) -> Result<Decimal, LedgerError>;
}
