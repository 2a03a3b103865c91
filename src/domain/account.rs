//! Buying power: a user's uncommitted cash balance.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::error::LedgerError;
use super::identifiers::UserId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuyingPower {
    pub user_id: UserId,
    pub amount: Decimal,
    /// Balance the account was opened with; the ledger reconciles against it.
    pub opening_amount: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BuyingPower {
    pub fn open(
        user_id: UserId,
        opening_amount: Decimal,
        at: DateTime<Utc>,
    ) -> Result<Self, LedgerError> {
        if opening_amount < Decimal::ZERO {
            return Err(LedgerError::validation(
                "opening buying power must be non-negative",
            ));
        }
        Ok(BuyingPower {
            user_id,
            amount: opening_amount,
            opening_amount,
            created_at: at,
            updated_at: at,
        })
    }

    /// Returns the balance after applying `delta`, refusing to go below zero.
    pub fn adjusted(&self, delta: Decimal, at: DateTime<Utc>) -> Result<Self, LedgerError> {
        let amount = self
            .amount
            .checked_add(delta)
            .ok_or_else(|| LedgerError::validation("buying power overflow"))?;
        if amount < Decimal::ZERO {
            return Err(LedgerError::InsufficientFunds {
                required: -delta,
                available: self.amount,
            });
        }
        Ok(BuyingPower {
            amount,
            updated_at: at,
            ..self.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::identifiers::now;
    use rust_decimal_macros::dec;

    fn account(amount: Decimal) -> BuyingPower {
        BuyingPower::open(UserId::new("alice").unwrap(), amount, now()).unwrap()
    }

    #[test]
    fn open_sets_opening_amount() {
        let bp = account(dec!(10000));
        assert_eq!(bp.amount, dec!(10000));
        assert_eq!(bp.opening_amount, dec!(10000));
    }

    #[test]
    fn open_rejects_negative() {
        let result = BuyingPower::open(UserId::new("alice").unwrap(), dec!(-1), now());
        assert!(matches!(result, Err(LedgerError::Validation { .. })));
    }

    #[test]
    fn adjusted_debits_and_credits() {
        let bp = account(dec!(100));
        assert_eq!(bp.adjusted(dec!(-40), now()).unwrap().amount, dec!(60));
        assert_eq!(bp.adjusted(dec!(25.5), now()).unwrap().amount, dec!(125.5));
    }

    #[test]
    fn adjusted_to_exactly_zero_is_allowed() {
        let bp = account(dec!(100));
        assert!(bp.adjusted(dec!(-100), now()).unwrap().amount.is_zero());
    }

    #[test]
    fn adjusted_below_zero_is_insufficient_funds() {
        let bp = account(dec!(100));
        match bp.adjusted(dec!(-100.01), now()) {
            Err(LedgerError::InsufficientFunds {
                required,
                available,
            }) => {
                assert_eq!(required, dec!(100.01));
                assert_eq!(available, dec!(100));
            }
            other => panic!("expected InsufficientFunds, got {other:?}"),
        }
    }

    #[test]
    fn adjusted_keeps_opening_amount() {
        let bp = account(dec!(100));
        let after = bp.adjusted(dec!(-30), now()).unwrap();
        assert_eq!(after.opening_amount, dec!(100));
        assert_eq!(after.created_at, bp.created_at);
    }
}
