//! src/position.rs
//! Per-ticker position aggregate with BUY/SELL apply and reverse operations.
//!
//! Pure and side-effect free: all persistence happens in the store layer.
//! Money is kept at scale 4, share quantities and average cost at scale 6,
//! and every division rounds half away from zero.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;
use uuid::Uuid;

/// Scale for invested amounts, fees and prices.
pub const MONEY_SCALE: u32 = 4;
/// Scale for share quantities and per-share average cost.
pub const SHARE_SCALE: u32 = 6;

#[inline]
pub fn money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

#[inline]
pub fn shares(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(SHARE_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Average cost for a holding; zero when the holding is empty.
#[inline]
fn unit_cost(invested: Decimal, share_count: Decimal) -> Decimal {
    if share_count.is_zero() {
        Decimal::ZERO
    } else {
        (invested / share_count)
            .round_dp_with_strategy(SHARE_SCALE, RoundingStrategy::MidpointAwayFromZero)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum PositionError {
    #[error("invalid transaction input: {0}")]
    InvalidInput(String),

    #[error("cannot remove {requested} shares, only {available} owned")]
    Oversell {
        requested: Decimal,
        available: Decimal,
    },

    /// Reversing a SELL needs a positive average cost to restore the basis;
    /// after a full liquidation there is nothing left to restore from.
    #[error("cannot reverse a sell without a positive cost basis")]
    MissingCostBasis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Usd,
    Eur,
    Gbp,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Gbp => "GBP",
        }
    }

    pub fn parse(s: &str) -> Result<Self, PositionError> {
        match s.to_uppercase().as_str() {
            "USD" => Ok(Currency::Usd),
            "EUR" => Ok(Currency::Eur),
            "GBP" => Ok(Currency::Gbp),
            _ => Err(PositionError::InvalidInput(format!(
                "unsupported currency: '{s}'"
            ))),
        }
    }
}

/// BUY or SELL, parsed case-insensitively at the aggregate boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn parse(s: &str) -> Result<Self, PositionError> {
        match s.to_uppercase().as_str() {
            "BUY" => Ok(TradeSide::Buy),
            "SELL" => Ok(TradeSide::Sell),
            _ => Err(PositionError::InvalidInput(format!(
                "unknown transaction type: '{s}'"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }
}

/// Aggregate root: the materialized holding for one ticker.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    /// Assigned by the store on first persist; `None` until then.
    pub id: Option<Uuid>,
    pub ticker: String,
    pub currency: Currency,
    pub shares_owned: Decimal,
    pub average_cost_per_share: Decimal,
    pub total_invested_amount: Decimal,
    pub total_transaction_fees: Decimal,
    pub latest_market_price: Decimal,
    pub first_purchase_date: NaiveDate,
    pub last_updated: NaiveDate,
    /// Watermark: the most recent `occurred_at` folded into this aggregate.
    pub last_event_applied_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub exchange: Option<String>,
    pub country: Option<String>,
    /// Identities of the transactions folded into this aggregate.
    pub transactions: BTreeSet<Uuid>,
}

impl Position {
    pub fn new(ticker: &str, currency: Currency, first_purchase_date: NaiveDate) -> Self {
        Self {
            id: None,
            ticker: ticker.to_string(),
            currency,
            shares_owned: Decimal::ZERO,
            average_cost_per_share: Decimal::ZERO,
            total_invested_amount: Decimal::ZERO,
            total_transaction_fees: Decimal::ZERO,
            latest_market_price: Decimal::ZERO,
            first_purchase_date,
            last_updated: Utc::now().date_naive(),
            last_event_applied_at: None,
            is_active: false,
            exchange: None,
            country: None,
            transactions: BTreeSet::new(),
        }
    }

    /// Out-of-order gate: true iff the event is at or behind the watermark.
    pub fn should_ignore_event(&self, occurred_at: DateTime<Utc>) -> bool {
        matches!(self.last_event_applied_at, Some(watermark) if occurred_at <= watermark)
    }

    /// Advance the watermark. Never moves backwards.
    pub fn mark_event_applied(&mut self, occurred_at: DateTime<Utc>) {
        self.last_event_applied_at = Some(match self.last_event_applied_at {
            Some(watermark) => watermark.max(occurred_at),
            None => occurred_at,
        });
    }

    /// Carry exchange/country enrichment from an event when present.
    pub fn enrich(&mut self, exchange: Option<&str>, country: Option<&str>) {
        if let Some(exchange) = exchange {
            self.exchange = Some(exchange.to_string());
        }
        if let Some(country) = country {
            self.country = Some(country.to_string());
        }
    }

    fn validate_trade(
        quantity: Decimal,
        price: Decimal,
        fees: Decimal,
    ) -> Result<(), PositionError> {
        if quantity <= Decimal::ZERO {
            return Err(PositionError::InvalidInput(format!(
                "quantity must be positive, got {quantity}"
            )));
        }
        if price < Decimal::ZERO {
            return Err(PositionError::InvalidInput(format!(
                "price must not be negative, got {price}"
            )));
        }
        if fees < Decimal::ZERO {
            return Err(PositionError::InvalidInput(format!(
                "fees must not be negative, got {fees}"
            )));
        }
        Ok(())
    }

    /// Fold a buy into the holding. Fees capitalize into the invested amount.
    pub fn apply_buy(
        &mut self,
        quantity: Decimal,
        price: Decimal,
        fees: Decimal,
    ) -> Result<(), PositionError> {
        Self::validate_trade(quantity, price, fees)?;

        let cost = money(quantity * price + fees);
        self.shares_owned = shares(self.shares_owned + quantity);
        self.total_invested_amount = money(self.total_invested_amount + cost);
        self.average_cost_per_share = unit_cost(self.total_invested_amount, self.shares_owned);
        self.total_transaction_fees = money(self.total_transaction_fees + fees);
        self.latest_market_price = money(price);
        self.is_active = true;
        Ok(())
    }

    /// Fold a sell into the holding. The basis comes off at the current
    /// average cost, not the trade price; sell fees are expensed into the
    /// fee total and leave the invested amount untouched.
    pub fn apply_sell(
        &mut self,
        quantity: Decimal,
        price: Decimal,
        fees: Decimal,
    ) -> Result<(), PositionError> {
        Self::validate_trade(quantity, price, fees)?;
        if quantity > self.shares_owned {
            return Err(PositionError::Oversell {
                requested: quantity,
                available: self.shares_owned,
            });
        }

        let proportional_cost = money(quantity * self.average_cost_per_share);
        self.shares_owned = shares(self.shares_owned - quantity);
        self.total_invested_amount = if self.shares_owned.is_zero() {
            Decimal::ZERO
        } else {
            money(self.total_invested_amount - proportional_cost)
        };
        self.average_cost_per_share = unit_cost(self.total_invested_amount, self.shares_owned);
        self.total_transaction_fees = money(self.total_transaction_fees + fees);
        self.latest_market_price = money(price);
        self.is_active = !self.shares_owned.is_zero();
        Ok(())
    }

    /// Exact inverse of `apply_buy`.
    pub fn reverse_buy(
        &mut self,
        quantity: Decimal,
        price: Decimal,
        fees: Decimal,
    ) -> Result<(), PositionError> {
        Self::validate_trade(quantity, price, fees)?;
        if quantity > self.shares_owned {
            return Err(PositionError::Oversell {
                requested: quantity,
                available: self.shares_owned,
            });
        }

        let cost = money(quantity * price + fees);
        self.shares_owned = shares(self.shares_owned - quantity);
        self.total_invested_amount = if self.shares_owned.is_zero() {
            Decimal::ZERO
        } else {
            money(self.total_invested_amount - cost)
        };
        self.average_cost_per_share = unit_cost(self.total_invested_amount, self.shares_owned);
        self.total_transaction_fees = money(self.total_transaction_fees - fees);
        self.is_active = !self.shares_owned.is_zero();
        Ok(())
    }

    /// Inverse of `apply_sell`, restoring the basis at the *current* average
    /// cost. When later trades moved the average this is an approximation of
    /// the historical basis; long correction chains may need a projection
    /// rebuild from the empty state.
    pub fn reverse_sell(
        &mut self,
        quantity: Decimal,
        price: Decimal,
        fees: Decimal,
    ) -> Result<(), PositionError> {
        // The trade price is validated but plays no part in the restored
        // basis; that comes from the current average.
        Self::validate_trade(quantity, price, fees)?;
        if self.average_cost_per_share <= Decimal::ZERO {
            return Err(PositionError::MissingCostBasis);
        }

        self.shares_owned = shares(self.shares_owned + quantity);
        self.total_invested_amount =
            money(self.total_invested_amount + money(quantity * self.average_cost_per_share));
        self.average_cost_per_share = unit_cost(self.total_invested_amount, self.shares_owned);
        self.total_transaction_fees = money(self.total_transaction_fees - fees);
        self.is_active = true;
        Ok(())
    }

    /// Dispatch a transaction onto the holding and record its identity.
    pub fn apply_transaction(
        &mut self,
        transaction_id: Uuid,
        side: &str,
        quantity: Decimal,
        price: Decimal,
        fees: Decimal,
    ) -> Result<(), PositionError> {
        match TradeSide::parse(side)? {
            TradeSide::Buy => self.apply_buy(quantity, price, fees)?,
            TradeSide::Sell => self.apply_sell(quantity, price, fees)?,
        }
        self.transactions.insert(transaction_id);
        self.touch();
        Ok(())
    }

    /// Undo a previously applied transaction and drop its identity.
    pub fn reverse_transaction(
        &mut self,
        transaction_id: Uuid,
        side: &str,
        quantity: Decimal,
        price: Decimal,
        fees: Decimal,
    ) -> Result<(), PositionError> {
        match TradeSide::parse(side)? {
            TradeSide::Buy => self.reverse_buy(quantity, price, fees)?,
            TradeSide::Sell => self.reverse_sell(quantity, price, fees)?,
        }
        self.transactions.remove(&transaction_id);
        self.touch();
        Ok(())
    }

    fn touch(&mut self) {
        self.last_updated = Utc::now().date_naive();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn position() -> Position {
        Position::new(
            "AAPL",
            Currency::Usd,
            NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
        )
    }

    fn tx_id() -> Uuid {
        Uuid::new_v4()
    }

    #[test]
    fn buy_capitalizes_fees_into_invested_amount() {
        let mut p = position();
        p.apply_buy(dec!(10), dec!(150), dec!(1.50)).unwrap();

        assert_eq!(p.shares_owned, dec!(10.000000));
        assert_eq!(p.total_invested_amount, dec!(1501.5000));
        assert_eq!(p.average_cost_per_share, dec!(150.150000));
        assert_eq!(p.total_transaction_fees, dec!(1.5000));
        assert_eq!(p.latest_market_price, dec!(150.0000));
        assert!(p.is_active);
    }

    #[test]
    fn sell_takes_basis_at_average_cost_not_trade_price() {
        let mut p = position();
        p.apply_buy(dec!(10), dec!(100), dec!(0)).unwrap();
        p.apply_sell(dec!(4), dec!(250), dec!(0)).unwrap();

        // 4 shares leave at the 100 average, not at the 250 trade price.
        assert_eq!(p.shares_owned, dec!(6.000000));
        assert_eq!(p.total_invested_amount, dec!(600.0000));
        assert_eq!(p.average_cost_per_share, dec!(100.000000));
        assert_eq!(p.latest_market_price, dec!(250.0000));
    }

    #[test]
    fn sell_fees_accumulate_but_never_reduce_invested_amount() {
        let mut p = position();
        p.apply_buy(dec!(10), dec!(100), dec!(0)).unwrap();
        p.apply_sell(dec!(5), dec!(120), dec!(3.25)).unwrap();

        assert_eq!(p.total_invested_amount, dec!(500.0000));
        assert_eq!(p.total_transaction_fees, dec!(3.2500));
    }

    #[test]
    fn selling_everything_collapses_the_holding() {
        let mut p = position();
        p.apply_buy(dec!(7), dec!(33.33), dec!(1)).unwrap();
        p.apply_sell(dec!(7), dec!(40), dec!(1)).unwrap();

        assert_eq!(p.shares_owned, Decimal::ZERO);
        assert_eq!(p.total_invested_amount, Decimal::ZERO);
        assert_eq!(p.average_cost_per_share, Decimal::ZERO);
        assert!(!p.is_active);
        // Fees survive the collapse.
        assert_eq!(p.total_transaction_fees, dec!(2.0000));
    }

    #[test]
    fn oversell_is_rejected() {
        let mut p = position();
        p.apply_buy(dec!(3), dec!(10), dec!(0)).unwrap();

        let err = p.apply_sell(dec!(5), dec!(10), dec!(0)).unwrap_err();
        assert!(matches!(err, PositionError::Oversell { .. }));
        // State untouched by the failed mutation.
        assert_eq!(p.shares_owned, dec!(3.000000));
    }

    #[test]
    fn invalid_quantity_price_and_fees_are_rejected() {
        let mut p = position();
        assert!(matches!(
            p.apply_buy(dec!(0), dec!(10), dec!(0)),
            Err(PositionError::InvalidInput(_))
        ));
        assert!(matches!(
            p.apply_buy(dec!(1), dec!(-10), dec!(0)),
            Err(PositionError::InvalidInput(_))
        ));
        assert!(matches!(
            p.apply_buy(dec!(1), dec!(10), dec!(-1)),
            Err(PositionError::InvalidInput(_))
        ));
    }

    #[test]
    fn reverse_buy_restores_state_exactly() {
        let mut p = position();
        p.apply_buy(dec!(12), dec!(87.65), dec!(2.5)).unwrap();
        let snapshot = p.clone();

        p.apply_buy(dec!(3), dec!(91.10), dec!(1.1)).unwrap();
        p.reverse_buy(dec!(3), dec!(91.10), dec!(1.1)).unwrap();

        assert_eq!(p.shares_owned, snapshot.shares_owned);
        assert_eq!(p.total_invested_amount, snapshot.total_invested_amount);
        assert_eq!(p.average_cost_per_share, snapshot.average_cost_per_share);
        assert_eq!(p.total_transaction_fees, snapshot.total_transaction_fees);
    }

    #[test]
    fn reverse_sell_uses_current_average_cost() {
        let mut p = position();
        p.apply_buy(dec!(10), dec!(100), dec!(0)).unwrap();
        p.apply_sell(dec!(4), dec!(150), dec!(2)).unwrap();
        p.reverse_sell(dec!(4), dec!(150), dec!(2)).unwrap();

        // Basis is restored at the 100 average, so the round trip is exact
        // while the average is unchanged between apply and reverse.
        assert_eq!(p.shares_owned, dec!(10.000000));
        assert_eq!(p.total_invested_amount, dec!(1000.0000));
        assert_eq!(p.average_cost_per_share, dec!(100.000000));
        assert_eq!(p.total_transaction_fees, Decimal::ZERO);
    }

    #[test]
    fn reverse_sell_without_basis_is_rejected() {
        let mut p = position();
        p.apply_buy(dec!(5), dec!(20), dec!(0)).unwrap();
        p.apply_sell(dec!(5), dec!(25), dec!(0)).unwrap();

        // Holding fully liquidated: average cost is gone, nothing to restore.
        let err = p.reverse_sell(dec!(5), dec!(25), dec!(0)).unwrap_err();
        assert_eq!(err, PositionError::MissingCostBasis);
    }

    #[test]
    fn transaction_dispatch_is_case_insensitive_and_tracks_identity() {
        let mut p = position();
        let id = tx_id();
        p.apply_transaction(id, "buy", dec!(2), dec!(5), dec!(0))
            .unwrap();
        assert!(p.transactions.contains(&id));

        p.reverse_transaction(id, "Buy", dec!(2), dec!(5), dec!(0))
            .unwrap();
        assert!(!p.transactions.contains(&id));
    }

    #[test]
    fn unknown_transaction_type_is_fatal() {
        let mut p = position();
        let err = p
            .apply_transaction(tx_id(), "TRANSFER", dec!(1), dec!(1), dec!(0))
            .unwrap_err();
        assert!(matches!(err, PositionError::InvalidInput(_)));
    }

    #[test]
    fn watermark_gate_ignores_stale_and_equal_events() {
        let mut p = position();
        let t1 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let t0 = t1 - chrono::Duration::seconds(30);
        let t2 = t1 + chrono::Duration::seconds(30);

        assert!(!p.should_ignore_event(t1));
        p.mark_event_applied(t1);
        assert!(p.should_ignore_event(t0));
        assert!(p.should_ignore_event(t1));
        assert!(!p.should_ignore_event(t2));

        // The watermark never moves backwards.
        p.mark_event_applied(t0);
        assert_eq!(p.last_event_applied_at, Some(t1));
    }

    fn qty_strategy() -> impl Strategy<Value = Decimal> {
        (1i64..=1_000_000).prop_map(|n| Decimal::new(n, 4))
    }

    fn price_strategy() -> impl Strategy<Value = Decimal> {
        (0i64..=10_000_000).prop_map(|n| Decimal::new(n, 4))
    }

    fn fee_strategy() -> impl Strategy<Value = Decimal> {
        (0i64..=100_000).prop_map(|n| Decimal::new(n, 4))
    }

    proptest! {
        #[test]
        fn buy_then_reverse_is_identity(
            base_qty in qty_strategy(),
            base_price in price_strategy(),
            qty in qty_strategy(),
            price in price_strategy(),
            fees in fee_strategy(),
        ) {
            let mut p = position();
            p.apply_buy(base_qty, base_price, Decimal::ZERO).unwrap();
            let before = p.clone();

            p.apply_buy(qty, price, fees).unwrap();
            p.reverse_buy(qty, price, fees).unwrap();

            prop_assert_eq!(p.shares_owned, before.shares_owned);
            prop_assert_eq!(p.total_invested_amount, before.total_invested_amount);
            prop_assert_eq!(p.average_cost_per_share, before.average_cost_per_share);
            prop_assert_eq!(p.total_transaction_fees, before.total_transaction_fees);
        }

        #[test]
        fn sell_then_reverse_restores_shares_and_fees(
            base_qty in qty_strategy(),
            // At least 1.0 so the basis never rounds away at money scale.
            base_price in (10_000i64..=10_000_000).prop_map(|n| Decimal::new(n, 4)),
            price in price_strategy(),
            fees in fee_strategy(),
        ) {
            let mut p = position();
            p.apply_buy(base_qty + dec!(1), base_price, Decimal::ZERO).unwrap();
            let before = p.clone();

            // Partial sell leaves the average nearly intact; the restored
            // basis can drift by one money ulp when the average does not
            // divide cleanly, never more.
            p.apply_sell(base_qty, price, fees).unwrap();
            p.reverse_sell(base_qty, price, fees).unwrap();

            prop_assert_eq!(p.shares_owned, before.shares_owned);
            prop_assert_eq!(p.total_transaction_fees, before.total_transaction_fees);
            let drift = (p.total_invested_amount - before.total_invested_amount).abs();
            prop_assert!(drift < dec!(0.001), "basis drift {} too large", drift);
        }

        #[test]
        fn invariants_hold_over_random_trades(
            // Quantities capped so accumulated average-cost rounding stays
            // inside the 1e-3 basis tolerance.
            ops in prop::collection::vec(
                (any::<bool>(), (1i64..=100_000).prop_map(|n| Decimal::new(n, 4)), price_strategy(), fee_strategy()),
                1..40,
            ),
        ) {
            let mut p = position();
            for (is_buy, qty, price, fees) in ops {
                let result = if is_buy {
                    p.apply_buy(qty, price, fees)
                } else {
                    p.apply_sell(qty, price, fees)
                };
                // Oversell rejections leave the holding untouched.
                if let Err(e) = result {
                    let is_oversell = matches!(e, PositionError::Oversell { .. });
                    prop_assert!(is_oversell);
                }

                prop_assert!(p.shares_owned >= Decimal::ZERO);
                if p.shares_owned.is_zero() {
                    prop_assert_eq!(p.total_invested_amount, Decimal::ZERO);
                    prop_assert_eq!(p.average_cost_per_share, Decimal::ZERO);
                    prop_assert!(!p.is_active);
                } else {
                    let drift = (p.average_cost_per_share * p.shares_owned
                        - p.total_invested_amount)
                        .abs();
                    prop_assert!(drift < dec!(0.001), "basis drift {} too large", drift);
                }
            }
        }
    }
}
