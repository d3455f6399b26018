use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{MarketError, Result};

/// Immutable definition of the discretized price domain shared by a cluster.
///
/// The basis is set once at the cluster root and propagated downward with the
/// first session. Two bids or prices are only combinable when their bases are
/// equal; every combination operation checks this precondition and fails fast
/// with `IncompatibleMarketBasis` rather than coercing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketBasis {
    commodity: String,
    currency: String,
    price_steps: u32,
    minimum_price: f64,
    maximum_price: f64,
    /// Number of decimals prices are rounded to.
    significance: u32,
    /// Reference number of the market this basis belongs to.
    market_ref: u32,
}

impl MarketBasis {
    /// Creates a new market basis, validating the price domain.
    pub fn new(
        commodity: impl Into<String>,
        currency: impl Into<String>,
        price_steps: u32,
        minimum_price: f64,
        maximum_price: f64,
    ) -> Result<Self> {
        if price_steps < 2 {
            return Err(MarketError::InvalidMarketBasis(format!(
                "price steps must be > 1, got {}",
                price_steps
            )));
        }
        if !minimum_price.is_finite() || !maximum_price.is_finite() {
            return Err(MarketError::InvalidMarketBasis(
                "price bounds must be finite".to_string(),
            ));
        }
        if maximum_price <= minimum_price {
            return Err(MarketError::InvalidMarketBasis(format!(
                "maximum price {} must be > minimum price {}",
                maximum_price, minimum_price
            )));
        }

        Ok(Self {
            commodity: commodity.into(),
            currency: currency.into(),
            price_steps,
            minimum_price,
            maximum_price,
            significance: 2,
            market_ref: 0,
        })
    }

    /// Sets the number of decimals used when rounding prices.
    pub fn with_significance(mut self, significance: u32) -> Self {
        self.significance = significance;
        self
    }

    /// Sets the market reference number.
    pub fn with_market_ref(mut self, market_ref: u32) -> Self {
        self.market_ref = market_ref;
        self
    }

    pub fn commodity(&self) -> &str {
        &self.commodity
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn price_steps(&self) -> u32 {
        self.price_steps
    }

    pub fn minimum_price(&self) -> f64 {
        self.minimum_price
    }

    pub fn maximum_price(&self) -> f64 {
        self.maximum_price
    }

    pub fn significance(&self) -> u32 {
        self.significance
    }

    pub fn market_ref(&self) -> u32 {
        self.market_ref
    }

    /// Price difference between two adjacent steps.
    pub fn price_increment(&self) -> f64 {
        (self.maximum_price - self.minimum_price) / (self.price_steps - 1) as f64
    }

    /// Converts a real price to its discrete step index: round half up, then
    /// clamp into `[0, price_steps - 1]`.
    pub fn to_price_step(&self, price: f64) -> u32 {
        let raw = (price - self.minimum_price) / (self.maximum_price - self.minimum_price)
            * (self.price_steps - 1) as f64;
        let rounded = (raw + 0.5).floor();
        if rounded <= 0.0 {
            0
        } else if rounded >= (self.price_steps - 1) as f64 {
            self.price_steps - 1
        } else {
            rounded as u32
        }
    }

    /// Converts a step index back to a real price, rounded to the configured
    /// significance. Steps beyond the domain are clamped first.
    pub fn to_price(&self, price_step: u32) -> f64 {
        let step = self.bound_price_step(price_step);
        self.round_price(self.minimum_price + step as f64 * self.price_increment())
    }

    /// Clamps a price into `[minimum_price, maximum_price]`.
    pub fn bound_price(&self, price: f64) -> f64 {
        price.max(self.minimum_price).min(self.maximum_price)
    }

    /// Clamps a step index into `[0, price_steps - 1]`.
    pub fn bound_price_step(&self, price_step: u32) -> u32 {
        price_step.min(self.price_steps - 1)
    }

    /// Rounds a price to the configured number of significant decimals.
    pub fn round_price(&self, price: f64) -> f64 {
        match Decimal::from_f64(price) {
            Some(d) => d
                .round_dp(self.significance)
                .to_f64()
                .unwrap_or(price),
            None => price,
        }
    }

    /// Fails fast when two bases cannot be combined.
    pub fn assert_compatible(&self, other: &MarketBasis) -> Result<()> {
        if self == other {
            Ok(())
        } else {
            Err(MarketError::incompatible_basis(self, other))
        }
    }

    /// True when the other basis covers the same commodity and currency, a
    /// precondition for rebasing a bid between the two.
    pub fn same_commodity(&self, other: &MarketBasis) -> bool {
        self.commodity == other.commodity && self.currency == other.currency
    }
}

/// Equality is structural on the price domain. Significance and market_ref
/// are presentation metadata and do not affect combinability.
impl PartialEq for MarketBasis {
    fn eq(&self, other: &Self) -> bool {
        self.commodity == other.commodity
            && self.currency == other.currency
            && self.price_steps == other.price_steps
            && self.minimum_price == other.minimum_price
            && self.maximum_price == other.maximum_price
    }
}

impl fmt::Display for MarketBasis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MarketBasis{{commodity={}, currency={}, minimumPrice={}, maximumPrice={}, priceSteps={}}}",
            self.commodity, self.currency, self.minimum_price, self.maximum_price, self.price_steps
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basis() -> MarketBasis {
        MarketBasis::new("electricity", "EUR", 11, 0.0, 10.0).unwrap()
    }

    #[test]
    fn rejects_degenerate_domains() {
        assert!(MarketBasis::new("electricity", "EUR", 1, 0.0, 10.0).is_err());
        assert!(MarketBasis::new("electricity", "EUR", 11, 10.0, 10.0).is_err());
        assert!(MarketBasis::new("electricity", "EUR", 11, 10.0, 0.0).is_err());
        assert!(MarketBasis::new("electricity", "EUR", 11, 0.0, f64::NAN).is_err());
    }

    #[test]
    fn price_increment_spans_the_domain() {
        assert_eq!(basis().price_increment(), 1.0);

        let b = MarketBasis::new("electricity", "EUR", 5, -1.0, 1.0).unwrap();
        assert_eq!(b.price_increment(), 0.5);
    }

    #[test]
    fn step_conversion_rounds_half_up_and_clamps() {
        let b = basis();
        assert_eq!(b.to_price_step(0.0), 0);
        assert_eq!(b.to_price_step(3.4), 3);
        assert_eq!(b.to_price_step(3.5), 4);
        assert_eq!(b.to_price_step(10.0), 10);
        // Out-of-range prices clamp instead of overflowing the domain.
        assert_eq!(b.to_price_step(-5.0), 0);
        assert_eq!(b.to_price_step(25.0), 10);
    }

    #[test]
    fn step_to_price_round_trips_on_grid_points() {
        let b = basis();
        for step in 0..b.price_steps() {
            assert_eq!(b.to_price_step(b.to_price(step)), step);
        }
    }

    #[test]
    fn price_rounding_follows_significance() {
        let b = MarketBasis::new("electricity", "EUR", 7, 0.0, 1.0)
            .unwrap()
            .with_significance(2);
        // 1/6 increment rounds to two decimals.
        assert_eq!(b.to_price(1), 0.17);

        let precise = b.clone().with_significance(4);
        assert_eq!(precise.to_price(1), 0.1667);
    }

    #[test]
    fn equality_ignores_presentation_metadata() {
        let a = basis().with_significance(2).with_market_ref(1);
        let b = basis().with_significance(6).with_market_ref(9);
        assert_eq!(a, b);
        assert!(a.assert_compatible(&b).is_ok());

        let other_currency = MarketBasis::new("electricity", "USD", 11, 0.0, 10.0).unwrap();
        assert!(a.assert_compatible(&other_currency).is_err());
    }
}
