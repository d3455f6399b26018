use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{MarketError, Result};
use crate::market::basis::MarketBasis;
use crate::market::bid::Bid;

/// A market price on a specific basis. Immutable; the stored value is
/// significance-rounded and always inside the basis' price range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    market_basis: MarketBasis,
    price_value: f64,
}

impl Price {
    /// Creates a price, rejecting values outside the basis' range.
    pub fn new(market_basis: MarketBasis, price_value: f64) -> Result<Self> {
        if !price_value.is_finite()
            || price_value < market_basis.minimum_price()
            || price_value > market_basis.maximum_price()
        {
            return Err(MarketError::price_out_of_range(
                price_value,
                market_basis.minimum_price(),
                market_basis.maximum_price(),
            ));
        }
        let price_value = market_basis.round_price(price_value);
        Ok(Self {
            market_basis,
            price_value,
        })
    }

    /// Creates a price by clamping the value into the basis' range. Used by
    /// the resolution engine, whose results are in range by construction.
    pub fn bounded(market_basis: MarketBasis, price_value: f64) -> Self {
        let bounded = market_basis.bound_price(if price_value.is_finite() {
            price_value
        } else {
            market_basis.minimum_price()
        });
        let price_value = market_basis.round_price(bounded);
        Self {
            market_basis,
            price_value,
        }
    }

    /// Creates the price at a discrete step index.
    pub fn from_step(market_basis: MarketBasis, price_step: u32) -> Self {
        let price_value = market_basis.to_price(price_step);
        Self {
            market_basis,
            price_value,
        }
    }

    pub fn market_basis(&self) -> &MarketBasis {
        &self.market_basis
    }

    pub fn price_value(&self) -> f64 {
        self.price_value
    }

    /// Discrete step index of this price on its basis.
    pub fn as_step(&self) -> u32 {
        self.market_basis.to_price_step(self.price_value)
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{}",
            self.price_value,
            self.market_basis.currency(),
            self.market_basis.commodity()
        )
    }
}

/// A price response travelling down the tree. The bid number is copied from
/// the bid this price answers, so each recipient can verify the price
/// corresponds to its own most recent bid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub price: Price,
    pub bid_number: u64,
}

impl PriceUpdate {
    pub fn new(price: Price, bid_number: u64) -> Self {
        Self { price, bid_number }
    }
}

impl fmt::Display for PriceUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PriceUpdate{{price={}, bidNumber={}}}", self.price, self.bid_number)
    }
}

/// A bid travelling up the tree. The wrapper's bid number may differ from the
/// bid's own when a node relays an aggregate under its own numbering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidUpdate {
    pub bid: Bid,
    pub bid_number: u64,
}

impl BidUpdate {
    pub fn new(bid: Bid, bid_number: u64) -> Self {
        Self { bid, bid_number }
    }

    /// Wraps a bid under its own bid number.
    pub fn from_bid(bid: Bid) -> Self {
        let bid_number = bid.bid_number();
        Self { bid, bid_number }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basis() -> MarketBasis {
        MarketBasis::new("electricity", "EUR", 11, 0.0, 10.0).unwrap()
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(matches!(
            Price::new(basis(), 10.5),
            Err(MarketError::PriceOutOfRange { .. })
        ));
        assert!(matches!(
            Price::new(basis(), -0.1),
            Err(MarketError::PriceOutOfRange { .. })
        ));
        assert!(Price::new(basis(), f64::NAN).is_err());
        assert!(Price::new(basis(), 10.0).is_ok());
    }

    #[test]
    fn bounded_clamps_into_the_domain() {
        assert_eq!(Price::bounded(basis(), 25.0).price_value(), 10.0);
        assert_eq!(Price::bounded(basis(), -3.0).price_value(), 0.0);
        assert_eq!(Price::bounded(basis(), 4.25).price_value(), 4.25);
    }

    #[test]
    fn step_conversion_round_trips() {
        let price = Price::from_step(basis(), 7);
        assert_eq!(price.price_value(), 7.0);
        assert_eq!(price.as_step(), 7);
    }

    #[test]
    fn bid_update_defaults_to_the_bids_own_number() {
        let bid = Bid::flat(basis(), -2.0).unwrap().with_bid_number(42);
        let update = BidUpdate::from_bid(bid);
        assert_eq!(update.bid_number, 42);
    }
}
