use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MarketError>;

/// Errors raised by the market coordination core.
///
/// Every variant is recoverable at the call boundary where it occurs: an
/// invalid bid never reaches the aggregation state, a refused session-connect
/// leaves the potential session pending. Only `Internal` signals a broken
/// internal contract (e.g. a session handed to a node that did not create it).
#[derive(Debug, Error, Serialize)]
pub enum MarketError {
    #[error("incompatible market basis: expected {expected}, got {actual}")]
    IncompatibleMarketBasis { expected: String, actual: String },

    #[error("invalid bid: {0}")]
    InvalidBid(String),

    #[error("price {price} out of range [{minimum}, {maximum}]")]
    PriceOutOfRange {
        price: f64,
        minimum: f64,
        maximum: f64,
    },

    #[error("invalid market basis: {0}")]
    InvalidMarketBasis(String),

    #[error("illegal session state: {0}")]
    IllegalSessionState(String),

    #[error("topology conflict: {0}")]
    TopologyConflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MarketError {
    /// Basis mismatch between a bid/price and the session's cluster basis.
    pub fn incompatible_basis(expected: impl ToString, actual: impl ToString) -> Self {
        MarketError::IncompatibleMarketBasis {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Bid curve rejected before it can reach any aggregate.
    pub fn invalid_bid(reason: impl Into<String>) -> Self {
        MarketError::InvalidBid(reason.into())
    }

    pub fn price_out_of_range(price: f64, minimum: f64, maximum: f64) -> Self {
        MarketError::PriceOutOfRange {
            price,
            minimum,
            maximum,
        }
    }

    pub fn illegal_session_state(reason: impl Into<String>) -> Self {
        MarketError::IllegalSessionState(reason.into())
    }

    pub fn topology_conflict(reason: impl Into<String>) -> Self {
        MarketError::TopologyConflict(reason.into())
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        MarketError::Internal(reason.into())
    }

    /// True for errors a caller may retry after refreshing its inputs.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, MarketError::Internal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_the_violation() {
        let err = MarketError::invalid_bid("demand must be non-increasing");
        assert_eq!(
            err.to_string(),
            "invalid bid: demand must be non-increasing"
        );

        let err = MarketError::price_out_of_range(12.0, 0.0, 10.0);
        assert_eq!(err.to_string(), "price 12 out of range [0, 10]");
    }

    #[test]
    fn only_internal_is_unrecoverable() {
        assert!(MarketError::invalid_bid("x").is_recoverable());
        assert!(MarketError::topology_conflict("x").is_recoverable());
        assert!(!MarketError::internal("broken contract").is_recoverable());
    }
}
