use async_trait::async_trait;

use crate::error::Result;
use crate::market::price::{BidUpdate, PriceUpdate};
use crate::services::session::Session;

/// Downstream role of a market participant: submits bids and receives prices.
///
/// Implemented by device agents and by the concentrator (toward its parent).
/// All methods are invoked through a [`Session`]; an agent initiates traffic
/// itself via [`Session::update_bid`].
#[async_trait]
pub trait AgentEndpoint: Send + Sync {
    /// Stable identifier of this participant within the cluster.
    fn agent_id(&self) -> &str;

    /// Identifier of the matcher this participant wants to connect to.
    fn desired_parent_id(&self) -> &str;

    /// Called by the topology matcher once the matcher side has accepted the
    /// session.
    async fn connect_to_matcher(&self, session: Session);

    /// Called when the session to the matcher is torn down.
    async fn matcher_disconnected(&self, session: Session);

    /// Delivers a price update travelling down the tree.
    async fn handle_price_update(&self, price_update: PriceUpdate) -> Result<()>;
}

/// Upstream role of a market participant: accepts agent sessions and
/// receives their bids.
///
/// Implemented by the auctioneer and by the concentrator (toward its
/// children).
#[async_trait]
pub trait MatcherEndpoint: Send + Sync {
    /// Stable identifier of this participant within the cluster.
    fn agent_id(&self) -> &str;

    /// Asks the matcher to accept a new session. On acceptance the matcher
    /// assigns the market basis and cluster id to the session and returns
    /// true; a refusal leaves the pairing pending at the topology matcher.
    async fn connect_to_agent(&self, session: Session) -> bool;

    /// Called when an agent session is torn down.
    async fn agent_disconnected(&self, session: Session);

    /// Delivers a bid update travelling up the tree.
    async fn handle_bid_update(&self, session: &Session, bid_update: BidUpdate) -> Result<()>;
}
