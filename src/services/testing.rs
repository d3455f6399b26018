//! Recording endpoint doubles shared by the service unit tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use crate::error::Result;
use crate::market::basis::MarketBasis;
use crate::market::price::{BidUpdate, PriceUpdate};
use crate::services::endpoint::{AgentEndpoint, MatcherEndpoint};
use crate::services::session::Session;

/// Agent double that records everything delivered to it.
pub struct RecordingAgent {
    agent_id: String,
    desired_parent_id: String,
    session: Mutex<Option<Session>>,
    prices: Mutex<Vec<PriceUpdate>>,
    disconnects: AtomicU32,
}

impl RecordingAgent {
    pub fn new(agent_id: &str, desired_parent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            desired_parent_id: desired_parent_id.to_string(),
            session: Mutex::new(None),
            prices: Mutex::new(Vec::new()),
            disconnects: AtomicU32::new(0),
        }
    }

    pub fn session(&self) -> Option<Session> {
        self.session.lock().unwrap().clone()
    }

    pub fn received_prices(&self) -> Vec<PriceUpdate> {
        self.prices.lock().unwrap().clone()
    }

    pub fn disconnect_count(&self) -> u32 {
        self.disconnects.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl AgentEndpoint for RecordingAgent {
    fn agent_id(&self) -> &str {
        &self.agent_id
    }

    fn desired_parent_id(&self) -> &str {
        &self.desired_parent_id
    }

    async fn connect_to_matcher(&self, session: Session) {
        *self.session.lock().unwrap() = Some(session);
    }

    async fn matcher_disconnected(&self, _session: Session) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
        *self.session.lock().unwrap() = None;
    }

    async fn handle_price_update(&self, price_update: PriceUpdate) -> Result<()> {
        self.prices.lock().unwrap().push(price_update);
        Ok(())
    }
}

/// Matcher double with a switchable accept decision.
pub struct RecordingMatcher {
    agent_id: String,
    accept: AtomicBool,
    market_basis: Option<MarketBasis>,
    cluster_id: String,
    bids: Mutex<Vec<BidUpdate>>,
    disconnects: AtomicU32,
}

impl RecordingMatcher {
    pub fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            accept: AtomicBool::new(true),
            market_basis: None,
            cluster_id: "test-cluster".to_string(),
            bids: Mutex::new(Vec::new()),
            disconnects: AtomicU32::new(0),
        }
    }

    /// Matcher that assigns a basis and cluster id on acceptance, the way a
    /// real root node does.
    pub fn with_basis(agent_id: &str, market_basis: MarketBasis) -> Self {
        Self {
            market_basis: Some(market_basis),
            ..Self::new(agent_id)
        }
    }

    pub fn set_accepting(&self, accept: bool) {
        self.accept.store(accept, Ordering::Relaxed);
    }

    pub fn received_bids(&self) -> Vec<BidUpdate> {
        self.bids.lock().unwrap().clone()
    }

    pub fn disconnect_count(&self) -> u32 {
        self.disconnects.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MatcherEndpoint for RecordingMatcher {
    fn agent_id(&self) -> &str {
        &self.agent_id
    }

    async fn connect_to_agent(&self, session: Session) -> bool {
        if !self.accept.load(Ordering::Relaxed) {
            return false;
        }
        if let Some(basis) = &self.market_basis {
            if session.set_market_basis(basis.clone()).is_err()
                || session.set_cluster_id(&self.cluster_id).is_err()
            {
                return false;
            }
        }
        true
    }

    async fn agent_disconnected(&self, _session: Session) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    async fn handle_bid_update(&self, _session: &Session, bid_update: BidUpdate) -> Result<()> {
        self.bids.lock().unwrap().push(bid_update);
        Ok(())
    }
}
