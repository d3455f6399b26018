use once_cell::sync::OnceCell;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::info;
use uuid::Uuid;

use crate::error::{MarketError, Result};
use crate::market::basis::MarketBasis;
use crate::market::price::{BidUpdate, PriceUpdate};
use crate::services::endpoint::{AgentEndpoint, MatcherEndpoint};

/// Lifecycle of a session: one side known, both sides bound, or torn down.
/// `Disconnected` is terminal; reconnecting requires a new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Connected,
    Disconnected,
}

/// The only legal channel for bid and price traffic between one agent-role
/// and one matcher-role participant.
///
/// Identity (`session_id`, `agent_id`, `matcher_id`) is fixed at creation.
/// The matcher assigns `cluster_id` and `market_basis` exactly once when it
/// accepts the session; a second assignment is an `IllegalSessionState`
/// contract violation. Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    session_id: Uuid,
    agent_id: String,
    matcher_id: String,
    cluster_id: OnceCell<String>,
    market_basis: OnceCell<MarketBasis>,
    state: Mutex<SessionState>,
    agent: Arc<dyn AgentEndpoint>,
    matcher: Arc<dyn MatcherEndpoint>,
}

impl Session {
    /// Creates a pending session between the two endpoints.
    pub fn new(agent: Arc<dyn AgentEndpoint>, matcher: Arc<dyn MatcherEndpoint>) -> Self {
        let agent_id = agent.agent_id().to_string();
        let matcher_id = matcher.agent_id().to_string();
        Self {
            inner: Arc::new(SessionInner {
                session_id: Uuid::new_v4(),
                agent_id,
                matcher_id,
                cluster_id: OnceCell::new(),
                market_basis: OnceCell::new(),
                state: Mutex::new(SessionState::Pending),
                agent,
                matcher,
            }),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.inner.session_id
    }

    pub fn agent_id(&self) -> &str {
        &self.inner.agent_id
    }

    pub fn matcher_id(&self) -> &str {
        &self.inner.matcher_id
    }

    pub fn cluster_id(&self) -> Option<&str> {
        self.inner.cluster_id.get().map(|s| s.as_str())
    }

    pub fn market_basis(&self) -> Option<&MarketBasis> {
        self.inner.market_basis.get()
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock().expect("session state poisoned")
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn is_disconnected(&self) -> bool {
        self.state() == SessionState::Disconnected
    }

    /// Assigns the cluster id. Done by the matcher at acceptance, once.
    pub fn set_cluster_id(&self, cluster_id: impl Into<String>) -> Result<()> {
        self.inner
            .cluster_id
            .set(cluster_id.into())
            .map_err(|_| MarketError::illegal_session_state("cluster id can only be set once"))
    }

    /// Assigns the market basis. Done by the matcher at acceptance, once.
    pub fn set_market_basis(&self, market_basis: MarketBasis) -> Result<()> {
        self.inner
            .market_basis
            .set(market_basis)
            .map_err(|_| MarketError::illegal_session_state("market basis can only be set once"))
    }

    /// Promotes the session once the matcher side has accepted it. Called by
    /// the topology matcher only.
    pub(crate) fn mark_connected(&self) -> Result<()> {
        let mut state = self.inner.state.lock().expect("session state poisoned");
        match *state {
            SessionState::Pending => {
                *state = SessionState::Connected;
                Ok(())
            }
            other => Err(MarketError::illegal_session_state(format!(
                "cannot connect session in state {:?}",
                other
            ))),
        }
    }

    /// Forwards a bid from the agent side to the matcher side.
    pub async fn update_bid(&self, bid_update: BidUpdate) -> Result<()> {
        self.ensure_connected()?;
        self.inner.matcher.handle_bid_update(self, bid_update).await
    }

    /// Forwards a price from the matcher side to the agent side.
    pub async fn update_price(&self, price_update: PriceUpdate) -> Result<()> {
        self.ensure_connected()?;
        self.inner.agent.handle_price_update(price_update).await
    }

    /// Tears the session down, notifying both sides exactly once. A second
    /// call is a no-op, never an error.
    pub async fn disconnect(&self) {
        {
            let mut state = self.inner.state.lock().expect("session state poisoned");
            if *state == SessionState::Disconnected {
                return;
            }
            *state = SessionState::Disconnected;
        }

        self.inner.agent.matcher_disconnected(self.clone()).await;
        self.inner.matcher.agent_disconnected(self.clone()).await;
        info!(
            session_id = %self.inner.session_id,
            agent_id = %self.inner.agent_id,
            matcher_id = %self.inner.matcher_id,
            "session disconnected"
        );
    }

    fn ensure_connected(&self) -> Result<()> {
        match self.state() {
            SessionState::Connected => Ok(()),
            other => Err(MarketError::illegal_session_state(format!(
                "session {} is {:?}, traffic requires Connected",
                self.inner.session_id, other
            ))),
        }
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.inner.session_id == other.inner.session_id
    }
}

impl Eq for Session {}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.inner.session_id)
            .field("agent_id", &self.inner.agent_id)
            .field("matcher_id", &self.inner.matcher_id)
            .field("cluster_id", &self.cluster_id())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::{RecordingAgent, RecordingMatcher};
    use crate::market::bid::Bid;

    fn basis() -> MarketBasis {
        MarketBasis::new("electricity", "EUR", 11, 0.0, 10.0).unwrap()
    }

    fn session() -> (Arc<RecordingAgent>, Arc<RecordingMatcher>, Session) {
        let agent = Arc::new(RecordingAgent::new("agent-1", "matcher-1"));
        let matcher = Arc::new(RecordingMatcher::new("matcher-1"));
        let session = Session::new(agent.clone(), matcher.clone());
        (agent, matcher, session)
    }

    #[tokio::test]
    async fn traffic_requires_a_connected_session() {
        let (_, _, session) = session();
        let bid = Bid::flat(basis(), -1.0).unwrap();

        let err = session
            .update_bid(BidUpdate::from_bid(bid))
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::IllegalSessionState(_)));
    }

    #[tokio::test]
    async fn immutable_fields_reject_a_second_assignment() {
        let (_, _, session) = session();
        session.set_cluster_id("cluster-a").unwrap();
        session.set_market_basis(basis()).unwrap();

        assert!(session.set_cluster_id("cluster-b").is_err());
        assert!(session.set_market_basis(basis()).is_err());
        assert_eq!(session.cluster_id(), Some("cluster-a"));
    }

    #[tokio::test]
    async fn disconnect_notifies_both_sides_exactly_once() {
        let (agent, matcher, session) = session();
        session.mark_connected().unwrap();

        session.disconnect().await;
        session.disconnect().await;

        assert_eq!(agent.disconnect_count(), 1);
        assert_eq!(matcher.disconnect_count(), 1);
        assert!(session.is_disconnected());
    }

    #[tokio::test]
    async fn no_resurrection_after_disconnect() {
        let (_, _, session) = session();
        session.mark_connected().unwrap();
        session.disconnect().await;

        assert!(session.mark_connected().is_err());
        let bid = Bid::flat(basis(), -1.0).unwrap();
        assert!(session.update_bid(BidUpdate::from_bid(bid)).await.is_err());
    }
}
