use async_trait::async_trait;
use chrono::Duration as TimeoutDuration;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{MarketError, Result};
use crate::market::price::{BidUpdate, PriceUpdate};
use crate::services::bid_cache::BidCache;
use crate::services::clock::Clock;
use crate::services::endpoint::{AgentEndpoint, MatcherEndpoint};
use crate::services::scheduler::{ScheduledTask, TaskHandle, TaskScheduler};
use crate::services::session::Session;

#[derive(Debug, Clone)]
pub struct ConcentratorConfig {
    pub agent_id: String,
    /// Matcher this node wants to connect to as its parent.
    pub desired_parent_id: String,
    /// Interval between upstream bid updates.
    pub bid_update_interval: Duration,
    /// Age beyond which a child bid no longer participates in aggregation.
    pub bid_timeout: Option<TimeoutDuration>,
    /// When set, only these child agent ids may hold a session with this
    /// node. Checked at session acceptance only.
    pub allow_list: Option<HashSet<String>>,
}

impl Default for ConcentratorConfig {
    fn default() -> Self {
        Self {
            agent_id: "concentrator".to_string(),
            desired_parent_id: "auctioneer".to_string(),
            bid_update_interval: Duration::from_secs(60),
            bid_timeout: Some(TimeoutDuration::seconds(600)),
            allow_list: None,
        }
    }
}

struct ConcentratorState {
    parent_session: Option<Session>,
    child_sessions: HashMap<Uuid, Session>,
    bid_cache: BidCache,
    allow_list: Option<HashSet<String>>,
}

/// Interior tree node: matcher toward its children, agent toward its parent.
///
/// On its own interval it aggregates the children's last bids into a single
/// upstream bid under its own monotonically increasing bid number, keeping a
/// snapshot of each child's bid number. A price received from the parent
/// answers one of those aggregates, so before fanning the price out the
/// concentrator substitutes, per child, the child's own bid number from the
/// matching snapshot — the parent's number means nothing to a child.
pub struct Concentrator {
    config: ConcentratorConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<ConcentratorState>,
    bid_number: AtomicU64,
    running: AtomicBool,
    task: StdMutex<Option<TaskHandle>>,
}

impl Concentrator {
    pub fn new(config: ConcentratorConfig, clock: Arc<dyn Clock>) -> Self {
        let bid_cache = BidCache::new(config.bid_timeout);
        let allow_list = config.allow_list.clone();
        Self {
            config,
            clock,
            state: Mutex::new(ConcentratorState {
                parent_session: None,
                child_sessions: HashMap::new(),
                bid_cache,
                allow_list,
            }),
            bid_number: AtomicU64::new(0),
            running: AtomicBool::new(false),
            task: StdMutex::new(None),
        }
    }

    pub async fn child_count(&self) -> usize {
        self.state.lock().await.child_sessions.len()
    }

    pub async fn has_parent(&self) -> bool {
        self.state.lock().await.parent_session.is_some()
    }

    /// Replaces the child allow-list. Applies to future acceptances only;
    /// existing sessions are not re-checked.
    pub async fn set_allow_list(&self, allow_list: Option<HashSet<String>>) {
        self.state.lock().await.allow_list = allow_list;
    }

    /// Registers the periodic upstream bid update with the scheduler.
    pub fn start(self: &Arc<Self>, scheduler: &dyn TaskScheduler) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!(agent_id = %self.config.agent_id, "concentrator is already running");
            return;
        }

        let node = Arc::clone(self);
        let task: ScheduledTask = Arc::new(move || {
            let node = node.clone();
            Box::pin(async move {
                node.publish_bid().await;
            })
        });
        let handle = scheduler.schedule_at_fixed_rate(task, self.config.bid_update_interval);
        *self.task.lock().expect("task mutex poisoned") = Some(handle);

        info!(
            agent_id = %self.config.agent_id,
            desired_parent_id = %self.config.desired_parent_id,
            interval_secs = self.config.bid_update_interval.as_secs(),
            "concentrator started"
        );
    }

    /// Cancels the periodic task. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.task.lock().expect("task mutex poisoned").take() {
            handle.cancel();
        }
        info!(agent_id = %self.config.agent_id, "concentrator stopped");
    }

    /// One upstream round: aggregate the children's live bids and send the
    /// sum to the parent under a fresh own bid number.
    pub async fn publish_bid(&self) {
        // Aggregate under the node lock, send after releasing it; the parent
        // may be publishing a price toward us at the same moment.
        let (parent, update) = {
            let mut state = self.state.lock().await;
            let Some(parent) = state.parent_session.clone() else {
                debug!(agent_id = %self.config.agent_id, "no parent session, skipping bid update");
                return;
            };
            let Some(market_basis) = parent.market_basis().cloned() else {
                return;
            };

            let aggregated = match state.bid_cache.aggregate(&market_basis, self.clock.now()) {
                Ok(Some(aggregated)) => aggregated,
                Ok(None) => {
                    debug!(agent_id = %self.config.agent_id, "no live child bids, skipping bid update");
                    return;
                }
                Err(err) => {
                    error!(agent_id = %self.config.agent_id, error = %err, "aggregation failed");
                    return;
                }
            };

            let number = self.bid_number.fetch_add(1, Ordering::SeqCst) + 1;
            state.bid_cache.record_snapshot(number, aggregated.bid_numbers);
            let bid = aggregated.bid.with_bid_number(number);
            (parent, BidUpdate::new(bid, number))
        };

        debug!(
            agent_id = %self.config.agent_id,
            bid_number = update.bid_number,
            "sending aggregated bid upstream"
        );
        if let Err(err) = parent.update_bid(update).await {
            warn!(
                agent_id = %self.config.agent_id,
                error = %err,
                "failed to send aggregated bid upstream"
            );
        }
    }
}

#[async_trait]
impl AgentEndpoint for Concentrator {
    fn agent_id(&self) -> &str {
        &self.config.agent_id
    }

    fn desired_parent_id(&self) -> &str {
        &self.config.desired_parent_id
    }

    async fn connect_to_matcher(&self, session: Session) {
        let mut state = self.state.lock().await;
        info!(
            agent_id = %self.config.agent_id,
            session_id = %session.session_id(),
            cluster_id = ?session.cluster_id(),
            "connected to parent matcher"
        );
        state.parent_session = Some(session);
    }

    async fn matcher_disconnected(&self, session: Session) {
        // Without a parent there is no cluster; children are cut loose and
        // may reconnect once this node has a parent again. Their sessions
        // call back into agent_disconnected, so the lock is released first.
        let children: Vec<Session> = {
            let mut state = self.state.lock().await;
            match &state.parent_session {
                Some(parent) if *parent == session => {}
                _ => return,
            }
            state.parent_session = None;
            state.child_sessions.values().cloned().collect()
        };

        warn!(
            agent_id = %self.config.agent_id,
            children = children.len(),
            "parent disconnected, tearing down child sessions"
        );
        for child in children {
            child.disconnect().await;
        }
    }

    async fn handle_price_update(&self, price_update: PriceUpdate) -> Result<()> {
        // Re-correlate and collect recipients under the lock, fan out after.
        let deliveries = {
            let mut state = self.state.lock().await;
            let Some(parent) = &state.parent_session else {
                return Err(MarketError::illegal_session_state(
                    "price update without a parent session",
                ));
            };
            if let Some(basis) = parent.market_basis() {
                basis.assert_compatible(price_update.price.market_basis())?;
            }

            let Some(snapshot) = state.bid_cache.take_snapshot(price_update.bid_number) else {
                warn!(
                    agent_id = %self.config.agent_id,
                    bid_number = price_update.bid_number,
                    "price update answers a bid this node never sent, ignoring"
                );
                return Ok(());
            };

            let deliveries: Vec<(Session, u64)> = snapshot
                .iter()
                .filter_map(|(session_id, child_number)| {
                    state
                        .child_sessions
                        .get(session_id)
                        .map(|session| (session.clone(), *child_number))
                })
                .collect();
            deliveries
        };

        debug!(
            agent_id = %self.config.agent_id,
            bid_number = price_update.bid_number,
            children = deliveries.len(),
            "fanning price out to children"
        );
        for (session, child_number) in deliveries {
            let update = PriceUpdate::new(price_update.price.clone(), child_number);
            if let Err(err) = session.update_price(update).await {
                warn!(
                    session_id = %session.session_id(),
                    error = %err,
                    "failed to forward price update to child"
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MatcherEndpoint for Concentrator {
    fn agent_id(&self) -> &str {
        &self.config.agent_id
    }

    async fn connect_to_agent(&self, session: Session) -> bool {
        let mut state = self.state.lock().await;
        let Some(parent) = &state.parent_session else {
            warn!(
                agent_id = %self.config.agent_id,
                peer = %session.agent_id(),
                "refusing child, not connected to a cluster"
            );
            return false;
        };

        if let Some(allow_list) = &state.allow_list {
            if !allow_list.contains(session.agent_id()) {
                warn!(
                    agent_id = %self.config.agent_id,
                    peer = %session.agent_id(),
                    "child is not on the allow list, refusing session"
                );
                return false;
            }
        }

        let (Some(market_basis), Some(cluster_id)) =
            (parent.market_basis().cloned(), parent.cluster_id().map(String::from))
        else {
            return false;
        };
        if session.set_market_basis(market_basis).is_err()
            || session.set_cluster_id(cluster_id).is_err()
        {
            warn!(
                session_id = %session.session_id(),
                "refusing session that already carries a basis"
            );
            return false;
        }

        state.child_sessions.insert(session.session_id(), session.clone());
        info!(
            agent_id = %self.config.agent_id,
            session_id = %session.session_id(),
            peer = %session.agent_id(),
            "child connected"
        );
        true
    }

    async fn agent_disconnected(&self, session: Session) {
        let mut state = self.state.lock().await;
        if state.child_sessions.remove(&session.session_id()).is_none() {
            return;
        }
        state.bid_cache.remove_session(&session.session_id());
        info!(
            agent_id = %self.config.agent_id,
            session_id = %session.session_id(),
            "child disconnected"
        );
    }

    async fn handle_bid_update(&self, session: &Session, bid_update: BidUpdate) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.child_sessions.contains_key(&session.session_id()) {
            return Err(MarketError::illegal_session_state(format!(
                "no registered child session {}",
                session.session_id()
            )));
        }
        let Some(market_basis) = state
            .parent_session
            .as_ref()
            .and_then(|parent| parent.market_basis().cloned())
        else {
            return Err(MarketError::illegal_session_state(
                "bid update while not connected to a cluster",
            ));
        };

        market_basis.assert_compatible(bid_update.bid.market_basis())?;
        bid_update.bid.validate()?;

        debug!(
            agent_id = %self.config.agent_id,
            session_id = %session.session_id(),
            bid_number = bid_update.bid_number,
            "recorded child bid update"
        );
        state
            .bid_cache
            .update_bid(session.session_id(), bid_update, self.clock.now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::basis::MarketBasis;
    use crate::market::bid::Bid;
    use crate::market::price::Price;
    use crate::services::clock::ManualClock;
    use crate::services::testing::{RecordingAgent, RecordingMatcher};
    use chrono::TimeZone;

    fn basis() -> MarketBasis {
        MarketBasis::new("electricity", "EUR", 11, 0.0, 10.0).unwrap()
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            chrono::Utc.with_ymd_and_hms(2025, 11, 9, 14, 30, 0).unwrap(),
        ))
    }

    fn concentrator(config: ConcentratorConfig) -> Arc<Concentrator> {
        Arc::new(Concentrator::new(config, clock()))
    }

    async fn attach_parent(
        concentrator: &Arc<Concentrator>,
    ) -> (Arc<RecordingMatcher>, Session) {
        let parent = Arc::new(RecordingMatcher::with_basis("auctioneer", basis()));
        let session = Session::new(concentrator.clone(), parent.clone());
        assert!(parent.connect_to_agent(session.clone()).await);
        session.mark_connected().unwrap();
        concentrator.connect_to_matcher(session.clone()).await;
        (parent, session)
    }

    async fn attach_child(
        concentrator: &Arc<Concentrator>,
        agent_id: &str,
    ) -> (Arc<RecordingAgent>, Session) {
        let agent = Arc::new(RecordingAgent::new(agent_id, "concentrator"));
        let session = Session::new(agent.clone(), concentrator.clone());
        assert!(concentrator.connect_to_agent(session.clone()).await);
        session.mark_connected().unwrap();
        agent.connect_to_matcher(session.clone()).await;
        (agent, session)
    }

    fn demand_bid(demand: &[f64], bid_number: u64) -> BidUpdate {
        let bid = Bid::from_demand_array(basis(), bid_number, demand.to_vec()).unwrap();
        BidUpdate::from_bid(bid)
    }

    #[tokio::test]
    async fn refuses_children_until_it_has_a_parent() {
        let node = concentrator(ConcentratorConfig::default());
        let child = Arc::new(RecordingAgent::new("child-1", "concentrator"));
        let session = Session::new(child.clone(), node.clone());
        assert!(!node.connect_to_agent(session).await);

        attach_parent(&node).await;
        let (_, session) = attach_child(&node, "child-1").await;
        // Basis and cluster id were propagated from the parent session.
        assert_eq!(session.market_basis(), Some(&basis()));
        assert_eq!(session.cluster_id(), Some("test-cluster"));
    }

    #[tokio::test]
    async fn allow_list_is_enforced_at_acceptance() {
        let config = ConcentratorConfig {
            allow_list: Some(["child-ok".to_string()].into_iter().collect()),
            ..ConcentratorConfig::default()
        };
        let node = concentrator(config);
        attach_parent(&node).await;

        let banned = Arc::new(RecordingAgent::new("child-bad", "concentrator"));
        let banned_session = Session::new(banned.clone(), node.clone());
        assert!(!node.connect_to_agent(banned_session).await);

        let (_, _) = attach_child(&node, "child-ok").await;
        assert_eq!(node.child_count().await, 1);

        // Relaxing the list admits the previously refused child.
        node.set_allow_list(None).await;
        let (_, _) = attach_child(&node, "child-bad").await;
        assert_eq!(node.child_count().await, 2);
    }

    #[tokio::test]
    async fn aggregates_children_under_own_increasing_bid_numbers() {
        let node = concentrator(ConcentratorConfig::default());
        let (parent, _) = attach_parent(&node).await;
        let (_, session_a) = attach_child(&node, "child-a").await;
        let (_, session_b) = attach_child(&node, "child-b").await;

        session_a.update_bid(demand_bid(&[-5.0; 11], 4)).await.unwrap();
        session_b.update_bid(demand_bid(&[-2.0; 11], 9)).await.unwrap();

        node.publish_bid().await;
        node.publish_bid().await;

        let upstream = parent.received_bids();
        assert_eq!(upstream.len(), 2);
        assert_eq!(upstream[0].bid_number, 1);
        assert_eq!(upstream[1].bid_number, 2);
        assert_eq!(upstream[0].bid.demand_array(), vec![-7.0; 11]);
        // The upstream bid carries the concentrator's number, not a child's.
        assert_eq!(upstream[0].bid.bid_number(), 1);
    }

    #[tokio::test]
    async fn price_fan_out_substitutes_each_childs_own_bid_number() {
        let node = concentrator(ConcentratorConfig::default());
        let (_, parent_session) = attach_parent(&node).await;
        let (agent_a, session_a) = attach_child(&node, "child-a").await;
        let (agent_b, session_b) = attach_child(&node, "child-b").await;

        session_a.update_bid(demand_bid(&[-5.0; 11], 4)).await.unwrap();
        session_b.update_bid(demand_bid(&[-2.0; 11], 9)).await.unwrap();
        node.publish_bid().await;

        // Parent answers aggregate #1.
        let price = Price::new(basis(), 3.0).unwrap();
        parent_session
            .update_price(PriceUpdate::new(price.clone(), 1))
            .await
            .unwrap();

        let a_prices = agent_a.received_prices();
        let b_prices = agent_b.received_prices();
        assert_eq!(a_prices.len(), 1);
        assert_eq!(a_prices[0].bid_number, 4);
        assert_eq!(b_prices[0].bid_number, 9);
        assert_eq!(a_prices[0].price, price);
    }

    #[tokio::test]
    async fn ignores_prices_for_bids_it_never_sent() {
        let node = concentrator(ConcentratorConfig::default());
        let (_, parent_session) = attach_parent(&node).await;
        let (agent, session) = attach_child(&node, "child-a").await;

        session.update_bid(demand_bid(&[-5.0; 11], 4)).await.unwrap();
        node.publish_bid().await;

        let price = Price::new(basis(), 3.0).unwrap();
        parent_session
            .update_price(PriceUpdate::new(price, 77))
            .await
            .unwrap();
        assert!(agent.received_prices().is_empty());
    }

    #[tokio::test]
    async fn parent_loss_cuts_children_loose() {
        let node = concentrator(ConcentratorConfig::default());
        let (_, parent_session) = attach_parent(&node).await;
        let (agent_a, _) = attach_child(&node, "child-a").await;
        let (agent_b, _) = attach_child(&node, "child-b").await;

        parent_session.disconnect().await;

        assert!(!node.has_parent().await);
        assert_eq!(node.child_count().await, 0);
        assert_eq!(agent_a.disconnect_count(), 1);
        assert_eq!(agent_b.disconnect_count(), 1);
    }

    #[tokio::test]
    async fn skips_upstream_update_without_live_child_bids() {
        let node = concentrator(ConcentratorConfig::default());
        let (parent, _) = attach_parent(&node).await;
        attach_child(&node, "child-a").await;

        node.publish_bid().await;
        assert!(parent.received_bids().is_empty());
    }
}
