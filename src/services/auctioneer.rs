use async_trait::async_trait;
use chrono::Duration as TimeoutDuration;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{MarketError, Result};
use crate::market::basis::MarketBasis;
use crate::market::price::{BidUpdate, Price, PriceUpdate};
use crate::services::bid_cache::BidCache;
use crate::services::clock::Clock;
use crate::services::endpoint::MatcherEndpoint;
use crate::services::scheduler::{ScheduledTask, TaskHandle, TaskScheduler};
use crate::services::session::Session;

#[derive(Debug, Clone)]
pub struct AuctioneerConfig {
    pub agent_id: String,
    pub cluster_id: String,
    /// Interval between price publications.
    pub price_update_interval: Duration,
    /// Age beyond which a recorded bid no longer participates in aggregation.
    pub bid_timeout: Option<TimeoutDuration>,
}

impl Default for AuctioneerConfig {
    fn default() -> Self {
        Self {
            agent_id: "auctioneer".to_string(),
            cluster_id: "default-cluster".to_string(),
            price_update_interval: Duration::from_secs(30),
            bid_timeout: Some(TimeoutDuration::seconds(600)),
        }
    }
}

struct AuctioneerState {
    sessions: HashMap<Uuid, Session>,
    bid_cache: BidCache,
}

/// Root coordination node of a cluster.
///
/// Owns the market basis and cluster id, records the last bid of every
/// connected session, and on its publication interval aggregates the
/// non-expired bids, resolves the equilibrium price and sends each session a
/// price update carrying that session's own last bid number. Receiving a bid
/// only records it; publication is purely interval-driven.
pub struct Auctioneer {
    config: AuctioneerConfig,
    market_basis: MarketBasis,
    clock: Arc<dyn Clock>,
    state: Mutex<AuctioneerState>,
    last_published: StdMutex<Option<Price>>,
    running: AtomicBool,
    task: StdMutex<Option<TaskHandle>>,
}

impl Auctioneer {
    pub fn new(config: AuctioneerConfig, market_basis: MarketBasis, clock: Arc<dyn Clock>) -> Self {
        let bid_cache = BidCache::new(config.bid_timeout);
        Self {
            config,
            market_basis,
            clock,
            state: Mutex::new(AuctioneerState {
                sessions: HashMap::new(),
                bid_cache,
            }),
            last_published: StdMutex::new(None),
            running: AtomicBool::new(false),
            task: StdMutex::new(None),
        }
    }

    pub fn market_basis(&self) -> &MarketBasis {
        &self.market_basis
    }

    pub fn cluster_id(&self) -> &str {
        &self.config.cluster_id
    }

    /// The most recently resolved equilibrium price, if any.
    pub fn last_published_price(&self) -> Option<Price> {
        self.last_published
            .lock()
            .expect("price mutex poisoned")
            .clone()
    }

    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    /// Registers the periodic price publication with the scheduler.
    pub fn start(self: &Arc<Self>, scheduler: &dyn TaskScheduler) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!(agent_id = %self.config.agent_id, "auctioneer is already running");
            return;
        }

        let node = Arc::clone(self);
        let task: ScheduledTask = Arc::new(move || {
            let node = node.clone();
            Box::pin(async move {
                node.publish_price().await;
            })
        });
        let handle = scheduler.schedule_at_fixed_rate(task, self.config.price_update_interval);
        *self.task.lock().expect("task mutex poisoned") = Some(handle);

        info!(
            agent_id = %self.config.agent_id,
            cluster_id = %self.config.cluster_id,
            interval_secs = self.config.price_update_interval.as_secs(),
            "auctioneer started"
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
        info!(agent_id = %self.config.agent_id, "auctioneer stopped");
    }

    /// One publication round: aggregate, resolve, fan out.
    pub async fn publish_price(&self) {
        // Resolve under the node lock, deliver after releasing it so a slow
        // child can never block bid recording or deadlock against a child
        // node publishing upward at the same moment.
        let (price, deliveries) = {
            let state = self.state.lock().await;
            let aggregated = match state.bid_cache.aggregate(&self.market_basis, self.clock.now())
            {
                Ok(Some(aggregated)) => aggregated,
                Ok(None) => {
                    debug!(agent_id = %self.config.agent_id, "no live bids, skipping publication");
                    return;
                }
                Err(err) => {
                    error!(agent_id = %self.config.agent_id, error = %err, "aggregation failed");
                    return;
                }
            };

            let price = aggregated.bid.equilibrium_price();
            let deliveries: Vec<(Session, u64)> = aggregated
                .bid_numbers
                .iter()
                .filter_map(|(session_id, bid_number)| {
                    state
                        .sessions
                        .get(session_id)
                        .map(|session| (session.clone(), *bid_number))
                })
                .collect();
            (price, deliveries)
        };

        *self.last_published.lock().expect("price mutex poisoned") = Some(price.clone());
        info!(
            agent_id = %self.config.agent_id,
            price = %price,
            sessions = deliveries.len(),
            "publishing equilibrium price"
        );

        for (session, bid_number) in deliveries {
            let update = PriceUpdate::new(price.clone(), bid_number);
            if let Err(err) = session.update_price(update).await {
                warn!(
                    session_id = %session.session_id(),
                    error = %err,
                    "failed to deliver price update"
                );
            }
        }
    }
}

#[async_trait]
impl MatcherEndpoint for Auctioneer {
    fn agent_id(&self) -> &str {
        &self.config.agent_id
    }

    async fn connect_to_agent(&self, session: Session) -> bool {
        if session.set_market_basis(self.market_basis.clone()).is_err()
            || session.set_cluster_id(&self.config.cluster_id).is_err()
        {
            warn!(
                session_id = %session.session_id(),
                "refusing session that already carries a basis"
            );
            return false;
        }

        let mut state = self.state.lock().await;
        state.sessions.insert(session.session_id(), session.clone());
        info!(
            agent_id = %self.config.agent_id,
            session_id = %session.session_id(),
            peer = %session.agent_id(),
            "agent connected"
        );
        true
    }

    async fn agent_disconnected(&self, session: Session) {
        let mut state = self.state.lock().await;
        if state.sessions.remove(&session.session_id()).is_none() {
            return;
        }
        state.bid_cache.remove_session(&session.session_id());
        info!(
            agent_id = %self.config.agent_id,
            session_id = %session.session_id(),
            "agent disconnected"
        );
    }

    async fn handle_bid_update(&self, session: &Session, bid_update: BidUpdate) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.sessions.contains_key(&session.session_id()) {
            return Err(MarketError::illegal_session_state(format!(
                "no registered session {}",
                session.session_id()
            )));
        }

        // A rejected bid must never touch the cache; the previous accepted
        // bid for this session stays authoritative.
        self.market_basis
            .assert_compatible(bid_update.bid.market_basis())?;
        bid_update.bid.validate()?;

        debug!(
            session_id = %session.session_id(),
            bid_number = bid_update.bid_number,
            "recorded bid update"
        );
        state
            .bid_cache
            .update_bid(session.session_id(), bid_update, self.clock.now());
        Ok(())
    }
}
