use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use grid_market::services::AgentEndpoint;
use grid_market::{
    Auctioneer, BidUpdate, Concentrator, Config, MarketBasis, PriceUpdate, Session,
    SessionManager, SystemClock, TokioScheduler,
};
use grid_market::market::Bid;

/// Simulated flexible device for the demo cluster: consumes below its
/// comfort price (or produces, for negative power) and re-bids with a little
/// jitter whenever a price arrives.
struct FlexibleDeviceAgent {
    agent_id: String,
    desired_parent_id: String,
    /// Positive for consumption, negative for generation.
    power_kw: f64,
    /// Fraction of the price range above which the device backs off.
    comfort_fraction: f64,
    session: Mutex<Option<Session>>,
    bid_number: AtomicU64,
}

impl FlexibleDeviceAgent {
    fn new(agent_id: &str, desired_parent_id: &str, power_kw: f64, comfort_fraction: f64) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            desired_parent_id: desired_parent_id.to_string(),
            power_kw,
            comfort_fraction,
            session: Mutex::new(None),
            bid_number: AtomicU64::new(0),
        }
    }

    fn build_bid(&self, market_basis: &MarketBasis, bid_number: u64) -> Result<Bid> {
        let jitter: f64 = rand::thread_rng().gen_range(0.9..1.1);
        let power = self.power_kw * jitter;
        let steps = market_basis.price_steps();
        let cutoff = (steps as f64 * self.comfort_fraction) as u32;

        // Consumers step down to zero above their comfort price; producers
        // ramp supply up (more negative demand) with rising price.
        let demand: Vec<f64> = (0..steps)
            .map(|step| {
                if power >= 0.0 {
                    if step < cutoff { power } else { 0.0 }
                } else if step < cutoff {
                    0.0
                } else {
                    power
                }
            })
            .collect();
        Ok(Bid::from_demand_array(market_basis.clone(), bid_number, demand)?)
    }

    async fn send_bid(&self, session: &Session) {
        let Some(market_basis) = session.market_basis().cloned() else {
            return;
        };
        let bid_number = self.bid_number.fetch_add(1, Ordering::SeqCst) + 1;
        let bid = match self.build_bid(&market_basis, bid_number) {
            Ok(bid) => bid,
            Err(err) => {
                warn!(agent_id = %self.agent_id, error = %err, "could not build bid");
                return;
            }
        };
        if let Err(err) = session.update_bid(BidUpdate::from_bid(bid)).await {
            warn!(agent_id = %self.agent_id, error = %err, "bid update failed");
        }
    }
}

#[async_trait]
impl AgentEndpoint for FlexibleDeviceAgent {
    fn agent_id(&self) -> &str {
        &self.agent_id
    }

    fn desired_parent_id(&self) -> &str {
        &self.desired_parent_id
    }

    async fn connect_to_matcher(&self, session: Session) {
        info!(
            agent_id = %self.agent_id,
            cluster_id = ?session.cluster_id(),
            "device connected, sending first bid"
        );
        *self.session.lock().expect("session mutex poisoned") = Some(session.clone());
        self.send_bid(&session).await;
    }

    async fn matcher_disconnected(&self, _session: Session) {
        info!(agent_id = %self.agent_id, "device disconnected");
        *self.session.lock().expect("session mutex poisoned") = None;
    }

    async fn handle_price_update(&self, price_update: PriceUpdate) -> grid_market::Result<()> {
        info!(
            agent_id = %self.agent_id,
            price = %price_update.price,
            bid_number = price_update.bid_number,
            "received price"
        );
        let session = self.session.lock().expect("session mutex poisoned").clone();
        if let Some(session) = session {
            self.send_bid(&session).await;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "grid_market=info".into()),
        )
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!("Loaded configuration for environment: {}", config.environment);

    let market_basis = config.market_basis()?;
    info!("Cluster market basis: {}", market_basis);

    let clock = Arc::new(SystemClock);
    let scheduler = TokioScheduler;
    let session_manager = SessionManager::new();

    let auctioneer = Arc::new(Auctioneer::new(
        config.auctioneer_config(),
        market_basis,
        clock.clone(),
    ));
    let concentrator = Arc::new(Concentrator::new(config.concentrator_config(), clock));

    let devices: Vec<Arc<FlexibleDeviceAgent>> = vec![
        Arc::new(FlexibleDeviceAgent::new(
            "freezer-1",
            &config.concentrator.agent_id,
            0.2,
            0.7,
        )),
        Arc::new(FlexibleDeviceAgent::new(
            "heatpump-1",
            &config.concentrator.agent_id,
            2.5,
            0.5,
        )),
        Arc::new(FlexibleDeviceAgent::new(
            "pv-1",
            &config.concentrator.agent_id,
            -3.0,
            0.3,
        )),
    ];

    // Registration order is deliberately scrambled; the topology matcher
    // connects everything once all pairings are completable.
    for device in &devices {
        let _ = session_manager.add_agent_endpoint(device.clone()).await;
    }
    let _ = session_manager
        .add_matcher_endpoint(concentrator.clone())
        .await;
    let _ = session_manager
        .add_agent_endpoint(concentrator.clone())
        .await;
    let _ = session_manager
        .add_matcher_endpoint(auctioneer.clone())
        .await;
    info!(
        sessions = session_manager.active_session_count().await,
        "cluster topology established"
    );

    auctioneer.start(&scheduler);
    concentrator.start(&scheduler);

    // Run until ctrl-c.
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    concentrator.stop();
    auctioneer.stop();
    session_manager
        .remove_matcher_endpoint(&config.auctioneer.agent_id)
        .await;
    for device in &devices {
        session_manager.remove_agent_endpoint(device.agent_id()).await;
    }
    session_manager
        .remove_agent_endpoint(&config.concentrator.agent_id)
        .await;

    if let Some(price) = auctioneer.last_published_price() {
        info!(price = %price, "final published price");
    }
    info!("Cluster stopped");
    Ok(())
}
