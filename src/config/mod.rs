use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::time::Duration;

use crate::market::MarketBasis;
use crate::services::{AuctioneerConfig, ConcentratorConfig};

/// Runtime configuration, loaded from the environment with sensible
/// defaults. Only the knobs of the coordination core live here; anything a
/// transport or persistence collaborator needs is its own concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub environment: String,
    pub log_level: String,
    pub market: MarketConfig,
    pub auctioneer: AuctioneerSettings,
    pub concentrator: ConcentratorSettings,
}

/// The cluster's price domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    pub commodity: String,
    pub currency: String,
    pub price_steps: u32,
    pub minimum_price: f64,
    pub maximum_price: f64,
    pub significance: u32,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            commodity: "electricity".to_string(),
            currency: "EUR".to_string(),
            price_steps: 100,
            minimum_price: 0.0,
            maximum_price: 1.0,
            significance: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuctioneerSettings {
    pub agent_id: String,
    pub cluster_id: String,
    pub price_update_interval_secs: u64,
    pub bid_timeout_secs: i64,
}

impl Default for AuctioneerSettings {
    fn default() -> Self {
        Self {
            agent_id: "auctioneer".to_string(),
            cluster_id: "default-cluster".to_string(),
            price_update_interval_secs: 30,
            bid_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcentratorSettings {
    pub agent_id: String,
    pub desired_parent_id: String,
    pub bid_update_interval_secs: u64,
    pub bid_timeout_secs: i64,
    /// Comma-separated allow list; empty means every child is admitted.
    pub allow_list: Vec<String>,
}

impl Default for ConcentratorSettings {
    fn default() -> Self {
        Self {
            agent_id: "concentrator".to_string(),
            desired_parent_id: "auctioneer".to_string(),
            bid_update_interval_secs: 60,
            bid_timeout_secs: 600,
            allow_list: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if it exists

        let market_defaults = MarketConfig::default();
        let auctioneer_defaults = AuctioneerSettings::default();
        let concentrator_defaults = ConcentratorSettings::default();

        Ok(Config {
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            market: MarketConfig {
                commodity: env::var("MARKET_COMMODITY")
                    .unwrap_or(market_defaults.commodity),
                currency: env::var("MARKET_CURRENCY").unwrap_or(market_defaults.currency),
                price_steps: parse_env("MARKET_PRICE_STEPS", market_defaults.price_steps),
                minimum_price: parse_env("MARKET_MINIMUM_PRICE", market_defaults.minimum_price),
                maximum_price: parse_env("MARKET_MAXIMUM_PRICE", market_defaults.maximum_price),
                significance: parse_env("MARKET_SIGNIFICANCE", market_defaults.significance),
            },
            auctioneer: AuctioneerSettings {
                agent_id: env::var("AUCTIONEER_AGENT_ID")
                    .unwrap_or(auctioneer_defaults.agent_id),
                cluster_id: env::var("CLUSTER_ID").unwrap_or(auctioneer_defaults.cluster_id),
                price_update_interval_secs: parse_env(
                    "PRICE_UPDATE_INTERVAL_SECS",
                    auctioneer_defaults.price_update_interval_secs,
                ),
                bid_timeout_secs: parse_env(
                    "AUCTIONEER_BID_TIMEOUT_SECS",
                    auctioneer_defaults.bid_timeout_secs,
                ),
            },
            concentrator: ConcentratorSettings {
                agent_id: env::var("CONCENTRATOR_AGENT_ID")
                    .unwrap_or(concentrator_defaults.agent_id),
                desired_parent_id: env::var("CONCENTRATOR_PARENT_ID")
                    .unwrap_or(concentrator_defaults.desired_parent_id),
                bid_update_interval_secs: parse_env(
                    "BID_UPDATE_INTERVAL_SECS",
                    concentrator_defaults.bid_update_interval_secs,
                ),
                bid_timeout_secs: parse_env(
                    "CONCENTRATOR_BID_TIMEOUT_SECS",
                    concentrator_defaults.bid_timeout_secs,
                ),
                allow_list: env::var("CONCENTRATOR_ALLOW_LIST")
                    .map(|raw| {
                        raw.split(',')
                            .map(str::trim)
                            .filter(|id| !id.is_empty())
                            .map(String::from)
                            .collect()
                    })
                    .unwrap_or(concentrator_defaults.allow_list),
            },
        })
    }

    /// Builds the cluster's market basis from the market section.
    pub fn market_basis(&self) -> crate::error::Result<MarketBasis> {
        Ok(MarketBasis::new(
            &self.market.commodity,
            &self.market.currency,
            self.market.price_steps,
            self.market.minimum_price,
            self.market.maximum_price,
        )?
        .with_significance(self.market.significance))
    }

    pub fn auctioneer_config(&self) -> AuctioneerConfig {
        AuctioneerConfig {
            agent_id: self.auctioneer.agent_id.clone(),
            cluster_id: self.auctioneer.cluster_id.clone(),
            price_update_interval: Duration::from_secs(
                self.auctioneer.price_update_interval_secs,
            ),
            bid_timeout: timeout(self.auctioneer.bid_timeout_secs),
        }
    }

    pub fn concentrator_config(&self) -> ConcentratorConfig {
        let allow_list: HashSet<String> = self.concentrator.allow_list.iter().cloned().collect();
        ConcentratorConfig {
            agent_id: self.concentrator.agent_id.clone(),
            desired_parent_id: self.concentrator.desired_parent_id.clone(),
            bid_update_interval: Duration::from_secs(
                self.concentrator.bid_update_interval_secs,
            ),
            bid_timeout: timeout(self.concentrator.bid_timeout_secs),
            allow_list: if allow_list.is_empty() {
                None
            } else {
                Some(allow_list)
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            log_level: "info".to_string(),
            market: MarketConfig::default(),
            auctioneer: AuctioneerSettings::default(),
            concentrator: ConcentratorSettings::default(),
        }
    }
}

/// Zero or negative timeout disables expiry.
fn timeout(secs: i64) -> Option<chrono::Duration> {
    if secs > 0 {
        Some(chrono::Duration::seconds(secs))
    } else {
        None
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}
