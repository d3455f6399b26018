pub mod config;
pub mod error;
pub mod market;
pub mod services;

pub use config::Config;
pub use error::{MarketError, Result};
pub use market::{Bid, BidUpdate, DemandCurve, MarketBasis, Price, PricePoint, PriceUpdate};
pub use services::{
    AgentEndpoint, Auctioneer, AuctioneerConfig, Clock, Concentrator, ConcentratorConfig,
    ManualClock, MatcherEndpoint, Session, SessionManager, SessionState, SystemClock,
    TaskScheduler, TokioScheduler,
};
