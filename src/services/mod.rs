pub mod auctioneer;
pub mod bid_cache;
pub mod clock;
pub mod concentrator;
pub mod endpoint;
pub mod scheduler;
pub mod session;
pub mod session_manager;

#[cfg(test)]
pub mod testing;

pub use auctioneer::{Auctioneer, AuctioneerConfig};
pub use bid_cache::{AggregatedBid, BidCache, BidNumberSnapshot, CachedBid};
pub use clock::{Clock, ManualClock, SystemClock};
pub use concentrator::{Concentrator, ConcentratorConfig};
pub use endpoint::{AgentEndpoint, MatcherEndpoint};
pub use scheduler::{ScheduledTask, TaskHandle, TaskScheduler, TokioScheduler};
pub use session::{Session, SessionState};
pub use session_manager::SessionManager;
