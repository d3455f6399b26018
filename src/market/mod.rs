pub mod basis;
pub mod bid;
pub mod price;

pub use basis::MarketBasis;
pub use bid::{Bid, DemandCurve, PricePoint};
pub use price::{BidUpdate, Price, PriceUpdate};
