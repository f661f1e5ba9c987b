// src/market_data/mod.rs
pub mod supervisor;
pub mod ticker;

pub use supervisor::FeedSupervisor;
pub use ticker::{FeedEvent, KiteTicker, MarketFeed, MarketTick};
