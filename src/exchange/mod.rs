// src/exchange/mod.rs
pub mod client;
pub mod kite;

pub use client::{BrokerConnector, OrderExecutor, SessionExchanger};
pub use kite::{KiteConnector, KiteHttp};
