// src/lib.rs
// Main library module declarations

pub mod accounts;
pub mod broadcast;
pub mod config;
pub mod domain;
pub mod exchange;
pub mod market_data;
pub mod persistence;
pub mod scheduler;
pub mod server;
pub mod signals;
pub mod trading;
