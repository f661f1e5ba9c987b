// src/domain/mod.rs
pub mod errors;
pub mod instruments;
pub mod models;

// Re-export common types for convenience
pub use errors::{
    AccountError, AccountResult, AppError, AppResult, ExchangeError, ExchangeResult, IntakeError,
    IntakeResult, PersistenceError, PersistenceResult,
};
pub use instruments::InstrumentBook;
pub use models::{Instrument, OrderParams, OrderSide, Signal, SignalIntent, Tick, Token};
