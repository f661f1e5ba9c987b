// src/domain/errors.rs
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Account error: {0}")]
    Account(#[from] AccountError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Intake error: {0}")]
    Intake(#[from] IntakeError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(String),
}

impl From<String> for AppError {
    fn from(s: String) -> Self {
        AppError::Config(s)
    }
}

/// Failures reported by the broker (order placement, session, ticker).
#[derive(Error, Debug, Clone)]
pub enum ExchangeError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Order error: {0}")]
    Order(String),

    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Request error: {0}")]
    Request(String),

    #[error("Request timed out after {0}s")]
    Timeout(u64),
}

impl From<hyper::Error> for ExchangeError {
    fn from(err: hyper::Error) -> Self {
        ExchangeError::Request(err.to_string())
    }
}

/// Account-management failures. The message is shown to the operator as is.
#[derive(Error, Debug)]
pub enum AccountError {
    #[error("Account not found")]
    NotFound(String),

    #[error("Account not found for this API key")]
    ApiKeyNotFound(String),

    #[error("Account \"{0}\" doesn't have an API secret configured")]
    MissingApiSecret(String),

    #[error("Token exchange failed: {0}")]
    TokenExchange(#[from] ExchangeError),

    #[error("Failed to persist accounts: {0}")]
    Persist(#[from] PersistenceError),
}

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed data in {path}: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Background task failed: {0}")]
    Task(String),
}

/// Inbound signal rejections.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IntakeError {
    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("Missing symbol in signal payload")]
    MissingSymbol,
}

pub type AppResult<T> = Result<T, AppError>;
pub type ExchangeResult<T> = Result<T, ExchangeError>;
pub type AccountResult<T> = Result<T, AccountError>;
pub type PersistenceResult<T> = Result<T, PersistenceError>;
pub type IntakeResult<T> = Result<T, IntakeError>;
