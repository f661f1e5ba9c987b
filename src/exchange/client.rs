// src/exchange/client.rs
use crate::domain::errors::ExchangeResult;
use crate::domain::models::OrderParams;
use async_trait::async_trait;
use std::sync::Arc;

/// Order placement on one authenticated account
#[async_trait]
pub trait OrderExecutor: Send + Sync {
    /// Place an order and return the broker's order id. Rejections are errors.
    async fn place_order(&self, params: &OrderParams) -> ExchangeResult<String>;
}

/// Builds an executor from an account's credentials
pub trait BrokerConnector: Send + Sync {
    fn connect(&self, api_key: &str, access_token: &str) -> ExchangeResult<Arc<dyn OrderExecutor>>;
}

/// Exchanges an OAuth request token for a daily access token
#[async_trait]
pub trait SessionExchanger: Send + Sync {
    async fn generate_session(
        &self,
        api_key: &str,
        request_token: &str,
        api_secret: &str,
    ) -> ExchangeResult<String>;
}
