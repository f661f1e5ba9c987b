#![allow(dead_code)]

use async_trait::async_trait;
use kite_relay::accounts::{Account, AccountRegistry, AccountStore};
use kite_relay::domain::errors::{ExchangeError, ExchangeResult};
use kite_relay::domain::models::{Instrument, OrderParams};
use kite_relay::exchange::{BrokerConnector, OrderExecutor, SessionExchanger};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Latency of executors whose API key starts with `slow`.
pub const SLOW_ORDER: Duration = Duration::from_millis(200);

/// Fills every order unless the account's API key starts with `fail`
/// (rejected) or `panic`; keys starting with `slow` fill after [`SLOW_ORDER`].
pub struct FakeExecutor {
    api_key: String,
    placed: Arc<Mutex<Vec<(String, OrderParams)>>>,
}

#[async_trait]
impl OrderExecutor for FakeExecutor {
    async fn place_order(&self, params: &OrderParams) -> ExchangeResult<String> {
        if self.api_key.starts_with("fail") {
            return Err(ExchangeError::Order("Insufficient funds".to_string()));
        }
        if self.api_key.starts_with("panic") {
            panic!("executor blew up");
        }
        if self.api_key.starts_with("slow") {
            tokio::time::sleep(SLOW_ORDER).await;
        }
        self.placed
            .lock()
            .unwrap()
            .push((self.api_key.clone(), params.clone()));
        Ok(format!("order-{}", self.api_key))
    }
}

#[derive(Default)]
pub struct FakeConnector {
    pub placed: Arc<Mutex<Vec<(String, OrderParams)>>>,
}

impl BrokerConnector for FakeConnector {
    fn connect(&self, api_key: &str, _access_token: &str) -> ExchangeResult<Arc<dyn OrderExecutor>> {
        Ok(Arc::new(FakeExecutor {
            api_key: api_key.to_string(),
            placed: self.placed.clone(),
        }))
    }
}

/// Issues `token-<request_token>` for any key.
pub struct FakeSessions;

#[async_trait]
impl SessionExchanger for FakeSessions {
    async fn generate_session(
        &self,
        _api_key: &str,
        request_token: &str,
        api_secret: &str,
    ) -> ExchangeResult<String> {
        if request_token == "expired" {
            return Err(ExchangeError::Authentication("Token is invalid or has expired.".to_string()));
        }
        assert!(!api_secret.is_empty());
        Ok(format!("token-{}", request_token))
    }
}

pub fn account(id: &str, api_key: &str, access_token: &str, enabled: bool) -> Account {
    Account {
        id: id.to_string(),
        name: format!("Account {}", id),
        api_key: api_key.to_string(),
        api_secret: format!("secret-{}", id),
        access_token: access_token.to_string(),
        enabled,
        created_at: None,
        last_order: None,
        last_token_update: None,
    }
}

/// Registry over a pre-seeded account file.
pub async fn registry(path: &Path, accounts: &[Account]) -> (Arc<AccountRegistry>, Arc<FakeConnector>) {
    let store = AccountStore::new(path);
    store.save(accounts).unwrap();
    let connector = Arc::new(FakeConnector::default());
    let registry = Arc::new(AccountRegistry::new(
        store,
        connector.clone(),
        Arc::new(FakeSessions),
    ));
    registry.init().await;
    (registry, connector)
}

pub fn instrument(token: u32, exchange: &str, symbol: &str, lot: u32) -> Instrument {
    Instrument {
        token,
        exchange: exchange.to_string(),
        symbol: symbol.to_string(),
        tradingview: format!("{}1!", symbol),
        lot,
    }
}
