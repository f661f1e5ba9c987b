// src/accounts/registry.rs
use crate::accounts::store::{Account, AccountStore, AccountUpdate, AccountView, NewAccount};
use crate::domain::errors::{AccountError, AccountResult};
use crate::exchange::client::{BrokerConnector, OrderExecutor, SessionExchanger};
use crate::exchange::kite;
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use uuid::Uuid;

/// Ready-to-use execution handle for one credentialed account.
#[derive(Clone)]
pub struct AccountHandle {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub executor: Arc<dyn OrderExecutor>,
}

impl fmt::Debug for AccountHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// Credentials of the account that feeds market data.
#[derive(Clone, PartialEq)]
pub struct PrimaryAccount {
    pub id: String,
    pub name: String,
    pub api_key: String,
    pub access_token: String,
}

impl fmt::Debug for PrimaryAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrimaryAccount")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("api_key", &self.api_key)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct RegistryState {
    accounts: Vec<Account>,
    handles: Vec<AccountHandle>,
}

/// Brokerage accounts, their execution handles and the primary account.
///
/// Reads go through an in-memory copy. Mutations are serialized by a writer
/// lock and always re-read the file first, so they never overwrite a file
/// they could not parse.
pub struct AccountRegistry {
    store: AccountStore,
    connector: Arc<dyn BrokerConnector>,
    sessions: Arc<dyn SessionExchanger>,
    state: RwLock<RegistryState>,
    writer: Mutex<()>,
    primary_tx: watch::Sender<Option<PrimaryAccount>>,
}

impl AccountRegistry {
    pub fn new(
        store: AccountStore,
        connector: Arc<dyn BrokerConnector>,
        sessions: Arc<dyn SessionExchanger>,
    ) -> Self {
        let (primary_tx, _) = watch::channel(None);
        Self {
            store,
            connector,
            sessions,
            state: RwLock::new(RegistryState::default()),
            writer: Mutex::new(()),
            primary_tx,
        }
    }

    /// Load the account file and build handles. Returns the number of handles.
    pub async fn init(&self) -> usize {
        let accounts = self.store.load();
        let count = self.apply(accounts).await;
        log::info!("[Registry] Initialized {} account handles", count);
        count
    }

    /// Re-read the account file, e.g. after it was edited by hand.
    pub async fn reload(&self) -> usize {
        let _guard = self.writer.lock().await;
        let accounts = self.store.load();
        let count = self.apply(accounts).await;
        log::info!("[Registry] Reloaded, {} account handles", count);
        count
    }

    pub async fn enabled_accounts(&self) -> Vec<AccountHandle> {
        let state = self.state.read().await;
        state.handles.iter().filter(|h| h.enabled).cloned().collect()
    }

    pub async fn primary_account(&self) -> Option<PrimaryAccount> {
        let state = self.state.read().await;
        primary_of(&state.accounts)
    }

    /// Receives the primary account whenever it, or its token, changes.
    pub fn subscribe_primary(&self) -> watch::Receiver<Option<PrimaryAccount>> {
        self.primary_tx.subscribe()
    }

    pub async fn accounts(&self) -> Vec<AccountView> {
        let state = self.state.read().await;
        state.accounts.iter().map(Account::view).collect()
    }

    pub async fn account(&self, id: &str) -> Option<AccountView> {
        let state = self.state.read().await;
        state.accounts.iter().find(|a| a.id == id).map(Account::view)
    }

    pub async fn find_by_api_key(&self, api_key: &str) -> Option<AccountView> {
        let state = self.state.read().await;
        state
            .accounts
            .iter()
            .find(|a| a.api_key == api_key)
            .map(Account::view)
    }

    pub async fn login_url(&self, id: &str) -> AccountResult<String> {
        let account = self
            .account(id)
            .await
            .ok_or_else(|| AccountError::NotFound(id.to_string()))?;
        Ok(kite::login_url(&account.api_key))
    }

    pub async fn add_account(&self, new: NewAccount) -> AccountResult<AccountView> {
        let now = Utc::now();
        let access_token = new.access_token.unwrap_or_default();
        let account = Account {
            id: format!("acc_{}", Uuid::new_v4().simple()),
            name: new.name.unwrap_or_default(),
            api_key: new.api_key.unwrap_or_default(),
            api_secret: new.api_secret.unwrap_or_default(),
            last_token_update: (!access_token.is_empty()).then_some(now),
            access_token,
            enabled: true,
            created_at: Some(now),
            last_order: None,
        };
        let view = account.view();

        self.mutate(move |accounts| {
            accounts.push(account);
            Ok(())
        })
        .await?;
        log::info!("[Registry] Added account {} ({})", view.name, view.id);
        Ok(view)
    }

    pub async fn update_account(&self, id: &str, update: AccountUpdate) -> AccountResult<AccountView> {
        let view = self
            .mutate(|accounts| {
                let account = accounts
                    .iter_mut()
                    .find(|a| a.id == id)
                    .ok_or_else(|| AccountError::NotFound(id.to_string()))?;
                let token_changed = update
                    .access_token
                    .as_deref()
                    .is_some_and(|t| !t.is_empty() && t != account.access_token);
                update.apply(account);
                if token_changed {
                    account.last_token_update = Some(Utc::now());
                }
                Ok(account.view())
            })
            .await?;
        log::info!("[Registry] Updated account {} ({})", view.name, view.id);
        Ok(view)
    }

    pub async fn delete_account(&self, id: &str) -> AccountResult<()> {
        self.mutate(|accounts| {
            let before = accounts.len();
            accounts.retain(|a| a.id != id);
            if accounts.len() == before {
                return Err(AccountError::NotFound(id.to_string()));
            }
            Ok(())
        })
        .await?;
        log::info!("[Registry] Deleted account {}", id);
        Ok(())
    }

    /// Store a fresh daily token. Publishes a primary change when the
    /// account is the primary one.
    pub async fn update_access_token_by_api_key(
        &self,
        api_key: &str,
        access_token: &str,
    ) -> AccountResult<AccountView> {
        let view = self
            .mutate(|accounts| {
                let account = accounts
                    .iter_mut()
                    .find(|a| a.api_key == api_key)
                    .ok_or_else(|| AccountError::ApiKeyNotFound(api_key.to_string()))?;
                account.access_token = access_token.to_string();
                account.last_token_update = Some(Utc::now());
                Ok(account.view())
            })
            .await?;
        log::info!("[Registry] Access token updated for {} ({})", view.name, view.id);
        Ok(view)
    }

    /// Stamp the last successful order. Failures are only logged.
    pub async fn record_last_order(&self, id: &str) {
        let result = self
            .mutate(|accounts| {
                let account = accounts
                    .iter_mut()
                    .find(|a| a.id == id)
                    .ok_or_else(|| AccountError::NotFound(id.to_string()))?;
                account.last_order = Some(Utc::now());
                Ok(())
            })
            .await;
        if let Err(e) = result {
            log::warn!("[Registry] Failed to record last order for {}: {}", id, e);
        }
    }

    /// OAuth callback: exchange the request token and store the access token.
    pub async fn complete_login(&self, api_key: &str, request_token: &str) -> AccountResult<AccountView> {
        let (name, api_secret) = {
            let state = self.state.read().await;
            let account = state
                .accounts
                .iter()
                .find(|a| a.api_key == api_key)
                .ok_or_else(|| AccountError::ApiKeyNotFound(api_key.to_string()))?;
            (account.name.clone(), account.api_secret.clone())
        };
        if api_secret.is_empty() {
            return Err(AccountError::MissingApiSecret(name));
        }

        log::info!("[Registry] Exchanging request token for {}", name);
        let access_token = self
            .sessions
            .generate_session(api_key, request_token, &api_secret)
            .await?;
        self.update_access_token_by_api_key(api_key, &access_token).await
    }

    async fn mutate<T, F>(&self, f: F) -> AccountResult<T>
    where
        F: FnOnce(&mut Vec<Account>) -> AccountResult<T>,
    {
        let _guard = self.writer.lock().await;
        let mut accounts = self.store.try_load()?;
        let out = f(&mut accounts)?;
        if let Err(e) = self.store.save(&accounts) {
            log::error!("[Registry] Failed to save accounts: {}", e);
            return Err(e.into());
        }
        self.apply(accounts).await;
        Ok(out)
    }

    /// Swap in a new account set and rebuild handles.
    async fn apply(&self, accounts: Vec<Account>) -> usize {
        let mut handles = Vec::new();
        for account in &accounts {
            if !account.has_credentials() {
                log::warn!(
                    "[Registry] Skipping {} ({}): missing API key or access token",
                    account.name,
                    account.id
                );
                continue;
            }
            match self.connector.connect(&account.api_key, &account.access_token) {
                Ok(executor) => handles.push(AccountHandle {
                    id: account.id.clone(),
                    name: account.name.clone(),
                    enabled: account.enabled,
                    executor,
                }),
                Err(e) => log::warn!("[Registry] Could not connect {}: {}", account.name, e),
            }
        }

        let primary = primary_of(&accounts);
        let count = handles.len();
        {
            let mut state = self.state.write().await;
            state.accounts = accounts;
            state.handles = handles;
        }

        let changed = self.primary_tx.send_if_modified(|current| {
            if *current == primary {
                return false;
            }
            *current = primary.clone();
            true
        });
        if changed {
            match &primary {
                Some(p) => log::info!("[Registry] Primary account is now {} ({})", p.name, p.id),
                None => log::warn!("[Registry] No enabled account with credentials, market data unavailable"),
            }
        }
        count
    }
}

/// First enabled, fully credentialed account in file order.
fn primary_of(accounts: &[Account]) -> Option<PrimaryAccount> {
    accounts
        .iter()
        .find(|a| a.enabled && a.has_credentials())
        .map(|a| PrimaryAccount {
            id: a.id.clone(),
            name: a.name.clone(),
            api_key: a.api_key.clone(),
            access_token: a.access_token.clone(),
        })
}
