// src/accounts/store.rs
use crate::domain::errors::PersistenceResult;
use crate::persistence::{read_json, write_json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

fn default_enabled() -> bool {
    true
}

/// Full credential record as stored on disk.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_order: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_token_update: Option<DateTime<Utc>>,
}

impl Account {
    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.access_token.is_empty()
    }

    pub fn view(&self) -> AccountView {
        AccountView {
            id: self.id.clone(),
            name: self.name.clone(),
            api_key: self.api_key.clone(),
            enabled: self.enabled,
            has_credentials: self.has_credentials(),
            has_api_secret: !self.api_secret.is_empty(),
            last_order: self.last_order,
            last_token_update: self.last_token_update,
            created_at: self.created_at,
        }
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("api_key", &self.api_key)
            .field("enabled", &self.enabled)
            .field("has_credentials", &self.has_credentials())
            .finish_non_exhaustive()
    }
}

/// Redacted projection handed to anything outside the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountView {
    pub id: String,
    pub name: String,
    /// Needed to build the broker login URL
    pub api_key: String,
    pub enabled: bool,
    pub has_credentials: bool,
    pub has_api_secret: bool,
    pub last_order: Option<DateTime<Utc>>,
    pub last_token_update: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewAccount {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_secret: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
}

/// Partial update. Absent or empty strings leave the stored value alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_secret: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl AccountUpdate {
    pub fn apply(self, account: &mut Account) {
        fn overwrite(target: &mut String, value: Option<String>) {
            if let Some(value) = value.filter(|v| !v.is_empty()) {
                *target = value;
            }
        }
        overwrite(&mut account.name, self.name);
        overwrite(&mut account.api_key, self.api_key);
        overwrite(&mut account.api_secret, self.api_secret);
        overwrite(&mut account.access_token, self.access_token);
        if let Some(enabled) = self.enabled {
            account.enabled = enabled;
        }
    }
}

/// The credential file. Holds secrets, so it is written owner-only.
#[derive(Debug, Clone)]
pub struct AccountStore {
    path: PathBuf,
}

impl AccountStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lenient load: an absent or unparsable file is an empty list.
    pub fn load(&self) -> Vec<Account> {
        match self.try_load() {
            Ok(accounts) => accounts,
            Err(e) => {
                log::error!("[Accounts] Failed to load accounts: {}", e);
                Vec::new()
            }
        }
    }

    /// Strict load used before a read-modify-write, so a corrupt file is
    /// never overwritten with a partial set.
    pub fn try_load(&self) -> PersistenceResult<Vec<Account>> {
        Ok(read_json(&self.path)?.unwrap_or_default())
    }

    pub fn save(&self, accounts: &[Account]) -> PersistenceResult<()> {
        write_json(&self.path, &accounts, true)?;
        log::info!("[Accounts] Saved {} accounts", accounts.len());
        Ok(())
    }
}
