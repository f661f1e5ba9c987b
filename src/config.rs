// src/config.rs
use crate::domain::errors::{AppError, AppResult};
use crate::domain::instruments::InstrumentBook;
use crate::exchange::kite::KITE_API_URL;
use crate::market_data::ticker::KITE_TICKER_URL;
use dotenv::dotenv;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs::File;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// On-disk stores
    pub storage: StorageConfig,

    /// Broker endpoints
    pub broker: BrokerConfig,

    /// HTTP intake and background task timing
    pub server: ServerConfig,

    /// Raw `INSTRUMENTS_DATA` JSON array
    pub instruments_data: Option<String>,

    /// Logging configuration
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub accounts_file: PathBuf,
    pub snapshot_file: PathBuf,
    pub history_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub api_url: String,
    pub ticker_url: String,
    /// Per-request timeout for order placement and token exchange
    pub order_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub http_port: u16,
    pub persist_interval_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "warn", "error")
    pub level: String,

    /// Log to file
    pub to_file: bool,

    /// Log file path
    pub file_path: Option<String>,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> AppResult<Self> {
        // Load .env file if it exists
        dotenv().ok();
        let defaults = Config::default();

        let data_dir = env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.storage.data_dir);
        let in_data_dir = |key: &str, name: &str| {
            env::var(key)
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join(name))
        };
        let storage = StorageConfig {
            accounts_file: in_data_dir("ACCOUNTS_FILE", "accounts.json"),
            snapshot_file: in_data_dir("SNAPSHOT_FILE", "fsm_state.json"),
            history_file: in_data_dir("HISTORY_FILE", "history.json"),
            data_dir: data_dir.clone(),
        };

        let broker = BrokerConfig {
            api_url: env::var("KITE_API_URL").unwrap_or(defaults.broker.api_url),
            ticker_url: env::var("KITE_TICKER_URL").unwrap_or(defaults.broker.ticker_url),
            order_timeout_secs: env_or("ORDER_TIMEOUT_SECS", defaults.broker.order_timeout_secs),
        };

        let server = ServerConfig {
            http_port: env_or("HTTP_PORT", defaults.server.http_port),
            persist_interval_secs: env_or(
                "PERSIST_INTERVAL_SECS",
                defaults.server.persist_interval_secs,
            ),
        };
        if server.persist_interval_secs == 0 {
            return Err(AppError::Config(
                "PERSIST_INTERVAL_SECS must be greater than zero".to_string(),
            ));
        }

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            to_file: env_or("LOG_TO_FILE", false),
            file_path: env::var("LOG_FILE_PATH").ok(),
        };

        Ok(Config {
            storage,
            broker,
            server,
            instruments_data: env::var("INSTRUMENTS_DATA").ok(),
            logging,
        })
    }

    pub fn instruments(&self) -> InstrumentBook {
        InstrumentBook::from_json(self.instruments_data.as_deref())
    }

    pub fn order_timeout(&self) -> Duration {
        Duration::from_secs(self.broker.order_timeout_secs)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_secs(self.server.persist_interval_secs)
    }

    /// Initialize logging based on configuration
    pub fn init_logging(&self) -> AppResult<()> {
        let mut builder = env_logger::Builder::new();

        // Set log level
        let log_level = match self.logging.level.to_lowercase().as_str() {
            "trace" => log::LevelFilter::Trace,
            "debug" => log::LevelFilter::Debug,
            "info" => log::LevelFilter::Info,
            "warn" => log::LevelFilter::Warn,
            "error" => log::LevelFilter::Error,
            _ => log::LevelFilter::Info,
        };

        builder.filter_level(log_level);

        // Configure output
        if self.logging.to_file {
            if let Some(file_path) = &self.logging.file_path {
                let file = File::create(file_path).map_err(|e| {
                    AppError::Config(format!("Failed to create log file: {}", e))
                })?;

                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
        }

        // Initialize the logger
        builder.init();

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = PathBuf::from("data");
        Self {
            storage: StorageConfig {
                accounts_file: data_dir.join("accounts.json"),
                snapshot_file: data_dir.join("fsm_state.json"),
                history_file: data_dir.join("history.json"),
                data_dir,
            },
            broker: BrokerConfig {
                api_url: KITE_API_URL.to_string(),
                ticker_url: KITE_TICKER_URL.to_string(),
                order_timeout_secs: 10,
            },
            server: ServerConfig {
                http_port: 3004,
                persist_interval_secs: 5,
            },
            instruments_data: None,
            logging: LoggingConfig {
                level: "info".to_string(),
                to_file: false,
                file_path: None,
            },
        }
    }
}
