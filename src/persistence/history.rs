// src/persistence/history.rs
use crate::domain::errors::{PersistenceError, PersistenceResult};
use crate::domain::models::{Signal, Token};
use crate::persistence::{read_json, write_json};
use crate::trading::fsm::{StateLogEntry, TradeRecord};
use crate::trading::manager::StateMachineManager;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// One instrument's archived trading day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentDay {
    pub token: Token,
    pub exchange: String,
    pub lot: u32,
    #[serde(rename = "paperRealizedPnL")]
    pub paper_realized_pnl: Decimal,
    #[serde(rename = "liveRealizedPnL")]
    pub live_realized_pnl: Decimal,
    #[serde(default)]
    pub paper_trades: Vec<TradeRecord>,
    #[serde(default)]
    pub live_trades: Vec<TradeRecord>,
    #[serde(default)]
    pub state_log: Vec<StateLogEntry>,
    #[serde(default)]
    pub signals: Vec<Signal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayRecord {
    /// `YYYY-MM-DD`
    pub date: String,
    pub saved_at: DateTime<Utc>,
    /// Keyed by broker trading symbol
    pub instruments: BTreeMap<String, InstrumentDay>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaySummary {
    pub date: String,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryFile {
    #[serde(default)]
    days: Vec<DayRecord>,
}

/// Date-keyed archive of finished trading days, newest first.
/// File access runs on the blocking pool; clones share one writer lock.
#[derive(Debug, Clone)]
pub struct HistoryArchive {
    path: PathBuf,
    writer: Arc<Mutex<()>>,
}

impl HistoryArchive {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: Arc::new(Mutex::new(())),
        }
    }

    /// Copy every instrument's trades, full state log and signal history
    /// into the record for `date`, replacing an earlier record of that date.
    pub async fn archive(
        &self,
        date: NaiveDate,
        manager: &StateMachineManager,
    ) -> PersistenceResult<DayRecord> {
        let mut instruments = BTreeMap::new();
        for day in manager.day_book().await {
            let snapshot = day.snapshot;
            instruments.insert(
                day.instrument.symbol.clone(),
                InstrumentDay {
                    token: day.instrument.token,
                    exchange: day.instrument.exchange.clone(),
                    lot: day.instrument.lot,
                    paper_realized_pnl: snapshot.paper.realized_pnl,
                    live_realized_pnl: snapshot.live.realized_pnl,
                    paper_trades: snapshot.paper.trades,
                    live_trades: snapshot.live.trades,
                    state_log: snapshot.state_log,
                    signals: day.signals,
                },
            );
        }

        let record = DayRecord {
            date: date.format("%Y-%m-%d").to_string(),
            saved_at: Utc::now(),
            instruments,
        };
        self.store_day(record.clone()).await?;
        log::info!(
            "[History] Archived {} with {} instruments",
            record.date,
            record.instruments.len()
        );
        Ok(record)
    }

    /// Insert or replace a day. An unreadable archive is left untouched.
    pub async fn store_day(&self, record: DayRecord) -> PersistenceResult<()> {
        let _guard = self.writer.lock().await;
        let path = self.path.clone();
        blocking(move || {
            let mut history = read_file(&path)?;
            history.days.retain(|d| d.date != record.date);
            history.days.push(record);
            history.days.sort_by(|a, b| b.date.cmp(&a.date));
            write_json(&path, &history, false)
        })
        .await
    }

    pub async fn list_dates(&self) -> PersistenceResult<Vec<DaySummary>> {
        let history = self.read().await?;
        Ok(history
            .days
            .into_iter()
            .map(|d| DaySummary {
                date: d.date,
                saved_at: d.saved_at,
            })
            .collect())
    }

    pub async fn get_by_date(&self, date: &str) -> PersistenceResult<Option<DayRecord>> {
        let history = self.read().await?;
        Ok(history.days.into_iter().find(|d| d.date == date))
    }

    async fn read(&self) -> PersistenceResult<HistoryFile> {
        let path = self.path.clone();
        blocking(move || read_file(&path)).await
    }
}

fn read_file(path: &Path) -> PersistenceResult<HistoryFile> {
    Ok(read_json(path)?.unwrap_or_default())
}

async fn blocking<T, F>(f: F) -> PersistenceResult<T>
where
    F: FnOnce() -> PersistenceResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PersistenceError::Task(e.to_string()))?
}
