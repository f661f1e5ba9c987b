// src/persistence/snapshot.rs
use crate::domain::errors::{PersistenceError, PersistenceResult};
use crate::domain::models::{Signal, Token};
use crate::persistence::{read_json, write_json};
use crate::trading::fsm::FsmSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Everything needed to resume after a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PersistedState {
    pub saved_at: Option<DateTime<Utc>>,
    pub machines: BTreeMap<Token, FsmSnapshot>,
    pub signals: BTreeMap<Token, Vec<Signal>>,
}

/// Single overwritten snapshot file.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing or unreadable snapshot means a fresh start.
    pub fn load(&self) -> PersistedState {
        match read_json::<PersistedState>(&self.path) {
            Ok(Some(state)) => {
                log::info!(
                    "[Snapshot] Loaded {} machines saved at {:?}",
                    state.machines.len(),
                    state.saved_at
                );
                state
            }
            Ok(None) => {
                log::info!("[Snapshot] No snapshot at {}, starting fresh", self.path.display());
                PersistedState::default()
            }
            Err(e) => {
                log::error!("[Snapshot] Failed to load snapshot, starting fresh: {}", e);
                PersistedState::default()
            }
        }
    }

    pub fn save(&self, state: &PersistedState) -> PersistenceResult<()> {
        write_json(&self.path, state, false)
    }

    /// Write on the blocking pool.
    pub async fn save_async(&self, state: PersistedState) -> PersistenceResult<()> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.save(&state))
            .await
            .map_err(|e| PersistenceError::Task(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading::fsm::InstrumentStateMachine;

    #[test]
    fn unreadable_snapshot_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("state.json"));
        assert_eq!(store.load(), PersistedState::default());

        std::fs::write(store.path(), "[1, 2").unwrap();
        assert_eq!(store.load(), PersistedState::default());
    }

    #[tokio::test]
    async fn saved_state_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("state.json"));

        let mut state = PersistedState {
            saved_at: Some(Utc::now()),
            ..Default::default()
        };
        state
            .machines
            .insert(42, InstrumentStateMachine::new(42, "BANKNIFTYFUT", 15).snapshot());
        store.save_async(state.clone()).await.unwrap();

        assert_eq!(store.load(), state);
    }
}
