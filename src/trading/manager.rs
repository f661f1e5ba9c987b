// src/trading/manager.rs
use crate::domain::errors::PersistenceResult;
use crate::domain::models::{Instrument, Signal, Tick, Token};
use crate::persistence::snapshot::{PersistedState, SnapshotStore};
use crate::trading::fsm::{FsmSnapshot, InstrumentStateMachine, PositionEvent, RetryOutcome};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Signals kept per instrument, most recent first.
pub const SIGNAL_HISTORY_CAPACITY: usize = 100;

struct Slot {
    instrument: Instrument,
    machine: Mutex<InstrumentStateMachine>,
    signals: Mutex<VecDeque<Signal>>,
}

/// One instrument's trading day, as handed to the archive.
#[derive(Debug, Clone)]
pub struct InstrumentDayBook {
    pub instrument: Instrument,
    pub snapshot: FsmSnapshot,
    pub signals: Vec<Signal>,
}

/// Owns every state machine, keyed by token. The set is fixed at startup.
pub struct StateMachineManager {
    slots: HashMap<Token, Slot>,
    order: Vec<Token>,
    store: SnapshotStore,
    events: mpsc::UnboundedSender<PositionEvent>,
}

impl StateMachineManager {
    /// Build one machine per instrument and restore whatever the snapshot
    /// store holds for it.
    pub fn init(
        instruments: &[Instrument],
        store: SnapshotStore,
        events: mpsc::UnboundedSender<PositionEvent>,
    ) -> Self {
        let mut persisted = store.load();
        let mut slots = HashMap::with_capacity(instruments.len());
        let mut order = Vec::with_capacity(instruments.len());
        let mut restored = 0;

        for instrument in instruments {
            if slots.contains_key(&instrument.token) {
                log::warn!("[Manager] Duplicate instrument token {}, ignored", instrument.token);
                continue;
            }
            let mut machine =
                InstrumentStateMachine::new(instrument.token, &instrument.symbol, instrument.lot);
            if let Some(snapshot) = persisted.machines.remove(&instrument.token) {
                machine.restore(snapshot);
                restored += 1;
            }
            let mut signals: VecDeque<Signal> = persisted
                .signals
                .remove(&instrument.token)
                .unwrap_or_default()
                .into();
            signals.truncate(SIGNAL_HISTORY_CAPACITY);

            order.push(instrument.token);
            slots.insert(
                instrument.token,
                Slot {
                    instrument: instrument.clone(),
                    machine: Mutex::new(machine),
                    signals: Mutex::new(signals),
                },
            );
        }

        log::info!(
            "[Manager] Initialized {} machines ({} restored)",
            order.len(),
            restored
        );
        Self {
            slots,
            order,
            store,
            events,
        }
    }

    pub fn tokens(&self) -> &[Token] {
        &self.order
    }

    pub fn instrument(&self, token: Token) -> Option<&Instrument> {
        self.slots.get(&token).map(|s| &s.instrument)
    }

    pub fn instruments(&self) -> Vec<Instrument> {
        self.iter().map(|s| s.instrument.clone()).collect()
    }

    /// Apply a tick. Unknown tokens are ignored.
    pub async fn handle_tick(&self, token: Token, tick: &Tick) -> Option<FsmSnapshot> {
        let slot = self.slots.get(&token)?;
        let mut machine = slot.machine.lock().await;
        let event = machine.handle_tick(tick);
        self.emit(event);
        Some(machine.broadcast_snapshot())
    }

    /// Record the signal in history, then apply it.
    pub async fn handle_signal(&self, token: Token, signal: Signal) -> Option<FsmSnapshot> {
        let slot = self.slots.get(&token)?;
        push_signal(slot, signal.clone()).await;
        let mut machine = slot.machine.lock().await;
        let event = machine.handle_signal(&signal);
        self.emit(event);
        Some(machine.broadcast_snapshot())
    }

    /// Append to the bounded history without touching the machine.
    pub async fn add_signal(&self, token: Token, signal: Signal) -> bool {
        match self.slots.get(&token) {
            Some(slot) => {
                push_signal(slot, signal).await;
                true
            }
            None => false,
        }
    }

    pub async fn signals(&self, token: Token) -> Option<Vec<Signal>> {
        let slot = self.slots.get(&token)?;
        let signals = slot.signals.lock().await;
        Some(signals.iter().cloned().collect())
    }

    /// Give every blocked machine its minute re-evaluation. Returns the
    /// snapshots of the machines that retried.
    pub async fn minute_retry(&self) -> Vec<FsmSnapshot> {
        let mut retried = Vec::new();
        for slot in self.iter() {
            let mut machine = slot.machine.lock().await;
            if let RetryOutcome::Retried(event) = machine.minute_retry() {
                self.emit(event);
                retried.push(machine.broadcast_snapshot());
            }
        }
        if !retried.is_empty() {
            log::info!("[Manager] Minute retry ran on {} machines", retried.len());
        }
        retried
    }

    /// Start a new trading day: every machine reset, trades and P&L cleared,
    /// signal histories emptied. Archive before calling this.
    pub async fn daily_reset(&self) {
        for slot in self.iter() {
            {
                let mut machine = slot.machine.lock().await;
                machine.clear_day();
                machine.reset();
            }
            slot.signals.lock().await.clear();
        }
        log::info!("[Manager] Daily reset of {} machines", self.order.len());
        let _ = self.persist_now().await;
    }

    /// Reset the machines and signal histories of instruments on the given
    /// exchanges. Trades are kept. Returns the number of machines reset.
    pub async fn reset_by_exchange<S: AsRef<str>>(&self, exchanges: &[S]) -> usize {
        let mut count = 0;
        for slot in self.iter() {
            let matches = exchanges
                .iter()
                .any(|e| e.as_ref().eq_ignore_ascii_case(&slot.instrument.exchange));
            if !matches {
                continue;
            }
            slot.machine.lock().await.reset();
            slot.signals.lock().await.clear();
            count += 1;
        }
        log::info!(
            "[Manager] Reset {} machines on {:?}",
            count,
            exchanges.iter().map(|e| e.as_ref()).collect::<Vec<&str>>()
        );
        let _ = self.persist_now().await;
        count
    }

    /// Engage or disengage live trading for one instrument.
    pub async fn set_live(&self, token: Token, enabled: bool) -> Option<FsmSnapshot> {
        let slot = self.slots.get(&token)?;
        let mut machine = slot.machine.lock().await;
        let event = machine.set_live(enabled);
        self.emit(event);
        Some(machine.broadcast_snapshot())
    }

    /// Observer snapshot of one machine.
    pub async fn snapshot(&self, token: Token) -> Option<FsmSnapshot> {
        let slot = self.slots.get(&token)?;
        let machine = slot.machine.lock().await;
        Some(machine.broadcast_snapshot())
    }

    pub async fn snapshots(&self) -> Vec<FsmSnapshot> {
        let mut snapshots = Vec::with_capacity(self.order.len());
        for slot in self.iter() {
            snapshots.push(slot.machine.lock().await.broadcast_snapshot());
        }
        snapshots
    }

    /// Full snapshots and signal histories, in instrument order.
    pub async fn day_book(&self) -> Vec<InstrumentDayBook> {
        let mut book = Vec::with_capacity(self.order.len());
        for slot in self.iter() {
            let snapshot = slot.machine.lock().await.snapshot();
            let signals = slot.signals.lock().await.iter().cloned().collect();
            book.push(InstrumentDayBook {
                instrument: slot.instrument.clone(),
                snapshot,
                signals,
            });
        }
        book
    }

    /// Copy the state under short per-machine locks.
    pub async fn capture(&self) -> PersistedState {
        let mut state = PersistedState {
            saved_at: Some(Utc::now()),
            ..Default::default()
        };
        for slot in self.iter() {
            let token = slot.instrument.token;
            let snapshot = slot.machine.lock().await.snapshot();
            let signals = slot.signals.lock().await.iter().cloned().collect();
            state.machines.insert(token, snapshot);
            state.signals.insert(token, signals);
        }
        state
    }

    /// Capture and write the snapshot file. Failures are logged and returned.
    pub async fn persist_now(&self) -> PersistenceResult<()> {
        let state = self.capture().await;
        let result = self.store.save_async(state).await;
        match &result {
            Ok(()) => log::debug!("[Manager] State saved to {}", self.store.path().display()),
            Err(e) => log::error!("[Manager] Failed to save state: {}", e),
        }
        result
    }

    /// Save every `interval` until the returned task is stopped.
    pub fn start_persistence(self: &Arc<Self>, interval: Duration) -> PersistenceTask {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let manager = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let _ = manager.persist_now().await;
                    }
                    _ = shutdown_rx.changed() => {
                        let _ = manager.persist_now().await;
                        break;
                    }
                }
            }
            log::info!("[Manager] Persistence task stopped");
        });

        log::info!("[Manager] Persisting state every {:?}", interval);
        PersistenceTask {
            handle,
            shutdown: shutdown_tx,
        }
    }

    fn iter(&self) -> impl Iterator<Item = &Slot> {
        self.order.iter().filter_map(|token| self.slots.get(token))
    }

    fn emit(&self, event: Option<PositionEvent>) {
        if let Some(event) = event {
            if self.events.send(event).is_err() {
                log::warn!("[Manager] Position event dropped, no order router running");
            }
        }
    }
}

async fn push_signal(slot: &Slot, signal: Signal) {
    let mut signals = slot.signals.lock().await;
    signals.push_front(signal);
    signals.truncate(SIGNAL_HISTORY_CAPACITY);
}

/// Handle to the periodic save. `stop` performs one last save.
pub struct PersistenceTask {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl PersistenceTask {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            log::error!("[Manager] Persistence task failed: {}", e);
        }
    }
}
