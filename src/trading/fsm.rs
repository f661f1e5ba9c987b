// src/trading/fsm.rs
//! Per-instrument trading state machine.
//!
//! A BUY signal arms a threshold. A price strictly above the threshold enters a
//! long position, a price at or below it either blocks the entry (until the
//! next evaluation) or stops out an open position. Paper and live legs are
//! tracked side by side; the live leg only exists while live trading is
//! engaged and is reported through [`PositionEvent`]s for the order router.

use crate::domain::models::{OrderSide, Signal, SignalIntent, Tick, Token};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Entries kept in the in-memory state log.
pub const STATE_LOG_CAPACITY: usize = 50;

/// Entries included in snapshots pushed to observers.
pub const BROADCAST_LOG_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FsmState {
    #[default]
    #[serde(rename = "NOSIGNAL")]
    NoSignal,
    #[serde(rename = "NOPOSITION_SIGNAL")]
    NoPositionSignal,
    #[serde(rename = "BUYPOSITION")]
    BuyPosition,
    #[serde(rename = "NOPOSITION_BLOCKED")]
    NoPositionBlocked,
}

impl FsmState {
    /// States in which a threshold is armed.
    pub fn has_threshold(&self) -> bool {
        !matches!(self, FsmState::NoSignal)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FsmState::NoSignal => "NOSIGNAL",
            FsmState::NoPositionSignal => "NOPOSITION_SIGNAL",
            FsmState::BuyPosition => "BUYPOSITION",
            FsmState::NoPositionBlocked => "NOPOSITION_BLOCKED",
        }
    }
}

impl fmt::Display for FsmState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogEvent {
    BuySignal,
    SellSignal,
    SellExit,
    Entry,
    StopLoss,
    Blocked,
    MinuteRetry,
    Reset,
    LiveOn,
    LiveOff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvalTrigger {
    Tick,
    SignalEval,
    MinuteRetry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    StopLoss,
    SellSignal,
    Manual,
}

/// One completed round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRecord {
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub pnl: Decimal,
    pub lot: u32,
    pub reason: ExitReason,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateLogEntry {
    pub timestamp: DateTime<Utc>,
    pub event: LogEvent,
    pub state: FsmState,
    pub ltp: Option<Decimal>,
    pub threshold: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_state: Option<FsmState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<EvalTrigger>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_price: Option<Decimal>,
}

#[derive(Debug, Default)]
struct LogDetails {
    prev_state: Option<FsmState>,
    trigger: Option<EvalTrigger>,
    entry_price: Option<Decimal>,
    exit_price: Option<Decimal>,
}

/// Position and P&L for one leg (paper or live).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PositionBook {
    pub entry_price: Option<Decimal>,
    pub entry_time: Option<DateTime<Utc>>,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    /// Sum of closed-trade P&L for the trading day; never includes the open mark.
    pub cumulative_pnl: Decimal,
    pub trades: Vec<TradeRecord>,
}

impl PositionBook {
    pub fn is_open(&self) -> bool {
        self.entry_price.is_some()
    }

    fn open(&mut self, price: Decimal, at: DateTime<Utc>) {
        self.entry_price = Some(price);
        self.entry_time = Some(at);
        self.unrealized_pnl = Decimal::ZERO;
    }

    fn mark(&mut self, ltp: Decimal, lot: u32) {
        self.unrealized_pnl = match self.entry_price {
            Some(entry) => (ltp - entry) * Decimal::from(lot),
            None => Decimal::ZERO,
        };
    }

    fn close(
        &mut self,
        price: Decimal,
        lot: u32,
        reason: ExitReason,
        at: DateTime<Utc>,
    ) -> Option<TradeRecord> {
        let entry_price = self.entry_price.take()?;
        let entry_time = self.entry_time.take().unwrap_or(at);
        let pnl = (price - entry_price) * Decimal::from(lot);

        let trade = TradeRecord {
            entry_price,
            exit_price: price,
            pnl,
            lot,
            reason,
            entry_time,
            exit_time: at,
        };
        self.trades.push(trade.clone());
        self.realized_pnl += pnl;
        self.cumulative_pnl += pnl;
        self.unrealized_pnl = Decimal::ZERO;
        Some(trade)
    }

    fn clear_open(&mut self) {
        self.entry_price = None;
        self.entry_time = None;
        self.unrealized_pnl = Decimal::ZERO;
    }

    fn clear_day(&mut self) {
        *self = PositionBook::default();
    }
}

/// Serializable state of one machine. Used both for broadcast and on disk;
/// every field falls back to its initial value when absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FsmSnapshot {
    pub token: Token,
    pub symbol: String,
    pub lot: u32,
    pub state: FsmState,
    pub ltp: Option<Decimal>,
    pub threshold: Option<Decimal>,
    pub blocked_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub paper: PositionBook,
    pub live_active: bool,
    pub live: PositionBook,
    pub state_log: Vec<StateLogEntry>,
}

impl FsmSnapshot {
    /// Copy with the state log cut to the `len` most recent entries.
    pub fn truncated(mut self, len: usize) -> Self {
        self.state_log.truncate(len);
        self
    }
}

/// Live-leg order intent produced by a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionEvent {
    Opened {
        token: Token,
        symbol: String,
        quantity: u32,
        price: Decimal,
    },
    Closed {
        token: Token,
        symbol: String,
        quantity: u32,
        price: Decimal,
        reason: ExitReason,
    },
}

impl PositionEvent {
    pub fn token(&self) -> Token {
        match self {
            PositionEvent::Opened { token, .. } | PositionEvent::Closed { token, .. } => *token,
        }
    }

    pub fn side(&self) -> OrderSide {
        match self {
            PositionEvent::Opened { .. } => OrderSide::Buy,
            PositionEvent::Closed { .. } => OrderSide::Sell,
        }
    }
}

/// Result of a minute-boundary retry.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    Skipped,
    Retried(Option<PositionEvent>),
}

impl RetryOutcome {
    pub fn retried(&self) -> bool {
        matches!(self, RetryOutcome::Retried(_))
    }
}

#[derive(Debug, Clone)]
pub struct InstrumentStateMachine {
    token: Token,
    symbol: String,
    lot: u32,
    state: FsmState,
    ltp: Option<Decimal>,
    threshold: Option<Decimal>,
    blocked_at: Option<DateTime<Utc>>,
    last_checked_at: Option<DateTime<Utc>>,
    paper: PositionBook,
    live_active: bool,
    live: PositionBook,
    state_log: VecDeque<StateLogEntry>,
}

impl InstrumentStateMachine {
    pub fn new(token: Token, symbol: &str, lot: u32) -> Self {
        Self {
            token,
            symbol: symbol.to_string(),
            lot,
            state: FsmState::NoSignal,
            ltp: None,
            threshold: None,
            blocked_at: None,
            last_checked_at: None,
            paper: PositionBook::default(),
            live_active: false,
            live: PositionBook::default(),
            state_log: VecDeque::with_capacity(STATE_LOG_CAPACITY),
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn state(&self) -> FsmState {
        self.state
    }

    pub fn ltp(&self) -> Option<Decimal> {
        self.ltp
    }

    pub fn threshold(&self) -> Option<Decimal> {
        self.threshold
    }

    pub fn blocked_at(&self) -> Option<DateTime<Utc>> {
        self.blocked_at
    }

    pub fn last_checked_at(&self) -> Option<DateTime<Utc>> {
        self.last_checked_at
    }

    pub fn paper(&self) -> &PositionBook {
        &self.paper
    }

    pub fn live(&self) -> &PositionBook {
        &self.live
    }

    pub fn is_live(&self) -> bool {
        self.live_active
    }

    pub fn state_log(&self) -> impl Iterator<Item = &StateLogEntry> {
        self.state_log.iter()
    }

    pub fn handle_signal(&mut self, signal: &Signal) -> Option<PositionEvent> {
        match signal.intent {
            SignalIntent::Buy => {
                let Some(stoppx) = signal.stoppx else {
                    log::warn!("[FSM] {}: BUY signal without stop price ignored", self.symbol);
                    return None;
                };
                let prev_state = self.state;
                self.threshold = Some(stoppx);
                self.state = FsmState::NoPositionSignal;
                self.blocked_at = None;
                self.log(
                    LogEvent::BuySignal,
                    LogDetails {
                        prev_state: Some(prev_state),
                        ..Default::default()
                    },
                );

                if self.ltp.is_some() {
                    self.evaluate(EvalTrigger::SignalEval)
                } else {
                    None
                }
            }
            SignalIntent::Sell => {
                let prev_state = self.state;
                let was_in_position = prev_state == FsmState::BuyPosition || self.holding();
                let event = if was_in_position {
                    self.close_position(ExitReason::SellSignal)
                } else {
                    None
                };

                self.state = FsmState::NoSignal;
                self.threshold = None;
                self.blocked_at = None;
                let (log_event, exit_price) = if was_in_position {
                    (LogEvent::SellExit, self.ltp)
                } else {
                    (LogEvent::SellSignal, None)
                };
                self.log(
                    log_event,
                    LogDetails {
                        prev_state: Some(prev_state),
                        exit_price,
                        ..Default::default()
                    },
                );
                event
            }
            SignalIntent::Unknown => {
                log::debug!("[FSM] {}: ignoring signal with unknown intent", self.symbol);
                None
            }
        }
    }

    pub fn handle_tick(&mut self, tick: &Tick) -> Option<PositionEvent> {
        self.ltp = Some(tick.ltp);
        if !tick.symbol.is_empty() && tick.symbol != self.symbol {
            self.symbol = tick.symbol.clone();
        }
        self.mark_to_market();

        if self.state != FsmState::NoSignal {
            self.evaluate(EvalTrigger::Tick)
        } else {
            None
        }
    }

    pub fn evaluate(&mut self, trigger: EvalTrigger) -> Option<PositionEvent> {
        if self.state == FsmState::NoSignal {
            return None;
        }
        let (Some(ltp), Some(threshold)) = (self.ltp, self.threshold) else {
            return None;
        };
        let prev_state = self.state;

        if ltp > threshold {
            if prev_state == FsmState::BuyPosition {
                return None;
            }
            self.state = FsmState::BuyPosition;
            self.blocked_at = None;

            let (entry_price, event) = if self.holding() {
                // Re-armed above the market: the held legs carry over unchanged
                let carried = self.paper.entry_price.or(self.live.entry_price);
                (carried.unwrap_or(ltp), None)
            } else {
                (ltp, self.open_position(ltp))
            };
            self.log(
                LogEvent::Entry,
                LogDetails {
                    prev_state: Some(prev_state),
                    trigger: Some(trigger),
                    entry_price: Some(entry_price),
                    ..Default::default()
                },
            );
            return event;
        }

        match prev_state {
            FsmState::BuyPosition => {
                let event = self.close_position(ExitReason::StopLoss);
                self.state = FsmState::NoSignal;
                self.threshold = None;
                self.log(
                    LogEvent::StopLoss,
                    LogDetails {
                        prev_state: Some(prev_state),
                        trigger: Some(trigger),
                        exit_price: Some(ltp),
                        ..Default::default()
                    },
                );
                event
            }
            FsmState::NoPositionSignal => {
                // Legs still held from before a re-arm are at or below the new stop
                let exit_price = self.holding().then_some(ltp);
                let event = self.close_position(ExitReason::StopLoss);
                self.state = FsmState::NoPositionBlocked;
                self.blocked_at = Some(Utc::now());
                self.log(
                    LogEvent::Blocked,
                    LogDetails {
                        prev_state: Some(prev_state),
                        trigger: Some(trigger),
                        exit_price,
                        ..Default::default()
                    },
                );
                event
            }
            FsmState::NoPositionBlocked | FsmState::NoSignal => None,
        }
    }

    /// One re-evaluation per wall-clock minute while blocked.
    pub fn minute_retry(&mut self) -> RetryOutcome {
        if self.state != FsmState::NoPositionBlocked {
            return RetryOutcome::Skipped;
        }
        self.last_checked_at = Some(Utc::now());
        self.log(
            LogEvent::MinuteRetry,
            LogDetails {
                prev_state: Some(self.state),
                ..Default::default()
            },
        );
        RetryOutcome::Retried(self.evaluate(EvalTrigger::MinuteRetry))
    }

    /// Back to NOSIGNAL. Trade lists and realized P&L are kept.
    pub fn reset(&mut self) {
        if self.live.is_open() {
            log::warn!(
                "[FSM] {}: reset with an open live position at {:?}",
                self.symbol,
                self.live.entry_price
            );
        }
        let prev_state = self.state;
        self.state = FsmState::NoSignal;
        self.threshold = None;
        self.blocked_at = None;
        self.last_checked_at = None;
        self.paper.clear_open();
        self.live.clear_open();
        self.log(
            LogEvent::Reset,
            LogDetails {
                prev_state: Some(prev_state),
                ..Default::default()
            },
        );
    }

    /// Drop the trading day's trades, P&L and log. Callers archive first.
    pub fn clear_day(&mut self) {
        self.paper.clear_day();
        self.live.clear_day();
        self.state_log.clear();
    }

    /// Engage or disengage live trading. Disengaging with an open live leg
    /// closes it at the current price.
    pub fn set_live(&mut self, enabled: bool) -> Option<PositionEvent> {
        if enabled == self.live_active {
            return None;
        }

        if enabled {
            self.live_active = true;
            self.log(LogEvent::LiveOn, LogDetails::default());
            return None;
        }

        let event = match self.ltp {
            Some(price) if self.live.is_open() => self.close_live(price, ExitReason::Manual),
            _ => None,
        };
        self.live_active = false;
        let exit_price = event.as_ref().and(self.ltp);
        self.log(
            LogEvent::LiveOff,
            LogDetails {
                exit_price,
                ..Default::default()
            },
        );
        event
    }

    pub fn snapshot(&self) -> FsmSnapshot {
        FsmSnapshot {
            token: self.token,
            symbol: self.symbol.clone(),
            lot: self.lot,
            state: self.state,
            ltp: self.ltp,
            threshold: self.threshold,
            blocked_at: self.blocked_at,
            last_checked_at: self.last_checked_at,
            paper: self.paper.clone(),
            live_active: self.live_active,
            live: self.live.clone(),
            state_log: self.state_log.iter().cloned().collect(),
        }
    }

    /// Snapshot for observers, with a short log.
    pub fn broadcast_snapshot(&self) -> FsmSnapshot {
        self.snapshot().truncated(BROADCAST_LOG_LEN)
    }

    /// Load a persisted snapshot. The configured token is authoritative, and
    /// the configured symbol and lot win over empty or zero values.
    pub fn restore(&mut self, snapshot: FsmSnapshot) {
        if !snapshot.symbol.is_empty() {
            self.symbol = snapshot.symbol;
        }
        if snapshot.lot > 0 {
            self.lot = snapshot.lot;
        }
        self.state = snapshot.state;
        self.ltp = snapshot.ltp;
        self.threshold = snapshot.threshold;
        self.blocked_at = snapshot.blocked_at;
        self.last_checked_at = snapshot.last_checked_at;
        self.paper = snapshot.paper;
        self.live_active = snapshot.live_active;
        self.live = snapshot.live;
        self.state_log = snapshot
            .state_log
            .into_iter()
            .take(STATE_LOG_CAPACITY)
            .collect();

        // A snapshot that breaks the state invariants is repaired rather than rejected.
        if self.state.has_threshold() && self.threshold.is_none() {
            log::warn!("[FSM] {}: restored {} without threshold", self.symbol, self.state);
            self.state = FsmState::NoSignal;
        }
        if !self.state.has_threshold() {
            self.threshold = None;
        }
        if self.state != FsmState::NoPositionBlocked {
            self.blocked_at = None;
        }
        if self.state != FsmState::BuyPosition {
            self.paper.clear_open();
            self.live.clear_open();
        }
    }

    fn holding(&self) -> bool {
        self.paper.is_open() || self.live.is_open()
    }

    fn open_position(&mut self, price: Decimal) -> Option<PositionEvent> {
        let now = Utc::now();
        self.paper.open(price, now);
        if !self.live_active {
            return None;
        }
        self.live.open(price, now);
        Some(PositionEvent::Opened {
            token: self.token,
            symbol: self.symbol.clone(),
            quantity: self.lot,
            price,
        })
    }

    fn close_position(&mut self, reason: ExitReason) -> Option<PositionEvent> {
        let price = self.ltp?;
        let now = Utc::now();
        if let Some(trade) = self.paper.close(price, self.lot, reason, now) {
            log::info!(
                "[FSM] {}: paper exit {:?} entry={} exit={} pnl={}",
                self.symbol,
                reason,
                trade.entry_price,
                trade.exit_price,
                trade.pnl
            );
        }
        if self.live.is_open() {
            self.close_live(price, reason)
        } else {
            None
        }
    }

    fn close_live(&mut self, price: Decimal, reason: ExitReason) -> Option<PositionEvent> {
        let trade = self.live.close(price, self.lot, reason, Utc::now())?;
        log::info!(
            "[FSM] {}: live exit {:?} entry={} exit={} pnl={}",
            self.symbol,
            reason,
            trade.entry_price,
            trade.exit_price,
            trade.pnl
        );
        Some(PositionEvent::Closed {
            token: self.token,
            symbol: self.symbol.clone(),
            quantity: self.lot,
            price,
            reason,
        })
    }

    fn mark_to_market(&mut self) {
        if let Some(ltp) = self.ltp {
            self.paper.mark(ltp, self.lot);
            self.live.mark(ltp, self.lot);
        }
    }

    fn log(&mut self, event: LogEvent, details: LogDetails) {
        let entry = StateLogEntry {
            timestamp: Utc::now(),
            event,
            state: self.state,
            ltp: self.ltp,
            threshold: self.threshold,
            prev_state: details.prev_state,
            trigger: details.trigger,
            entry_price: details.entry_price,
            exit_price: details.exit_price,
        };
        self.state_log.push_front(entry);
        self.state_log.truncate(STATE_LOG_CAPACITY);
        log::info!(
            "[FSM] {:?}: symbol={}, state={}, ltp={:?}, threshold={:?}",
            event,
            self.symbol,
            self.state,
            self.ltp,
            self.threshold
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const LOT: u32 = 50;

    fn machine() -> InstrumentStateMachine {
        InstrumentStateMachine::new(1001, "NIFTYFUT", LOT)
    }

    fn tick(ltp: Decimal) -> Tick {
        Tick {
            token: 1001,
            symbol: "NIFTYFUT".to_string(),
            ltp,
            change: None,
            volume: None,
            timestamp: Utc::now(),
        }
    }

    fn signal(intent: SignalIntent, stoppx: Option<Decimal>) -> Signal {
        Signal {
            symbol: "NIFTYFUT".to_string(),
            intent,
            stoppx,
            token: 1001,
            timestamp: Utc::now(),
        }
    }

    fn events(fsm: &InstrumentStateMachine, event: LogEvent) -> usize {
        fsm.state_log().filter(|e| e.event == event).count()
    }

    #[test]
    fn buy_then_cross_enters_position() {
        let mut fsm = machine();
        fsm.handle_signal(&signal(SignalIntent::Buy, Some(dec!(100))));
        assert_eq!(fsm.state(), FsmState::NoPositionSignal);

        fsm.handle_tick(&tick(dec!(105)));
        assert_eq!(fsm.state(), FsmState::BuyPosition);
        assert_eq!(fsm.paper().entry_price, Some(dec!(105)));
        assert_eq!(events(&fsm, LogEvent::Entry), 1);
    }

    #[test]
    fn stop_loss_records_trade() {
        let mut fsm = machine();
        fsm.handle_signal(&signal(SignalIntent::Buy, Some(dec!(100))));
        fsm.handle_tick(&tick(dec!(105)));
        fsm.handle_tick(&tick(dec!(110)));
        assert_eq!(fsm.paper().unrealized_pnl, dec!(250));

        fsm.handle_tick(&tick(dec!(95)));
        assert_eq!(fsm.state(), FsmState::NoSignal);
        assert_eq!(fsm.threshold(), None);

        let trades = &fsm.paper().trades;
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].entry_price, dec!(105));
        assert_eq!(trades[0].exit_price, dec!(95));
        assert_eq!(trades[0].pnl, dec!(-500));
        assert_eq!(trades[0].reason, ExitReason::StopLoss);
        assert_eq!(fsm.paper().realized_pnl, dec!(-500));
        assert_eq!(fsm.paper().unrealized_pnl, Decimal::ZERO);
    }

    #[test]
    fn price_at_threshold_does_not_enter() {
        let mut fsm = machine();
        fsm.handle_tick(&tick(dec!(100)));
        fsm.handle_signal(&signal(SignalIntent::Buy, Some(dec!(100))));
        assert_eq!(fsm.state(), FsmState::NoPositionBlocked);
    }

    #[test]
    fn blocked_logged_once_and_timestamp_kept() {
        let mut fsm = machine();
        fsm.handle_signal(&signal(SignalIntent::Buy, Some(dec!(100))));
        fsm.handle_tick(&tick(dec!(90)));
        assert_eq!(fsm.state(), FsmState::NoPositionBlocked);
        let blocked_at = fsm.blocked_at();
        assert!(blocked_at.is_some());

        fsm.handle_tick(&tick(dec!(91)));
        fsm.evaluate(EvalTrigger::Tick);
        fsm.handle_tick(&tick(dec!(92)));
        assert_eq!(events(&fsm, LogEvent::Blocked), 1);
        assert_eq!(fsm.blocked_at(), blocked_at);
    }

    #[test]
    fn minute_retry_outside_blocked_is_inert() {
        let mut fsm = machine();
        let before = fsm.snapshot();
        assert_eq!(fsm.minute_retry(), RetryOutcome::Skipped);
        assert_eq!(fsm.snapshot(), before);

        fsm.handle_signal(&signal(SignalIntent::Buy, Some(dec!(100))));
        fsm.handle_tick(&tick(dec!(105)));
        let before = fsm.snapshot();
        assert_eq!(fsm.minute_retry(), RetryOutcome::Skipped);
        assert_eq!(fsm.snapshot(), before);
    }

    #[test]
    fn minute_retry_enters_once_price_recovers() {
        let mut fsm = machine();
        fsm.handle_signal(&signal(SignalIntent::Buy, Some(dec!(100))));
        fsm.handle_tick(&tick(dec!(90)));

        assert!(fsm.minute_retry().retried());
        assert_eq!(fsm.state(), FsmState::NoPositionBlocked);
        assert!(fsm.last_checked_at().is_some());

        // Ticks keep evaluating; the retry is an extra opportunity.
        fsm.ltp = Some(dec!(101));
        assert_eq!(fsm.minute_retry(), RetryOutcome::Retried(None));
        assert_eq!(fsm.state(), FsmState::BuyPosition);
        assert_eq!(fsm.blocked_at(), None);
        assert_eq!(events(&fsm, LogEvent::MinuteRetry), 2);
    }

    #[test]
    fn sell_signal_closes_position() {
        let mut fsm = machine();
        fsm.handle_signal(&signal(SignalIntent::Buy, Some(dec!(100))));
        fsm.handle_tick(&tick(dec!(104)));
        fsm.handle_tick(&tick(dec!(108)));

        fsm.handle_signal(&signal(SignalIntent::Sell, None));
        assert_eq!(fsm.state(), FsmState::NoSignal);
        assert_eq!(fsm.paper().trades[0].reason, ExitReason::SellSignal);
        assert_eq!(fsm.paper().trades[0].pnl, dec!(200));
        assert_eq!(events(&fsm, LogEvent::SellExit), 1);
        assert_eq!(events(&fsm, LogEvent::SellSignal), 0);
    }

    #[test]
    fn sell_without_position_logs_sell_signal() {
        let mut fsm = machine();
        fsm.handle_signal(&signal(SignalIntent::Buy, Some(dec!(100))));
        fsm.handle_signal(&signal(SignalIntent::Sell, None));
        assert_eq!(fsm.state(), FsmState::NoSignal);
        assert_eq!(events(&fsm, LogEvent::SellSignal), 1);
        assert!(fsm.paper().trades.is_empty());
    }

    #[test]
    fn buy_above_market_while_holding_blocks() {
        let mut fsm = machine();
        fsm.set_live(true);
        fsm.handle_signal(&signal(SignalIntent::Buy, Some(dec!(100))));
        fsm.handle_tick(&tick(dec!(105)));

        let event = fsm.handle_signal(&signal(SignalIntent::Buy, Some(dec!(110))));
        assert_eq!(fsm.state(), FsmState::NoPositionBlocked);
        assert_eq!(fsm.threshold(), Some(dec!(110)));
        assert!(fsm.blocked_at().is_some());
        assert_eq!(events(&fsm, LogEvent::Blocked), 1);
        assert_eq!(events(&fsm, LogEvent::StopLoss), 0);

        // The held legs sit below the new stop and are closed there
        assert!(matches!(
            event,
            Some(PositionEvent::Closed { reason: ExitReason::StopLoss, .. })
        ));
        assert!(!fsm.paper().is_open());
        assert!(!fsm.live().is_open());
        assert_eq!(fsm.paper().trades[0].exit_price, dec!(105));

        // Crossing the new stop is a fresh entry
        let event = fsm.handle_tick(&tick(dec!(111)));
        assert!(matches!(event, Some(PositionEvent::Opened { .. })));
        assert_eq!(fsm.state(), FsmState::BuyPosition);
        assert_eq!(fsm.paper().entry_price, Some(dec!(111)));
    }

    #[test]
    fn buy_below_market_while_holding_keeps_position() {
        let mut fsm = machine();
        fsm.set_live(true);
        fsm.handle_signal(&signal(SignalIntent::Buy, Some(dec!(100))));
        fsm.handle_tick(&tick(dec!(105)));

        let event = fsm.handle_signal(&signal(SignalIntent::Buy, Some(dec!(103))));
        assert_eq!(event, None);
        assert_eq!(fsm.state(), FsmState::BuyPosition);
        assert_eq!(fsm.threshold(), Some(dec!(103)));
        assert_eq!(fsm.paper().entry_price, Some(dec!(105)));
        assert_eq!(fsm.live().entry_price, Some(dec!(105)));

        let transitions: Vec<LogEvent> = fsm.state_log().take(2).map(|e| e.event).collect();
        assert_eq!(transitions, vec![LogEvent::Entry, LogEvent::BuySignal]);
        assert_eq!(fsm.state_log().next().and_then(|e| e.entry_price), Some(dec!(105)));

        fsm.handle_tick(&tick(dec!(102)));
        assert_eq!(fsm.state(), FsmState::NoSignal);
        assert_eq!(fsm.paper().trades[0].pnl, dec!(-150));
    }

    #[test]
    fn cumulative_pnl_counts_closed_trades_only() {
        let mut fsm = InstrumentStateMachine::new(1001, "NIFTYFUT", 10);
        fsm.handle_signal(&signal(SignalIntent::Buy, Some(dec!(100))));
        fsm.handle_tick(&tick(dec!(105)));
        fsm.handle_tick(&tick(dec!(120)));
        assert_eq!(fsm.paper().unrealized_pnl, dec!(150));
        assert_eq!(fsm.paper().cumulative_pnl, Decimal::ZERO);

        fsm.handle_signal(&signal(SignalIntent::Sell, None));
        assert_eq!(fsm.paper().cumulative_pnl, dec!(150));

        // Re-entry at 120, then marked down
        fsm.handle_signal(&signal(SignalIntent::Buy, Some(dec!(110))));
        fsm.handle_tick(&tick(dec!(115)));
        assert_eq!(fsm.state(), FsmState::BuyPosition);
        assert_eq!(fsm.paper().unrealized_pnl, dec!(-50));
        assert_eq!(fsm.paper().cumulative_pnl, dec!(150));
    }

    #[test]
    fn live_leg_emits_position_events() {
        let mut fsm = machine();
        assert_eq!(fsm.set_live(true), None);
        fsm.handle_signal(&signal(SignalIntent::Buy, Some(dec!(100))));

        let opened = fsm.handle_tick(&tick(dec!(105)));
        assert!(matches!(
            opened,
            Some(PositionEvent::Opened { price, quantity: LOT, .. }) if price == dec!(105)
        ));

        let closed = fsm.handle_tick(&tick(dec!(99)));
        assert!(matches!(
            closed,
            Some(PositionEvent::Closed { reason: ExitReason::StopLoss, .. })
        ));
        assert_eq!(fsm.live().trades.len(), 1);
        assert_eq!(fsm.paper().trades.len(), 1);
        assert_eq!(fsm.live().realized_pnl, dec!(-300));
    }

    #[test]
    fn paper_only_emits_nothing() {
        let mut fsm = machine();
        fsm.handle_signal(&signal(SignalIntent::Buy, Some(dec!(100))));
        assert_eq!(fsm.handle_tick(&tick(dec!(105))), None);
        assert_eq!(fsm.handle_tick(&tick(dec!(95))), None);
        assert!(fsm.live().trades.is_empty());
    }

    #[test]
    fn disengaging_live_closes_live_leg_manually() {
        let mut fsm = machine();
        fsm.set_live(true);
        fsm.handle_signal(&signal(SignalIntent::Buy, Some(dec!(100))));
        fsm.handle_tick(&tick(dec!(105)));
        fsm.handle_tick(&tick(dec!(107)));

        let event = fsm.set_live(false);
        assert!(matches!(
            event,
            Some(PositionEvent::Closed { reason: ExitReason::Manual, .. })
        ));
        assert_eq!(fsm.state(), FsmState::BuyPosition);
        assert!(fsm.paper().is_open());
        assert_eq!(fsm.live().trades[0].pnl, dec!(100));
    }

    #[test]
    fn reset_keeps_trades() {
        let mut fsm = machine();
        fsm.handle_signal(&signal(SignalIntent::Buy, Some(dec!(100))));
        fsm.handle_tick(&tick(dec!(105)));
        fsm.handle_tick(&tick(dec!(95)));
        fsm.handle_signal(&signal(SignalIntent::Buy, Some(dec!(100))));

        fsm.reset();
        assert_eq!(fsm.state(), FsmState::NoSignal);
        assert_eq!(fsm.threshold(), None);
        assert_eq!(fsm.blocked_at(), None);
        assert_eq!(fsm.paper().trades.len(), 1);
        assert_eq!(fsm.state_log().next().map(|e| e.event), Some(LogEvent::Reset));
    }

    #[test]
    fn state_log_is_bounded() {
        let mut fsm = machine();
        for _ in 0..(STATE_LOG_CAPACITY + 20) {
            fsm.reset();
        }
        assert_eq!(fsm.state_log().count(), STATE_LOG_CAPACITY);
        assert_eq!(fsm.broadcast_snapshot().state_log.len(), BROADCAST_LOG_LEN);
    }

    #[test]
    fn snapshot_round_trip_is_identical() {
        let mut fsm = machine();
        fsm.set_live(true);
        fsm.handle_signal(&signal(SignalIntent::Buy, Some(dec!(100))));
        fsm.handle_tick(&tick(dec!(105)));
        fsm.handle_tick(&tick(dec!(95)));
        fsm.handle_signal(&signal(SignalIntent::Buy, Some(dec!(100))));
        fsm.handle_tick(&tick(dec!(99)));

        let json = serde_json::to_string(&fsm.snapshot()).unwrap();
        let mut restored = InstrumentStateMachine::new(1001, "NIFTYFUT", LOT);
        restored.restore(serde_json::from_str(&json).unwrap());

        assert_eq!(restored.snapshot(), fsm.snapshot());
    }

    #[test]
    fn restore_tolerates_missing_fields() {
        let old = r#"{"symbol": "NIFTYFUT", "state": "NOPOSITION_SIGNAL", "ltp": 98.5, "threshold": 100}"#;
        let mut fsm = machine();
        fsm.restore(serde_json::from_str(old).unwrap());

        assert_eq!(fsm.state(), FsmState::NoPositionSignal);
        assert_eq!(fsm.threshold(), Some(dec!(100)));
        assert_eq!(fsm.ltp(), Some(dec!(98.5)));
        assert!(!fsm.is_live());
        assert!(fsm.paper().trades.is_empty());
        assert_eq!(fsm.snapshot().lot, LOT);
    }

    #[test]
    fn restore_repairs_broken_invariants() {
        let broken = r#"{"state": "NOPOSITION_BLOCKED"}"#;
        let mut fsm = machine();
        fsm.restore(serde_json::from_str(broken).unwrap());
        assert_eq!(fsm.state(), FsmState::NoSignal);
        assert_eq!(fsm.blocked_at(), None);
    }
}
