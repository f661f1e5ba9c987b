// src/broadcast.rs
use crate::domain::models::{Instrument, Signal, Tick, Token};
use crate::trading::dispatcher::DispatchReport;
use crate::trading::fsm::FsmSnapshot;
use serde::Serialize;
use tokio::sync::broadcast;

/// Events pushed to observers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum OutboundEvent {
    Tick(Tick),
    Signal(Signal),
    Fsm(FsmSnapshot),
    Signals { token: Token, signals: Vec<Signal> },
    Instruments(Vec<Instrument>),
    Dispatch(DispatchReport),
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::Tick(_) => "tick",
            OutboundEvent::Signal(_) => "signal",
            OutboundEvent::Fsm(_) => "fsm",
            OutboundEvent::Signals { .. } => "signals",
            OutboundEvent::Instruments(_) => "instruments",
            OutboundEvent::Dispatch(_) => "dispatch",
        }
    }
}

/// Best-effort fan-out. Nobody listening is not an error.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<OutboundEvent>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutboundEvent> {
        self.tx.subscribe()
    }

    pub fn send(&self, event: OutboundEvent) {
        let name = event.name();
        if self.tx.send(event).is_err() {
            log::trace!("[Broadcast] No subscribers for {}", name);
        }
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading::fsm::InstrumentStateMachine;

    #[tokio::test]
    async fn subscribers_receive_tagged_events() {
        let broadcaster = Broadcaster::new(8);
        let mut rx = broadcaster.subscribe();

        let snapshot = InstrumentStateMachine::new(7, "SYM", 1).broadcast_snapshot();
        broadcaster.send(OutboundEvent::Fsm(snapshot));

        let event = rx.recv().await.unwrap();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "fsm");
        assert_eq!(json["data"]["state"], "NOSIGNAL");
        assert_eq!(json["data"]["token"], 7);
    }

    #[test]
    fn send_without_subscribers_is_fine() {
        Broadcaster::new(1).send(OutboundEvent::Instruments(Vec::new()));
    }
}
