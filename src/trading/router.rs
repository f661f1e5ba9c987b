// src/trading/router.rs
use crate::broadcast::{Broadcaster, OutboundEvent};
use crate::trading::dispatcher::{DispatchReport, OrderDispatcher};
use crate::trading::fsm::PositionEvent;
use crate::trading::manager::StateMachineManager;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Turns live position events into dispatched orders.
///
/// Events are handled one at a time so an entry is always placed before the
/// exit that follows it.
pub struct LiveOrderRouter {
    manager: Arc<StateMachineManager>,
    dispatcher: Arc<OrderDispatcher>,
    broadcaster: Broadcaster,
}

impl LiveOrderRouter {
    pub fn new(
        manager: Arc<StateMachineManager>,
        dispatcher: Arc<OrderDispatcher>,
        broadcaster: Broadcaster,
    ) -> Self {
        Self {
            manager,
            dispatcher,
            broadcaster,
        }
    }

    pub async fn route(&self, event: PositionEvent) -> Option<DispatchReport> {
        let Some(instrument) = self.manager.instrument(event.token()) else {
            log::warn!("[Router] Position event for unknown token {}", event.token());
            return None;
        };
        log::info!("[Router] {:?}", event);

        let report = self.dispatcher.dispatch(instrument, event.side()).await;
        if !report.success {
            log::error!(
                "[Router] {} {} was not placed on any account: {}",
                report.side,
                report.symbol,
                report.message.as_deref().unwrap_or("all placements failed")
            );
        }
        self.broadcaster.send(OutboundEvent::Dispatch(report.clone()));
        Some(report)
    }

    /// Drain the channel until every sender is gone.
    pub fn spawn(self, mut events: mpsc::UnboundedReceiver<PositionEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                self.route(event).await;
            }
            log::info!("[Router] Position event channel closed");
        })
    }
}
