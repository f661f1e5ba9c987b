// src/market_data/supervisor.rs
use crate::accounts::PrimaryAccount;
use crate::broadcast::{Broadcaster, OutboundEvent};
use crate::domain::models::Tick;
use crate::market_data::ticker::{FeedEvent, MarketFeed, MarketTick};
use crate::trading::manager::StateMachineManager;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Keeps one market-data connection open with the primary account's
/// credentials and restarts it whenever those credentials change.
pub struct FeedSupervisor {
    feed: Arc<dyn MarketFeed>,
    manager: Arc<StateMachineManager>,
    broadcaster: Broadcaster,
    primary: watch::Receiver<Option<PrimaryAccount>>,
}

impl FeedSupervisor {
    pub fn new(
        feed: Arc<dyn MarketFeed>,
        manager: Arc<StateMachineManager>,
        broadcaster: Broadcaster,
        primary: watch::Receiver<Option<PrimaryAccount>>,
    ) -> Self {
        Self {
            feed,
            manager,
            broadcaster,
            primary,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let FeedSupervisor {
            feed,
            manager,
            broadcaster,
            mut primary,
        } = self;

        let tokens = manager.tokens().to_vec();
        if tokens.is_empty() {
            log::warn!("[Feed] No instruments to subscribe");
            return;
        }

        loop {
            let credentials = primary.borrow_and_update().clone();
            let Some(credentials) = credentials else {
                log::warn!("[Feed] No enabled account with credentials, waiting for login");
                if primary.changed().await.is_err() {
                    return;
                }
                continue;
            };

            log::info!("[Feed] Connecting with account {}", credentials.name);
            let (tx, rx) = mpsc::channel(1024);
            let session = async {
                let (result, _) = tokio::join!(
                    feed.run(credentials, tokens.clone(), tx),
                    consume(&manager, &broadcaster, rx)
                );
                result
            };

            tokio::select! {
                result = session => {
                    if let Err(e) = result {
                        log::error!("[Feed] Connection failed: {}", e);
                    }
                }
                changed = primary.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    log::info!("[Feed] Primary credentials changed, reconnecting");
                    continue;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                changed = primary.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

async fn consume(
    manager: &StateMachineManager,
    broadcaster: &Broadcaster,
    mut events: mpsc::Receiver<FeedEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            FeedEvent::Tick(tick) => on_tick(manager, broadcaster, tick).await,
            FeedEvent::Connected => log::info!("[Feed] Connected"),
            FeedEvent::Error(e) => log::error!("[Feed] Error: {}", e),
            FeedEvent::Closed => log::info!("[Feed] Closed"),
        }
    }
}

async fn on_tick(manager: &StateMachineManager, broadcaster: &Broadcaster, raw: MarketTick) {
    let Some(instrument) = manager.instrument(raw.token) else {
        return;
    };
    let tick = Tick {
        token: raw.token,
        symbol: instrument.symbol.clone(),
        ltp: raw.ltp,
        change: raw.change,
        volume: raw.volume,
        timestamp: Utc::now(),
    };

    let snapshot = manager.handle_tick(tick.token, &tick).await;
    broadcaster.send(OutboundEvent::Tick(tick));
    if let Some(snapshot) = snapshot {
        broadcaster.send(OutboundEvent::Fsm(snapshot));
    }
}
