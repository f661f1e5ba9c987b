// src/main.rs
use kite_relay::accounts::{AccountRegistry, AccountStore};
use kite_relay::broadcast::{Broadcaster, OutboundEvent};
use kite_relay::config::Config;
use kite_relay::domain::errors::AppResult;
use kite_relay::exchange::{KiteConnector, KiteHttp};
use kite_relay::market_data::{FeedSupervisor, KiteTicker};
use kite_relay::persistence::history::HistoryArchive;
use kite_relay::persistence::snapshot::SnapshotStore;
use kite_relay::scheduler::MinuteScheduler;
use kite_relay::server::{self, AppState};
use kite_relay::trading::{LiveOrderRouter, OrderDispatcher, StateMachineManager};

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal::ctrl_c;
use tokio::sync::{mpsc, oneshot};

#[tokio::main]
async fn main() -> AppResult<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize logging
    config.init_logging()?;

    log::info!("Starting kite_relay v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Data directory: {}", config.storage.data_dir.display());

    let book = Arc::new(config.instruments());
    let broadcaster = Broadcaster::default();

    // Accounts and broker transport
    let http = Arc::new(KiteHttp::new(&config.broker.api_url, config.order_timeout()));
    let registry = Arc::new(AccountRegistry::new(
        AccountStore::new(&config.storage.accounts_file),
        Arc::new(KiteConnector::new(http.clone())),
        http,
    ));
    registry.init().await;

    // State machines, restored from the last snapshot
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let manager = Arc::new(StateMachineManager::init(
        book.all(),
        SnapshotStore::new(&config.storage.snapshot_file),
        events_tx,
    ));
    let persistence = manager.start_persistence(config.persist_interval());
    broadcaster.send(OutboundEvent::Instruments(book.all().to_vec()));

    // Live orders
    let dispatcher = Arc::new(OrderDispatcher::new(registry.clone()));
    let router = LiveOrderRouter::new(manager.clone(), dispatcher, broadcaster.clone()).spawn(events_rx);

    // Market data follows the primary account
    let feed = FeedSupervisor::new(
        Arc::new(KiteTicker::new(&config.broker.ticker_url)),
        manager.clone(),
        broadcaster.clone(),
        registry.subscribe_primary(),
    )
    .spawn();

    let archive = HistoryArchive::new(&config.storage.history_file);
    let scheduler = MinuteScheduler::new(manager.clone(), archive.clone(), broadcaster.clone()).spawn();

    // HTTP intake
    let state = Arc::new(AppState {
        manager: manager.clone(),
        registry: registry.clone(),
        archive,
        book,
        broadcaster,
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.http_port));
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let http_server = tokio::spawn(server::serve(state, addr, async {
        let _ = shutdown_rx.await;
    }));

    // Wait for shutdown signal
    log::info!("Relay is running. Press Ctrl+C to stop.");
    if let Err(e) = ctrl_c().await {
        log::error!("Failed to listen for control-c event: {}", e);
    }

    // Shutdown
    log::info!("Shutting down...");
    let _ = shutdown_tx.send(());
    match http_server.await {
        Ok(Err(e)) => log::error!("HTTP server error: {}", e),
        Err(e) => log::error!("HTTP server task failed: {}", e),
        Ok(Ok(())) => {}
    }
    scheduler.abort();
    feed.abort();
    persistence.stop().await;
    router.abort();

    log::info!("Shutdown complete. Goodbye!");
    Ok(())
}
