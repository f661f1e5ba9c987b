// src/trading/dispatcher.rs
use crate::accounts::{AccountHandle, AccountRegistry};
use crate::domain::models::{Instrument, OrderParams, OrderSide};
use futures_util::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Outcome of one account's placement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountOrderResult {
    pub account_id: String,
    pub account: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Aggregate of one fan-out.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub total: usize,
    pub success_count: usize,
    pub fail_count: usize,
    pub total_duration_ms: u64,
    pub results: Vec<AccountOrderResult>,
}

/// Places the same market order on every enabled account at once.
pub struct OrderDispatcher {
    registry: Arc<AccountRegistry>,
}

impl OrderDispatcher {
    pub fn new(registry: Arc<AccountRegistry>) -> Self {
        Self { registry }
    }

    /// Never fails: per-account errors are reported in the result list.
    pub async fn dispatch(&self, instrument: &Instrument, side: OrderSide) -> DispatchReport {
        let accounts = self.registry.enabled_accounts().await;
        if accounts.is_empty() {
            log::warn!(
                "[Dispatcher] No enabled accounts, {} {} not placed",
                side,
                instrument.symbol
            );
            return DispatchReport {
                success: false,
                message: Some("No enabled accounts".to_string()),
                symbol: instrument.symbol.clone(),
                side,
                total: 0,
                success_count: 0,
                fail_count: 0,
                total_duration_ms: 0,
                results: Vec::new(),
            };
        }

        log::info!(
            "[Dispatcher] {} {} x{} on {} accounts",
            side,
            instrument.symbol,
            instrument.lot,
            accounts.len()
        );
        let params = Arc::new(OrderParams::market(instrument, side));
        let started = Instant::now();

        let attempts = accounts.into_iter().map(|handle| {
            let account_id = handle.id.clone();
            let account = handle.name.clone();
            let task = tokio::spawn(place(handle, params.clone(), self.registry.clone()));
            async move {
                task.await.unwrap_or_else(|e| AccountOrderResult {
                    account_id,
                    account,
                    success: false,
                    order_id: None,
                    error: Some(format!("Order task failed: {}", e)),
                    duration_ms: 0,
                })
            }
        });
        let results = join_all(attempts).await;

        let total = results.len();
        let success_count = results.iter().filter(|r| r.success).count();
        let report = DispatchReport {
            success: success_count > 0,
            message: None,
            symbol: instrument.symbol.clone(),
            side,
            total,
            success_count,
            fail_count: total - success_count,
            total_duration_ms: started.elapsed().as_millis() as u64,
            results,
        };
        log::info!(
            "[Dispatcher] {} {}: {}/{} succeeded in {}ms",
            side,
            instrument.symbol,
            report.success_count,
            report.total,
            report.total_duration_ms
        );
        report
    }
}

async fn place(
    handle: AccountHandle,
    params: Arc<OrderParams>,
    registry: Arc<AccountRegistry>,
) -> AccountOrderResult {
    let started = Instant::now();
    let outcome = handle.executor.place_order(&params).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(order_id) => {
            log::info!(
                "[Dispatcher] {} ({}): order {} placed in {}ms",
                handle.name,
                handle.id,
                order_id,
                duration_ms
            );
            registry.record_last_order(&handle.id).await;
            AccountOrderResult {
                account_id: handle.id,
                account: handle.name,
                success: true,
                order_id: Some(order_id),
                error: None,
                duration_ms,
            }
        }
        Err(e) => {
            log::error!(
                "[Dispatcher] {} ({}): order failed after {}ms: {}",
                handle.name,
                handle.id,
                duration_ms,
                e
            );
            AccountOrderResult {
                account_id: handle.id,
                account: handle.name,
                success: false,
                order_id: None,
                error: Some(e.to_string()),
                duration_ms,
            }
        }
    }
}
