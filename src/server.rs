// src/server.rs
// Minimal HTTP intake: webhook, OAuth callback and operator endpoints
use crate::accounts::{AccountRegistry, AccountUpdate, NewAccount};
use crate::broadcast::{Broadcaster, OutboundEvent};
use crate::domain::errors::{AccountError, AppError, AppResult, IntakeError};
use crate::domain::instruments::InstrumentBook;
use crate::domain::models::Token;
use crate::exchange::kite;
use crate::persistence::history::HistoryArchive;
use crate::signals;
use crate::trading::manager::StateMachineManager;
use chrono::Local;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use url::form_urlencoded;

/// Shared handles the request handlers work with.
pub struct AppState {
    pub manager: Arc<StateMachineManager>,
    pub registry: Arc<AccountRegistry>,
    pub archive: HistoryArchive,
    pub book: Arc<InstrumentBook>,
    pub broadcaster: Broadcaster,
}

pub async fn serve<F>(state: Arc<AppState>, addr: SocketAddr, shutdown: F) -> AppResult<()>
where
    F: Future<Output = ()>,
{
    let make_svc = make_service_fn(move |_| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(handle(state, req).await) }
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .map_err(|e| AppError::Network(format!("Failed to bind {}: {}", addr, e)))?;
    log::info!("[Server] Listening on http://{}", addr);
    server
        .serve(make_svc)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| AppError::Network(e.to_string()))
}

/// Route one request.
pub async fn handle(state: Arc<AppState>, req: Request<Body>) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or_default().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match (&method, segments.as_slice()) {
        (&Method::POST, ["webhook"]) => webhook(&state, req).await,
        (&Method::GET, ["zerodha", "callback"]) => zerodha_callback(&state, &query).await,
        (&Method::GET, ["api", "health"]) => json_response(
            StatusCode::OK,
            &json!({ "status": "ok", "instrumentCount": state.book.len() }),
        ),
        (&Method::GET, ["api", "instruments"]) => json_response(StatusCode::OK, state.book.all()),
        (&Method::GET, ["api", "history"]) => match state.archive.list_dates().await {
            Ok(dates) => json_response(StatusCode::OK, &dates),
            Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        },
        (&Method::POST, ["api", "history", "save"]) => {
            match state.archive.archive(Local::now().date_naive(), &state.manager).await {
                Ok(day) => json_response(StatusCode::OK, &json!({ "saved": true, "date": day.date })),
                Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
            }
        }
        (&Method::GET, ["api", "history", date]) => match state.archive.get_by_date(date).await {
            Ok(Some(day)) => json_response(StatusCode::OK, &day),
            Ok(None) => error_response(StatusCode::NOT_FOUND, "Day not found"),
            Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        },
        (&Method::GET, ["api", "accounts"]) => {
            json_response(StatusCode::OK, &state.registry.accounts().await)
        }
        (&Method::POST, ["api", "accounts"]) => match read_json::<NewAccount>(req).await {
            Ok(new) => account_result(state.registry.add_account(new).await),
            Err(resp) => resp,
        },
        (&Method::GET, ["api", "accounts", "login-urls"]) => login_urls(&state).await,
        (&Method::POST, ["api", "accounts", "reload"]) => {
            let count = state.registry.reload().await;
            json_response(StatusCode::OK, &json!({ "reloaded": true, "accountCount": count }))
        }
        (&Method::PUT, ["api", "accounts", id]) => {
            let id = id.to_string();
            match read_json::<AccountUpdate>(req).await {
                Ok(update) => account_result(state.registry.update_account(&id, update).await),
                Err(resp) => resp,
            }
        }
        (&Method::DELETE, ["api", "accounts", id]) => match state.registry.delete_account(id).await {
            Ok(()) => json_response(StatusCode::OK, &json!({ "deleted": true, "id": id })),
            Err(e) => account_error(e),
        },
        (&Method::POST, ["api", "live", token, mode]) => set_live(&state, token, mode).await,
        (&Method::POST, ["api", "reset", "exchange", exchanges]) => {
            reset_exchange(&state, exchanges).await
        }
        _ => error_response(StatusCode::NOT_FOUND, "Not found"),
    }
}

async fn webhook(state: &AppState, req: Request<Body>) -> Response<Body> {
    let body = match hyper::body::to_bytes(req.into_body()).await {
        Ok(body) => body,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
    };

    let parsed = signals::parse_payload(&body);
    let signal = match signals::resolve(parsed, &state.book) {
        Ok(signal) => signal,
        Err(e) => {
            log::warn!("[Webhook] Rejected: {}", e);
            let symbol = match &e {
                IntakeError::UnknownSymbol(symbol) => Some(symbol.clone()),
                IntakeError::MissingSymbol => None,
            };
            return json_response(
                StatusCode::BAD_REQUEST,
                &json!({ "error": "Unknown symbol", "symbol": symbol }),
            );
        }
    };

    log::info!(
        "[Webhook] {:?} {} stoppx={:?}",
        signal.intent,
        signal.symbol,
        signal.stoppx
    );
    let token = signal.token;
    let snapshot = state.manager.handle_signal(token, signal.clone()).await;

    state.broadcaster.send(OutboundEvent::Signal(signal.clone()));
    if let Some(snapshot) = &snapshot {
        state.broadcaster.send(OutboundEvent::Fsm(snapshot.clone()));
    }
    if let Some(signals) = state.manager.signals(token).await {
        state.broadcaster.send(OutboundEvent::Signals { token, signals });
    }

    json_response(
        StatusCode::OK,
        &json!({ "status": "ok", "received": signal, "fsm": snapshot }),
    )
}

async fn zerodha_callback(state: &AppState, query: &str) -> Response<Body> {
    let params: HashMap<String, String> = form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    let request_token = params.get("request_token").map(String::as_str).unwrap_or_default();
    let api_key = params.get("api_key").map(String::as_str).unwrap_or_default();

    if request_token.is_empty() {
        return text_response(StatusCode::BAD_REQUEST, "Error: missing request_token");
    }
    if api_key.is_empty() {
        return text_response(StatusCode::BAD_REQUEST, "Error: missing api_key");
    }

    match state.registry.complete_login(api_key, request_token).await {
        Ok(account) => {
            log::info!("[Callback] Token updated for {}", account.name);
            text_response(
                StatusCode::OK,
                &format!("Access token updated for {}", account.name),
            )
        }
        Err(e) => {
            log::error!("[Callback] Login failed for {}: {}", api_key, e);
            text_response(account_status(&e), &format!("Error: {}", e))
        }
    }
}

async fn login_urls(state: &AppState) -> Response<Body> {
    let accounts: Vec<_> = state
        .registry
        .accounts()
        .await
        .into_iter()
        .map(|a| {
            json!({
                "id": a.id,
                "name": a.name,
                "loginUrl": (!a.api_key.is_empty()).then(|| kite::login_url(&a.api_key)),
                "hasApiKey": !a.api_key.is_empty(),
            })
        })
        .collect();
    json_response(StatusCode::OK, &json!({ "accounts": accounts }))
}

async fn set_live(state: &AppState, token: &str, mode: &str) -> Response<Body> {
    let enabled = match mode {
        "on" => true,
        "off" => false,
        _ => return error_response(StatusCode::NOT_FOUND, "Not found"),
    };
    let Ok(token) = token.parse::<Token>() else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid token");
    };

    match state.manager.set_live(token, enabled).await {
        Some(snapshot) => {
            log::info!("[Server] Live {} for {}", mode, snapshot.symbol);
            state.broadcaster.send(OutboundEvent::Fsm(snapshot.clone()));
            json_response(StatusCode::OK, &snapshot)
        }
        None => error_response(StatusCode::NOT_FOUND, "Unknown instrument"),
    }
}

async fn reset_exchange(state: &AppState, exchanges: &str) -> Response<Body> {
    let exchanges: Vec<&str> = exchanges
        .split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .collect();
    let count = state.manager.reset_by_exchange(&exchanges).await;

    for instrument in state.book.all() {
        if !exchanges.iter().any(|e| e.eq_ignore_ascii_case(&instrument.exchange)) {
            continue;
        }
        if let Some(snapshot) = state.manager.snapshot(instrument.token).await {
            state.broadcaster.send(OutboundEvent::Fsm(snapshot));
        }
    }
    json_response(
        StatusCode::OK,
        &json!({ "reset": count, "exchanges": exchanges }),
    )
}

async fn read_json<T: DeserializeOwned>(req: Request<Body>) -> Result<T, Response<Body>> {
    let body = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, &e.to_string()))?;
    serde_json::from_slice(&body)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, &format!("Invalid JSON: {}", e)))
}

fn account_status(err: &AccountError) -> StatusCode {
    match err {
        AccountError::NotFound(_) | AccountError::ApiKeyNotFound(_) => StatusCode::NOT_FOUND,
        AccountError::MissingApiSecret(_) => StatusCode::BAD_REQUEST,
        AccountError::TokenExchange(_) => StatusCode::BAD_GATEWAY,
        AccountError::Persist(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn account_error(err: AccountError) -> Response<Body> {
    error_response(account_status(&err), &err.to_string())
}

fn account_result<T: Serialize>(result: Result<T, AccountError>) -> Response<Body> {
    match result {
        Ok(value) => json_response(StatusCode::OK, &value),
        Err(e) => account_error(e),
    }
}

fn json_response<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(bytes) => {
            let mut response = Response::new(Body::from(bytes));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    json_response(status, &json!({ "error": message }))
}

fn text_response(status: StatusCode, message: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(message.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
