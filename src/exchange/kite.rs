// src/exchange/kite.rs
use crate::domain::errors::{ExchangeError, ExchangeResult};
use crate::domain::models::OrderParams;
use crate::exchange::client::{BrokerConnector, OrderExecutor, SessionExchanger};
use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::{Body, Client, Method, Request, StatusCode};
use hyper_tls::HttpsConnector;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use url::form_urlencoded;

pub const KITE_API_URL: &str = "https://api.kite.trade";
const KITE_LOGIN_URL: &str = "https://kite.zerodha.com/connect/login";

/// Login page an operator opens to start the OAuth flow for `api_key`
pub fn login_url(api_key: &str) -> String {
    format!("{}?v=3&api_key={}", KITE_LOGIN_URL, api_key)
}

/// `sha256(api_key + request_token + api_secret)` as lowercase hex
pub fn session_checksum(api_key: &str, request_token: &str, api_secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hasher.update(request_token.as_bytes());
    hasher.update(api_secret.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Deserialize)]
struct Envelope {
    status: String,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error_type: Option<String>,
}

/// Unwrap the `{status, data}` envelope every Kite endpoint returns.
fn parse_envelope(status: StatusCode, body: &[u8]) -> ExchangeResult<Value> {
    let envelope: Envelope = serde_json::from_slice(body).map_err(|e| {
        ExchangeError::Api(format!("Unexpected response ({}): {}", status, e))
    })?;

    if envelope.status == "success" {
        return Ok(envelope.data.unwrap_or(Value::Null));
    }

    let message = envelope
        .message
        .unwrap_or_else(|| format!("Request failed with status {}", status));
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ExchangeError::RateLimit(message));
    }
    Err(match envelope.error_type.as_deref() {
        Some("TokenException") | Some("PermissionException") => {
            ExchangeError::Authentication(message)
        }
        Some("NetworkException") => ExchangeError::Connection(message),
        Some("OrderException") | Some("InputException") | Some("MarginException") => {
            ExchangeError::Order(message)
        }
        _ => ExchangeError::Api(message),
    })
}

fn order_form(params: &OrderParams) -> String {
    form_urlencoded::Serializer::new(String::new())
        .append_pair("tradingsymbol", &params.tradingsymbol)
        .append_pair("exchange", &params.exchange)
        .append_pair("transaction_type", params.side.as_str())
        .append_pair("quantity", &params.quantity.to_string())
        .append_pair("product", params.product)
        .append_pair("order_type", params.order_type)
        .append_pair("validity", params.validity)
        .finish()
}

/// Shared HTTPS transport for the Kite REST API
pub struct KiteHttp {
    client: Client<HttpsConnector<HttpConnector>>,
    base_url: String,
    timeout: Duration,
}

impl KiteHttp {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let https = HttpsConnector::new();
        Self {
            client: Client::builder().build::<_, Body>(https),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    async fn post_form(
        &self,
        path: &str,
        authorization: Option<String>,
        form: String,
    ) -> ExchangeResult<Value> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(format!("{}{}", self.base_url, path))
            .header("X-Kite-Version", "3")
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded");
        if let Some(auth) = authorization {
            builder = builder.header(AUTHORIZATION, auth);
        }
        let request = builder
            .body(Body::from(form))
            .map_err(|e| ExchangeError::Request(e.to_string()))?;

        let exchange = async {
            let response = self.client.request(request).await?;
            let status = response.status();
            let body = hyper::body::to_bytes(response.into_body()).await?;
            parse_envelope(status, &body)
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| ExchangeError::Timeout(self.timeout.as_secs()))?
    }
}

/// Order placement for one account
pub struct KiteOrderExecutor {
    http: Arc<KiteHttp>,
    api_key: String,
    access_token: String,
}

#[async_trait]
impl OrderExecutor for KiteOrderExecutor {
    async fn place_order(&self, params: &OrderParams) -> ExchangeResult<String> {
        let auth = format!("token {}:{}", self.api_key, self.access_token);
        let data = self
            .http
            .post_form("/orders/regular", Some(auth), order_form(params))
            .await?;

        data.get("order_id")
            .and_then(|id| match id {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .ok_or_else(|| ExchangeError::Api("Order response without order_id".to_string()))
    }
}

/// Builds Kite executors over one shared transport
pub struct KiteConnector {
    http: Arc<KiteHttp>,
}

impl KiteConnector {
    pub fn new(http: Arc<KiteHttp>) -> Self {
        Self { http }
    }
}

impl BrokerConnector for KiteConnector {
    fn connect(&self, api_key: &str, access_token: &str) -> ExchangeResult<Arc<dyn OrderExecutor>> {
        if api_key.is_empty() || access_token.is_empty() {
            return Err(ExchangeError::Authentication(
                "API key and access token are required".to_string(),
            ));
        }
        Ok(Arc::new(KiteOrderExecutor {
            http: self.http.clone(),
            api_key: api_key.to_string(),
            access_token: access_token.to_string(),
        }))
    }
}

#[async_trait]
impl SessionExchanger for KiteHttp {
    async fn generate_session(
        &self,
        api_key: &str,
        request_token: &str,
        api_secret: &str,
    ) -> ExchangeResult<String> {
        let form = form_urlencoded::Serializer::new(String::new())
            .append_pair("api_key", api_key)
            .append_pair("request_token", request_token)
            .append_pair("checksum", &session_checksum(api_key, request_token, api_secret))
            .finish();

        let data = self.post_form("/session/token", None, form).await?;
        data.get("access_token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ExchangeError::Authentication("Session response without access_token".to_string()))
    }
}
