// src/market_data/ticker.rs
use crate::accounts::PrimaryAccount;
use crate::domain::errors::{ExchangeError, ExchangeResult};
use crate::domain::models::Token;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

pub const KITE_TICKER_URL: &str = "wss://ws.kite.trade";

/// Price update as decoded from the feed, before instrument lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketTick {
    pub token: Token,
    pub ltp: Decimal,
    /// Percent change against the previous close
    pub change: Option<Decimal>,
    pub volume: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Connected,
    Tick(MarketTick),
    Error(String),
    Closed,
}

/// A market-data connection. `run` returns when the connection ends.
#[async_trait]
pub trait MarketFeed: Send + Sync {
    async fn run(
        &self,
        credentials: PrimaryAccount,
        tokens: Vec<Token>,
        events: mpsc::Sender<FeedEvent>,
    ) -> ExchangeResult<()>;
}

/// Kite websocket ticker in full mode.
pub struct KiteTicker {
    base_url: String,
}

impl KiteTicker {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
        }
    }

    fn connect_url(&self, credentials: &PrimaryAccount) -> ExchangeResult<Url> {
        Url::parse_with_params(
            &self.base_url,
            &[
                ("api_key", credentials.api_key.as_str()),
                ("access_token", credentials.access_token.as_str()),
            ],
        )
        .map_err(|e| ExchangeError::Connection(format!("Invalid ticker URL: {}", e)))
    }
}

#[async_trait]
impl MarketFeed for KiteTicker {
    async fn run(
        &self,
        credentials: PrimaryAccount,
        tokens: Vec<Token>,
        events: mpsc::Sender<FeedEvent>,
    ) -> ExchangeResult<()> {
        let url = self.connect_url(&credentials)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ExchangeError::Connection(format!("WebSocket connection failed: {}", e)))?;
        let (mut write, mut read) = ws_stream.split();

        let _ = events.send(FeedEvent::Connected).await;
        log::info!("[Ticker] Connected, subscribing to {} instruments", tokens.len());

        let subscribe = json!({ "a": "subscribe", "v": tokens });
        let mode = json!({ "a": "mode", "v": ["full", tokens] });
        for request in [subscribe, mode] {
            write
                .send(Message::Text(request.to_string()))
                .await
                .map_err(|e| ExchangeError::Connection(format!("Subscribe failed: {}", e)))?;
        }

        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    for tick in parse_packets(&data) {
                        if events.send(FeedEvent::Tick(tick)).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                Ok(Message::Text(txt)) => {
                    if let Some(error) = text_error(&txt) {
                        let _ = events.send(FeedEvent::Error(error)).await;
                    }
                }
                Ok(Message::Close(frame)) => {
                    log::info!("[Ticker] Closed by server: {:?}", frame);
                    break;
                }
                Err(e) => {
                    let message = e.to_string();
                    let _ = events.send(FeedEvent::Error(message.clone())).await;
                    let _ = events.send(FeedEvent::Closed).await;
                    return Err(ExchangeError::Connection(message));
                }
                _ => {}
            }
        }

        let _ = events.send(FeedEvent::Closed).await;
        Ok(())
    }
}

/// Error text from a JSON control message, if it is one.
fn text_error(txt: &str) -> Option<String> {
    let value: Value = serde_json::from_str(txt).ok()?;
    if value.get("type")?.as_str()? != "error" {
        return None;
    }
    Some(
        value
            .get("data")
            .and_then(Value::as_str)
            .unwrap_or("unknown ticker error")
            .to_string(),
    )
}

fn be_i32(data: &[u8], at: usize) -> Option<i32> {
    let bytes: [u8; 4] = data.get(at..at + 4)?.try_into().ok()?;
    Some(i32::from_be_bytes(bytes))
}

fn be_u16(data: &[u8], at: usize) -> Option<u16> {
    let bytes: [u8; 2] = data.get(at..at + 2)?.try_into().ok()?;
    Some(u16::from_be_bytes(bytes))
}

/// Decimal places of the prices in a packet, from the token's segment.
fn price_scale(token: Token) -> u32 {
    match token & 0xff {
        3 => 7, // CDS
        6 => 4, // BCD
        _ => 2,
    }
}

const SEGMENT_INDICES: Token = 9;

/// Decode one binary frame: a packet count followed by length-prefixed packets.
/// Heartbeats and truncated packets yield nothing.
pub fn parse_packets(data: &[u8]) -> Vec<MarketTick> {
    let mut ticks = Vec::new();
    let Some(count) = be_u16(data, 0) else {
        return ticks;
    };

    let mut offset = 2;
    for _ in 0..count {
        let Some(len) = be_u16(data, offset) else {
            break;
        };
        let start = offset + 2;
        let end = start + len as usize;
        let Some(packet) = data.get(start..end) else {
            break;
        };
        if let Some(tick) = parse_packet(packet) {
            ticks.push(tick);
        }
        offset = end;
    }
    ticks
}

fn parse_packet(packet: &[u8]) -> Option<MarketTick> {
    let token = be_i32(packet, 0)? as Token;
    let scale = price_scale(token);
    let price = |at: usize| be_i32(packet, at).map(|v| Decimal::new(v as i64, scale));
    let ltp = price(4)?;

    let (close, volume) = match packet.len() {
        8 => (None, None),
        // index quote / full
        28 | 32 if token & 0xff == SEGMENT_INDICES => (price(20), None),
        // quote / full
        n if n >= 44 => (price(40), be_i32(packet, 16).map(|v| v as u64)),
        _ => (None, None),
    };

    let change = close
        .filter(|c| !c.is_zero())
        .map(|c| ((ltp - c) * Decimal::ONE_HUNDRED / c).round_dp(2));

    Some(MarketTick {
        token,
        ltp,
        change,
        volume,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn frame(packets: &[Vec<u8>]) -> Vec<u8> {
        let mut data = (packets.len() as u16).to_be_bytes().to_vec();
        for p in packets {
            data.extend((p.len() as u16).to_be_bytes());
            data.extend(p);
        }
        data
    }

    fn packet(len: usize, fields: &[(usize, i32)]) -> Vec<u8> {
        let mut p = vec![0u8; len];
        for (at, v) in fields {
            p[*at..*at + 4].copy_from_slice(&v.to_be_bytes());
        }
        p
    }

    #[test]
    fn ltp_packet() {
        // NFO token (segment 2)
        let token = (1000 << 8) | 2;
        let data = frame(&[packet(8, &[(0, token), (4, 2415050)])]);
        let ticks = parse_packets(&data);
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].token, token as Token);
        assert_eq!(ticks[0].ltp, dec!(24150.50));
        assert_eq!(ticks[0].change, None);
    }

    #[test]
    fn full_packet_carries_volume_and_change() {
        let token = (2000 << 8) | 2;
        let full = packet(184, &[(0, token), (4, 11000), (16, 1500), (40, 10000)]);
        let index = packet(28, &[(0, (256265 << 8) | 9), (4, 2200000), (20, 2000000)]);
        let ticks = parse_packets(&frame(&[full, index]));

        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].ltp, dec!(110));
        assert_eq!(ticks[0].volume, Some(1500));
        assert_eq!(ticks[0].change, Some(dec!(10)));
        assert_eq!(ticks[1].change, Some(dec!(10)));
        assert_eq!(ticks[1].volume, None);
    }

    #[test]
    fn heartbeat_and_truncated_frames() {
        assert!(parse_packets(&[0]).is_empty());
        let mut data = frame(&[packet(8, &[(0, 5), (4, 100)])]);
        data.truncate(data.len() - 2);
        assert!(parse_packets(&data).is_empty());
    }

    #[test]
    fn error_messages_are_surfaced() {
        assert_eq!(
            text_error(r#"{"type":"error","data":"Invalid access token"}"#),
            Some("Invalid access token".to_string())
        );
        assert_eq!(text_error(r#"{"type":"order","data":{}}"#), None);
        assert_eq!(text_error("noise"), None);
    }
}
