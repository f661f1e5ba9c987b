// src/domain/models.rs
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Instrument token as assigned by the broker.
pub type Token = u32;

/// Static reference data for one tradable instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    pub token: Token,
    pub exchange: String,
    /// Broker trading symbol, e.g. `NIFTY24DECFUT`
    #[serde(alias = "zerodha")]
    pub symbol: String,
    /// Symbol used by the signal source
    #[serde(default)]
    pub tradingview: String,
    pub lot: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of a single order placement on one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderParams {
    pub exchange: String,
    pub tradingsymbol: String,
    pub side: OrderSide,
    pub quantity: u32,
    pub product: &'static str,
    pub order_type: &'static str,
    pub validity: &'static str,
}

impl OrderParams {
    /// Intraday market order for one lot of `instrument`.
    pub fn market(instrument: &Instrument, side: OrderSide) -> Self {
        Self {
            exchange: instrument.exchange.clone(),
            tradingsymbol: instrument.symbol.clone(),
            side,
            quantity: instrument.lot,
            product: "MIS",
            order_type: "MARKET",
            validity: "DAY",
        }
    }
}

/// Price update for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub token: Token,
    pub symbol: String,
    pub ltp: Decimal,
    #[serde(default)]
    pub change: Option<Decimal>,
    #[serde(default)]
    pub volume: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalIntent {
    Buy,
    Sell,
    Unknown,
}

/// Externally generated trade signal, already matched to an instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub intent: SignalIntent,
    #[serde(default)]
    pub stoppx: Option<Decimal>,
    pub token: Token,
    pub timestamp: DateTime<Utc>,
}

impl Signal {
    pub fn buy(instrument: &Instrument, stoppx: Decimal) -> Self {
        Self {
            symbol: instrument.symbol.clone(),
            intent: SignalIntent::Buy,
            stoppx: Some(stoppx),
            token: instrument.token,
            timestamp: Utc::now(),
        }
    }

    pub fn sell(instrument: &Instrument) -> Self {
        Self {
            symbol: instrument.symbol.clone(),
            intent: SignalIntent::Sell,
            stoppx: None,
            token: instrument.token,
            timestamp: Utc::now(),
        }
    }
}
