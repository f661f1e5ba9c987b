// src/domain/instruments.rs
use crate::domain::models::{Instrument, Token};

/// Immutable set of instruments loaded at startup.
#[derive(Debug, Clone, Default)]
pub struct InstrumentBook {
    instruments: Vec<Instrument>,
}

impl InstrumentBook {
    pub fn new(instruments: Vec<Instrument>) -> Self {
        Self { instruments }
    }

    /// Parse the `INSTRUMENTS_DATA` JSON array. A missing or malformed value
    /// yields an empty book; the process keeps running without instruments.
    pub fn from_json(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            log::warn!("[Instruments] No INSTRUMENTS_DATA configured, using empty list");
            return Self::default();
        };

        match serde_json::from_str::<Vec<Instrument>>(raw) {
            Ok(instruments) => {
                log::info!("[Instruments] Loaded {} instruments", instruments.len());
                Self::new(instruments)
            }
            Err(e) => {
                log::error!("[Instruments] Failed to parse INSTRUMENTS_DATA: {}", e);
                Self::default()
            }
        }
    }

    pub fn all(&self) -> &[Instrument] {
        &self.instruments
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }

    pub fn find_by_token(&self, token: Token) -> Option<&Instrument> {
        self.instruments.iter().find(|i| i.token == token)
    }

    /// Lookup by the symbol the signal source uses.
    pub fn find_by_tradingview(&self, symbol: &str) -> Option<&Instrument> {
        self.instruments.iter().find(|i| i.tradingview == symbol)
    }

    pub fn tokens(&self) -> Vec<Token> {
        self.instruments.iter().map(|i| i.token).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_instrument_payload() {
        let raw = r#"[
            {"token": 256265, "exchange": "NFO", "zerodha": "NIFTYFUT", "tradingview": "NIFTY1!", "lot": 75},
            {"token": 1, "exchange": "BSE", "symbol": "SENSEXFUT", "lot": 20}
        ]"#;
        let book = InstrumentBook::from_json(Some(raw));

        assert_eq!(book.len(), 2);
        assert_eq!(book.find_by_tradingview("NIFTY1!").map(|i| i.token), Some(256265));
        assert_eq!(book.find_by_token(1).map(|i| i.symbol.as_str()), Some("SENSEXFUT"));
        assert_eq!(book.tokens(), vec![256265, 1]);
    }

    #[test]
    fn malformed_payload_yields_empty_book() {
        assert!(InstrumentBook::from_json(Some("{not json")).is_empty());
        assert!(InstrumentBook::from_json(None).is_empty());
    }
}
