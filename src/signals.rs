// src/signals.rs
// Inbound webhook payloads -> Signal
use crate::domain::errors::{IntakeError, IntakeResult};
use crate::domain::instruments::InstrumentBook;
use crate::domain::models::{Signal, SignalIntent};
use chrono::Utc;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::str::FromStr;

/// Payload fields before the symbol is matched to an instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSignal {
    pub symbol: Option<String>,
    pub intent: SignalIntent,
    pub stoppx: Option<Decimal>,
}

/// Accepts a JSON object or the plain-text alert format
/// (`... Entry ... stopPx=101.5 sym=NIFTY1!`).
pub fn parse_payload(body: &[u8]) -> ParsedSignal {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => parse_json(&map),
        _ => parse_text(&String::from_utf8_lossy(body)),
    }
}

/// Match the payload's symbol against the signal-source symbols of the book.
pub fn resolve(parsed: ParsedSignal, book: &InstrumentBook) -> IntakeResult<Signal> {
    let symbol = parsed.symbol.ok_or(IntakeError::MissingSymbol)?;
    let instrument = book
        .find_by_tradingview(&symbol)
        .ok_or_else(|| IntakeError::UnknownSymbol(symbol.clone()))?;

    Ok(Signal {
        symbol: instrument.symbol.clone(),
        intent: parsed.intent,
        stoppx: parsed.stoppx,
        token: instrument.token,
        timestamp: Utc::now(),
    })
}

fn parse_json(map: &Map<String, Value>) -> ParsedSignal {
    let text = |keys: &[&str]| {
        keys.iter()
            .filter_map(|k| map.get(*k))
            .filter_map(Value::as_str)
            .map(str::trim)
            .find(|s| !s.is_empty())
            .map(str::to_string)
    };

    let stoppx = ["stoppx", "stopPx", "price"]
        .iter()
        .filter_map(|k| map.get(*k))
        .find_map(|v| match v {
            Value::Number(n) => n.as_f64().and_then(Decimal::from_f64),
            Value::String(s) => Decimal::from_str(s.trim()).ok(),
            _ => None,
        });

    ParsedSignal {
        symbol: text(&["symbol", "sym"]),
        intent: text(&["intent", "side"])
            .map(|s| parse_intent(&s))
            .unwrap_or(SignalIntent::Unknown),
        stoppx: stoppx.filter(|p| !p.is_zero()),
    }
}

fn parse_intent(raw: &str) -> SignalIntent {
    match raw.to_ascii_uppercase().as_str() {
        "BUY" => SignalIntent::Buy,
        "SELL" => SignalIntent::Sell,
        _ => SignalIntent::Unknown,
    }
}

fn parse_text(text: &str) -> ParsedSignal {
    let intent = if text.contains("Entry") {
        SignalIntent::Buy
    } else if text.contains("Exit") {
        SignalIntent::Sell
    } else {
        SignalIntent::Unknown
    };

    let stoppx = value_after(text, "stoppx")
        .map(|v| {
            let end = v
                .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                .unwrap_or(v.len());
            &v[..end]
        })
        .and_then(|v| Decimal::from_str(v).ok())
        .filter(|p| !p.is_zero());

    let symbol = value_after(text, "sym")
        .map(|v| v.split_whitespace().next().unwrap_or_default())
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    ParsedSignal {
        symbol,
        intent,
        stoppx,
    }
}

/// Text following `key\s*=\s*`, matching the key case-insensitively.
fn value_after<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    let lowered = text.to_ascii_lowercase();
    let mut from = 0;
    while let Some(pos) = lowered[from..].find(key) {
        let after_key = from + pos + key.len();
        let rest = text[after_key..].trim_start();
        if let Some(value) = rest.strip_prefix('=') {
            return Some(value.trim_start());
        }
        from = after_key;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Instrument;
    use rust_decimal_macros::dec;

    fn book() -> InstrumentBook {
        InstrumentBook::new(vec![Instrument {
            token: 256265,
            exchange: "NFO".to_string(),
            symbol: "NIFTY24DECFUT".to_string(),
            tradingview: "NIFTY1!".to_string(),
            lot: 75,
        }])
    }

    #[test]
    fn json_payload_with_aliases() {
        let parsed = parse_payload(br#"{"sym": "NIFTY1!", "side": "buy", "stopPx": "24150.5"}"#);
        assert_eq!(parsed.symbol.as_deref(), Some("NIFTY1!"));
        assert_eq!(parsed.intent, SignalIntent::Buy);
        assert_eq!(parsed.stoppx, Some(dec!(24150.5)));

        let parsed = parse_payload(br#"{"symbol": "NIFTY1!", "intent": "SELL", "price": 0}"#);
        assert_eq!(parsed.intent, SignalIntent::Sell);
        assert_eq!(parsed.stoppx, None);
    }

    #[test]
    fn text_alert() {
        let parsed = parse_payload(b"Long Entry triggered stopPx = 24100.25 sym=NIFTY1! tf=1m");
        assert_eq!(parsed.intent, SignalIntent::Buy);
        assert_eq!(parsed.stoppx, Some(dec!(24100.25)));
        assert_eq!(parsed.symbol.as_deref(), Some("NIFTY1!"));

        let parsed = parse_payload(b"Exit symbol: x SYM=NIFTY1!");
        assert_eq!(parsed.intent, SignalIntent::Sell);
        assert_eq!(parsed.symbol.as_deref(), Some("NIFTY1!"));
        assert_eq!(parsed.stoppx, None);
    }

    #[test]
    fn resolve_matches_signal_source_symbol() {
        let signal = resolve(parse_payload(br#"{"symbol":"NIFTY1!","intent":"BUY","stoppx":100}"#), &book()).unwrap();
        assert_eq!(signal.token, 256265);
        assert_eq!(signal.symbol, "NIFTY24DECFUT");
        assert_eq!(signal.stoppx, Some(dec!(100)));
    }

    #[test]
    fn unknown_or_missing_symbol_is_rejected() {
        let unknown = resolve(parse_payload(br#"{"symbol":"BANKNIFTY1!"}"#), &book());
        assert_eq!(unknown, Err(IntakeError::UnknownSymbol("BANKNIFTY1!".to_string())));

        let missing = resolve(parse_payload(b"Entry stopPx=10"), &book());
        assert_eq!(missing, Err(IntakeError::MissingSymbol));
    }
}
