//! Price feed JSON frames.
//!
//! Outbound:
//! ```json
//! {"op":"subscribe","network":"solana","token":"So111..."}
//! {"op":"unsubscribe","network":"solana","token":"So111..."}
//! ```
//!
//! Inbound tick (numbers may also arrive as strings):
//! ```json
//! {"type":"price","network":"solana","token":"So111...","price":"142.5","volume24h":1250000}
//! ```
//!
//! Heartbeat replies are either the bare text `pong` or `{"type":"pong"}` /
//! `{"op":"pong"}`.

use sentinel_core::types::{FeedKey, PriceTick};
use serde_json::{Value, json};

/// A classified inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Price(PriceTick),
    Pong,
    /// Acks, errors and anything else the engine does not act on.
    Ignored,
}

pub fn subscribe_frame(key: &FeedKey) -> String {
    json!({ "op": "subscribe", "network": key.network, "token": key.token_address }).to_string()
}

pub fn unsubscribe_frame(key: &FeedKey) -> String {
    json!({ "op": "unsubscribe", "network": key.network, "token": key.token_address }).to_string()
}

/// Parse one text frame received on the connection for `key`.
///
/// Ticks naming a different key are ignored; ticks without a key are
/// attributed to the connection's key.
pub fn parse_inbound(text: &str, key: &FeedKey) -> Inbound {
    let text = text.trim();
    if text.eq_ignore_ascii_case("pong") {
        return Inbound::Pong;
    }

    let Ok(v) = serde_json::from_str::<Value>(text) else {
        return Inbound::Ignored;
    };

    let kind = v.get("type").or_else(|| v.get("op")).and_then(Value::as_str).unwrap_or("");
    match kind {
        "pong" => Inbound::Pong,
        "price" | "tick" => parse_tick(&v, key).map_or(Inbound::Ignored, Inbound::Price),
        _ => Inbound::Ignored,
    }
}

fn parse_tick(v: &Value, key: &FeedKey) -> Option<PriceTick> {
    let network = v.get("network").and_then(Value::as_str);
    let token = v.get("token").or_else(|| v.get("tokenAddress")).and_then(Value::as_str);
    if network.is_some_and(|n| n != key.network) || token.is_some_and(|t| t != key.token_address) {
        return None;
    }

    let price = parse_f64_field(v, "price")?;
    if !price.is_finite() || price <= 0.0 {
        return None;
    }
    let volume = parse_f64_field(v, "volume24h").or_else(|| parse_f64_field(v, "volume"));

    let tick = PriceTick::new(key.clone(), price);
    Some(match volume {
        Some(vol) => tick.with_volume(vol),
        None => tick,
    })
}

/// Parse a JSON value (string or number) as `f64`.
#[inline]
pub fn parse_str_f64(v: Option<&Value>) -> Option<f64> {
    let v = v?;
    if let Some(s) = v.as_str() {
        fast_float2::parse(s).ok()
    } else {
        v.as_f64()
    }
}

#[inline]
fn parse_f64_field(v: &Value, field: &str) -> Option<f64> {
    parse_str_f64(v.get(field))
}
