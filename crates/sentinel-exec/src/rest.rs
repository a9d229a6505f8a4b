//! HTTP gateway implementing the broker, quote and wallet collaborators.
//!
//! Endpoints, relative to `gateway.base_url`:
//!
//! | Call | Request | Response |
//! |------|---------|----------|
//! | trade | `POST /trade/execute` with a [`TradeRequest`] body | `{"txHash"\|"hash"\|"signature", "price", "gasCost"}` |
//! | quote | `GET /price/{network}/{token}` | `{"price": 1.23}` |
//! | balance | `GET /wallets/{wallet}/balance?network=..&token=..` | `{"balance": 10.5}` |
//! | approval | `POST /wallets/approval` with `{tokenAddress, walletAddress, amount}` | `{"approved": true}` |
//!
//! Numbers may arrive as JSON numbers or strings.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Url;
use sentinel_core::config::GatewayConfig;
use sentinel_core::types::Settlement;
use sentinel_feed::json_parser::parse_str_f64;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::{Broker, PriceQuote, TradeRequest, Wallets};

const API_KEY_HEADER: &str = "X-API-Key";

pub struct RestGateway {
    http: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
}

impl RestGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url).with_context(|| format!("invalid gateway url '{}'", config.base_url))?;
        if base_url.cannot_be_a_base() {
            return Err(anyhow!("gateway url '{}' cannot be a base", config.base_url));
        }
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("failed to build HTTP client")?;
        info!("[gateway] using {base_url} (timeout {:?})", config.timeout);
        Ok(Self { http, base_url, api_key: config.api_key.clone() })
    }

    /// `base_url` with `segments` appended, each percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header(API_KEY_HEADER, key),
            None => req,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder, what: &str) -> Result<Value> {
        let resp = self
            .authorized(req)
            .send()
            .await
            .with_context(|| format!("{what} request failed"))?;
        let body: Value = resp
            .error_for_status()
            .with_context(|| format!("{what} HTTP error"))?
            .json()
            .await
            .with_context(|| format!("{what} response is not JSON"))?;
        debug!("[gateway] {what} -> {body}");
        Ok(body)
    }
}

#[async_trait]
impl Broker for RestGateway {
    async fn execute_trade(&self, request: &TradeRequest) -> Result<Settlement> {
        let url = self.endpoint(&["trade", "execute"]);
        let body = self.send(self.http.post(url).json(request), "trade").await?;
        parse_settlement(&body)
    }
}

#[async_trait]
impl PriceQuote for RestGateway {
    async fn current_price(&self, network: &str, token_address: &str) -> Result<f64> {
        let url = self.endpoint(&["price", network, token_address]);
        let body = self.send(self.http.get(url), "price").await?;
        number(&body, "price")
    }
}

#[async_trait]
impl Wallets for RestGateway {
    async fn balance(&self, network: &str, token_address: &str, wallet_address: &str) -> Result<f64> {
        let url = self.endpoint(&["wallets", wallet_address, "balance"]);
        let req = self.http.get(url).query(&[("network", network), ("token", token_address)]);
        let body = self.send(req, "balance").await?;
        number(&body, "balance")
    }

    async fn check_and_request_approval(&self, token_address: &str, wallet_address: &str, amount: f64) -> Result<bool> {
        let url = self.endpoint(&["wallets", "approval"]);
        let payload = json!({ "tokenAddress": token_address, "walletAddress": wallet_address, "amount": amount });
        let body = self.send(self.http.post(url).json(&payload), "approval").await?;
        body.get("approved")
            .and_then(Value::as_bool)
            .ok_or_else(|| anyhow!("approval response missing 'approved': {body}"))
    }
}

fn number(body: &Value, field: &str) -> Result<f64> {
    parse_str_f64(body.get(field)).ok_or_else(|| anyhow!("response missing numeric '{field}': {body}"))
}

fn parse_settlement(body: &Value) -> Result<Settlement> {
    let tx_hash = ["txHash", "tx_hash", "hash", "signature"]
        .iter()
        .find_map(|k| body.get(*k).and_then(Value::as_str))
        .ok_or_else(|| anyhow!("trade response missing transaction hash: {body}"))?;
    let gas_cost = parse_str_f64(body.get("gasCost").or_else(|| body.get("gas_cost"))).unwrap_or(0.0);
    Ok(Settlement { tx_hash: tx_hash.to_string(), price: number(body, "price")?, gas_cost })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use sentinel_core::types::TradeAction;

    fn gateway(base: &str) -> RestGateway {
        RestGateway::new(&GatewayConfig { base_url: base.into(), api_key: None, timeout: Duration::from_secs(1) }).unwrap()
    }

    #[test]
    fn endpoints_append_encoded_segments() {
        let gw = gateway("http://127.0.0.1:3000/api/");
        assert_eq!(gw.endpoint(&["price", "solana", "So11"]).as_str(), "http://127.0.0.1:3000/api/price/solana/So11");
        assert_eq!(gw.endpoint(&["wallets", "a/b", "balance"]).as_str(), "http://127.0.0.1:3000/api/wallets/a%2Fb/balance");
    }

    #[test]
    fn rejects_bad_base_url() {
        let cfg = GatewayConfig { base_url: "not a url".into(), ..GatewayConfig::default() };
        assert!(RestGateway::new(&cfg).is_err());
    }

    #[test]
    fn settlement_accepts_signature_and_string_numbers() {
        let s = parse_settlement(&json!({"signature": "5xSig", "price": "0.45", "gasCost": 0.0002})).unwrap();
        assert_eq!(s.tx_hash, "5xSig");
        assert_eq!(s.price, 0.45);
        assert_eq!(s.gas_cost, 0.0002);

        let s = parse_settlement(&json!({"hash": "0xabc", "price": 2})).unwrap();
        assert_eq!(s.gas_cost, 0.0);
        assert!(parse_settlement(&json!({"price": 1})).is_err());
    }

    #[test]
    fn trade_request_body_is_camel_case() {
        let req = TradeRequest {
            network: "solana".into(),
            action: TradeAction::Buy,
            token_address: "T".into(),
            amount: 5.0,
            wallet_address: "w".into(),
            options: crate::TradeOptions { expected_price: Some(0.45), client_ref: Some("a1".into()) },
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["tokenAddress"], "T");
        assert_eq!(v["walletAddress"], "w");
        assert_eq!(v["action"], "buy");
        assert_eq!(v["options"]["expectedPrice"], 0.45);
    }
}
