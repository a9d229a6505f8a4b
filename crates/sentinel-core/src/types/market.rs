//! Feed keys and price ticks.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Identifies one live price stream: a token on a network.
///
/// Rendered as `network:tokenAddress`. Exactly one feed connection exists
/// per key no matter how many orders or alerts watch it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeedKey {
    pub network: String,
    pub token_address: String,
}

impl FeedKey {
    pub fn new(network: impl Into<String>, token_address: impl Into<String>) -> Self {
        Self { network: network.into(), token_address: token_address.into() }
    }
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network, self.token_address)
    }
}

impl FromStr for FeedKey {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((network, token)) if !network.is_empty() && !token.is_empty() => {
                Ok(Self::new(network, token))
            }
            _ => Err(EngineError::InvalidSpec(format!("bad feed key '{s}'"))),
        }
    }
}

/// A single price update for one feed key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub key: FeedKey,
    pub price: f64,
    /// Rolling 24h volume, when the feed reports it.
    pub volume_24h: Option<f64>,
    pub received_at: DateTime<Utc>,
}

impl PriceTick {
    pub fn new(key: FeedKey, price: f64) -> Self {
        Self { key, price, volume_24h: None, received_at: Utc::now() }
    }

    #[must_use]
    pub fn with_volume(mut self, volume: f64) -> Self {
        self.volume_24h = Some(volume);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_key_display_and_parse() {
        let key = FeedKey::new("solana", "So11111111111111111111111111111111111111112");
        let s = key.to_string();
        assert_eq!(s, "solana:So11111111111111111111111111111111111111112");
        assert_eq!(s.parse::<FeedKey>().unwrap(), key);
        assert!("solana".parse::<FeedKey>().is_err());
        assert!(":abc".parse::<FeedKey>().is_err());
    }
}
