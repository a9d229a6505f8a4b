//! Price alerts and their optional auto-trade action.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::enums::{AlertCondition, TradeAction, WalletType};
use super::market::FeedKey;
use super::order::Settlement;
use crate::error::{EngineError, Result};

/// Stable alert identifier (UUID v4 string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertId(pub String);

impl AlertId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for AlertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AlertId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Trade size: a fixed amount or a share of the live balance at trigger time.
///
/// Parsed from and rendered as `"12.5"` or `"50%"`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AmountSpec {
    Absolute(f64),
    Percent(f64),
}

impl AmountSpec {
    /// Resolve against a balance. Absolute amounts ignore it.
    pub fn resolve(self, balance: f64) -> f64 {
        match self {
            Self::Absolute(v) => v,
            Self::Percent(p) => balance * p / 100.0,
        }
    }

    pub fn needs_balance(self) -> bool {
        matches!(self, Self::Percent(_))
    }
}

impl FromStr for AmountSpec {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (num, pct) = match s.strip_suffix('%') {
            Some(n) => (n.trim(), true),
            None => (s, false),
        };
        let value: f64 = num
            .parse()
            .map_err(|_| EngineError::InvalidSpec(format!("bad amount '{s}'")))?;
        if !value.is_finite() || value <= 0.0 {
            return Err(EngineError::InvalidSpec(format!("amount must be positive, got '{s}'")));
        }
        if pct {
            if value > 100.0 {
                return Err(EngineError::InvalidSpec(format!("percentage above 100: '{s}'")));
            }
            Ok(Self::Percent(value))
        } else {
            Ok(Self::Absolute(value))
        }
    }
}

impl TryFrom<String> for AmountSpec {
    type Error = EngineError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<AmountSpec> for String {
    fn from(a: AmountSpec) -> Self {
        a.to_string()
    }
}

impl fmt::Display for AmountSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absolute(v) => write!(f, "{v}"),
            Self::Percent(p) => write!(f, "{p}%"),
        }
    }
}

/// Trade to run when the alert fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapAction {
    pub enabled: bool,
    pub action: TradeAction,
    pub amount: AmountSpec,
    pub wallet_address: String,
}

/// How a fired alert ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AlertOutcome {
    /// Fired without a trade.
    Notified { price: f64 },
    Settled { price: f64, amount: f64, settlement: Settlement },
    Failed { price: f64, error: String },
    Cancelled,
}

/// Recorded when the alert is deactivated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertExecution {
    pub outcome: AlertOutcome,
    pub at: DateTime<Utc>,
}

impl AlertExecution {
    pub fn new(outcome: AlertOutcome) -> Self {
        Self { outcome, at: Utc::now() }
    }
}

/// A single-shot threshold watch on one token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceAlert {
    pub id: AlertId,
    pub user_id: String,
    pub network: String,
    pub token_address: String,
    pub target_price: f64,
    pub condition: AlertCondition,
    pub is_active: bool,
    pub swap_action: Option<SwapAction>,
    pub wallet_type: WalletType,
    pub pre_approved: bool,
    pub execution_result: Option<AlertExecution>,
    pub created_at: DateTime<Utc>,
}

impl PriceAlert {
    pub fn feed_key(&self) -> FeedKey {
        FeedKey::new(&self.network, &self.token_address)
    }

    /// The swap to run on trigger, if one is configured and enabled.
    pub fn enabled_swap(&self) -> Option<&SwapAction> {
        self.swap_action.as_ref().filter(|s| s.enabled)
    }
}

/// Input to alert creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertSpec {
    pub user_id: String,
    pub network: String,
    pub token_address: String,
    pub target_price: f64,
    pub condition: AlertCondition,
    pub swap_action: Option<SwapAction>,
    #[serde(default)]
    pub wallet_type: WalletType,
    #[serde(default)]
    pub pre_approved: bool,
}

impl AlertSpec {
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("user id", &self.user_id),
            ("network", &self.network),
            ("token address", &self.token_address),
        ] {
            if value.trim().is_empty() {
                return Err(EngineError::InvalidSpec(format!("{field} is required")));
            }
        }
        if !self.target_price.is_finite() || self.target_price <= 0.0 {
            return Err(EngineError::InvalidSpec(format!(
                "target price must be positive, got {}",
                self.target_price
            )));
        }
        if let Some(swap) = self.swap_action.as_ref().filter(|s| s.enabled) {
            if swap.wallet_address.trim().is_empty() {
                return Err(EngineError::InvalidSpec("swap wallet address is required".into()));
            }
        }
        Ok(())
    }

    /// Build the persisted alert (active, not yet fired).
    pub fn into_alert(self) -> PriceAlert {
        PriceAlert {
            id: AlertId::generate(),
            user_id: self.user_id,
            network: self.network,
            token_address: self.token_address,
            target_price: self.target_price,
            condition: self.condition,
            is_active: true,
            swap_action: self.swap_action,
            wallet_type: self.wallet_type,
            pre_approved: self.pre_approved,
            execution_result: None,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_spec_parsing() {
        assert_eq!("50%".parse::<AmountSpec>().unwrap(), AmountSpec::Percent(50.0));
        assert_eq!(" 12.5 ".parse::<AmountSpec>().unwrap(), AmountSpec::Absolute(12.5));
        assert!("150%".parse::<AmountSpec>().is_err());
        assert!("-1".parse::<AmountSpec>().is_err());
        assert!("abc".parse::<AmountSpec>().is_err());
    }

    #[test]
    fn percent_resolves_against_balance() {
        assert_eq!(AmountSpec::Percent(50.0).resolve(10.0), 5.0);
        assert_eq!(AmountSpec::Absolute(3.0).resolve(10.0), 3.0);
    }

    #[test]
    fn amount_serializes_as_string() {
        let json = serde_json::to_string(&AmountSpec::Percent(25.0)).unwrap();
        assert_eq!(json, "\"25%\"");
        let back: AmountSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, AmountSpec::Percent(25.0));
    }

    #[test]
    fn enabled_swap_requires_wallet() {
        let spec = AlertSpec {
            user_id: "u".into(),
            network: "solana".into(),
            token_address: "T".into(),
            target_price: 0.5,
            condition: AlertCondition::Below,
            swap_action: Some(SwapAction {
                enabled: true,
                action: TradeAction::Buy,
                amount: AmountSpec::Percent(50.0),
                wallet_address: String::new(),
            }),
            wallet_type: WalletType::Internal,
            pre_approved: false,
        };
        assert!(spec.validate().is_err());
    }
}
