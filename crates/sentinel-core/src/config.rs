//! Configuration parsing for the execution engine.
//!
//! Everything is read from one JSON file. Every field is optional in the file;
//! the `*_config()` accessors resolve them into typed, `Duration`-based structs
//! with the engine defaults filled in.
//!
//! # Example config
//!
//! ```json
//! {
//!   "engine": { "module_name": "sentinel", "log_path": "/var/log/sentinel", "store_path": "data/store.json" },
//!   "breaker": { "failure_threshold": 5, "reset_timeout_ms": 30000,
//!                "overrides": { "broker": { "max_queue_size": 20 } } },
//!   "feed": { "url": "wss://prices.example.com/ws", "max_reconnect_attempts": 10 },
//!   "scheduler": { "coalesce_window_ms": 1000, "execution_retries": 3 },
//!   "gateway": { "base_url": "https://api.example.com", "api_key": "..." }
//! }
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::breaker::BreakerConfig;
use crate::error::{EngineError, Result};
use crate::logging::LogFormat;

/// Top-level application config, deserialized from a JSON file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineMeta,
    #[serde(default)]
    pub breaker: BreakerSection,
    #[serde(default)]
    pub feed: FeedSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub gateway: GatewaySection,
}

/// Process metadata block.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineMeta {
    pub module_name: Option<String>,
    pub log_path: Option<String>,
    pub log_format: Option<LogFormat>,
    /// JSON store file. Defaults to `sentinel-store.json`.
    pub store_path: Option<String>,
}

impl EngineMeta {
    pub fn module_name(&self) -> String {
        self.module_name.clone().unwrap_or_else(|| "sentinel".to_string())
    }

    pub fn store_path(&self) -> String {
        self.store_path.clone().unwrap_or_else(|| "sentinel-store.json".to_string())
    }
}

/// Breaker tunables as they appear in the file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BreakerFields {
    pub failure_threshold: Option<u32>,
    pub reset_timeout_ms: Option<u64>,
    pub half_open_max_retries: Option<u32>,
    pub max_queue_size: Option<usize>,
}

impl BreakerFields {
    /// Resolve on top of `base`.
    pub fn resolve(&self, base: &BreakerConfig) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold.unwrap_or(base.failure_threshold),
            reset_timeout: self.reset_timeout_ms.map(Duration::from_millis).unwrap_or(base.reset_timeout),
            half_open_max_retries: self.half_open_max_retries.unwrap_or(base.half_open_max_retries),
            max_queue_size: self.max_queue_size.unwrap_or(base.max_queue_size),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BreakerSection {
    #[serde(flatten)]
    pub defaults: BreakerFields,
    /// Health status report interval (default: 60s).
    pub status_interval_ms: Option<u64>,
    /// Per-dependency settings, layered over `defaults`.
    #[serde(default)]
    pub overrides: HashMap<String, BreakerFields>,
}

impl BreakerSection {
    pub fn default_config(&self) -> BreakerConfig {
        self.defaults.resolve(&BreakerConfig::default())
    }

    pub fn override_configs(&self) -> Vec<(String, BreakerConfig)> {
        let base = self.default_config();
        let mut out: Vec<(String, BreakerConfig)> =
            self.overrides.iter().map(|(name, f)| (name.clone(), f.resolve(&base))).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn effective_status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms.unwrap_or(60_000))
    }
}

/// Price feed block.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedSection {
    pub url: Option<String>,
    pub max_reconnect_attempts: Option<u32>,
    pub reconnect_base_ms: Option<u64>,
    pub reconnect_max_ms: Option<u64>,
    pub reconnect_multiplier: Option<f64>,
    /// Fraction of the delay added or removed at random, in `[0, 1)`.
    pub reconnect_jitter: Option<f64>,
    pub heartbeat_interval_ms: Option<u64>,
    pub heartbeat_timeout_ms: Option<u64>,
    /// Text ping payload. Absent means WebSocket ping frames.
    pub ping_text: Option<String>,
    pub batch_window_ms: Option<u64>,
    pub batch_max: Option<usize>,
    /// Pause before consumers reopen a key whose reconnect budget ran out.
    pub resubscribe_cooldown_ms: Option<u64>,
    /// Extra HTTP headers for the WebSocket handshake (e.g. API key).
    pub extra_headers: Option<HashMap<String, String>>,
}

/// Resolved feed settings.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedConfig {
    pub url: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub reconnect_multiplier: f64,
    pub reconnect_jitter: f64,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub ping_text: Option<String>,
    pub batch_window: Duration,
    pub batch_max: usize,
    pub resubscribe_cooldown: Duration,
    pub extra_headers: HashMap<String, String>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".to_string(),
            max_reconnect_attempts: 10,
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            reconnect_multiplier: 2.0,
            reconnect_jitter: 0.1,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            ping_text: None,
            batch_window: Duration::from_millis(100),
            batch_max: 50,
            resubscribe_cooldown: Duration::from_secs(60),
            extra_headers: HashMap::new(),
        }
    }
}

impl FeedSection {
    pub fn feed_config(&self) -> FeedConfig {
        let d = FeedConfig::default();
        FeedConfig {
            url: self.url.clone().unwrap_or(d.url),
            max_reconnect_attempts: self.max_reconnect_attempts.unwrap_or(d.max_reconnect_attempts),
            reconnect_base: self.reconnect_base_ms.map(Duration::from_millis).unwrap_or(d.reconnect_base),
            reconnect_max: self.reconnect_max_ms.map(Duration::from_millis).unwrap_or(d.reconnect_max),
            reconnect_multiplier: self.reconnect_multiplier.unwrap_or(d.reconnect_multiplier),
            reconnect_jitter: self.reconnect_jitter.unwrap_or(d.reconnect_jitter),
            heartbeat_interval: self.heartbeat_interval_ms.map(Duration::from_millis).unwrap_or(d.heartbeat_interval),
            heartbeat_timeout: self.heartbeat_timeout_ms.map(Duration::from_millis).unwrap_or(d.heartbeat_timeout),
            ping_text: self.ping_text.clone(),
            batch_window: self.batch_window_ms.map(Duration::from_millis).unwrap_or(d.batch_window),
            batch_max: self.batch_max.unwrap_or(d.batch_max),
            resubscribe_cooldown: self
                .resubscribe_cooldown_ms
                .map(Duration::from_millis)
                .unwrap_or(d.resubscribe_cooldown),
            extra_headers: self.extra_headers.clone().unwrap_or_default(),
        }
    }
}

/// Scheduler block.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchedulerSection {
    pub coalesce_window_ms: Option<u64>,
    pub execution_retries: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
}

/// Resolved scheduler settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Orders whose due times fall in the same window dispatch together.
    pub coalesce_window: Duration,
    /// Broker submission attempts per order (at least 1).
    pub execution_retries: u32,
    /// Linear backoff unit between attempts.
    pub retry_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            coalesce_window: Duration::from_secs(1),
            execution_retries: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

impl SchedulerSection {
    pub fn scheduler_config(&self) -> SchedulerConfig {
        let d = SchedulerConfig::default();
        SchedulerConfig {
            coalesce_window: self.coalesce_window_ms.map(Duration::from_millis).unwrap_or(d.coalesce_window),
            execution_retries: self.execution_retries.unwrap_or(d.execution_retries),
            retry_backoff: self.retry_backoff_ms.map(Duration::from_millis).unwrap_or(d.retry_backoff),
        }
    }
}

/// REST gateway block (broker, quotes, wallets).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewaySection {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub timeout_ms: Option<u64>,
}

/// Resolved gateway settings.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3000".to_string(),
            api_key: None,
            timeout: Duration::from_secs(15),
        }
    }
}

impl GatewaySection {
    pub fn gateway_config(&self) -> GatewayConfig {
        let d = GatewayConfig::default();
        GatewayConfig {
            base_url: self.base_url.clone().unwrap_or(d.base_url),
            api_key: self.api_key.clone().filter(|k| !k.is_empty()),
            timeout: self.timeout_ms.map(Duration::from_millis).unwrap_or(d.timeout),
        }
    }
}

impl AppConfig {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let mut breakers = vec![("defaults".to_string(), self.breaker.default_config())];
        breakers.extend(self.breaker.override_configs());
        for (name, b) in &breakers {
            if b.failure_threshold == 0 {
                return Err(config_err(format!("breaker {name}: failure_threshold must be >= 1")));
            }
            if b.half_open_max_retries == 0 {
                return Err(config_err(format!("breaker {name}: half_open_max_retries must be >= 1")));
            }
            if b.max_queue_size == 0 {
                return Err(config_err(format!("breaker {name}: max_queue_size must be >= 1")));
            }
        }
        if self.breaker.effective_status_interval().is_zero() {
            return Err(config_err("breaker.status_interval_ms must be > 0"));
        }

        let feed = self.feed.feed_config();
        if !feed.url.starts_with("ws://") && !feed.url.starts_with("wss://") {
            return Err(config_err(format!("feed.url must be a ws:// or wss:// URL, got '{}'", feed.url)));
        }
        if !(0.0..1.0).contains(&feed.reconnect_jitter) {
            return Err(config_err(format!("feed.reconnect_jitter must be in [0, 1), got {}", feed.reconnect_jitter)));
        }
        if !feed.reconnect_multiplier.is_finite() || feed.reconnect_multiplier < 1.0 {
            return Err(config_err("feed.reconnect_multiplier must be >= 1"));
        }
        if feed.reconnect_base.is_zero() || feed.reconnect_max < feed.reconnect_base {
            return Err(config_err("feed reconnect delays must satisfy 0 < base <= max"));
        }
        if feed.heartbeat_interval.is_zero() || feed.heartbeat_timeout.is_zero() {
            return Err(config_err("feed heartbeat interval and timeout must be > 0"));
        }
        if feed.batch_max == 0 {
            return Err(config_err("feed.batch_max must be >= 1"));
        }

        let sched = self.scheduler.scheduler_config();
        if sched.coalesce_window.is_zero() {
            return Err(config_err("scheduler.coalesce_window_ms must be > 0"));
        }
        if sched.execution_retries == 0 {
            return Err(config_err("scheduler.execution_retries must be >= 1"));
        }
        Ok(())
    }
}

fn config_err(msg: impl Into<String>) -> EngineError {
    EngineError::Config(msg.into())
}

/// Load and parse a JSON config file.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = serde_json::from_str(&content)?;
    Ok(config)
}
