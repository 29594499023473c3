/// Engine configuration
///
/// Every field has a default matching the public Coinbase Exchange feed, so a
/// JSON document only needs the fields it changes.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration json: {0}")]
    Json(String),

    #[error("invalid {field} url {value}: {reason}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// How often and how patiently a failed snapshot fetch is retried
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ResyncPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl ResyncPolicy {
    /// Delay before retry number `attempt` (1-based), doubling each time
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

impl Default for ResyncPolicy {
    fn default() -> Self {
        ResyncPolicy {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Streaming endpoint
    pub ws_url: String,
    /// REST endpoint serving full-depth snapshots
    pub rest_url: String,
    pub product_id: String,
    pub channels: Vec<String>,
    /// Levels per side in the default view
    pub view_depth: usize,
    pub handshake_timeout_ms: u64,
    /// A receive that yields nothing for this long counts as a dead connection
    pub idle_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub snapshot_timeout_ms: u64,
    pub resync: ResyncPolicy,
}

impl Default for FeedConfig {
    fn default() -> Self {
        FeedConfig {
            ws_url: "wss://ws-feed.exchange.coinbase.com".to_string(),
            rest_url: "https://api.exchange.coinbase.com".to_string(),
            product_id: "BTC-USD".to_string(),
            channels: vec!["full".to_string()],
            view_depth: 5,
            handshake_timeout_ms: 10_000,
            idle_timeout_ms: 30_000,
            reconnect_delay_ms: 5_000,
            snapshot_timeout_ms: 30_000,
            resync: ResyncPolicy::default(),
        }
    }
}

impl FeedConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: FeedConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Json(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_product(mut self, product_id: impl Into<String>) -> Self {
        self.product_id = product_id.into();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_url("ws_url", &self.ws_url)?;
        parse_url("rest_url", &self.rest_url)?;
        if self.product_id.trim().is_empty() {
            return Err(ConfigError::Empty("product_id"));
        }
        if self.channels.is_empty() {
            return Err(ConfigError::Empty("channels"));
        }
        if self.view_depth == 0 {
            return Err(ConfigError::Zero("view_depth"));
        }
        if self.resync.max_attempts == 0 {
            return Err(ConfigError::Zero("resync.max_attempts"));
        }
        if self.idle_timeout_ms == 0 {
            return Err(ConfigError::Zero("idle_timeout_ms"));
        }
        Ok(())
    }

    /// Products named in the subscribe request; one engine tracks one product
    pub fn product_ids(&self) -> Vec<String> {
        vec![self.product_id.clone()]
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }
}

pub(crate) fn parse_url(field: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|e| ConfigError::InvalidUrl {
        field,
        value: value.to_string(),
        reason: e.to_string(),
    })
}
