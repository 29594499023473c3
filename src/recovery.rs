/// Snapshot-based order book recovery
///
/// Fetches a full-depth (level 3) snapshot and rebuilds a fresh `BookState`
/// from it. The rebuilt book replaces the live one wholesale; see the engine
/// for the swap.

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::{info, warn};

use crate::book_builder::{BookError, BookState};
use crate::config::{parse_url, ConfigError, ResyncPolicy};
use crate::protocol::{OpenOrder, OrderId, Side};

const USER_AGENT: &str = concat!("book-feed/", env!("CARGO_PKG_VERSION"));

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("snapshot request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("snapshot endpoint returned status {status}")]
    Status { status: u16 },

    #[error("malformed snapshot: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("snapshot does not form a valid book: {0}")]
    Rebuild(#[from] BookError),

    #[error("invalid snapshot endpoint: {0}")]
    Endpoint(#[from] ConfigError),
}

/// One resting order as listed in a snapshot: `[price, size, order_id]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SnapshotEntry(
    Decimal,
    Decimal,
    #[serde(deserialize_with = "order_id_from_any")] OrderId,
);

impl SnapshotEntry {
    pub fn new(price: Decimal, size: Decimal, order_id: impl Into<OrderId>) -> Self {
        SnapshotEntry(price, size, order_id.into())
    }

    pub fn price(&self) -> Decimal {
        self.0
    }

    pub fn size(&self) -> Decimal {
        self.1
    }

    pub fn order_id(&self) -> &str {
        &self.2
    }
}

// Level-3 snapshots carry string ids; aggregated levels carry an order count.
fn order_id_from_any<'de, D>(deserializer: D) -> Result<OrderId, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(u64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(id) => id,
        RawId::Number(n) => n.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Snapshot {
    pub sequence: u64,
    #[serde(default)]
    pub bids: Vec<SnapshotEntry>,
    #[serde(default)]
    pub asks: Vec<SnapshotEntry>,
}

impl Snapshot {
    pub fn from_json_str(json: &str) -> Result<Self, SnapshotError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Build a book holding exactly the snapshot's orders, at its sequence.
    /// Every entry goes through the regular `open` handler and a crossed
    /// result is rejected.
    pub fn to_book(&self) -> Result<BookState, BookError> {
        let mut book = BookState::new();
        book.reset(self.sequence);

        let sides = [(Side::Buy, &self.bids), (Side::Sell, &self.asks)];
        for (side, entries) in sides {
            for entry in entries {
                book.open(&OpenOrder {
                    order_id: entry.order_id().to_string(),
                    side,
                    price: entry.price(),
                    remaining_size: entry.size(),
                })?;
            }
        }
        book.check_no_cross()?;
        Ok(book)
    }

    pub fn order_count(&self) -> usize {
        self.bids.len() + self.asks.len()
    }
}

/// Where snapshots come from
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self, product_id: &str) -> Result<Snapshot, SnapshotError>;
}

/// Fetches `GET {rest_url}/products/{product_id}/book?level=3`
#[derive(Debug, Clone)]
pub struct RestSnapshotLoader {
    client: reqwest::Client,
    base_url: String,
}

impl RestSnapshotLoader {
    pub fn new(rest_url: &str, timeout: Duration) -> Result<Self, SnapshotError> {
        parse_url("rest_url", rest_url)?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(RestSnapshotLoader {
            client,
            base_url: rest_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self, product_id: &str) -> String {
        format!("{}/products/{}/book", self.base_url, product_id)
    }
}

#[async_trait]
impl SnapshotSource for RestSnapshotLoader {
    async fn fetch(&self, product_id: &str) -> Result<Snapshot, SnapshotError> {
        let response = self
            .client
            .get(self.endpoint(product_id))
            .query(&[("level", "3")])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SnapshotError::Status {
                status: status.as_u16(),
            });
        }

        let body = response.text().await?;
        Snapshot::from_json_str(&body)
    }
}

/// Drives snapshot fetches with retry
pub struct RecoveryManager<S> {
    source: S,
    policy: ResyncPolicy,
    failed_attempts: u64,
}

impl<S: SnapshotSource> RecoveryManager<S> {
    pub fn new(source: S, policy: ResyncPolicy) -> Self {
        RecoveryManager {
            source,
            policy,
            failed_attempts: 0,
        }
    }

    /// Fetch a snapshot and rebuild a book from it, retrying with backoff.
    /// Returns the last error once every attempt has failed.
    pub async fn fetch_book(&mut self, product_id: &str) -> Result<BookState, SnapshotError> {
        let attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.try_once(product_id).await {
                Ok(book) => {
                    info!(
                        product_id,
                        sequence = book.sequence(),
                        orders = book.order_count(),
                        attempt,
                        "book rebuilt from snapshot"
                    );
                    return Ok(book);
                }
                Err(e) => {
                    self.failed_attempts += 1;
                    if attempt >= attempts {
                        return Err(e);
                    }
                    let delay = self.policy.backoff(attempt);
                    warn!(product_id, attempt, error = %e, ?delay, "snapshot attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn try_once(&self, product_id: &str) -> Result<BookState, SnapshotError> {
        let snapshot = self.source.fetch(product_id).await?;
        Ok(snapshot.to_book()?)
    }

    /// Attempts that failed over the manager's lifetime
    pub fn failed_attempts(&self) -> u64 {
        self.failed_attempts
    }
}
