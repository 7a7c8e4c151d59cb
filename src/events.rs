// =============================================================================
// Pub/Sub events — bot-scoped and owner-scoped topic families
// =============================================================================
//
// The monitor publishes to two topic families: `trades/...` for per-trade
// updates and `runners/...` for dataset-download status changes. Each family
// has a workload-scoped and an owner-scoped topic so UI feeds can subscribe
// at either granularity.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::types::DownloadStatus;

pub fn trade_topic(bot_id: Uuid) -> String {
    format!("trades/{bot_id}")
}

pub fn trade_owner_topic(owner_id: Uuid) -> String {
    format!("trades/owner/{owner_id}")
}

pub fn runner_topic(runner_id: Uuid) -> String {
    format!("runners/{runner_id}")
}

pub fn runner_owner_topic(owner_id: Uuid) -> String {
    format!("runners/owner/{owner_id}")
}

/// Whether a published trade is currently open or has closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeEventStatus {
    Open,
    Closed,
}

/// Per-trade update published on the trade topics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub trade_id: i64,
    pub bot_id: Uuid,
    pub pair: String,
    pub side: String,
    pub status: TradeEventStatus,
    pub profit_pct: f64,
    pub timestamp: DateTime<Utc>,
}

/// Runner dataset status change published on the runner topics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub runner_id: Uuid,
    pub status: DownloadStatus,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// The pub/sub transport the monitor publishes through.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Value) -> Result<()>;
}

// =============================================================================
// In-process bus
// =============================================================================

/// A published message as seen by in-process subscribers.
#[derive(Debug, Clone)]
pub struct Published {
    pub topic: String,
    pub payload: Value,
}

/// Broadcast-channel bus for single-binary deployments and tests. Messages
/// published with no live subscriber are dropped.
pub struct BroadcastBus {
    tx: broadcast::Sender<Published>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Published> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventBus for BroadcastBus {
    async fn publish(&self, topic: &str, payload: Value) -> Result<()> {
        let message = Published {
            topic: topic.to_string(),
            payload,
        };
        // A send error just means nobody is listening right now.
        if self.tx.send(message).is_err() {
            debug!(topic, "event dropped, no subscribers");
        }
        Ok(())
    }
}
