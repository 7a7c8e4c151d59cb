// =============================================================================
// Runtime abstraction — how the monitor sees containers
// =============================================================================
//
// The monitor never talks to Docker or Kubernetes directly. Each runner row
// names a runtime kind and carries an opaque connection config; a
// `RuntimeFactory` resolves those to a `WorkloadRuntime` client. Concrete
// clients live with the control plane that embeds this crate.
//
// The "container does not exist" outcome is a sentinel
// (`MonitorError::NotFound`), not a failure: it drives the bot state machine
// to `stopped`.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::store::models::BotRunner;
use crate::types::{BacktestStatus, BotStatus};

/// Raw container state as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Restarting,
    Paused,
    Exited,
    Dead,
}

/// Instantaneous resource usage, with cumulative counters for IO.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_bytes: i64,
    pub net_rx_bytes: i64,
    pub net_tx_bytes: i64,
    pub blk_read_bytes: i64,
    pub blk_write_bytes: i64,
}

/// What the runtime reports about a bot container.
#[derive(Debug, Clone)]
pub struct BotProbe {
    pub state: ContainerState,
    pub healthy: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub ip_address: Option<String>,
    pub host_port: Option<u16>,
    pub usage: ResourceUsage,
}

impl BotProbe {
    /// Total mapping from observed runtime state to the persisted status.
    pub fn resolve_status(&self) -> BotStatus {
        match self.state {
            ContainerState::Created => BotStatus::Creating,
            ContainerState::Running if self.healthy => BotStatus::Running,
            ContainerState::Running => BotStatus::Unhealthy,
            ContainerState::Restarting | ContainerState::Paused => BotStatus::Unhealthy,
            ContainerState::Exited | ContainerState::Dead => BotStatus::Stopped,
        }
    }
}

/// What the runtime reports about a backtest job.
#[derive(Debug, Clone)]
pub struct BacktestProbe {
    pub status: BacktestStatus,
    pub usage: ResourceUsage,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Final artifacts of a finished backtest.
#[derive(Debug, Clone)]
pub struct BacktestArtifacts {
    pub result: Value,
    pub logs: String,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// One runtime backend (a Docker daemon, a Kubernetes namespace, ...).
#[async_trait]
pub trait WorkloadRuntime: Send + Sync {
    /// Inspect a bot container. The container key is the bot's UUID.
    async fn bot_status(&self, bot_key: Uuid) -> Result<BotProbe>;

    /// A transport that reaches the bot's HTTP API across deployment
    /// topologies, plus the base URL to use with it.
    async fn bot_http_client(&self, bot_key: Uuid) -> Result<(reqwest::Client, String)>;

    async fn backtest_status(&self, id: Uuid) -> Result<BacktestProbe>;

    async fn backtest_result(&self, id: Uuid) -> Result<BacktestArtifacts>;

    /// Post-terminal cleanup of a backtest container.
    async fn delete_backtest(&self, id: Uuid) -> Result<()>;

    /// Release the client.
    async fn close(&self);
}

/// Resolves a runner row to a runtime client.
pub trait RuntimeFactory: Send + Sync {
    fn client_for(&self, runner: &BotRunner) -> Result<Arc<dyn WorkloadRuntime>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(state: ContainerState, healthy: bool) -> BotProbe {
        BotProbe {
            state,
            healthy,
            last_seen_at: None,
            error_message: None,
            ip_address: None,
            host_port: None,
            usage: ResourceUsage::default(),
        }
    }

    #[test]
    fn status_mapping_is_total() {
        assert_eq!(
            probe(ContainerState::Running, true).resolve_status(),
            BotStatus::Running
        );
        assert_eq!(
            probe(ContainerState::Running, false).resolve_status(),
            BotStatus::Unhealthy
        );
        assert_eq!(
            probe(ContainerState::Created, false).resolve_status(),
            BotStatus::Creating
        );
        assert_eq!(
            probe(ContainerState::Restarting, false).resolve_status(),
            BotStatus::Unhealthy
        );
        assert_eq!(
            probe(ContainerState::Exited, false).resolve_status(),
            BotStatus::Stopped
        );
        assert_eq!(
            probe(ContainerState::Dead, false).resolve_status(),
            BotStatus::Stopped
        );
    }
}
