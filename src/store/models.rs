// =============================================================================
// Persistent entities the monitor reads and writes
// =============================================================================
//
// The monitor owns the write path for these rows (exclusively, per the
// coordinator's sharding); creation and deletion belong to the surrounding
// control plane. Untyped JSON crosses in at exactly three places and is
// parsed into typed records right there: the bot's api_server block, the
// runner's data-download config, and the upstream trade payload (see
// `freqtrade::types`).
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{MonitorError, Result};
use crate::types::{BacktestStatus, BotMode, BotStatus, DownloadStatus};

// =============================================================================
// Bot
// =============================================================================

/// A long-running trading bot supervised by the monitor.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Bot {
    pub id: Uuid,
    pub name: String,
    pub owner_id: Uuid,
    pub mode: BotMode,
    pub status: BotStatus,
    /// Opaque per-bot secrets; the monitor only reads the `api_server` block.
    pub secure_config: Value,
    pub runner_id: Option<Uuid>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Credentials and port for a bot's HTTP API, parsed out of `secure_config`.
#[derive(Clone, Deserialize)]
pub struct ApiServerConfig {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub listen_port: Option<u16>,
}

impl ApiServerConfig {
    /// Extract the `api_server` block from a bot's secure config.
    pub fn from_secure_config(secure_config: &Value) -> Result<Self> {
        let block = secure_config.get("api_server").ok_or_else(|| {
            MonitorError::Semantic("secure_config has no api_server block".into())
        })?;
        serde_json::from_value(block.clone()).map_err(|e| {
            MonitorError::Semantic(format!("malformed api_server config: {e}"))
        })
    }
}

impl std::fmt::Debug for ApiServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiServerConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("listen_port", &self.listen_port)
            .finish()
    }
}

// =============================================================================
// BotMetrics
// =============================================================================

/// Performance scalars and trade-sync state, one row per bot.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BotMetrics {
    pub bot_id: Uuid,
    pub trade_count: i64,
    pub closed_trade_count: i64,
    /// Derived as `trade_count - closed_trade_count` rather than trusting two
    /// upstream fields independently.
    pub open_trade_count: i64,
    pub winning_trades: i64,
    pub losing_trades: i64,
    pub win_rate: f64,
    pub profit_closed_coin: f64,
    pub profit_closed_percent: f64,
    pub profit_all_coin: f64,
    pub profit_all_percent: f64,
    pub expectancy: f64,
    pub profit_factor: f64,
    pub max_drawdown: f64,
    pub max_drawdown_abs: f64,
    pub best_pair: String,
    pub best_rate: f64,
    pub first_trade_at: Option<DateTime<Utc>>,
    pub latest_trade_at: Option<DateTime<Utc>>,
    /// Highest upstream trade ID durably persisted.
    pub last_synced_trade_id: i64,
    /// Highest upstream trade ID ever observed. Only ratchets upward, which
    /// is what lets the reset detector fire again after an upstream wipe.
    pub last_known_max_trade_id: i64,
    pub last_trade_sync_at: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
}

/// Sync bookkeeping loaded before a trade sync pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct TradeSyncState {
    pub last_synced_trade_id: i64,
    pub last_known_max_trade_id: i64,
}

// =============================================================================
// Trade
// =============================================================================

/// One persisted trade. The natural key is `(bot_id, freqtrade_trade_id,
/// open_date)`: the upstream bot can be wiped and replay trade IDs, so the
/// open date disambiguates epochs.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Trade {
    pub id: Uuid,
    pub bot_id: Uuid,
    pub freqtrade_trade_id: i64,
    pub pair: String,
    pub is_open: bool,
    pub open_date: DateTime<Utc>,
    pub close_date: Option<DateTime<Utc>>,
    pub open_rate: f64,
    pub close_rate: Option<f64>,
    pub amount: f64,
    pub stake_amount: f64,
    pub profit_abs: f64,
    pub profit_ratio: f64,
    pub strategy_name: String,
    pub timeframe: Option<String>,
    pub sell_reason: Option<String>,
    /// Raw upstream snapshot, kept verbatim for audit.
    pub raw: Value,
}

// =============================================================================
// Backtest
// =============================================================================

/// A one-shot backtest job. Launched externally in `running`; the monitor
/// drives it to exactly one terminal state.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Backtest {
    pub id: Uuid,
    pub strategy_id: Uuid,
    pub owner_id: Uuid,
    pub runner_id: Option<Uuid>,
    pub status: BacktestStatus,
    pub container_id: Option<String>,
    pub result: Option<Value>,
    pub summary: Option<Value>,
    pub logs: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Scalar summary extracted from a completed backtest result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BacktestSummary {
    pub total_trades: i64,
    pub win_rate: f64,
    pub profit_total_abs: f64,
    pub profit_total_pct: f64,
    pub max_drawdown_abs: f64,
    pub max_drawdown_pct: f64,
    pub first_trade_at: Option<DateTime<Utc>>,
    pub last_trade_at: Option<DateTime<Utc>>,
}

// =============================================================================
// BotRunner
// =============================================================================

/// A runner hosts bot containers and the market dataset they share.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BotRunner {
    pub id: Uuid,
    pub name: String,
    pub owner_id: Uuid,
    /// Runtime kind (`docker`, `kubernetes`, ...); resolved by the runtime
    /// factory.
    pub kind: String,
    /// Opaque runtime connection config, passed through to the factory.
    pub config: Value,
    pub billing_enabled: bool,
    pub data_download_config: Option<Value>,
    pub data_download_status: DownloadStatus,
    pub data_download_started_at: Option<DateTime<Utc>>,
    pub data_download_progress: Option<Value>,
    pub data_is_ready: bool,
    pub data_last_updated: Option<DateTime<Utc>>,
    pub data_error_message: Option<String>,
    /// Object-store locator for the packaged dataset archive.
    pub archive_bucket: Option<String>,
    pub archive_key: Option<String>,
}

/// What to download for a runner, parsed out of `data_download_config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataDownloadConfig {
    pub exchanges: Vec<ExchangeDownload>,
    #[serde(default)]
    pub pairs: Vec<String>,
    #[serde(default)]
    pub timeframes: Vec<String>,
    /// How many days of history to fetch.
    #[serde(default = "default_history_days")]
    pub days: u32,
}

fn default_history_days() -> u32 {
    30
}

/// A single exchange entry in a runner's download config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeDownload {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl DataDownloadConfig {
    pub fn parse(raw: Option<&Value>) -> Result<Self> {
        let raw = raw.ok_or_else(|| {
            MonitorError::Semantic("runner has no data_download_config".into())
        })?;
        serde_json::from_value(raw.clone()).map_err(|e| {
            MonitorError::Semantic(format!("malformed data_download_config: {e}"))
        })
    }

    /// Exchanges the download task actually visits.
    pub fn enabled_exchanges(&self) -> Vec<&ExchangeDownload> {
        self.exchanges.iter().filter(|e| e.enabled).collect()
    }
}

/// Progress map written by the download task and read by the stuck detector.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DownloadProgress {
    pub pairs_completed: u32,
    pub pairs_total: u32,
    pub current_pair: String,
    pub percent_complete: f64,
}

impl DownloadProgress {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn parse(raw: &Value) -> Result<Self> {
        serde_json::from_value(raw.clone())
            .map_err(|e| MonitorError::Semantic(format!("malformed progress map: {e}")))
    }
}

// =============================================================================
// UsageSample
// =============================================================================

/// Append-only resource-usage sample for billing.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UsageSample {
    /// `bot` or `backtest`.
    pub resource_type: String,
    pub resource_id: Uuid,
    pub owner_id: Uuid,
    pub runner_id: Uuid,
    pub sampled_at: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_bytes: i64,
    /// Cumulative counters as reported by the runtime.
    pub net_rx_bytes: i64,
    pub net_tx_bytes: i64,
    pub blk_read_bytes: i64,
    pub blk_write_bytes: i64,
}

// =============================================================================
// InstanceInfo
// =============================================================================

/// Ephemeral instance record held in the coordination store under a lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub hostname: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn api_server_config_parses() {
        let secure = json!({
            "api_server": {"username": "bot", "password": "hunter2", "listen_port": 8080},
            "exchange": {"key": "k", "secret": "s"}
        });
        let parsed = ApiServerConfig::from_secure_config(&secure).unwrap();
        assert_eq!(parsed.username, "bot");
        assert_eq!(parsed.listen_port, Some(8080));
    }

    #[test]
    fn api_server_config_missing_block_is_semantic() {
        let err = ApiServerConfig::from_secure_config(&json!({})).unwrap_err();
        assert!(matches!(err, MonitorError::Semantic(_)));
    }

    #[test]
    fn api_server_debug_redacts_password() {
        let secure = json!({"api_server": {"username": "bot", "password": "hunter2"}});
        let parsed = ApiServerConfig::from_secure_config(&secure).unwrap();
        let debug = format!("{parsed:?}");
        assert!(!debug.contains("hunter2"), "{debug}");
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn download_config_filters_disabled_exchanges() {
        let raw = json!({
            "exchanges": [
                {"name": "binance"},
                {"name": "kraken", "enabled": false}
            ],
            "pairs": ["BTC/USDT"],
            "timeframes": ["5m"]
        });
        let config = DataDownloadConfig::parse(Some(&raw)).unwrap();
        let enabled = config.enabled_exchanges();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "binance");
        assert_eq!(config.days, 30);
    }

    #[test]
    fn progress_round_trips_through_json_column() {
        let progress = DownloadProgress {
            pairs_completed: 3,
            pairs_total: 10,
            current_pair: "ETH/USDT".into(),
            percent_complete: 15.0,
        };
        let parsed = DownloadProgress::parse(&progress.to_value()).unwrap();
        assert_eq!(parsed, progress);
    }
}
