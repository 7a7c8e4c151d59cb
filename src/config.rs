// =============================================================================
// Monitor Configuration — environment-driven settings with documented defaults
// =============================================================================
//
// Every knob the monitor recognizes lives here. Values come from the
// environment (prefix `FLEET_`); anything absent falls back to the documented
// default, so an empty environment yields a working single-instance monitor.
//
// Durations accept a bare integer (seconds) or a suffixed form: `100ms`,
// `30s`, `5m`, `12h`, `7d`.
// =============================================================================

use std::time::Duration;

use crate::error::{MonitorError, Result};

// =============================================================================
// Default values
// =============================================================================

fn default_bot_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_backtest_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_runner_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_aggregation_interval() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_lease_ttl_secs() -> i64 {
    15
}

fn default_download_timeout() -> Duration {
    Duration::from_secs(12 * 60 * 60)
}

fn default_data_refresh_interval() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_sample_retention() -> Duration {
    Duration::from_secs(7 * 24 * 60 * 60)
}

fn default_coordination_root() -> String {
    "/fleet-monitor".to_string()
}

// =============================================================================
// MonitorConfig
// =============================================================================

/// Runtime configuration for the whole monitor subsystem.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// etcd endpoints for distributed coordination. Empty selects
    /// single-instance mode: no registry, and this instance owns everything.
    pub etcd_endpoints: Vec<String>,

    /// Identity of this control-plane instance in the coordination store.
    /// Auto-generated as `<sanitized-hostname>-<monotonic-nanoseconds>` when
    /// absent.
    pub instance_id: Option<String>,

    /// Key prefix under which instance records live.
    pub coordination_root: String,

    /// Bot reconciliation tick.
    pub bot_interval: Duration,

    /// Backtest reconciliation tick.
    pub backtest_interval: Duration,

    /// Runner dataset-freshness tick.
    pub runner_interval: Duration,

    /// Usage rollup tick.
    pub aggregation_interval: Duration,

    /// Instance-record heartbeat rewrite interval. Must stay below the lease
    /// TTL.
    pub heartbeat_interval: Duration,

    /// Coordination-store lease TTL, in seconds.
    pub lease_ttl_secs: i64,

    /// Hard cap on a single dataset download.
    pub data_download_timeout: Duration,

    /// Datasets older than this are re-downloaded.
    pub data_refresh_interval: Duration,

    /// Raw usage samples older than this are pruned.
    pub sample_retention: Duration,

    /// Whether a runner whose last download failed is retried automatically.
    /// Off by default: a failed download needs operator attention.
    pub retry_failed_downloads: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            etcd_endpoints: Vec::new(),
            instance_id: None,
            coordination_root: default_coordination_root(),
            bot_interval: default_bot_interval(),
            backtest_interval: default_backtest_interval(),
            runner_interval: default_runner_interval(),
            aggregation_interval: default_aggregation_interval(),
            heartbeat_interval: default_heartbeat_interval(),
            lease_ttl_secs: default_lease_ttl_secs(),
            data_download_timeout: default_download_timeout(),
            data_refresh_interval: default_data_refresh_interval(),
            sample_retention: default_sample_retention(),
            retry_failed_downloads: false,
        }
    }
}

impl MonitorConfig {
    /// Load configuration from the environment, falling back to defaults for
    /// anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(endpoints) = std::env::var("FLEET_ETCD_ENDPOINTS") {
            config.etcd_endpoints = endpoints
                .split(',')
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty())
                .collect();
        }
        if let Ok(id) = std::env::var("FLEET_INSTANCE_ID") {
            if !id.trim().is_empty() {
                config.instance_id = Some(id.trim().to_string());
            }
        }
        if let Ok(root) = std::env::var("FLEET_COORDINATION_ROOT") {
            config.coordination_root = root;
        }

        config.bot_interval = env_duration("FLEET_MONITOR_INTERVAL", config.bot_interval)?;
        config.backtest_interval =
            env_duration("FLEET_BACKTEST_INTERVAL", config.backtest_interval)?;
        config.runner_interval =
            env_duration("FLEET_RUNNER_MONITOR_INTERVAL", config.runner_interval)?;
        config.aggregation_interval =
            env_duration("FLEET_AGGREGATION_INTERVAL", config.aggregation_interval)?;
        config.heartbeat_interval =
            env_duration("FLEET_HEARTBEAT_INTERVAL", config.heartbeat_interval)?;
        config.data_download_timeout =
            env_duration("FLEET_DATA_DOWNLOAD_TIMEOUT", config.data_download_timeout)?;
        config.data_refresh_interval =
            env_duration("FLEET_DATA_REFRESH_INTERVAL", config.data_refresh_interval)?;
        config.sample_retention =
            env_duration("FLEET_SAMPLE_RETENTION", config.sample_retention)?;

        if let Ok(ttl) = std::env::var("FLEET_LEASE_TTL") {
            config.lease_ttl_secs = ttl
                .trim()
                .parse()
                .map_err(|_| MonitorError::Semantic(format!("invalid FLEET_LEASE_TTL: {ttl}")))?;
        }
        if let Ok(retry) = std::env::var("FLEET_RETRY_FAILED_DOWNLOADS") {
            config.retry_failed_downloads = matches!(retry.trim(), "1" | "true" | "yes");
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.lease_ttl_secs <= 0 {
            return Err(MonitorError::Semantic(format!(
                "lease TTL must be positive, got {}",
                self.lease_ttl_secs
            )));
        }
        if self.heartbeat_interval.as_secs() >= self.lease_ttl_secs as u64 {
            return Err(MonitorError::Semantic(format!(
                "heartbeat interval ({:?}) must be shorter than the lease TTL ({}s)",
                self.heartbeat_interval, self.lease_ttl_secs
            )));
        }
        Ok(())
    }

    /// Distributed mode is selected by the presence of etcd endpoints.
    pub fn is_distributed(&self) -> bool {
        !self.etcd_endpoints.is_empty()
    }

    /// Resolve the configured instance ID, or generate one from the hostname
    /// and a monotonic nanosecond stamp.
    pub fn resolve_instance_id(&self) -> String {
        if let Some(id) = &self.instance_id {
            return id.clone();
        }
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        let host: String = host
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        format!("{host}-{nanos}")
    }
}

fn env_duration(key: &str, fallback: Duration) -> Result<Duration> {
    match std::env::var(key) {
        Ok(raw) => parse_duration(&raw)
            .ok_or_else(|| MonitorError::Semantic(format!("invalid duration in {key}: {raw}"))),
        Err(_) => Ok(fallback),
    }
}

/// Parse `100ms`, `30s`, `5m`, `12h`, `7d`, or a bare integer of seconds.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let (value, unit) = if let Some(v) = raw.strip_suffix("ms") {
        (v, 1u64)
    } else if let Some(v) = raw.strip_suffix('s') {
        (v, 1_000)
    } else if let Some(v) = raw.strip_suffix('m') {
        (v, 60 * 1_000)
    } else if let Some(v) = raw.strip_suffix('h') {
        (v, 60 * 60 * 1_000)
    } else if let Some(v) = raw.strip_suffix('d') {
        (v, 24 * 60 * 60 * 1_000)
    } else {
        return None;
    };

    let value: u64 = value.trim().parse().ok()?;
    Some(Duration::from_millis(value * unit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_forms() {
        assert_eq!(parse_duration("100ms"), Some(Duration::from_millis(100)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("12h"), Some(Duration::from_secs(43_200)));
        assert_eq!(parse_duration("7d"), Some(Duration::from_secs(604_800)));
        assert_eq!(parse_duration("45"), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration("bogus"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn defaults_match_contract() {
        let config = MonitorConfig::default();
        assert_eq!(config.bot_interval, Duration::from_secs(30));
        assert_eq!(config.runner_interval, Duration::from_secs(300));
        assert_eq!(config.lease_ttl_secs, 15);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.sample_retention, Duration::from_secs(604_800));
        assert!(!config.retry_failed_downloads);
        assert!(!config.is_distributed());
        config.validate().unwrap();
    }

    #[test]
    fn heartbeat_must_beat_lease() {
        let config = MonitorConfig {
            heartbeat_interval: Duration::from_secs(20),
            lease_ttl_secs: 15,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn generated_instance_id_is_sanitized() {
        let config = MonitorConfig::default();
        let id = config.resolve_instance_id();
        assert!(!id.is_empty());
        assert!(id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    }
}
