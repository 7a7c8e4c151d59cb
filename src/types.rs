// =============================================================================
// Shared status types for the monitored workload classes
// =============================================================================
//
// Statuses are stored as snake_case text columns; the sqlx derive keeps the
// database representation in lockstep with the serde one.
// =============================================================================

use serde::{Deserialize, Serialize};

/// Whether a bot trades real funds or simulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum BotMode {
    Live,
    DryRun,
}

impl Default for BotMode {
    fn default() -> Self {
        Self::DryRun
    }
}

impl std::fmt::Display for BotMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::DryRun => write!(f, "dry_run"),
        }
    }
}

/// Observed lifecycle state of a bot container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum BotStatus {
    Creating,
    Running,
    Unhealthy,
    Stopped,
    Error,
}

impl std::fmt::Display for BotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Running => write!(f, "running"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl BotStatus {
    /// Statuses the monitor keeps reconciling. `Error` is included so a bot
    /// whose runtime recovers transitions back to a healthy status on its
    /// own.
    pub const MONITORED: [BotStatus; 5] = [
        BotStatus::Creating,
        BotStatus::Running,
        BotStatus::Unhealthy,
        BotStatus::Stopped,
        BotStatus::Error,
    ];
}

/// A bot may be started only from a settled, non-running state.
pub fn can_start(status: BotStatus) -> bool {
    matches!(status, BotStatus::Stopped | BotStatus::Error)
}

/// A bot may be stopped or restarted only while it is up.
pub fn can_stop_or_restart(status: BotStatus) -> bool {
    matches!(status, BotStatus::Running | BotStatus::Unhealthy)
}

/// Lifecycle state of a one-shot backtest job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum BacktestStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl BacktestStatus {
    /// Terminal backtests are never revisited by the monitor.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for BacktestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// State of a runner's dataset-download job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum DownloadStatus {
    Idle,
    Downloading,
    Completed,
    Failed,
}

impl Default for DownloadStatus {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Downloading => write!(f, "downloading"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_stop_gating() {
        assert!(can_start(BotStatus::Stopped));
        assert!(can_start(BotStatus::Error));
        assert!(!can_start(BotStatus::Running));
        assert!(!can_start(BotStatus::Creating));

        assert!(can_stop_or_restart(BotStatus::Running));
        assert!(can_stop_or_restart(BotStatus::Unhealthy));
        assert!(!can_stop_or_restart(BotStatus::Stopped));
        assert!(!can_stop_or_restart(BotStatus::Error));
    }

    #[test]
    fn backtest_terminality() {
        assert!(BacktestStatus::Completed.is_terminal());
        assert!(BacktestStatus::Failed.is_terminal());
        assert!(!BacktestStatus::Running.is_terminal());
        assert!(!BacktestStatus::Pending.is_terminal());
    }

    #[test]
    fn statuses_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&BotStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
        assert_eq!(
            serde_json::to_string(&BotMode::DryRun).unwrap(),
            "\"dry_run\""
        );
        assert_eq!(
            serde_json::to_string(&DownloadStatus::Downloading).unwrap(),
            "\"downloading\""
        );
    }
}
