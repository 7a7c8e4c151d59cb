// =============================================================================
// RunnerMonitor — dataset freshness and stuck-download detection
// =============================================================================
//
// Every tick, each owned runner lands in one of three buckets: a download is
// in progress (leave it alone unless it is stuck), a download is needed
// (trigger one), or the dataset is healthy. Failed downloads are not retried
// automatically unless the operator turned the retry knob on; a stuck
// download is failed with a descriptive error so the operator sees it.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::coordination::Sharder;
use crate::monitor::download::DownloadOrchestrator;
use crate::store::models::{BotRunner, DownloadProgress};
use crate::store::Store;
use crate::types::DownloadStatus;

/// Runners processed per batch within a tick.
const BATCH_SIZE: usize = 5;

/// Pause between batches.
const BATCH_PAUSE: Duration = Duration::from_millis(100);

/// A download that has written no progress this long after starting is stuck.
const NO_PROGRESS_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Knobs the stuck/trigger decision depends on.
#[derive(Debug, Clone, Copy)]
pub struct RunnerPolicy {
    pub download_timeout: Duration,
    pub refresh_interval: Duration,
    pub retry_failed: bool,
}

/// What one tick decided for a runner.
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerAction {
    /// Dataset healthy or waiting on the operator.
    Nothing,
    /// The in-progress download is stuck; fail it with this error.
    MarkStuck(String),
    /// Kick off a download task.
    TriggerDownload,
}

/// Pure decision over the runner row. `now` is passed in so the rules are
/// testable at any point in time.
pub fn decide_runner_action(
    runner: &BotRunner,
    now: DateTime<Utc>,
    policy: &RunnerPolicy,
) -> RunnerAction {
    if runner.data_download_status == DownloadStatus::Downloading {
        return match in_progress_check(runner, now, policy) {
            Some(reason) => RunnerAction::MarkStuck(reason),
            None => RunnerAction::Nothing,
        };
    }

    let stale = match runner.data_last_updated {
        Some(updated) => {
            now.signed_duration_since(updated).to_std().unwrap_or_default()
                > policy.refresh_interval
        }
        None => true,
    };
    if runner.data_is_ready && !stale {
        return RunnerAction::Nothing;
    }

    // A failed download needs operator action unless retries were enabled.
    if runner.data_download_status == DownloadStatus::Failed && !policy.retry_failed {
        return RunnerAction::Nothing;
    }

    RunnerAction::TriggerDownload
}

/// The two-part stuck rule: a hard wall-clock cap, and a no-progress window
/// right after start. A download still writing progress is left alone.
fn in_progress_check(
    runner: &BotRunner,
    now: DateTime<Utc>,
    policy: &RunnerPolicy,
) -> Option<String> {
    let Some(started_at) = runner.data_download_started_at else {
        return Some("download marked in progress but has no start time".to_string());
    };
    let elapsed = now
        .signed_duration_since(started_at)
        .to_std()
        .unwrap_or_default();

    if elapsed > policy.download_timeout {
        return Some(format!(
            "download exceeded the {:?} cap (started {})",
            policy.download_timeout, started_at
        ));
    }

    if elapsed > NO_PROGRESS_WINDOW && !has_progressed(runner) {
        return Some(format!(
            "download made no progress within {NO_PROGRESS_WINDOW:?} of starting"
        ));
    }

    None
}

fn has_progressed(runner: &BotRunner) -> bool {
    let Some(raw) = &runner.data_download_progress else {
        return false;
    };
    match DownloadProgress::parse(raw) {
        Ok(progress) => progress.pairs_completed > 0 || progress.percent_complete > 0.0,
        Err(_) => false,
    }
}

// =============================================================================
// Loop
// =============================================================================

pub struct RunnerMonitor {
    store: Store,
    sharder: Arc<dyn Sharder>,
    orchestrator: Arc<DownloadOrchestrator>,
    policy: RunnerPolicy,
    interval: Duration,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RunnerMonitor {
    pub fn new(
        store: Store,
        sharder: Arc<dyn Sharder>,
        orchestrator: Arc<DownloadOrchestrator>,
        policy: RunnerPolicy,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            sharder,
            orchestrator,
            policy,
            interval,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn start(self: &Arc<Self>) {
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            monitor.run_loop().await;
        });
        *self.task.lock() = Some(handle);
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn run_loop(&self) {
        info!(interval = ?self.interval, "runner monitor started");
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.interval,
            self.interval,
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("runner monitor stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.reconcile_all().await;
                }
            }
        }
    }

    async fn reconcile_all(&self) {
        let runners = match self.store.runners().await {
            Ok(runners) => runners,
            Err(e) => {
                warn!(error = %e, "runner query failed, skipping pass");
                return;
            }
        };

        let ids: Vec<Uuid> = runners.iter().map(|r| r.id).collect();
        let owned = self.sharder.assigned_from(&ids);
        let owned: Vec<BotRunner> = runners
            .into_iter()
            .filter(|r| owned.contains(&r.id))
            .collect();

        debug!(owned = owned.len(), "checking owned runners");

        let mut batches = owned.chunks(BATCH_SIZE).peekable();
        while let Some(batch) = batches.next() {
            for runner in batch {
                if self.cancel.is_cancelled() {
                    return;
                }
                self.reconcile_runner(runner).await;
            }
            if batches.peek().is_some() {
                tokio::time::sleep(BATCH_PAUSE).await;
            }
        }
    }

    async fn reconcile_runner(&self, runner: &BotRunner) {
        match decide_runner_action(runner, Utc::now(), &self.policy) {
            RunnerAction::Nothing => {}
            RunnerAction::MarkStuck(reason) => {
                warn!(runner_id = %runner.id, reason = %reason, "download stuck");
                self.orchestrator.mark_failed(runner, &reason).await;
            }
            RunnerAction::TriggerDownload => {
                info!(runner_id = %runner.id, "dataset needs download");
                self.orchestrator.launch(runner.clone()).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy() -> RunnerPolicy {
        RunnerPolicy {
            download_timeout: Duration::from_secs(12 * 3600),
            refresh_interval: Duration::from_secs(24 * 3600),
            retry_failed: false,
        }
    }

    fn runner(status: DownloadStatus) -> BotRunner {
        BotRunner {
            id: Uuid::new_v4(),
            name: "runner-1".into(),
            owner_id: Uuid::new_v4(),
            kind: "docker".into(),
            config: json!({}),
            billing_enabled: false,
            data_download_config: Some(json!({"exchanges": [{"name": "binance"}]})),
            data_download_status: status,
            data_download_started_at: None,
            data_download_progress: None,
            data_is_ready: false,
            data_last_updated: None,
            data_error_message: None,
            archive_bucket: None,
            archive_key: None,
        }
    }

    #[test]
    fn runner_over_hard_cap_is_stuck() {
        let now = Utc::now();
        let mut r = runner(DownloadStatus::Downloading);
        r.data_download_started_at = Some(now - chrono::Duration::hours(13));
        r.data_download_progress = Some(
            DownloadProgress {
                pairs_completed: 5,
                pairs_total: 10,
                current_pair: "BTC/USDT".into(),
                percent_complete: 25.0,
            }
            .to_value(),
        );

        match decide_runner_action(&r, now, &policy()) {
            RunnerAction::MarkStuck(reason) => assert!(reason.contains("cap"), "{reason}"),
            other => panic!("expected MarkStuck, got {other:?}"),
        }
    }

    #[test]
    fn runner_with_no_progress_after_grace_is_stuck() {
        let now = Utc::now();
        let mut r = runner(DownloadStatus::Downloading);
        r.data_download_started_at = Some(now - chrono::Duration::minutes(6));
        r.data_download_progress = Some(DownloadProgress::default().to_value());

        match decide_runner_action(&r, now, &policy()) {
            RunnerAction::MarkStuck(reason) => {
                assert!(reason.contains("no progress"), "{reason}")
            }
            other => panic!("expected MarkStuck, got {other:?}"),
        }
    }

    #[test]
    fn progressing_download_is_left_alone() {
        let now = Utc::now();
        let mut r = runner(DownloadStatus::Downloading);
        r.data_download_started_at = Some(now - chrono::Duration::hours(6));
        r.data_download_progress = Some(
            DownloadProgress {
                pairs_completed: 40,
                pairs_total: 100,
                current_pair: "SOL/USDT".into(),
                percent_complete: 20.0,
            }
            .to_value(),
        );

        assert_eq!(decide_runner_action(&r, now, &policy()), RunnerAction::Nothing);
    }

    #[test]
    fn fresh_download_without_progress_gets_grace() {
        let now = Utc::now();
        let mut r = runner(DownloadStatus::Downloading);
        r.data_download_started_at = Some(now - chrono::Duration::minutes(2));

        assert_eq!(decide_runner_action(&r, now, &policy()), RunnerAction::Nothing);
    }

    #[test]
    fn missing_data_triggers_download() {
        let r = runner(DownloadStatus::Idle);
        assert_eq!(
            decide_runner_action(&r, Utc::now(), &policy()),
            RunnerAction::TriggerDownload
        );
    }

    #[test]
    fn stale_data_triggers_refresh() {
        let now = Utc::now();
        let mut r = runner(DownloadStatus::Completed);
        r.data_is_ready = true;
        r.data_last_updated = Some(now - chrono::Duration::hours(25));

        assert_eq!(
            decide_runner_action(&r, now, &policy()),
            RunnerAction::TriggerDownload
        );
    }

    #[test]
    fn fresh_data_is_healthy() {
        let now = Utc::now();
        let mut r = runner(DownloadStatus::Completed);
        r.data_is_ready = true;
        r.data_last_updated = Some(now - chrono::Duration::hours(2));

        assert_eq!(decide_runner_action(&r, now, &policy()), RunnerAction::Nothing);
    }

    #[test]
    fn failed_download_is_not_auto_retried() {
        let r = runner(DownloadStatus::Failed);
        assert_eq!(decide_runner_action(&r, Utc::now(), &policy()), RunnerAction::Nothing);

        // Unless the operator opted in.
        let mut retry = policy();
        retry.retry_failed = true;
        assert_eq!(
            decide_runner_action(&r, Utc::now(), &retry),
            RunnerAction::TriggerDownload
        );
    }
}
