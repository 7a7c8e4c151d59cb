// =============================================================================
// BacktestMonitor — drives running backtests to a terminal state
// =============================================================================
//
// Backtests are launched by the control plane, which persists them in
// `running`. This loop only ever selects `running` rows, and the terminal
// UPDATE is guarded on that status, so `completed` and `failed` are absorbing
// states no matter how ticks interleave. Container cleanup happens after the
// terminal write and its failure is logged, never propagated.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::alerts::AlertSink;
use crate::coordination::Sharder;
use crate::error::Result;
use crate::runtime::{RuntimeFactory, WorkloadRuntime};
use crate::store::models::{Backtest, BacktestSummary, BotRunner, UsageSample};
use crate::store::Store;
use crate::types::BacktestStatus;

pub struct BacktestMonitor {
    store: Store,
    sharder: Arc<dyn Sharder>,
    runtime_factory: Arc<dyn RuntimeFactory>,
    alerts: Arc<dyn AlertSink>,
    interval: Duration,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BacktestMonitor {
    pub fn new(
        store: Store,
        sharder: Arc<dyn Sharder>,
        runtime_factory: Arc<dyn RuntimeFactory>,
        alerts: Arc<dyn AlertSink>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            sharder,
            runtime_factory,
            alerts,
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
        info!(interval = ?self.interval, "backtest monitor started");
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.interval,
            self.interval,
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("backtest monitor stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.reconcile_all().await;
                }
            }
        }
    }

    async fn reconcile_all(&self) {
        let running = match self.store.running_backtests().await {
            Ok(running) => running,
            Err(e) => {
                warn!(error = %e, "backtest query failed, skipping pass");
                return;
            }
        };

        let ids: Vec<Uuid> = running.iter().map(|b| b.id).collect();
        let owned = self.sharder.assigned_from(&ids);

        for backtest in running.into_iter().filter(|b| owned.contains(&b.id)) {
            if self.cancel.is_cancelled() {
                return;
            }
            if let Err(e) = self.reconcile_backtest(&backtest).await {
                warn!(backtest_id = %backtest.id, error = %e, "backtest reconciliation failed");
            }
        }
    }

    async fn reconcile_backtest(&self, backtest: &Backtest) -> Result<()> {
        let Some(runner_id) = backtest.runner_id else {
            debug!(backtest_id = %backtest.id, "backtest has no runner, skipping");
            return Ok(());
        };
        let Some(runner) = self.store.runner(runner_id).await? else {
            self.finish_failed(
                backtest,
                None,
                &format!("runner {runner_id} not found"),
                None,
            )
            .await;
            return Ok(());
        };
        let runtime = self.runtime_factory.client_for(&runner)?;
        let result = self
            .observe_backtest(backtest, &runner, runtime.as_ref())
            .await;
        runtime.close().await;
        result
    }

    async fn observe_backtest(
        &self,
        backtest: &Backtest,
        runner: &BotRunner,
        runtime: &dyn WorkloadRuntime,
    ) -> Result<()> {
        let probe = match runtime.backtest_status(backtest.id).await {
            Ok(probe) => probe,
            Err(e) if e.is_not_found() => {
                self.finish_failed(
                    backtest,
                    Some(runtime),
                    "backtest container disappeared",
                    None,
                )
                .await;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if runner.billing_enabled
            && matches!(
                probe.status,
                BacktestStatus::Running | BacktestStatus::Completed
            )
        {
            self.sample_usage(backtest, runner, &probe).await;
        }

        match probe.status {
            BacktestStatus::Pending | BacktestStatus::Running => Ok(()),
            BacktestStatus::Completed => {
                self.finish_completed(backtest, runtime, probe.completed_at)
                    .await
            }
            BacktestStatus::Failed => {
                let upstream_error = probe
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "backtest failed".to_string());
                self.finish_failed(
                    backtest,
                    Some(runtime),
                    &upstream_error,
                    probe.completed_at,
                )
                .await;
                Ok(())
            }
        }
    }

    async fn finish_completed(
        &self,
        backtest: &Backtest,
        runtime: &dyn WorkloadRuntime,
        probed_completed_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<()> {
        // The artifacts fetch is the one step worth retrying next tick, so
        // its failure propagates before any terminal write happens.
        let artifacts = runtime.backtest_result(backtest.id).await?;

        let summary = extract_summary(&artifacts.result);
        let summary_value = summary
            .as_ref()
            .and_then(|s| serde_json::to_value(s).ok());
        let completed_at = artifacts
            .completed_at
            .or(probed_completed_at)
            .unwrap_or_else(Utc::now);

        let wrote = self
            .store
            .complete_backtest(
                backtest.id,
                &artifacts.result,
                summary_value.as_ref(),
                Some(&artifacts.logs),
                completed_at,
            )
            .await?;

        if !wrote {
            debug!(backtest_id = %backtest.id, "backtest already terminal, nothing to do");
            return Ok(());
        }

        info!(
            backtest_id = %backtest.id,
            total_trades = summary.as_ref().map(|s| s.total_trades).unwrap_or(0),
            "backtest completed"
        );
        self.alerts
            .backtest_finished(backtest, true, None, summary.as_ref())
            .await;

        self.cleanup(backtest, runtime).await;
        Ok(())
    }

    async fn finish_failed(
        &self,
        backtest: &Backtest,
        runtime: Option<&dyn WorkloadRuntime>,
        upstream_error: &str,
        probed_completed_at: Option<chrono::DateTime<Utc>>,
    ) {
        // Logs are worth salvaging from a failed run, but their absence must
        // not keep the row out of its terminal state.
        let (message, logs, completed_at) = match runtime {
            Some(runtime) => match runtime.backtest_result(backtest.id).await {
                Ok(artifacts) => (
                    artifacts
                        .error_message
                        .unwrap_or_else(|| upstream_error.to_string()),
                    Some(artifacts.logs),
                    artifacts
                        .completed_at
                        .or(probed_completed_at)
                        .unwrap_or_else(Utc::now),
                ),
                Err(e) => (
                    format!("Backtest failed: {e}"),
                    None,
                    probed_completed_at.unwrap_or_else(Utc::now),
                ),
            },
            None => (
                upstream_error.to_string(),
                None,
                probed_completed_at.unwrap_or_else(Utc::now),
            ),
        };

        let wrote = match self
            .store
            .fail_backtest(backtest.id, &message, logs.as_deref(), completed_at)
            .await
        {
            Ok(wrote) => wrote,
            Err(e) => {
                warn!(backtest_id = %backtest.id, error = %e, "terminal write failed");
                return;
            }
        };
        if !wrote {
            debug!(backtest_id = %backtest.id, "backtest already terminal, nothing to do");
            return;
        }

        warn!(backtest_id = %backtest.id, error = %message, "backtest failed");
        self.alerts
            .backtest_finished(backtest, false, Some(&message), None)
            .await;

        if let Some(runtime) = runtime {
            self.cleanup(backtest, runtime).await;
        }
    }

    async fn cleanup(&self, backtest: &Backtest, runtime: &dyn WorkloadRuntime) {
        if let Err(e) = runtime.delete_backtest(backtest.id).await {
            warn!(backtest_id = %backtest.id, error = %e, "backtest cleanup failed");
        }
    }

    async fn sample_usage(
        &self,
        backtest: &Backtest,
        runner: &BotRunner,
        probe: &crate::runtime::BacktestProbe,
    ) {
        let sample = UsageSample {
            resource_type: "backtest".to_string(),
            resource_id: backtest.id,
            owner_id: backtest.owner_id,
            runner_id: runner.id,
            sampled_at: Utc::now(),
            cpu_percent: probe.usage.cpu_percent,
            memory_bytes: probe.usage.memory_bytes,
            net_rx_bytes: probe.usage.net_rx_bytes,
            net_tx_bytes: probe.usage.net_tx_bytes,
            blk_read_bytes: probe.usage.blk_read_bytes,
            blk_write_bytes: probe.usage.blk_write_bytes,
        };
        if let Err(e) = self.store.append_usage_sample(&sample).await {
            warn!(backtest_id = %backtest.id, error = %e, "usage sample append failed");
        }
    }
}

// =============================================================================
// Summary extraction
// =============================================================================

/// Pull the scalar summary out of a raw backtest result. Results come in two
/// shapes: a flat object, or the per-strategy form with the scalars nested
/// one level under `strategy.<name>`. Returns `None` when neither yields a
/// trade count.
pub fn extract_summary(result: &Value) -> Option<BacktestSummary> {
    let stats = match result.get("strategy").and_then(|s| s.as_object()) {
        Some(by_strategy) => by_strategy.values().next()?,
        None => result,
    };

    let total_trades = stats.get("total_trades").and_then(Value::as_i64)?;

    let wins = stats.get("wins").and_then(Value::as_i64);
    let win_rate = stats
        .get("winrate")
        .and_then(Value::as_f64)
        .or_else(|| match (wins, total_trades) {
            (Some(wins), total) if total > 0 => Some(wins as f64 / total as f64),
            _ => None,
        })
        .unwrap_or(0.0);

    let f64_field = |key: &str| stats.get(key).and_then(Value::as_f64).unwrap_or(0.0);
    let ts_field = |key: &str| {
        stats
            .get(key)
            .and_then(Value::as_i64)
            .and_then(crate::freqtrade::types::timestamp_secs)
    };

    Some(BacktestSummary {
        total_trades,
        win_rate,
        profit_total_abs: f64_field("profit_total_abs"),
        profit_total_pct: f64_field("profit_total"),
        max_drawdown_abs: f64_field("max_drawdown_abs"),
        max_drawdown_pct: f64_field("max_drawdown_account"),
        first_trade_at: ts_field("backtest_start_ts"),
        last_trade_at: ts_field("backtest_end_ts"),
    })
}
