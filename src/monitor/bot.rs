// =============================================================================
// BotMonitor — per-tick reconciliation of owned bots
// =============================================================================
//
// Three things wake the loop: the tick timer, an assignment-change token from
// the coordinator (so freshly owned bots are not left stale for a whole
// tick), and shutdown. Each pass loads the monitorable bots, keeps the ones
// this instance owns, and reconciles them in small parallel batches with a
// pause in between so the runtime API is not thundered.
//
// Within one bot the write order is fixed: status, then metrics, then trade
// sync, then usage sample. Metric, sync, and billing failures never undo the
// status write.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::alerts::AlertSink;
use crate::coordination::Sharder;
use crate::error::Result;
use crate::events::EventBus;
use crate::freqtrade::client::BotApiClient;
use crate::monitor::trade_sync;
use crate::runtime::{BotProbe, RuntimeFactory, WorkloadRuntime};
use crate::store::models::{ApiServerConfig, Bot, BotMetrics, BotRunner, UsageSample};
use crate::store::Store;
use crate::types::BotStatus;

/// Bots reconciled concurrently within one batch.
const BATCH_SIZE: usize = 10;

/// Pause between batches.
const BATCH_PAUSE: Duration = Duration::from_millis(100);

/// Per-bot deadline for the metrics fetch.
const METRICS_DEADLINE: Duration = Duration::from_secs(10);

pub struct BotMonitor {
    store: Store,
    sharder: Arc<dyn Sharder>,
    runtime_factory: Arc<dyn RuntimeFactory>,
    bus: Arc<dyn EventBus>,
    alerts: Arc<dyn AlertSink>,
    interval: Duration,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BotMonitor {
    pub fn new(
        store: Store,
        sharder: Arc<dyn Sharder>,
        runtime_factory: Arc<dyn RuntimeFactory>,
        bus: Arc<dyn EventBus>,
        alerts: Arc<dyn AlertSink>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            sharder,
            runtime_factory,
            bus,
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
        info!(interval = ?self.interval, "bot monitor started");
        let mut changes = self.sharder.subscribe();

        // One immediate pass so a restart does not wait out a full tick.
        self.reconcile_all().await;

        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.interval,
            self.interval,
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("bot monitor stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.reconcile_all().await;
                }
                token = changes.recv() => {
                    if token.is_some() {
                        info!("assignments changed, reconciling out of band");
                        self.reconcile_all().await;
                    }
                }
            }
        }
    }

    /// One reconciliation pass over every owned bot.
    async fn reconcile_all(&self) {
        let bots = match self.store.monitorable_bots().await {
            Ok(bots) => bots,
            Err(e) => {
                warn!(error = %e, "bot query failed, skipping pass");
                return;
            }
        };

        let ids: Vec<Uuid> = bots.iter().map(|b| b.id).collect();
        let owned = self.sharder.assigned_from(&ids);
        let owned: Vec<Bot> = bots
            .into_iter()
            .filter(|b| owned.contains(&b.id))
            .collect();

        debug!(owned = owned.len(), "reconciling owned bots");

        let mut batches = owned.chunks(BATCH_SIZE).peekable();
        while let Some(batch) = batches.next() {
            if self.cancel.is_cancelled() {
                return;
            }

            join_all(batch.iter().map(|bot| async move {
                if let Err(e) = self.reconcile_bot(bot).await {
                    warn!(bot_id = %bot.id, error = %e, "bot reconciliation failed");
                }
            }))
            .await;

            if batches.peek().is_some() {
                tokio::time::sleep(BATCH_PAUSE).await;
            }
        }
    }

    async fn reconcile_bot(&self, bot: &Bot) -> Result<()> {
        let Some(runner_id) = bot.runner_id else {
            debug!(bot_id = %bot.id, "bot has no runner, skipping");
            return Ok(());
        };
        let Some(runner) = self.store.runner(runner_id).await? else {
            let message = format!("runner {runner_id} not found");
            self.transition(bot, BotStatus::Error, Some(&message), None).await?;
            return Ok(());
        };

        let runtime = match self.runtime_factory.client_for(&runner) {
            Ok(runtime) => runtime,
            Err(e) => {
                let message = format!("runtime client unavailable: {e}");
                self.transition(bot, BotStatus::Error, Some(&message), None).await?;
                return Ok(());
            }
        };

        let result = self.observe_bot(bot, &runner, runtime.as_ref()).await;
        runtime.close().await;
        result
    }

    async fn observe_bot(
        &self,
        bot: &Bot,
        runner: &BotRunner,
        runtime: &dyn WorkloadRuntime,
    ) -> Result<()> {
        // The bot's UUID is the container key across every runtime kind.
        let (probe, status) = match decide(runtime.bot_status(bot.id).await) {
            ProbeDecision::MarkStopped => {
                // A missing container is a legitimate stop, not an error.
                self.transition(bot, BotStatus::Stopped, None, None).await?;
                return Ok(());
            }
            ProbeDecision::MarkError(message) => {
                self.transition(bot, BotStatus::Error, Some(&message), None).await?;
                return Ok(());
            }
            ProbeDecision::Observe { probe, status } => (probe, status),
        };

        let last_seen = probe.last_seen_at.or_else(|| Some(Utc::now()));
        self.transition(bot, status, probe.error_message.as_deref(), last_seen)
            .await?;

        // Anything past this point needs the bot's HTTP API.
        if status != BotStatus::Running || !probe.healthy {
            self.maybe_sample_usage(bot, runner, &probe).await;
            return Ok(());
        }

        match self.bot_api_client(bot, runtime).await {
            Ok(api) => {
                self.fetch_metrics(bot, &api).await;

                if let Err(e) = trade_sync::sync_bot_trades(
                    &self.store,
                    self.bus.as_ref(),
                    self.alerts.as_ref(),
                    bot,
                    &api,
                )
                .await
                {
                    warn!(bot_id = %bot.id, error = %e, "trade sync failed");
                }
            }
            Err(e) => {
                // Missing credentials are a config problem, not a runtime
                // one; the bot stays running.
                warn!(bot_id = %bot.id, error = %e, "bot api unavailable");
            }
        }

        self.maybe_sample_usage(bot, runner, &probe).await;
        Ok(())
    }

    /// Persist the observed status, logging transitions only. Repeated error
    /// observations stay quiet but are still written so the row stays fresh.
    async fn transition(
        &self,
        bot: &Bot,
        status: BotStatus,
        error_message: Option<&str>,
        last_seen_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<()> {
        if bot.status != status {
            if bot.status == BotStatus::Error && status != BotStatus::Error {
                info!(
                    bot_id = %bot.id,
                    bot_name = %bot.name,
                    from = %bot.status,
                    to = %status,
                    "bot recovered"
                );
            } else if status == BotStatus::Error {
                warn!(
                    bot_id = %bot.id,
                    bot_name = %bot.name,
                    from = %bot.status,
                    to = %status,
                    error = error_message.unwrap_or(""),
                    "bot entered error state"
                );
            } else {
                info!(
                    bot_id = %bot.id,
                    bot_name = %bot.name,
                    from = %bot.status,
                    to = %status,
                    "bot status changed"
                );
            }
        }

        self.store
            .update_bot_observation(bot.id, status, error_message, last_seen_at)
            .await
    }

    async fn bot_api_client(
        &self,
        bot: &Bot,
        runtime: &dyn WorkloadRuntime,
    ) -> Result<BotApiClient> {
        let auth = ApiServerConfig::from_secure_config(&bot.secure_config)?;
        let (client, base_url) = runtime.bot_http_client(bot.id).await?;
        Ok(BotApiClient::new(client, base_url, &auth))
    }

    /// Fetch `/profit` and upsert the metrics row. Failures are logged and
    /// never fail the reconciliation.
    async fn fetch_metrics(&self, bot: &Bot, api: &BotApiClient) {
        let profit = match tokio::time::timeout(METRICS_DEADLINE, api.profit()).await {
            Ok(Ok(profit)) => profit,
            Ok(Err(e)) => {
                warn!(bot_id = %bot.id, error = %e, "metrics fetch failed");
                return;
            }
            Err(_) => {
                warn!(bot_id = %bot.id, deadline = ?METRICS_DEADLINE, "metrics fetch timed out");
                return;
            }
        };

        let metrics = metrics_from_profit(bot.id, &profit);
        if let Err(e) = self.store.upsert_bot_metrics(&metrics).await {
            warn!(bot_id = %bot.id, error = %e, "metrics upsert failed");
        }
    }

    /// Billing sample, appended last so it never delays the state writes.
    async fn maybe_sample_usage(&self, bot: &Bot, runner: &BotRunner, probe: &BotProbe) {
        if !runner.billing_enabled {
            return;
        }
        let sample = UsageSample {
            resource_type: "bot".to_string(),
            resource_id: bot.id,
            owner_id: bot.owner_id,
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
            warn!(bot_id = %bot.id, error = %e, "usage sample append failed");
        }
    }
}

/// Map the `/profit` scalars onto the metrics row.
pub(crate) fn metrics_from_profit(
    bot_id: Uuid,
    profit: &crate::freqtrade::types::ProfitResponse,
) -> BotMetrics {
    use crate::freqtrade::types::timestamp_secs;

    BotMetrics {
        bot_id,
        trade_count: profit.trade_count,
        closed_trade_count: profit.closed_trade_count,
        open_trade_count: profit.open_trade_count(),
        winning_trades: profit.winning_trades,
        losing_trades: profit.losing_trades,
        win_rate: profit.winrate,
        profit_closed_coin: profit.profit_closed_coin,
        profit_closed_percent: profit.profit_closed_percent,
        profit_all_coin: profit.profit_all_coin,
        profit_all_percent: profit.profit_all_percent,
        expectancy: profit.expectancy,
        profit_factor: profit.profit_factor,
        max_drawdown: profit.max_drawdown,
        max_drawdown_abs: profit.max_drawdown_abs,
        best_pair: profit.best_pair.clone(),
        best_rate: profit.best_rate,
        first_trade_at: timestamp_secs(profit.first_trade_timestamp),
        latest_trade_at: timestamp_secs(profit.latest_trade_timestamp),
        last_synced_trade_id: 0,
        last_known_max_trade_id: 0,
        last_trade_sync_at: None,
        fetched_at: Utc::now(),
    }
}

/// What a reconciliation pass decided for a bot, factored out of the I/O so
/// the mapping stays testable.
#[derive(Debug)]
pub(crate) enum ProbeDecision {
    /// Runtime does not know the container.
    MarkStopped,
    /// Runtime call failed outright.
    MarkError(String),
    /// Runtime reported a live container.
    Observe { probe: BotProbe, status: BotStatus },
}

pub(crate) fn decide(probe: Result<BotProbe>) -> ProbeDecision {
    match probe {
        Err(e) if e.is_not_found() => ProbeDecision::MarkStopped,
        Err(e) => ProbeDecision::MarkError(e.to_string()),
        Ok(probe) => {
            let status = probe.resolve_status();
            ProbeDecision::Observe { probe, status }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MonitorError;
    use crate::freqtrade::types::ProfitResponse;
    use crate::runtime::{ContainerState, ResourceUsage};

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
    fn missing_container_stops_the_bot() {
        let result: Result<BotProbe> = Err(MonitorError::NotFound("bot".into()));
        assert!(matches!(decide(result), ProbeDecision::MarkStopped));
    }

    #[test]
    fn runtime_failure_marks_error() {
        let result: Result<BotProbe> = Err(MonitorError::transient(
            "inspect",
            anyhow::anyhow!("socket closed"),
        ));
        match decide(result) {
            ProbeDecision::MarkError(message) => assert!(message.contains("socket closed")),
            other => panic!("expected MarkError, got {other:?}"),
        }
    }

    #[test]
    fn live_container_maps_through_status() {
        match decide(Ok(probe(ContainerState::Running, true))) {
            ProbeDecision::Observe { status, .. } => assert_eq!(status, BotStatus::Running),
            other => panic!("expected Observe, got {other:?}"),
        }
        match decide(Ok(probe(ContainerState::Running, false))) {
            ProbeDecision::Observe { status, .. } => assert_eq!(status, BotStatus::Unhealthy),
            other => panic!("expected Observe, got {other:?}"),
        }
    }

    #[test]
    fn profit_mapping_derives_open_count() {
        let profit = ProfitResponse {
            profit_all_coin: 12.5,
            trade_count: 10,
            closed_trade_count: 7,
            winrate: 0.6,
            first_trade_timestamp: 1_700_000_000,
            latest_trade_timestamp: 0,
            ..Default::default()
        };
        let metrics = metrics_from_profit(Uuid::new_v4(), &profit);

        assert_eq!(metrics.trade_count, 10);
        assert_eq!(metrics.open_trade_count, 3);
        assert!((metrics.profit_all_coin - 12.5).abs() < f64::EPSILON);
        assert!(metrics.first_trade_at.is_some());
        assert_eq!(metrics.latest_trade_at, None, "zero timestamp is unset");
    }
}
