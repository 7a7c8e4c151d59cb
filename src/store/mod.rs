// =============================================================================
// Store — typed persistence layer over Postgres
// =============================================================================
//
// Every write the monitor performs is an idempotent upsert or a guarded
// UPDATE, so an interrupted tick can always be replayed. The store never
// creates or deletes workload rows; that belongs to the surrounding control
// plane.
// =============================================================================

pub mod models;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{IoContext, Result};
use crate::types::{BotStatus, DownloadStatus};

use models::{Backtest, Bot, BotMetrics, BotRunner, Trade, TradeSyncState, UsageSample};

/// Columns written when upserting a trade from the sync path. The row UUID is
/// generated on first insert and left alone on conflict.
#[derive(Debug, Clone)]
pub struct TradeUpsert {
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
    pub raw: Value,
}

/// Handle to the monitor's relational storage.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .transient("running store migrations")
    }

    // -------------------------------------------------------------------------
    // Bots
    // -------------------------------------------------------------------------

    /// All bots in a state the monitor keeps reconciling. Error is included
    /// so transient failures can auto-recover.
    pub async fn monitorable_bots(&self) -> Result<Vec<Bot>> {
        let statuses: Vec<String> = BotStatus::MONITORED
            .iter()
            .map(|s| s.to_string())
            .collect();
        sqlx::query_as::<_, Bot>("SELECT * FROM bots WHERE status = ANY($1)")
            .bind(&statuses)
            .fetch_all(&self.pool)
            .await
            .transient("loading monitorable bots")
    }

    /// Write back the observed state of a bot. `last_seen_at` is only
    /// advanced when the runtime actually saw the container.
    pub async fn update_bot_observation(
        &self,
        id: Uuid,
        status: BotStatus,
        error_message: Option<&str>,
        last_seen_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE bots SET status = $2, error_message = $3, \
             last_seen_at = COALESCE($4, last_seen_at) WHERE id = $1",
        )
        .bind(id)
        .bind(status)
        .bind(error_message)
        .bind(last_seen_at)
        .execute(&self.pool)
        .await
        .transient("updating bot observation")?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Bot metrics
    // -------------------------------------------------------------------------

    pub async fn upsert_bot_metrics(&self, m: &BotMetrics) -> Result<()> {
        sqlx::query(
            "INSERT INTO bot_metrics (bot_id, trade_count, closed_trade_count, \
             open_trade_count, winning_trades, losing_trades, win_rate, \
             profit_closed_coin, profit_closed_percent, profit_all_coin, \
             profit_all_percent, expectancy, profit_factor, max_drawdown, \
             max_drawdown_abs, best_pair, best_rate, first_trade_at, \
             latest_trade_at, fetched_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, \
             $14, $15, $16, $17, $18, $19, $20) \
             ON CONFLICT (bot_id) DO UPDATE SET \
             trade_count = EXCLUDED.trade_count, \
             closed_trade_count = EXCLUDED.closed_trade_count, \
             open_trade_count = EXCLUDED.open_trade_count, \
             winning_trades = EXCLUDED.winning_trades, \
             losing_trades = EXCLUDED.losing_trades, \
             win_rate = EXCLUDED.win_rate, \
             profit_closed_coin = EXCLUDED.profit_closed_coin, \
             profit_closed_percent = EXCLUDED.profit_closed_percent, \
             profit_all_coin = EXCLUDED.profit_all_coin, \
             profit_all_percent = EXCLUDED.profit_all_percent, \
             expectancy = EXCLUDED.expectancy, \
             profit_factor = EXCLUDED.profit_factor, \
             max_drawdown = EXCLUDED.max_drawdown, \
             max_drawdown_abs = EXCLUDED.max_drawdown_abs, \
             best_pair = EXCLUDED.best_pair, \
             best_rate = EXCLUDED.best_rate, \
             first_trade_at = EXCLUDED.first_trade_at, \
             latest_trade_at = EXCLUDED.latest_trade_at, \
             fetched_at = EXCLUDED.fetched_at",
        )
        .bind(m.bot_id)
        .bind(m.trade_count)
        .bind(m.closed_trade_count)
        .bind(m.open_trade_count)
        .bind(m.winning_trades)
        .bind(m.losing_trades)
        .bind(m.win_rate)
        .bind(m.profit_closed_coin)
        .bind(m.profit_closed_percent)
        .bind(m.profit_all_coin)
        .bind(m.profit_all_percent)
        .bind(m.expectancy)
        .bind(m.profit_factor)
        .bind(m.max_drawdown)
        .bind(m.max_drawdown_abs)
        .bind(&m.best_pair)
        .bind(m.best_rate)
        .bind(m.first_trade_at)
        .bind(m.latest_trade_at)
        .bind(m.fetched_at)
        .execute(&self.pool)
        .await
        .transient("upserting bot metrics")?;
        Ok(())
    }

    pub async fn trade_sync_state(&self, bot_id: Uuid) -> Result<TradeSyncState> {
        let row = sqlx::query_as::<_, (i64, i64)>(
            "SELECT last_synced_trade_id, last_known_max_trade_id \
             FROM bot_metrics WHERE bot_id = $1",
        )
        .bind(bot_id)
        .fetch_optional(&self.pool)
        .await
        .transient("loading trade sync state")?;

        Ok(row
            .map(|(synced, known_max)| TradeSyncState {
                last_synced_trade_id: synced,
                last_known_max_trade_id: known_max,
            })
            .unwrap_or_default())
    }

    /// Record the outcome of a sync pass. `last_known_max_trade_id` only
    /// ratchets upward, so the reset detector keeps its memory across the
    /// sync that handles the reset.
    pub async fn update_trade_sync_state(
        &self,
        bot_id: Uuid,
        api_max: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO bot_metrics (bot_id, last_synced_trade_id, \
             last_known_max_trade_id, last_trade_sync_at, fetched_at) \
             VALUES ($1, $2, $2, $3, $3) \
             ON CONFLICT (bot_id) DO UPDATE SET \
             last_synced_trade_id = EXCLUDED.last_synced_trade_id, \
             last_known_max_trade_id = GREATEST(bot_metrics.last_known_max_trade_id, \
                                                EXCLUDED.last_known_max_trade_id), \
             last_trade_sync_at = EXCLUDED.last_trade_sync_at",
        )
        .bind(bot_id)
        .bind(api_max)
        .bind(now)
        .execute(&self.pool)
        .await
        .transient("updating trade sync state")?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Trades
    // -------------------------------------------------------------------------

    /// The small subset of persisted trades the sync compares against: all
    /// open trades plus everything opened after `since`. This bounds memory
    /// regardless of how much closed history a bot has accumulated.
    pub async fn comparison_trades(
        &self,
        bot_id: Uuid,
        since: DateTime<Utc>,
        include_open: bool,
    ) -> Result<Vec<Trade>> {
        sqlx::query_as::<_, Trade>(
            "SELECT * FROM trades \
             WHERE bot_id = $1 AND (open_date >= $2 OR (is_open AND $3))",
        )
        .bind(bot_id)
        .bind(since)
        .bind(include_open)
        .fetch_all(&self.pool)
        .await
        .transient("loading comparison trades")
    }

    /// Upsert a batch of trades using the composite natural key as the
    /// conflict target. All columns take the newest values.
    pub async fn upsert_trades(&self, bot_id: Uuid, rows: &[TradeUpsert]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.transient("opening trade upsert tx")?;
        for t in rows {
            sqlx::query(
                "INSERT INTO trades (id, bot_id, freqtrade_trade_id, pair, is_open, \
                 open_date, close_date, open_rate, close_rate, amount, stake_amount, \
                 profit_abs, profit_ratio, strategy_name, timeframe, sell_reason, raw) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, \
                 $14, $15, $16, $17) \
                 ON CONFLICT (bot_id, freqtrade_trade_id, open_date) DO UPDATE SET \
                 pair = EXCLUDED.pair, \
                 is_open = EXCLUDED.is_open, \
                 close_date = EXCLUDED.close_date, \
                 open_rate = EXCLUDED.open_rate, \
                 close_rate = EXCLUDED.close_rate, \
                 amount = EXCLUDED.amount, \
                 stake_amount = EXCLUDED.stake_amount, \
                 profit_abs = EXCLUDED.profit_abs, \
                 profit_ratio = EXCLUDED.profit_ratio, \
                 strategy_name = EXCLUDED.strategy_name, \
                 timeframe = EXCLUDED.timeframe, \
                 sell_reason = EXCLUDED.sell_reason, \
                 raw = EXCLUDED.raw",
            )
            .bind(Uuid::new_v4())
            .bind(bot_id)
            .bind(t.freqtrade_trade_id)
            .bind(&t.pair)
            .bind(t.is_open)
            .bind(t.open_date)
            .bind(t.close_date)
            .bind(t.open_rate)
            .bind(t.close_rate)
            .bind(t.amount)
            .bind(t.stake_amount)
            .bind(t.profit_abs)
            .bind(t.profit_ratio)
            .bind(&t.strategy_name)
            .bind(&t.timeframe)
            .bind(&t.sell_reason)
            .bind(&t.raw)
            .execute(&mut *tx)
            .await
            .transient("upserting trade")?;
        }
        tx.commit().await.transient("committing trade upsert tx")?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Backtests
    // -------------------------------------------------------------------------

    pub async fn running_backtests(&self) -> Result<Vec<Backtest>> {
        sqlx::query_as::<_, Backtest>("SELECT * FROM backtests WHERE status = 'running'")
            .fetch_all(&self.pool)
            .await
            .transient("loading running backtests")
    }

    /// Terminal transition to `completed`. Guarded on `running` so a backtest
    /// can never leave a terminal state; returns whether the row was written.
    pub async fn complete_backtest(
        &self,
        id: Uuid,
        result: &Value,
        summary: Option<&Value>,
        logs: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE backtests SET status = 'completed', result = $2, summary = $3, \
             logs = $4, completed_at = $5, error_message = NULL \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(result)
        .bind(summary)
        .bind(logs)
        .bind(completed_at)
        .execute(&self.pool)
        .await
        .transient("completing backtest")?;
        Ok(done.rows_affected() > 0)
    }

    /// Terminal transition to `failed`, same guard as `complete_backtest`.
    pub async fn fail_backtest(
        &self,
        id: Uuid,
        error_message: &str,
        logs: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE backtests SET status = 'failed', error_message = $2, \
             logs = COALESCE($3, logs), completed_at = $4 \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(error_message)
        .bind(logs)
        .bind(completed_at)
        .execute(&self.pool)
        .await
        .transient("failing backtest")?;
        Ok(done.rows_affected() > 0)
    }

    // -------------------------------------------------------------------------
    // Runners
    // -------------------------------------------------------------------------

    pub async fn runners(&self) -> Result<Vec<BotRunner>> {
        sqlx::query_as::<_, BotRunner>("SELECT * FROM bot_runners")
            .fetch_all(&self.pool)
            .await
            .transient("loading runners")
    }

    pub async fn runner(&self, id: Uuid) -> Result<Option<BotRunner>> {
        sqlx::query_as::<_, BotRunner>("SELECT * FROM bot_runners WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .transient("loading runner")
    }

    /// Transition a runner into `downloading` with a zeroed progress map.
    pub async fn begin_runner_download(
        &self,
        id: Uuid,
        started_at: DateTime<Utc>,
        progress: &Value,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE bot_runners SET data_download_status = $2, \
             data_download_started_at = $3, data_download_progress = $4, \
             data_error_message = NULL WHERE id = $1",
        )
        .bind(id)
        .bind(DownloadStatus::Downloading)
        .bind(started_at)
        .bind(progress)
        .execute(&self.pool)
        .await
        .transient("starting runner download")?;
        Ok(())
    }

    /// Progress writes only land while the download is still the active one.
    pub async fn update_runner_progress(&self, id: Uuid, progress: &Value) -> Result<()> {
        sqlx::query(
            "UPDATE bot_runners SET data_download_progress = $2 \
             WHERE id = $1 AND data_download_status = 'downloading'",
        )
        .bind(id)
        .bind(progress)
        .execute(&self.pool)
        .await
        .transient("updating download progress")?;
        Ok(())
    }

    pub async fn complete_runner_download(
        &self,
        id: Uuid,
        finished_at: DateTime<Utc>,
        archive_bucket: &str,
        archive_key: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE bot_runners SET data_download_status = $2, data_is_ready = TRUE, \
             data_last_updated = $3, data_download_progress = NULL, \
             data_download_started_at = NULL, data_error_message = NULL, \
             archive_bucket = $4, archive_key = $5 WHERE id = $1",
        )
        .bind(id)
        .bind(DownloadStatus::Completed)
        .bind(finished_at)
        .bind(archive_bucket)
        .bind(archive_key)
        .execute(&self.pool)
        .await
        .transient("completing runner download")?;
        Ok(())
    }

    pub async fn fail_runner_download(&self, id: Uuid, error_message: &str) -> Result<()> {
        sqlx::query(
            "UPDATE bot_runners SET data_download_status = $2, data_is_ready = FALSE, \
             data_error_message = $3, data_download_started_at = NULL WHERE id = $1",
        )
        .bind(id)
        .bind(DownloadStatus::Failed)
        .bind(error_message)
        .execute(&self.pool)
        .await
        .transient("failing runner download")?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Usage samples and rollups
    // -------------------------------------------------------------------------

    pub async fn append_usage_sample(&self, s: &UsageSample) -> Result<()> {
        sqlx::query(
            "INSERT INTO usage_samples (resource_type, resource_id, owner_id, \
             runner_id, sampled_at, cpu_percent, memory_bytes, net_rx_bytes, \
             net_tx_bytes, blk_read_bytes, blk_write_bytes) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (resource_type, resource_id, sampled_at) DO NOTHING",
        )
        .bind(&s.resource_type)
        .bind(s.resource_id)
        .bind(s.owner_id)
        .bind(s.runner_id)
        .bind(s.sampled_at)
        .bind(s.cpu_percent)
        .bind(s.memory_bytes)
        .bind(s.net_rx_bytes)
        .bind(s.net_tx_bytes)
        .bind(s.blk_read_bytes)
        .bind(s.blk_write_bytes)
        .execute(&self.pool)
        .await
        .transient("appending usage sample")?;
        Ok(())
    }

    /// Roll the raw samples of `[bucket_start, bucket_end)` into one hourly
    /// row per resource: averages for gauges, max-minus-min for the
    /// cumulative counters.
    pub async fn rollup_hourly(
        &self,
        bucket_start: DateTime<Utc>,
        bucket_end: DateTime<Utc>,
    ) -> Result<u64> {
        let done = sqlx::query(
            "INSERT INTO usage_hourly (resource_type, resource_id, owner_id, \
             runner_id, bucket_start, avg_cpu_percent, avg_memory_bytes, \
             net_rx_bytes, net_tx_bytes, blk_read_bytes, blk_write_bytes, sample_count) \
             SELECT resource_type, resource_id, owner_id, runner_id, $1, \
                    AVG(cpu_percent), AVG(memory_bytes)::double precision, \
                    MAX(net_rx_bytes) - MIN(net_rx_bytes), \
                    MAX(net_tx_bytes) - MIN(net_tx_bytes), \
                    MAX(blk_read_bytes) - MIN(blk_read_bytes), \
                    MAX(blk_write_bytes) - MIN(blk_write_bytes), \
                    COUNT(*) \
             FROM usage_samples \
             WHERE sampled_at >= $1 AND sampled_at < $2 \
             GROUP BY resource_type, resource_id, owner_id, runner_id \
             ON CONFLICT (resource_id, bucket_start) DO UPDATE SET \
             avg_cpu_percent = EXCLUDED.avg_cpu_percent, \
             avg_memory_bytes = EXCLUDED.avg_memory_bytes, \
             net_rx_bytes = EXCLUDED.net_rx_bytes, \
             net_tx_bytes = EXCLUDED.net_tx_bytes, \
             blk_read_bytes = EXCLUDED.blk_read_bytes, \
             blk_write_bytes = EXCLUDED.blk_write_bytes, \
             sample_count = EXCLUDED.sample_count",
        )
        .bind(bucket_start)
        .bind(bucket_end)
        .execute(&self.pool)
        .await
        .transient("hourly usage rollup")?;
        Ok(done.rows_affected())
    }

    /// Roll the hourly rows of `[day_start, day_end)` into daily buckets.
    /// Gauge averages are weighted by each hour's sample count.
    pub async fn rollup_daily(
        &self,
        day_start: DateTime<Utc>,
        day_end: DateTime<Utc>,
    ) -> Result<u64> {
        let done = sqlx::query(
            "INSERT INTO usage_daily (resource_type, resource_id, owner_id, \
             runner_id, bucket_start, avg_cpu_percent, avg_memory_bytes, \
             net_rx_bytes, net_tx_bytes, blk_read_bytes, blk_write_bytes, sample_count) \
             SELECT resource_type, resource_id, owner_id, runner_id, $1, \
                    COALESCE(SUM(avg_cpu_percent * sample_count) / NULLIF(SUM(sample_count), 0), 0), \
                    COALESCE(SUM(avg_memory_bytes * sample_count) / NULLIF(SUM(sample_count), 0), 0), \
                    SUM(net_rx_bytes)::bigint, SUM(net_tx_bytes)::bigint, \
                    SUM(blk_read_bytes)::bigint, SUM(blk_write_bytes)::bigint, \
                    SUM(sample_count)::bigint \
             FROM usage_hourly \
             WHERE bucket_start >= $1 AND bucket_start < $2 \
             GROUP BY resource_type, resource_id, owner_id, runner_id \
             ON CONFLICT (resource_id, bucket_start) DO UPDATE SET \
             avg_cpu_percent = EXCLUDED.avg_cpu_percent, \
             avg_memory_bytes = EXCLUDED.avg_memory_bytes, \
             net_rx_bytes = EXCLUDED.net_rx_bytes, \
             net_tx_bytes = EXCLUDED.net_tx_bytes, \
             blk_read_bytes = EXCLUDED.blk_read_bytes, \
             blk_write_bytes = EXCLUDED.blk_write_bytes, \
             sample_count = EXCLUDED.sample_count",
        )
        .bind(day_start)
        .bind(day_end)
        .execute(&self.pool)
        .await
        .transient("daily usage rollup")?;
        Ok(done.rows_affected())
    }

    /// Drop raw samples older than the retention window.
    pub async fn prune_usage_samples(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let done = sqlx::query("DELETE FROM usage_samples WHERE sampled_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await
            .transient("pruning usage samples")?;
        Ok(done.rows_affected())
    }
}
