// =============================================================================
// Alert sink — grouped notifications out of the reconcilers
// =============================================================================
//
// Grouping happens here in the monitor: one alert per bot per sync pass per
// event class, never one alert per trade. The sink itself (mail, webhook,
// chat) belongs to the embedding control plane; `LogAlerts` is the built-in
// sink that turns alerts into structured log events.
// =============================================================================

use async_trait::async_trait;

use crate::store::models::{Backtest, BacktestSummary, Bot};

/// A trade as carried inside an opened/closed alert.
#[derive(Debug, Clone)]
pub struct TradeAlert {
    pub trade_id: i64,
    pub pair: String,
    pub open_rate: f64,
    pub close_rate: Option<f64>,
    pub profit_ratio: f64,
    pub sell_reason: Option<String>,
}

/// Downstream notification surface. Implementations must not block the
/// reconciler for long; failures are logged by the caller and never fail a
/// tick.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// One grouped alert for all trades a sync pass discovered as new.
    async fn trades_opened(&self, bot: &Bot, trades: &[TradeAlert]);

    /// One grouped alert for all trades a sync pass observed closing, with
    /// exit reason, close rate, and profit.
    async fn trades_closed(&self, bot: &Bot, trades: &[TradeAlert]);

    /// A backtest reached a terminal state.
    async fn backtest_finished(
        &self,
        backtest: &Backtest,
        success: bool,
        error: Option<&str>,
        summary: Option<&BacktestSummary>,
    );
}

/// Structured-logging sink, the default when nothing richer is wired in.
#[derive(Debug, Default)]
pub struct LogAlerts;

#[async_trait]
impl AlertSink for LogAlerts {
    async fn trades_opened(&self, bot: &Bot, trades: &[TradeAlert]) {
        let pairs: Vec<&str> = trades.iter().map(|t| t.pair.as_str()).collect();
        tracing::info!(
            bot_id = %bot.id,
            bot_name = %bot.name,
            owner_id = %bot.owner_id,
            count = trades.len(),
            pairs = ?pairs,
            "trades opened"
        );
    }

    async fn trades_closed(&self, bot: &Bot, trades: &[TradeAlert]) {
        for t in trades {
            tracing::info!(
                bot_id = %bot.id,
                trade_id = t.trade_id,
                pair = %t.pair,
                close_rate = ?t.close_rate,
                profit_ratio = t.profit_ratio,
                sell_reason = ?t.sell_reason,
                "trade closed"
            );
        }
        tracing::info!(
            bot_id = %bot.id,
            owner_id = %bot.owner_id,
            count = trades.len(),
            "trades closed"
        );
    }

    async fn backtest_finished(
        &self,
        backtest: &Backtest,
        success: bool,
        error: Option<&str>,
        summary: Option<&BacktestSummary>,
    ) {
        if success {
            tracing::info!(
                backtest_id = %backtest.id,
                strategy_id = %backtest.strategy_id,
                owner_id = %backtest.owner_id,
                total_trades = summary.map(|s| s.total_trades).unwrap_or(0),
                win_rate = summary.map(|s| s.win_rate).unwrap_or(0.0),
                profit_total_abs = summary.map(|s| s.profit_total_abs).unwrap_or(0.0),
                "backtest completed"
            );
        } else {
            tracing::warn!(
                backtest_id = %backtest.id,
                strategy_id = %backtest.strategy_id,
                owner_id = %backtest.owner_id,
                error = error.unwrap_or("unknown"),
                "backtest failed"
            );
        }
    }
}
