// =============================================================================
// Trade sync — incremental, reset-tolerant ingestion from the bot API
// =============================================================================
//
// The sync must stay incremental (closed trades are not re-shipped every
// tick), survive upstream resets (a wiped bot replays trade IDs from 1), and
// stay memory-bounded no matter how much closed history a bot has. The
// classification core is pure; the surrounding function does the I/O under a
// single deadline.
//
// Sync state lives in bot_metrics: `last_synced_trade_id` is the highest ID
// durably persisted, `last_known_max_trade_id` the highest ever observed.
// The latter only ratchets upward, which is what lets the reset detector
// fire and then recover idempotently on the very next tick.
// =============================================================================

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::alerts::{AlertSink, TradeAlert};
use crate::error::{MonitorError, Result};
use crate::events::{
    trade_owner_topic, trade_topic, TradeEvent, TradeEventStatus,
};
use crate::events::EventBus;
use crate::freqtrade::client::BotApiClient;
use crate::freqtrade::types::TradeRecord;
use crate::store::models::{Bot, TradeSyncState};
use crate::store::Store;

/// Overall deadline for one sync pass, fetch included.
const SYNC_DEADLINE: Duration = Duration::from_secs(30);

/// Only trades opened inside this window (plus all open trades) are loaded
/// for comparison.
const COMPARISON_WINDOW_DAYS: i64 = 7;

// =============================================================================
// Pure planning core
// =============================================================================

/// An upstream wipe shows up as the advertised max ID dropping below the
/// highest ID we have ever seen.
pub fn detect_reset(api_max: i64, state: TradeSyncState) -> bool {
    state.last_known_max_trade_id > 0 && api_max < state.last_known_max_trade_id
}

/// Index sets into the upstream slice, one classification per concern.
#[derive(Debug, Default, Clone)]
pub struct SyncPlan {
    /// Rows to upsert this pass.
    pub to_sync: Vec<usize>,
    /// Trades whose composite key the database has never seen.
    pub new_trades: Vec<usize>,
    /// Trades observed closing this pass (brand new and already closed, or
    /// previously open in the database).
    pub closed_trades: Vec<usize>,
}

/// Classify the upstream payload against the loaded database subset.
///
/// `last_synced` must already account for a detected reset (callers pass 0
/// in that case).
pub fn classify_trades(
    upstream: &[TradeRecord],
    existing_keys: &HashSet<(i64, i64)>,
    open_keys: &HashSet<(i64, i64)>,
    last_synced: i64,
) -> SyncPlan {
    let mut plan = SyncPlan::default();

    for (index, trade) in upstream.iter().enumerate() {
        let key = trade.composite_key();
        let is_new = !existing_keys.contains(&key);

        if trade.trade_id > last_synced || trade.is_open || is_new {
            plan.to_sync.push(index);
        }
        if is_new {
            plan.new_trades.push(index);
        }
        if !trade.is_open && (is_new || open_keys.contains(&key)) {
            plan.closed_trades.push(index);
        }
    }

    plan
}

// =============================================================================
// Sync pass
// =============================================================================

/// Counts reported back to the reconciler for logging.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncOutcome {
    pub fetched: usize,
    pub synced: usize,
    pub opened: usize,
    pub closed: usize,
    pub reset: bool,
}

/// Run one full sync pass for a bot, bounded by [`SYNC_DEADLINE`].
pub async fn sync_bot_trades(
    store: &Store,
    bus: &dyn EventBus,
    alerts: &dyn AlertSink,
    bot: &Bot,
    api: &BotApiClient,
) -> Result<SyncOutcome> {
    tokio::time::timeout(SYNC_DEADLINE, sync_inner(store, bus, alerts, bot, api))
        .await
        .map_err(|_| {
            MonitorError::transient(
                "trade sync",
                anyhow::anyhow!("deadline of {SYNC_DEADLINE:?} exceeded"),
            )
        })?
}

async fn sync_inner(
    store: &Store,
    bus: &dyn EventBus,
    alerts: &dyn AlertSink,
    bot: &Bot,
    api: &BotApiClient,
) -> Result<SyncOutcome> {
    let now = Utc::now();
    let (records, mut raws): (Vec<TradeRecord>, Vec<Value>) =
        api.all_trades().await?.into_iter().unzip();

    let api_max = records.iter().map(|r| r.trade_id).max().unwrap_or(0);
    let state = store.trade_sync_state(bot.id).await?;
    let reset = detect_reset(api_max, state);
    if reset {
        warn!(
            bot_id = %bot.id,
            api_max,
            last_known_max = state.last_known_max_trade_id,
            "upstream trade reset detected, resyncing from scratch"
        );
    }

    // The comparison subset: open trades plus the recent window. After a
    // reset the old open set belongs to the dead epoch, so only the window
    // is loaded.
    let since = now - chrono::Duration::days(COMPARISON_WINDOW_DAYS);
    let comparison = store.comparison_trades(bot.id, since, !reset).await?;

    let mut existing_keys: HashSet<(i64, i64)> = HashSet::with_capacity(comparison.len());
    let mut open_keys: HashSet<(i64, i64)> = HashSet::new();
    for trade in &comparison {
        let key = (trade.freqtrade_trade_id, trade.open_date.timestamp_millis());
        if trade.is_open {
            open_keys.insert(key);
        }
        existing_keys.insert(key);
    }

    let last_synced = if reset { 0 } else { state.last_synced_trade_id };
    let plan = classify_trades(&records, &existing_keys, &open_keys, last_synced);

    // Upsert the changed rows under the composite natural key.
    let rows: Vec<_> = plan
        .to_sync
        .iter()
        .map(|&i| records[i].to_upsert(std::mem::take(&mut raws[i])))
        .collect();
    store.upsert_trades(bot.id, &rows).await?;

    publish_trade_events(bus, bot, &records, &plan, now).await;
    emit_grouped_alerts(alerts, bot, &records, &plan).await;

    store.update_trade_sync_state(bot.id, api_max, now).await?;

    let outcome = SyncOutcome {
        fetched: records.len(),
        synced: plan.to_sync.len(),
        opened: plan.new_trades.len(),
        closed: plan.closed_trades.len(),
        reset,
    };
    if outcome.synced > 0 {
        info!(
            bot_id = %bot.id,
            fetched = outcome.fetched,
            synced = outcome.synced,
            opened = outcome.opened,
            closed = outcome.closed,
            reset = outcome.reset,
            "trade sync pass finished"
        );
    } else {
        debug!(bot_id = %bot.id, fetched = outcome.fetched, "trade sync: nothing to do");
    }
    Ok(outcome)
}

/// Per-trade events for everything that changed: new trades and closes.
async fn publish_trade_events(
    bus: &dyn EventBus,
    bot: &Bot,
    records: &[TradeRecord],
    plan: &SyncPlan,
    now: DateTime<Utc>,
) {
    let mut published: HashSet<usize> = HashSet::new();
    let indices = plan.new_trades.iter().chain(plan.closed_trades.iter());

    for &index in indices {
        if !published.insert(index) {
            continue;
        }
        let record = &records[index];
        let event = TradeEvent {
            kind: "trade_update".to_string(),
            trade_id: record.trade_id,
            bot_id: bot.id,
            pair: record.pair.clone(),
            side: record.side().to_string(),
            status: if record.is_open {
                TradeEventStatus::Open
            } else {
                TradeEventStatus::Closed
            },
            profit_pct: record.profit_ratio.unwrap_or(0.0) * 100.0,
            timestamp: now,
        };
        let payload = match serde_json::to_value(&event) {
            Ok(payload) => payload,
            Err(_) => continue,
        };

        for topic in [trade_topic(bot.id), trade_owner_topic(bot.owner_id)] {
            if let Err(e) = bus.publish(&topic, payload.clone()).await {
                warn!(bot_id = %bot.id, topic, error = %e, "trade event publish failed");
            }
        }
    }
}

/// One alert per event class per pass, never one per trade.
async fn emit_grouped_alerts(
    alerts: &dyn AlertSink,
    bot: &Bot,
    records: &[TradeRecord],
    plan: &SyncPlan,
) {
    let alert = |index: &usize| {
        let record = &records[*index];
        TradeAlert {
            trade_id: record.trade_id,
            pair: record.pair.clone(),
            open_rate: record.open_rate,
            close_rate: record.close_rate,
            profit_ratio: record.profit_ratio.unwrap_or(0.0),
            sell_reason: record.sell_reason.clone(),
        }
    };

    let opened: Vec<TradeAlert> = plan.new_trades.iter().map(alert).collect();
    if !opened.is_empty() {
        alerts.trades_opened(bot, &opened).await;
    }

    let closed: Vec<TradeAlert> = plan.closed_trades.iter().map(alert).collect();
    if !closed.is_empty() {
        alerts.trades_closed(bot, &closed).await;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(trade_id: i64, is_open: bool, open_secs: i64) -> TradeRecord {
        serde_json::from_value(serde_json::json!({
            "trade_id": trade_id,
            "pair": "BTC/USDT",
            "is_open": is_open,
            "open_timestamp": open_secs * 1000,
            "profit_ratio": 0.01
        }))
        .unwrap()
    }

    fn keys(records: &[TradeRecord]) -> HashSet<(i64, i64)> {
        records.iter().map(|r| r.composite_key()).collect()
    }

    #[test]
    fn reset_detection() {
        let state = TradeSyncState {
            last_synced_trade_id: 100,
            last_known_max_trade_id: 100,
        };
        assert!(detect_reset(5, state));
        assert!(!detect_reset(100, state));
        assert!(!detect_reset(150, state));

        // A brand-new bot has no memory to reset against.
        assert!(!detect_reset(0, TradeSyncState::default()));
    }

    #[test]
    fn incremental_pass_only_ships_new_and_open() {
        // DB already has 1..=5, trade 5 open. Upstream reports 1..=7 with 7
        // open.
        let db: Vec<TradeRecord> = (1..=5).map(|i| record(i, i == 5, 1000 + i)).collect();
        let upstream: Vec<TradeRecord> =
            (1..=7).map(|i| record(i, i == 7 || i == 5, 1000 + i)).collect();

        let existing = keys(&db);
        let open: HashSet<(i64, i64)> = db
            .iter()
            .filter(|r| r.is_open)
            .map(|r| r.composite_key())
            .collect();

        let plan = classify_trades(&upstream, &existing, &open, 5);

        // 6 and 7 are past the watermark, 5 is still open.
        let to_sync: Vec<i64> = plan.to_sync.iter().map(|&i| upstream[i].trade_id).collect();
        assert_eq!(to_sync, vec![5, 6, 7]);

        let new: Vec<i64> = plan.new_trades.iter().map(|&i| upstream[i].trade_id).collect();
        assert_eq!(new, vec![6, 7]);

        // 6 arrived already closed; 7 is open; 5 stayed open.
        let closed: Vec<i64> = plan
            .closed_trades
            .iter()
            .map(|&i| upstream[i].trade_id)
            .collect();
        assert_eq!(closed, vec![6]);
    }

    #[test]
    fn previously_open_trade_closing_is_detected() {
        let db = vec![record(3, true, 1003)];
        let upstream = vec![record(3, false, 1003)];

        let plan = classify_trades(&upstream, &keys(&db), &keys(&db), 3);

        assert_eq!(plan.to_sync, vec![0], "closed-out trade must re-sync");
        assert!(plan.new_trades.is_empty());
        assert_eq!(plan.closed_trades, vec![0]);
    }

    #[test]
    fn reset_pass_reimports_everything_once() {
        // last known max 100; upstream replays IDs 1..=5 in a new epoch
        // (different open dates than anything in the window).
        let upstream: Vec<TradeRecord> =
            (1..=5).map(|i| record(i, false, 50_000 + i)).collect();

        let state = TradeSyncState {
            last_synced_trade_id: 100,
            last_known_max_trade_id: 100,
        };
        let api_max = upstream.iter().map(|r| r.trade_id).max().unwrap();
        assert!(detect_reset(api_max, state));

        // On reset the open set from the dead epoch is not loaded.
        let plan = classify_trades(&upstream, &HashSet::new(), &HashSet::new(), 0);

        assert_eq!(plan.to_sync.len(), 5);
        assert_eq!(plan.new_trades.len(), 5, "every replayed trade is new");
        assert_eq!(plan.closed_trades.len(), 5);
    }

    #[test]
    fn second_pass_over_same_payload_is_silent() {
        let upstream: Vec<TradeRecord> =
            (1..=4).map(|i| record(i, i == 4, 2000 + i)).collect();

        // First pass against an empty database.
        let first = classify_trades(&upstream, &HashSet::new(), &HashSet::new(), 0);
        assert_eq!(first.new_trades.len(), 4);

        // Second pass: the database now holds exactly what upstream reports
        // and the watermark advanced to the api max.
        let existing = keys(&upstream);
        let open: HashSet<(i64, i64)> = upstream
            .iter()
            .filter(|r| r.is_open)
            .map(|r| r.composite_key())
            .collect();
        let second = classify_trades(&upstream, &existing, &open, 4);

        assert!(second.new_trades.is_empty(), "no alerts on the second run");
        assert!(second.closed_trades.is_empty());
        // Open trades keep syncing for fresh profit numbers; that upsert is
        // idempotent.
        let resynced: Vec<i64> = second.to_sync.iter().map(|&i| upstream[i].trade_id).collect();
        assert_eq!(resynced, vec![4]);
    }

    #[test]
    fn same_id_different_epoch_is_a_distinct_row() {
        // Trade 1 from the old epoch is in the DB; the replayed trade 1 has
        // a different open date and must be treated as new.
        let old_epoch = record(1, false, 1_000);
        let new_epoch = record(1, false, 9_000);
        assert_ne!(old_epoch.composite_key(), new_epoch.composite_key());

        let existing: HashSet<(i64, i64)> = [old_epoch.composite_key()].into();
        let plan = classify_trades(
            std::slice::from_ref(&new_epoch),
            &existing,
            &HashSet::new(),
            0,
        );
        assert_eq!(plan.new_trades, vec![0]);
    }

    #[test]
    fn scenario_reset_watermarks() {
        // DB watermark state after the S3 reset pass: every upstream trade
        // classified for sync, api max becomes the new last_synced while the
        // known max ratchet stays put (enforced by the store's GREATEST).
        let upstream: Vec<TradeRecord> =
            (1..=3).map(|i| record(i, false, 7_000 + i)).collect();
        let state = TradeSyncState {
            last_synced_trade_id: 5,
            last_known_max_trade_id: 5,
        };
        let api_max = upstream.iter().map(|r| r.trade_id).max().unwrap();

        assert!(detect_reset(api_max, state));
        let plan = classify_trades(&upstream, &HashSet::new(), &HashSet::new(), 0);
        assert_eq!(plan.new_trades.len(), 3);
        assert_eq!(api_max, 3);
        assert!(state.last_known_max_trade_id.max(api_max) >= 5);
    }

    #[test]
    fn chrono_millisecond_key_matches_store_key() {
        let record = record(9, true, 1_700_000_000);
        let open_date = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        assert_eq!(record.composite_key(), (9, open_date.timestamp_millis()));
    }

    #[test]
    fn same_second_different_millisecond_is_new() {
        // A replay can land in the same wall-clock second as a pre-reset row
        // still inside the comparison window; the sub-second component keeps
        // the keys distinct, matching the table's unique index.
        let stored = record(3, false, 1_700_000_000);
        let mut replayed = stored.clone();
        replayed.open_timestamp += 250;
        assert_ne!(stored.composite_key(), replayed.composite_key());

        let existing: HashSet<(i64, i64)> = [stored.composite_key()].into();
        let plan = classify_trades(
            std::slice::from_ref(&replayed),
            &existing,
            &HashSet::new(),
            0,
        );
        assert_eq!(plan.new_trades, vec![0]);
    }
}
