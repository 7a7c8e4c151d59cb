// =============================================================================
// Bot HTTP API payloads
// =============================================================================
//
// Every field carries a serde default: bots across upstream versions omit
// fields freely, and a missing scalar must never fail the whole fetch.
// =============================================================================

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::TradeUpsert;

/// Scalar bundle returned by `GET /profit`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProfitResponse {
    #[serde(default)]
    pub profit_closed_coin: f64,
    #[serde(default)]
    pub profit_closed_percent: f64,
    #[serde(default)]
    pub profit_all_coin: f64,
    #[serde(default)]
    pub profit_all_percent: f64,
    #[serde(default)]
    pub trade_count: i64,
    #[serde(default)]
    pub closed_trade_count: i64,
    #[serde(default)]
    pub winning_trades: i64,
    #[serde(default)]
    pub losing_trades: i64,
    #[serde(default)]
    pub winrate: f64,
    #[serde(default)]
    pub expectancy: f64,
    #[serde(default)]
    pub profit_factor: f64,
    #[serde(default)]
    pub max_drawdown: f64,
    #[serde(default)]
    pub max_drawdown_abs: f64,
    #[serde(default)]
    pub best_pair: String,
    #[serde(default)]
    pub best_rate: f64,
    /// Unix seconds; zero means "no trade yet".
    #[serde(default)]
    pub first_trade_timestamp: i64,
    #[serde(default)]
    pub latest_trade_timestamp: i64,
}

impl ProfitResponse {
    /// Open trades are derived rather than trusting two upstream counters
    /// independently.
    pub fn open_trade_count(&self) -> i64 {
        (self.trade_count - self.closed_trade_count).max(0)
    }
}

/// Convert an upstream unix-seconds stamp, treating zero as unset.
pub fn timestamp_secs(secs: i64) -> Option<DateTime<Utc>> {
    if secs <= 0 {
        return None;
    }
    Utc.timestamp_opt(secs, 0).single()
}

/// Paginated envelope returned by `GET /trades`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TradesResponse {
    #[serde(default)]
    pub trades: Vec<Value>,
    #[serde(default)]
    pub total_trades: i64,
}

/// One upstream trade, decoded from the raw record. The raw JSON is kept
/// alongside so the persisted snapshot stays verbatim.
#[derive(Debug, Clone, Deserialize)]
pub struct TradeRecord {
    pub trade_id: i64,
    #[serde(default)]
    pub pair: String,
    #[serde(default)]
    pub is_open: bool,
    #[serde(default)]
    pub is_short: bool,
    /// Unix milliseconds.
    #[serde(default)]
    pub open_timestamp: i64,
    #[serde(default)]
    pub close_timestamp: Option<i64>,
    #[serde(default)]
    pub open_rate: f64,
    #[serde(default)]
    pub close_rate: Option<f64>,
    #[serde(default)]
    pub amount: f64,
    #[serde(default)]
    pub stake_amount: f64,
    #[serde(default)]
    pub profit_abs: Option<f64>,
    #[serde(default)]
    pub profit_ratio: Option<f64>,
    #[serde(default)]
    pub strategy: String,
    /// Integer minutes; zero means unknown.
    #[serde(default)]
    pub timeframe: i64,
    #[serde(default)]
    pub sell_reason: Option<String>,
}

impl TradeRecord {
    pub fn open_date(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.open_timestamp)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    pub fn close_date(&self) -> Option<DateTime<Utc>> {
        self.close_timestamp
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }

    /// Identity key at millisecond granularity, matching the full-precision
    /// open_date in the trade table's composite natural key.
    pub fn composite_key(&self) -> (i64, i64) {
        (self.trade_id, self.open_date().timestamp_millis())
    }

    pub fn side(&self) -> &'static str {
        if self.is_short {
            "short"
        } else {
            "long"
        }
    }

    /// Row content for the sync upsert.
    pub fn to_upsert(&self, raw: Value) -> TradeUpsert {
        let timeframe = format_timeframe(self.timeframe);
        TradeUpsert {
            freqtrade_trade_id: self.trade_id,
            pair: self.pair.clone(),
            is_open: self.is_open,
            open_date: self.open_date(),
            close_date: self.close_date(),
            open_rate: self.open_rate,
            close_rate: self.close_rate,
            amount: self.amount,
            stake_amount: self.stake_amount,
            profit_abs: self.profit_abs.unwrap_or(0.0),
            profit_ratio: self.profit_ratio.unwrap_or(0.0),
            strategy_name: self.strategy.clone(),
            timeframe: if timeframe.is_empty() {
                None
            } else {
                Some(timeframe.to_string())
            },
            sell_reason: self.sell_reason.clone(),
            raw,
        }
    }
}

/// Canonical timeframe buckets, ascending.
const TIMEFRAMES: [(i64, &str); 8] = [
    (1, "1m"),
    (5, "5m"),
    (15, "15m"),
    (30, "30m"),
    (60, "1h"),
    (240, "4h"),
    (1440, "1d"),
    (10080, "1w"),
];

/// Map an upstream minute count to the largest canonical bucket not exceeding
/// it. Zero (or negative) means unknown and maps to the empty string.
pub fn format_timeframe(minutes: i64) -> &'static str {
    let mut result = "";
    for (bucket_minutes, label) in TIMEFRAMES {
        if minutes >= bucket_minutes {
            result = label;
        } else {
            break;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn timeframe_exact_buckets() {
        assert_eq!(format_timeframe(1), "1m");
        assert_eq!(format_timeframe(5), "5m");
        assert_eq!(format_timeframe(15), "15m");
        assert_eq!(format_timeframe(30), "30m");
        assert_eq!(format_timeframe(60), "1h");
        assert_eq!(format_timeframe(240), "4h");
        assert_eq!(format_timeframe(1440), "1d");
        assert_eq!(format_timeframe(10080), "1w");
    }

    #[test]
    fn timeframe_rounds_down_and_handles_unknown() {
        assert_eq!(format_timeframe(0), "");
        assert_eq!(format_timeframe(-5), "");
        assert_eq!(format_timeframe(7), "5m");
        assert_eq!(format_timeframe(90), "1h");
        assert_eq!(format_timeframe(100_000), "1w");
    }

    #[test]
    fn timeframe_is_monotone() {
        let order = |label: &str| {
            TIMEFRAMES
                .iter()
                .position(|(_, l)| *l == label)
                .map(|i| i as i64)
                .unwrap_or(-1)
        };
        let mut previous = -1;
        for minutes in 0..=11_000 {
            let rank = order(format_timeframe(minutes));
            assert!(
                rank >= previous,
                "bucket order regressed at {minutes} minutes"
            );
            previous = rank;
        }
    }

    #[test]
    fn profit_open_count_is_derived() {
        let profit = ProfitResponse {
            trade_count: 10,
            closed_trade_count: 7,
            ..Default::default()
        };
        assert_eq!(profit.open_trade_count(), 3);

        // A bot reporting more closed than total must not go negative.
        let odd = ProfitResponse {
            trade_count: 3,
            closed_trade_count: 5,
            ..Default::default()
        };
        assert_eq!(odd.open_trade_count(), 0);
    }

    #[test]
    fn zero_timestamps_are_unset() {
        assert_eq!(timestamp_secs(0), None);
        assert!(timestamp_secs(1_700_000_000).is_some());
    }

    #[test]
    fn trade_record_decodes_and_keys_on_milliseconds() {
        let raw = json!({
            "trade_id": 42,
            "pair": "ETH/USDT",
            "is_open": false,
            "open_timestamp": 1_700_000_000_500_i64,
            "close_timestamp": 1_700_003_600_000_i64,
            "open_rate": 2000.0,
            "close_rate": 2040.0,
            "amount": 0.5,
            "stake_amount": 1000.0,
            "profit_abs": 20.0,
            "profit_ratio": 0.02,
            "strategy": "Momentum",
            "timeframe": 5,
            "sell_reason": "roi"
        });
        let record: TradeRecord = serde_json::from_value(raw.clone()).unwrap();
        // The sub-second component stays in the key.
        assert_eq!(record.composite_key(), (42, 1_700_000_000_500));

        let upsert = record.to_upsert(raw);
        assert_eq!(upsert.timeframe.as_deref(), Some("5m"));
        assert_eq!(upsert.sell_reason.as_deref(), Some("roi"));
        assert!((upsert.profit_abs - 20.0).abs() < f64::EPSILON);
    }
}
