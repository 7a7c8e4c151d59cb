// =============================================================================
// UsageAggregator — hourly and daily rollups of the raw sample stream
// =============================================================================
//
// Runs once per hour, five minutes past the boundary so the hour being
// rolled up is complete. The hourly rollup averages the gauges and takes
// max-minus-min deltas of the cumulative counters; when the just-closed hour
// is the day's 23rd, the preceding day is rolled up as well. Afterwards the
// configured billing deductor (if any) is invoked and raw samples past
// retention are pruned. The whole worker is strictly serial.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Timelike, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::store::Store;

/// Offset past the hour boundary at which a run fires.
const RUN_OFFSET: Duration = Duration::from_secs(5 * 60);

/// Billing hook invoked after each hourly rollup.
#[async_trait]
pub trait BillingDeductor: Send + Sync {
    async fn deduct_hour(
        &self,
        bucket_start: DateTime<Utc>,
        bucket_end: DateTime<Utc>,
    ) -> Result<()>;
}

/// Truncate to the containing wall-clock hour.
pub fn hour_floor(at: DateTime<Utc>) -> DateTime<Utc> {
    let secs = at.timestamp();
    Utc.timestamp_opt(secs - secs.rem_euclid(3600), 0)
        .single()
        .expect("hour boundary is a valid timestamp")
}

/// Truncate to the containing UTC day.
pub fn day_floor(at: DateTime<Utc>) -> DateTime<Utc> {
    let secs = at.timestamp();
    Utc.timestamp_opt(secs - secs.rem_euclid(86_400), 0)
        .single()
        .expect("day boundary is a valid timestamp")
}

/// The next wall-clock instant at which an aggregation run fires: five
/// minutes past the next hour boundary, strictly after `now`.
pub fn next_run_at(now: DateTime<Utc>) -> DateTime<Utc> {
    let this_hour_run =
        hour_floor(now) + chrono::Duration::from_std(RUN_OFFSET).expect("offset fits");
    if this_hour_run > now {
        this_hour_run
    } else {
        this_hour_run + chrono::Duration::hours(1)
    }
}

pub struct UsageAggregator {
    store: Store,
    deductor: Option<Arc<dyn BillingDeductor>>,
    retention: Duration,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UsageAggregator {
    pub fn new(
        store: Store,
        deductor: Option<Arc<dyn BillingDeductor>>,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            deductor,
            retention,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn start(self: &Arc<Self>) {
        let aggregator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            aggregator.run_loop().await;
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
        info!("usage aggregator started");
        loop {
            let now = Utc::now();
            let next = next_run_at(now);
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            debug!(next_run = %next, "usage aggregator sleeping");

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("usage aggregator stopped");
                    return;
                }
                _ = tokio::time::sleep(wait) => {
                    self.aggregate(Utc::now()).await;
                }
            }
        }
    }

    /// One aggregation run: previous hour, possibly previous day, billing,
    /// pruning.
    pub async fn aggregate(&self, now: DateTime<Utc>) {
        let bucket_end = hour_floor(now);
        let bucket_start = bucket_end - chrono::Duration::hours(1);

        match self.store.rollup_hourly(bucket_start, bucket_end).await {
            Ok(rows) => {
                info!(bucket_start = %bucket_start, rows, "hourly usage rolled up")
            }
            Err(e) => {
                warn!(bucket_start = %bucket_start, error = %e, "hourly rollup failed");
                return;
            }
        }

        // After the 23:00–24:00 bucket closes the day is complete.
        if bucket_start.hour() == 23 {
            let day_start = day_floor(bucket_start);
            let day_end = day_start + chrono::Duration::days(1);
            match self.store.rollup_daily(day_start, day_end).await {
                Ok(rows) => info!(day = %day_start, rows, "daily usage rolled up"),
                Err(e) => warn!(day = %day_start, error = %e, "daily rollup failed"),
            }
        }

        if let Some(deductor) = &self.deductor {
            if let Err(e) = deductor.deduct_hour(bucket_start, bucket_end).await {
                warn!(bucket_start = %bucket_start, error = %e, "billing deduction failed");
            }
        }

        let cutoff = now - chrono::Duration::from_std(self.retention).unwrap_or_default();
        match self.store.prune_usage_samples(cutoff).await {
            Ok(pruned) if pruned > 0 => {
                info!(pruned, cutoff = %cutoff, "old usage samples pruned")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "usage sample pruning failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, h, m, s).unwrap()
    }

    #[test]
    fn hour_floor_truncates() {
        assert_eq!(hour_floor(at(10, 42, 17)), at(10, 0, 0));
        assert_eq!(hour_floor(at(10, 0, 0)), at(10, 0, 0));
    }

    #[test]
    fn next_run_is_five_past_the_hour() {
        // Before this hour's offset: run at HH:05.
        assert_eq!(next_run_at(at(10, 3, 0)), at(10, 5, 0));
        // At or past the offset: run next hour.
        assert_eq!(next_run_at(at(10, 5, 0)), at(11, 5, 0));
        assert_eq!(next_run_at(at(10, 42, 0)), at(11, 5, 0));
    }

    #[test]
    fn day_floor_truncates_to_midnight() {
        assert_eq!(day_floor(at(23, 59, 59)), at(0, 0, 0));
    }

    #[test]
    fn daily_rollup_fires_only_after_last_hour() {
        // Running at 00:05 closes the 23:00 bucket of the previous day.
        let run = Utc.with_ymd_and_hms(2026, 3, 15, 0, 5, 0).unwrap();
        let bucket_start = hour_floor(run) - chrono::Duration::hours(1);
        assert_eq!(bucket_start.hour(), 23);

        // Any other hour does not.
        let run = at(13, 5, 0);
        let bucket_start = hour_floor(run) - chrono::Duration::hours(1);
        assert_ne!(bucket_start.hour(), 23);
    }
}
