// =============================================================================
// Fleet Monitor — distributed workload monitor for a trading-bot control plane
// =============================================================================
//
// Supervises two classes of containerized workloads (long-running bots,
// one-shot backtests) and the runners that host their datasets. Each
// control-plane instance registers itself in a coordination store, shards
// the workload set over the live instances by consistent hashing, and runs
// ticker-driven reconcilers that fold observed runtime state back into the
// database, pull telemetry from live bots, sync trades, sample resource
// usage for billing, and emit lifecycle events.
//
// The surrounding control plane supplies the consumed contracts: the
// container runtime ([`runtime::RuntimeFactory`]), pub/sub
// ([`events::EventBus`]), alerting ([`alerts::AlertSink`]), the object store
// and dataset fetcher for downloads, and an optional billing deductor.
// =============================================================================

pub mod alerts;
pub mod config;
pub mod coordination;
pub mod error;
pub mod events;
pub mod freqtrade;
pub mod manager;
pub mod monitor;
pub mod runtime;
pub mod store;
pub mod types;

pub use config::MonitorConfig;
pub use error::{MonitorError, Result};
pub use manager::{Manager, ManagerDeps};
pub use store::Store;

use tracing_subscriber::EnvFilter;

/// Initialise the process-wide tracing subscriber the way the monitor's
/// binaries and integration harnesses expect: env-filtered, defaulting to
/// `info`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}
