// =============================================================================
// Monitor error kinds
// =============================================================================
//
// Every fallible path in the monitor resolves to one of five kinds. Callers
// (and the reconciler loops themselves) branch on the kind, never on error
// strings:
//
//   Transient          — runtime API, HTTP, coordination store, or database
//                        I/O hiccup. The next tick retries.
//   NotFound           — the runtime's "container does not exist" sentinel.
//                        Drives a legitimate transition to `stopped`.
//   Semantic           — bad or missing data (no api_server block, runner
//                        edge missing, malformed progress map). Recorded on
//                        the workload, never poisons the tick.
//   ResourceExhausted  — decompression cap hit, upload refused. Terminates a
//                        data-download task; never retried automatically.
//   Startup            — the Manager could not bring a component up.
// =============================================================================

use thiserror::Error;

/// The closed error set the monitor exposes to its callers.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Recoverable I/O failure; retried on the next reconciliation tick.
    #[error("transient i/o failure: {context}: {source}")]
    Transient {
        context: String,
        #[source]
        source: anyhow::Error,
    },

    /// The runtime does not know the workload. Not a failure.
    #[error("{0} not found")]
    NotFound(String),

    /// The data we were handed does not make sense.
    #[error("{0}")]
    Semantic(String),

    /// A hard cap was exceeded; the operation is dead, not retryable.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A component failed to start; surfaced from `Manager::start`.
    #[error("startup failed: {0}")]
    Startup(String),
}

impl MonitorError {
    /// Wrap any error as a transient I/O failure with context.
    pub fn transient(context: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::Transient {
            context: context.into(),
            source: source.into(),
        }
    }

    /// True for the runtime's "container does not exist" sentinel.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;

/// Extension for tagging I/O results as transient with a context string,
/// mirroring how `anyhow::Context` reads at call sites.
pub trait IoContext<T> {
    fn transient(self, context: &str) -> Result<T>;
}

impl<T, E> IoContext<T> for std::result::Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn transient(self, context: &str) -> Result<T> {
        self.map_err(|e| MonitorError::transient(context, e))
    }
}
