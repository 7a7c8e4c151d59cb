// =============================================================================
// Freqtrade-style bot HTTP API
// =============================================================================

pub mod client;
pub mod types;

pub use client::BotApiClient;
pub use types::{format_timeframe, ProfitResponse, TradeRecord, TradesResponse};
