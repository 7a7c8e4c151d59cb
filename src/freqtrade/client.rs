// =============================================================================
// Bot HTTP API client — basic-auth REST against a running bot
// =============================================================================
//
// The transport and base URL come from the runtime abstraction, so the same
// client works over a Docker bridge network, in-cluster, or through an
// API-server proxy. Credentials come from the bot's secure config and are
// never logged.
// =============================================================================

use serde_json::Value;
use tracing::debug;

use crate::error::{IoContext, MonitorError, Result};
use crate::store::models::ApiServerConfig;

use super::types::{ProfitResponse, TradeRecord, TradesResponse};

/// Page size for trade pagination.
const TRADES_PAGE_SIZE: usize = 500;

/// Hard ceiling on pages per sync, against a bot that misreports its total.
const TRADES_MAX_PAGES: usize = 200;

/// REST client for one bot's HTTP API.
#[derive(Clone)]
pub struct BotApiClient {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl BotApiClient {
    /// Build a client from the runtime-supplied transport and the bot's
    /// api_server credentials.
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, auth: &ApiServerConfig) -> Self {
        let base_url = base_url.into();
        let base_url = base_url.trim_end_matches('/').to_string();
        Self {
            client,
            base_url,
            username: auth.username.clone(),
            password: auth.password.clone(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .transient("bot api request")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(MonitorError::transient(
                "bot api response",
                anyhow::anyhow!("GET {path} returned {status}: {body}"),
            ));
        }

        resp.json().await.transient("decoding bot api response")
    }

    /// `GET /profit` — the performance scalar bundle.
    pub async fn profit(&self) -> Result<ProfitResponse> {
        let profit: ProfitResponse = self.get_json("/profit").await?;
        debug!(
            trade_count = profit.trade_count,
            closed = profit.closed_trade_count,
            "profit fetched"
        );
        Ok(profit)
    }

    /// One page of `GET /trades`.
    pub async fn trades_page(&self, limit: usize, offset: usize) -> Result<TradesResponse> {
        self.get_json(&format!("/trades?limit={limit}&offset={offset}"))
            .await
    }

    /// Fetch the full upstream trade list, paginating until a short page
    /// arrives or the advertised total is reached. Records that fail to
    /// decode are skipped rather than failing the sync.
    pub async fn all_trades(&self) -> Result<Vec<(TradeRecord, Value)>> {
        let mut collected: Vec<(TradeRecord, Value)> = Vec::new();
        let mut offset = 0usize;

        for _ in 0..TRADES_MAX_PAGES {
            let page = self.trades_page(TRADES_PAGE_SIZE, offset).await?;
            let page_len = page.trades.len();

            for raw in page.trades {
                match serde_json::from_value::<TradeRecord>(raw.clone()) {
                    Ok(record) => collected.push((record, raw)),
                    Err(e) => {
                        debug!(error = %e, "skipping undecodable trade record");
                    }
                }
            }

            offset += page_len;
            let total = page.total_trades.max(0) as usize;
            if page_len < TRADES_PAGE_SIZE || (total > 0 && offset >= total) {
                break;
            }
        }

        debug!(count = collected.len(), "trades fetched");
        Ok(collected)
    }
}

impl std::fmt::Debug for BotApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotApiClient")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn auth() -> ApiServerConfig {
        let secure = json!({"api_server": {"username": "bot", "password": "pw"}});
        ApiServerConfig::from_secure_config(&secure).unwrap()
    }

    #[tokio::test]
    async fn profit_decodes_scalars() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/profit"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "profit_all_coin": 12.5,
                "trade_count": 10,
                "closed_trade_count": 7,
                "winrate": 0.6
            })))
            .mount(&server)
            .await;

        let client = BotApiClient::new(reqwest::Client::new(), server.uri(), &auth());
        let profit = client.profit().await.unwrap();
        assert_eq!(profit.trade_count, 10);
        assert_eq!(profit.open_trade_count(), 3);
        assert!((profit.winrate - 0.6).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn non_success_status_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/profit"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = BotApiClient::new(reqwest::Client::new(), server.uri(), &auth());
        let err = client.profit().await.unwrap_err();
        assert!(matches!(err, MonitorError::Transient { .. }));
    }

    #[tokio::test]
    async fn trades_pagination_stops_on_short_page() {
        let server = MockServer::start().await;
        let trade = |id: i64| {
            json!({
                "trade_id": id,
                "pair": "BTC/USDT",
                "is_open": false,
                "open_timestamp": 1_700_000_000_000_i64 + id
            })
        };

        Mock::given(method("GET"))
            .and(path("/trades"))
            .and(query_param("offset", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "trades": [trade(1), trade(2)],
                "total_trades": 2
            })))
            .mount(&server)
            .await;

        let client = BotApiClient::new(reqwest::Client::new(), server.uri(), &auth());
        let trades = client.all_trades().await.unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[1].0.trade_id, 2);
    }

    #[test]
    fn debug_redacts_password() {
        let client = BotApiClient::new(reqwest::Client::new(), "http://bot:8080", &auth());
        let debug = format!("{client:?}");
        assert!(!debug.contains("pw\""), "{debug}");
        assert!(debug.contains("<redacted>"));
    }
}
