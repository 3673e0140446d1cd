//! Read-only Betfair Exchange client: discovery, prices and session upkeep.
//!
//! Betting calls go through the JSON-RPC endpoint as single-element batches;
//! the keepalive goes to the identity SSO service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::types::BetfairConfig;
use crate::utils::time::filter_timestamp;

use super::{
    CatalogueRequest, ClientError, ClientResult, ExchangeApi, MarketBook, MarketCatalogue,
};

pub const BETTING_API_URL: &str = "https://api.betfair.com/exchange/betting/json-rpc/v1";
pub const KEEPALIVE_URL: &str = "https://identitysso.betfair.com/api/keepAlive";

const DEFAULT_MAX_RETRIES: u32 = 2;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct KeepAliveResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    error: Option<String>,
}

pub struct BetfairClient {
    http: Client,
    betting_url: String,
    keepalive_url: String,
    max_retries: u32,
}

impl BetfairClient {
    pub fn new() -> ClientResult<Self> {
        Self::with_endpoints(BETTING_API_URL, KEEPALIVE_URL)
    }

    pub fn with_endpoints(betting_url: &str, keepalive_url: &str) -> ClientResult<Self> {
        let http = Client::builder()
            .user_agent("market-recorder/0.1")
            .build()
            .map_err(ClientError::Http)?;

        Ok(Self {
            http,
            betting_url: betting_url.to_string(),
            keepalive_url: keepalive_url.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    fn backoff(attempt: u32) -> Duration {
        let capped = attempt.min(5);
        let millis = 500 * (1_u64 << capped);
        Duration::from_millis(millis.min(8_000))
    }

    fn request(&self, url: &str, creds: &BetfairConfig, timeout: Duration) -> reqwest::RequestBuilder {
        self.http
            .post(url)
            .timeout(timeout)
            .header("X-Application", &creds.app_key)
            .header("X-Authentication", &creds.session_token)
            .header("Accept", "application/json")
    }

    async fn rpc<T>(&self, creds: &BetfairConfig, method: &str, params: Value) -> ClientResult<T>
    where
        T: DeserializeOwned,
    {
        if !creds.has_credentials() {
            return Err(ClientError::MissingCredentials);
        }

        let payload = json!([{
            "jsonrpc": "2.0",
            "method": format!("SportsAPING/v1.0/{method}"),
            "params": params,
            "id": 1,
        }]);

        let mut attempt = 0;
        let responses: Vec<RpcResponse> = loop {
            let req = self
                .request(&self.betting_url, creds, REQUEST_TIMEOUT)
                .json(&payload);

            match req.send().await {
                Ok(resp) => {
                    if resp.status().is_success() {
                        break resp.json().await?;
                    }

                    if resp.status().is_server_error() && attempt < self.max_retries {
                        attempt += 1;
                        sleep(Self::backoff(attempt)).await;
                        continue;
                    }

                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    return Err(ClientError::HttpStatus { status, body });
                }
                Err(err) => {
                    if attempt < self.max_retries && !err.is_timeout() {
                        attempt += 1;
                        sleep(Self::backoff(attempt)).await;
                        continue;
                    }
                    return Err(ClientError::Http(err));
                }
            }
        };

        let first = responses
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::EmptyResponse(method.to_string()))?;

        if let Some(error) = first.error {
            return Err(rpc_error(method, &error));
        }

        let result = first
            .result
            .ok_or_else(|| ClientError::EmptyResponse(method.to_string()))?;
        if result.as_array().map(|a| a.is_empty()).unwrap_or(false) {
            debug!(target: "client", method, "API returned an empty list");
        }
        Ok(serde_json::from_value(result)?)
    }
}

/// Pull the structured code out of a JSON-RPC error body.
fn rpc_error(method: &str, error: &Value) -> ClientError {
    let code = error
        .pointer("/data/APINGException/errorCode")
        .and_then(Value::as_str)
        .map(str::to_string);
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    warn!(target: "client", method, code = ?code, message = %message, "API error");
    ClientError::Api {
        method: method.to_string(),
        code,
        message,
    }
}

pub fn catalogue_params(request: &CatalogueRequest) -> Value {
    let mut filter = json!({
        "eventTypeIds": [request.event_type_id],
        "marketCountries": request.countries,
        "marketStartTime": {
            "from": filter_timestamp(request.from),
            "to": filter_timestamp(request.to),
        },
    });
    if !request.market_types.is_empty() {
        filter["marketTypeCodes"] = json!(request.market_types);
    }

    json!({
        "filter": filter,
        "maxResults": request.max_results,
        "marketProjection": request.projections,
        "sort": "FIRST_TO_START",
    })
}

/// `listEventTypes` with an open filter; valid for any session whatever sport is recorded.
pub fn validation_params() -> Value {
    json!({ "filter": {} })
}

pub fn book_params(market_ids: &[String], price_data: &[String]) -> Value {
    json!({
        "marketIds": market_ids,
        "priceProjection": {
            "priceData": price_data,
            "virtualise": true,
        },
    })
}

#[async_trait]
impl ExchangeApi for BetfairClient {
    async fn keepalive(&self, creds: &BetfairConfig) -> ClientResult<()> {
        if creds.session_token.is_empty() {
            return Err(ClientError::MissingCredentials);
        }
        let resp = self
            .request(&self.keepalive_url, creds, KEEPALIVE_TIMEOUT)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::HttpStatus { status, body });
        }

        let body: KeepAliveResponse = resp.json().await?;
        if body.status == "SUCCESS" {
            Ok(())
        } else {
            Err(ClientError::Keepalive(
                body.error.unwrap_or_else(|| "unknown".to_string()),
            ))
        }
    }

    async fn validate_session(&self, creds: &BetfairConfig) -> ClientResult<()> {
        let _: Value = self
            .rpc(creds, "listEventTypes", validation_params())
            .await?;
        Ok(())
    }

    async fn list_market_catalogue(
        &self,
        creds: &BetfairConfig,
        request: &CatalogueRequest,
    ) -> ClientResult<Vec<MarketCatalogue>> {
        let markets: Vec<MarketCatalogue> = self
            .rpc(creds, "listMarketCatalogue", catalogue_params(request))
            .await?;
        info!(target: "client", markets = markets.len(), "catalogue fetched");
        Ok(markets)
    }

    async fn list_market_book(
        &self,
        creds: &BetfairConfig,
        market_ids: &[String],
        price_data: &[String],
    ) -> ClientResult<Vec<MarketBook>> {
        self.rpc(creds, "listMarketBook", book_params(market_ids, price_data))
            .await
    }
}
