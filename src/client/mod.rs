use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::BetfairConfig;

pub mod auth;
pub mod betfair;
pub mod weights;

/// Upstream error codes meaning the session token is no longer usable.
pub const SESSION_ERROR_CODES: &[&str] = &["INVALID_SESSION_INFORMATION", "NO_SESSION"];

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status {status}: {body}")]
    HttpStatus {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("API error on {method}: {code:?} {message}")]
    Api {
        method: String,
        code: Option<String>,
        message: String,
    },

    #[error("empty or invalid response from {0}")]
    EmptyResponse(String),

    #[error("keepalive rejected: {0}")]
    Keepalive(String),

    #[error("missing credentials: app key and session token are required")]
    MissingCredentials,
}

impl ClientError {
    /// Structured upstream error code, when the exchange supplied one.
    pub fn code(&self) -> Option<&str> {
        match self {
            ClientError::Api { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    pub fn is_session_error(&self) -> bool {
        match self {
            ClientError::MissingCredentials => true,
            _ => self
                .code()
                .map(|c| SESSION_ERROR_CODES.contains(&c))
                .unwrap_or(false),
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Discovery request. The time window defaults to the current UTC day at the call site.
#[derive(Clone, Debug, PartialEq)]
pub struct CatalogueRequest {
    pub event_type_id: String,
    pub countries: Vec<String>,
    /// Empty means every market type.
    pub market_types: Vec<String>,
    pub projections: Vec<String>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub max_results: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub venue: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One discovered market. Fields the recorder does not interpret are kept verbatim
/// so the feed can serve the upstream shape unchanged.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MarketCatalogue {
    pub market_id: String,
    #[serde(default)]
    pub market_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<EventInfo>,
    #[serde(default)]
    pub runners: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Price snapshot for one market. The price projection payload is opaque.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MarketBook {
    pub market_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub in_play: bool,
    #[serde(default)]
    pub total_matched: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The upstream exchange as seen by the recorder: discovery, prices and session upkeep.
///
/// Credentials travel with each call so an in-flight cycle keeps using the
/// configuration it started with.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Extend the session. `Ok(())` means the exchange confirmed the token.
    async fn keepalive(&self, creds: &BetfairConfig) -> ClientResult<()>;

    /// Lightweight probe confirming the session can make API calls.
    async fn validate_session(&self, creds: &BetfairConfig) -> ClientResult<()>;

    async fn list_market_catalogue(
        &self,
        creds: &BetfairConfig,
        request: &CatalogueRequest,
    ) -> ClientResult<Vec<MarketCatalogue>>;

    async fn list_market_book(
        &self,
        creds: &BetfairConfig,
        market_ids: &[String],
        price_data: &[String],
    ) -> ClientResult<Vec<MarketBook>>;
}
