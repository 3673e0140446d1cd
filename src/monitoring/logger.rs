use serde::Serialize;
use tracing::info;

use crate::types::AppConfig;

#[derive(Serialize)]
struct StartupLog<'a> {
    event: &'a str,
    storage_backend: String,
    event_type_id: &'a str,
    countries: &'a [String],
    market_types: &'a [String],
    poll_interval_secs: u64,
    credentials: bool,
}

/// Log the effective configuration once at startup. Secrets never appear.
pub fn log_startup(cfg: &AppConfig, backend: &str) {
    let payload = StartupLog {
        event: "startup",
        storage_backend: backend.to_string(),
        event_type_id: &cfg.recorder.event_type_id,
        countries: &cfg.recorder.countries,
        market_types: &cfg.recorder.market_types,
        poll_interval_secs: cfg.recorder.poll_interval_secs,
        credentials: cfg.betfair.has_credentials(),
    };
    info!(target: "recorder", startup = serde_json::to_string(&payload).unwrap_or_default().as_str());
}
