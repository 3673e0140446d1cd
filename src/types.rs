use anyhow::Context;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "config/recorder.toml";
const ENV_PREFIX: &str = "RECORDER";

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Recording disabled; cycles still run and feed the cache.
    None,
    #[default]
    Local,
    Gcs,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BetfairConfig {
    pub app_key: String,
    /// Session token sent as `X-Authentication`.
    pub session_token: String,
}

impl BetfairConfig {
    pub fn has_credentials(&self) -> bool {
        !self.app_key.is_empty() && !self.session_token.is_empty()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Filesystem root for the `local` backend.
    pub root: String,
    pub bucket: String,
    pub base_path: String,
    /// OAuth bearer token for the `gcs` backend.
    pub access_token: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            root: "recordings".to_string(),
            bucket: String::new(),
            base_path: "betfair-live".to_string(),
            access_token: String::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RecorderConfig {
    pub poll_interval_secs: u64,
    pub countries: Vec<String>,
    pub event_type_id: String,
    /// Empty means no market-type restriction.
    pub market_types: Vec<String>,
    pub price_projection: Vec<String>,
    pub catalogue_projection: Vec<String>,
    pub max_results: u32,
    /// Pause between consecutive book chunks.
    pub batch_delay_ms: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            countries: vec!["GB".to_string(), "IE".to_string()],
            event_type_id: "7".to_string(),
            market_types: vec!["WIN".to_string()],
            price_projection: [
                "EX_BEST_OFFERS",
                "EX_ALL_OFFERS",
                "EX_TRADED",
                "SP_AVAILABLE",
                "SP_TRADED",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            catalogue_projection: ["EVENT", "MARKET_START_TIME", "RUNNER_DESCRIPTION"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_results: 1000,
            batch_delay_ms: 200,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StateConfig {
    /// Local JSON file used for crash recovery of cycle counters.
    pub state_file: String,
    /// Local cache of the last runtime configuration.
    pub runtime_config_file: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            state_file: "/tmp/market_recorder_state.json".to_string(),
            runtime_config_file: "/tmp/market_recorder_config.toml".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub betfair: BetfairConfig,
    pub storage: StorageConfig,
    pub recorder: RecorderConfig,
    pub state: StateConfig,
}

impl AppConfig {
    /// Layer an optional TOML file under `RECORDER__SECTION__KEY` environment variables.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("recorder.countries")
                    .with_list_parse_key("recorder.market_types")
                    .with_list_parse_key("recorder.price_projection")
                    .with_list_parse_key("recorder.catalogue_projection")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("failed to build configuration from {path}"))?;
        let cfg: Self = settings
            .try_deserialize()
            .context("failed to deserialize layered configuration")?;
        Ok(cfg)
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("failed to serialize configuration")
    }

    /// Produce a new configuration with every present, non-empty field of `update` applied.
    pub fn merged(&self, update: &ConfigUpdate) -> AppConfig {
        let mut next = self.clone();

        set_string(&mut next.betfair.app_key, &update.app_key);
        set_string(&mut next.betfair.session_token, &update.session_token);

        if let Some(backend) = update.storage_backend {
            next.storage.backend = backend;
        }
        set_string(&mut next.storage.root, &update.storage_root);
        set_string(&mut next.storage.bucket, &update.bucket);
        if let Some(base) = update.base_path.as_deref().map(|b| b.trim_matches('/')) {
            if !base.is_empty() {
                next.storage.base_path = base.to_string();
            }
        }
        set_string(&mut next.storage.access_token, &update.access_token);

        if let Some(secs) = update.poll_interval_secs.filter(|s| *s > 0) {
            next.recorder.poll_interval_secs = secs;
        }
        set_string(&mut next.recorder.event_type_id, &update.event_type_id);
        set_list(&mut next.recorder.countries, &update.countries);
        // An explicit empty list lifts the market-type restriction.
        if let Some(types) = &update.market_types {
            next.recorder.market_types = types.clone();
        }
        set_list(&mut next.recorder.price_projection, &update.price_projection);
        set_list(&mut next.recorder.catalogue_projection, &update.catalogue_projection);
        if let Some(max) = update.max_results.filter(|m| *m > 0) {
            next.recorder.max_results = max;
        }
        if let Some(delay) = update.batch_delay_ms {
            next.recorder.batch_delay_ms = delay;
        }

        next
    }

    /// Copy with every secret masked, safe to log or hand to a dashboard.
    pub fn redacted(&self) -> AppConfig {
        let mut safe = self.clone();
        safe.betfair.app_key = mask_secret(&self.betfair.app_key);
        safe.betfair.session_token = mask_secret(&self.betfair.session_token);
        safe.storage.access_token = mask_secret(&self.storage.access_token);
        safe
    }
}

/// Partial configuration update. Absent or empty fields leave the current value alone.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConfigUpdate {
    pub app_key: Option<String>,
    pub session_token: Option<String>,
    pub storage_backend: Option<StorageBackend>,
    pub storage_root: Option<String>,
    pub bucket: Option<String>,
    pub base_path: Option<String>,
    pub access_token: Option<String>,
    pub poll_interval_secs: Option<u64>,
    pub event_type_id: Option<String>,
    pub countries: Option<Vec<String>>,
    pub market_types: Option<Vec<String>>,
    pub price_projection: Option<Vec<String>>,
    pub catalogue_projection: Option<Vec<String>>,
    pub max_results: Option<u32>,
    /// Zero disables the pause between book chunks.
    pub batch_delay_ms: Option<u64>,
}

impl From<&AppConfig> for ConfigUpdate {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            app_key: Some(cfg.betfair.app_key.clone()),
            session_token: Some(cfg.betfair.session_token.clone()),
            storage_backend: Some(cfg.storage.backend),
            storage_root: Some(cfg.storage.root.clone()),
            bucket: Some(cfg.storage.bucket.clone()),
            base_path: Some(cfg.storage.base_path.clone()),
            access_token: Some(cfg.storage.access_token.clone()),
            poll_interval_secs: Some(cfg.recorder.poll_interval_secs),
            event_type_id: Some(cfg.recorder.event_type_id.clone()),
            countries: Some(cfg.recorder.countries.clone()),
            market_types: Some(cfg.recorder.market_types.clone()),
            price_projection: Some(cfg.recorder.price_projection.clone()),
            catalogue_projection: Some(cfg.recorder.catalogue_projection.clone()),
            max_results: Some(cfg.recorder.max_results),
            batch_delay_ms: Some(cfg.recorder.batch_delay_ms),
        }
    }
}

fn set_string(target: &mut String, value: &Option<String>) {
    if let Some(v) = value.as_deref().map(str::trim) {
        if !v.is_empty() {
            *target = v.to_string();
        }
    }
}

fn set_list(target: &mut Vec<String>, value: &Option<Vec<String>>) {
    if let Some(v) = value {
        if !v.is_empty() {
            *target = v.clone();
        }
    }
}

/// Keep only a short suffix of a secret.
pub fn mask_secret(secret: &str) -> String {
    const SUFFIX: usize = 4;
    if secret.is_empty() {
        return String::new();
    }
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= SUFFIX * 2 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - SUFFIX..].iter().collect();
    format!("...{tail}")
}
