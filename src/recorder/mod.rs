//! The recording engine: lifecycle, scheduler loop and read surfaces.
//!
//! One background task runs the poll cadence. Feed reads, dashboard reads,
//! manual polls, config updates and stop requests may arrive concurrently
//! from other tasks at any point of a cycle.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::client::auth::{SessionGuardian, SessionState};
use crate::client::betfair::BetfairClient;
use crate::client::{ExchangeApi, MarketBook, MarketCatalogue};
use crate::monitoring::metrics::StatsSnapshot;
use crate::storage::models::{ActivityEntry, CycleState, ErrorEntry, LogLevel, MarketView};
use crate::storage::state::{ConfigStore, StateStore};
use crate::storage::{sink_from_config, DurableSink, NullSink};
use crate::types::{AppConfig, ConfigUpdate};
use crate::utils::time::recording_day;

pub mod cache;
mod cycle;
pub mod fetcher;

pub use cache::SnapshotCache;
pub use cycle::CycleOutcome;

/// Granularity of the idle wait between cycles; a stop request is seen within one slice.
pub const SLEEP_SLICE: Duration = Duration::from_secs(1);

const DASHBOARD_ERRORS: usize = 20;
const DASHBOARD_LOG: usize = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineStatus {
    Stopped,
    Starting,
    Running,
    Polling,
    Writing,
    AuthError,
}

impl EngineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineStatus::Stopped => "STOPPED",
            EngineStatus::Starting => "STARTING",
            EngineStatus::Running => "RUNNING",
            EngineStatus::Polling => "POLLING",
            EngineStatus::Writing => "WRITING",
            EngineStatus::AuthError => "AUTH_ERROR",
        }
    }

    /// True once the cadence is live, whatever phase the current cycle is in.
    pub fn is_active(&self) -> bool {
        !matches!(self, EngineStatus::Stopped | EngineStatus::Starting)
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of an operator command (start, stop, manual poll).
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CommandOutcome {
    pub success: bool,
    pub message: String,
}

impl CommandOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct StorageView {
    pub backend: String,
    pub enabled: bool,
    pub last_error: Option<String>,
}

/// Everything the dashboard shows, captured in one call.
#[derive(Clone, Debug, Serialize)]
pub struct DashboardState {
    pub status: EngineStatus,
    pub authenticated: bool,
    pub session: SessionState,
    pub last_keepalive: Option<DateTime<Utc>>,
    pub date: NaiveDate,
    pub last_poll: Option<DateTime<Utc>>,
    pub poll_count: u64,
    pub poll_interval_secs: u64,
    pub stats: StatsSnapshot,
    pub storage: StorageView,
    pub last_catalogue_path: Option<String>,
    pub last_books_path: Option<String>,
    pub markets: Vec<MarketView>,
    pub errors: Vec<ErrorEntry>,
    pub log: Vec<ActivityEntry>,
    pub config: AppConfig,
}

struct Worker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct Recorder {
    config: RwLock<Arc<AppConfig>>,
    api: Arc<dyn ExchangeApi>,
    sink: RwLock<Arc<dyn DurableSink>>,
    guardian: SessionGuardian,
    cache: SnapshotCache,
    cycle: Mutex<CycleState>,
    status: Mutex<EngineStatus>,
    state_store: StateStore,
    config_store: ConfigStore,
    worker: Mutex<Option<Worker>>,
    /// Serializes scheduled and manual cycles.
    cycle_lock: tokio::sync::Mutex<()>,
}

impl Recorder {
    pub fn new(
        config: AppConfig,
        api: Arc<dyn ExchangeApi>,
        sink: Arc<dyn DurableSink>,
    ) -> Arc<Self> {
        let state_store = StateStore::new(&config.state.state_file);
        let config_store = ConfigStore::new(&config.state.runtime_config_file);
        Arc::new(Self {
            config: RwLock::new(Arc::new(config)),
            guardian: SessionGuardian::new(api.clone()),
            api,
            sink: RwLock::new(sink),
            cache: SnapshotCache::new(),
            cycle: Mutex::new(CycleState::new(recording_day(Utc::now()))),
            status: Mutex::new(EngineStatus::Stopped),
            state_store,
            config_store,
            worker: Mutex::new(None),
            cycle_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Wire the live exchange client and configured sink, overlay the persisted
    /// runtime config and restore today's counters.
    pub async fn from_config(base: AppConfig) -> anyhow::Result<Arc<Self>> {
        let api: Arc<dyn ExchangeApi> = Arc::new(BetfairClient::new()?);
        let initial_sink = sink_from_config(&base)?;
        let config = ConfigStore::new(&base.state.runtime_config_file)
            .overlay(&base, initial_sink.as_ref())
            .await;
        let sink = if config.storage == base.storage {
            initial_sink
        } else {
            sink_from_config(&config)?
        };

        let recorder = Self::new(config, api, sink);
        recorder.restore_state().await;
        Ok(recorder)
    }

    /// Crash recovery: adopt counters persisted earlier today, drop anything older.
    pub async fn restore_state(&self) {
        let today = recording_day(Utc::now());
        if let Some(saved) = self.state_store.load(today).await {
            let mut cycle = self.cycle.lock();
            cycle.restore(saved);
            let polls = cycle.poll_count;
            cycle.log(LogLevel::Info, format!("Restored state: {polls} polls from today"));
        }
    }

    pub fn config(&self) -> Arc<AppConfig> {
        self.config.read().clone()
    }

    pub fn redacted_config(&self) -> AppConfig {
        self.config().redacted()
    }

    fn sink(&self) -> Arc<dyn DurableSink> {
        self.sink.read().clone()
    }

    pub fn status(&self) -> EngineStatus {
        *self.status.lock()
    }

    pub fn is_authenticated(&self) -> bool {
        self.guardian.is_ready(&self.config().betfair)
    }

    pub fn session_state(&self) -> SessionState {
        self.guardian.state()
    }

    /// Move to a cycle phase, but only while the cadence is live; a manual poll
    /// on a stopped engine leaves it stopped.
    fn set_phase(&self, phase: EngineStatus) {
        let mut status = self.status.lock();
        if status.is_active() {
            *status = phase;
        }
    }

    fn log_activity(&self, level: LogLevel, message: impl Into<String>) {
        self.cycle.lock().log(level, message);
    }

    // ── lifecycle ──

    pub async fn start(self: &Arc<Self>) -> CommandOutcome {
        let cfg = self.config();
        if !self.guardian.is_ready(&cfg.betfair) {
            return CommandOutcome::fail("Not authenticated. Set credentials first.");
        }

        {
            let mut status = self.status.lock();
            if *status != EngineStatus::Stopped {
                return CommandOutcome::fail("Already running.");
            }
            *status = EngineStatus::Starting;
        }

        self.log_activity(LogLevel::Info, "Validating session...");
        if let Err(reason) = self.guardian.validate(&cfg.betfair).await {
            let message = format!("Session validation failed: {reason}");
            self.log_activity(LogLevel::Error, message.clone());
            *self.status.lock() = EngineStatus::Stopped;
            return CommandOutcome::fail(message);
        }

        {
            let mut status = self.status.lock();
            if *status != EngineStatus::Starting {
                // stop() won the race while we were validating
                return CommandOutcome::fail("Start cancelled.");
            }
            *status = EngineStatus::Running;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(self.clone().run_loop(stop.clone()));
        *self.worker.lock() = Some(Worker { stop, handle });

        self.log_activity(LogLevel::Info, "Recorder started");
        info!(target: "recorder", "recorder started");
        CommandOutcome::ok("Recorder started.")
    }

    /// Idempotent. Signals the worker, marks the engine stopped and persists state.
    pub async fn stop(&self) -> CommandOutcome {
        if let Some(worker) = self.worker.lock().take() {
            worker.stop.store(true, Ordering::SeqCst);
            if worker.handle.is_finished() {
                warn!(target: "recorder", "recording loop had already exited");
            }
        }
        *self.status.lock() = EngineStatus::Stopped;
        self.persist_state().await;
        self.log_activity(LogLevel::Info, "Recorder stopped");
        info!(target: "recorder", "recorder stopped");
        CommandOutcome::ok("Recorder stopped.")
    }

    async fn run_loop(self: Arc<Self>, stop: Arc<AtomicBool>) {
        {
            let cfg = self.config();
            info!(
                target: "recorder",
                interval_secs = cfg.recorder.poll_interval_secs,
                countries = ?cfg.recorder.countries,
                "recording loop started"
            );
        }

        while !stop.load(Ordering::SeqCst) {
            match AssertUnwindSafe(self.run_cycle()).catch_unwind().await {
                Ok(Ok(outcome)) => {
                    tracing::debug!(target: "recorder", outcome = ?outcome, "cycle finished");
                }
                Ok(Err(err)) => self.record_loop_failure(format!("Poll cycle error: {err:#}")),
                Err(_) => self.record_loop_failure("Poll cycle panicked".to_string()),
            }

            // cadence may change between cycles; read it fresh each time
            let slices = self.config().recorder.poll_interval_secs.max(1);
            for _ in 0..slices {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                sleep(SLEEP_SLICE).await;
            }
        }

        info!(target: "recorder", "recording loop ended");
    }

    fn record_loop_failure(&self, message: String) {
        error!(target: "recorder", error = %message, "poll cycle failed");
        {
            let mut cycle = self.cycle.lock();
            cycle.add_error(message);
            cycle.stats.api_errors += 1;
        }
        self.set_phase(EngineStatus::Running);
    }

    /// Run one cycle now through the same path the scheduler uses.
    pub async fn poll_once(&self) -> CommandOutcome {
        if !self.is_authenticated() {
            return CommandOutcome::fail("Not authenticated");
        }
        match AssertUnwindSafe(self.run_cycle()).catch_unwind().await {
            Ok(Ok(outcome)) => CommandOutcome {
                success: outcome.is_success(),
                message: outcome.to_string(),
            },
            Ok(Err(err)) => CommandOutcome::fail(format!("{err:#}")),
            Err(_) => CommandOutcome::fail("Poll cycle panicked"),
        }
    }

    /// Check the active sink can be reached and written without recording anything.
    pub async fn test_storage(&self) -> CommandOutcome {
        let sink = self.sink();
        match sink.check().await {
            Ok(detail) => {
                info!(target: "storage", backend = %sink.describe(), %detail, "storage check passed");
                self.log_activity(LogLevel::Info, format!("Storage check passed: {detail}"));
                CommandOutcome::ok(detail)
            }
            Err(err) => {
                warn!(target: "storage", backend = %sink.describe(), error = %err, "storage check failed");
                let message = format!("Storage check failed: {err}");
                self.log_activity(LogLevel::Warn, message.clone());
                CommandOutcome::fail(message)
            }
        }
    }

    // ── state persistence ──

    pub(crate) async fn persist_state(&self) {
        let status = self.status();
        let snapshot = self.cycle.lock().to_persisted(status.as_str());
        self.state_store.save(&snapshot).await;
    }

    // ── configuration ──

    /// Merge a partial update into a new configuration value, swap it in and persist it.
    /// A cycle already in flight keeps the configuration it captured.
    pub async fn update_config(&self, update: &ConfigUpdate) -> AppConfig {
        let (previous, next) = {
            let mut guard = self.config.write();
            let previous = guard.clone();
            let next = Arc::new(previous.merged(update));
            *guard = next.clone();
            (previous, next)
        };

        if next.betfair != previous.betfair {
            self.guardian.reset();
        }
        if next.storage != previous.storage {
            let sink = match sink_from_config(&next) {
                Ok(sink) => sink,
                Err(err) => {
                    warn!(target: "config", error = %err, "storage unusable; recording disabled");
                    self.cycle
                        .lock()
                        .add_error(format!("Storage configuration rejected: {err}"));
                    Arc::new(NullSink) as Arc<dyn DurableSink>
                }
            };
            *self.sink.write() = sink;
        }

        let sink = self.sink();
        self.config_store.save(&next, sink.as_ref()).await;
        self.log_activity(LogLevel::Info, "Configuration updated");
        info!(target: "config", "configuration updated");
        next.redacted()
    }

    // ── feed surface ──

    pub fn feed_markets(&self) -> Vec<MarketCatalogue> {
        self.cache.markets()
    }

    pub fn feed_book(&self, market_id: &str) -> Option<MarketBook> {
        self.cache.book(market_id)
    }

    pub fn feed_books(&self, market_ids: &[String]) -> Vec<MarketBook> {
        self.cache.books(market_ids)
    }

    // ── dashboard ──

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        let (markets_cached, books_cached) = self.cache.counts();
        StatsSnapshot {
            totals: self.cycle.lock().stats.clone(),
            markets_cached,
            books_cached,
        }
    }

    pub fn dashboard_state(&self) -> DashboardState {
        let now = Utc::now();
        let cfg = self.config();
        let sink = self.sink();
        let markets = self.cache.market_views(now);
        let stats = self.stats_snapshot();

        let cycle = self.cycle.lock();
        let errors_from = cycle.errors.len().saturating_sub(DASHBOARD_ERRORS);
        let log_from = cycle.activity.len().saturating_sub(DASHBOARD_LOG);
        DashboardState {
            status: self.status(),
            authenticated: self.guardian.is_ready(&cfg.betfair),
            session: self.guardian.state(),
            last_keepalive: self.guardian.last_keepalive(),
            date: cycle.day,
            last_poll: cycle.last_poll,
            poll_count: cycle.poll_count,
            poll_interval_secs: cfg.recorder.poll_interval_secs,
            stats,
            storage: StorageView {
                backend: sink.describe(),
                enabled: sink.is_enabled(),
                last_error: cycle.last_write_error.clone(),
            },
            last_catalogue_path: cycle.last_catalogue_path.clone(),
            last_books_path: cycle.last_books_path.clone(),
            markets,
            errors: cycle.errors[errors_from..].to_vec(),
            log: cycle.activity[log_from..].to_vec(),
            config: cfg.redacted(),
        }
    }
}
