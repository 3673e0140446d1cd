use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Days, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tempfile::TempDir;

use market_recorder::client::auth::SessionState;
use market_recorder::client::{
    CatalogueRequest, ClientError, ClientResult, EventInfo, ExchangeApi, MarketBook, MarketCatalogue,
};
use market_recorder::recorder::{EngineStatus, Recorder};
use market_recorder::storage::models::PersistedState;
use market_recorder::storage::{DurableSink, SinkError, SinkResult};
use market_recorder::types::{AppConfig, BetfairConfig, ConfigUpdate, StorageBackend};

enum Discovery {
    Markets(Vec<MarketCatalogue>),
    Fail(Option<&'static str>),
}

struct MockExchange {
    discovery: Mutex<Discovery>,
    keepalive_fails: AtomicBool,
    validation_fails: AtomicBool,
    catalogue_requests: Mutex<Vec<CatalogueRequest>>,
    book_calls: AtomicUsize,
    panic_next: AtomicBool,
}

impl MockExchange {
    fn with_markets(markets: Vec<MarketCatalogue>) -> Arc<Self> {
        Arc::new(Self {
            discovery: Mutex::new(Discovery::Markets(markets)),
            keepalive_fails: AtomicBool::new(false),
            validation_fails: AtomicBool::new(false),
            catalogue_requests: Mutex::new(vec![]),
            book_calls: AtomicUsize::new(0),
            panic_next: AtomicBool::new(false),
        })
    }

    fn set_discovery(&self, discovery: Discovery) {
        *self.discovery.lock() = discovery;
    }
}

#[async_trait]
impl ExchangeApi for MockExchange {
    async fn keepalive(&self, _creds: &BetfairConfig) -> ClientResult<()> {
        if self.keepalive_fails.load(Ordering::SeqCst) {
            Err(ClientError::Keepalive("NO_SESSION".to_string()))
        } else {
            Ok(())
        }
    }

    async fn validate_session(&self, _creds: &BetfairConfig) -> ClientResult<()> {
        if self.validation_fails.load(Ordering::SeqCst) {
            Err(ClientError::EmptyResponse("listEventTypes".to_string()))
        } else {
            Ok(())
        }
    }

    async fn list_market_catalogue(
        &self,
        _creds: &BetfairConfig,
        request: &CatalogueRequest,
    ) -> ClientResult<Vec<MarketCatalogue>> {
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("catalogue decoder blew up");
        }
        self.catalogue_requests.lock().push(request.clone());
        match &*self.discovery.lock() {
            Discovery::Markets(markets) => Ok(markets.clone()),
            Discovery::Fail(code) => Err(ClientError::Api {
                method: "listMarketCatalogue".to_string(),
                code: code.map(str::to_string),
                message: "rejected".to_string(),
            }),
        }
    }

    async fn list_market_book(
        &self,
        _creds: &BetfairConfig,
        market_ids: &[String],
        _price_data: &[String],
    ) -> ClientResult<Vec<MarketBook>> {
        self.book_calls.fetch_add(1, Ordering::SeqCst);
        Ok(market_ids.iter().map(|id| book(id)).collect())
    }
}

/// In-memory sink that can be told to reject one category.
#[derive(Default)]
struct MemorySink {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    fail_segment: Mutex<Option<&'static str>>,
}

impl MemorySink {
    fn paths(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }

    fn lines(&self, segment: &str) -> Vec<Value> {
        let objects = self.objects.lock();
        objects
            .iter()
            .filter(|(path, _)| path.contains(segment))
            .flat_map(|(_, bytes)| {
                String::from_utf8(bytes.clone())
                    .unwrap()
                    .lines()
                    .map(|l| serde_json::from_str::<Value>(l).unwrap())
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

#[async_trait]
impl DurableSink for MemorySink {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn put(&self, path: &str, _content_type: &str, bytes: Vec<u8>) -> SinkResult<()> {
        if let Some(segment) = *self.fail_segment.lock() {
            if path.contains(segment) {
                return Err(SinkError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
        }
        self.objects.lock().insert(path.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, path: &str) -> SinkResult<Option<Vec<u8>>> {
        Ok(self.objects.lock().get(path).cloned())
    }

    async fn check(&self) -> SinkResult<String> {
        Ok("memory sink ready".to_string())
    }
}

fn market(id: &str, start_min: i64) -> MarketCatalogue {
    MarketCatalogue {
        market_id: id.to_string(),
        market_name: format!("R{id} 1m Hcap"),
        market_start_time: Some(Utc::now() + chrono::Duration::minutes(start_min)),
        event: Some(EventInfo {
            id: "31234567".to_string(),
            name: "Kempton 17th Oct".to_string(),
            venue: "Kempton".to_string(),
            extra: Map::new(),
        }),
        runners: vec![json!({"selectionId": 101}), json!({"selectionId": 102})],
        extra: Map::new(),
    }
}

fn book(id: &str) -> MarketBook {
    let mut extra = Map::new();
    extra.insert("runners".to_string(), json!([{"selectionId": 101, "lastPriceTraded": 3.4}]));
    MarketBook {
        market_id: id.to_string(),
        status: Some("SUSPENDED".to_string()),
        in_play: true,
        total_matched: 2500.0,
        extra,
    }
}

fn config(dir: &TempDir) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.betfair.app_key = "app-key-0001".to_string();
    cfg.betfair.session_token = "session-token-abcdef".to_string();
    cfg.recorder.countries = vec!["GB".to_string(), "IE".to_string()];
    cfg.recorder.batch_delay_ms = 0;
    cfg.state.state_file = dir.path().join("state.json").display().to_string();
    cfg.state.runtime_config_file = dir.path().join("runtime.toml").display().to_string();
    cfg
}

fn setup(markets: Vec<MarketCatalogue>) -> (TempDir, Arc<MockExchange>, Arc<MemorySink>, Arc<Recorder>) {
    let dir = tempfile::tempdir().unwrap();
    let api = MockExchange::with_markets(markets);
    let sink = Arc::new(MemorySink::default());
    let recorder = Recorder::new(config(&dir), api.clone(), sink.clone());
    (dir, api, sink, recorder)
}

#[tokio::test]
async fn full_cycle_records_and_indexes_markets() {
    let (_dir, api, sink, recorder) =
        setup(vec![market("1.1", 30), market("1.2", 5), market("1.3", 60)]);

    let outcome = recorder.poll_once().await;
    assert!(outcome.success, "{}", outcome.message);

    let stats = recorder.stats_snapshot();
    assert_eq!(stats.totals.total_polls, 1);
    assert_eq!(stats.totals.total_markets_recorded, 3);
    assert_eq!(stats.totals.total_books_recorded, 3);
    assert_eq!(stats.totals.total_writes, 2);
    assert_eq!((stats.markets_cached, stats.books_cached), (3, 3));

    let request = api.catalogue_requests.lock()[0].clone();
    assert_eq!(request.countries, vec!["GB".to_string(), "IE".to_string()]);
    assert_eq!(request.event_type_id, "7");
    // default projection costs 47, so all three fit in one call
    assert_eq!(api.book_calls.load(Ordering::SeqCst), 1);

    let state = recorder.dashboard_state();
    let ids: Vec<&str> = state.markets.iter().map(|m| m.summary.market_id.as_str()).collect();
    assert_eq!(ids, vec!["1.2", "1.1", "1.3"]);
    for view in &state.markets {
        assert_eq!(view.summary.status, "SUSPENDED");
        assert!(view.summary.in_play);
        assert_eq!(view.summary.total_matched, 2500.0);
        assert!(view.has_book_data);
    }

    let day = Utc::now().format("%Y-%m-%d").to_string();
    let paths = sink.paths();
    assert_eq!(paths.len(), 2);
    assert!(paths
        .iter()
        .any(|p| p.starts_with(&format!("betfair-live/7/{day}/catalogue/")) && p.ends_with(".ndjson")));
    assert_eq!(state.last_books_path.as_deref().map(|p| p.contains("/books/")), Some(true));

    let books = sink.lines("/books/");
    assert_eq!(books.len(), 3);
    assert_eq!(books[0]["_data_type"], "books");
    assert!(books[0]["_recorded_at"].is_string());
    assert_eq!(books[0]["runners"][0]["lastPriceTraded"], 3.4);
}

#[tokio::test]
async fn empty_discovery_is_not_an_error() {
    let (_dir, api, sink, recorder) = setup(vec![]);

    let outcome = recorder.poll_once().await;
    assert!(outcome.success);
    assert_eq!(outcome.message, "No markets found");

    let state = recorder.dashboard_state();
    assert!(state.errors.is_empty());
    assert_eq!(state.poll_count, 1);
    assert_eq!(state.stats.totals.api_errors, 0);
    assert_eq!(api.book_calls.load(Ordering::SeqCst), 0);
    assert!(sink.paths().is_empty());
}

#[tokio::test]
async fn failed_discovery_counts_an_api_error() {
    let (_dir, api, _sink, recorder) = setup(vec![market("1.1", 5)]);
    api.set_discovery(Discovery::Fail(Some("TOO_MUCH_DATA")));

    let outcome = recorder.poll_once().await;
    assert!(!outcome.success);
    assert!(outcome.message.contains("discovery failed"));

    let state = recorder.dashboard_state();
    assert_eq!(state.stats.totals.api_errors, 1);
    assert_eq!(state.stats.totals.total_polls, 0);
    assert_eq!(state.errors.len(), 1);
    // not a session code, so the engine stays usable
    assert!(recorder.is_authenticated());
}

#[tokio::test]
async fn session_error_code_stops_the_cycle_at_discovery() {
    let (_dir, api, sink, recorder) = setup(vec![market("1.1", 5)]);
    api.set_discovery(Discovery::Fail(Some("INVALID_SESSION_INFORMATION")));

    let outcome = recorder.poll_once().await;
    assert!(!outcome.success);
    assert_eq!(recorder.session_state(), SessionState::Invalid);
    assert!(!recorder.is_authenticated());
    assert_eq!(api.book_calls.load(Ordering::SeqCst), 0);
    assert!(sink.paths().is_empty());

    let again = recorder.poll_once().await;
    assert!(!again.success);
    assert_eq!(again.message, "Not authenticated");
}

#[tokio::test]
async fn write_failure_does_not_block_the_other_category() {
    let (_dir, _api, sink, recorder) = setup(vec![market("1.1", 5), market("1.2", 10)]);
    *sink.fail_segment.lock() = Some("/books/");

    let outcome = recorder.poll_once().await;
    assert!(outcome.success);

    let state = recorder.dashboard_state();
    assert_eq!(state.stats.totals.total_writes, 1);
    assert_eq!(state.stats.totals.write_errors, 1);
    assert!(state.last_catalogue_path.is_some());
    assert!(state.last_books_path.is_none());
    assert!(state.storage.last_error.as_deref().unwrap().contains("disk full"));
    assert_eq!(sink.lines("/catalogue/").len(), 2);
    // the cache is still refreshed
    assert_eq!(state.stats.books_cached, 2);
}

#[tokio::test]
async fn disabled_storage_skips_writes_without_errors() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(&dir);
    cfg.storage.backend = StorageBackend::None;
    let api = MockExchange::with_markets(vec![market("1.1", 5)]);
    let recorder = Recorder::new(cfg, api, Arc::new(market_recorder::storage::NullSink));

    assert!(recorder.poll_once().await.success);
    let state = recorder.dashboard_state();
    assert!(!state.storage.enabled);
    assert_eq!(state.stats.totals.total_writes, 0);
    assert_eq!(state.stats.totals.write_errors, 0);
    assert_eq!(state.stats.totals.total_polls, 1);
}

#[tokio::test]
async fn rollover_clears_yesterdays_markets_and_errors() {
    let (_dir, api, _sink, recorder) = setup(vec![market("1.1", 5), market("1.2", 10)]);
    assert!(recorder.poll_once().await.success);
    api.set_discovery(Discovery::Fail(None));
    recorder.poll_once().await;
    assert_eq!(recorder.dashboard_state().errors.len(), 1);

    let today = Utc::now().date_naive();
    recorder.set_recording_day(today.checked_sub_days(Days::new(1)).unwrap());
    api.set_discovery(Discovery::Markets(vec![market("1.3", 20)]));
    assert!(recorder.poll_once().await.success);

    assert_eq!(recorder.recording_day(), today);
    assert_eq!(recorder.poll_count(), 1);
    let ids: Vec<String> = recorder.feed_markets().into_iter().map(|m| m.market_id).collect();
    assert_eq!(ids, vec!["1.3".to_string()]);
    assert!(recorder.feed_book("1.1").is_none());
    assert!(recorder.dashboard_state().errors.is_empty());
    // cumulative totals survive the day boundary
    assert_eq!(recorder.stats_snapshot().totals.total_polls, 2);
}

#[tokio::test]
async fn stopped_state_is_restored_on_the_same_day() {
    let (dir, api, sink, recorder) = setup(vec![market("1.1", 5)]);
    for _ in 0..3 {
        assert!(recorder.poll_once().await.success);
    }
    recorder.stop().await;

    let restored = Recorder::new(config(&dir), api, sink);
    restored.restore_state().await;
    assert_eq!(restored.poll_count(), 3);
    assert_eq!(restored.stats_snapshot().totals.total_polls, 3);
}

#[tokio::test]
async fn state_from_another_day_is_discarded() {
    let (dir, _api, _sink, recorder) = setup(vec![]);
    let yesterday = Utc::now().date_naive().checked_sub_days(Days::new(1)).unwrap();
    let stale = PersistedState {
        day: yesterday,
        poll_count: 240,
        last_poll: Some(Utc.with_ymd_and_hms(2024, 1, 1, 23, 59, 0).unwrap()),
        stats: Default::default(),
        errors: vec![],
        status: "RUNNING".to_string(),
        saved_at: Utc::now(),
    };
    let path = dir.path().join("state.json");
    std::fs::write(&path, serde_json::to_vec(&stale).unwrap()).unwrap();

    recorder.restore_state().await;
    assert_eq!(recorder.poll_count(), 0);
    assert_eq!(recorder.recording_day(), Utc::now().date_naive());
    assert!(!path.exists());
}

#[tokio::test]
async fn feed_reads_are_detached_copies() {
    let (_dir, _api, _sink, recorder) = setup(vec![market("1.1", 5)]);
    recorder.poll_once().await;

    let mut books = recorder.feed_books(&["1.1".to_string(), "9.9".to_string()]);
    assert_eq!(books.len(), 1);
    books[0].total_matched = 0.0;
    books.clear();

    let mut markets = recorder.feed_markets();
    markets[0].market_name.clear();

    assert_eq!(recorder.feed_book("1.1").unwrap().total_matched, 2500.0);
    assert_eq!(recorder.feed_markets()[0].market_name, "R1.1 1m Hcap");
}

#[tokio::test]
async fn config_update_is_applied_masked_and_persisted() {
    let (dir, api, sink, recorder) = setup(vec![]);
    let update = ConfigUpdate {
        session_token: Some("fresh-session-token-9876".to_string()),
        countries: Some(vec!["FR".to_string()]),
        poll_interval_secs: Some(30),
        ..ConfigUpdate::default()
    };

    let shown = recorder.update_config(&update).await;
    assert_eq!(shown.betfair.session_token, "...9876");
    assert_eq!(shown.betfair.app_key, "...0001");

    let live = recorder.config();
    assert_eq!(live.betfair.session_token, "fresh-session-token-9876");
    assert_eq!(live.recorder.countries, vec!["FR".to_string()]);
    assert_eq!(live.recorder.poll_interval_secs, 30);

    let local = std::fs::read_to_string(dir.path().join("runtime.toml")).unwrap();
    assert!(local.contains("fresh-session-token-9876"));
    assert!(sink
        .paths()
        .contains(&"betfair-live/config/runtime_config.toml".to_string()));

    recorder.poll_once().await;
    let request = api.catalogue_requests.lock().last().cloned().unwrap();
    assert_eq!(request.countries, vec!["FR".to_string()]);
}

#[tokio::test]
async fn start_is_rejected_without_credentials() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(&dir);
    cfg.betfair.session_token.clear();
    let recorder = Recorder::new(cfg, MockExchange::with_markets(vec![]), Arc::new(MemorySink::default()));

    let outcome = recorder.start().await;
    assert!(!outcome.success);
    assert_eq!(recorder.status(), EngineStatus::Stopped);
}

#[tokio::test]
async fn failed_validation_returns_to_stopped() {
    let (_dir, api, _sink, recorder) = setup(vec![]);
    api.validation_fails.store(true, Ordering::SeqCst);

    let outcome = recorder.start().await;
    assert!(!outcome.success);
    assert!(outcome.message.starts_with("Session validation failed"));
    assert_eq!(recorder.status(), EngineStatus::Stopped);
}

#[tokio::test(start_paused = true)]
async fn start_runs_cadence_until_stopped() {
    let (_dir, _api, _sink, recorder) = setup(vec![market("1.1", 5)]);

    assert!(recorder.start().await.success);
    let again = recorder.start().await;
    assert!(!again.success);
    assert_eq!(again.message, "Already running.");

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(recorder.poll_count(), 1);
    assert_eq!(recorder.status(), EngineStatus::Running);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(recorder.poll_count(), 2);

    assert!(recorder.stop().await.success);
    assert!(recorder.stop().await.success);
    assert_eq!(recorder.status(), EngineStatus::Stopped);

    tokio::time::sleep(Duration::from_secs(180)).await;
    assert_eq!(recorder.poll_count(), 2);

    // a stopped engine can be started again
    assert!(recorder.start().await.success);
    recorder.stop().await;
}

#[tokio::test(start_paused = true)]
async fn auth_error_recovers_on_next_successful_check() {
    let (_dir, api, _sink, recorder) = setup(vec![market("1.1", 5)]);
    api.keepalive_fails.store(true, Ordering::SeqCst);

    assert!(recorder.start().await.success);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(recorder.status(), EngineStatus::AuthError);
    assert_eq!(recorder.stats_snapshot().totals.total_polls, 0);

    // re-validating the token lets the next scheduled cycle through
    api.keepalive_fails.store(false, Ordering::SeqCst);
    recorder
        .update_config(&ConfigUpdate {
            session_token: Some("replacement-token-1111".to_string()),
            ..ConfigUpdate::default()
        })
        .await;
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(recorder.status(), EngineStatus::Running);
    assert_eq!(recorder.stats_snapshot().totals.total_polls, 1);

    recorder.stop().await;
}

#[tokio::test]
async fn manual_poll_does_not_start_a_stopped_engine() {
    let (_dir, _api, _sink, recorder) = setup(vec![market("1.1", 5)]);
    assert!(recorder.poll_once().await.success);
    assert_eq!(recorder.status(), EngineStatus::Stopped);
}

#[tokio::test]
async fn back_to_back_polls_never_overwrite() {
    let (_dir, _api, sink, recorder) = setup(vec![market("1.1", 5), market("1.2", 10)]);

    assert!(recorder.poll_once().await.success);
    assert!(recorder.poll_once().await.success);

    let paths = sink.paths();
    assert_eq!(paths.len(), 4, "{paths:?}");
    assert_eq!(recorder.stats_snapshot().totals.total_writes, 4);
    assert_eq!(sink.lines("/catalogue/").len(), 4);
    assert_eq!(sink.lines("/books/").len(), 4);
}

#[tokio::test]
async fn state_is_persisted_every_fifth_poll() {
    let (dir, _api, _sink, recorder) = setup(vec![market("1.1", 5)]);
    let state_file = dir.path().join("state.json");

    for _ in 0..4 {
        assert!(recorder.poll_once().await.success);
    }
    assert!(!state_file.exists());

    assert!(recorder.poll_once().await.success);
    let saved: PersistedState =
        serde_json::from_slice(&std::fs::read(&state_file).unwrap()).unwrap();
    assert_eq!(saved.poll_count, 5);
    assert_eq!(saved.stats.total_polls, 5);
}

#[tokio::test(start_paused = true)]
async fn panicking_cycle_is_recorded_and_the_loop_keeps_going() {
    let (_dir, api, _sink, recorder) = setup(vec![market("1.1", 5)]);
    api.panic_next.store(true, Ordering::SeqCst);

    assert!(recorder.start().await.success);
    tokio::time::sleep(Duration::from_millis(500)).await;
    let state = recorder.dashboard_state();
    assert_eq!(state.stats.totals.api_errors, 1);
    assert_eq!(state.stats.totals.total_polls, 0);
    assert!(state.errors.iter().any(|e| e.message.contains("panicked")));
    assert_eq!(recorder.status(), EngineStatus::Running);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(recorder.stats_snapshot().totals.total_polls, 1);
    assert_eq!(recorder.status(), EngineStatus::Running);

    assert!(recorder.stop().await.success);
    assert_eq!(recorder.status(), EngineStatus::Stopped);
}

#[tokio::test]
async fn event_type_update_moves_the_recording_folder() {
    let (_dir, api, sink, recorder) = setup(vec![market("1.1", 5)]);
    recorder
        .update_config(&ConfigUpdate {
            event_type_id: Some("4339".to_string()),
            ..ConfigUpdate::default()
        })
        .await;

    assert!(recorder.poll_once().await.success);
    let request = api.catalogue_requests.lock().last().cloned().unwrap();
    assert_eq!(request.event_type_id, "4339");
    let recordings: Vec<String> = sink
        .paths()
        .into_iter()
        .filter(|p| p.ends_with(".ndjson"))
        .collect();
    assert_eq!(recordings.len(), 2);
    assert!(recordings.iter().all(|p| p.starts_with("betfair-live/4339/")));
}

#[tokio::test]
async fn storage_check_reports_the_active_sink() {
    let (_dir, _api, _sink, recorder) = setup(vec![]);
    let outcome = recorder.test_storage().await;
    assert!(outcome.success);
    assert_eq!(outcome.message, "memory sink ready");

    let dir = tempfile::tempdir().unwrap();
    let disabled = Recorder::new(
        config(&dir),
        MockExchange::with_markets(vec![]),
        Arc::new(market_recorder::storage::NullSink),
    );
    let outcome = disabled.test_storage().await;
    assert!(!outcome.success);
    assert!(outcome.message.contains("not configured"));
    assert!(disabled
        .dashboard_state()
        .log
        .iter()
        .any(|entry| entry.message.starts_with("Storage check failed")));
}
