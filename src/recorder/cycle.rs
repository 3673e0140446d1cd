use std::fmt;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use tracing::{error, info, warn};

use crate::client::auth::SessionState;
use crate::client::CatalogueRequest;
use crate::storage::models::LogLevel;
use crate::storage::{write_records, Category, PathLayout, SinkResult};
use crate::utils::time::{day_window, recording_day};

use super::fetcher::MarketFetcher;
use super::{EngineStatus, Recorder};

/// Counters are persisted every this many completed polls.
pub const PERSIST_EVERY_POLLS: u64 = 5;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed { markets: usize, books: usize },
    NoMarkets,
    AuthError,
    DiscoveryFailed(String),
}

impl CycleOutcome {
    /// Whether a manual poll reports success. Finding nothing still counts.
    pub fn is_success(&self) -> bool {
        matches!(self, CycleOutcome::Completed { .. } | CycleOutcome::NoMarkets)
    }
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleOutcome::Completed { markets, books } => {
                write!(f, "Recorded {markets} markets, {books} books")
            }
            CycleOutcome::NoMarkets => f.write_str("No markets found"),
            CycleOutcome::AuthError => f.write_str("Session invalid; re-authenticate"),
            CycleOutcome::DiscoveryFailed(reason) => write!(f, "Market discovery failed: {reason}"),
        }
    }
}

impl Recorder {
    /// One poll cycle: session upkeep, discovery, chunked books, cache update, recording.
    pub async fn run_cycle(&self) -> anyhow::Result<CycleOutcome> {
        let _serial = self.cycle_lock.lock().await;
        let now = Utc::now();
        self.check_day_rollover(recording_day(now)).await;

        // configuration and sink are fixed for the whole cycle
        let cfg = self.config();
        let sink = self.sink();
        {
            let mut cycle = self.cycle.lock();
            cycle.poll_count += 1;
            cycle.last_poll = Some(now);
        }

        if !self.guardian.ensure_fresh(&cfg.betfair, now).await {
            self.cycle
                .lock()
                .add_error("Session keepalive failed; re-authenticate");
            self.set_phase(EngineStatus::AuthError);
            return Ok(CycleOutcome::AuthError);
        }

        self.set_phase(EngineStatus::Polling);
        let (from, to) = day_window(now);
        let request = CatalogueRequest {
            event_type_id: cfg.recorder.event_type_id.clone(),
            countries: cfg.recorder.countries.clone(),
            market_types: cfg.recorder.market_types.clone(),
            projections: cfg.recorder.catalogue_projection.clone(),
            from,
            to,
            max_results: cfg.recorder.max_results,
        };
        let fetcher = MarketFetcher::new(
            self.api.as_ref(),
            &self.guardian,
            &cfg.betfair,
            Duration::from_millis(cfg.recorder.batch_delay_ms),
        );

        let markets = match fetcher.fetch_catalogue(&request).await {
            Ok(markets) => markets,
            Err(err) => {
                warn!(target: "recorder", error = %err, "market discovery failed");
                {
                    let mut cycle = self.cycle.lock();
                    cycle.stats.api_errors += 1;
                    cycle.add_error(format!("Market discovery failed: {err}"));
                }
                if self.guardian.state() == SessionState::Invalid {
                    self.set_phase(EngineStatus::AuthError);
                    return Ok(CycleOutcome::AuthError);
                }
                self.set_phase(EngineStatus::Running);
                return Ok(CycleOutcome::DiscoveryFailed(err.to_string()));
            }
        };

        if markets.is_empty() {
            warn!(target: "recorder", countries = ?cfg.recorder.countries, "no markets found for today");
            self.cycle.lock().log(LogLevel::Warn, "No markets found");
            self.set_phase(EngineStatus::Running);
            return Ok(CycleOutcome::NoMarkets);
        }

        let market_ids: Vec<String> = markets.iter().map(|m| m.market_id.clone()).collect();
        info!(target: "recorder", markets = market_ids.len(), "markets discovered");
        self.cache.replace_catalogue(markets.clone());

        let fetch = fetcher
            .fetch_books(&market_ids, &cfg.recorder.price_projection)
            .await;
        if fetch.failed_chunks > 0 {
            let mut cycle = self.cycle.lock();
            cycle.stats.api_errors += fetch.failed_chunks as u64;
            cycle.log(
                LogLevel::Warn,
                format!(
                    "Fetched {}/{} books ({} chunks failed)",
                    fetch.books.len(),
                    fetch.requested,
                    fetch.failed_chunks
                ),
            );
        }
        self.cache.apply_books(&fetch.books);

        if self.guardian.state() == SessionState::Invalid {
            // upstream rejected the token mid-cycle; keep what was cached, record nothing
            self.cycle
                .lock()
                .add_error("Session invalidated during book fetch");
            self.set_phase(EngineStatus::AuthError);
            return Ok(CycleOutcome::AuthError);
        }

        self.set_phase(EngineStatus::Writing);
        // stamped with the cycle start so the date folder matches the recording day
        let write_ts = self.cycle.lock().next_write_ts(now);
        let layout = PathLayout::from_config(&cfg);
        if sink.is_enabled() {
            // each category is written on its own; one failing does not block the other
            let result =
                write_records(sink.as_ref(), &layout, Category::Catalogue, &markets, write_ts).await;
            self.record_write(Category::Catalogue, result);
            if !fetch.books.is_empty() {
                let result =
                    write_records(sink.as_ref(), &layout, Category::Books, &fetch.books, write_ts).await;
                self.record_write(Category::Books, result);
            }
        }

        let (polls, persist) = {
            let mut cycle = self.cycle.lock();
            cycle.stats.record_cycle(markets.len(), fetch.books.len());
            let message = format!(
                "Poll #{}: {} markets, {} books",
                cycle.poll_count,
                markets.len(),
                fetch.books.len()
            );
            cycle.log(LogLevel::Info, message);
            let polls = cycle.stats.total_polls;
            (polls, polls % PERSIST_EVERY_POLLS == 0)
        };
        if persist {
            self.persist_state().await;
        }

        self.set_phase(EngineStatus::Running);
        info!(
            target: "recorder",
            total_polls = polls,
            markets = markets.len(),
            books = fetch.books.len(),
            "cycle complete"
        );
        Ok(CycleOutcome::Completed {
            markets: markets.len(),
            books: fetch.books.len(),
        })
    }

    fn record_write(&self, category: Category, result: SinkResult<String>) {
        let mut cycle = self.cycle.lock();
        match result {
            Ok(path) => {
                cycle.stats.total_writes += 1;
                match category {
                    Category::Catalogue => cycle.last_catalogue_path = Some(path),
                    Category::Books => cycle.last_books_path = Some(path),
                }
            }
            Err(err) => {
                error!(target: "storage", category = %category, error = %err, "recording write failed");
                cycle.stats.write_errors += 1;
                cycle.last_write_error = Some(err.to_string());
                cycle.add_error(format!("Write {category} failed: {err}"));
            }
        }
    }

    /// Reset per-day counters and the cache when `today` is past the recorded day,
    /// then persist the reset state straight away.
    pub(crate) async fn check_day_rollover(&self, today: NaiveDate) -> bool {
        let previous = {
            let mut cycle = self.cycle.lock();
            if today <= cycle.day {
                return false;
            }
            let previous = cycle.day;
            cycle.roll_over(today);
            cycle.log(LogLevel::Info, format!("Day rollover: {previous} -> {today}"));
            previous
        };
        self.cache.clear();
        self.persist_state().await;
        info!(target: "recorder", from = %previous, to = %today, "day rollover");
        true
    }

    /// Test hook: pretend the engine last recorded on `day`.
    #[doc(hidden)]
    pub fn set_recording_day(&self, day: NaiveDate) {
        self.cycle.lock().day = day;
    }

    pub fn recording_day(&self) -> NaiveDate {
        self.cycle.lock().day
    }

    pub fn poll_count(&self) -> u64 {
        self.cycle.lock().poll_count
    }
}
