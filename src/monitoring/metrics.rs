use serde::{Deserialize, Serialize};
use tracing::info;

/// Cumulative recorder counters, persisted with the cycle state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderStats {
    pub total_polls: u64,
    pub total_markets_recorded: u64,
    pub total_books_recorded: u64,
    pub total_writes: u64,
    pub write_errors: u64,
    pub api_errors: u64,
}

impl RecorderStats {
    pub fn record_cycle(&mut self, markets: usize, books: usize) {
        self.total_polls += 1;
        self.total_markets_recorded += markets as u64;
        self.total_books_recorded += books as u64;
    }
}

/// Stats plus current cache occupancy, as shown on the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    #[serde(flatten)]
    pub totals: RecorderStats,
    pub markets_cached: usize,
    pub books_cached: usize,
}

pub fn log_stats_snapshot(snapshot: &StatsSnapshot) {
    info!(
        target: "metrics",
        event = "stats_snapshot",
        total_polls = snapshot.totals.total_polls,
        total_markets_recorded = snapshot.totals.total_markets_recorded,
        total_books_recorded = snapshot.totals.total_books_recorded,
        total_writes = snapshot.totals.total_writes,
        write_errors = snapshot.totals.write_errors,
        api_errors = snapshot.totals.api_errors,
        markets_cached = snapshot.markets_cached,
        books_cached = snapshot.books_cached,
        "stats snapshot"
    );
}
