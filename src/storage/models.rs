use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::monitoring::metrics::RecorderStats;

/// Error list is trimmed to `ERRORS_KEEP` once it grows past `ERRORS_CAP`.
pub const ERRORS_CAP: usize = 200;
pub const ERRORS_KEEP: usize = 100;
pub const ACTIVITY_CAP: usize = 500;
pub const ACTIVITY_KEEP: usize = 250;

/// Number of errors written with the persisted state.
pub const PERSISTED_ERRORS: usize = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Per-day bookkeeping of the poll cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct CycleState {
    pub day: NaiveDate,
    pub poll_count: u64,
    pub last_poll: Option<DateTime<Utc>>,
    pub last_catalogue_path: Option<String>,
    pub last_books_path: Option<String>,
    pub last_write_error: Option<String>,
    /// Timestamp the previous cycle's objects were written under.
    pub last_write_ts: Option<DateTime<Utc>>,
    pub errors: Vec<ErrorEntry>,
    pub activity: Vec<ActivityEntry>,
    pub stats: RecorderStats,
}

impl CycleState {
    pub fn new(day: NaiveDate) -> Self {
        Self {
            day,
            poll_count: 0,
            last_poll: None,
            last_catalogue_path: None,
            last_books_path: None,
            last_write_error: None,
            last_write_ts: None,
            errors: Vec::new(),
            activity: Vec::new(),
            stats: RecorderStats::default(),
        }
    }

    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        push_bounded(
            &mut self.activity,
            ActivityEntry {
                timestamp: Utc::now(),
                level,
                message: message.into(),
            },
            ACTIVITY_CAP,
            ACTIVITY_KEEP,
        );
    }

    /// Record an error in both the error list and the activity log.
    pub fn add_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.log(LogLevel::Error, message.clone());
        push_bounded(
            &mut self.errors,
            ErrorEntry {
                timestamp: Utc::now(),
                message,
            },
            ERRORS_CAP,
            ERRORS_KEEP,
        );
    }

    /// Timestamp for this cycle's objects. At least one millisecond past the
    /// previous cycle's, so two cycles never share an object path.
    pub fn next_write_ts(&mut self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let ts = match self.last_write_ts {
            Some(prev) if ts < prev + Duration::milliseconds(1) => prev + Duration::milliseconds(1),
            _ => ts,
        };
        self.last_write_ts = Some(ts);
        ts
    }

    /// Reset for a new recording day. Cumulative stats survive.
    pub fn roll_over(&mut self, day: NaiveDate) {
        self.day = day;
        self.poll_count = 0;
        self.errors.clear();
    }

    pub fn restore(&mut self, persisted: PersistedState) {
        self.day = persisted.day;
        self.poll_count = persisted.poll_count;
        self.last_poll = persisted.last_poll;
        self.stats = persisted.stats;
        self.errors = persisted.errors;
    }

    pub fn to_persisted(&self, status: &str) -> PersistedState {
        let skip = self.errors.len().saturating_sub(PERSISTED_ERRORS);
        PersistedState {
            day: self.day,
            poll_count: self.poll_count,
            last_poll: self.last_poll,
            stats: self.stats.clone(),
            errors: self.errors[skip..].to_vec(),
            status: status.to_string(),
            saved_at: Utc::now(),
        }
    }
}

/// Crash-recovery snapshot of [`CycleState`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub day: NaiveDate,
    #[serde(default)]
    pub poll_count: u64,
    #[serde(default)]
    pub last_poll: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stats: RecorderStats,
    #[serde(default)]
    pub errors: Vec<ErrorEntry>,
    #[serde(default)]
    pub status: String,
    pub saved_at: DateTime<Utc>,
}

/// Dashboard view of one discovered market.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketSummary {
    pub market_id: String,
    pub market_name: String,
    pub market_start_time: Option<DateTime<Utc>>,
    pub venue: String,
    pub event: String,
    pub runners: usize,
    pub status: String,
    pub in_play: bool,
    pub total_matched: f64,
}

/// [`MarketSummary`] plus fields derived at read time.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketView {
    #[serde(flatten)]
    pub summary: MarketSummary,
    pub minutes_to_off: Option<f64>,
    pub has_book_data: bool,
}

fn push_bounded<T>(items: &mut Vec<T>, item: T, cap: usize, keep: usize) {
    items.push(item);
    if items.len() > cap {
        let drop = items.len() - keep;
        items.drain(..drop);
    }
}
