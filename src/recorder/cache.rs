//! Latest discovery and price results, shared between the poll worker and readers.
//!
//! One reader-writer lock guards the market list, the market index and the book
//! map together. It is held only for the in-memory update itself, never across
//! upstream calls. Every read hands back owned copies.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::client::{MarketBook, MarketCatalogue};
use crate::storage::models::{MarketSummary, MarketView};
use crate::utils::time::minutes_until;

/// Status shown for a discovered market until a book says otherwise.
pub const DISCOVERED_STATUS: &str = "OPEN";
const UNKNOWN_STATUS: &str = "UNKNOWN";

#[derive(Default)]
struct CacheInner {
    markets: Vec<MarketCatalogue>,
    index: HashMap<String, MarketSummary>,
    books: HashMap<String, MarketBook>,
}

#[derive(Default)]
pub struct SnapshotCache {
    inner: RwLock<CacheInner>,
}

fn summarize(market: &MarketCatalogue) -> MarketSummary {
    let (venue, event) = market
        .event
        .as_ref()
        .map(|e| (e.venue.clone(), e.name.clone()))
        .unwrap_or_default();
    MarketSummary {
        market_id: market.market_id.clone(),
        market_name: market.market_name.clone(),
        market_start_time: market.market_start_time,
        venue,
        event,
        runners: market.runners.len(),
        status: DISCOVERED_STATUS.to_string(),
        in_play: false,
        total_matched: 0.0,
    }
}

fn apply_book(summary: &mut MarketSummary, book: &MarketBook) {
    summary.status = book
        .status
        .clone()
        .unwrap_or_else(|| UNKNOWN_STATUS.to_string());
    summary.in_play = book.in_play;
    summary.total_matched = book.total_matched;
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap in a fresh discovery result and rebuild the index from it.
    ///
    /// Books of markets no longer discovered are dropped so the index and the
    /// book map stay keyed by the same identifiers. Retained books refresh the
    /// new summaries straight away.
    pub fn replace_catalogue(&self, markets: Vec<MarketCatalogue>) {
        let mut inner = self.inner.write();
        let mut index = HashMap::with_capacity(markets.len());
        for market in &markets {
            let mut summary = summarize(market);
            if let Some(book) = inner.books.get(&market.market_id) {
                apply_book(&mut summary, book);
            }
            index.insert(market.market_id.clone(), summary);
        }
        inner.books.retain(|id, _| index.contains_key(id));
        inner.index = index;
        inner.markets = markets;
    }

    /// Store fresh books and refresh the matching summaries in one pass.
    /// Books for markets outside the current index are ignored.
    pub fn apply_books(&self, books: &[MarketBook]) -> usize {
        let mut inner = self.inner.write();
        let CacheInner { index, books: book_map, .. } = &mut *inner;
        let mut applied = 0;
        for book in books {
            let Some(summary) = index.get_mut(&book.market_id) else {
                continue;
            };
            apply_book(summary, book);
            book_map.insert(book.market_id.clone(), book.clone());
            applied += 1;
        }
        applied
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.markets.clear();
        inner.index.clear();
        inner.books.clear();
    }

    pub fn markets(&self) -> Vec<MarketCatalogue> {
        self.inner.read().markets.clone()
    }

    pub fn book(&self, market_id: &str) -> Option<MarketBook> {
        self.inner.read().books.get(market_id).cloned()
    }

    /// Books for the requested identifiers, in request order, skipping unknown ones.
    pub fn books(&self, market_ids: &[String]) -> Vec<MarketBook> {
        let inner = self.inner.read();
        market_ids
            .iter()
            .filter_map(|id| inner.books.get(id).cloned())
            .collect()
    }

    /// (indexed markets, cached books)
    pub fn counts(&self) -> (usize, usize) {
        let inner = self.inner.read();
        (inner.index.len(), inner.books.len())
    }

    /// Dashboard rows sorted by start time, all derived from a single locked read.
    pub fn market_views(&self, now: DateTime<Utc>) -> Vec<MarketView> {
        let inner = self.inner.read();
        let mut views: Vec<MarketView> = inner
            .index
            .values()
            .map(|summary| MarketView {
                minutes_to_off: summary.market_start_time.map(|start| minutes_until(start, now)),
                has_book_data: inner.books.contains_key(&summary.market_id),
                summary: summary.clone(),
            })
            .collect();
        drop(inner);

        // markets without a start time sort last
        views.sort_by(|a, b| {
            match (a.summary.market_start_time, b.summary.market_start_time) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            }
            .then_with(|| a.summary.market_id.cmp(&b.summary.market_id))
        });
        views
    }
}
