use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::client::auth::SessionGuardian;
use crate::client::weights::batch_size;
use crate::client::{CatalogueRequest, ClientResult, ExchangeApi, MarketBook, MarketCatalogue};
use crate::types::BetfairConfig;

/// Outcome of a chunked book fetch. Failed chunks only shrink `books`.
#[derive(Debug, Default)]
pub struct BookFetch {
    pub books: Vec<MarketBook>,
    pub requested: usize,
    pub batch_size: usize,
    pub failed_chunks: usize,
}

impl BookFetch {
    pub fn shortfall(&self) -> usize {
        self.requested.saturating_sub(self.books.len())
    }
}

/// Issues discovery and price calls for one cycle, reporting auth failures to the guardian.
pub struct MarketFetcher<'a> {
    api: &'a dyn ExchangeApi,
    guardian: &'a SessionGuardian,
    creds: &'a BetfairConfig,
    chunk_delay: Duration,
}

impl<'a> MarketFetcher<'a> {
    pub fn new(
        api: &'a dyn ExchangeApi,
        guardian: &'a SessionGuardian,
        creds: &'a BetfairConfig,
        chunk_delay: Duration,
    ) -> Self {
        Self {
            api,
            guardian,
            creds,
            chunk_delay,
        }
    }

    /// Single discovery call. `Ok(vec![])` means no matches; `Err` means the call failed.
    pub async fn fetch_catalogue(&self, request: &CatalogueRequest) -> ClientResult<Vec<MarketCatalogue>> {
        self.api
            .list_market_catalogue(self.creds, request)
            .await
            .inspect_err(|err| self.guardian.observe_error(err))
    }

    /// Fetch books in planner-sized chunks. A failed chunk is logged and skipped.
    pub async fn fetch_books(&self, market_ids: &[String], price_data: &[String]) -> BookFetch {
        let size = batch_size(price_data);
        let mut fetch = BookFetch {
            requested: market_ids.len(),
            batch_size: size,
            ..BookFetch::default()
        };

        let chunks: Vec<&[String]> = market_ids.chunks(size).collect();
        let last = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.into_iter().enumerate() {
            match self.api.list_market_book(self.creds, chunk, price_data).await {
                Ok(books) => fetch.books.extend(books),
                Err(err) => {
                    self.guardian.observe_error(&err);
                    fetch.failed_chunks += 1;
                    warn!(
                        target: "recorder",
                        error = %err,
                        chunk = i,
                        markets = chunk.len(),
                        "book chunk failed; continuing"
                    );
                }
            }

            if i < last && !self.chunk_delay.is_zero() {
                sleep(self.chunk_delay).await;
            }
        }

        if fetch.shortfall() > 0 {
            warn!(
                target: "recorder",
                fetched = fetch.books.len(),
                requested = fetch.requested,
                failed_chunks = fetch.failed_chunks,
                "book fetch incomplete"
            );
        }
        info!(
            target: "recorder",
            fetched = fetch.books.len(),
            requested = fetch.requested,
            batch_size = size,
            "books fetched"
        );
        fetch
    }
}
