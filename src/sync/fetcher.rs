//! Cursor-driven listing of records through `next` links.

use crate::client::ResourceClient;
use crate::error::{FetchError, PageFetchError};
use crate::sync::RawRecord;
use crate::sync::ledger::FetchLedger;
use crate::sync::window::RecordFilter;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One listing page as returned by the remote API.
#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    items: Vec<RawRecord>,
    #[serde(default)]
    next: Option<String>,
    #[serde(default)]
    count: Option<u64>,
}

pub struct PaginatedFetcher {
    client: Arc<dyn ResourceClient>,
    ledger: Arc<FetchLedger>,
    page_size: usize,
    cancel: CancellationToken,
}

impl PaginatedFetcher {
    pub fn new(
        client: Arc<dyn ResourceClient>,
        ledger: Arc<FetchLedger>,
        page_size: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            ledger,
            page_size,
            cancel,
        }
    }

    /// Build the URL of the first page for `filter`.
    pub fn first_page_url(&self, base_url: &str, filter: &RecordFilter) -> Result<String, FetchError> {
        reqwest::Url::parse_with_params(base_url, filter.query_params(self.page_size))
            .map(String::from)
            .map_err(|err| FetchError::InvalidUrl {
                url: base_url.to_string(),
                reason: err.to_string(),
            })
    }

    /// Follow the pagination chain for `filter` until `next` is absent.
    ///
    /// Pages are requested one at a time. A failed page ends the chain and the
    /// records gathered so far travel inside the error. A `next` link that was
    /// already requested during this run ends the chain normally.
    pub async fn fetch(
        &self,
        base_url: &str,
        filter: &RecordFilter,
    ) -> Result<Vec<RawRecord>, PageFetchError> {
        let mut records = Vec::new();
        let mut pages_fetched = 0usize;

        let mut current = match self.first_page_url(base_url, filter) {
            Ok(url) => Some(url),
            Err(source) => {
                return Err(PageFetchError {
                    pages_fetched,
                    partial: records,
                    source,
                });
            }
        };

        while let Some(url) = current.take() {
            if self.cancel.is_cancelled() {
                return Err(PageFetchError {
                    pages_fetched,
                    partial: records,
                    source: FetchError::Cancelled { url },
                });
            }

            if !self.ledger.claim_page(&url) {
                log::warn!(
                    "window {}: {}; stopping pagination",
                    filter.window,
                    FetchError::AlreadyFetched { url }
                );
                break;
            }

            let body = tokio::select! {
                _ = self.cancel.cancelled() => Err(FetchError::Cancelled { url: url.clone() }),
                body = self.client.get(&url) => body,
            };

            let page = match body.and_then(|body| decode_page(&url, body)) {
                Ok(page) => page,
                Err(source) => {
                    log::error!(
                        "window {}: page {} failed after {} records: {}",
                        filter.window,
                        pages_fetched + 1,
                        records.len(),
                        source
                    );
                    return Err(PageFetchError {
                        pages_fetched,
                        partial: records,
                        source,
                    });
                }
            };

            pages_fetched += 1;
            if pages_fetched == 1 {
                if let Some(count) = page.count {
                    log::info!("window {}: api reports {} matching records", filter.window, count);
                }
            }
            log::debug!(
                "window {}: page {} returned {} items",
                filter.window,
                pages_fetched,
                page.items.len()
            );

            records.extend(page.items);
            current = page.next.filter(|next| !next.is_empty());
        }

        log::info!(
            "window {}: fetched {} records in {} pages",
            filter.window,
            records.len(),
            pages_fetched
        );
        Ok(records)
    }
}

fn decode_page(url: &str, body: Value) -> Result<Page, FetchError> {
    serde_json::from_value(body).map_err(|source| FetchError::Decode {
        url: url.to_string(),
        source,
    })
}
