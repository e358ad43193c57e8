//! Booking synchronization pipeline.
//!
//! This module pulls booking records from the remote REST API and writes them
//! into the relational store described by a [`MappingSet`].
//!
//! # Architecture Overview
//!
//! ## Core Components
//!
//! - **`fetcher`**: Follows the listing endpoint's `next` links for one time
//!   window, strictly one page at a time.
//!
//! - **`enricher`**: Finds every absolute link embedded in a record, fetches
//!   each distinct URL once and merges the flattened bodies back in without
//!   shadowing the record's own fields.
//!
//! - **`flatten`**: Turns nested JSON into single-level `path -> scalar` maps.
//!
//! - **`mapping`**: Parses the declarative table mappings and projects a flat
//!   record into per-table row candidates.
//!
//! - **`upsert`**: Writes the row candidates of one record in write-plan order
//!   inside a single transaction.
//!
//! - **`ledger`**: Run-scoped record of requested URLs and cached
//!   sub-resource bodies, shared by the fetcher and the enricher.
//!
//! ## Data Flow
//!
//! 1. **Windowing**: The run's date range is split into consecutive windows
//! 2. **Pagination**: Each window is listed through its own pagination chain
//! 3. **Enrichment**: Records are enriched concurrently by a bounded worker pool
//! 4. **Projection**: Each enriched record is flattened and projected
//! 5. **Upsert**: Rows are written by a single writer, one transaction per record
//!
//! ## Failure Handling
//!
//! Sub-resource, mapping and write failures stay with their record and are
//! counted in the [`RunSummary`]. A failing page, a credential failure or
//! cancellation ends the run once the records already fetched are written.

pub mod enricher;
pub mod fetcher;
pub mod flatten;
pub mod ledger;
pub mod mapping;
pub mod snapshot;
pub mod summary;
pub mod upsert;
pub mod window;

use crate::client::ResourceClient;
use crate::config::PipelineConfig;
use crate::error::{FetchError, PageFetchError, SyncError, SyncResult};
use crate::storage::Storage;
use crate::sync::enricher::{EnrichedRecord, ReferenceEnricher};
use crate::sync::fetcher::PaginatedFetcher;
use crate::sync::flatten::FlatRecord;
use crate::sync::ledger::FetchLedger;
use crate::sync::mapping::{EntityMapper, MappingSet};
use crate::sync::upsert::UpsertEngine;
use crate::sync::window::RecordFilter;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub use summary::RunSummary;

/// One listing item exactly as the remote API returned it.
pub type RawRecord = Value;

/// The record's `id` as text, for logs and error reports.
pub fn record_id(record: &Value) -> String {
    match record.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => "<unknown>".to_string(),
    }
}

/// Summary of a run together with the error that ended it early, if any.
#[derive(Debug)]
pub struct RunReport {
    pub summary: RunSummary,
    pub error: Option<SyncError>,
}

impl RunReport {
    pub fn into_result(self) -> SyncResult<RunSummary> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.summary),
        }
    }
}

/// How a window's pagination chain ended.
enum WindowEnd {
    Complete,
    Failed(SyncError),
}

pub struct SyncPipeline {
    fetcher: PaginatedFetcher,
    enricher: Arc<ReferenceEnricher>,
    mapper: EntityMapper,
    mappings: MappingSet,
    engine: UpsertEngine,
    config: PipelineConfig,
    ledger: Arc<FetchLedger>,
    cancel: CancellationToken,
}

impl SyncPipeline {
    pub fn new(
        client: Arc<dyn ResourceClient>,
        storage: Arc<dyn Storage>,
        mappings: MappingSet,
        config: PipelineConfig,
        cancel: CancellationToken,
    ) -> Self {
        let ledger = Arc::new(FetchLedger::new());
        let fetcher = PaginatedFetcher::new(
            Arc::clone(&client),
            Arc::clone(&ledger),
            config.page_size,
            cancel.clone(),
        );
        let enricher = Arc::new(ReferenceEnricher::new(
            client,
            Arc::clone(&ledger),
            cancel.clone(),
        ));

        Self {
            fetcher,
            enricher,
            mapper: EntityMapper::new(config.max_indexed_rows),
            engine: UpsertEngine::new(storage, mappings.write_plan.clone()),
            mappings,
            config,
            ledger,
            cancel,
        }
    }

    /// URLs requested so far in this run.
    pub fn requested_urls(&self) -> usize {
        self.ledger.len()
    }

    /// Sync every window in order. Windows share this run's URL ledger.
    pub async fn run(&self, filters: &[RecordFilter]) -> RunReport {
        log::info!(
            "sync started: {} windows, {} mappings over {} tables",
            filters.len(),
            self.mappings.mappings.len(),
            self.mappings.write_plan.tables().len()
        );

        let mut summary = RunSummary::default();
        for filter in filters {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                return RunReport {
                    summary,
                    error: Some(SyncError::Cancelled),
                };
            }

            let (window_summary, end) = self.run_window(filter).await;
            summary.merge(window_summary);

            if let WindowEnd::Failed(err) = end {
                log::error!("window {}: sync stopped: {}", filter.window, err);
                return RunReport {
                    summary,
                    error: Some(err),
                };
            }
        }

        RunReport {
            summary,
            error: None,
        }
    }

    async fn run_window(&self, filter: &RecordFilter) -> (RunSummary, WindowEnd) {
        let mut summary = RunSummary {
            windows: 1,
            ..Default::default()
        };
        log::info!("window {}: listing records", filter.window);

        let (records, mut end) = match self.fetcher.fetch(&self.config.data_api_url, filter).await {
            Ok(records) => (records, WindowEnd::Complete),
            Err(err) => {
                let records = err.partial.clone();
                (records, self.classify_page_failure(err, &mut summary))
            }
        };
        summary.records_fetched = records.len();

        let flattened = self.process_records(records, &mut summary).await;

        if summary.cancelled && matches!(end, WindowEnd::Complete) {
            end = WindowEnd::Failed(SyncError::Cancelled);
        }

        if let (Some(dir), Some(flat_records)) = (&self.config.snapshot_dir, flattened) {
            if let Err(err) = snapshot::write_snapshot(dir, &filter.window, &flat_records) {
                if matches!(end, WindowEnd::Complete) {
                    end = WindowEnd::Failed(SyncError::Snapshot(err));
                } else {
                    log::error!("window {}: snapshot not written: {}", filter.window, err);
                }
            }
        }

        (summary, end)
    }

    fn classify_page_failure(&self, err: PageFetchError, summary: &mut RunSummary) -> WindowEnd {
        match err.source {
            FetchError::Cancelled { .. } => {
                summary.cancelled = true;
                WindowEnd::Failed(SyncError::Cancelled)
            }
            FetchError::Credentials(auth) => WindowEnd::Failed(SyncError::Auth(auth)),
            _ => {
                summary.page_failures += 1;
                WindowEnd::Failed(SyncError::Fetch(err))
            }
        }
    }

    /// Enrich `records` on the worker pool and write them one at a time.
    /// Returns the flattened records when a snapshot is configured.
    async fn process_records(
        &self,
        records: Vec<RawRecord>,
        summary: &mut RunSummary,
    ) -> Option<Vec<FlatRecord>> {
        let mut snapshot = self.config.snapshot_dir.as_ref().map(|_| Vec::with_capacity(records.len()));
        if records.is_empty() {
            return snapshot;
        }

        let workers = self.config.record_workers.max(1);
        let (sender, mut receiver) = mpsc::channel::<EnrichedRecord>(workers * 2);
        let producer = tokio::spawn(enrich_all(
            Arc::clone(&self.enricher),
            records,
            workers,
            sender,
            self.cancel.clone(),
        ));

        loop {
            let enriched = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    summary.cancelled = true;
                    break;
                }
                enriched = receiver.recv() => enriched,
            };
            let Some(enriched) = enriched else {
                break;
            };

            let flat = self.write_record(&enriched, summary).await;
            if let Some(snapshot) = snapshot.as_mut() {
                snapshot.push(flat);
            }
        }

        drop(receiver);
        if let Err(err) = producer.await {
            log::error!("enrichment workers failed: {}", err);
        }

        snapshot
    }

    async fn write_record(&self, enriched: &EnrichedRecord, summary: &mut RunSummary) -> FlatRecord {
        let id = record_id(&enriched.record);
        summary.sub_resource_failures += enriched.failed.len();

        let flat = enriched.flatten();
        let projection = self.mapper.project_all(&flat, &self.mappings);
        for diagnostic in &projection.diagnostics {
            log::warn!("record {}: {}", id, diagnostic);
        }
        summary.mapping_diagnostics += projection.diagnostics.len();

        match self.engine.apply(&id, projection.rows).await {
            Ok(write) => {
                log::debug!("record {}: committed {} rows", id, write.rows());
                summary.record_committed(&write);
            }
            Err(err) => {
                log::error!("{}", err);
                summary.record_rolled_back();
            }
        }

        flat
    }
}

/// Enrich every record with at most `workers` in flight, sending results as
/// they complete. Stops starting new work once cancelled or once the
/// receiving side is gone.
async fn enrich_all(
    enricher: Arc<ReferenceEnricher>,
    records: Vec<RawRecord>,
    workers: usize,
    sender: mpsc::Sender<EnrichedRecord>,
    cancel: CancellationToken,
) {
    let permits = Arc::new(Semaphore::new(workers));
    let mut tasks = JoinSet::new();

    for record in records {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = Arc::clone(&permits).acquire_owned() => permit,
        };
        let Ok(permit) = permit else {
            break;
        };
        if sender.is_closed() {
            break;
        }

        let enricher = Arc::clone(&enricher);
        let sender = sender.clone();
        tasks.spawn(async move {
            let enriched = enricher.enrich(record).await;
            // The writer may have stopped; the result is then discarded.
            let _ = sender.send(enriched).await;
            drop(permit);
        });
    }
    drop(sender);

    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            log::warn!("enrichment task failed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_id_accepts_numbers_and_strings() {
        assert_eq!(record_id(&json!({"id": 10})), "10");
        assert_eq!(record_id(&json!({"id": "B-7"})), "B-7");
        assert_eq!(record_id(&json!({"name": "x"})), "<unknown>");
    }
}
