//! Run-scoped record of every URL requested during one sync run.
//!
//! Shared by the paginated fetcher and the reference enricher. Bodies of
//! successfully fetched sub-resources are kept so a URI referenced by many
//! records is requested once per run. Races between concurrent enrichments
//! can only cause a redundant request, never a lost or corrupted entry.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum LedgerEntry {
    /// A page request; its body belongs to the pagination chain.
    Page,
    Fetched(Arc<Value>),
    Failed,
}

/// Outcome of a previous request for the same URL.
#[derive(Debug, Clone)]
pub enum Prior {
    Fetched(Arc<Value>),
    Failed,
    Page,
}

#[derive(Debug, Default)]
pub struct FetchLedger {
    entries: DashMap<String, LedgerEntry>,
}

impl FetchLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a URL for a page request. False if it was requested before.
    pub fn claim_page(&self, url: &str) -> bool {
        match self.entries.entry(url.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(LedgerEntry::Page);
                true
            }
        }
    }

    /// What happened the last time this URL was requested, if it was.
    pub fn prior(&self, url: &str) -> Option<Prior> {
        self.entries.get(url).map(|entry| match entry.value() {
            LedgerEntry::Page => Prior::Page,
            LedgerEntry::Fetched(body) => Prior::Fetched(Arc::clone(body)),
            LedgerEntry::Failed => Prior::Failed,
        })
    }

    pub fn record_success(&self, url: &str, body: Arc<Value>) {
        self.entries
            .insert(url.to_string(), LedgerEntry::Fetched(body));
    }

    pub fn record_failure(&self, url: &str) {
        self.entries.insert(url.to_string(), LedgerEntry::Failed);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
