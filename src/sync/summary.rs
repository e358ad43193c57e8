//! End-of-run accounting.

use crate::sync::upsert::RecordWrite;
use std::collections::BTreeMap;
use std::fmt;

/// Counts accumulated over a run, one window at a time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub windows: usize,
    pub records_fetched: usize,
    pub records_committed: usize,
    pub records_rolled_back: usize,
    /// Table name → rows inserted.
    pub inserted: BTreeMap<String, usize>,
    /// Table name → rows updated.
    pub updated: BTreeMap<String, usize>,
    pub sub_resource_failures: usize,
    pub mapping_diagnostics: usize,
    pub write_errors: usize,
    /// Pagination chains cut short by a failing page.
    pub page_failures: usize,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn record_committed(&mut self, write: &RecordWrite) {
        self.records_committed += 1;
        add_counts(&mut self.inserted, &write.inserted);
        add_counts(&mut self.updated, &write.updated);
    }

    pub fn record_rolled_back(&mut self) {
        self.records_rolled_back += 1;
        self.write_errors += 1;
    }

    pub fn rows_written(&self) -> usize {
        self.inserted.values().sum::<usize>() + self.updated.values().sum::<usize>()
    }

    pub fn has_errors(&self) -> bool {
        self.sub_resource_failures > 0
            || self.mapping_diagnostics > 0
            || self.write_errors > 0
            || self.page_failures > 0
    }

    /// Sum another summary into this one.
    pub fn merge(&mut self, other: RunSummary) {
        self.windows += other.windows;
        self.records_fetched += other.records_fetched;
        self.records_committed += other.records_committed;
        self.records_rolled_back += other.records_rolled_back;
        add_counts(&mut self.inserted, &other.inserted);
        add_counts(&mut self.updated, &other.updated);
        self.sub_resource_failures += other.sub_resource_failures;
        self.mapping_diagnostics += other.mapping_diagnostics;
        self.write_errors += other.write_errors;
        self.page_failures += other.page_failures;
        self.cancelled |= other.cancelled;
    }
}

fn add_counts(into: &mut BTreeMap<String, usize>, from: &BTreeMap<String, usize>) {
    for (table, count) in from {
        *into.entry(table.clone()).or_default() += count;
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "sync {}: {} windows, {} records fetched, {} committed, {} rolled back",
            if self.cancelled { "cancelled" } else { "finished" },
            self.windows,
            self.records_fetched,
            self.records_committed,
            self.records_rolled_back
        )?;

        let tables: std::collections::BTreeSet<&String> =
            self.inserted.keys().chain(self.updated.keys()).collect();
        for table in tables {
            writeln!(
                f,
                "  {}: {} inserted, {} updated",
                table,
                self.inserted.get(table).copied().unwrap_or(0),
                self.updated.get(table).copied().unwrap_or(0)
            )?;
        }

        write!(
            f,
            "errors: {} sub-resource fetch, {} mapping, {} write, {} page fetch",
            self.sub_resource_failures, self.mapping_diagnostics, self.write_errors, self.page_failures
        )
    }
}
