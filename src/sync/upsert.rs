//! Ordered, transactional upsert of one record's rows.
//!
//! Each source record moves through
//! `Pending -> Writing(table) -> ... -> Committed | RolledBack`.
//! Rows are written strictly in write-plan order inside a single
//! transaction; the first failing row rolls the whole record back.

use crate::error::{StorageError, WriteError};
use crate::storage::{Storage, StorageTransaction};
use crate::sync::mapping::{RowCandidate, WritePlan};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordState {
    Pending,
    Writing(String),
    Committed,
    RolledBack,
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordState::Pending => write!(f, "pending"),
            RecordState::Writing(table) => write!(f, "writing({table})"),
            RecordState::Committed => write!(f, "committed"),
            RecordState::RolledBack => write!(f, "rolled back"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowAction {
    Inserted,
    Updated,
}

/// Per-table row counts for one committed record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordWrite {
    pub inserted: BTreeMap<String, usize>,
    pub updated: BTreeMap<String, usize>,
}

impl RecordWrite {
    fn count(&mut self, table: &str, action: RowAction) {
        let counts = match action {
            RowAction::Inserted => &mut self.inserted,
            RowAction::Updated => &mut self.updated,
        };
        *counts.entry(table.to_string()).or_default() += 1;
    }

    pub fn rows(&self) -> usize {
        self.inserted.values().sum::<usize>() + self.updated.values().sum::<usize>()
    }
}

const TRANSACTION_SCOPE: &str = "<transaction>";

pub struct UpsertEngine {
    storage: Arc<dyn Storage>,
    plan: WritePlan,
}

impl UpsertEngine {
    pub fn new(storage: Arc<dyn Storage>, plan: WritePlan) -> Self {
        Self { storage, plan }
    }

    /// Sort `rows` into write-plan order, keeping mapping order within a table.
    /// Rows for tables outside the plan are dropped.
    pub fn order(&self, rows: Vec<RowCandidate>) -> Vec<RowCandidate> {
        let mut ranked: Vec<(usize, RowCandidate)> = rows
            .into_iter()
            .filter_map(|row| {
                let rank = self.plan.tables().iter().position(|table| *table == row.table);
                if rank.is_none() {
                    log::warn!("table '{}' is not in the write plan; row skipped", row.table);
                }
                rank.map(|rank| (rank, row))
            })
            .collect();
        ranked.sort_by_key(|(rank, _)| *rank);
        ranked.into_iter().map(|(_, row)| row).collect()
    }

    /// Upsert every row of one record inside one transaction.
    pub async fn apply(
        &self,
        record_id: &str,
        rows: Vec<RowCandidate>,
    ) -> Result<RecordWrite, WriteError> {
        let rows = self.order(rows);
        let mut outcome = RecordWrite::default();
        let mut state = RecordState::Pending;

        let mut tx = self
            .storage
            .begin()
            .await
            .map_err(|source| write_error(record_id, TRANSACTION_SCOPE, source))?;

        for row in &rows {
            if !matches!(&state, RecordState::Writing(table) if *table == row.table) {
                state = RecordState::Writing(row.table.clone());
                log::trace!("record {}: {}", record_id, state);
            }

            match write_row(tx.as_mut(), row).await {
                Ok(action) => {
                    log::debug!(
                        "record {}: {:?} {} {}",
                        record_id,
                        action,
                        row.table,
                        row.primary_key_value()
                    );
                    outcome.count(&row.table, action);
                }
                Err(source) => {
                    if let Err(rollback_err) = tx.rollback().await {
                        log::error!("record {}: rollback failed: {}", record_id, rollback_err);
                    }
                    state = RecordState::RolledBack;
                    log::error!(
                        "record {}: {} after write to {} failed: {}",
                        record_id,
                        state,
                        row.table,
                        source
                    );
                    return Err(write_error(record_id, &row.table, source));
                }
            }
        }

        tx.commit()
            .await
            .map_err(|source| write_error(record_id, TRANSACTION_SCOPE, source))?;
        state = RecordState::Committed;
        log::debug!("record {}: {} ({} rows)", record_id, state, outcome.rows());

        Ok(outcome)
    }
}

/// Update when the key exists, insert otherwise.
async fn write_row(
    tx: &mut dyn StorageTransaction,
    row: &RowCandidate,
) -> Result<RowAction, StorageError> {
    let pk_value = row.primary_key_value();
    if tx.exists(&row.table, &row.primary_key, pk_value).await? {
        let non_key: Vec<_> = row
            .values
            .iter()
            .filter(|(column, _)| *column != row.primary_key)
            .cloned()
            .collect();
        tx.update(&row.table, &non_key, &row.primary_key, pk_value).await?;
        Ok(RowAction::Updated)
    } else {
        tx.insert(&row.table, &row.primary_key, &row.values).await?;
        Ok(RowAction::Inserted)
    }
}

fn write_error(record_id: &str, table: &str, source: StorageError) -> WriteError {
    WriteError {
        record_id: record_id.to_string(),
        table: table.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, Operation};
    use serde_json::{Value, json};

    fn candidate(table: &str, pk: &str, values: &[(&str, Value)]) -> RowCandidate {
        RowCandidate {
            table: table.to_string(),
            mapping: table.to_string(),
            primary_key: pk.to_string(),
            values: values
                .iter()
                .map(|(column, value)| (column.to_string(), value.clone()))
                .collect(),
        }
    }

    fn plan() -> WritePlan {
        WritePlan::new(["customer", "booking", "booking_ref"]).unwrap()
    }

    fn storage() -> MemoryStorage {
        MemoryStorage::new()
            .with_foreign_key("booking", "customer_id", "customer")
            .with_foreign_key("booking_ref", "booking_id", "booking")
    }

    fn booking_rows(name: &str) -> Vec<RowCandidate> {
        vec![
            candidate("booking_ref", "ref_id", &[("ref_id", json!(100)), ("booking_id", json!(10))]),
            candidate("booking", "booking_id", &[("booking_id", json!(10)), ("customer_id", json!(1))]),
            candidate("customer", "customer_id", &[("customer_id", json!(1)), ("name", json!(name))]),
        ]
    }

    #[tokio::test]
    async fn second_apply_updates_instead_of_inserting() {
        let storage = storage();
        let engine = UpsertEngine::new(Arc::new(storage.clone()), plan());

        let first = engine.apply("10", booking_rows("Acme")).await.unwrap();
        assert_eq!(first.inserted.get("customer"), Some(&1));
        assert!(first.updated.is_empty());

        let second = engine.apply("10", booking_rows("Acme Ltd")).await.unwrap();
        assert!(second.inserted.is_empty());
        assert_eq!(second.updated.get("booking"), Some(&1));

        assert_eq!(storage.row_count("customer"), 1);
        assert_eq!(storage.row_count("booking"), 1);
        assert_eq!(storage.row_count("booking_ref"), 1);
        assert_eq!(
            storage.row("customer", &json!(1)).and_then(|row| row.get("name").cloned()),
            Some(json!("Acme Ltd"))
        );
    }

    #[tokio::test]
    async fn rows_are_written_in_plan_order() {
        let storage = storage();
        let engine = UpsertEngine::new(Arc::new(storage.clone()), plan());
        engine.apply("10", booking_rows("Acme")).await.unwrap();

        let tables: Vec<String> = storage
            .operations()
            .into_iter()
            .filter_map(|op| match op {
                Operation::Insert { table, .. } => Some(table),
                _ => None,
            })
            .collect();
        assert_eq!(tables, vec!["customer", "booking", "booking_ref"]);
    }

    #[tokio::test]
    async fn failing_row_rolls_back_the_record_and_the_next_record_proceeds() {
        let storage = storage();
        let engine = UpsertEngine::new(Arc::new(storage.clone()), plan());

        let orphan = vec![
            candidate("booking", "booking_id", &[("booking_id", json!(20)), ("customer_id", Value::Null)]),
            candidate("booking_ref", "ref_id", &[("ref_id", json!(200)), ("booking_id", json!(99))]),
        ];
        let err = engine.apply("20", orphan).await.unwrap_err();
        assert_eq!(err.record_id, "20");
        assert_eq!(err.table, "booking_ref");
        assert!(matches!(err.source, StorageError::ForeignKey { .. }));
        assert_eq!(storage.row_count("booking"), 0);
        assert_eq!(storage.operations().last(), Some(&Operation::Rollback));

        engine.apply("10", booking_rows("Acme")).await.unwrap();
        assert_eq!(storage.row_count("booking"), 1);
    }

    #[tokio::test]
    async fn out_of_order_plan_surfaces_a_write_error() {
        let storage = storage();
        let reversed = WritePlan::new(["booking_ref", "booking", "customer"]).unwrap();
        let engine = UpsertEngine::new(Arc::new(storage.clone()), reversed);

        let err = engine.apply("10", booking_rows("Acme")).await.unwrap_err();
        assert_eq!(err.table, "booking_ref");
        assert_eq!(storage.row_count("customer"), 0);
    }

    #[test]
    fn rows_outside_the_plan_are_dropped() {
        let engine = UpsertEngine::new(Arc::new(MemoryStorage::new()), plan());
        let ordered = engine.order(vec![
            candidate("invoice", "invoice_id", &[("invoice_id", json!(1))]),
            candidate("customer", "customer_id", &[("customer_id", json!(1))]),
        ]);
        assert_eq!(ordered.len(), 1);
        assert_eq!(ordered[0].table, "customer");
    }
}
