//! In-process storage used for dry runs and tests.
//!
//! Rows are keyed by the text form of their primary key. Declared foreign
//! keys are checked on every write against committed rows and rows staged in
//! the same transaction. Every call is appended to an operation log so the
//! order of writes can be inspected afterwards.

use crate::error::StorageError;
use crate::storage::{Storage, StorageTransaction, key_text};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

type Row = BTreeMap<String, Value>;
type Table = BTreeMap<String, Row>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Begin,
    Insert { table: String, key: String },
    Update { table: String, key: String },
    Commit,
    Rollback,
}

#[derive(Debug, Clone)]
struct ForeignKey {
    table: String,
    column: String,
    references: String,
}

#[derive(Default)]
struct State {
    tables: BTreeMap<String, Table>,
    operations: Vec<Operation>,
}

#[derive(Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<State>>,
    foreign_keys: Arc<Vec<ForeignKey>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require every non-null `table.column` to name an existing row of `references`.
    pub fn with_foreign_key(mut self, table: &str, column: &str, references: &str) -> Self {
        let mut keys = self.foreign_keys.as_ref().clone();
        keys.push(ForeignKey {
            table: table.to_string(),
            column: column.to_string(),
            references: references.to_string(),
        });
        self.foreign_keys = Arc::new(keys);
        self
    }

    pub fn row(&self, table: &str, key: &Value) -> Option<BTreeMap<String, Value>> {
        self.state
            .lock()
            .tables
            .get(table)
            .and_then(|rows| rows.get(&key_text(key)))
            .cloned()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.state
            .lock()
            .tables
            .get(table)
            .map(|rows| rows.len())
            .unwrap_or(0)
    }

    /// Table name → committed row count.
    pub fn row_counts(&self) -> BTreeMap<String, usize> {
        self.state
            .lock()
            .tables
            .iter()
            .map(|(table, rows)| (table.clone(), rows.len()))
            .collect()
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.state.lock().operations.clone()
    }

    fn log(&self, operation: Operation) {
        self.state.lock().operations.push(operation);
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn begin(&self) -> Result<Box<dyn StorageTransaction>, StorageError> {
        self.log(Operation::Begin);
        Ok(Box::new(MemoryTransaction {
            storage: self.clone(),
            staged: BTreeMap::new(),
            open: true,
        }))
    }
}

/// Staged rows become visible to other transactions on commit.
pub struct MemoryTransaction {
    storage: MemoryStorage,
    staged: BTreeMap<String, Table>,
    open: bool,
}

impl MemoryTransaction {
    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.open {
            Ok(())
        } else {
            Err(StorageError::TransactionClosed)
        }
    }

    fn visible(&self, table: &str, key: &str) -> Option<Row> {
        if let Some(row) = self.staged.get(table).and_then(|rows| rows.get(key)) {
            return Some(row.clone());
        }
        self.storage
            .state
            .lock()
            .tables
            .get(table)
            .and_then(|rows| rows.get(key))
            .cloned()
    }

    fn check_foreign_keys(&self, table: &str, row: &Row) -> Result<(), StorageError> {
        for fk in self.storage.foreign_keys.iter().filter(|fk| fk.table == table) {
            let Some(value) = row.get(&fk.column).filter(|value| !value.is_null()) else {
                continue;
            };
            let key = key_text(value);
            if self.visible(&fk.references, &key).is_none() {
                return Err(StorageError::ForeignKey {
                    table: fk.table.clone(),
                    column: fk.column.clone(),
                    value: key,
                    references: fk.references.clone(),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StorageTransaction for MemoryTransaction {
    async fn exists(
        &mut self,
        table: &str,
        _pk_column: &str,
        pk_value: &Value,
    ) -> Result<bool, StorageError> {
        self.ensure_open()?;
        Ok(self.visible(table, &key_text(pk_value)).is_some())
    }

    async fn insert(
        &mut self,
        table: &str,
        pk_column: &str,
        values: &[(String, Value)],
    ) -> Result<(), StorageError> {
        self.ensure_open()?;
        let row: Row = values.iter().cloned().collect();
        self.check_foreign_keys(table, &row)?;

        let key = row.get(pk_column).map(key_text).unwrap_or_default();
        self.storage.log(Operation::Insert {
            table: table.to_string(),
            key: key.clone(),
        });
        self.staged.entry(table.to_string()).or_default().insert(key, row);
        Ok(())
    }

    async fn update(
        &mut self,
        table: &str,
        values: &[(String, Value)],
        pk_column: &str,
        pk_value: &Value,
    ) -> Result<(), StorageError> {
        self.ensure_open()?;
        let key = key_text(pk_value);
        let mut row = self.visible(table, &key).unwrap_or_else(|| {
            let mut fresh = Row::new();
            fresh.insert(pk_column.to_string(), pk_value.clone());
            fresh
        });
        for (column, value) in values {
            row.insert(column.clone(), value.clone());
        }
        self.check_foreign_keys(table, &row)?;

        self.storage.log(Operation::Update {
            table: table.to_string(),
            key: key.clone(),
        });
        self.staged.entry(table.to_string()).or_default().insert(key, row);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        self.ensure_open()?;
        self.open = false;

        let staged = std::mem::take(&mut self.staged);
        let mut state = self.storage.state.lock();
        for (table, rows) in staged {
            state.tables.entry(table).or_default().extend(rows);
        }
        state.operations.push(Operation::Commit);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StorageError> {
        self.ensure_open()?;
        self.open = false;
        self.staged.clear();
        self.storage.log(Operation::Rollback);
        Ok(())
    }
}
