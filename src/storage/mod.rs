//! Relational storage behind the upsert engine.
//!
//! The engine owns the transaction boundary: it opens one transaction per
//! source record, issues existence checks and writes through it, and then
//! commits or rolls back. Table and column names reaching this layer have
//! already been validated as plain identifiers.

pub mod memory;
pub mod postgres;

pub use memory::{MemoryStorage, Operation};
pub use postgres::PgStorage;

use crate::error::StorageError;
use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait Storage: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StorageTransaction>, StorageError>;
}

/// Writes scoped to one transaction. Any call after `commit` or `rollback`
/// fails with [`StorageError::TransactionClosed`].
#[async_trait]
pub trait StorageTransaction: Send {
    async fn exists(
        &mut self,
        table: &str,
        pk_column: &str,
        pk_value: &Value,
    ) -> Result<bool, StorageError>;

    /// Insert a new row; `values` includes the `pk_column` entry.
    async fn insert(
        &mut self,
        table: &str,
        pk_column: &str,
        values: &[(String, Value)],
    ) -> Result<(), StorageError>;

    /// Overwrite `values` on the row whose `pk_column` equals `pk_value`.
    async fn update(
        &mut self,
        table: &str,
        values: &[(String, Value)],
        pk_column: &str,
        pk_value: &Value,
    ) -> Result<(), StorageError>;

    async fn commit(&mut self) -> Result<(), StorageError>;

    async fn rollback(&mut self) -> Result<(), StorageError>;
}

/// Text form of a key value; `5` and `"5"` address the same row.
pub(crate) fn key_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
