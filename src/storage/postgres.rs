use crate::config::DatabaseConfig;
use crate::error::StorageError;
use crate::storage::{Storage, StorageTransaction};
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};

pub(crate) static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// PostgreSQL storage. Column values are bound as one JSONB document and
/// converted through `jsonb_populate_record`, so each column receives the
/// value coerced to its declared type.
#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StorageError> {
        log::info!("connecting to database (max {} connections)", config.max_connections);
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the bundled booking schema.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|err| StorageError::Database(err.into()))?;
        log::info!("database migrations successful");
        Ok(())
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn begin(&self) -> Result<Box<dyn StorageTransaction>, StorageError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction { tx: Some(tx) }))
    }
}

pub struct PgTransaction {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgTransaction {
    fn open(&mut self) -> Result<&mut Transaction<'static, Postgres>, StorageError> {
        self.tx.as_mut().ok_or(StorageError::TransactionClosed)
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{identifier}\"")
}

fn column_list(values: &[(String, Value)]) -> String {
    values
        .iter()
        .map(|(column, _)| quote(column))
        .collect::<Vec<_>>()
        .join(", ")
}

fn document(values: &[(String, Value)]) -> Json<Value> {
    let map: Map<String, Value> = values.iter().cloned().collect();
    Json(Value::Object(map))
}

fn key_document(pk_column: &str, pk_value: &Value) -> Json<Value> {
    let mut map = Map::new();
    map.insert(pk_column.to_string(), pk_value.clone());
    Json(Value::Object(map))
}

#[async_trait]
impl StorageTransaction for PgTransaction {
    async fn exists(
        &mut self,
        table: &str,
        pk_column: &str,
        pk_value: &Value,
    ) -> Result<bool, StorageError> {
        let (table, pk) = (quote(table), quote(pk_column));
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {table} WHERE {pk} = \
             (SELECT {pk} FROM jsonb_populate_record(NULL::{table}, $1)))"
        );

        let tx = self.open()?;
        let found: bool = sqlx::query_scalar(&sql)
            .bind(key_document(pk_column, pk_value))
            .fetch_one(&mut **tx)
            .await?;
        Ok(found)
    }

    async fn insert(
        &mut self,
        table: &str,
        _pk_column: &str,
        values: &[(String, Value)],
    ) -> Result<(), StorageError> {
        let table = quote(table);
        let columns = column_list(values);
        let sql = format!(
            "INSERT INTO {table} ({columns}) \
             SELECT {columns} FROM jsonb_populate_record(NULL::{table}, $1)"
        );

        let tx = self.open()?;
        sqlx::query(&sql)
            .bind(document(values))
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn update(
        &mut self,
        table: &str,
        values: &[(String, Value)],
        pk_column: &str,
        pk_value: &Value,
    ) -> Result<(), StorageError> {
        if values.is_empty() {
            return Ok(());
        }

        let (table, pk) = (quote(table), quote(pk_column));
        let columns = column_list(values);
        let sql = format!(
            "UPDATE {table} SET ({columns}) = \
             (SELECT {columns} FROM jsonb_populate_record(NULL::{table}, $1)) \
             WHERE {pk} = (SELECT {pk} FROM jsonb_populate_record(NULL::{table}, $2))"
        );

        let tx = self.open()?;
        sqlx::query(&sql)
            .bind(document(values))
            .bind(key_document(pk_column, pk_value))
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        let tx = self.tx.take().ok_or(StorageError::TransactionClosed)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StorageError> {
        let tx = self.tx.take().ok_or(StorageError::TransactionClosed)?;
        tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identifiers_are_quoted_in_column_lists() {
        let values = vec![("booking_id".to_string(), json!(1)), ("uri".to_string(), json!("x"))];
        assert_eq!(column_list(&values), "\"booking_id\", \"uri\"");
    }

    #[test]
    fn values_travel_as_one_document() {
        let values = vec![("booking_id".to_string(), json!(1)), ("notes".to_string(), Value::Null)];
        assert_eq!(document(&values).0, json!({"booking_id": 1, "notes": null}));
    }
}
