use booking_sync::error::StorageError;
use booking_sync::sync::mapping::{RowCandidate, WritePlan};
use booking_sync::sync::upsert::UpsertEngine;
use booking_sync::test_support::TestDatabase;
use serde_json::{Value, json};
use std::sync::Arc;

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

/// Provision a database or explain why the test is skipped.
async fn database() -> Option<TestDatabase> {
    match TestDatabase::new().await {
        Ok(db) => Some(db),
        Err(err) => {
            eprintln!("skipping postgres test: {err}");
            None
        }
    }
}

#[tokio::test]
async fn upsert_inserts_then_updates() {
    let Some(db) = database().await else {
        return;
    };
    let engine = UpsertEngine::new(Arc::new(db.storage()), plan());

    let rows = |name: &str| {
        vec![
            candidate("customer", "customer_id", &[("customer_id", json!(1)), ("name", json!(name))]),
            candidate(
                "booking",
                "booking_id",
                &[
                    ("booking_id", json!(10)),
                    ("customer_id", json!(1)),
                    ("is_cancelled", json!(false)),
                    ("notes", Value::Null),
                ],
            ),
        ]
    };

    let first = engine.apply("10", rows("Acme")).await.unwrap();
    assert_eq!(first.inserted.get("customer"), Some(&1));
    assert_eq!(first.inserted.get("booking"), Some(&1));

    let second = engine.apply("10", rows("Acme Ltd")).await.unwrap();
    assert_eq!(second.updated.get("customer"), Some(&1));
    assert!(second.inserted.is_empty());

    let (count, name): (i64, Option<String>) = sqlx::query_as(
        "SELECT (SELECT COUNT(*) FROM booking), (SELECT name FROM customer WHERE customer_id = 1)",
    )
    .fetch_one(db.pool())
    .await
    .unwrap();
    assert_eq!(count, 1);
    assert_eq!(name.as_deref(), Some("Acme Ltd"));

    db.close().await.unwrap();
}

#[tokio::test]
async fn textual_keys_are_coerced_to_column_types() {
    let Some(db) = database().await else {
        return;
    };
    let engine = UpsertEngine::new(Arc::new(db.storage()), plan());

    engine
        .apply(
            "10",
            vec![candidate(
                "customer",
                "customer_id",
                &[("customer_id", json!("7")), ("active", json!(true))],
            )],
        )
        .await
        .unwrap();
    let again = engine
        .apply("10", vec![candidate("customer", "customer_id", &[("customer_id", json!(7))])])
        .await
        .unwrap();
    assert_eq!(again.updated.get("customer"), Some(&1));

    let active: Option<bool> = sqlx::query_scalar("SELECT active FROM customer WHERE customer_id = 7")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(active, Some(true));

    db.close().await.unwrap();
}

#[tokio::test]
async fn foreign_key_violation_rolls_back_the_record() {
    let Some(db) = database().await else {
        return;
    };
    let engine = UpsertEngine::new(Arc::new(db.storage()), plan());

    let err = engine
        .apply(
            "20",
            vec![
                candidate("booking", "booking_id", &[("booking_id", json!(20)), ("customer_id", Value::Null)]),
                candidate("booking_ref", "ref_id", &[("ref_id", json!(200)), ("booking_id", json!(99))]),
            ],
        )
        .await
        .unwrap_err();
    assert_eq!(err.table, "booking_ref");
    assert!(matches!(err.source, StorageError::Database(_)));

    let bookings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM booking")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(bookings, 0);

    db.close().await.unwrap();
}
