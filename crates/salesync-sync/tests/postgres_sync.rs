//! Postgres-backed checks. Each test runs in its own throwaway schema and is skipped
//! unless `SALESYNC_TEST_DATABASE_URL` points at a disposable database.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use salesync_core::{
    map_row, CellValue, ColumnMap, FileRevision, FingerprintedRecord, SourceRow, SyncRunRecord,
    UpsertCounts, UpsertOutcome, Value,
};
use salesync_sync::{db, UpsertMode};
use sqlx::{Connection, PgConnection, Row};
use uuid::Uuid;

const DATABASE_ENV: &str = "SALESYNC_TEST_DATABASE_URL";

async fn scratch_connection() -> Option<(PgConnection, String)> {
    let url = match std::env::var(DATABASE_ENV) {
        Ok(url) if !url.trim().is_empty() => url,
        _ => {
            eprintln!("{DATABASE_ENV} not set; skipping Postgres test");
            return None;
        }
    };
    let mut conn = PgConnection::connect(&url)
        .await
        .expect("connect test database");
    let schema = format!("salesync_test_{}", Uuid::new_v4().simple());
    sqlx::query(&format!("CREATE SCHEMA {schema}"))
        .execute(&mut conn)
        .await
        .expect("create scratch schema");
    sqlx::query(&format!("SET search_path TO {schema}"))
        .execute(&mut conn)
        .await
        .expect("set search_path");
    db::ensure_tables(&mut conn).await.expect("ensure tables");
    Some((conn, schema))
}

async fn drop_scratch(mut conn: PgConnection, schema: String) {
    sqlx::query(&format!("DROP SCHEMA {schema} CASCADE"))
        .execute(&mut conn)
        .await
        .expect("drop scratch schema");
    conn.close().await.expect("close connection");
}

fn sale(branch: &str, invoice: &str, qty: f64) -> FingerprintedRecord {
    let row: SourceRow = [
        ("Branch", CellValue::Text(branch.to_string())),
        (
            "Date",
            CellValue::Date(NaiveDate::from_ymd_opt(2024, 1, 5).unwrap()),
        ),
        ("Invoice Number", CellValue::Text(invoice.to_string())),
        ("Qty", CellValue::Float(qty)),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();
    FingerprintedRecord::new(map_row(&row, &ColumnMap::sales()))
}

async fn sales_count(conn: &mut PgConnection) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM sales")
        .fetch_one(conn)
        .await
        .expect("count sales")
}

#[tokio::test]
async fn row_upsert_inserts_then_overwrites_in_place() {
    let Some((mut conn, schema)) = scratch_connection().await else {
        return;
    };
    let original = sale("HQ", "INV-1", 3.0);

    assert_eq!(
        db::upsert_row(&mut conn, &original).await.unwrap(),
        UpsertOutcome::Inserted
    );
    let created_at: DateTime<Utc> =
        sqlx::query_scalar("SELECT created_at FROM sales WHERE source_row_hash = $1")
            .bind(original.fingerprint.as_str())
            .fetch_one(&mut conn)
            .await
            .unwrap();

    assert_eq!(
        db::upsert_row(&mut conn, &original).await.unwrap(),
        UpsertOutcome::Updated
    );

    let changed = FingerprintedRecord {
        fingerprint: original.fingerprint.clone(),
        record: original
            .record
            .clone()
            .with_value("branch", Value::Text("Airport".into())),
    };
    assert_eq!(
        db::upsert_row(&mut conn, &changed).await.unwrap(),
        UpsertOutcome::Updated
    );

    assert_eq!(sales_count(&mut conn).await, 1);
    let row = sqlx::query(
        "SELECT branch, sale_date, qty, invoice_number, created_at FROM sales WHERE source_row_hash = $1",
    )
    .bind(original.fingerprint.as_str())
    .fetch_one(&mut conn)
    .await
    .unwrap();
    assert_eq!(row.get::<Option<String>, _>("branch").as_deref(), Some("Airport"));
    assert_eq!(
        row.get::<Option<NaiveDateTime>, _>("sale_date"),
        NaiveDate::from_ymd_opt(2024, 1, 5).unwrap().and_hms_opt(0, 0, 0)
    );
    assert_eq!(row.get::<Option<f64>, _>("qty"), Some(3.0));
    assert_eq!(
        row.get::<Option<String>, _>("invoice_number").as_deref(),
        Some("INV-1")
    );
    assert_eq!(row.get::<DateTime<Utc>, _>("created_at"), created_at);

    drop_scratch(conn, schema).await;
}

#[tokio::test]
async fn row_mode_counts_repeated_fingerprints_as_updates() {
    let Some((mut conn, schema)) = scratch_connection().await else {
        return;
    };
    let a = sale("HQ", "INV-1", 1.0);
    let b = sale("HQ", "INV-2", 2.0);

    let counts = db::upsert_rows(&mut conn, &[a.clone(), b, a]).await.unwrap();
    assert_eq!(
        counts,
        UpsertCounts {
            processed: 3,
            inserted: 2,
            updated: 1
        }
    );
    assert_eq!(sales_count(&mut conn).await, 2);

    drop_scratch(conn, schema).await;
}

#[tokio::test]
async fn batch_counts_are_exact_and_duplicates_collapse() {
    let Some((mut conn, schema)) = scratch_connection().await else {
        return;
    };
    let a = sale("HQ", "INV-1", 1.0);
    let b = sale("HQ", "INV-2", 2.0);
    let c = sale("Airport", "INV-3", 4.5);

    let first = db::upsert_batch(&mut conn, &[a.clone(), b, a.clone()])
        .await
        .unwrap();
    assert_eq!(
        first,
        UpsertCounts {
            processed: 3,
            inserted: 2,
            updated: 1
        }
    );
    assert_eq!(sales_count(&mut conn).await, 2);

    let second = db::upsert_batch(&mut conn, &[a, c.clone()]).await.unwrap();
    assert_eq!(
        second,
        UpsertCounts {
            processed: 2,
            inserted: 1,
            updated: 1
        }
    );
    assert_eq!(sales_count(&mut conn).await, 3);

    let (branch, qty): (Option<String>, Option<f64>) =
        sqlx::query_as("SELECT branch, qty FROM sales WHERE source_row_hash = $1")
            .bind(c.fingerprint.as_str())
            .fetch_one(&mut conn)
            .await
            .unwrap();
    assert_eq!(branch.as_deref(), Some("Airport"));
    assert_eq!(qty, Some(4.5));

    drop_scratch(conn, schema).await;
}

#[tokio::test]
async fn empty_input_changes_nothing() {
    let Some((mut conn, schema)) = scratch_connection().await else {
        return;
    };
    assert_eq!(
        db::upsert_batch(&mut conn, &[]).await.unwrap(),
        UpsertCounts::default()
    );
    assert_eq!(
        db::upsert_rows(&mut conn, &[]).await.unwrap(),
        UpsertCounts::default()
    );
    assert_eq!(sales_count(&mut conn).await, 0);

    drop_scratch(conn, schema).await;
}

#[tokio::test]
async fn resyncing_the_same_rows_is_idempotent_in_both_modes() {
    for mode in [UpsertMode::Batch, UpsertMode::Row] {
        let Some((mut conn, schema)) = scratch_connection().await else {
            return;
        };
        let records: Vec<_> = (1..=5)
            .map(|n| sale("HQ", &format!("INV-{n}"), n as f64))
            .collect();

        let first = db::sync_records(&mut conn, &records, mode, 2).await.unwrap();
        assert_eq!(first.processed, 5, "{mode:?}");
        assert_eq!(first.inserted, 5, "{mode:?}");

        let second = db::sync_records(&mut conn, &records, mode, 2).await.unwrap();
        assert_eq!(
            second,
            UpsertCounts {
                processed: 5,
                inserted: 0,
                updated: 5
            },
            "{mode:?}"
        );
        assert_eq!(sales_count(&mut conn).await, 5, "{mode:?}");

        drop_scratch(conn, schema).await;
    }
}

#[tokio::test]
async fn last_synced_etag_ignores_failed_runs() {
    let Some((mut conn, schema)) = scratch_connection().await else {
        return;
    };
    let revision = |etag: &str| FileRevision {
        etag: Some(etag.to_string()),
        ..FileRevision::default()
    };

    assert_eq!(db::last_synced_etag(&mut conn).await.unwrap(), None);

    let counts = UpsertCounts {
        processed: 4,
        inserted: 3,
        updated: 1,
    };
    db::record_run(&mut conn, &SyncRunRecord::completed(counts, &revision("e1")))
        .await
        .unwrap();
    assert_eq!(
        db::last_synced_etag(&mut conn).await.unwrap().as_deref(),
        Some("e1")
    );

    db::record_run(
        &mut conn,
        &SyncRunRecord::failed(Some(&revision("e2")), "parsing workbook: bad zip"),
    )
    .await
    .unwrap();
    assert_eq!(
        db::last_synced_etag(&mut conn).await.unwrap().as_deref(),
        Some("e1")
    );

    db::record_run(&mut conn, &SyncRunRecord::skipped(&revision("e1")))
        .await
        .unwrap();

    let rows = sqlx::query(
        "SELECT status, rows_processed, rows_inserted, rows_updated, file_etag, error_message FROM sync_log ORDER BY id",
    )
    .fetch_all(&mut conn)
    .await
    .unwrap();
    let statuses: Vec<String> = rows.iter().map(|r| r.get("status")).collect();
    assert_eq!(statuses, ["success", "error", "skipped"]);
    assert_eq!(rows[0].get::<i64, _>("rows_inserted"), 3);
    assert_eq!(rows[1].get::<i64, _>("rows_processed"), 0);
    assert_eq!(
        rows[1].get::<Option<String>, _>("error_message").as_deref(),
        Some("parsing workbook: bad zip")
    );
    assert_eq!(rows[2].get::<i64, _>("rows_updated"), 0);

    drop_scratch(conn, schema).await;
}

#[tokio::test]
async fn inspect_summarises_tables_and_recent_activity() {
    let Some((mut conn, schema)) = scratch_connection().await else {
        return;
    };
    db::ensure_tables(&mut conn).await.expect("ensure is repeatable");

    let records: Vec<_> = (1..=7)
        .map(|n| sale("HQ", &format!("INV-{n}"), n as f64))
        .collect();
    let counts = db::upsert_batch(&mut conn, &records).await.unwrap();
    db::record_run(
        &mut conn,
        &SyncRunRecord::completed(counts, &FileRevision::default()),
    )
    .await
    .unwrap();

    let overview = db::inspect(&mut conn).await.unwrap();
    assert!(overview.tables.iter().any(|t| t == "sales"));
    assert!(overview.tables.iter().any(|t| t == "sync_log"));
    assert_eq!(overview.sales_count, 7);
    assert_eq!(overview.recent_sales.len(), 5);
    assert_eq!(overview.recent_runs.len(), 1);
    assert_eq!(overview.recent_runs[0].status, "success");
    assert_eq!(overview.recent_runs[0].rows_inserted, 7);

    drop_scratch(conn, schema).await;
}
