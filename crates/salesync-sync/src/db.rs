//! Postgres persistence: schema, fingerprint-keyed upserts, the sync audit log and
//! read-only inspection queries. Everything runs on one explicitly passed connection.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use salesync_core::{
    ColumnKind, ColumnMap, FingerprintedRecord, RunStatus, SyncRunRecord, UpsertCounts,
    UpsertOutcome, Value,
};
use serde::Serialize;
use sqlx::postgres::{PgArguments, PgConnection};
use sqlx::query::Query;
use sqlx::{Connection, Postgres, QueryBuilder, Row};
use tracing::{debug, info};

use crate::config::UpsertMode;

pub const SALES_TABLE: &str = "sales";
pub const SYNC_LOG_TABLE: &str = "sync_log";
const STAGING_TABLE: &str = "sales_staging";

/// Postgres accepts at most this many bind parameters per statement.
const MAX_BIND_PARAMS: usize = 65_535;

fn column_defs(map: &ColumnMap) -> String {
    map.columns()
        .iter()
        .map(|spec| format!("    {} {}", spec.field, spec.kind.sql_type()))
        .collect::<Vec<_>>()
        .join(",\n")
}

fn column_list(map: &ColumnMap) -> String {
    map.fields().collect::<Vec<_>>().join(", ")
}

fn conflict_updates(map: &ColumnMap) -> String {
    map.fields()
        .map(|field| format!("{field} = EXCLUDED.{field}"))
        .chain(["updated_at = now()".to_string(), "last_synced_at = now()".to_string()])
        .collect::<Vec<_>>()
        .join(", ")
}

/// Idempotent DDL for the sales table, its indexes and the audit log.
pub fn schema_statements(map: &ColumnMap) -> Vec<String> {
    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {SALES_TABLE} (\n    id BIGSERIAL PRIMARY KEY,\n    source_row_hash TEXT NOT NULL UNIQUE,\n{},\n    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),\n    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),\n    last_synced_at TIMESTAMPTZ NOT NULL DEFAULT now()\n)",
            column_defs(map)
        ),
        format!("CREATE INDEX IF NOT EXISTS sales_sale_date_idx ON {SALES_TABLE} (sale_date)"),
        format!(
            r#"CREATE TABLE IF NOT EXISTS {SYNC_LOG_TABLE} (
    id BIGSERIAL PRIMARY KEY,
    synced_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    rows_processed BIGINT NOT NULL DEFAULT 0,
    rows_inserted BIGINT NOT NULL DEFAULT 0,
    rows_updated BIGINT NOT NULL DEFAULT 0,
    file_etag TEXT,
    file_modified TIMESTAMPTZ,
    status TEXT NOT NULL,
    error_message TEXT
)"#
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS sync_log_synced_at_idx ON {SYNC_LOG_TABLE} (synced_at DESC)"
        ),
    ]
}

pub fn upsert_row_sql(map: &ColumnMap) -> String {
    let placeholders = (2..=map.len() + 1)
        .map(|n| format!("${n}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {SALES_TABLE} (source_row_hash, {columns}, last_synced_at) \
         VALUES ($1, {placeholders}, now()) \
         ON CONFLICT (source_row_hash) DO UPDATE SET {updates} \
         RETURNING (xmax = 0) AS inserted",
        columns = column_list(map),
        updates = conflict_updates(map),
    )
}

fn staging_table_sql(map: &ColumnMap) -> String {
    format!(
        "CREATE TEMP TABLE IF NOT EXISTS {STAGING_TABLE} (\n    source_row_hash TEXT NOT NULL,\n{}\n) ON COMMIT DELETE ROWS",
        column_defs(map)
    )
}

pub fn merge_staged_sql(map: &ColumnMap) -> String {
    let columns = column_list(map);
    format!(
        "INSERT INTO {SALES_TABLE} (source_row_hash, {columns}, last_synced_at) \
         SELECT source_row_hash, {columns}, now() FROM {STAGING_TABLE} \
         ON CONFLICT (source_row_hash) DO UPDATE SET {updates}",
        updates = conflict_updates(map),
    )
}

/// Rows per staging insert so that one statement stays under the bind limit.
fn rows_per_insert(map: &ColumnMap) -> usize {
    (MAX_BIND_PARAMS / (map.len() + 1)).max(1)
}

/// Keep only the last occurrence of each fingerprint, in input order.
pub fn collapse_duplicates(records: &[FingerprintedRecord]) -> Vec<&FingerprintedRecord> {
    let mut last_seen: HashMap<&str, usize> = HashMap::with_capacity(records.len());
    for (idx, record) in records.iter().enumerate() {
        last_seen.insert(record.fingerprint.as_str(), idx);
    }
    records
        .iter()
        .enumerate()
        .filter(|(idx, record)| last_seen.get(record.fingerprint.as_str()) == Some(idx))
        .map(|(_, record)| record)
        .collect()
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    kind: ColumnKind,
    value: &Value,
) -> Query<'q, Postgres, PgArguments> {
    match kind {
        ColumnKind::Text => query.bind(value.as_text()),
        ColumnKind::Number => query.bind(value.as_f64()),
        ColumnKind::Timestamp => query.bind(value.as_timestamp()),
    }
}

fn field_value<'a>(record: &'a FingerprintedRecord, field: &str) -> &'a Value {
    record.record.get(field).unwrap_or(&Value::Null)
}

pub async fn ensure_tables(conn: &mut PgConnection) -> Result<(), sqlx::Error> {
    for statement in schema_statements(&ColumnMap::sales()) {
        sqlx::query(&statement).execute(&mut *conn).await?;
    }
    debug!("sales and sync_log tables ensured");
    Ok(())
}

/// Insert or overwrite one row by fingerprint. `created_at` survives updates.
pub async fn upsert_row(
    conn: &mut PgConnection,
    record: &FingerprintedRecord,
) -> Result<UpsertOutcome, sqlx::Error> {
    let map = ColumnMap::sales();
    let sql = upsert_row_sql(&map);
    let mut query = sqlx::query(&sql).bind(record.fingerprint.as_str().to_owned());
    for spec in map.columns() {
        query = bind_value(query, spec.kind, field_value(record, spec.field));
    }
    let inserted: bool = query.fetch_one(&mut *conn).await?.try_get("inserted")?;
    Ok(if inserted {
        UpsertOutcome::Inserted
    } else {
        UpsertOutcome::Updated
    })
}

/// Row-at-a-time upserts inside one transaction, committed at the end.
pub async fn upsert_rows(
    conn: &mut PgConnection,
    records: &[FingerprintedRecord],
) -> Result<UpsertCounts, sqlx::Error> {
    let mut counts = UpsertCounts::default();
    if records.is_empty() {
        return Ok(counts);
    }
    let mut tx = conn.begin().await?;
    for record in records {
        counts.record(upsert_row(&mut *tx, record).await?);
    }
    tx.commit().await?;
    Ok(counts)
}

/// Stage a batch in a temp table and merge it with one statement.
///
/// Repeated fingerprints collapse to their last occurrence before staging.
/// `inserted` counts fingerprints that were absent before the merge; every
/// other processed row counts as an update.
pub async fn upsert_batch(
    conn: &mut PgConnection,
    records: &[FingerprintedRecord],
) -> Result<UpsertCounts, sqlx::Error> {
    if records.is_empty() {
        return Ok(UpsertCounts::default());
    }
    let map = ColumnMap::sales();
    let unique = collapse_duplicates(records);

    let mut tx = conn.begin().await?;
    sqlx::query(&staging_table_sql(&map))
        .execute(&mut *tx)
        .await?;

    let insert_head = format!(
        "INSERT INTO {STAGING_TABLE} (source_row_hash, {}) ",
        column_list(&map)
    );
    for chunk in unique.chunks(rows_per_insert(&map)) {
        let mut builder = QueryBuilder::<Postgres>::new(&insert_head);
        builder.push_values(chunk.iter(), |mut row, record| {
            row.push_bind(record.fingerprint.as_str().to_owned());
            for spec in map.columns() {
                let value = field_value(record, spec.field);
                match spec.kind {
                    ColumnKind::Text => {
                        row.push_bind(value.as_text());
                    }
                    ColumnKind::Number => {
                        row.push_bind(value.as_f64());
                    }
                    ColumnKind::Timestamp => {
                        row.push_bind(value.as_timestamp());
                    }
                }
            }
        });
        builder.build().execute(&mut *tx).await?;
    }

    let existing: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM {STAGING_TABLE} s \
         WHERE EXISTS (SELECT 1 FROM {SALES_TABLE} t WHERE t.source_row_hash = s.source_row_hash)"
    ))
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(&merge_staged_sql(&map))
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    let processed = records.len() as u64;
    let inserted = (unique.len() as u64).saturating_sub(existing.max(0) as u64);
    Ok(UpsertCounts {
        processed,
        inserted,
        updated: processed - inserted,
    })
}

/// Upsert every record in chunks of `batch_size`, one transaction per chunk.
pub async fn sync_records(
    conn: &mut PgConnection,
    records: &[FingerprintedRecord],
    mode: UpsertMode,
    batch_size: usize,
) -> Result<UpsertCounts, sqlx::Error> {
    let mut counts = UpsertCounts::default();
    for (idx, chunk) in records.chunks(batch_size.max(1)).enumerate() {
        let chunk_counts = match mode {
            UpsertMode::Batch => upsert_batch(conn, chunk).await?,
            UpsertMode::Row => upsert_rows(conn, chunk).await?,
        };
        counts.merge(chunk_counts);
        info!(
            batch = idx + 1,
            rows = chunk.len(),
            inserted = chunk_counts.inserted,
            updated = chunk_counts.updated,
            total_processed = counts.processed,
            "batch committed"
        );
    }
    Ok(counts)
}

pub async fn record_run(conn: &mut PgConnection, run: &SyncRunRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO sync_log
            (rows_processed, rows_inserted, rows_updated, file_etag, file_modified, status, error_message)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(run.processed as i64)
    .bind(run.inserted as i64)
    .bind(run.updated as i64)
    .bind(run.file_etag.as_deref())
    .bind(run.file_modified)
    .bind(run.status.as_str())
    .bind(run.error_message.as_deref())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Etag of the latest successful or skipped run. Failed runs never count.
pub async fn last_synced_etag(conn: &mut PgConnection) -> Result<Option<String>, sqlx::Error> {
    let statuses = vec![RunStatus::Success.as_str(), RunStatus::Skipped.as_str()];
    let etag: Option<Option<String>> = sqlx::query_scalar(
        r#"
        SELECT file_etag
          FROM sync_log
         WHERE status = ANY($1)
         ORDER BY synced_at DESC, id DESC
         LIMIT 1
        "#,
    )
    .bind(statuses)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(etag.flatten())
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentSale {
    pub id: i64,
    pub branch: Option<String>,
    pub sale_date: Option<NaiveDateTime>,
    pub client: Option<String>,
    pub items: Option<String>,
    pub qty: Option<f64>,
    pub price_subtotal_with_tax_usd: Option<f64>,
    pub last_synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentRun {
    pub id: i64,
    pub synced_at: DateTime<Utc>,
    pub status: String,
    pub rows_processed: i64,
    pub rows_inserted: i64,
    pub rows_updated: i64,
    pub file_etag: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DatabaseOverview {
    pub tables: Vec<String>,
    pub sales_count: i64,
    pub recent_sales: Vec<RecentSale>,
    pub recent_runs: Vec<RecentRun>,
}

/// Read-only snapshot of the current schema. Missing tables read as empty.
pub async fn inspect(conn: &mut PgConnection) -> Result<DatabaseOverview, sqlx::Error> {
    let tables: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT table_name::text
          FROM information_schema.tables
         WHERE table_schema = current_schema()
         ORDER BY table_name
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    let mut overview = DatabaseOverview {
        tables,
        ..Default::default()
    };

    if overview.tables.iter().any(|t| t == SALES_TABLE) {
        overview.sales_count = sqlx::query_scalar("SELECT COUNT(*) FROM sales")
            .fetch_one(&mut *conn)
            .await?;
        let rows = sqlx::query(
            r#"
            SELECT id, branch, sale_date, client, items, qty,
                   price_subtotal_with_tax_usd, last_synced_at
              FROM sales
             ORDER BY last_synced_at DESC, id DESC
             LIMIT 5
            "#,
        )
        .fetch_all(&mut *conn)
        .await?;
        for row in rows {
            overview.recent_sales.push(RecentSale {
                id: row.try_get("id")?,
                branch: row.try_get("branch")?,
                sale_date: row.try_get("sale_date")?,
                client: row.try_get("client")?,
                items: row.try_get("items")?,
                qty: row.try_get("qty")?,
                price_subtotal_with_tax_usd: row.try_get("price_subtotal_with_tax_usd")?,
                last_synced_at: row.try_get("last_synced_at")?,
            });
        }
    }

    if overview.tables.iter().any(|t| t == SYNC_LOG_TABLE) {
        let rows = sqlx::query(
            r#"
            SELECT id, synced_at, status, rows_processed, rows_inserted, rows_updated,
                   file_etag, error_message
              FROM sync_log
             ORDER BY synced_at DESC, id DESC
             LIMIT 5
            "#,
        )
        .fetch_all(&mut *conn)
        .await?;
        for row in rows {
            overview.recent_runs.push(RecentRun {
                id: row.try_get("id")?,
                synced_at: row.try_get("synced_at")?,
                status: row.try_get("status")?,
                rows_processed: row.try_get("rows_processed")?,
                rows_inserted: row.try_get("rows_inserted")?,
                rows_updated: row.try_get("rows_updated")?,
                file_etag: row.try_get("file_etag")?,
                error_message: row.try_get("error_message")?,
            });
        }
    }

    Ok(overview)
}

#[cfg(test)]
mod tests {
    use super::*;
    use salesync_core::{map_row, CellValue, SourceRow};

    fn record(branch: &str, qty: i64) -> FingerprintedRecord {
        let row: SourceRow = [
            ("Branch".to_string(), CellValue::Text(branch.to_string())),
            ("Qty".to_string(), CellValue::Int(qty)),
        ]
        .into_iter()
        .collect();
        FingerprintedRecord::new(map_row(&row, &ColumnMap::sales()))
    }

    #[test]
    fn sales_ddl_covers_every_mapped_column_with_its_type() {
        let statements = schema_statements(&ColumnMap::sales());
        let sales = &statements[0];
        assert!(sales.starts_with("CREATE TABLE IF NOT EXISTS sales"));
        assert!(sales.contains("source_row_hash TEXT NOT NULL UNIQUE"));
        assert!(sales.contains("sale_date TIMESTAMP,"));
        assert!(sales.contains("qty DOUBLE PRECISION,"));
        assert!(sales.contains("group_name TEXT,"));
        assert!(sales.contains("created_at TIMESTAMPTZ NOT NULL DEFAULT now()"));
        for field in ColumnMap::sales().fields() {
            assert!(sales.contains(&format!("    {field} ")), "missing column {field}");
        }
        assert!(statements
            .iter()
            .any(|s| s.contains("CREATE TABLE IF NOT EXISTS sync_log")));
        assert!(statements.iter().all(|s| s.contains("IF NOT EXISTS")));
    }

    #[test]
    fn row_upsert_binds_hash_then_every_column_and_reports_insertion() {
        let map = ColumnMap::sales();
        let sql = upsert_row_sql(&map);
        assert!(sql.contains("VALUES ($1, $2,"));
        assert!(sql.contains(&format!("${}, now())", map.len() + 1)));
        assert!(!sql.contains(&format!("${}", map.len() + 2)));
        assert!(sql.contains("ON CONFLICT (source_row_hash) DO UPDATE SET branch = EXCLUDED.branch"));
        assert!(sql.contains("updated_at = now(), last_synced_at = now()"));
        assert!(!sql.contains("created_at"));
        assert!(sql.ends_with("RETURNING (xmax = 0) AS inserted"));
    }

    #[test]
    fn merge_reads_from_staging_with_the_same_conflict_rule() {
        let sql = merge_staged_sql(&ColumnMap::sales());
        assert!(sql.contains("FROM sales_staging"));
        assert!(sql.contains("ON CONFLICT (source_row_hash) DO UPDATE SET"));
        assert!(sql.contains("barcode = EXCLUDED.barcode"));
        assert!(!sql.contains("created_at"));
    }

    #[test]
    fn staging_inserts_stay_under_the_bind_limit() {
        let map = ColumnMap::sales();
        let rows = rows_per_insert(&map);
        assert!(rows * (map.len() + 1) <= MAX_BIND_PARAMS);
        assert!((rows + 1) * (map.len() + 1) > MAX_BIND_PARAMS);
    }

    #[test]
    fn duplicates_collapse_to_their_last_occurrence() {
        let a = record("HQ", 1);
        let b = record("Airport", 2);
        let records = vec![a.clone(), b.clone(), a.clone()];
        let unique = collapse_duplicates(&records);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].fingerprint, b.fingerprint);
        assert_eq!(unique[1].fingerprint, a.fingerprint);
        assert!(std::ptr::eq(unique[1], &records[2]));
    }

    #[test]
    fn distinct_records_are_all_kept_in_order() {
        let records = vec![record("HQ", 1), record("HQ", 2), record("HQ", 3)];
        let unique = collapse_duplicates(&records);
        let fingerprints: Vec<_> = unique.iter().map(|r| r.fingerprint.clone()).collect();
        let expected: Vec<_> = records.iter().map(|r| r.fingerprint.clone()).collect();
        assert_eq!(fingerprints, expected);
    }
}
