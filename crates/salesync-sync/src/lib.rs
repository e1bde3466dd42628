//! One-shot sales workbook sync: locate the workbook, skip unchanged revisions,
//! upsert fingerprinted rows into Postgres and audit every run in `sync_log`.

pub mod config;
pub mod db;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use salesync_core::{
    map_row, should_sync, ColumnMap, FingerprintedRecord, RunStatus, SourceRow, SyncRunRecord,
    UpsertCounts,
};
use salesync_remote::{AccessToken, GraphClient, RemoteFile};
use salesync_sheet::parse_workbook;
use serde::Serialize;
use sqlx::{Connection, PgConnection};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{database_url_from_env, ConfigError, SyncConfig, UpsertMode};
pub use db::DatabaseOverview;

pub const CRATE_NAME: &str = "salesync-sync";

#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub counts: UpsertCounts,
    pub skipped_empty_rows: usize,
    pub file_etag: Option<String>,
    pub file_modified: Option<DateTime<Utc>>,
}

/// Mapped, fingerprinted rows ready for upsert.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreparedRecords {
    pub records: Vec<FingerprintedRecord>,
    /// Rows whose mapped fields were all null.
    pub skipped_empty: usize,
}

pub fn prepare_records<'a, I>(rows: I, map: &ColumnMap) -> PreparedRecords
where
    I: IntoIterator<Item = &'a SourceRow>,
{
    let mut prepared = PreparedRecords::default();
    for row in rows {
        let record = map_row(row, map);
        if record.is_empty() {
            prepared.skipped_empty += 1;
            continue;
        }
        prepared.records.push(FingerprintedRecord::new(record));
    }
    prepared
}

struct Reconciled {
    status: RunStatus,
    counts: UpsertCounts,
    skipped_empty: usize,
}

pub struct SyncPipeline {
    config: SyncConfig,
    graph: GraphClient,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let graph = GraphClient::new(config.graph_client_config())?;
        Ok(Self { config, graph })
    }

    pub async fn run_once(&self) -> Result<SyncSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        self.run(run_id).instrument(span).await
    }

    async fn run(&self, run_id: Uuid) -> Result<SyncSummary> {
        let started_at = Utc::now();
        let locator = &self.config.locator;
        info!(
            file = %locator.file_path,
            site = %locator.site_path,
            mode = ?self.config.upsert_mode,
            "starting sales sync"
        );

        let token = self
            .graph
            .acquire_token(&self.config.credentials)
            .await
            .context("acquiring Graph access token")?;
        let file = self
            .graph
            .locate_file(&token, locator)
            .await
            .with_context(|| {
                format!(
                    "locating {} in {}{}",
                    locator.file_path, locator.hostname, locator.site_path
                )
            })?;
        info!(
            etag = file.revision.etag.as_deref().unwrap_or("-"),
            modified = ?file.revision.last_modified,
            size = ?file.revision.size,
            "located workbook"
        );

        let mut conn = PgConnection::connect(&self.config.database_url)
            .await
            .context("connecting to database")?;
        let outcome = self.reconcile(&mut conn, &token, &file).await;
        if let Err(err) = &outcome {
            let audit = SyncRunRecord::failed(Some(&file.revision), format!("{err:#}"));
            if let Err(audit_err) = db::record_run(&mut conn, &audit).await {
                warn!(error = %audit_err, "could not record failed sync run");
            }
        }
        if let Err(err) = conn.close().await {
            warn!(error = %err, "closing database connection");
        }
        let reconciled = outcome?;

        let summary = SyncSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            status: reconciled.status,
            counts: reconciled.counts,
            skipped_empty_rows: reconciled.skipped_empty,
            file_etag: file.revision.etag.clone(),
            file_modified: file.revision.last_modified,
        };
        info!(
            status = %summary.status,
            processed = summary.counts.processed,
            inserted = summary.counts.inserted,
            updated = summary.counts.updated,
            "sales sync finished"
        );
        Ok(summary)
    }

    async fn reconcile(
        &self,
        conn: &mut PgConnection,
        token: &AccessToken,
        file: &RemoteFile,
    ) -> Result<Reconciled> {
        db::ensure_tables(conn)
            .await
            .context("ensuring sales and sync_log tables")?;

        let last_etag = db::last_synced_etag(conn)
            .await
            .context("reading last synced etag")?;
        if !should_sync(file.revision.etag.as_deref(), last_etag.as_deref()) {
            info!("no change detected (etag match); skipping import");
            db::record_run(conn, &SyncRunRecord::skipped(&file.revision))
                .await
                .context("recording skipped run")?;
            return Ok(Reconciled {
                status: RunStatus::Skipped,
                counts: UpsertCounts::default(),
                skipped_empty: 0,
            });
        }

        let bytes = self
            .graph
            .download(token, &file.drive_id, &file.file_path)
            .await
            .context("downloading workbook")?;
        let sheets = parse_workbook(&bytes, self.config.sheet_name.as_deref())
            .context("parsing workbook")?;
        let prepared = prepare_records(sheets.iter().flat_map(|s| &s.rows), &ColumnMap::sales());
        info!(
            sheets = sheets.len(),
            rows = prepared.records.len(),
            skipped_empty = prepared.skipped_empty,
            "mapped workbook rows"
        );

        let counts = db::sync_records(
            conn,
            &prepared.records,
            self.config.upsert_mode,
            self.config.batch_size,
        )
        .await
        .context("upserting sales rows")?;
        db::record_run(conn, &SyncRunRecord::completed(counts, &file.revision))
            .await
            .context("recording sync run")?;

        Ok(Reconciled {
            status: RunStatus::Success,
            counts,
            skipped_empty: prepared.skipped_empty,
        })
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncSummary> {
    let config = SyncConfig::from_env()?;
    SyncPipeline::new(config)?.run_once().await
}

async fn connect_from_env() -> Result<PgConnection> {
    let url = database_url_from_env()?;
    PgConnection::connect(&url)
        .await
        .context("connecting to database")
}

pub async fn migrate_from_env() -> Result<()> {
    let mut conn = connect_from_env().await?;
    let result = db::ensure_tables(&mut conn)
        .await
        .context("ensuring sales and sync_log tables");
    conn.close().await.context("closing database connection")?;
    result
}

pub async fn inspect_from_env() -> Result<DatabaseOverview> {
    let mut conn = connect_from_env().await?;
    let result = db::inspect(&mut conn).await.context("inspecting database");
    conn.close().await.context("closing database connection")?;
    result
}
