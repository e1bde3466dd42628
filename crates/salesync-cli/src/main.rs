use anyhow::Result;
use clap::{Parser, Subcommand};
use salesync_sync::DatabaseOverview;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "salesync")]
#[command(about = "Sync the SharePoint sales workbook into Postgres")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download, normalize and upsert the workbook (default)
    Sync,
    /// Create the sales and sync_log tables if missing
    Migrate,
    /// Show tables, row counts and recent activity
    Inspect,
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn print_overview(overview: &DatabaseOverview) {
    println!("tables: {}", overview.tables.join(", "));
    println!("sales rows: {}", overview.sales_count);

    println!("recent sales:");
    for sale in &overview.recent_sales {
        println!(
            "  #{} {} {} {} qty={} total_usd={}",
            sale.id,
            sale.sale_date
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| "-".into()),
            sale.branch.as_deref().unwrap_or("-"),
            sale.items.as_deref().unwrap_or("-"),
            sale.qty.map(|q| q.to_string()).unwrap_or_else(|| "-".into()),
            sale.price_subtotal_with_tax_usd
                .map(|v| format!("{v:.2}"))
                .unwrap_or_else(|| "-".into()),
        );
    }

    println!("recent sync runs:");
    for run in &overview.recent_runs {
        println!(
            "  {} {} processed={} inserted={} updated={} etag={}{}",
            run.synced_at.format("%Y-%m-%d %H:%M:%S"),
            run.status,
            run.rows_processed,
            run.rows_inserted,
            run.rows_updated,
            run.file_etag.as_deref().unwrap_or("-"),
            run.error_message
                .as_deref()
                .map(|e| format!(" error={e}"))
                .unwrap_or_default(),
        );
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    tracing::debug!(?cli, "parsed arguments");

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = salesync_sync::run_sync_once_from_env().await?;
            println!(
                "sync {}: run_id={} processed={} inserted={} updated={} skipped_empty={}",
                summary.status,
                summary.run_id,
                summary.counts.processed,
                summary.counts.inserted,
                summary.counts.updated,
                summary.skipped_empty_rows
            );
        }
        Commands::Migrate => {
            salesync_sync::migrate_from_env().await?;
            println!("tables ready: sales, sync_log");
        }
        Commands::Inspect => {
            let overview = salesync_sync::inspect_from_env().await?;
            print_overview(&overview);
        }
    }

    Ok(())
}
