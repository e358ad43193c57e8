use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use booking_sync::auth::HttpCredentialProvider;
use booking_sync::client::{HttpResourceClient, ResourceClient};
use booking_sync::config::{self, AuthConfig, DatabaseConfig, HttpConfig, PipelineConfig};
use booking_sync::error::{SyncError, SyncResult};
use booking_sync::storage::{MemoryStorage, PgStorage, Storage};
use booking_sync::sync::mapping::MappingSet;
use booking_sync::sync::window::{RecordFilter, TimeWindow};
use booking_sync::sync::{RunReport, SyncPipeline};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use clap::Parser;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(
    name = "booking-sync",
    about = "Pull bookings from the booking API into the relational store"
)]
struct Args {
    /// Start of the expected-start-date range (RFC 3339, inclusive).
    #[arg(long)]
    start: DateTime<Utc>,

    /// End of the range (RFC 3339, exclusive). Defaults to now.
    #[arg(long)]
    end: Option<DateTime<Utc>>,

    /// Only list records modified on or after this date (YYYY-MM-DD).
    #[arg(long)]
    modified_since: Option<NaiveDate>,

    /// Length of each pagination window in days.
    #[arg(long, default_value_t = 180, value_parser = clap::value_parser!(i64).range(1..=36500))]
    window_days: i64,

    /// Mapping document replacing the built-in booking mapping.
    #[arg(long)]
    mapping: Option<PathBuf>,

    /// Write the flattened records of each window here.
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,

    /// Write into memory only and report what would have been written.
    #[arg(long)]
    dry_run: bool,

    /// Apply pending schema migrations before syncing.
    #[arg(long, conflicts_with = "dry_run")]
    migrate: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    booking_sync::init_logger();
    let args = Args::parse();

    match run(args).await {
        Ok(report) => {
            println!("{}", report.summary);
            match report.error {
                None if !report.summary.has_errors() => ExitCode::SUCCESS,
                None => ExitCode::from(2),
                Some(err) => {
                    log::error!("sync ended early: {}", err);
                    ExitCode::FAILURE
                }
            }
        }
        Err(err) => {
            log::error!("sync could not start: {}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> SyncResult<RunReport> {
    let end = args.end.unwrap_or_else(Utc::now);
    let Some(range) = TimeWindow::new(args.start, end) else {
        log::warn!("empty range {}..{}; nothing to sync", args.start, end);
        return Ok(RunReport {
            summary: Default::default(),
            error: None,
        });
    };
    let filters: Vec<RecordFilter> = range
        .chunks(Duration::days(args.window_days))
        .into_iter()
        .map(|window| RecordFilter::new(window).modified_since(args.modified_since))
        .collect();

    let mapping_path = args.mapping.or_else(config::mapping_path_from_env);
    let mappings = MappingSet::load(mapping_path.as_deref())?;

    let mut pipeline_config = PipelineConfig::from_env()?;
    if args.snapshot_dir.is_some() {
        pipeline_config.snapshot_dir = args.snapshot_dir;
    }

    let http_config = HttpConfig::from_env();
    let credentials = HttpCredentialProvider::new(AuthConfig::from_env()?, http_config.request_timeout)?;
    let client = Arc::new(
        HttpResourceClient::new(&http_config, Arc::new(credentials)).map_err(SyncError::HttpClient)?,
    );

    let memory = args.dry_run.then(dry_run_storage);
    let storage: Arc<dyn Storage> = match &memory {
        Some(memory) => {
            log::info!("dry run: rows are kept in memory");
            Arc::new(memory.clone())
        }
        None => {
            let pg = PgStorage::connect(&DatabaseConfig::from_env()?)
                .await
                .map_err(SyncError::FatalStorage)?;
            if args.migrate {
                pg.run_migrations().await.map_err(SyncError::FatalStorage)?;
            }
            Arc::new(pg)
        }
    };

    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("interrupt received; finishing the current record");
                cancel.cancel();
                client.close();
            }
        })
    };

    let pipeline = SyncPipeline::new(
        client as Arc<dyn ResourceClient>,
        storage,
        mappings,
        pipeline_config,
        cancel,
    );
    let report = pipeline.run(&filters).await;
    watcher.abort();

    log::info!("{} distinct URLs requested", pipeline.requested_urls());
    if let Some(memory) = memory {
        for (table, rows) in memory.row_counts() {
            log::info!("dry run: {} would hold {} rows", table, rows);
        }
    }

    Ok(report)
}

/// In-memory store enforcing the same references as the booking schema.
fn dry_run_storage() -> MemoryStorage {
    MemoryStorage::new()
        .with_foreign_key("booking", "customer_id", "customer")
        .with_foreign_key("booking_ref", "booking_id", "booking")
        .with_foreign_key("booking_requirement", "booking_id", "booking")
}
