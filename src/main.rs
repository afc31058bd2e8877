//! CLI entry point for the GBFS ingestion tool.
//!
//! Provides subcommands for polling a bike-share system's station feeds into
//! a destination, replicating a local SQLite table into a destination, and
//! listing the systems the public GBFS catalog knows about.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gbfs_ingest::{
    config::Settings,
    fetch::{BasicClient, load_source},
    gbfs::{GbfsClient, SystemCatalog},
    pipeline::{Pipeline, PipelineConfig, Resource, until_cancelled},
    replicate::{
        DEFAULT_CHUNK_SIZE, DEFAULT_DATASET, DEFAULT_TABLE_NAME, ReplicateOptions, SqliteSource,
        replicate,
    },
    sink::{WriteDisposition, open_destination},
};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "gbfs_ingest")]
#[command(about = "Poll GBFS bike-share feeds into an analytical store", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll a system's station feeds and load them into a destination
    Ingest {
        /// System ID from the GBFS catalog (e.g. "Paris")
        city: String,

        /// Destination dataset (lowercased)
        dataset_name: String,

        /// Destination: athena, sqlite or filesystem
        #[arg(long, default_value = "athena")]
        destination: String,

        /// Seconds to sleep between cycles
        #[arg(long, default_value_t = 300)]
        interval_secs: u64,

        /// Number of cycles to run (0 = until Ctrl+C)
        #[arg(short = 'n', long, default_value_t = 0)]
        max_cycles: usize,

        /// Only load station status (skip station information)
        #[arg(long, default_value_t = false)]
        status_only: bool,
    },
    /// Copy a table from a local SQLite database into a destination
    Replicate {
        /// Path to the SQLite database file
        source_path: PathBuf,

        /// Table to read from the source database
        source_table: String,

        /// Destination: athena, sqlite or filesystem
        destination: String,

        /// Name of the destination table
        #[arg(long = "destination_table_name", default_value = DEFAULT_TABLE_NAME)]
        destination_table_name: String,

        /// Destination dataset/database
        #[arg(long = "destination_dataset", default_value = DEFAULT_DATASET)]
        destination_dataset: String,

        /// Rows read from the source per chunk
        #[arg(long = "chunk_size", default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,

        /// Write disposition: replace, append or merge
        #[arg(long = "write_disposition", default_value = "replace")]
        write_disposition: String,

        /// Primary key column, required for merge
        #[arg(long = "primary_key")]
        primary_key: Option<String>,
    },
    /// List systems in the public GBFS catalog
    ListSystems,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/gbfs_ingest.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("gbfs_ingest.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env();

    let ct = CancellationToken::new();
    let ct_clone = ct.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, stopping");
                ct_clone.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C"),
        }
    });

    match cli.command {
        Commands::Ingest {
            city,
            dataset_name,
            destination,
            interval_secs,
            max_cycles,
            status_only,
        } => {
            let resources = if status_only {
                vec![Resource::station_data()]
            } else {
                vec![Resource::station_info(), Resource::station_data()]
            };
            let config = PipelineConfig {
                interval: Duration::from_secs(interval_secs),
                max_cycles,
                resources,
            };
            ingest(&city, &dataset_name, &destination, config, &settings, ct).await?;
        }
        Commands::Replicate {
            source_path,
            source_table,
            destination,
            destination_table_name,
            destination_dataset,
            chunk_size,
            write_disposition,
            primary_key,
        } => {
            let options = ReplicateOptions {
                destination_table: destination_table_name,
                chunk_size,
                disposition: WriteDisposition::parse(&write_disposition, primary_key.as_deref())?,
            };
            let source = SqliteSource::open(&source_path, &source_table)?;
            let sink = until_cancelled(
                &ct,
                "destination setup",
                open_destination(&destination, &destination_dataset, &settings),
            )
            .await?;

            let rows =
                until_cancelled(&ct, "replication", replicate(&source, sink.as_ref(), &options))
                    .await?;
            info!(rows, destination = %destination, "Replicated table");
        }
        Commands::ListSystems => {
            let catalog = until_cancelled(&ct, "catalog fetch", load_catalog(&settings)).await?;

            for system in catalog.systems() {
                info!(
                    system_id = %system.system_id,
                    name = %system.name,
                    location = %system.location,
                    country = %system.country_code,
                    "System"
                );
            }
            info!(total = catalog.systems().len(), "System list fetched");
        }
    }

    Ok(())
}

async fn load_catalog(settings: &Settings) -> Result<SystemCatalog> {
    let http = BasicClient::new()?;
    let bytes = load_source(&http, &settings.systems_catalog)
        .await
        .context("failed to load the GBFS systems catalog")?;
    SystemCatalog::from_csv(&bytes)
}

/// Resolves the system, opens the destination and runs the polling loop.
/// Any failure before the loop starts is fatal, and so is an interrupt;
/// once the loop runs it stops cleanly on the token.
#[tracing::instrument(skip(config, settings, ct))]
async fn ingest(
    city: &str,
    dataset_name: &str,
    destination: &str,
    config: PipelineConfig,
    settings: &Settings,
    ct: CancellationToken,
) -> Result<()> {
    let (client, sink) = until_cancelled(&ct, "startup", async {
        let catalog = load_catalog(settings).await?;
        let system = catalog.find(city)?;
        info!(system_id = %system.system_id, url = %system.auto_discovery_url, "System resolved");

        let client = GbfsClient::connect(BasicClient::new()?, &system.auto_discovery_url).await?;
        let sink = open_destination(destination, dataset_name, settings).await?;
        Ok((client, sink))
    })
    .await?;

    let pipeline = Pipeline::new(Arc::new(client), sink, config);
    let summary = pipeline.run(ct).await;

    info!(
        cycles = summary.cycles,
        rows = summary.rows_written,
        "Ingestion finished"
    );
    Ok(())
}
