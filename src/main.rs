use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::error;

use trip_ingest::{init_tracing, run_pipeline, PipelineConfig};

/// Loads a trips CSV into the destination database, adding origin and
/// destination place names.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// CSV file with origin_coord, destination_coord and trip columns.
    #[arg(long, short)]
    file: PathBuf,
    /// Overrides DATABASE_PATH.
    #[arg(long)]
    database: Option<PathBuf>,
    /// Overrides CHUNK_SIZE.
    #[arg(long)]
    chunk_size: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = PipelineConfig::from_env();
    if let Some(database) = cli.database {
        config.database_path = database;
    }
    if let Some(chunk_size) = cli.chunk_size {
        config.chunk_size = chunk_size.max(1);
    }

    let report = run_pipeline(&config, &cli.file)
        .await
        .with_context(|| format!("ingesting {}", cli.file.display()))?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.is_complete() {
        error!(
            failed = ?report.failed_chunk_indices(),
            "some chunks were not loaded"
        );
        process::exit(1);
    }
    Ok(())
}
