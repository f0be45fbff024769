pub mod cache;
pub mod chunk;
pub mod config;
pub mod coordinate;
pub mod db;
pub mod enrich;
pub mod errors;
pub mod lookup;
pub mod pipeline;
pub mod schema;
pub mod store;
pub mod telemetry;

use std::path::Path;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::cache::{CacheStats, ResolverCache};
pub use crate::chunk::{Cell, Chunk, ChunkReader};
pub use crate::config::PipelineConfig;
pub use crate::coordinate::{parse_point, Coordinate, ParseError};
pub use crate::db::SqliteTripStore;
pub use crate::enrich::{ChunkEnricher, EnrichStats, DESTINATION, ORIGIN};
pub use crate::errors::{AppError, AppResult};
pub use crate::lookup::{PlaceLookup, PlaceResolution, PlacesService, ResolutionError};
pub use crate::pipeline::{ChunkFailure, Pipeline, RunReport};
pub use crate::schema::{NormalizedChunk, TableSchema, TRIPS};
pub use crate::store::{LoadError, TripStore, WriteOutcome};
pub use crate::telemetry::TelemetryClient;

/// Installs the global subscriber once. `RUST_LOG` overrides the default
/// filter.
pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,trip_ingest=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}

/// Builds the lookup, cache, store and telemetry described by `config` and
/// ingests `input` into the SQLite destination.
pub async fn run_pipeline(config: &PipelineConfig, input: &Path) -> AppResult<RunReport> {
    let places = PlacesService::new(config)?;
    let cache = Arc::new(ResolverCache::new(places));
    let enricher = ChunkEnricher::new(cache, config.enrich_sides_concurrently);
    let store = SqliteTripStore::open(&config.database_path, config.write_batch_size)?;
    let telemetry = TelemetryClient::new(config)?;

    info!(
        database = %config.database_path.display(),
        chunk_size = config.chunk_size,
        write_batch_size = config.write_batch_size,
        telemetry = telemetry.is_enabled(),
        "pipeline configured"
    );
    if let Err(err) = telemetry.record(
        "run_started",
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "input": input.display().to_string(),
            "chunk_size": config.chunk_size,
        }),
    ) {
        warn!(?err, "failed to queue run start event");
    }

    let mut pipeline =
        Pipeline::new(store, enricher, config.chunk_size).with_telemetry(telemetry);
    pipeline.run_file(input).await
}
