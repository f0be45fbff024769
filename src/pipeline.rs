use std::fmt;
use std::io::Read;
use std::path::Path;
use std::time::Instant;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::cache::CacheStats;
use crate::chunk::{Chunk, ChunkReader};
use crate::enrich::{ChunkEnricher, EnrichStats};
use crate::errors::{AppError, AppResult};
use crate::schema::{NormalizedChunk, TableSchema, TRIPS};
use crate::store::TripStore;
use crate::telemetry::TelemetryClient;

pub const DEPARTURE_COLUMN: &str = "departure_time";
pub const LEGACY_DEPARTURE_COLUMN: &str = "datetime";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkFailure {
    pub chunk: usize,
    pub rows: usize,
    pub error: String,
}

/// Outcome of one run. Failed chunks are absent from the destination.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub rows_attempted: usize,
    pub rows_loaded: usize,
    pub chunks_processed: usize,
    pub chunks_loaded: Vec<usize>,
    pub chunks_already_loaded: Vec<usize>,
    pub failed_chunks: Vec<ChunkFailure>,
    pub errors: Vec<String>,
    pub enrichment: EnrichStats,
    pub cache: CacheStats,
    pub elapsed_ms: u64,
}

impl RunReport {
    pub fn failed_chunk_indices(&self) -> Vec<usize> {
        self.failed_chunks.iter().map(|failure| failure.chunk).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.failed_chunks.is_empty()
    }
}

enum State {
    Start,
    EnsureSchema,
    ReadChunk,
    Enrich(Chunk),
    Normalize(Chunk),
    Load(NormalizedChunk),
    ClearStagingArea { chunk: usize },
    Done,
    Failed(AppError),
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Start => f.write_str("start"),
            State::EnsureSchema => f.write_str("ensure_schema"),
            State::ReadChunk => f.write_str("read_chunk"),
            State::Enrich(chunk) => write!(f, "enrich({})", chunk.index()),
            State::Normalize(chunk) => write!(f, "normalize({})", chunk.index()),
            State::Load(chunk) => write!(f, "load({})", chunk.index),
            State::ClearStagingArea { chunk } => write!(f, "clear_staging({chunk})"),
            State::Done => f.write_str("done"),
            State::Failed(_) => f.write_str("failed"),
        }
    }
}

/// Streams trips through enrichment into a [`TripStore`], one chunk at a
/// time.
pub struct Pipeline<S: TripStore> {
    store: S,
    enricher: ChunkEnricher,
    telemetry: TelemetryClient,
    schema: &'static TableSchema,
    chunk_size: usize,
}

impl<S: TripStore> Pipeline<S> {
    pub fn new(store: S, enricher: ChunkEnricher, chunk_size: usize) -> Self {
        Self {
            store,
            enricher,
            telemetry: TelemetryClient::disabled(),
            schema: &TRIPS,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn with_telemetry(mut self, telemetry: TelemetryClient) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub async fn run_file<P: AsRef<Path>>(&mut self, input: P) -> AppResult<RunReport> {
        let input = input.as_ref();
        info!(path = %input.display(), chunk_size = self.chunk_size, "starting pipeline");
        let reader = ChunkReader::open(input, self.chunk_size)?;
        self.run(reader).await
    }

    /// Drives the run to `Done`, or returns the error that moved it to
    /// `Failed`. Load failures do not fail the run.
    pub async fn run<R: Read>(&mut self, mut reader: ChunkReader<R>) -> AppResult<RunReport> {
        let started = Instant::now();
        let mut report = RunReport::default();
        let mut state = State::Start;

        loop {
            state = match state {
                State::Done => break,
                State::Failed(err) => {
                    error!(error = %err, chunks = report.chunks_processed, "pipeline failed");
                    self.emit("run_failed", json!({ "error": err.to_string() }));
                    self.flush_telemetry();
                    return Err(err);
                }
                current => {
                    debug!(state = %current, "pipeline step");
                    self.step(current, &mut reader, &mut report)
                        .await
                        .unwrap_or_else(State::Failed)
                }
            };
        }

        report.cache = self.enricher.cache().stats();
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            rows_attempted = report.rows_attempted,
            rows_loaded = report.rows_loaded,
            chunks = report.chunks_processed,
            failed = report.failed_chunks.len(),
            cache_entries = report.cache.entries,
            upstream_lookups = report.cache.lookups,
            "pipeline completed"
        );
        self.emit(
            "run_completed",
            json!({
                "rows_attempted": report.rows_attempted,
                "rows_loaded": report.rows_loaded,
                "chunks_processed": report.chunks_processed,
                "failed_chunks": report.failed_chunk_indices(),
                "cache": report.cache,
            }),
        );
        self.flush_telemetry();
        Ok(report)
    }

    async fn step<R: Read>(
        &mut self,
        state: State,
        reader: &mut ChunkReader<R>,
        report: &mut RunReport,
    ) -> AppResult<State> {
        let next = match state {
            State::Start => {
                let leftovers = self.store.clear_staging()?;
                if leftovers > 0 {
                    warn!(rows = leftovers, "cleared staging rows left by an earlier run");
                }
                State::EnsureSchema
            }
            State::EnsureSchema => {
                self.store.ensure_schema()?;
                State::ReadChunk
            }
            State::ReadChunk => match reader.next_chunk()? {
                None => State::Done,
                Some(mut chunk) => {
                    if chunk.column_position(DEPARTURE_COLUMN).is_none()
                        && chunk.rename_column(LEGACY_DEPARTURE_COLUMN, DEPARTURE_COLUMN)
                    {
                        debug!(chunk = chunk.index(), "renamed legacy departure column");
                    }
                    info!(chunk = chunk.index(), rows = chunk.len(), "processing chunk");
                    report.rows_attempted += chunk.len();
                    report.chunks_processed += 1;
                    State::Enrich(chunk)
                }
            },
            State::Enrich(mut chunk) => {
                let timer = Instant::now();
                let stats = self.enricher.enrich_trips(&mut chunk).await;
                info!(
                    chunk = chunk.index(),
                    elapsed_ms = timer.elapsed().as_millis() as u64,
                    enriched = stats.enriched,
                    parse_failures = stats.parse_failures,
                    resolution_failures = stats.resolution_failures,
                    cache_entries = self.enricher.cache().len(),
                    "chunk enriched"
                );
                report.enrichment.merge(stats);
                State::Normalize(chunk)
            }
            State::Normalize(chunk) => State::Load(self.schema.normalize(chunk)),
            State::Load(chunk) => {
                self.load(&chunk, report);
                State::ClearStagingArea { chunk: chunk.index }
            }
            State::ClearStagingArea { chunk } => {
                match self.store.clear_staging() {
                    Ok(removed) => debug!(chunk, removed, "staging area cleared"),
                    Err(err) => {
                        warn!(chunk, error = %err, "failed to clear staging area");
                        report.errors.push(format!("chunk {chunk}: staging clear failed: {err}"));
                    }
                }
                State::ReadChunk
            }
            State::Done => State::Done,
            State::Failed(err) => return Err(err),
        };
        Ok(next)
    }

    fn load(&mut self, chunk: &NormalizedChunk, report: &mut RunReport) {
        match self.store.bulk_append(chunk) {
            Ok(outcome) if outcome.already_loaded => {
                info!(chunk = chunk.index, "chunk was loaded by an earlier run");
                report.chunks_already_loaded.push(chunk.index);
            }
            Ok(outcome) => {
                info!(
                    chunk = chunk.index,
                    rows = outcome.rows_written,
                    operations = outcome.write_operations,
                    "chunk inserted"
                );
                report.rows_loaded += outcome.rows_written;
                report.chunks_loaded.push(chunk.index);
                self.emit(
                    "chunk_loaded",
                    json!({
                        "chunk": chunk.index,
                        "rows": outcome.rows_written,
                        "operations": outcome.write_operations,
                        "cache_entries": self.enricher.cache().len(),
                    }),
                );
            }
            Err(err) => {
                error!(chunk = chunk.index, error = %err, "failed to insert chunk");
                report.errors.push(format!("chunk {}: {err}", chunk.index));
                report.failed_chunks.push(ChunkFailure {
                    chunk: chunk.index,
                    rows: chunk.len(),
                    error: err.to_string(),
                });
                self.emit(
                    "chunk_failed",
                    json!({ "chunk": chunk.index, "error": err.to_string() }),
                );
            }
        }
    }

    fn emit(&self, name: &str, payload: serde_json::Value) {
        if let Err(err) = self.telemetry.record(name, payload) {
            warn!(?err, event = name, "failed to record telemetry event");
        }
    }

    fn flush_telemetry(&self) {
        if let Err(err) = self.telemetry.flush() {
            warn!(?err, "failed to flush telemetry journal");
        }
    }
}
