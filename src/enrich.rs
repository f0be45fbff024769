use std::sync::Arc;

use futures_util::future::join;
use serde::Serialize;
use tracing::warn;

use crate::cache::ResolverCache;
use crate::chunk::{Cell, Chunk};
use crate::coordinate::parse_point;

/// One coordinate column of a trip and the prefix of the fields derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Side {
    pub source_column: &'static str,
    pub prefix: &'static str,
}

pub const ORIGIN: Side = Side {
    source_column: "origin_coord",
    prefix: "origin",
};

pub const DESTINATION: Side = Side {
    source_column: "destination_coord",
    prefix: "destination",
};

impl Side {
    pub fn derived_columns(&self) -> [String; 4] {
        [
            format!("{}_city", self.prefix),
            format!("{}_country", self.prefix),
            format!("{}_latitude", self.prefix),
            format!("{}_longitude", self.prefix),
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Enrichment {
    pub city: String,
    pub country: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnrichStats {
    pub records: usize,
    pub enriched: usize,
    pub parse_failures: usize,
    pub resolution_failures: usize,
}

impl EnrichStats {
    pub fn merge(&mut self, other: EnrichStats) {
        self.records += other.records;
        self.enriched += other.enriched;
        self.parse_failures += other.parse_failures;
        self.resolution_failures += other.resolution_failures;
    }
}

/// Derived values for one side of a chunk, one slot per record.
#[derive(Debug)]
pub struct SideEnrichment {
    side: Side,
    values: Vec<Option<Enrichment>>,
    stats: EnrichStats,
}

impl SideEnrichment {
    pub fn values(&self) -> &[Option<Enrichment>] {
        &self.values
    }

    pub fn stats(&self) -> EnrichStats {
        self.stats
    }

    /// Writes the four derived columns, replacing any previous values.
    pub fn apply(self, chunk: &mut Chunk) -> EnrichStats {
        let [city, country, latitude, longitude] = self
            .side
            .derived_columns()
            .map(|name| chunk.ensure_column(&name));

        for (row, value) in self.values.into_iter().enumerate() {
            let (c, k, lat, lon) = match value {
                Some(found) => (
                    Cell::Text(found.city),
                    Cell::Text(found.country),
                    Cell::Float(found.latitude),
                    Cell::Float(found.longitude),
                ),
                None => (Cell::Null, Cell::Null, Cell::Null, Cell::Null),
            };
            chunk.set_cell(row, city, c);
            chunk.set_cell(row, country, k);
            chunk.set_cell(row, latitude, lat);
            chunk.set_cell(row, longitude, lon);
        }
        self.stats
    }
}

/// Adds place metadata to chunks through a shared [`ResolverCache`].
#[derive(Clone)]
pub struct ChunkEnricher {
    cache: Arc<ResolverCache>,
    sides_concurrently: bool,
}

impl ChunkEnricher {
    pub fn new(cache: Arc<ResolverCache>, sides_concurrently: bool) -> Self {
        Self {
            cache,
            sides_concurrently,
        }
    }

    pub fn cache(&self) -> &ResolverCache {
        &self.cache
    }

    /// Resolves every record of `side` without touching the chunk. Records
    /// whose coordinate cannot be parsed or resolved get `None`.
    pub async fn resolve_side(&self, chunk: &Chunk, side: Side) -> SideEnrichment {
        let mut stats = EnrichStats {
            records: chunk.len(),
            ..EnrichStats::default()
        };
        let Some(source) = chunk.column_position(side.source_column) else {
            warn!(
                chunk = chunk.index(),
                column = side.source_column,
                "coordinate column missing; derived fields left empty"
            );
            stats.parse_failures = chunk.len();
            return SideEnrichment {
                side,
                values: vec![None; chunk.len()],
                stats,
            };
        };

        let mut values = Vec::with_capacity(chunk.len());
        for row in 0..chunk.len() {
            let raw = chunk.cell(row, source).as_text();
            let Some(point) = parse_point(raw) else {
                stats.parse_failures += 1;
                values.push(None);
                continue;
            };

            match self.cache.resolve(point).await {
                Ok(place) => {
                    stats.enriched += 1;
                    values.push(Some(Enrichment {
                        city: place.name,
                        country: place.country_code,
                        latitude: point.latitude(),
                        longitude: point.longitude(),
                    }));
                }
                Err(err) => {
                    warn!(
                        chunk = chunk.index(),
                        row,
                        %point,
                        error = %err,
                        "place resolution failed; leaving {} fields empty",
                        side.prefix
                    );
                    stats.resolution_failures += 1;
                    values.push(None);
                }
            }
        }

        SideEnrichment {
            side,
            values,
            stats,
        }
    }

    /// Enriches one side of the chunk in place.
    pub async fn enrich(&self, chunk: &mut Chunk, side: Side) -> EnrichStats {
        let enrichment = self.resolve_side(chunk, side).await;
        enrichment.apply(chunk)
    }

    /// Enriches origin and destination; both sides resolve concurrently when
    /// configured to.
    pub async fn enrich_trips(&self, chunk: &mut Chunk) -> EnrichStats {
        let (origin, destination) = if self.sides_concurrently {
            join(
                self.resolve_side(chunk, ORIGIN),
                self.resolve_side(chunk, DESTINATION),
            )
            .await
        } else {
            let origin = self.resolve_side(chunk, ORIGIN).await;
            let destination = self.resolve_side(chunk, DESTINATION).await;
            (origin, destination)
        };

        let mut stats = origin.apply(chunk);
        stats.merge(destination.apply(chunk));
        stats
    }
}
