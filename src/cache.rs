use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::trace;

use crate::coordinate::Coordinate;
use crate::lookup::{PlaceResolution, PlacesService, ResolutionError};

/// Settled answer of one upstream lookup, shared by every caller that joined
/// the flight.
enum Answer {
    Found(PlaceResolution),
    NoMatch,
    Failed(String),
}

/// A failed flight is evicted once settled, so only `Found` and `NoMatch`
/// stay memoized.
type Flight = Arc<OnceCell<Answer>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub requests: u64,
    pub lookups: u64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.requests.saturating_sub(self.lookups)
    }
}

/// Memoizes nearest-place lookups per exact coordinate for the lifetime of a
/// run. Concurrent requests for one coordinate share a single upstream call,
/// including when that call fails.
pub struct ResolverCache {
    lookup: PlacesService,
    flights: Mutex<HashMap<Coordinate, Flight>>,
    requests: AtomicU64,
    lookups: AtomicU64,
}

impl ResolverCache {
    pub fn new(lookup: PlacesService) -> Self {
        Self {
            lookup,
            flights: Mutex::new(HashMap::new()),
            requests: AtomicU64::new(0),
            lookups: AtomicU64::new(0),
        }
    }

    pub async fn resolve(&self, point: Coordinate) -> Result<PlaceResolution, ResolutionError> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let flight = {
            let mut flights = self.flights.lock();
            Arc::clone(flights.entry(point).or_default())
        };

        let mut leader_error = None;
        let failure = &mut leader_error;
        let answer = flight
            .get_or_init(|| async move {
                self.lookups.fetch_add(1, Ordering::Relaxed);
                trace!(%point, "resolving coordinate upstream");
                match self.lookup.nearest_place(point).await {
                    Ok(place) => Answer::Found(place),
                    Err(ResolutionError::NoMatch(_)) => Answer::NoMatch,
                    Err(err) => {
                        let message = err.to_string();
                        *failure = Some(err);
                        Answer::Failed(message)
                    }
                }
            })
            .await;

        match answer {
            Answer::Found(place) => Ok(place.clone()),
            Answer::NoMatch => Err(ResolutionError::NoMatch(point)),
            Answer::Failed(message) => {
                self.evict(point, &flight);
                Err(leader_error.unwrap_or_else(|| ResolutionError::Unavailable(message.clone())))
            }
        }
    }

    fn evict(&self, point: Coordinate, flight: &Flight) {
        let mut flights = self.flights.lock();
        if flights
            .get(&point)
            .is_some_and(|current| Arc::ptr_eq(current, flight))
        {
            flights.remove(&point);
        }
    }

    /// Number of coordinates with a memoized answer.
    pub fn len(&self) -> usize {
        self.flights
            .lock()
            .values()
            .filter(|flight| matches!(flight.get(), Some(Answer::Found(_) | Answer::NoMatch)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            requests: self.requests.load(Ordering::Relaxed),
            lookups: self.lookups.load(Ordering::Relaxed),
        }
    }
}
