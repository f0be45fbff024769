use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::coordinate::Coordinate;
use crate::errors::{AppError, AppResult};

const BASE_BACKOFF_MS: u64 = 250;
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Nearest named place for a coordinate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaceResolution {
    pub name: String,
    pub country_code: String,
}

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("no place found near {0}")]
    NoMatch(Coordinate),
    #[error("place lookup unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl ResolutionError {
    /// Whether a later attempt for the same coordinate could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ResolutionError::NoMatch(_) => false,
            ResolutionError::Unavailable(_) => true,
            ResolutionError::Http(err) => err
                .status()
                .map(|status| {
                    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
                })
                .unwrap_or_else(|| err.is_timeout() || err.is_connect()),
        }
    }
}

#[async_trait]
pub trait PlaceLookup: Send + Sync {
    async fn nearest_place(&self, point: Coordinate) -> Result<PlaceResolution, ResolutionError>;
}

/// Cheap-to-clone handle over whichever lookup backend the config selects.
#[derive(Clone)]
pub struct PlacesService {
    inner: Arc<dyn PlaceLookup>,
}

impl PlacesService {
    pub fn new(config: &PipelineConfig) -> AppResult<Self> {
        let gazetteer = match &config.gazetteer_path {
            Some(path) => Some(GazetteerLookup::from_path(path)?),
            None => None,
        };
        let http = match &config.lookup_endpoint {
            Some(endpoint) => Some(HttpPlaceLookup::new(endpoint, config)?),
            None => None,
        };

        let inner: Arc<dyn PlaceLookup> = match (http, gazetteer) {
            (Some(http), Some(gazetteer)) => Arc::new(FallbackLookup::new(http, gazetteer)),
            (Some(http), None) => Arc::new(http),
            (None, Some(gazetteer)) => Arc::new(gazetteer),
            (None, None) => {
                return Err(AppError::Config(
                    "no place lookup configured; set LOOKUP_ENDPOINT or GAZETTEER_PATH".into(),
                ))
            }
        };
        Ok(Self { inner })
    }

    pub fn from_lookup(lookup: Arc<dyn PlaceLookup>) -> Self {
        Self { inner: lookup }
    }

    pub async fn nearest_place(
        &self,
        point: Coordinate,
    ) -> Result<PlaceResolution, ResolutionError> {
        self.inner.nearest_place(point).await
    }
}

struct RateLimiter {
    min_interval: Duration,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(qps: u32) -> Self {
        let interval_ms = (1000_f64 / qps.max(1) as f64).ceil() as u64;
        Self {
            min_interval: Duration::from_millis(interval_ms),
            last_tick: AsyncMutex::new(None),
        }
    }

    async fn wait(&self) {
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}

/// Reverse geocoder speaking the Nominatim `/reverse` protocol.
pub struct HttpPlaceLookup {
    http: reqwest::Client,
    reverse_url: String,
    api_key: Option<SecretString>,
    rate_limiter: RateLimiter,
    max_attempts: u32,
    jitter_rng: Mutex<StdRng>,
}

impl HttpPlaceLookup {
    pub fn new(endpoint: &str, config: &PipelineConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.lookup_timeout_secs))
            .user_agent(concat!("trip-ingest/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| AppError::Config(format!("failed to build lookup client: {err}")))?;
        Ok(Self {
            http,
            reverse_url: format!("{}/reverse", endpoint.trim_end_matches('/')),
            api_key: config.lookup_api_key.clone(),
            rate_limiter: RateLimiter::new(config.lookup_rate_limit_qps),
            max_attempts: config.lookup_max_attempts.max(1),
            jitter_rng: Mutex::new(StdRng::from_entropy()),
        })
    }

    async fn reverse(&self, point: Coordinate) -> Result<PlaceResolution, ResolutionError> {
        #[derive(Deserialize)]
        struct Response {
            error: Option<String>,
            address: Option<Address>,
            name: Option<String>,
        }

        #[derive(Deserialize)]
        struct Address {
            city: Option<String>,
            town: Option<String>,
            village: Option<String>,
            hamlet: Option<String>,
            municipality: Option<String>,
            country_code: Option<String>,
        }

        let mut request = self.http.get(&self.reverse_url).query(&[
            ("format", "jsonv2".to_string()),
            ("lat", point.latitude().to_string()),
            ("lon", point.longitude().to_string()),
            ("zoom", "10".to_string()),
        ]);
        if let Some(key) = &self.api_key {
            request = request.header("X-Api-Key", key.expose_secret());
        }

        let response: Response = request.send().await?.error_for_status()?.json().await?;
        if let Some(message) = response.error {
            debug!(%point, reason = %message, "reverse lookup returned no place");
            return Err(ResolutionError::NoMatch(point));
        }
        let address = response.address.ok_or(ResolutionError::NoMatch(point))?;
        let country_code = address
            .country_code
            .map(|code| code.to_ascii_uppercase())
            .ok_or(ResolutionError::NoMatch(point))?;
        let name = address
            .city
            .or(address.town)
            .or(address.village)
            .or(address.hamlet)
            .or(address.municipality)
            .or(response.name)
            .filter(|name| !name.trim().is_empty())
            .ok_or(ResolutionError::NoMatch(point))?;

        Ok(PlaceResolution { name, country_code })
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = (attempt - 1).min(6);
        let base = Duration::from_millis(BASE_BACKOFF_MS * (1 << exponent));
        let jitter_ms = self.jitter_rng.lock().gen_range(0..BASE_BACKOFF_MS);
        base + Duration::from_millis(jitter_ms)
    }
}

#[async_trait]
impl PlaceLookup for HttpPlaceLookup {
    async fn nearest_place(&self, point: Coordinate) -> Result<PlaceResolution, ResolutionError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.rate_limiter.wait().await;
            match self.reverse(point).await {
                Ok(place) => return Ok(place),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        error = %err,
                        attempt, "reverse lookup failed; retrying after {:?}", delay
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct GazetteerEntry {
    lat: f64,
    lon: f64,
    name: String,
    cc: String,
}

/// Offline nearest-neighbor over a city list (`lat,lon,name,admin1,admin2,cc`).
pub struct GazetteerLookup {
    entries: Vec<GazetteerEntry>,
}

impl GazetteerLookup {
    pub fn from_path<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(AppError::Path(format!(
                "gazetteer not found at {}",
                path.display()
            )));
        }
        let reader = csv::Reader::from_path(path)?;
        Self::from_reader(reader)
    }

    pub fn from_reader<R: std::io::Read>(mut reader: csv::Reader<R>) -> AppResult<Self> {
        let entries = reader
            .deserialize::<GazetteerEntry>()
            .collect::<Result<Vec<_>, _>>()?;
        debug!(entries = entries.len(), "gazetteer loaded");
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl PlaceLookup for GazetteerLookup {
    async fn nearest_place(&self, point: Coordinate) -> Result<PlaceResolution, ResolutionError> {
        self.entries
            .iter()
            .map(|entry| (haversine_km(point, entry.lat, entry.lon), entry))
            .min_by(|(a, _), (b, _)| a.total_cmp(b))
            .map(|(_, entry)| PlaceResolution {
                name: entry.name.clone(),
                country_code: entry.cc.clone(),
            })
            .ok_or(ResolutionError::NoMatch(point))
    }
}

fn haversine_km(point: Coordinate, lat: f64, lon: f64) -> f64 {
    let (lat1, lat2) = (point.latitude().to_radians(), lat.to_radians());
    let d_lat = lat2 - lat1;
    let d_lon = (lon - point.longitude()).to_radians();
    let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}

struct FallbackLookup {
    primary: HttpPlaceLookup,
    fallback: GazetteerLookup,
}

impl FallbackLookup {
    fn new(primary: HttpPlaceLookup, fallback: GazetteerLookup) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl PlaceLookup for FallbackLookup {
    async fn nearest_place(&self, point: Coordinate) -> Result<PlaceResolution, ResolutionError> {
        match self.primary.nearest_place(point).await {
            Ok(place) => Ok(place),
            Err(err) => {
                warn!(
                    error = %err,
                    %point,
                    "reverse lookup failed; falling back to gazetteer"
                );
                self.fallback.nearest_place(point).await
            }
        }
    }
}
