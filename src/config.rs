use std::path::PathBuf;
use std::{env, io};

use secrecy::SecretString;
use tracing::debug;

pub const DEFAULT_CHUNK_SIZE: usize = 50_000;
pub const DEFAULT_WRITE_BATCH_SIZE: usize = 25_000;

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub database_path: PathBuf,
    pub chunk_size: usize,
    pub write_batch_size: usize,
    pub lookup_endpoint: Option<String>,
    pub lookup_api_key: Option<SecretString>,
    pub gazetteer_path: Option<PathBuf>,
    pub lookup_rate_limit_qps: u32,
    pub lookup_max_attempts: u32,
    pub lookup_timeout_secs: u64,
    pub enrich_sides_concurrently: bool,
    pub telemetry_path: Option<PathBuf>,
    pub telemetry_batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_source(|_| None)
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self::from_source(|key| env::var(key).ok())
    }

    /// Builds a config from any key lookup; unset or unparseable values fall
    /// back to their defaults.
    pub fn from_source<F>(source: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| source(key).filter(|v| !v.trim().is_empty());
        Self {
            database_path: text("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("trips.db")),
            chunk_size: parse_or(&text, "CHUNK_SIZE", DEFAULT_CHUNK_SIZE).max(1),
            write_batch_size: parse_or(&text, "WRITE_BATCH_SIZE", DEFAULT_WRITE_BATCH_SIZE).max(1),
            lookup_endpoint: text("LOOKUP_ENDPOINT"),
            lookup_api_key: text("LOOKUP_API_KEY").map(SecretString::from),
            gazetteer_path: text("GAZETTEER_PATH").map(PathBuf::from),
            lookup_rate_limit_qps: parse_or(&text, "LOOKUP_RATE_LIMIT_QPS", 1_u32).max(1),
            lookup_max_attempts: parse_or(&text, "LOOKUP_MAX_ATTEMPTS", 3_u32).max(1),
            lookup_timeout_secs: parse_or(&text, "LOOKUP_TIMEOUT_SECS", 10_u64),
            enrich_sides_concurrently: text("ENRICH_SIDES_CONCURRENTLY")
                .map(|v| parse_bool(&v))
                .unwrap_or(true),
            telemetry_path: text("TELEMETRY_PATH").map(PathBuf::from),
            telemetry_batch_size: parse_or(&text, "TELEMETRY_BATCH_SIZE", 25_usize).max(1),
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions)
        || env::var("ALLOW_DOTENV")
            .map(|v| parse_bool(&v))
            .unwrap_or(false)
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True")
}

fn parse_or<T, F>(text: &F, key: &str, default: T) -> T
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    text(key)
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> PipelineConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PipelineConfig::from_source(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_match_the_batch_sizes_of_the_loader() {
        let config = PipelineConfig::default();
        assert_eq!(config.chunk_size, 50_000);
        assert_eq!(config.write_batch_size, 25_000);
        assert_eq!(config.database_path, PathBuf::from("trips.db"));
        assert!(config.lookup_endpoint.is_none());
        assert!(config.enrich_sides_concurrently);
    }

    #[test]
    fn reads_overrides_and_keeps_secrets_wrapped() {
        let config = config_from(&[
            ("CHUNK_SIZE", "1000"),
            ("LOOKUP_ENDPOINT", "https://nominatim.example"),
            ("LOOKUP_API_KEY", "secret"),
            ("ENRICH_SIDES_CONCURRENTLY", "false"),
            ("TELEMETRY_PATH", "/tmp/events.jsonl"),
        ]);
        assert_eq!(config.chunk_size, 1000);
        assert_eq!(
            config.lookup_endpoint.as_deref(),
            Some("https://nominatim.example")
        );
        assert_eq!(
            config.lookup_api_key.as_ref().map(|k| k.expose_secret()),
            Some("secret")
        );
        assert!(!format!("{config:?}").contains("secret\""));
        assert!(!config.enrich_sides_concurrently);
        assert!(config.telemetry_path.is_some());
    }

    #[test]
    fn invalid_numbers_fall_back_and_sizes_stay_positive() {
        let config = config_from(&[
            ("CHUNK_SIZE", "lots"),
            ("WRITE_BATCH_SIZE", "0"),
            ("LOOKUP_RATE_LIMIT_QPS", "0"),
            ("LOOKUP_API_KEY", "  "),
        ]);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.write_batch_size, 1);
        assert_eq!(config.lookup_rate_limit_qps, 1);
        assert!(config.lookup_api_key.is_none());
    }
}
