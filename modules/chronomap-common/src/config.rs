use std::env;

use tracing::info;

/// Pipeline configuration loaded from environment variables. Every knob has
/// a default suitable for a local run against public endpoints and an
/// LM Studio style server on localhost.
#[derive(Debug, Clone)]
pub struct Config {
    // Local model
    pub model_base_url: String,
    pub model_name: String,

    // External sources
    pub structured_endpoint: String,
    pub pageview_endpoint: String,

    // Politeness and retries
    pub structured_delay_ms: u64,
    pub narrative_delay_ms: u64,
    pub popularity_delay_ms: u64,
    pub geocode_delay_ms: u64,
    pub max_attempts: u32,

    // Storage
    pub data_dir: String,

    // Entity roster override
    pub roster_file: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            model_base_url: env_or("MODEL_BASE_URL", "http://localhost:1234"),
            model_name: env_or("MODEL_NAME", "google/gemma-3n-e4b"),
            structured_endpoint: env_or(
                "STRUCTURED_ENDPOINT",
                "https://query.wikidata.org/sparql",
            ),
            pageview_endpoint: env_or(
                "PAGEVIEW_ENDPOINT",
                "https://wikimedia.org/api/rest_v1/metrics/pageviews/per-article/en.wikipedia/all-access/user",
            ),
            structured_delay_ms: env_parsed("STRUCTURED_DELAY_MS", 1000),
            narrative_delay_ms: env_parsed("NARRATIVE_DELAY_MS", 1500),
            popularity_delay_ms: env_parsed("POPULARITY_DELAY_MS", 200),
            geocode_delay_ms: env_parsed("GEOCODE_DELAY_MS", 500),
            max_attempts: env_parsed("MAX_ATTEMPTS", 3),
            data_dir: env_or("DATA_DIR", "data"),
            roster_file: env::var("ROSTER_FILE").ok(),
        }
    }

    pub fn log_summary(&self) {
        info!(
            model = %self.model_name,
            model_base_url = %self.model_base_url,
            data_dir = %self.data_dir,
            roster_file = ?self.roster_file,
            "Configuration loaded"
        );
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T
where
    T::Err: std::fmt::Debug,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .unwrap_or_else(|e| panic!("{key} must be a number: {e:?}")),
        Err(_) => default,
    }
}
