use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Default freshness window for a persisted endpoint ranking (6 hours).
pub const DEFAULT_RANKING_TTL_SECS: u64 = 6 * 60 * 60;

/// Default per-attempt download timeout in seconds.
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 15;

/// Default hot-tier capacity in entries.
pub const DEFAULT_HOT_CAPACITY: usize = 50;

/// Default number of simultaneous fetches issued by `preload_many`.
pub const DEFAULT_PRELOAD_CONCURRENCY: usize = 4;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Mirror base URLs in declared order
    pub endpoints: Vec<String>,
    /// Optional primary (fastest-path) provider, tried ahead of the mirrors
    pub primary_endpoint: Option<String>,
    /// When false the primary provider is omitted from the candidate list
    pub primary_enabled: bool,
    /// Path segment that marks the start of a canonical resource path
    pub path_marker: String,
    /// Small resource used for HEAD latency probes
    pub probe_path: String,
    /// Larger resource downloaded to estimate throughput
    pub throughput_path: String,
    /// Directory holding durable-tier files
    pub cache_dir: PathBuf,
    /// Directory holding the persisted endpoint ranking
    pub data_dir: PathBuf,
    /// How long a persisted ranking stays valid
    pub ranking_ttl: Duration,
    /// Per-attempt timeout for asset downloads
    pub fetch_timeout: Duration,
    /// Timeout for the latency probe
    pub probe_timeout: Duration,
    /// Timeout for the throughput probe
    pub throughput_timeout: Duration,
    /// Hot-tier capacity in entries
    pub hot_capacity: usize,
    /// Concurrency gate for bulk preloading
    pub preload_concurrency: usize,
    /// Consecutive failures that trigger a background re-probe (0 disables)
    pub failure_threshold: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoints: vec![
                "https://cdn-a.example.com".to_string(),
                "https://cdn-b.example.com".to_string(),
            ],
            primary_endpoint: None,
            primary_enabled: true,
            path_marker: "assets".to_string(),
            probe_path: "assets/probe/ping.json".to_string(),
            throughput_path: "assets/probe/sample.bin".to_string(),
            cache_dir: PathBuf::from("./.mirrorcache/assets"),
            data_dir: PathBuf::from("./.mirrorcache"),
            ranking_ttl: Duration::from_secs(DEFAULT_RANKING_TTL_SECS),
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            probe_timeout: Duration::from_secs(10),
            throughput_timeout: Duration::from_secs(30),
            hot_capacity: DEFAULT_HOT_CAPACITY,
            preload_concurrency: DEFAULT_PRELOAD_CONCURRENCY,
            failure_threshold: 3,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    /// Every variable is optional; unset or unparsable values keep their defaults,
    /// but endpoint URLs must be valid http(s) URLs.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let defaults = Config::default();

        let endpoints = match env::var("MIRROR_ENDPOINTS") {
            Ok(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            Err(_) => defaults.endpoints,
        };
        for endpoint in &endpoints {
            validate_endpoint_url(endpoint)?;
        }

        let primary_endpoint = env::var("MIRROR_PRIMARY_ENDPOINT").ok();
        if let Some(ref primary) = primary_endpoint {
            validate_endpoint_url(primary)?;
        }

        let primary_enabled = env::var("MIRROR_PRIMARY_ENABLED")
            .unwrap_or_else(|_| "true".to_string())
            .parse()
            .unwrap_or(true);

        if endpoints.is_empty() && !(primary_enabled && primary_endpoint.is_some()) {
            return Err("MIRROR_ENDPOINTS must name at least one endpoint".into());
        }

        let path_marker = env::var("MIRROR_PATH_MARKER").unwrap_or(defaults.path_marker);
        let probe_path = env::var("MIRROR_PROBE_PATH").unwrap_or(defaults.probe_path);
        let throughput_path =
            env::var("MIRROR_THROUGHPUT_PATH").unwrap_or(defaults.throughput_path);

        let cache_dir = env::var("MIRROR_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_dir);
        let data_dir = env::var("MIRROR_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        Ok(Config {
            endpoints,
            primary_endpoint,
            primary_enabled,
            path_marker,
            probe_path,
            throughput_path,
            cache_dir,
            data_dir,
            ranking_ttl: secs_var("MIRROR_RANKING_TTL_SECS", defaults.ranking_ttl),
            fetch_timeout: secs_var("MIRROR_FETCH_TIMEOUT_SECS", defaults.fetch_timeout),
            probe_timeout: secs_var("MIRROR_PROBE_TIMEOUT_SECS", defaults.probe_timeout),
            throughput_timeout: secs_var(
                "MIRROR_THROUGHPUT_TIMEOUT_SECS",
                defaults.throughput_timeout,
            ),
            hot_capacity: parsed_var("MIRROR_HOT_CAPACITY", defaults.hot_capacity).max(1),
            preload_concurrency: parsed_var(
                "MIRROR_PRELOAD_CONCURRENCY",
                defaults.preload_concurrency,
            )
            .max(1),
            failure_threshold: parsed_var("MIRROR_FAILURE_THRESHOLD", defaults.failure_threshold),
        })
    }
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn secs_var(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn validate_endpoint_url(raw: &str) -> Result<(), Box<dyn std::error::Error>> {
    let parsed = Url::parse(raw).map_err(|e| format!("Invalid endpoint URL {raw}: {e}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(format!("Endpoint scheme '{scheme}' not allowed in {raw}").into()),
    }
}
