use crate::cache::AssetCache;
use crate::config::Config;
use crate::fetcher::FallbackFetcher;
use crate::selector::EndpointSelector;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

/// The wired-up delivery stack: one client, one selector, one fetcher, one cache.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Shared HTTP client for connection pooling
    pub http_client: Client,
    pub selector: EndpointSelector,
    pub fetcher: Arc<FallbackFetcher>,
    pub cache: AssetCache,
}

impl AppState {
    /// Build the stack with a pooled HTTP client.
    pub fn new(config: Config) -> Result<Self, reqwest::Error> {
        let http_client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build()?;

        Ok(Self::with_client(config, http_client))
    }

    pub fn with_client(config: Config, http_client: Client) -> Self {
        let selector = EndpointSelector::new(http_client.clone(), &config);
        let fetcher = Arc::new(FallbackFetcher::new(
            http_client.clone(),
            selector.clone(),
            config.fetch_timeout,
        ));
        let cache = AssetCache::new(http_client.clone(), Arc::clone(&fetcher), &config);

        Self {
            config: Arc::new(config),
            http_client,
            selector,
            fetcher,
            cache,
        }
    }
}
