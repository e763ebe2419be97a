pub mod cache;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod fetcher;
pub mod metrics;
pub mod selector;
pub mod state;
pub mod transport;

pub use cache::AssetCache;
pub use config::Config;
pub use error::{MirrorError, Result};
pub use fetcher::FallbackFetcher;
pub use selector::EndpointSelector;
pub use state::AppState;
