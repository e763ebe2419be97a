//! Two-tier asset cache with request coalescing.
//!
//! Reads go hot tier → durable tier → network. Concurrent misses for the same
//! URL share one in-flight fetch; every waiter resumes with the same outcome.
//! Mirrored URLs (those containing the path marker, or bare resource paths)
//! are fetched through the [`FallbackFetcher`]; anything else gets a single
//! direct GET.

pub mod disk;
pub mod hot;

pub use disk::{ClearReport, DiskLookup, DiskTier, DiskUsage, ENTRY_EXTENSION};
pub use hot::HotTier;

use crate::config::Config;
use crate::endpoint::{cache_key, canonical_path, file_extension, is_managed};
use crate::error::{MirrorError, Result};
use crate::fetcher::FallbackFetcher;
use crate::metrics;
use crate::transport::{Validators, get_payload, head_validators};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::future::{self, BoxFuture, FutureExt, Shared};
use futures_util::stream::{self, StreamExt};
use reqwest::Client;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A cached payload with the metadata needed to revalidate it.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub key: String,
    pub bytes: Bytes,
    /// URL that actually served the payload
    pub origin_url: String,
    pub validators: Validators,
    pub cached_at: DateTime<Utc>,
}

/// Cache size snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Entries in the durable tier
    pub entry_count: usize,
    /// Bytes on disk used by the durable tier
    pub total_bytes: u64,
    pub hot_count: usize,
}

/// Reported after each URL of a batch settles.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchProgress {
    pub completed: usize,
    pub total: usize,
    pub url: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PreloadSummary {
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Cancellation was observed before every URL was dispatched
    pub cancelled: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub refreshed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: bool,
}

type InflightFetch = Shared<BoxFuture<'static, Option<Arc<CacheEntry>>>>;

enum PreloadOutcome {
    Downloaded,
    Skipped,
    Failed,
}

struct CacheInner {
    client: Client,
    fetcher: Arc<FallbackFetcher>,
    hot: HotTier,
    disk: DiskTier,
    /// Keyed by full request URL, present only while a fetch runs
    inflight: DashMap<String, InflightFetch>,
    path_marker: String,
    fetch_timeout: Duration,
    preload_concurrency: usize,
}

/// Front door for asset reads.
///
/// Cheap to clone; clones share tiers and in-flight state.
#[derive(Clone)]
pub struct AssetCache {
    inner: Arc<CacheInner>,
}

impl AssetCache {
    pub fn new(client: Client, fetcher: Arc<FallbackFetcher>, config: &Config) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                client,
                fetcher,
                hot: HotTier::new(config.hot_capacity),
                disk: DiskTier::new(config.cache_dir.clone()),
                inflight: DashMap::new(),
                path_marker: config.path_marker.clone(),
                fetch_timeout: config.fetch_timeout,
                preload_concurrency: config.preload_concurrency.max(1),
            }),
        }
    }

    pub fn fetcher(&self) -> &Arc<FallbackFetcher> {
        &self.inner.fetcher
    }

    /// Cache key for `url` under this cache's path marker.
    pub fn key_for(&self, url: &str) -> String {
        cache_key(url, &self.inner.path_marker)
    }

    /// Return the bytes for `url`, from cache when possible.
    ///
    /// `Ok(None)` means every source failed or returned nothing; the only
    /// error is [`MirrorError::Cancelled`].
    pub async fn get_bytes(&self, url: &str, cancel: &CancellationToken) -> Result<Option<Bytes>> {
        if cancel.is_cancelled() {
            return Err(MirrorError::Cancelled);
        }
        let url = url.trim();
        if url.is_empty() {
            return Ok(None);
        }

        let key = self.key_for(url);
        if let Some(entry) = self.lookup(&key).await {
            return Ok(Some(entry.bytes.clone()));
        }
        metrics::record_cache_miss();

        let pending = self.join_or_start(url, key);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(MirrorError::Cancelled),
            outcome = pending => Ok(outcome.map(|entry| entry.bytes.clone())),
        }
    }

    /// [`get_bytes`](Self::get_bytes) encoded as a `data:` URI, with the MIME
    /// type inferred from the URL's extension.
    pub async fn get_as_data_uri(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let bytes = self.get_bytes(url, cancel).await?;
        Ok(bytes.map(|bytes| {
            format!("data:{};base64,{}", mime_for(url), STANDARD.encode(&bytes))
        }))
    }

    /// Whether either tier holds a usable entry for `url`. Never touches the
    /// network. An invalid durable file is discarded and reported as absent.
    pub async fn is_cached(&self, url: &str) -> bool {
        let key = self.key_for(url.trim());
        self.inner.hot.contains(&key) || self.read_disk(&key).await.is_some()
    }

    /// Compare the origin's current validators with the stored ones.
    ///
    /// Returns `false` when the URL is not cached, when nothing was stored to
    /// compare against, or when the check itself fails.
    pub async fn is_stale(&self, url: &str, cancel: &CancellationToken) -> Result<bool> {
        if cancel.is_cancelled() {
            return Err(MirrorError::Cancelled);
        }
        let url = url.trim();
        let key = self.key_for(url);

        let Some(stored) = self.stored_validators(&key).await else {
            return Ok(false);
        };
        if stored.is_empty() {
            debug!("No validators stored for {}, assuming fresh", key);
            return Ok(false);
        }

        match head_validators(&self.inner.client, url, self.inner.fetch_timeout, cancel).await {
            Ok(remote) => {
                let stale = stored.differs_from(&remote);
                if stale {
                    debug!("{} is stale ({:?} -> {:?})", key, stored, remote);
                }
                Ok(stale)
            }
            Err(MirrorError::Cancelled) => Err(MirrorError::Cancelled),
            Err(e) => {
                debug!("Staleness check for {} failed, assuming fresh: {}", url, e);
                Ok(false)
            }
        }
    }

    /// Drop `url` from both tiers. Returns whether anything was removed.
    pub async fn invalidate(&self, url: &str) -> bool {
        let key = self.key_for(url.trim());
        let from_hot = self.inner.hot.remove(&key).is_some();
        let from_disk = match self.inner.disk.remove(&key).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!("Failed to delete cache file for {}: {}", key, e);
                false
            }
        };
        from_hot || from_disk
    }

    /// Fetch a batch concurrently, at most `preload_concurrency` at a time.
    ///
    /// Already-cached URLs and repeated URLs count as skipped. Cancellation
    /// stops new fetches from being dispatched; fetches already running finish
    /// and are counted.
    pub async fn preload_many<S: AsRef<str>>(
        &self,
        urls: &[S],
        mut progress: impl FnMut(BatchProgress),
        cancel: &CancellationToken,
    ) -> PreloadSummary {
        let total = urls.len();
        let mut summary = PreloadSummary::default();
        let mut completed = 0;

        let mut seen = HashSet::new();
        let mut unique = Vec::new();
        for url in urls {
            let url = url.as_ref().trim();
            if seen.insert(url) {
                unique.push(url.to_string());
            } else {
                summary.skipped += 1;
                completed += 1;
                progress(BatchProgress {
                    completed,
                    total,
                    url: url.to_string(),
                });
            }
        }

        // Dispatched fetches run to completion even if `cancel` fires later
        let detached = CancellationToken::new();
        let detached = &detached;

        let mut outcomes = stream::iter(unique)
            .map(|url| async move {
                if cancel.is_cancelled() {
                    return (url, None);
                }
                if self.is_cached(&url).await {
                    return (url, Some(PreloadOutcome::Skipped));
                }
                let outcome = match self.get_bytes(&url, detached).await {
                    Ok(Some(_)) => PreloadOutcome::Downloaded,
                    _ => PreloadOutcome::Failed,
                };
                (url, Some(outcome))
            })
            .buffer_unordered(self.inner.preload_concurrency);

        while let Some((url, outcome)) = outcomes.next().await {
            match outcome {
                Some(PreloadOutcome::Downloaded) => summary.downloaded += 1,
                Some(PreloadOutcome::Skipped) => summary.skipped += 1,
                Some(PreloadOutcome::Failed) => summary.failed += 1,
                None => {
                    summary.cancelled = true;
                    continue;
                }
            }
            completed += 1;
            progress(BatchProgress {
                completed,
                total,
                url,
            });
        }

        info!(
            "Preload finished: {} downloaded, {} skipped, {} failed{}",
            summary.downloaded,
            summary.skipped,
            summary.failed,
            if summary.cancelled { " (cancelled)" } else { "" }
        );
        summary
    }

    /// Check each URL in turn and re-fetch the stale ones.
    ///
    /// Sequential on purpose to bound the origin request rate. URLs that are
    /// not cached, or are still fresh, count as skipped.
    pub async fn refresh_stale<S: AsRef<str>>(
        &self,
        urls: &[S],
        mut progress: impl FnMut(BatchProgress),
        cancel: &CancellationToken,
    ) -> RefreshSummary {
        let total = urls.len();
        let mut summary = RefreshSummary::default();

        for (index, url) in urls.iter().enumerate() {
            let url = url.as_ref().trim();
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            if !self.is_cached(url).await {
                summary.skipped += 1;
            } else {
                match self.is_stale(url, cancel).await {
                    Ok(false) => summary.skipped += 1,
                    Ok(true) => {
                        self.invalidate(url).await;
                        match self.get_bytes(url, cancel).await {
                            Ok(Some(_)) => summary.refreshed += 1,
                            Ok(None) => summary.failed += 1,
                            Err(_) => {
                                summary.cancelled = true;
                                break;
                            }
                        }
                    }
                    Err(_) => {
                        summary.cancelled = true;
                        break;
                    }
                }
            }

            progress(BatchProgress {
                completed: index + 1,
                total,
                url: url.to_string(),
            });
        }

        info!(
            "Refresh finished: {} refreshed, {} skipped, {} failed{}",
            summary.refreshed,
            summary.skipped,
            summary.failed,
            if summary.cancelled { " (cancelled)" } else { "" }
        );
        summary
    }

    /// Empty the hot tier and delete every durable-tier file.
    pub async fn clear_cache(&self) -> ClearReport {
        self.inner.hot.clear();
        let report = self.inner.disk.clear().await;
        info!(
            "Cleared cache: {} files removed, {} failed",
            report.removed, report.failed
        );
        report
    }

    pub async fn get_cache_stats(&self) -> CacheStats {
        let usage = self.inner.disk.usage().await;
        CacheStats {
            entry_count: usage.entries,
            total_bytes: usage.bytes,
            hot_count: self.inner.hot.len(),
        }
    }

    /// Hot tier, then durable tier (promoting hits into the hot tier).
    async fn lookup(&self, key: &str) -> Option<Arc<CacheEntry>> {
        if let Some(entry) = self.inner.hot.get(key) {
            debug!("Hot tier HIT for {}", key);
            metrics::record_cache_hit("hot");
            return Some(entry);
        }

        let entry = Arc::new(self.read_disk(key).await?);
        debug!("Disk tier HIT for {}", key);
        metrics::record_cache_hit("disk");
        self.inner.hot.insert(Arc::clone(&entry));
        Some(entry)
    }

    /// Read the durable tier. Corrupt files are deleted; I/O errors are a
    /// miss and leave the file alone.
    async fn read_disk(&self, key: &str) -> Option<CacheEntry> {
        match self.inner.disk.read(key).await {
            DiskLookup::Hit(entry) => Some(entry),
            DiskLookup::Miss => None,
            DiskLookup::Error(MirrorError::CorruptEntry(reason)) => {
                warn!("Discarding corrupt cache entry {}: {}", key, reason);
                if let Err(e) = self.inner.disk.remove(key).await {
                    debug!("Could not remove corrupt entry {}: {}", key, e);
                }
                None
            }
            DiskLookup::Error(e) => {
                warn!("Could not read cache entry {}: {}", key, e);
                None
            }
        }
    }

    async fn stored_validators(&self, key: &str) -> Option<Validators> {
        if let Some(entry) = self.inner.hot.peek(key) {
            return Some(entry.validators.clone());
        }
        self.read_disk(key).await.map(|entry| entry.validators)
    }

    /// Attach to the in-flight fetch for `url`, or start one.
    fn join_or_start(&self, url: &str, key: String) -> InflightFetch {
        match self.inner.inflight.entry(url.to_string()) {
            Entry::Occupied(existing) => {
                debug!("Joining in-flight fetch for {}", url);
                metrics::record_coalesced_wait();
                existing.get().clone()
            }
            Entry::Vacant(slot) => {
                // A fetch may have settled between the cache lookup and here
                if let Some(entry) = self.inner.hot.get(&key) {
                    return future::ready(Some(entry)).boxed().shared();
                }

                let inner = Arc::clone(&self.inner);
                let owned_url = url.to_string();
                let task = tokio::spawn(async move {
                    let outcome = inner.fetch_and_store(&owned_url, key).await;
                    inner.inflight.remove(&owned_url);
                    outcome
                });

                let pending = async move { task.await.ok().flatten() }.boxed().shared();
                slot.insert(pending.clone());
                pending
            }
        }
    }
}

impl CacheInner {
    /// Download `url` and write it into both tiers.
    ///
    /// Runs detached from any single caller, so it is never cancelled by one.
    async fn fetch_and_store(&self, url: &str, key: String) -> Option<Arc<CacheEntry>> {
        let cancel = CancellationToken::new();

        // Bare resource paths are mirrored content too
        let mirrored = !url.contains("://") || is_managed(url, &self.path_marker);
        let (bytes, origin_url, validators) = if mirrored {
            let path = canonical_path(url, &self.path_marker)?;
            match self.fetcher.fetch(&path, &cancel).await {
                Ok(success) => (success.bytes, success.url, success.validators),
                Err(failure) => {
                    warn!(
                        "No endpoint could serve {} after {} fallback(s): {}",
                        path, failure.fallback_count, failure.reason
                    );
                    return None;
                }
            }
        } else {
            match get_payload(&self.client, url, self.fetch_timeout, &cancel).await {
                Ok(payload) => (payload.bytes, url.to_string(), payload.validators),
                Err(e) => {
                    warn!("Direct fetch of {} failed: {}", url, e);
                    return None;
                }
            }
        };

        let entry = Arc::new(CacheEntry {
            key,
            bytes,
            origin_url,
            validators,
            cached_at: Utc::now(),
        });

        match self.disk.write(&entry).await {
            Ok(()) => {
                self.hot.insert(Arc::clone(&entry));
            }
            Err(e) => warn!("Failed to persist {} to disk cache: {}", entry.key, e),
        }

        Some(entry)
    }
}

/// MIME type for a URL, from its file extension.
pub fn mime_for(url: &str) -> &'static str {
    match file_extension(url).as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("bmp") => "image/bmp",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("txt") => "text/plain",
        Some("zip") => "application/zip",
        Some("7z") => "application/x-7z-compressed",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;
    use crate::selector::{EndpointSelector, ProbeSettings};
    use futures_util::future::join_all;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const LOGO: &str = "/assets/img/logo.png";

    struct Harness {
        cache: AssetCache,
        _dir: TempDir,
    }

    fn harness(endpoints: &[String], hot_capacity: usize) -> Harness {
        let dir = TempDir::new().unwrap();
        let config = Config {
            endpoints: endpoints.to_vec(),
            cache_dir: dir.path().join("assets"),
            data_dir: dir.path().to_path_buf(),
            hot_capacity,
            fetch_timeout: Duration::from_secs(2),
            failure_threshold: 0,
            ..Config::default()
        };
        let client = Client::new();
        let selector = EndpointSelector::with_endpoints(
            client.clone(),
            endpoints.iter().map(|u| Endpoint::new(u.as_str())).collect(),
            ProbeSettings::from(&config),
        );
        let fetcher = Arc::new(FallbackFetcher::new(
            client.clone(),
            selector,
            config.fetch_timeout,
        ));
        Harness {
            cache: AssetCache::new(client, fetcher, &config),
            _dir: dir,
        }
    }

    async fn mount_asset(server: &MockServer, route: &str, body: &str, etag: &str, times: u64) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ETag", etag)
                    .set_body_string(body),
            )
            .expect(times)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn second_read_is_served_from_cache() {
        let server = MockServer::start().await;
        mount_asset(&server, LOGO, "logo-bytes", "\"v1\"", 1).await;
        let h = harness(&[server.uri()], 8);
        let url = format!("{}{}", server.uri(), LOGO);
        let cancel = CancellationToken::new();

        let first = h.cache.get_bytes(&url, &cancel).await.unwrap().unwrap();
        let second = h.cache.get_bytes(&url, &cancel).await.unwrap().unwrap();

        assert_eq!(first, second);
        assert_eq!(&first[..], b"logo-bytes");
        assert_eq!(h.cache.fetcher().stats().attempts, 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(LOGO))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("shared")
                    .set_delay(Duration::from_millis(200)),
            )
            .expect(1)
            .mount(&server)
            .await;
        let h = harness(&[server.uri()], 8);
        let url = format!("{}{}", server.uri(), LOGO);
        let cancel = CancellationToken::new();

        let results = join_all((0..8).map(|_| h.cache.get_bytes(&url, &cancel))).await;

        for result in results {
            assert_eq!(&result.unwrap().unwrap()[..], b"shared");
        }
        assert!(h.cache.inner.inflight.is_empty(), "token removed after settle");
    }

    #[tokio::test]
    async fn failed_fetch_is_broadcast_and_not_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_delay(Duration::from_millis(100)))
            .expect(1)
            .mount(&server)
            .await;
        let h = harness(&[server.uri()], 8);
        let url = format!("{}{}", server.uri(), LOGO);
        let cancel = CancellationToken::new();

        let results = join_all((0..3).map(|_| h.cache.get_bytes(&url, &cancel))).await;
        assert!(results.into_iter().all(|r| matches!(r, Ok(None))));
        assert!(!h.cache.is_cached(&url).await);
        assert!(h.cache.inner.inflight.is_empty());
    }

    #[tokio::test]
    async fn managed_url_falls_back_across_mirrors() {
        let server = MockServer::start().await;
        mount_asset(&server, LOGO, "from-mirror", "\"v1\"", 1).await;
        let h = harness(&["http://127.0.0.1:1".to_string(), server.uri()], 8);

        // The URL names the dead mirror; the fallback fetcher finds the live one
        let url = format!("http://127.0.0.1:1{LOGO}?v=3");
        let bytes = h
            .cache
            .get_bytes(&url, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(&bytes[..], b"from-mirror");
        assert!(h.cache.is_cached(&format!("{}{}", server.uri(), LOGO)).await);
    }

    #[tokio::test]
    async fn bare_resource_path_uses_mirrors() {
        let server = MockServer::start().await;
        mount_asset(&server, LOGO, "by-path", "\"v1\"", 1).await;
        let h = harness(&[server.uri()], 8);

        let bytes = h
            .cache
            .get_bytes("assets/img/logo.png", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(bytes.as_deref(), Some(&b"by-path"[..]));
        assert!(h.cache.is_cached(&format!("{}{}", server.uri(), LOGO)).await);
    }

    #[tokio::test]
    async fn unmanaged_url_is_fetched_directly() {
        let server = MockServer::start().await;
        mount_asset(&server, "/feed.json", "{}", "\"f1\"", 1).await;
        let h = harness(&["http://127.0.0.1:1".to_string()], 8);

        let url = format!("{}/feed.json?page=1", server.uri());
        let bytes = h
            .cache
            .get_bytes(&url, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(bytes.as_deref(), Some(&b"{}"[..]));
        assert_eq!(h.cache.fetcher().stats().attempts, 0);
    }

    #[tokio::test]
    async fn durable_tier_survives_a_new_cache_instance() {
        let server = MockServer::start().await;
        mount_asset(&server, LOGO, "persisted", "\"v1\"", 1).await;
        let h = harness(&[server.uri()], 8);
        let url = format!("{}{}", server.uri(), LOGO);
        let cancel = CancellationToken::new();
        h.cache.get_bytes(&url, &cancel).await.unwrap();

        // Same directories, fresh in-memory state
        let restarted = AssetCache::new(
            Client::new(),
            Arc::clone(h.cache.fetcher()),
            &Config {
                cache_dir: h.cache.inner.disk.dir().to_path_buf(),
                ..Config::default()
            },
        );
        assert_eq!(restarted.get_cache_stats().await.hot_count, 0);
        let bytes = restarted.get_bytes(&url, &cancel).await.unwrap().unwrap();
        assert_eq!(&bytes[..], b"persisted");
        assert_eq!(restarted.get_cache_stats().await.hot_count, 1);
    }

    #[tokio::test]
    async fn cancelled_caller_gets_cancelled() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("late")
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;
        let h = harness(&[server.uri()], 8);
        let url = format!("{}{}", server.uri(), LOGO);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let result = h.cache.get_bytes(&url, &cancel).await;
        assert!(matches!(result, Err(MirrorError::Cancelled)));

        let pre_cancelled = CancellationToken::new();
        pre_cancelled.cancel();
        assert!(matches!(
            h.cache.get_bytes(&url, &pre_cancelled).await,
            Err(MirrorError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn stale_when_etag_changes() {
        let server = MockServer::start().await;
        mount_asset(&server, LOGO, "logo", "\"v1\"", 1).await;
        Mock::given(method("HEAD"))
            .and(path(LOGO))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"v2\""))
            .mount(&server)
            .await;
        let h = harness(&[server.uri()], 8);
        let url = format!("{}{}", server.uri(), LOGO);
        let cancel = CancellationToken::new();

        h.cache.get_bytes(&url, &cancel).await.unwrap();
        assert!(h.cache.is_stale(&url, &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_stop_shared_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(LOGO))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("shared")
                    .set_delay(Duration::from_millis(200)),
            )
            .expect(1)
            .mount(&server)
            .await;
        let h = harness(&[server.uri()], 8);
        let url = format!("{}{}", server.uri(), LOGO);

        let impatient = CancellationToken::new();
        let trigger = impatient.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let patient = CancellationToken::new();

        let (first, second) = tokio::join!(
            h.cache.get_bytes(&url, &impatient),
            h.cache.get_bytes(&url, &patient)
        );

        assert!(matches!(first, Err(MirrorError::Cancelled)));
        assert_eq!(second.unwrap().as_deref(), Some(&b"shared"[..]));
        assert!(h.cache.is_cached(&url).await);
    }

    #[tokio::test]
    async fn corrupt_entry_is_not_cached_and_gets_repaired() {
        let server = MockServer::start().await;
        mount_asset(&server, LOGO, "fresh-copy", "\"v1\"", 1).await;
        let h = harness(&[server.uri()], 8);
        let url = format!("{}{}", server.uri(), LOGO);
        let key = h.cache.key_for(&url);
        let disk = &h.cache.inner.disk;
        let file = disk.path_for(&key);
        std::fs::create_dir_all(disk.dir()).unwrap();

        std::fs::write(&file, b"garbage").unwrap();
        assert!(!h.cache.is_cached(&url).await);
        assert!(!file.exists(), "corrupt file is discarded");

        std::fs::write(&file, b"garbage").unwrap();
        let summary = h
            .cache
            .preload_many(&[&url], |_| {}, &CancellationToken::new())
            .await;

        assert_eq!(summary.downloaded, 1);
        assert_eq!(summary.skipped, 0);
        match disk.read(&key).await {
            DiskLookup::Hit(entry) => assert_eq!(&entry.bytes[..], b"fresh-copy"),
            other => panic!("expected a valid entry, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unreadable_entry_is_a_miss_but_kept() {
        let h = harness(&["http://127.0.0.1:1".to_string()], 8);
        let url = format!("http://127.0.0.1:1{LOGO}");
        let disk = &h.cache.inner.disk;
        let file = disk.path_for(&h.cache.key_for(&url));
        std::fs::create_dir_all(disk.dir()).unwrap();

        // A symlink to itself fails to open with an I/O error, not a parse error
        std::os::unix::fs::symlink(&file, &file).unwrap();

        assert!(!h.cache.is_cached(&url).await);
        assert!(std::fs::symlink_metadata(&file).is_ok());
    }

    #[tokio::test]
    async fn stale_when_last_modified_changes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(LOGO))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Last-Modified", "Tue, 01 Oct 2024 10:00:00 GMT")
                    .set_body_string("logo"),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path(LOGO))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Last-Modified", "Wed, 02 Oct 2024 10:00:00 GMT"),
            )
            .mount(&server)
            .await;
        let h = harness(&[server.uri()], 8);
        let url = format!("{}{}", server.uri(), LOGO);
        let cancel = CancellationToken::new();

        h.cache.get_bytes(&url, &cancel).await.unwrap();
        assert!(h.cache.is_stale(&url, &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn fresh_when_etag_matches() {
        let server = MockServer::start().await;
        mount_asset(&server, LOGO, "logo", "\"v1\"", 1).await;
        Mock::given(method("HEAD"))
            .and(path(LOGO))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"v1\""))
            .mount(&server)
            .await;
        let h = harness(&[server.uri()], 8);
        let url = format!("{}{}", server.uri(), LOGO);
        let cancel = CancellationToken::new();

        h.cache.get_bytes(&url, &cancel).await.unwrap();
        assert!(!h.cache.is_stale(&url, &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn fresh_when_probe_fails() {
        let server = MockServer::start().await;
        mount_asset(&server, LOGO, "logo", "\"v1\"", 1).await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let h = harness(&[server.uri()], 8);
        let url = format!("{}{}", server.uri(), LOGO);
        let cancel = CancellationToken::new();

        h.cache.get_bytes(&url, &cancel).await.unwrap();
        assert!(!h.cache.is_stale(&url, &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn fresh_when_no_validators_stored() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(LOGO))
            .respond_with(ResponseTemplate::new(200).set_body_string("plain"))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"new\""))
            .expect(0)
            .mount(&server)
            .await;
        let h = harness(&[server.uri()], 8);
        let url = format!("{}{}", server.uri(), LOGO);
        let cancel = CancellationToken::new();

        h.cache.get_bytes(&url, &cancel).await.unwrap();
        assert!(!h.cache.is_stale(&url, &cancel).await.unwrap());
        assert!(!h.cache.is_stale("https://never.example.com/assets/x.png", &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn invalidate_and_clear() {
        let server = MockServer::start().await;
        mount_asset(&server, LOGO, "logo", "\"v1\"", 2).await;
        mount_asset(&server, "/assets/img/bg.png", "bg", "\"b1\"", 1).await;
        let h = harness(&[server.uri()], 8);
        let logo = format!("{}{}", server.uri(), LOGO);
        let bg = format!("{}/assets/img/bg.png", server.uri());
        let cancel = CancellationToken::new();

        h.cache.get_bytes(&logo, &cancel).await.unwrap();
        assert!(h.cache.invalidate(&logo).await);
        assert!(!h.cache.is_cached(&logo).await);
        assert!(!h.cache.invalidate(&logo).await, "missing key is a no-op");

        h.cache.get_bytes(&logo, &cancel).await.unwrap();
        h.cache.get_bytes(&bg, &cancel).await.unwrap();
        assert_eq!(h.cache.get_cache_stats().await.entry_count, 2);

        let report = h.cache.clear_cache().await;
        assert_eq!(report.removed, 2);
        assert!(!h.cache.is_cached(&logo).await);
        assert!(!h.cache.is_cached(&bg).await);
        assert_eq!(h.cache.get_cache_stats().await, CacheStats::default());
    }

    #[tokio::test]
    async fn hot_tier_evicts_least_recent_but_disk_keeps_all() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x"))
            .mount(&server)
            .await;
        let h = harness(&[server.uri()], 2);
        let cancel = CancellationToken::new();
        let url = |name: &str| format!("{}/assets/{}", server.uri(), name);

        h.cache.get_bytes(&url("a.png"), &cancel).await.unwrap();
        h.cache.get_bytes(&url("b.png"), &cancel).await.unwrap();
        h.cache.get_bytes(&url("a.png"), &cancel).await.unwrap();
        h.cache.get_bytes(&url("c.png"), &cancel).await.unwrap();

        let hot = &h.cache.inner.hot;
        assert!(hot.contains("assets/a.png"));
        assert!(!hot.contains("assets/b.png"));
        assert!(hot.contains("assets/c.png"));
        assert!(h.cache.is_cached(&url("b.png")).await);

        let stats = h.cache.get_cache_stats().await;
        assert_eq!(stats.entry_count, 3);
        assert_eq!(stats.hot_count, 2);
    }

    #[tokio::test]
    async fn data_uri_uses_extension_mime() {
        let server = MockServer::start().await;
        mount_asset(&server, LOGO, "hi", "\"v1\"", 1).await;
        let h = harness(&[server.uri()], 8);
        let url = format!("{}{}", server.uri(), LOGO);

        let uri = h
            .cache
            .get_as_data_uri(&url, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(uri, "data:image/png;base64,aGk=");
    }

    #[test]
    fn mime_table() {
        assert_eq!(mime_for("https://x.example.com/a.JPG?v=1"), "image/jpeg");
        assert_eq!(mime_for("https://x.example.com/a.svg"), "image/svg+xml");
        assert_eq!(mime_for("https://x.example.com/pack.7z"), "application/x-7z-compressed");
        assert_eq!(mime_for("https://x.example.com/blob"), "application/octet-stream");
    }

    #[tokio::test]
    async fn preload_skips_cached_and_duplicates() {
        let server = MockServer::start().await;
        mount_asset(&server, "/assets/a.png", "a", "\"a\"", 1).await;
        mount_asset(&server, "/assets/b.png", "b", "\"b\"", 1).await;
        mount_asset(&server, "/assets/c.png", "c", "\"c\"", 1).await;
        let h = harness(&[server.uri()], 8);
        let cancel = CancellationToken::new();
        let url = |name: &str| format!("{}/assets/{}", server.uri(), name);

        h.cache.get_bytes(&url("a.png"), &cancel).await.unwrap();

        let urls = vec![url("a.png"), url("b.png"), url("b.png"), url("c.png"), url("c.png")];
        let mut reports = Vec::new();
        let summary = h
            .cache
            .preload_many(&urls, |p| reports.push(p), &cancel)
            .await;

        assert_eq!(summary.downloaded, 2);
        assert_eq!(summary.skipped, 3);
        assert_eq!(summary.failed, 0);
        assert!(!summary.cancelled);
        assert_eq!(reports.len(), 5);
        assert_eq!(reports.last().map(|p| p.completed), Some(5));
        assert!(reports.iter().all(|p| p.total == 5));
    }

    #[tokio::test]
    async fn preload_counts_failures() {
        let server = MockServer::start().await;
        mount_asset(&server, "/assets/ok.png", "ok", "\"ok\"", 1).await;
        Mock::given(method("GET"))
            .and(path("/assets/missing.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let h = harness(&[server.uri()], 8);
        let urls = [
            format!("{}/assets/ok.png", server.uri()),
            format!("{}/assets/missing.png", server.uri()),
        ];

        let summary = h
            .cache
            .preload_many(&urls, |_| {}, &CancellationToken::new())
            .await;
        assert_eq!(summary.downloaded, 1);
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn preload_respects_concurrency_gate() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("x")
                    .set_delay(Duration::from_millis(100)),
            )
            .mount(&server)
            .await;
        let h = harness(&[server.uri()], 16);
        let urls: Vec<String> = (0..8)
            .map(|i| format!("{}/assets/{}.png", server.uri(), i))
            .collect();

        let started = std::time::Instant::now();
        let summary = h
            .cache
            .preload_many(&urls, |_| {}, &CancellationToken::new())
            .await;

        // Gate of 4: eight 100ms fetches need at least two waves
        assert_eq!(summary.downloaded, 8);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn cancelled_preload_dispatches_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x"))
            .expect(0)
            .mount(&server)
            .await;
        let h = harness(&[server.uri()], 8);
        let urls = [format!("{}/assets/a.png", server.uri())];
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = h.cache.preload_many(&urls, |_| {}, &cancel).await;
        assert!(summary.cancelled);
        assert_eq!(summary.downloaded + summary.skipped + summary.failed, 0);
    }

    #[tokio::test]
    async fn refresh_refetches_only_stale_entries() {
        let server = MockServer::start().await;
        mount_asset(&server, "/assets/stale.png", "old", "\"s1\"", 2).await;
        mount_asset(&server, "/assets/fresh.png", "same", "\"f1\"", 1).await;
        Mock::given(method("HEAD"))
            .and(path("/assets/stale.png"))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"s2\""))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/assets/fresh.png"))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"f1\""))
            .mount(&server)
            .await;
        let h = harness(&[server.uri()], 8);
        let cancel = CancellationToken::new();
        let stale = format!("{}/assets/stale.png", server.uri());
        let fresh = format!("{}/assets/fresh.png", server.uri());
        let uncached = format!("{}/assets/never.png", server.uri());

        h.cache.get_bytes(&stale, &cancel).await.unwrap();
        h.cache.get_bytes(&fresh, &cancel).await.unwrap();

        let mut reports = Vec::new();
        let summary = h
            .cache
            .refresh_stale(&[&stale, &fresh, &uncached], |p| reports.push(p), &cancel)
            .await;

        assert_eq!(summary.refreshed, 1);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(reports.len(), 3);
        assert!(h.cache.is_cached(&stale).await);
    }
}
