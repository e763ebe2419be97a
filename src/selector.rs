//! Endpoint prober and selector.
//!
//! Measures latency (HEAD on a small well-known resource) and throughput (GET
//! on a slightly larger one) for every configured endpoint, ranks them and
//! persists the ranking as a timestamped JSON document. A persisted ranking
//! younger than the freshness window is adopted without probing.

use crate::config::Config;
use crate::endpoint::{Endpoint, configured_endpoints};
use crate::metrics;
use crate::transport::{get_payload, head_validators};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Latency recorded for an endpoint that could not be reached.
pub const UNREACHABLE_LATENCY_MS: u64 = 99_999;

/// File name of the persisted ranking inside the data directory.
pub const RANKING_FILE: &str = "endpoint_ranking.json";

/// Outcome of probing one endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub endpoint: Endpoint,
    pub reachable: bool,
    pub latency_ms: u64,
    /// Estimated throughput in KB/s (0 when unknown)
    pub throughput_kbps: f64,
    pub measured_at: DateTime<Utc>,
}

impl ProbeResult {
    pub fn unreachable(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            reachable: false,
            latency_ms: UNREACHABLE_LATENCY_MS,
            throughput_kbps: 0.0,
            measured_at: Utc::now(),
        }
    }

    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }
}

/// Persisted form of a ranking.
#[derive(Debug, Serialize, Deserialize)]
struct RankingDocument {
    measured_at: DateTime<Utc>,
    results: Vec<ProbeResult>,
}

/// Sort probe results into ranking order.
///
/// Reachable before unreachable, then ascending latency, then descending
/// throughput, then fewer reported failures. The sort is stable, so complete
/// ties keep their configuration order.
pub fn rank(results: &mut [ProbeResult], failures: impl Fn(&Endpoint) -> u32) {
    results.sort_by(|a, b| {
        b.reachable
            .cmp(&a.reachable)
            .then(a.latency_ms.cmp(&b.latency_ms))
            .then(
                b.throughput_kbps
                    .partial_cmp(&a.throughput_kbps)
                    .unwrap_or(Ordering::Equal),
            )
            .then(failures(&a.endpoint).cmp(&failures(&b.endpoint)))
    });
}

/// Probe resources, timeouts and persistence knobs.
#[derive(Clone, Debug)]
pub struct ProbeSettings {
    pub probe_path: String,
    pub throughput_path: String,
    pub probe_timeout: Duration,
    pub throughput_timeout: Duration,
    pub ranking_ttl: Duration,
    pub failure_threshold: u32,
    pub data_dir: PathBuf,
}

impl From<&Config> for ProbeSettings {
    fn from(config: &Config) -> Self {
        Self {
            probe_path: config.probe_path.clone(),
            throughput_path: config.throughput_path.clone(),
            probe_timeout: config.probe_timeout,
            throughput_timeout: config.throughput_timeout,
            ranking_ttl: config.ranking_ttl,
            failure_threshold: config.failure_threshold,
            data_dir: config.data_dir.clone(),
        }
    }
}

struct SelectorInner {
    client: Client,
    configured: Vec<Endpoint>,
    settings: ProbeSettings,
    /// `None` until initialized, and while a forced retest is running
    ranking: RwLock<Option<Vec<ProbeResult>>>,
    /// Held for the duration of a probing pass
    probe_lock: Mutex<()>,
    failures: DashMap<Endpoint, u32>,
    retest_pending: AtomicBool,
}

/// Maintains a persisted ranking of endpoints by health and speed.
///
/// Cheap to clone; clones share the same ranking.
#[derive(Clone)]
pub struct EndpointSelector {
    inner: Arc<SelectorInner>,
}

impl EndpointSelector {
    /// Build a selector over the endpoints named in `config`.
    pub fn new(client: Client, config: &Config) -> Self {
        Self::with_endpoints(client, configured_endpoints(config), ProbeSettings::from(config))
    }

    pub fn with_endpoints(client: Client, endpoints: Vec<Endpoint>, settings: ProbeSettings) -> Self {
        Self {
            inner: Arc::new(SelectorInner {
                client,
                configured: endpoints,
                settings,
                ranking: RwLock::new(None),
                probe_lock: Mutex::new(()),
                failures: DashMap::new(),
                retest_pending: AtomicBool::new(false),
            }),
        }
    }

    /// Load a fresh persisted ranking or run a probing pass.
    ///
    /// Idempotent and safe to call concurrently: only the first caller probes,
    /// later callers wait for it and then return.
    pub async fn initialize(&self) {
        let _guard = self.inner.probe_lock.lock().await;
        if self.is_initialized() {
            return;
        }

        if let Some(results) = self.load_fresh_ranking().await {
            info!(
                "Adopted persisted endpoint ranking ({} endpoints)",
                results.len()
            );
            self.store_ranking(results);
            return;
        }

        self.probe_all().await;
    }

    /// Current ranking, or configuration order when never initialized.
    pub fn get_ranked_endpoints(&self) -> Vec<Endpoint> {
        match self.read_ranking().as_ref() {
            Some(results) => results.iter().map(|r| r.endpoint.clone()).collect(),
            None => self.inner.configured.clone(),
        }
    }

    /// Probe results behind the current ranking (empty when not initialized).
    pub fn probe_results(&self) -> Vec<ProbeResult> {
        self.read_ranking().as_ref().cloned().unwrap_or_default()
    }

    pub fn is_initialized(&self) -> bool {
        self.read_ranking().is_some()
    }

    /// Discard the current ranking and block until a new probing pass completes.
    pub async fn force_retest(&self) {
        let _guard = self.inner.probe_lock.lock().await;
        self.clear_ranking();
        self.probe_all().await;
    }

    /// Record a failure signal against `endpoint`.
    ///
    /// Never re-ranks synchronously. Once the endpoint reaches the configured
    /// failure threshold, one background retest is spawned.
    pub fn report_failure(&self, endpoint: &Endpoint) {
        let count = {
            let mut entry = self.inner.failures.entry(endpoint.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        debug!("Failure #{} reported for endpoint {}", count, endpoint);

        let threshold = self.inner.settings.failure_threshold;
        if threshold == 0 || count < threshold {
            return;
        }
        if self.inner.retest_pending.swap(true, AtomicOrdering::AcqRel) {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                info!(
                    "Endpoint {} reached {} failures, re-probing in background",
                    endpoint, count
                );
                let selector = self.clone();
                handle.spawn(async move {
                    selector.force_retest().await;
                    selector
                        .inner
                        .retest_pending
                        .store(false, AtomicOrdering::Release);
                });
            }
            Err(_) => {
                self.inner
                    .retest_pending
                    .store(false, AtomicOrdering::Release);
            }
        }
    }

    /// Clear the consecutive-failure count for `endpoint`.
    pub fn report_success(&self, endpoint: &Endpoint) {
        self.inner.failures.remove(endpoint);
    }

    pub fn failure_count(&self, endpoint: &Endpoint) -> u32 {
        self.inner.failures.get(endpoint).map(|c| *c).unwrap_or(0)
    }

    /// Location of the persisted ranking document.
    pub fn ranking_path(&self) -> PathBuf {
        self.inner.settings.data_dir.join(RANKING_FILE)
    }

    /// Run one probing pass over every configured endpoint in parallel.
    /// Caller must hold `probe_lock`.
    async fn probe_all(&self) {
        let started = Instant::now();
        let probes = self
            .inner
            .configured
            .iter()
            .map(|endpoint| self.probe_endpoint(endpoint.clone()));
        let mut results = join_all(probes).await;

        rank(&mut results, |endpoint| self.failure_count(endpoint));
        self.inner.failures.clear();

        let reachable = results.iter().filter(|r| r.reachable).count();
        info!(
            "Probed {} endpoints in {}ms ({} reachable)",
            results.len(),
            started.elapsed().as_millis(),
            reachable
        );
        metrics::record_probe_pass();

        self.persist(&results).await;
        self.store_ranking(results);
    }

    /// Probe a single endpoint. Never fails: errors become an unreachable result.
    async fn probe_endpoint(&self, endpoint: Endpoint) -> ProbeResult {
        let settings = &self.inner.settings;
        let cancel = CancellationToken::new();

        let probe_url = endpoint.resolve(&settings.probe_path);
        let started = Instant::now();
        if let Err(e) = head_validators(
            &self.inner.client,
            &probe_url,
            settings.probe_timeout,
            &cancel,
        )
        .await
        {
            warn!("Latency probe failed for {}: {}", endpoint, e);
            return ProbeResult::unreachable(endpoint);
        }
        let latency = started.elapsed();

        let throughput_url = endpoint.resolve(&settings.throughput_path);
        let started = Instant::now();
        let throughput_kbps = match get_payload(
            &self.inner.client,
            &throughput_url,
            settings.throughput_timeout,
            &cancel,
        )
        .await
        {
            Ok(payload) => {
                let secs = started.elapsed().as_secs_f64().max(0.001);
                payload.bytes.len() as f64 / 1024.0 / secs
            }
            Err(e) => {
                debug!("Throughput probe failed for {}: {}", endpoint, e);
                0.0
            }
        };

        debug!(
            "Probed {}: {}ms, {:.1} KB/s",
            endpoint,
            latency.as_millis(),
            throughput_kbps
        );

        ProbeResult {
            endpoint,
            reachable: true,
            latency_ms: u64::try_from(latency.as_millis()).unwrap_or(UNREACHABLE_LATENCY_MS),
            throughput_kbps,
            measured_at: Utc::now(),
        }
    }

    /// Read the persisted ranking if it exists and is within the freshness
    /// window, reconciled against the configured endpoint set.
    async fn load_fresh_ranking(&self) -> Option<Vec<ProbeResult>> {
        let path = self.ranking_path();
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!("No persisted ranking at {}: {}", path.display(), e);
                return None;
            }
        };

        let document: RankingDocument = match serde_json::from_slice(&raw) {
            Ok(doc) => doc,
            Err(e) => {
                warn!("Ignoring unreadable ranking {}: {}", path.display(), e);
                return None;
            }
        };

        let age = Utc::now().signed_duration_since(document.measured_at);
        let ttl = chrono::Duration::from_std(self.inner.settings.ranking_ttl).ok()?;
        if age >= ttl || age < chrono::Duration::zero() {
            info!("Persisted ranking expired ({}s old)", age.num_seconds());
            return None;
        }

        Some(reconcile(document.results, &self.inner.configured))
    }

    async fn persist(&self, results: &[ProbeResult]) {
        let document = RankingDocument {
            measured_at: Utc::now(),
            results: results.to_vec(),
        };
        if let Err(e) = write_document(&self.inner.settings.data_dir, &document).await {
            warn!("Failed to persist endpoint ranking: {}", e);
        }
    }

    fn store_ranking(&self, results: Vec<ProbeResult>) {
        let mut guard = self.inner.ranking.write().unwrap_or_else(|p| p.into_inner());
        *guard = Some(results);
    }

    fn clear_ranking(&self) {
        let mut guard = self.inner.ranking.write().unwrap_or_else(|p| p.into_inner());
        *guard = None;
    }

    fn read_ranking(&self) -> std::sync::RwLockReadGuard<'_, Option<Vec<ProbeResult>>> {
        self.inner.ranking.read().unwrap_or_else(|p| p.into_inner())
    }
}

/// Keep loaded results for endpoints still configured (first occurrence wins),
/// then append newly configured endpoints in configuration order.
fn reconcile(loaded: Vec<ProbeResult>, configured: &[Endpoint]) -> Vec<ProbeResult> {
    let mut results: Vec<ProbeResult> = Vec::with_capacity(configured.len());
    for result in loaded {
        let known = configured.contains(&result.endpoint);
        let duplicate = results.iter().any(|r| r.endpoint == result.endpoint);
        if known && !duplicate {
            results.push(result);
        }
    }
    for endpoint in configured {
        if !results.iter().any(|r| &r.endpoint == endpoint) {
            results.push(ProbeResult::unreachable(endpoint.clone()));
        }
    }
    results
}

async fn write_document(dir: &Path, document: &RankingDocument) -> crate::error::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let json = serde_json::to_vec_pretty(document)?;
    let target = dir.join(RANKING_FILE);
    let tmp = dir.join(format!("{RANKING_FILE}.tmp"));
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, &target).await?;
    Ok(())
}
