//! Fallback fetcher: resolve a resource path against ranked endpoints in turn.

use crate::endpoint::Endpoint;
use crate::error::MirrorError;
use crate::metrics;
use crate::selector::EndpointSelector;
use crate::transport::{Validators, get_payload};
use bytes::Bytes;
use dashmap::DashMap;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A payload obtained from one of the endpoints.
#[derive(Clone, Debug)]
pub struct FetchSuccess {
    pub bytes: Bytes,
    pub endpoint: Endpoint,
    /// Full URL that satisfied the request
    pub url: String,
    pub validators: Validators,
    /// Endpoints that failed before this one succeeded
    pub fallback_count: usize,
    pub elapsed: Duration,
}

/// Every candidate failed, or the request was cancelled or invalid.
#[derive(Debug)]
pub struct FetchFailure {
    /// Last error observed
    pub reason: MirrorError,
    pub fallback_count: usize,
    pub elapsed: Duration,
}

impl FetchFailure {
    pub fn is_cancelled(&self) -> bool {
        self.reason.is_cancelled()
    }
}

/// Snapshot of the fetcher's process-wide counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FetchStats {
    pub attempts: u64,
    pub failures: u64,
    /// Failed attempts that moved on to another endpoint
    pub fallbacks: u64,
    pub successes_by_family: HashMap<String, u64>,
}

impl FetchStats {
    pub fn total_successes(&self) -> u64 {
        self.successes_by_family.values().sum()
    }
}

/// Tries ranked endpoints strictly in order until one yields a non-empty payload.
pub struct FallbackFetcher {
    client: Client,
    selector: EndpointSelector,
    timeout: Duration,
    attempts: AtomicU64,
    failures: AtomicU64,
    fallbacks: AtomicU64,
    successes: DashMap<String, u64>,
}

impl FallbackFetcher {
    pub fn new(client: Client, selector: EndpointSelector, timeout: Duration) -> Self {
        Self {
            client,
            selector,
            timeout,
            attempts: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            successes: DashMap::new(),
        }
    }

    pub fn selector(&self) -> &EndpointSelector {
        &self.selector
    }

    /// Fetch `resource_path` from the first endpoint that serves it.
    ///
    /// Each failed attempt is reported to the selector before moving on.
    /// Cancellation stops the loop immediately and is reported as a failure
    /// whose [`FetchFailure::is_cancelled`] is true.
    pub async fn fetch(
        &self,
        resource_path: &str,
        cancel: &CancellationToken,
    ) -> Result<FetchSuccess, FetchFailure> {
        let started = Instant::now();
        let path = validate_path(resource_path).map_err(|reason| FetchFailure {
            reason,
            fallback_count: 0,
            elapsed: started.elapsed(),
        })?;

        let mut fallback_count = 0;
        let mut last_error = MirrorError::NoEndpoints;

        let ranked = self.selector.get_ranked_endpoints();
        let candidates = ranked.len();

        for (index, endpoint) in ranked.into_iter().enumerate() {
            if cancel.is_cancelled() {
                last_error = MirrorError::Cancelled;
                break;
            }

            match self.attempt(&endpoint, path, cancel).await {
                Ok((url, payload_bytes, validators)) => {
                    self.selector.report_success(&endpoint);
                    if fallback_count > 0 {
                        info!(
                            "Fetched {} from {} after {} fallback(s)",
                            path, endpoint, fallback_count
                        );
                    }
                    return Ok(FetchSuccess {
                        bytes: payload_bytes,
                        endpoint,
                        url,
                        validators,
                        fallback_count,
                        elapsed: started.elapsed(),
                    });
                }
                Err(MirrorError::Cancelled) => {
                    debug!("Fetch of {} cancelled at {}", path, endpoint);
                    last_error = MirrorError::Cancelled;
                    break;
                }
                Err(e) => {
                    warn!("Fetch of {} from {} failed: {}", path, endpoint, e);
                    self.selector.report_failure(&endpoint);
                    if index + 1 < candidates {
                        self.fallbacks.fetch_add(1, Ordering::Relaxed);
                        metrics::record_fallback(&endpoint.family());
                    }
                    fallback_count += 1;
                    last_error = e;
                }
            }
        }

        if !last_error.is_cancelled() {
            warn!(
                "All {} endpoint(s) failed for {}: {}",
                fallback_count, path, last_error
            );
        }

        Err(FetchFailure {
            reason: last_error,
            fallback_count,
            elapsed: started.elapsed(),
        })
    }

    /// Single attempt against the top-ranked endpoint only.
    ///
    /// Used for connectivity checks; failures are not reported to the selector.
    pub async fn fetch_from_primary(
        &self,
        resource_path: &str,
        cancel: &CancellationToken,
    ) -> Result<FetchSuccess, FetchFailure> {
        let started = Instant::now();
        let failure = |reason: MirrorError| FetchFailure {
            reason,
            fallback_count: 0,
            elapsed: started.elapsed(),
        };

        let path = validate_path(resource_path).map_err(failure)?;
        let endpoint = self
            .selector
            .get_ranked_endpoints()
            .into_iter()
            .next()
            .ok_or_else(|| failure(MirrorError::NoEndpoints))?;

        match self.attempt(&endpoint, path, cancel).await {
            Ok((url, bytes, validators)) => Ok(FetchSuccess {
                bytes,
                endpoint,
                url,
                validators,
                fallback_count: 0,
                elapsed: started.elapsed(),
            }),
            Err(e) => Err(failure(e)),
        }
    }

    pub fn stats(&self) -> FetchStats {
        FetchStats {
            attempts: self.attempts.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            successes_by_family: self
                .successes
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        }
    }

    pub fn reset_stats(&self) {
        self.attempts.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.fallbacks.store(0, Ordering::Relaxed);
        self.successes.clear();
    }

    /// One download attempt with counter bookkeeping.
    async fn attempt(
        &self,
        endpoint: &Endpoint,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<(String, Bytes, Validators), MirrorError> {
        let url = endpoint.resolve(path);
        let family = endpoint.family();

        self.attempts.fetch_add(1, Ordering::Relaxed);
        metrics::record_fetch_attempt(&family);

        match get_payload(&self.client, &url, self.timeout, cancel).await {
            Ok(payload) => {
                *self.successes.entry(family.clone()).or_insert(0) += 1;
                metrics::record_fetch_success(&family);
                Ok((url, payload.bytes, payload.validators))
            }
            Err(MirrorError::Cancelled) => Err(MirrorError::Cancelled),
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }
}

fn validate_path(resource_path: &str) -> Result<&str, MirrorError> {
    let path = resource_path.trim().trim_start_matches('/');
    if path.is_empty() {
        return Err(MirrorError::InvalidPath(resource_path.to_string()));
    }
    Ok(path)
}
