//! Single-attempt HTTP primitives over the shared [`reqwest::Client`].
//!
//! Both helpers apply a per-request timeout, race the request against a
//! [`CancellationToken`], and pick out the two validation headers used for
//! staleness checks: `ETag` (content version) and `Last-Modified` (content
//! modification).

use crate::error::{MirrorError, Result};
use bytes::Bytes;
use reqwest::header::{ETAG, HeaderMap, HeaderName, LAST_MODIFIED};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Content-change indicators reported by an origin.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validators {
    /// Content-version indicator (`ETag`)
    pub etag: Option<String>,
    /// Content-modification indicator (`Last-Modified`)
    pub last_modified: Option<String>,
}

impl Validators {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let read = |name: HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        Self {
            etag: read(ETAG),
            last_modified: read(LAST_MODIFIED),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }

    /// True when an indicator present on both sides differs.
    ///
    /// Indicators missing on either side are not compared, so two empty sets
    /// never count as changed.
    pub fn differs_from(&self, other: &Validators) -> bool {
        let changed = |a: &Option<String>, b: &Option<String>| match (a, b) {
            (Some(a), Some(b)) => a != b,
            _ => false,
        };
        changed(&self.etag, &other.etag) || changed(&self.last_modified, &other.last_modified)
    }
}

/// A downloaded, non-empty payload with its validators.
#[derive(Clone, Debug)]
pub struct Payload {
    pub bytes: Bytes,
    pub validators: Validators,
}

/// GET `url` once, returning the body when the status is 2xx and the body is
/// non-empty.
///
/// # Errors
///
/// [`MirrorError::Cancelled`] if `cancel` fires first, [`MirrorError::Timeout`]
/// when `timeout` elapses, [`MirrorError::Status`] for non-2xx responses and
/// [`MirrorError::EmptyBody`] for a zero-length body.
pub async fn get_payload(
    client: &Client,
    url: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Payload> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(MirrorError::Cancelled),
        result = get_once(client, url, timeout) => result,
    }
}

async fn get_once(client: &Client, url: &str, timeout: Duration) -> Result<Payload> {
    let response = send_checked(client.get(url).timeout(timeout), url).await?;
    let validators = Validators::from_headers(response.headers());
    let bytes = response.bytes().await.map_err(|e| classify(e, url))?;

    if bytes.is_empty() {
        return Err(MirrorError::EmptyBody(url.to_string()));
    }

    debug!("GET {} -> {} bytes", url, bytes.len());
    Ok(Payload { bytes, validators })
}

/// HEAD `url` once and return its validators.
///
/// # Errors
///
/// Same cancellation, timeout and status errors as [`get_payload`].
pub async fn head_validators(
    client: &Client,
    url: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Validators> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(MirrorError::Cancelled),
        result = send_checked(client.head(url).timeout(timeout), url) => {
            result.map(|response| Validators::from_headers(response.headers()))
        }
    }
}

async fn send_checked(request: reqwest::RequestBuilder, url: &str) -> Result<Response> {
    let response = request.send().await.map_err(|e| classify(e, url))?;
    let status = response.status();
    if !status.is_success() {
        return Err(MirrorError::Status {
            url: url.to_string(),
            status,
        });
    }
    Ok(response)
}

fn classify(err: reqwest::Error, url: &str) -> MirrorError {
    if err.is_timeout() {
        MirrorError::Timeout(url.to_string())
    } else {
        MirrorError::Http(err)
    }
}
