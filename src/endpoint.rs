//! Endpoints and resource-path rewriting.
//!
//! A resource path is provider-agnostic (`assets/img/logo.png?v=3`); an
//! [`Endpoint`] turns it into a full URL. Full URLs pointing at any mirror are
//! mapped back to their resource path by locating the marker segment.

use crate::config::Config;
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// One distribution provider, identified by its base URL.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Endpoint(String);

impl Endpoint {
    /// Create an endpoint; trailing slashes on the base are dropped.
    pub fn new(base_url: impl Into<String>) -> Self {
        let base = base_url.into();
        Self(base.trim_end_matches('/').to_string())
    }

    pub fn base_url(&self) -> &str {
        &self.0
    }

    /// Join a resource path onto this endpoint's base URL.
    pub fn resolve(&self, resource_path: &str) -> String {
        format!("{}/{}", self.0, resource_path.trim_start_matches('/'))
    }

    /// Provider family used for aggregate counters: the host name, or the
    /// whole base when it does not parse.
    pub fn family(&self) -> String {
        Url::parse(&self.0)
            .ok()
            .and_then(|u| u.host_str().map(String::from))
            .unwrap_or_else(|| self.0.clone())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.base_url())
    }
}

/// Candidate endpoints in configuration-declared order.
///
/// The primary provider, when configured and enabled, comes first. Duplicate
/// base URLs are collapsed.
pub fn configured_endpoints(config: &Config) -> Vec<Endpoint> {
    let mut endpoints: Vec<Endpoint> = Vec::new();

    let primary = config
        .primary_endpoint
        .iter()
        .filter(|_| config.primary_enabled);

    for base in primary.chain(config.endpoints.iter()) {
        let endpoint = Endpoint::new(base.as_str());
        if !endpoints.contains(&endpoint) {
            endpoints.push(endpoint);
        }
    }

    endpoints
}

/// Recover the canonical resource path from a full URL.
///
/// Returns everything from the marker segment onwards (query included), or
/// `None` when the URL does not contain `/{marker}/`. A value that is not an
/// absolute URL is treated as a resource path already.
pub fn canonical_path(url: &str, marker: &str) -> Option<String> {
    if !url.contains("://") {
        let path = url.trim_start_matches('/');
        return (!path.is_empty()).then(|| path.to_string());
    }

    let needle = format!("/{}/", marker.trim_matches('/'));
    url.find(&needle).map(|idx| url[idx + 1..].to_string())
}

/// Whether a URL belongs to the mirrored content family.
pub fn is_managed(url: &str, marker: &str) -> bool {
    url.contains("://") && canonical_path(url, marker).is_some()
}

/// Derive the cache key for a URL or resource path.
///
/// Managed URLs collapse onto their canonical path so the same asset served by
/// different mirrors shares one entry. Query and fragment are stripped.
pub fn cache_key(url: &str, marker: &str) -> String {
    let base = if is_managed(url, marker) {
        canonical_path(url, marker).unwrap_or_else(|| url.to_string())
    } else {
        url.to_string()
    };
    strip_query(&base).to_string()
}

/// Strip any `?query` or `#fragment` suffix.
pub fn strip_query(url: &str) -> &str {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    &url[..end]
}

/// Lower-cased file extension of the URL's last path segment, if any.
pub fn file_extension(url: &str) -> Option<String> {
    let path = strip_query(url);
    let last = path.rsplit('/').next()?;
    let (stem, ext) = last.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
