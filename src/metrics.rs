//! Counters emitted through the `metrics` facade.
//!
//! No recorder is installed by the library; hosts that want these numbers
//! install one (Prometheus, statsd, ...) at startup.

use metrics::counter;

/// One download attempt against an endpoint family.
pub fn record_fetch_attempt(family: &str) {
    counter!("mirrorcache_fetch_attempts_total", "family" => family.to_string()).increment(1);
}

pub fn record_fetch_success(family: &str) {
    counter!("mirrorcache_fetch_success_total", "family" => family.to_string()).increment(1);
}

/// A failed attempt that moved on to the next endpoint.
pub fn record_fallback(family: &str) {
    counter!("mirrorcache_fallbacks_total", "family" => family.to_string()).increment(1);
}

/// Served from a cache tier: `"hot"` or `"disk"`.
pub fn record_cache_hit(tier: &'static str) {
    counter!("mirrorcache_cache_hits_total", "tier" => tier).increment(1);
}

pub fn record_cache_miss() {
    counter!("mirrorcache_cache_misses_total").increment(1);
}

/// A caller attached to an already in-flight fetch.
pub fn record_coalesced_wait() {
    counter!("mirrorcache_coalesced_waits_total").increment(1);
}

pub fn record_probe_pass() {
    counter!("mirrorcache_probe_passes_total").increment(1);
}
