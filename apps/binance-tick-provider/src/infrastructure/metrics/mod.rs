//! Prometheus Metrics Module
//!
//! Exposes tick-provider metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Cache**: Hour cache hits and misses
//! - **History**: REST fetches, retries, trades fetched and rate-limit weight
//! - **Providers**: Stored providers, failures, evictions and live feeds
//! - **Ticks**: Ticks written and hour load latency
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Later calls return the handle installed by the first one.
///
/// # Errors
///
/// Returns an error if the global recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Cache
    describe_counter!(
        "binance_ticks_cache_lookups_total",
        "Hour cache lookups by result"
    );

    // History
    describe_counter!(
        "binance_ticks_history_fetches_total",
        "Historical trade fetches by outcome"
    );
    describe_counter!(
        "binance_ticks_history_retries_total",
        "REST requests retried after a transient failure"
    );
    describe_counter!(
        "binance_ticks_trades_fetched_total",
        "Aggregate trades received from the REST API"
    );
    describe_gauge!(
        "binance_ticks_rest_used_weight",
        "Request weight used in the current exchange window"
    );

    // Providers
    describe_gauge!(
        "binance_ticks_providers",
        "Providers held by each store"
    );
    describe_gauge!(
        "binance_ticks_live_feeds",
        "Open live aggregate-trade subscriptions"
    );
    describe_counter!(
        "binance_ticks_provider_failures_total",
        "Providers disposed after a failure"
    );
    describe_counter!(
        "binance_ticks_contiguity_violations_total",
        "Composite providers rejected for non-contiguous trade ids"
    );
    describe_counter!(
        "binance_ticks_providers_evicted_total",
        "Providers evicted by the collector"
    );

    // Ticks
    describe_counter!(
        "binance_ticks_written_total",
        "Ticks appended to provider streams"
    );
    describe_histogram!(
        "binance_ticks_hour_load_seconds",
        "Time to load one hour of ticks"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Metric label for the kind of provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// One cached hour.
    Hour,
    /// Current hour plus live feed.
    Live,
    /// Stitched request window.
    Composite,
}

impl ProviderKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Live => "live",
            Self::Composite => "composite",
        }
    }
}

/// Where an hour's ticks came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HourSource {
    /// Local cache.
    Cache,
    /// Exchange REST API.
    Exchange,
}

impl HourSource {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Exchange => "exchange",
        }
    }
}

/// Record an hour cache lookup.
pub fn record_cache_lookup(hit: bool) {
    counter!(
        "binance_ticks_cache_lookups_total",
        "result" => if hit { "hit" } else { "miss" }
    )
    .increment(1);
}

/// Record a historical fetch and the number of trades it returned.
pub fn record_history_fetch(success: bool, trades: usize) {
    counter!(
        "binance_ticks_history_fetches_total",
        "outcome" => if success { "ok" } else { "error" }
    )
    .increment(1);
    counter!("binance_ticks_trades_fetched_total").increment(trades as u64);
}

/// Record a retried REST request.
pub fn record_history_retry(reason: &str) {
    counter!(
        "binance_ticks_history_retries_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record the exchange-reported used request weight.
pub fn set_rest_used_weight(weight: f64) {
    gauge!("binance_ticks_rest_used_weight").set(weight);
}

/// Update the number of providers a store holds.
pub fn set_store_size(store: &'static str, count: f64) {
    gauge!("binance_ticks_providers", "store" => store).set(count);
}

/// Adjust the number of open live feeds.
pub fn adjust_live_feeds(delta: f64) {
    gauge!("binance_ticks_live_feeds").increment(delta);
}

/// Record a provider disposed after a failure.
pub fn record_provider_failure(kind: ProviderKind) {
    counter!(
        "binance_ticks_provider_failures_total",
        "provider" => kind.as_str()
    )
    .increment(1);
}

/// Record a rejected composite.
pub fn record_contiguity_violation() {
    counter!("binance_ticks_contiguity_violations_total").increment(1);
}

/// Record providers evicted from a store.
pub fn record_evictions(store: &'static str, count: u64) {
    counter!("binance_ticks_providers_evicted_total", "store" => store).increment(count);
}

/// Record ticks appended to a provider stream.
pub fn record_ticks_written(kind: ProviderKind, count: u64) {
    counter!("binance_ticks_written_total", "provider" => kind.as_str()).increment(count);
}

/// Record how long an hour took to load.
pub fn record_hour_load(source: HourSource, duration: Duration) {
    histogram!(
        "binance_ticks_hour_load_seconds",
        "source" => source.as_str()
    )
    .record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_kind_as_str() {
        assert_eq!(ProviderKind::Hour.as_str(), "hour");
        assert_eq!(ProviderKind::Live.as_str(), "live");
        assert_eq!(ProviderKind::Composite.as_str(), "composite");
    }

    #[test]
    fn hour_source_as_str() {
        assert_eq!(HourSource::Cache.as_str(), "cache");
        assert_eq!(HourSource::Exchange.as_str(), "exchange");
    }

    #[test]
    fn recording_without_recorder_is_a_noop() {
        record_cache_lookup(true);
        record_history_fetch(false, 0);
        record_ticks_written(ProviderKind::Live, 3);
        record_hour_load(HourSource::Cache, Duration::from_millis(5));
    }
}
