use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: Outcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Complete,
    Partial,
    Failed,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the resolver.
pub struct Metrics {
    // -- evaluation --
    pub evaluations_total: Family<OutcomeLabels, Counter>,
    pub evaluations_skipped: Counter,
    pub evaluation_duration_seconds: Histogram,
    pub last_evaluation_timestamp_seconds: Gauge,

    // -- resolution --
    pub process_fetch_failures: Counter,
    pub cache_write_failures: Counter,
    pub resolved_records: Gauge,

    // -- cache reads --
    pub cache_hits: Counter,
    pub cache_misses: Counter,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let evaluations_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "namecache_evaluations",
            "Completed evaluation cycles by outcome",
            evaluations_total.clone(),
        );

        let evaluations_skipped = Counter::default();
        registry.register(
            "namecache_evaluation_skipped",
            "Evaluation triggers rejected because a cycle was already running",
            evaluations_skipped.clone(),
        );

        let evaluation_duration_seconds = Histogram::new(exponential_buckets(0.5, 2.0, 12));
        registry.register(
            "namecache_evaluation_duration_seconds",
            "Wall-clock duration of evaluation cycles",
            evaluation_duration_seconds.clone(),
        );

        let last_evaluation_timestamp_seconds: Gauge = Gauge::default();
        registry.register(
            "namecache_last_evaluation_timestamp_seconds",
            "Unix time at which the last evaluation cycle finished",
            last_evaluation_timestamp_seconds.clone(),
        );

        let process_fetch_failures = Counter::default();
        registry.register(
            "namecache_process_fetch_failures",
            "Process record or owner lookups that failed",
            process_fetch_failures.clone(),
        );

        let cache_write_failures = Counter::default();
        registry.register(
            "namecache_cache_write_failures",
            "Resolved records that could not be written to the cache",
            cache_write_failures.clone(),
        );

        let resolved_records: Gauge = Gauge::default();
        registry.register(
            "namecache_resolved_records",
            "Records written by the last evaluation cycle",
            resolved_records.clone(),
        );

        let cache_hits = Counter::default();
        registry.register(
            "namecache_cache_hits",
            "Record lookups served from the cache",
            cache_hits.clone(),
        );

        let cache_misses = Counter::default();
        registry.register(
            "namecache_cache_misses",
            "Record lookups that found no live entry",
            cache_misses.clone(),
        );

        Self {
            evaluations_total,
            evaluations_skipped,
            evaluation_duration_seconds,
            last_evaluation_timestamp_seconds,
            process_fetch_failures,
            cache_write_failures,
            resolved_records,
            cache_hits,
            cache_misses,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`crate::AppState`].
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all resolver metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_registered_metrics() {
        let metrics = MetricsRegistry::new();
        metrics
            .metrics
            .evaluations_total
            .get_or_create(&OutcomeLabels {
                outcome: Outcome::Partial,
            })
            .inc();
        metrics.metrics.cache_hits.inc();

        let text = metrics.encode().unwrap();
        assert!(text.contains("namecache_evaluations_total{outcome=\"Partial\"} 1"));
        assert!(text.contains("namecache_cache_hits_total 1"));
        assert!(text.contains("namecache_resolved_records 0"));
    }
}
