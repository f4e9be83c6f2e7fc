//! Prometheus metrics for the SEO edge

use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Metrics for page rewriting, count lookups, the data endpoint and the
/// client cache agent
#[derive(Clone)]
pub struct SeoMetrics {
    registry: Registry,

    /// Edge page outcomes (outcome: transformed, passthrough, recovered)
    pub page_outcomes_total: Arc<IntCounterVec>,

    /// Passthrough reasons (reason: not_html, skip, status, encoded, ...)
    pub passthrough_reasons_total: Arc<IntCounterVec>,

    /// Elements left unchanged after a mutation failure
    pub rewrite_element_errors_total: Arc<IntCounter>,

    /// Count lookups by result (result: hit, unknown, skipped)
    pub count_lookups_total: Arc<IntCounterVec>,

    /// Duration of count lookups
    pub count_lookup_duration_seconds: Arc<HistogramVec>,

    /// Data endpoint responses by status code
    pub records_responses_total: Arc<IntCounterVec>,

    /// Origin server responses by route and status
    pub origin_responses_total: Arc<IntCounterVec>,

    /// Client cache agent events (event: cache_hit, network, fallback, write_failed)
    pub client_cache_events_total: Arc<CounterVec>,
}

impl SeoMetrics {
    /// Create metrics on a private registry
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new())
    }

    /// Create metrics on the given registry
    pub fn with_registry(registry: Registry) -> Result<Self, prometheus::Error> {
        let page_outcomes_total = IntCounterVec::new(
            Opts::new(
                "pingora_seo_page_outcomes_total",
                "List page responses by rewrite outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(page_outcomes_total.clone()))?;

        let passthrough_reasons_total = IntCounterVec::new(
            Opts::new(
                "pingora_seo_passthrough_reasons_total",
                "List page responses passed through, by reason",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(passthrough_reasons_total.clone()))?;

        let rewrite_element_errors_total = IntCounter::new(
            "pingora_seo_rewrite_element_errors_total",
            "Matched elements left unchanged because mutating them failed",
        )?;
        registry.register(Box::new(rewrite_element_errors_total.clone()))?;

        let count_lookups_total = IntCounterVec::new(
            Opts::new(
                "pingora_seo_count_lookups_total",
                "Record count lookups by result",
            ),
            &["result"],
        )?;
        registry.register(Box::new(count_lookups_total.clone()))?;

        let count_lookup_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "pingora_seo_count_lookup_duration_seconds",
                "Duration of record count lookups in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 8.0]),
            &["result"],
        )?;
        registry.register(Box::new(count_lookup_duration_seconds.clone()))?;

        let records_responses_total = IntCounterVec::new(
            Opts::new(
                "pingora_seo_records_responses_total",
                "Data endpoint responses by status code",
            ),
            &["status"],
        )?;
        registry.register(Box::new(records_responses_total.clone()))?;

        let origin_responses_total = IntCounterVec::new(
            Opts::new(
                "pingora_seo_origin_responses_total",
                "Origin server responses by route and status code",
            ),
            &["route", "status"],
        )?;
        registry.register(Box::new(origin_responses_total.clone()))?;

        let client_cache_events_total = CounterVec::new(
            Opts::new(
                "pingora_seo_client_cache_events_total",
                "Client cache agent events",
            ),
            &["class", "event"],
        )?;
        registry.register(Box::new(client_cache_events_total.clone()))?;

        Ok(Self {
            registry,
            page_outcomes_total: Arc::new(page_outcomes_total),
            passthrough_reasons_total: Arc::new(passthrough_reasons_total),
            rewrite_element_errors_total: Arc::new(rewrite_element_errors_total),
            count_lookups_total: Arc::new(count_lookups_total),
            count_lookup_duration_seconds: Arc::new(count_lookup_duration_seconds),
            records_responses_total: Arc::new(records_responses_total),
            origin_responses_total: Arc::new(origin_responses_total),
            client_cache_events_total: Arc::new(client_cache_events_total),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record the outcome of one list page response
    pub fn record_page_outcome(&self, outcome: &str, passthrough_reason: Option<&str>) {
        self.page_outcomes_total.with_label_values(&[outcome]).inc();
        if let Some(reason) = passthrough_reason {
            self.passthrough_reasons_total
                .with_label_values(&[reason])
                .inc();
        }
    }

    pub fn record_element_errors(&self, count: usize) {
        self.rewrite_element_errors_total.inc_by(count as u64);
    }

    /// Record a count lookup; `None` counts as "unknown"
    pub fn record_count_lookup(&self, count: Option<usize>, duration_secs: f64) {
        let result = if count.is_some() { "hit" } else { "unknown" };
        self.count_lookups_total.with_label_values(&[result]).inc();
        self.count_lookup_duration_seconds
            .with_label_values(&[result])
            .observe(duration_secs);
    }

    pub fn record_count_skipped(&self) {
        self.count_lookups_total.with_label_values(&["skipped"]).inc();
    }

    pub fn record_records_response(&self, status: u16) {
        let status = status.to_string();
        self.records_responses_total
            .with_label_values(&[status.as_str()])
            .inc();
    }

    pub fn record_origin_response(&self, route: &str, status: u16) {
        let status = status.to_string();
        self.origin_responses_total
            .with_label_values(&[route, status.as_str()])
            .inc();
    }

    pub fn record_client_cache_event(&self, class: &str, event: &str) {
        self.client_cache_events_total
            .with_label_values(&[class, event])
            .inc();
    }

    /// Render every metric in the Prometheus text format
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = SeoMetrics::new().unwrap();
        metrics.record_page_outcome("transformed", None);
        metrics.record_page_outcome("passthrough", Some("not_html"));
        assert_eq!(
            metrics
                .page_outcomes_total
                .with_label_values(&["passthrough"])
                .get(),
            1
        );
        assert_eq!(
            metrics
                .passthrough_reasons_total
                .with_label_values(&["not_html"])
                .get(),
            1
        );
    }

    #[test]
    fn test_independent_registries() {
        // Two instances must not collide on registration
        let a = SeoMetrics::new().unwrap();
        let b = SeoMetrics::new().unwrap();
        a.record_records_response(304);
        assert_eq!(
            b.records_responses_total.with_label_values(&["304"]).get(),
            0
        );
    }

    #[test]
    fn test_export() {
        let metrics = SeoMetrics::new().unwrap();
        metrics.record_count_lookup(Some(12), 0.2);
        metrics.record_count_lookup(None, 8.0);
        metrics.record_element_errors(2);
        let text = metrics.export().unwrap();
        assert!(text.contains("pingora_seo_count_lookups_total{result=\"hit\"} 1"));
        assert!(text.contains("pingora_seo_count_lookups_total{result=\"unknown\"} 1"));
        assert!(text.contains("pingora_seo_rewrite_element_errors_total 2"));
    }
}
