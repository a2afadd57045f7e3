//! Prometheus metrics for the gateway.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup. Every helper function is
//! a no-op if `init_metrics` was never called, so the core is always safe
//! to run — observability simply degrades gracefully.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `gateway_requests_total` | Counter | `outcome` |
//! | `gateway_provider_calls_total` | Counter | `provider`, `model` |
//! | `gateway_provider_latency_seconds` | Histogram | `provider` |
//! | `gateway_cost_usd_total` | Counter | `provider`, `model` |
//! | `gateway_cache_lookups_total` | Counter | `result` |
//! | `gateway_cascade_escalations_total` | Counter | — |
//! | `gateway_budget_percent_used` | Gauge | `period` |
//! | `gateway_errors_total` | Counter | `code` |

use crate::GatewayError;
use prometheus::{
    Counter, CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;
use std::time::Duration;

/// All gateway metrics, bundled for atomic one-time initialisation.
pub struct Metrics {
    /// Registry owning all descriptors.
    pub registry: Registry,
    /// Requests by terminal outcome.
    pub requests_total: CounterVec,
    /// Provider calls by provider and model.
    pub provider_calls: CounterVec,
    /// Provider call latency per provider.
    pub provider_latency: HistogramVec,
    /// Accumulated spend per provider and model.
    pub cost_usd: CounterVec,
    /// Cache lookups by result.
    pub cache_lookups: CounterVec,
    /// Cascade escalations.
    pub escalations: Counter,
    /// Budget utilisation per period.
    pub budget_percent: GaugeVec,
    /// Terminal errors by taxonomy code.
    pub errors_total: CounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn build_metrics() -> Result<Metrics, GatewayError> {
    let err = |e: prometheus::Error| GatewayError::Internal(format!("metrics init failed: {e}"));
    let registry = Registry::new();

    let requests_total = CounterVec::new(
        Opts::new("gateway_requests_total", "Requests by terminal outcome"),
        &["outcome"],
    )
    .map_err(err)?;
    registry.register(Box::new(requests_total.clone())).map_err(err)?;

    let provider_calls = CounterVec::new(
        Opts::new("gateway_provider_calls_total", "Provider calls by provider and model"),
        &["provider", "model"],
    )
    .map_err(err)?;
    registry.register(Box::new(provider_calls.clone())).map_err(err)?;

    let provider_latency = HistogramVec::new(
        HistogramOpts::new("gateway_provider_latency_seconds", "Provider call latency"),
        &["provider"],
    )
    .map_err(err)?;
    registry.register(Box::new(provider_latency.clone())).map_err(err)?;

    let cost_usd = CounterVec::new(
        Opts::new("gateway_cost_usd_total", "Accumulated spend in USD"),
        &["provider", "model"],
    )
    .map_err(err)?;
    registry.register(Box::new(cost_usd.clone())).map_err(err)?;

    let cache_lookups = CounterVec::new(
        Opts::new("gateway_cache_lookups_total", "Cache lookups by result"),
        &["result"],
    )
    .map_err(err)?;
    registry.register(Box::new(cache_lookups.clone())).map_err(err)?;

    let escalations = Counter::new("gateway_cascade_escalations_total", "Cascade escalations")
        .map_err(err)?;
    registry.register(Box::new(escalations.clone())).map_err(err)?;

    let budget_percent = GaugeVec::new(
        Opts::new("gateway_budget_percent_used", "Budget utilisation per period"),
        &["period"],
    )
    .map_err(err)?;
    registry.register(Box::new(budget_percent.clone())).map_err(err)?;

    let errors_total = CounterVec::new(
        Opts::new("gateway_errors_total", "Terminal errors by taxonomy code"),
        &["code"],
    )
    .map_err(err)?;
    registry.register(Box::new(errors_total.clone())).map_err(err)?;

    Ok(Metrics {
        registry,
        requests_total,
        provider_calls,
        provider_latency,
        cost_usd,
        cache_lookups,
        escalations,
        budget_percent,
        errors_total,
    })
}

/// Initialise the metrics bundle. A second call is a no-op.
pub fn init_metrics() -> Result<(), GatewayError> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    let bundle = build_metrics()?;
    // If another thread raced us the first one wins; both bundles carry
    // identical descriptors, so either outcome is correct.
    let _ = METRICS.set(bundle);
    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Helper functions (no-ops before init) ──────────────────────────────

/// Count a request by terminal outcome (`success`, `cache_hit`,
/// `budget_reject`, `error`).
pub fn inc_request(outcome: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.requests_total.get_metric_with_label_values(&[outcome]) {
            c.inc();
        }
    }
}

/// Count a provider call.
pub fn inc_provider_call(provider: &str, model: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.provider_calls.get_metric_with_label_values(&[provider, model]) {
            c.inc();
        }
    }
}

/// Observe a provider call's latency.
pub fn observe_provider_latency(provider: &str, d: Duration) {
    if let Some(m) = metrics() {
        if let Ok(h) = m.provider_latency.get_metric_with_label_values(&[provider]) {
            h.observe(d.as_secs_f64());
        }
    }
}

/// Accumulate spend.
pub fn add_cost(provider: &str, model: &str, usd: f64) {
    if usd <= 0.0 {
        return;
    }
    if let Some(m) = metrics() {
        if let Ok(c) = m.cost_usd.get_metric_with_label_values(&[provider, model]) {
            c.inc_by(usd);
        }
    }
}

/// Count a cache lookup by result (`exact_hit`, `semantic_hit`, `miss`).
pub fn inc_cache_lookup(result: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.cache_lookups.get_metric_with_label_values(&[result]) {
            c.inc();
        }
    }
}

/// Count a cascade escalation.
pub fn inc_escalation() {
    if let Some(m) = metrics() {
        m.escalations.inc();
    }
}

/// Publish a period's percent-used.
pub fn set_budget_percent(period: &str, percent: f64) {
    if let Some(m) = metrics() {
        if let Ok(g) = m.budget_percent.get_metric_with_label_values(&[period]) {
            g.set(percent);
        }
    }
}

/// Count a terminal error by taxonomy code.
pub fn inc_error(code: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.errors_total.get_metric_with_label_values(&[code]) {
            c.inc();
        }
    }
}

/// Gather and encode all metrics in the Prometheus text format. Empty
/// string before init or on encoding failure.
pub fn gather_metrics() -> String {
    let Some(m) = metrics() else {
        return String::new();
    };
    let families = m.registry.gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_succeeds_and_is_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
    }

    #[test]
    fn test_helpers_before_or_after_init_do_not_panic() {
        // The global OnceLock may or may not be set depending on test
        // order; every helper must be safe either way.
        inc_request("success");
        inc_provider_call("openai", "gpt-4o-mini");
        observe_provider_latency("openai", Duration::from_millis(42));
        add_cost("openai", "gpt-4o-mini", 0.001);
        inc_cache_lookup("miss");
        inc_escalation();
        set_budget_percent("daily", 41.5);
        inc_error("PROVIDER_ERROR");
    }

    #[test]
    fn test_add_cost_ignores_non_positive() {
        let _ = init_metrics();
        add_cost("openai", "gpt-4o", 0.0);
        add_cost("openai", "gpt-4o", -1.0);
        // No panic is the assertion; negative inc_by would panic inside
        // prometheus, so the guard must filter it.
    }

    #[test]
    fn test_isolated_bundle_counts() {
        let m = build_metrics().expect("bundle builds");
        m.requests_total
            .get_metric_with_label_values(&["success"])
            .expect("label ok")
            .inc();
        m.requests_total
            .get_metric_with_label_values(&["success"])
            .expect("label ok")
            .inc();
        let families = m.registry.gather();
        let family = families
            .iter()
            .find(|f| f.get_name() == "gateway_requests_total")
            .expect("family present");
        let value = family.get_metric()[0].get_counter().get_value();
        assert!((value - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_isolated_histogram_observation() {
        let m = build_metrics().expect("bundle builds");
        m.provider_latency
            .get_metric_with_label_values(&["openai"])
            .expect("label ok")
            .observe(0.2);
        let families = m.registry.gather();
        let family = families
            .iter()
            .find(|f| f.get_name() == "gateway_provider_latency_seconds")
            .expect("family present");
        assert_eq!(family.get_metric()[0].get_histogram().get_sample_count(), 1);
    }

    #[test]
    fn test_gather_metrics_is_valid_utf8_text() {
        let _ = init_metrics();
        inc_request("gather-probe");
        let text = gather_metrics();
        assert!(text.contains("gateway_requests_total"));
    }

    #[test]
    fn test_budget_gauge_sets_exact_value() {
        let m = build_metrics().expect("bundle builds");
        m.budget_percent
            .get_metric_with_label_values(&["daily"])
            .expect("label ok")
            .set(73.25);
        let families = m.registry.gather();
        let family = families
            .iter()
            .find(|f| f.get_name() == "gateway_budget_percent_used")
            .expect("family present");
        let value = family.get_metric()[0].get_gauge().get_value();
        assert!((value - 73.25).abs() < f64::EPSILON);
    }
}
