//! Observability ambient stack (§2, §9 SPEC_FULL addendum): a process-wide
//! `prometheus::Registry` carrying a per-statement-class database-call
//! histogram and an in-flight-connections gauge (§5 "Prometheus histograms:
//! concurrent observation is lock-free"). Grounded in the other_examples
//! pack's axum+prometheus pairings (e.g. the ghostdock-style registry
//! service Cargo.toml), since the teacher itself wires no metrics. No `GET
//! /metrics` endpoint is mounted here — the debug HTTP server is out of
//! scope (§1) — the registry is exposed purely as a capability.

use prometheus::{HistogramVec, IntGauge, Registry};

pub struct Metrics {
    pub registry: Registry,
    pub db_call_duration: HistogramVec,
    pub in_flight_connections: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let db_call_duration = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "registry_db_call_duration_seconds",
                "Duration of metadata store calls by statement class",
            ),
            &["statement_class"],
        )
        .expect("static histogram configuration is always valid");

        let in_flight_connections = IntGauge::new(
            "registry_in_flight_connections",
            "Number of HTTP connections currently being served",
        )
        .expect("static gauge configuration is always valid");

        registry
            .register(Box::new(db_call_duration.clone()))
            .expect("metric name collision in a freshly constructed registry");
        registry
            .register(Box::new(in_flight_connections.clone()))
            .expect("metric name collision in a freshly constructed registry");

        Metrics {
            registry,
            db_call_duration,
            in_flight_connections,
        }
    }

    /// Records `duration` against `statement_class` (e.g. `"manifest_put"`,
    /// `"tag_list"`, `"catalog_list"`), the per-statement-class histogram
    /// called out in §2's Observability component.
    pub fn observe_db_call(&self, statement_class: &str, duration: std::time::Duration) {
        self.db_call_duration
            .with_label_values(&[statement_class])
            .observe(duration.as_secs_f64());
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observing_a_call_does_not_panic() {
        let metrics = Metrics::new();
        metrics.observe_db_call("manifest_put", std::time::Duration::from_millis(5));
        let families = metrics.registry.gather();
        assert!(!families.is_empty());
    }
}
