//! Prometheus registration (spec §1.5 addition), mirroring the teacher's
//! `metrics::registry::Metrics`: install once, then use the `metrics` crate
//! macros anywhere. Kept alongside — not instead of — the atomic counters
//! each component exposes synchronously.

use metrics::{describe_counter, describe_gauge, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and describe every metric
    /// the admission core emits. Call once at startup.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install metrics recorder");

        describe_counter!(
            "admission_token_bucket_allowed_total",
            Unit::Count,
            "Requests allowed by the token bucket"
        );
        describe_counter!(
            "admission_token_bucket_soft_throttled_total",
            Unit::Count,
            "Requests soft-throttled by the token bucket"
        );
        describe_counter!(
            "admission_token_bucket_hard_locked_total",
            Unit::Count,
            "Requests rejected due to hard lockout"
        );
        describe_gauge!(
            "admission_token_bucket_tracked_endpoints",
            Unit::Count,
            "Endpoints currently tracked by a token bucket limiter"
        );
        describe_counter!(
            "admission_policy_registry_misses_total",
            Unit::Count,
            "Quantized policies not found in the registry and newly created or remapped"
        );
        describe_gauge!(
            "admission_policy_registry_size",
            Unit::Count,
            "Distinct quantized policies currently registered"
        );
        describe_counter!(
            "admission_concurrency_acquired_total",
            Unit::Count,
            "Concurrency gate leases granted"
        );
        describe_counter!(
            "admission_concurrency_rejected_total",
            Unit::Count,
            "Concurrency gate admissions rejected"
        );
        describe_counter!(
            "admission_concurrency_queued_total",
            Unit::Count,
            "Concurrency gate admissions that queued before acquiring"
        );
        describe_counter!(
            "admission_connection_rejected_total",
            Unit::Count,
            "Connections rejected for exceeding the per-IP cap"
        );
        describe_gauge!(
            "admission_connection_tracked_addresses",
            Unit::Count,
            "Source addresses currently tracked by the connection limiter"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
