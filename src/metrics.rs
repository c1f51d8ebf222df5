//! Prometheus metrics for the router and ledger.

use prometheus::{
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, Encoder, Histogram,
    IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder,
};
use std::sync::Arc;

/// Router metrics exported at /metrics.
#[derive(Clone)]
pub struct RouterMetrics {
    pub requests_total: IntCounterVec,
    pub tokens_total: IntCounterVec,
    pub errors_total: IntCounterVec,
    pub cost_micros_total: IntCounterVec,
    pub turn_latency_seconds: Histogram,
    pub loop_breaks_total: IntCounter,
    pub conversations_active: IntGauge,
    pub ledger_degraded: IntGauge,

    registry: Arc<Registry>,
}

impl RouterMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = register_int_counter_vec_with_registry!(
            "switchboard_requests_total",
            "Model calls dispatched, by agent and outcome",
            &["agent", "outcome"],
            registry
        )
        .unwrap();

        let tokens_total = register_int_counter_vec_with_registry!(
            "switchboard_tokens_total",
            "Tokens consumed, by agent and direction",
            &["agent", "direction"],
            registry
        )
        .unwrap();

        let errors_total = register_int_counter_vec_with_registry!(
            "switchboard_errors_total",
            "Failed model calls, by error kind",
            &["kind"],
            registry
        )
        .unwrap();

        let cost_micros_total = register_int_counter_vec_with_registry!(
            "switchboard_cost_micros_total",
            "Committed spend in currency micro-units, by tier",
            &["tier"],
            registry
        )
        .unwrap();

        let turn_latency_seconds = register_histogram_with_registry!(
            "switchboard_turn_latency_seconds",
            "Wall time of one routed turn, including cascade retries",
            vec![0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 40.0, 60.0, 120.0],
            registry
        )
        .unwrap();

        let loop_breaks_total = register_int_counter_with_registry!(
            "switchboard_loop_breaks_total",
            "Conversations stopped by the anti-recursion guard",
            registry
        )
        .unwrap();

        let conversations_active = register_int_gauge_with_registry!(
            "switchboard_conversations_active",
            "Conversations currently holding a worker task",
            registry
        )
        .unwrap();

        let ledger_degraded = register_int_gauge_with_registry!(
            "switchboard_ledger_degraded",
            "1 while the budget store is unreachable",
            registry
        )
        .unwrap();

        Self {
            requests_total,
            tokens_total,
            errors_total,
            cost_micros_total,
            turn_latency_seconds,
            loop_breaks_total,
            conversations_active,
            ledger_degraded,
            registry: Arc::new(registry),
        }
    }

    /// Record one model call and its outcome.
    pub fn record_request(&self, agent: &str, outcome: &str) {
        self.requests_total.with_label_values(&[agent, outcome]).inc();
    }

    /// Record token usage for an agent's call.
    pub fn record_usage(&self, agent: &str, input_tokens: u64, output_tokens: u64) {
        self.tokens_total
            .with_label_values(&[agent, "input"])
            .inc_by(input_tokens);
        self.tokens_total
            .with_label_values(&[agent, "output"])
            .inc_by(output_tokens);
    }

    pub fn record_error(&self, kind: &str) {
        self.errors_total.with_label_values(&[kind]).inc();
    }

    pub fn record_cost(&self, tier: &str, micros: i64) {
        self.cost_micros_total
            .with_label_values(&[tier])
            .inc_by(micros.max(0) as u64);
    }

    pub fn observe_turn_latency(&self, seconds: f64) {
        self.turn_latency_seconds.observe(seconds);
    }

    pub fn record_loop_break(&self) {
        self.loop_breaks_total.inc();
    }

    pub fn set_active_conversations(&self, count: i64) {
        self.conversations_active.set(count);
    }

    pub fn set_ledger_degraded(&self, degraded: bool) {
        self.ledger_degraded.set(if degraded { 1 } else { 0 });
    }

    /// Export metrics in Prometheus text format.
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for RouterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared metrics handle.
pub type SharedMetrics = Arc<RouterMetrics>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_show_up_in_export() {
        let metrics = RouterMetrics::new();
        metrics.record_request("communicator", "ok");
        metrics.record_usage("communicator", 120, 40);
        metrics.record_error("rate_limited");
        metrics.record_cost("cheap", 450);
        metrics.observe_turn_latency(1.2);
        metrics.record_loop_break();
        metrics.set_active_conversations(2);
        metrics.set_ledger_degraded(true);

        let text = metrics.export();
        assert!(text.contains("switchboard_requests_total"));
        assert!(text.contains("switchboard_tokens_total"));
        assert!(text.contains("switchboard_cost_micros_total{tier=\"cheap\"} 450"));
        assert!(text.contains("switchboard_loop_breaks_total 1"));
        assert!(text.contains("switchboard_ledger_degraded 1"));
    }

    #[test]
    fn test_negative_cost_is_clamped() {
        let metrics = RouterMetrics::new();
        metrics.record_cost("cheap", -5);
        let text = metrics.export();
        assert!(text.contains("switchboard_cost_micros_total{tier=\"cheap\"} 0"));
    }
}
