pub mod collectors;
pub mod server;

use collectors::FailureLabel;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Centralized metrics registry
pub struct MetricsRegistry {
    pub registry: Registry,
    /// Incremented on every backend connection attempt.
    pub backend_requests_total: Counter,
    /// Backend failures by phase (`tcp` dial vs SSH `handshake`).
    pub backend_failures_total: Family<FailureLabel, Counter>,
    /// Inbound connections accepted since start.
    pub connections_total: Counter,
    /// Session channels currently open.
    pub sessions_active: Gauge,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let backend_requests_total = Counter::default();
        registry.register(
            "hopssh_backend_requests",
            "Backend connection attempts",
            backend_requests_total.clone(),
        );

        let backend_failures_total = Family::<FailureLabel, Counter>::default();
        registry.register(
            "hopssh_backend_failures",
            "Backend connection failures by phase",
            backend_failures_total.clone(),
        );

        let connections_total = Counter::default();
        registry.register(
            "hopssh_connections_total",
            "Inbound connections since start (lifetime counter)",
            connections_total.clone(),
        );

        let sessions_active = Gauge::default();
        registry.register(
            "hopssh_sessions_active",
            "Session channels currently open",
            sessions_active.clone(),
        );

        Self {
            registry,
            backend_requests_total,
            backend_failures_total,
            connections_total,
            sessions_active,
        }
    }

    pub fn record_backend_request(&self) {
        self.backend_requests_total.inc();
    }

    pub fn record_tcp_failure(&self) {
        self.backend_failures_total
            .get_or_create(&FailureLabel::tcp())
            .inc();
    }

    pub fn record_handshake_failure(&self) {
        self.backend_failures_total
            .get_or_create(&FailureLabel::handshake())
            .inc();
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn encode_text(&self) -> String {
        let mut out = String::new();
        // Encoding only fails on fmt::Write errors, which String does not produce.
        let _ = encode(&mut out, &self.registry);
        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
