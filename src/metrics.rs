//! Prometheus metrics, rendered as text at `GET /metrics`.

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

pub struct Metrics {
    pub registry: Registry,
    pub http_requests_total: IntCounterVec,
    pub events_committed_total: IntCounterVec,
    pub outbox_processed_total: IntCounterVec,
    pub outbox_backlog: IntGauge,
    pub deliveries_attempted_total: IntCounterVec,
    pub month_close_blocked_total: IntCounterVec,
    pub maintenance_runs_total: IntCounter,
    pub retention_purged_total: IntCounterVec,
    pub rate_limited_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Metrics {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new("http_requests_total", "HTTP requests by method/status"),
            &["method", "status"],
        )
        .expect("metric opts");
        let events_committed_total = IntCounterVec::new(
            Opts::new("events_committed_total", "Events committed by stream kind"),
            &["stream"],
        )
        .expect("metric opts");
        let outbox_processed_total = IntCounterVec::new(
            Opts::new("outbox_processed_total", "Outbox messages by topic/outcome"),
            &["topic", "outcome"],
        )
        .expect("metric opts");
        let outbox_backlog = IntGauge::new("outbox_backlog", "Unprocessed outbox rows")
            .expect("metric opts");
        let deliveries_attempted_total = IntCounterVec::new(
            Opts::new("deliveries_attempted_total", "Delivery attempts by outcome"),
            &["outcome"],
        )
        .expect("metric opts");
        let month_close_blocked_total = IntCounterVec::new(
            Opts::new("month_close_blocked_total", "Month closes blocked by reason"),
            &["reason"],
        )
        .expect("metric opts");
        let maintenance_runs_total =
            IntCounter::new("maintenance_runs_total", "Retention/maintenance runs")
                .expect("metric opts");
        let retention_purged_total = IntCounterVec::new(
            Opts::new("retention_purged_total", "Rows purged by table"),
            &["table"],
        )
        .expect("metric opts");
        let rate_limited_total =
            IntCounter::new("rate_limited_total", "Requests rejected by the rate limiter")
                .expect("metric opts");

        for c in [
            &http_requests_total,
            &events_committed_total,
            &outbox_processed_total,
            &deliveries_attempted_total,
            &month_close_blocked_total,
            &retention_purged_total,
        ] {
            registry.register(Box::new(c.clone())).expect("register");
        }
        registry
            .register(Box::new(outbox_backlog.clone()))
            .expect("register");
        registry
            .register(Box::new(maintenance_runs_total.clone()))
            .expect("register");
        registry
            .register(Box::new(rate_limited_total.clone()))
            .expect("register");

        Metrics {
            registry,
            http_requests_total,
            events_committed_total,
            outbox_processed_total,
            outbox_backlog,
            deliveries_attempted_total,
            month_close_blocked_total,
            maintenance_runs_total,
            retention_purged_total,
            rate_limited_total,
        }
    }

    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics::new()
    }
}
