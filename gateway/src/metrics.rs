use anyhow::Result;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    dispatch_outcomes: IntCounterVec,
    quota_admission: IntCounterVec,
    refresh_lock_contention: IntCounterVec,
    stream_dedup_dropped: IntCounterVec,
    active_providers: IntGauge,
    upstream_latency: Histogram,
}

impl GatewayMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let dispatch_outcomes = IntCounterVec::new(
            Opts::new(
                "gateway_dispatch_outcomes_total",
                "Chat/search dispatch outcomes grouped by kind and result",
            ),
            &["kind", "outcome"],
        )?;
        let quota_admission = IntCounterVec::new(
            Opts::new(
                "gateway_quota_admission_total",
                "Pre-flight admission decisions grouped by kind and reason",
            ),
            &["kind", "decision"],
        )?;
        let refresh_lock_contention = IntCounterVec::new(
            Opts::new(
                "gateway_refresh_lock_contention_total",
                "Token refresh attempts grouped by whether the distributed lock was acquired",
            ),
            &["result"],
        )?;
        let stream_dedup_dropped = IntCounterVec::new(
            Opts::new(
                "gateway_stream_dedup_dropped_total",
                "SSE events dropped by StreamDedup as adjacent duplicates",
            ),
            &["provider_id"],
        )?;
        registry.register(Box::new(dispatch_outcomes.clone()))?;
        registry.register(Box::new(quota_admission.clone()))?;
        registry.register(Box::new(refresh_lock_contention.clone()))?;
        registry.register(Box::new(stream_dedup_dropped.clone()))?;

        let active_providers = IntGauge::with_opts(Opts::new(
            "gateway_active_providers",
            "Number of account providers currently in the pool",
        ))?;
        registry.register(Box::new(active_providers.clone()))?;

        let upstream_latency = Histogram::with_opts(HistogramOpts::new(
            "gateway_upstream_latency_seconds",
            "Latency of successful upstream chat completions (seconds)",
        ))?;
        registry.register(Box::new(upstream_latency.clone()))?;

        Ok(Self {
            registry,
            dispatch_outcomes,
            quota_admission,
            refresh_lock_contention,
            stream_dedup_dropped,
            active_providers,
            upstream_latency,
        })
    }

    pub fn record_dispatch_outcome(&self, kind: &str, outcome: &str) {
        self.dispatch_outcomes.with_label_values(&[kind, outcome]).inc();
    }

    pub fn record_quota_admission(&self, kind: &str, decision: &str) {
        self.quota_admission.with_label_values(&[kind, decision]).inc();
    }

    pub fn record_refresh_lock(&self, acquired: bool) {
        let label = if acquired { "acquired" } else { "contended" };
        self.refresh_lock_contention.with_label_values(&[label]).inc();
    }

    pub fn record_stream_dedup_drop(&self, provider_id: &str, count: u64) {
        if count > 0 {
            self.stream_dedup_dropped
                .with_label_values(&[provider_id])
                .inc_by(count);
        }
    }

    pub fn set_active_providers(&self, count: usize) {
        self.active_providers.set(count as i64);
    }

    pub fn observe_upstream_latency(&self, secs: f64) {
        self.upstream_latency.observe(secs);
    }

    pub fn render(&self) -> Result<Response> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            )
            .body(Body::from(buffer))?;
        Ok(response)
    }
}
