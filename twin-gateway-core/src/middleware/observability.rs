use std::sync::Arc;

use hyper::header::CONTENT_TYPE;
use hyper::{Body, Response, StatusCode};
use prometheus::{Encoder, Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::warn;

/// Gateway and HTTP metrics, exported in Prometheus text format.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Registry,
    commands_pending: IntGauge,
    commands_total: IntCounterVec,
    command_latency: Histogram,
    notifications_total: IntCounterVec,
    requests_total: IntCounterVec,
    request_latency: HistogramVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let commands_pending = IntGauge::new("twin_commands_pending", "Commands queued for the gateway worker")?;
        let commands_total = IntCounterVec::new(
            Opts::new("twin_commands_total", "Commands settled by the gateway, by outcome"),
            &["outcome"],
        )?;
        let command_latency = Histogram::with_opts(HistogramOpts::new(
            "twin_command_seconds",
            "Time from submission to settlement of a command",
        ))?;
        let notifications_total = IntCounterVec::new(
            Opts::new("twin_notifications_total", "Notifications flushed or discarded"),
            &["fate"],
        )?;
        let requests_total = IntCounterVec::new(
            Opts::new("twin_http_requests_total", "Total HTTP requests"),
            &["route", "status"],
        )?;
        let request_latency = HistogramVec::new(
            HistogramOpts::new("twin_http_request_latency_seconds", "HTTP request latency"),
            &["route"],
        )?;

        registry.register(Box::new(commands_pending.clone()))?;
        registry.register(Box::new(commands_total.clone()))?;
        registry.register(Box::new(command_latency.clone()))?;
        registry.register(Box::new(notifications_total.clone()))?;
        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_latency.clone()))?;

        Ok(Self {
            inner: Arc::new(Inner {
                registry,
                commands_pending,
                commands_total,
                command_latency,
                notifications_total,
                requests_total,
                request_latency,
            }),
        })
    }

    pub fn encode(&self) -> prometheus::Result<Vec<u8>> {
        let mf = self.inner.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&mf, &mut buf)?;
        Ok(buf)
    }

    pub fn render(&self) -> Response<Body> {
        let (status, body) = match self.encode() {
            Ok(buf) => (StatusCode::OK, Body::from(buf)),
            Err(e) => {
                warn!(error = %e, "metrics encoding failed");
                (StatusCode::INTERNAL_SERVER_ERROR, Body::from("metrics unavailable"))
            }
        };
        let mut resp = Response::new(body);
        *resp.status_mut() = status;
        if let Ok(v) = TextEncoder::new().format_type().parse() {
            resp.headers_mut().insert(CONTENT_TYPE, v);
        }
        resp
    }

    pub fn set_pending(&self, pending: usize) {
        self.inner.commands_pending.set(i64::try_from(pending).unwrap_or(i64::MAX));
    }

    pub fn inc_commands(&self, outcome: &'static str) {
        self.inner.commands_total.with_label_values(&[outcome]).inc();
    }

    pub fn observe_command(&self, seconds: f64) {
        self.inner.command_latency.observe(seconds);
    }

    pub fn add_notifications(&self, fate: &'static str, count: usize) {
        self.inner
            .notifications_total
            .with_label_values(&[fate])
            .inc_by(u64::try_from(count).unwrap_or(u64::MAX));
    }

    pub fn inc_requests(&self, route: &'static str, status: &'static str) {
        self.inner.requests_total.with_label_values(&[route, status]).inc();
    }

    pub fn observe_latency(&self, route: &'static str, seconds: f64) {
        self.inner.request_latency.with_label_values(&[route]).observe(seconds);
    }
}
