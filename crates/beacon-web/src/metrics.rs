//! Prometheus metrics for the API.

use std::sync::Arc;

use axum::extract::{MatchedPath, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Counters and gauges exported on `/metrics`.
pub struct ApiMetrics {
    registry: Registry,
    requests: IntCounterVec,
    tasks: IntGauge,
    active: IntGauge,
    queued: IntGauge,
}

impl ApiMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new("http_requests_total", "total http requests"),
            &["route", "method", "code"],
        )?;
        let tasks = IntGauge::new("beacon_tasks", "tasks in the store")?;
        let active = IntGauge::new("beacon_workers_active", "worker units running")?;
        let queued = IntGauge::new("beacon_jobs_queued", "jobs waiting for a worker slot")?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(tasks.clone()))?;
        registry.register(Box::new(active.clone()))?;
        registry.register(Box::new(queued.clone()))?;

        Ok(Self {
            registry,
            requests,
            tasks,
            active,
            queued,
        })
    }

    /// Count one finished request.
    pub fn observe(&self, route: &str, method: &str, code: u16) {
        let code = code.to_string();
        self.requests
            .with_label_values(&[route, method, code.as_str()])
            .inc();
    }

    /// Record the scheduler's current load.
    pub fn set_load(&self, tasks: usize, active: usize, queued: usize) {
        self.tasks.set(tasks as i64);
        self.active.set(active as i64);
        self.queued.set(queued as i64);
    }

    /// Everything registered, in the Prometheus text format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Middleware counting every response by route template, method and status.
pub async fn track_requests(
    State(metrics): State<Arc<ApiMetrics>>,
    request: Request,
    next: Next,
) -> Response {
    // Route templates keep label cardinality bounded
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let method = request.method().to_string();

    let response = next.run(request).await;
    metrics.observe(&route, &method, response.status().as_u16());
    response
}
