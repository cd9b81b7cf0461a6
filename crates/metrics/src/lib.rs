use anyhow::Result;
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server, StatusCode,
};
use prometheus::{Encoder, IntCounter, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use tracing::{info, warn};

#[derive(Clone)]
pub struct MetricsHandle {
    registry: Registry,
}

impl Default for MetricsHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters bumped by the polling loop. Cloning shares the underlying series.
#[derive(Clone)]
pub struct SchedulerMetrics {
    pub polls: IntCounter,
    pub fetch_failures: IntCounter,
    pub invalid_readings: IntCounter,
    pub readings_stored: IntCounter,
    pub store_failures: IntCounter,
    pub notifications_sent: IntCounter,
    pub notification_failures: IntCounter,
}

impl SchedulerMetrics {
    /// Counters attached to a private registry, for callers that do not export.
    pub fn detached() -> Result<Self> {
        MetricsHandle::new().scheduler_metrics()
    }
}

impl MetricsHandle {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn scheduler_metrics(&self) -> Result<SchedulerMetrics> {
        Ok(SchedulerMetrics {
            polls: self.counter("ratewatch_polls_total", "publisher polls attempted")?,
            fetch_failures: self.counter("ratewatch_fetch_failures_total", "failed fetches")?,
            invalid_readings: self.counter(
                "ratewatch_invalid_readings_total",
                "fetched readings without a positive primary value",
            )?,
            readings_stored: self.counter(
                "ratewatch_readings_stored_total",
                "new readings appended to the store",
            )?,
            store_failures: self.counter("ratewatch_store_failures_total", "store errors")?,
            notifications_sent: self.counter(
                "ratewatch_notifications_sent_total",
                "operator notifications delivered",
            )?,
            notification_failures: self.counter(
                "ratewatch_notification_failures_total",
                "operator notifications that failed or timed out",
            )?,
        })
    }

    fn counter(&self, name: &str, help: &str) -> Result<IntCounter> {
        let counter = IntCounter::with_opts(Opts::new(name, help))?;
        self.registry.register(Box::new(counter.clone()))?;
        Ok(counter)
    }

    pub fn render(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }

    pub async fn serve(self, addr: SocketAddr) -> Result<()> {
        let make_svc = make_service_fn(move |_| {
            let handle = self.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |_req: Request<Body>| {
                    let handle = handle.clone();
                    async move { Ok::<_, hyper::Error>(handle.respond()) }
                }))
            }
        });

        let server = Server::bind(&addr).serve(make_svc);
        info!(%addr, "metrics exporter listening");
        server.await?;
        Ok(())
    }

    fn respond(&self) -> Response<Body> {
        match self.render() {
            Ok((content_type, buffer)) => {
                let mut response = Response::new(Body::from(buffer));
                if let Ok(value) = content_type.parse() {
                    response
                        .headers_mut()
                        .insert(hyper::header::CONTENT_TYPE, value);
                }
                response
            }
            Err(err) => {
                warn!(error = ?err, "metrics encoding failed");
                let mut response = Response::new(Body::empty());
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }
        }
    }
}
