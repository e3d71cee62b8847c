//! The admin HTTP surface (spec.md §6, "out of core; specified only as a
//! consumer of core"): `GET /health`, `GET /stats`, `GET /`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionStats;
use crate::pipeline::PipelineHandle;

/// A health predicate evaluated on every `GET /health`. The default simply
/// asks the publisher whether its circuit is closed; other predicates
/// (plugin init failures, broker fatal errors) can be folded in by
/// constructing `AdminServer` with more entries.
pub trait HealthCheck: Send + Sync {
    fn healthy(&self) -> bool;
    fn name(&self) -> &str;
}

pub struct AdminServer {
    addr: SocketAddr,
    stats: Arc<ConnectionStats>,
    pipeline: PipelineHandle,
    health_checks: Arc<Vec<Box<dyn HealthCheck>>>,
}

impl AdminServer {
    pub fn new(
        addr: SocketAddr,
        stats: Arc<ConnectionStats>,
        pipeline: PipelineHandle,
        health_checks: Vec<Box<dyn HealthCheck>>,
    ) -> Self {
        AdminServer {
            addr,
            stats,
            pipeline,
            health_checks: Arc::new(health_checks),
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let stats = self.stats;
        let pipeline = self.pipeline;
        let health_checks = self.health_checks;

        let make_svc = make_service_fn(move |_conn| {
            let stats = stats.clone();
            let pipeline = pipeline.clone();
            let health_checks = health_checks.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    handle(req, stats.clone(), pipeline.clone(), health_checks.clone())
                }))
            }
        });

        let server = Server::bind(&self.addr).serve(make_svc);
        info!("admin http surface listening on {}", self.addr);

        let graceful = server.with_graceful_shutdown(async move {
            cancel.cancelled().await;
        });

        if let Err(e) = graceful.await {
            warn!("admin http server error: {e}");
        }
    }
}

async fn handle(
    req: Request<Body>,
    stats: Arc<ConnectionStats>,
    pipeline: PipelineHandle,
    health_checks: Arc<Vec<Box<dyn HealthCheck>>>,
) -> Result<Response<Body>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => {
            let failing: Vec<&str> = health_checks
                .iter()
                .filter(|c| !c.healthy())
                .map(|c| c.name())
                .collect();
            if failing.is_empty() {
                json_response(StatusCode::OK, &serde_json::json!({"status": "ok"}))
            } else {
                json_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    &serde_json::json!({"status": "degraded", "failing": failing}),
                )
            }
        }
        (&Method::GET, "/stats") => {
            let connection_snapshot = stats.snapshot();
            let pipeline_snapshot = pipeline.stats();
            json_response(
                StatusCode::OK,
                &serde_json::json!({
                    "connections": connection_snapshot,
                    "pipeline": pipeline_snapshot,
                }),
            )
        }
        (&Method::GET, "/") => json_response(
            StatusCode::OK,
            &serde_json::json!({"service": "telemetry-gateway", "version": env!("CARGO_PKG_VERSION")}),
        ),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty())
            .unwrap(),
    };
    Ok(response)
}

fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}
