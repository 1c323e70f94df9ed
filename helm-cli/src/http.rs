//! Read-only HTTP surface: liveness, state snapshot, and Prometheus metrics.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::control::ControlContext;
use crate::runtime::ShutdownSignal;
use crate::telemetry::ControlMetrics;

const JSON: &str = "application/json";
const PROMETHEUS_TEXT: &str = "text/plain; version=0.0.4";

/// Bind the HTTP server and serve until `shutdown` fires.
///
/// Returns the bound address, which differs from `addr` when port `0` was requested.
pub fn spawn_http_server(
    addr: SocketAddr,
    context: Arc<ControlContext>,
    metrics: Arc<ControlMetrics>,
    shutdown: ShutdownSignal,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let make_svc = make_service_fn(move |_| {
        let context = context.clone();
        let metrics = metrics.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let response = route(&context, &metrics, &req);
                async move { Ok::<_, Infallible>(response) }
            }))
        }
    });
    let server = Server::try_bind(&addr)
        .with_context(|| format!("failed to bind HTTP server on {addr}"))?
        .serve(make_svc);
    let local = server.local_addr();
    info!(addr = %local, "http query surface listening");
    let handle = tokio::spawn(async move {
        let graceful = server.with_graceful_shutdown(async move { shutdown.wait().await });
        if let Err(err) = graceful.await {
            error!(error = %err, addr = %local, "http server terminated");
        } else {
            info!(addr = %local, "http server shutdown");
        }
    });
    Ok((local, handle))
}

fn route(context: &ControlContext, metrics: &ControlMetrics, req: &Request<Body>) -> Response<Body> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => json_response(
            StatusCode::OK,
            &json!({
                "status": "ok",
                "uptime_secs": context.uptime().as_secs(),
                "connected_clients": context.registry.len(),
                "last_seq": context.bus.last_seq(),
                "clients": context.registry.connections(),
            }),
        ),
        (&Method::GET, "/api/state") => json_response(StatusCode::OK, &context.state.snapshot()),
        (&Method::GET, "/metrics") => match metrics.encode() {
            Ok(text) => respond(StatusCode::OK, PROMETHEUS_TEXT, text),
            Err(err) => {
                error!(error = %err, "failed to encode Prometheus metrics");
                respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    "failed to encode metrics",
                )
            }
        },
        (_, "/health" | "/api/state" | "/metrics") => {
            respond(StatusCode::METHOD_NOT_ALLOWED, "text/plain", "method not allowed")
        }
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    match serde_json::to_vec(body) {
        Ok(bytes) => respond(status, JSON, bytes),
        Err(err) => {
            error!(error = %err, "failed to encode response body");
            respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                "failed to encode response",
            )
        }
    }
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
