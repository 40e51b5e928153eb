//! HTTP listener abstraction.
//!
//! Each configured endpoint binds its own accept loop and picks one of
//! two connection backends, HTTP/1.1 or HTTP/2. The backend is a single
//! polymorphism point: one enum matched once per accepted connection.
//! The rest of the stack (routers, middleware) is backend-agnostic.

use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::header::{HeaderValue, SERVER};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiInfo, ServerIdentity};
use crate::error::ErrorCode;
use crate::problem::Problem;

/// Which HTTP implementation serves an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpBackend {
    Http1,
    Http2,
}

/// Accept loop for one plaintext endpoint.
///
/// Runs until the cancellation token fires; each accepted connection is
/// served on its own task by the backend chosen for this endpoint.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    backend: HttpBackend,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };

        let io = TokioIo::new(stream);
        let service = TowerToHyperService::new(router.clone());
        match backend {
            HttpBackend::Http1 => {
                tokio::spawn(async move {
                    let conn = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service);
                    if let Err(e) = conn.await {
                        tracing::debug!(peer = %peer, error = %e, "http/1.1 connection ended");
                    }
                });
            }
            HttpBackend::Http2 => {
                tokio::spawn(async move {
                    let conn = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                        .serve_connection(io, service);
                    if let Err(e) = conn.await {
                        tracing::debug!(peer = %peer, error = %e, "http/2 connection ended");
                    }
                });
            }
        }
    }
    Ok(())
}

// ── Per-request watchdog ────────────────────────────────────────────

/// Watchdog configuration shared by a listener's routes.
#[derive(Debug, Clone)]
pub struct Watchdog {
    pub timeout: Duration,
    pub service: &'static str,
    pub api_version: &'static str,
}

/// Middleware: abandon a request that produced no response before the
/// session watchdog fired. The peer gets a 503-class problem; any later
/// write from the abandoned handler is discarded with its task.
pub async fn request_watchdog(
    State(watchdog): State<Watchdog>,
    req: Request,
    next: Next,
) -> Response {
    match tokio::time::timeout(watchdog.timeout, next.run(req)).await {
        Ok(response) => response,
        Err(_) => {
            tracing::warn!(
                timeout_secs = watchdog.timeout.as_secs(),
                "request watchdog fired before a response was written"
            );
            Problem::new(
                ErrorCode::ServiceUnavailable,
                watchdog.service,
                watchdog.api_version,
            )
            .with_detail("request processing did not complete in time")
            .into_response()
        }
    }
}

// ── Server header ───────────────────────────────────────────────────

/// State for [`server_header`]: the AF identity plus the default API
/// info block for the listener. Handlers serving a different resource
/// family override the default by attaching `Extension(&'static ApiInfo)`
/// to their response.
#[derive(Clone)]
pub struct ServerHeader {
    pub identity: ServerIdentity,
    pub default_api: &'static ApiInfo,
}

pub async fn server_header(
    State(cfg): State<ServerHeader>,
    req: Request,
    next: Next,
) -> Response {
    let mut response = next.run(req).await;
    let api = response
        .extensions()
        .get::<&'static ApiInfo>()
        .copied()
        .unwrap_or(cfg.default_api);
    let banner = cfg.identity.banner(api);
    if let Ok(value) = HeaderValue::from_str(&banner) {
        response.headers_mut().insert(SERVER, value);
    }
    response
}
