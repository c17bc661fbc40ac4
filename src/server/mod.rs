// src/server/mod.rs
//! HTTP front end
//!
//! Thin hyper (HTTP/1) wrapper over the executor:
//!
//! - `POST /execute`: `{"task_path": "...", "timeout": 10}` → `{"success", "output", "error"}`
//! - `GET /health`: pool status
//! - `GET /metrics`: Prometheus text format
//!
//! `/execute` answers `200` for every well-formed request, whatever the task
//! outcome; only malformed requests get `400`.

use crate::runtime::executor::{ExecutionResult, Executor};
use crate::runtime::worker_pool::PoolHealth;
use crate::utils::errors::{PoolError, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Incoming};
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long in-flight connections may take to finish on shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Body of `POST /execute`
#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteRequest {
    pub task_path: Option<String>,
    /// Seconds
    pub timeout: Option<f64>,
}

/// Body of `GET /health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub pool: PoolHealth,
}

/// HTTP server state
pub struct ApiServer {
    executor: Arc<Executor>,
    metrics: Option<PrometheusHandle>,
}

impl ApiServer {
    pub fn new(executor: Arc<Executor>, metrics: Option<PrometheusHandle>) -> Self {
        Self { executor, metrics }
    }

    /// Accept connections until `shutdown` fires, then drain them
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local_addr = listener.local_addr()?;
        info!("HTTP server listening on {}", local_addr);

        let graceful = GracefulShutdown::new();

        loop {
            let (stream, addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };
            debug!("Accepted connection from {}", addr);

            let server = Arc::clone(&self);
            let service = service_fn(move |req: Request<Incoming>| {
                let server = Arc::clone(&server);
                async move { Ok::<_, Infallible>(server.route(req).await) }
            });

            let connection = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
            let connection = graceful.watch(connection);
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    debug!("Connection error: {}", e);
                }
            });
        }

        info!("HTTP server draining connections");
        tokio::select! {
            _ = graceful.shutdown() => info!("HTTP server stopped"),
            _ = tokio::time::sleep(DRAIN_TIMEOUT) => {
                warn!("Timed out draining HTTP connections");
            }
        }
        Ok(())
    }

    /// Dispatch a request to its handler
    pub async fn route<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body,
        B::Error: Display,
    {
        match (req.method(), req.uri().path()) {
            (&Method::POST, "/execute") => self.execute(req).await,
            (&Method::GET, "/health") => self.health().await,
            (&Method::GET, "/metrics") => self.metrics(),
            (method, path) => {
                debug!("No route for {} {}", method, path);
                json_response(StatusCode::NOT_FOUND, &serde_json::json!({ "error": "Not found" }))
            }
        }
    }

    async fn execute<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body,
        B::Error: Display,
    {
        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!("Failed to read request body: {}", e);
                return bad_request("Failed to read request body");
            }
        };

        let request: ExecuteRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => {
                warn!("Invalid /execute body: {}", e);
                return bad_request("Invalid JSON body");
            }
        };

        let Some(task_path) = request.task_path.filter(|p| !p.is_empty()) else {
            warn!("Missing task_path parameter");
            return bad_request("Missing task_path");
        };

        let timeout = request
            .timeout
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .unwrap_or_else(|| self.executor.default_timeout());

        // Run on its own task so a dropped connection cannot strand a lease
        let executor = Arc::clone(&self.executor);
        let path = task_path.clone();
        let handle = tokio::spawn(async move { executor.execute(&path, Some(timeout)).await });

        let result = match handle.await {
            Ok(result) => result,
            Err(e) => {
                error!("Execution task failed: {}", e);
                return json_response(StatusCode::OK, &ExecutionResult::failure(format!("ERROR: {}", e)));
            }
        };

        info!(task_path = %task_path, success = result.success, "/execute finished");
        json_response(StatusCode::OK, &result)
    }

    async fn health(&self) -> Response<Full<Bytes>> {
        let pool = self.executor.pool().health().await;
        json_response(
            StatusCode::OK,
            &HealthResponse {
                status: "ok".to_string(),
                pool,
            },
        )
    }

    fn metrics(&self) -> Response<Full<Bytes>> {
        match &self.metrics {
            Some(handle) => text_response(StatusCode::OK, handle.render()),
            None => text_response(StatusCode::NOT_FOUND, "metrics disabled\n".to_string()),
        }
    }
}

/// Bind the listener for `addr`
pub async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| PoolError::Server(format!("failed to bind {}: {}", addr, e)))
}

fn bad_request(message: &str) -> Response<Full<Bytes>> {
    json_response(StatusCode::BAD_REQUEST, &ExecutionResult::failure(message))
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(bytes) => {
            let mut response = Response::new(Full::new(Bytes::from(bytes)));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            error!("Failed to serialize response: {}", e);
            let mut response = Response::new(Full::new(Bytes::from_static(b"{}")));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

fn text_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    response
}
