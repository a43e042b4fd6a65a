//! HTTP server for the Prometheus scrape endpoint.

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{Level, error, info, warn};

use crate::scanner::{Scanner, SharedScanner};
use crate::transport::RegisterTransport;

/// Application state shared across handlers.
struct AppState<T> {
    scanner: SharedScanner<T>,
}

impl<T> Clone for AppState<T> {
    fn clone(&self) -> Self {
        Self {
            scanner: self.scanner.clone(),
        }
    }
}

/// Create the HTTP router.
fn create_router<T: RegisterTransport>(
    scanner: SharedScanner<T>,
    metrics_path: &str,
    access_log: bool,
) -> Router {
    let state = AppState { scanner };

    let router = Router::new()
        .route(metrics_path, get(metrics_handler::<T>))
        .fallback(not_found)
        .with_state(state);

    if access_log {
        router.layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
    } else {
        router
    }
}

/// Handler for the metrics endpoint. Every request runs a full scan.
///
/// The scan runs in its own task so a client going away never leaves a
/// request half done on the bus.
async fn metrics_handler<T: RegisterTransport>(State(state): State<AppState<T>>) -> Response {
    let scanner = state.scanner.clone();

    match tokio::spawn(async move { scanner.scrape().await }).await {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Scan task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                "Scan failed",
            )
                .into_response()
        }
    }
}

async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        [("content-type", "text/plain")],
        "Not found",
    )
        .into_response()
}

/// HTTP server configuration.
pub struct HttpServer<T> {
    scanner: SharedScanner<T>,
    listen_addr: SocketAddr,
    metrics_path: String,
    access_log: bool,
}

impl<T: RegisterTransport> HttpServer<T> {
    /// Create a new HTTP server.
    pub fn new(
        scanner: SharedScanner<T>,
        listen_addr: SocketAddr,
        metrics_path: String,
        access_log: bool,
    ) -> Self {
        Self {
            scanner,
            listen_addr,
            metrics_path,
            access_log,
        }
    }

    /// Bind the listener.
    ///
    /// Split from [`HttpServer::serve`] so bind failures surface before the
    /// server task is spawned.
    pub async fn bind(&self) -> anyhow::Result<tokio::net::TcpListener> {
        let listener = tokio::net::TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.listen_addr, e))?;

        info!(
            addr = %listener.local_addr()?,
            path = %self.metrics_path,
            "HTTP server listening"
        );

        Ok(listener)
    }

    /// Serve on `listener` until the shutdown signal is received.
    ///
    /// A scan already running when the signal arrives is allowed to finish.
    pub async fn serve(
        self,
        listener: tokio::net::TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let router = create_router(self.scanner, &self.metrics_path, self.access_log);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                loop {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!("HTTP server stopped");
        Ok(())
    }
}

/// Stop the server task, then release the transport.
///
/// The transport is closed even when the server task already ended or does
/// not stop within `grace`.
pub async fn shutdown<T: RegisterTransport>(
    shutdown_tx: &watch::Sender<bool>,
    server: JoinHandle<()>,
    scanner: &Scanner<T>,
    grace: Duration,
) {
    if shutdown_tx.send(true).is_err() {
        warn!("HTTP server already stopped");
    }

    match tokio::time::timeout(grace, server).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "HTTP server task failed"),
        Err(_) => error!("HTTP server did not stop in time"),
    }

    scanner.close().await;
}
