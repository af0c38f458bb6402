//! Local entropy proxy speaking the sealed-envelope byte payload contract.
//!
//! Serves OS CSPRNG bytes over HTTP in the same JSON shape the hardware
//! and quantum proxies use, so sessions and the HTTP adapter can be
//! exercised end to end without external hardware:
//!
//! ```text
//! GET /api/v1/bytes?length=N&source=<label>
//! → { "success": true, "bytes": [...], "source": "sealed-server/os-csprng", "server_time": "..." }
//! ```
//!
//! The server never pretends to be another source: the `source` field
//! always names the local generator, whatever label the client asked for.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    Router,
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
};
use serde::{Deserialize, Serialize};

use sealed_core::{EntropyPayload, EntropySource, LocalSecureSource, now_iso8601};

/// Label reported in every payload.
pub const SERVED_SOURCE: &str = "sealed-server/os-csprng";

/// Default per-request byte cap.
pub const DEFAULT_MAX_LENGTH: usize = 65536;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    pub max_length: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_length: DEFAULT_MAX_LENGTH,
        }
    }
}

/// Shared server state.
struct AppState {
    source: LocalSecureSource,
    options: ServerOptions,
    requests: AtomicU64,
    bytes_served: AtomicU64,
    failures: AtomicU64,
}

#[derive(Deserialize)]
struct BytesParams {
    length: Option<usize>,
    /// Label the client expects; logged, never echoed as provenance.
    source: Option<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    source: String,
    requests: u64,
    bytes_served: u64,
    failures: u64,
}

async fn handle_bytes(
    State(state): State<Arc<AppState>>,
    Query(params): Query<BytesParams>,
) -> (StatusCode, Json<EntropyPayload>) {
    state.requests.fetch_add(1, Ordering::Relaxed);
    let length = params.length.unwrap_or(0);
    if length == 0 || length > state.options.max_length {
        state.failures.fetch_add(1, Ordering::Relaxed);
        return (
            StatusCode::BAD_REQUEST,
            Json(EntropyPayload::failure(format!(
                "length must be between 1 and {}",
                state.options.max_length
            ))),
        );
    }
    if let Some(ref requested) = params.source {
        log::debug!("request for {length} bytes labelled '{requested}'");
    }

    match state.source.fetch(length).await {
        Ok(batch) => {
            state.bytes_served.fetch_add(length as u64, Ordering::Relaxed);
            (
                StatusCode::OK,
                Json(EntropyPayload::ok(&batch.bytes, SERVED_SOURCE, Some(now_iso8601()))),
            )
        }
        Err(e) => {
            state.failures.fetch_add(1, Ordering::Relaxed);
            log::error!("OS generator failed: {e}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(EntropyPayload::failure(e.to_string())),
            )
        }
    }
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        source: SERVED_SOURCE.to_string(),
        requests: state.requests.load(Ordering::Relaxed),
        bytes_served: state.bytes_served.load(Ordering::Relaxed),
        failures: state.failures.load(Ordering::Relaxed),
    })
}

async fn handle_index(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "Sealed Envelope Entropy Proxy",
        "version": sealed_core::VERSION,
        "source": SERVED_SOURCE,
        "endpoints": {
            "/": "This API index",
            "/api/v1/bytes": {
                "method": "GET",
                "description": "Get raw random bytes",
                "params": {
                    "length": format!("Number of bytes (1-{})", state.options.max_length),
                    "source": "Label the client expects (informational)",
                }
            },
            "/health": "Health check and counters",
        },
        "examples": {
            "bytes": "/api/v1/bytes?length=32&source=hardware-proxy",
        }
    }))
}

/// Build the axum router.
pub fn build_router(options: ServerOptions) -> Router {
    let state = Arc::new(AppState {
        source: LocalSecureSource::new(),
        options,
        requests: AtomicU64::new(0),
        bytes_served: AtomicU64::new(0),
        failures: AtomicU64::new(0),
    });

    Router::new()
        .route("/", get(handle_index))
        .route("/api/v1/bytes", get(handle_bytes))
        .route("/health", get(handle_health))
        .with_state(state)
}

/// Serve on an already bound listener.
pub async fn serve(listener: tokio::net::TcpListener, options: ServerOptions) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        log::info!("entropy proxy listening on http://{addr}");
    }
    axum::serve(listener, build_router(options)).await
}

/// Run the HTTP entropy proxy.
pub async fn run_server(host: &str, port: u16, options: ServerOptions) -> std::io::Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    serve(listener, options).await
}
