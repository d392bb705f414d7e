use std::any::Any;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use log::error;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;

#[derive(Serialize)]
struct StatusBody {
    status: &'static str,
}

#[derive(Serialize)]
struct ApiError {
    error: &'static str,
}

/// The local status surface. It never reflects the agent's internal state.
pub fn router() -> Router {
    with_error_handling(
        Router::new()
            .route("/", get(root))
            .route("/status", get(status)),
    )
}

fn with_error_handling(routes: Router) -> Router {
    routes
        .fallback(not_found)
        .layer(CatchPanicLayer::custom(handle_panic))
}

async fn root() -> &'static str {
    "SillyCoins Harvester is running"
}

async fn status() -> Json<StatusBody> {
    Json(StatusBody { status: "harvesting" })
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(ApiError { error: "Not Found" })).into_response()
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    internal_error(detail)
}

/// Converts an unhandled handler failure into the generic 500 body.
fn internal_error(err: impl std::fmt::Display) -> Response {
    error!("Unhandled error: {}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiError { error: "Internal Server Error" }),
    )
        .into_response()
}

#[derive(Debug)]
pub enum BindError {
    PermissionDenied { port: u16 },
    AddrInUse { port: u16 },
    Io(std::io::Error),
}

impl std::fmt::Display for BindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindError::PermissionDenied { port } => write!(f, "Port {} requires elevated privileges (EACCES)", port),
            BindError::AddrInUse { port } => write!(f, "Port {} is already in use (EADDRINUSE)", port),
            BindError::Io(e) => write!(f, "Failed to bind listener: {}", e),
        }
    }
}

impl std::error::Error for BindError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BindError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl BindError {
    /// Privileged and in-use ports end the process with status 1.
    pub fn is_fatal_exit(&self) -> bool {
        matches!(self, BindError::PermissionDenied { .. } | BindError::AddrInUse { .. })
    }

    fn classify(port: u16, err: std::io::Error) -> Self {
        match err.kind() {
            ErrorKind::PermissionDenied => BindError::PermissionDenied { port },
            ErrorKind::AddrInUse => BindError::AddrInUse { port },
            _ => BindError::Io(err),
        }
    }
}

pub async fn bind(port: u16) -> Result<TcpListener, BindError> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    TcpListener::bind(addr)
        .await
        .map_err(|e| BindError::classify(port, e))
}
