//! Per-request dispatch inside a worker.
//!
//! # Responsibilities
//! - Build the axum router served on one listening address
//! - Resolve the request against the current handler snapshot
//! - Run the handler query on the blocking pool with the request bound
//! - Materialize and serialize the handler's response
//!
//! # Design Decisions
//! - The snapshot `Arc` is loaded once and held until the response is built,
//!   so a reload never changes the handler mid-request
//! - Handler failures become a generic 500; details go to the log only
//! - A dropped request future (client gone) interrupts the running query
//! - A panicking executor is reported to the worker, which exits

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{ListenAddress, SnapshotPublisher};
use crate::host::{ExecutionError, Interrupt, QueryExecutor, RequestBinding};
use crate::observability::metrics;
use crate::response::{build_response, into_http_response, HeaderTriple, Headers};
use crate::worker::WorkerId;

/// Everything a request needs, cloned into each handler invocation.
#[derive(Clone)]
pub struct DispatchState {
    pub worker: WorkerId,
    pub listen: ListenAddress,
    pub snapshots: SnapshotPublisher,
    pub executor: Arc<dyn QueryExecutor>,
    pub max_body_size: usize,
    /// Reports executor panics to the owning worker loop.
    pub fatal: mpsc::UnboundedSender<String>,
}

/// Build the router served on one listening address.
#[allow(deprecated)]
pub fn build_router(state: DispatchState, request_timeout: Duration) -> Router {
    Router::new().fallback(dispatch).with_state(state).layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(TraceLayer::new_for_http())
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TimeoutLayer::new(request_timeout)),
    )
}

async fn dispatch(State(state): State<DispatchState>, request: Request<Body>) -> Response {
    let start = Instant::now();
    let response = handle(&state, request).await;
    metrics::record_request(response.status().as_u16(), start);
    response
}

async fn handle(state: &DispatchState, request: Request<Body>) -> Response {
    let snapshot = state.snapshots.load();
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();

    let Some(handler) = snapshot.resolve(&state.listen, &parts.method, &path) else {
        tracing::debug!(
            worker = %state.worker,
            listen = %state.listen,
            method = %parts.method,
            path = %path,
            version = snapshot.version(),
            "No handler matched"
        );
        return (StatusCode::NOT_FOUND, "Not Found").into_response();
    };
    let handler_id = handler.id;
    let query = handler.query.clone();

    let body = match axum::body::to_bytes(body, state.max_body_size).await {
        Ok(body) => body,
        Err(e) => {
            tracing::debug!(handler = %handler_id, error = %e, "Request body rejected");
            return (StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large").into_response();
        }
    };

    let binding = RequestBinding {
        method: parts.method,
        path,
        query_string: parts.uri.query().map(str::to_string),
        body,
        headers: request_headers(&parts.headers),
    };

    let interrupt = Interrupt::new();
    let on_disconnect = interrupt.on_drop();
    let executor = state.executor.clone();
    let outcome =
        tokio::task::spawn_blocking(move || executor.execute(&query, &binding, &interrupt)).await;
    on_disconnect.disarm();

    let parts = match outcome {
        Ok(Ok(parts)) => parts,
        Ok(Err(ExecutionError::Canceled)) => {
            tracing::debug!(handler = %handler_id, "Handler query canceled");
            return internal_error();
        }
        Ok(Err(e)) => {
            tracing::warn!(handler = %handler_id, error = %e, "Handler query failed");
            return internal_error();
        }
        Err(join) if join.is_panic() => {
            let message = panic_message(join.into_panic());
            tracing::error!(handler = %handler_id, panic = %message, "Executor panicked");
            let _ = state.fatal.send(message);
            return internal_error();
        }
        Err(join) => {
            tracing::error!(handler = %handler_id, error = %join, "Executor task failed");
            return internal_error();
        }
    };

    let record = match build_response(parts) {
        Ok(record) => record,
        Err(e) => {
            tracing::warn!(handler = %handler_id, error = %e, "Handler returned an unusable body");
            return internal_error();
        }
    };

    match into_http_response(record) {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(handler = %handler_id, error = %e, "Handler response not serializable");
            internal_error()
        }
    }
}

fn internal_error() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
}

/// Request headers as `http_header[]`, in arrival order.
fn request_headers(map: &HeaderMap) -> Headers {
    map.iter()
        .map(|(name, value)| {
            HeaderTriple::add(name.as_str(), String::from_utf8_lossy(value.as_bytes()))
        })
        .collect()
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "executor panicked".to_string()
    }
}
