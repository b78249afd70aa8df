//! # HTTP module
//!
//! This module exposes the liveness, readiness, status and metrics endpoints
//! of the operator

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, Request, Response, StatusCode},
};
use serde_json::{json, Value};

use crate::svc::k8s::{queue::WorkQueue, resource::ObjectKey};

pub mod layer;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod server;

// -----------------------------------------------------------------------------
// Health structure

/// state shared by the handlers, the operator is ready as long as its work
/// queue accepts keys
#[derive(Clone)]
pub struct Health {
    queue: Arc<WorkQueue<ObjectKey>>,
}

impl From<Arc<WorkQueue<ObjectKey>>> for Health {
    fn from(queue: Arc<WorkQueue<ObjectKey>>) -> Self {
        Self { queue }
    }
}

// -----------------------------------------------------------------------------
// Helpers

fn json(status: StatusCode, value: Value) -> Response<Body> {
    let message = value.to_string();
    let mut res = Response::default();

    if let Ok(value) = HeaderValue::from_str(mime::APPLICATION_JSON.as_ref()) {
        res.headers_mut().insert(header::CONTENT_TYPE, value);
    }

    *res.status_mut() = status;
    *res.body_mut() = Body::from(message);
    res
}

// -----------------------------------------------------------------------------
// Handlers

#[tracing::instrument(skip_all)]
pub async fn not_found(_req: Request<Body>) -> Response<Body> {
    let mut res = Response::default();

    *res.status_mut() = StatusCode::NOT_FOUND;
    res
}

#[tracing::instrument(skip_all)]
pub async fn livez() -> Response<Body> {
    json(StatusCode::OK, json!({"message": "operator is alive"}))
}

#[tracing::instrument(skip_all)]
pub async fn readyz(State(health): State<Health>) -> Response<Body> {
    if health.queue.is_shutting_down() {
        return json(
            StatusCode::SERVICE_UNAVAILABLE,
            json!({"message": "operator is shutting down"}),
        );
    }

    json(StatusCode::OK, json!({"message": "operator is ready"}))
}

#[tracing::instrument(skip_all)]
pub async fn status(State(health): State<Health>) -> Response<Body> {
    json(
        StatusCode::OK,
        json!({
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "queue": health.queue.len(),
            "shuttingDown": health.queue.is_shutting_down(),
        }),
    )
}
