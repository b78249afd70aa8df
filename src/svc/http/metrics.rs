//! # Prometheus module
//!
//! This module exports the registered collectors, reconciliation and queue
//! counters included, using the prometheus text format

use axum::{
    body::Body,
    http::{header, HeaderValue, Request, Response, StatusCode},
};
use prometheus::{Encoder, TextEncoder};
use serde_json::json;
use tracing::error;

use crate::svc::http;

// -----------------------------------------------------------------------------
// handler

#[tracing::instrument(skip_all)]
pub async fn handler(_req: Request<Body>) -> Response<Body> {
    let encoder = TextEncoder::new();

    let mut buf = vec![];
    if let Err(err) = encoder.encode(&prometheus::gather(), &mut buf) {
        error!(error = err.to_string(), "Failed to encode metrics");
        return http::json(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"error": err.to_string()}),
        );
    }

    let mut res = Response::new(Body::from(buf));
    if let Ok(value) = HeaderValue::from_str(encoder.format_type()) {
        res.headers_mut().insert(header::CONTENT_TYPE, value);
    }

    res
}
