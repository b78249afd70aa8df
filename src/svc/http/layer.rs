//! # Layer module
//!
//! This module provides the access log middleware of the operator's http
//! server.

use std::time::Instant;

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderName, Request},
    middleware::Next,
    response::Response,
};
#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use prometheus::{register_int_counter_vec, IntCounterVec};
use tracing::{info, info_span, Instrument};

// -----------------------------------------------------------------------------
// Telemetry

#[cfg(feature = "metrics")]
static ACCESS_REQUEST: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "http_access_requests_count",
        "Number of access request",
        &["method", "host", "status"]
    )
    .expect("'http_access_requests_count' to not be already registered")
});

#[cfg(feature = "metrics")]
static ACCESS_REQUEST_DURATION: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "http_access_requests_duration",
        "Duration of access request",
        &["method", "host", "status"]
    )
    .expect("'http_access_requests_duration' to not be already registered")
});

// -----------------------------------------------------------------------------
// Helpers

const NONE: &str = "<none>";

fn value(headers: &HeaderMap, name: HeaderName) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or(NONE)
        .to_string()
}

// -----------------------------------------------------------------------------
// Access

/// logs every request once answered, probes of the kubelet included
#[tracing::instrument(skip_all)]
pub async fn access(req: Request<Body>, next: Next) -> Response {
    let method = req.method().to_string();
    let uri = req.uri().to_string();
    let headers = req.headers();

    let agent = value(headers, header::USER_AGENT);
    let forwarded = value(headers, header::FORWARDED);
    let host = match req.uri().host() {
        Some(host) => host.to_string(),
        None => value(headers, header::HOST),
    };

    let begin = Instant::now();
    let res = next.run(req).instrument(info_span!("next.run")).await;
    let duration = begin.elapsed().as_micros();
    let status = res.status().as_u16();

    #[cfg(feature = "metrics")]
    {
        let code = status.to_string();
        let labels = [method.as_str(), host.as_str(), code.as_str()];
        ACCESS_REQUEST.with_label_values(&labels).inc();
        ACCESS_REQUEST_DURATION
            .with_label_values(&labels)
            .inc_by(duration as u64);
    }

    info!(
        method = method,
        uri = uri,
        host = host,
        agent = agent,
        forwarded = forwarded,
        duration = format!("{duration}us"),
        status = status,
        "Request received"
    );

    res
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn missing_header_is_rendered_as_none() {
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static("kube-probe/1.24"));

        assert_eq!(value(&headers, header::USER_AGENT), "kube-probe/1.24");
        assert_eq!(value(&headers, header::FORWARDED), NONE);
    }
}
