//! # Server module
//!
//! This module provides the operator's http server, routed with [`axum`].

use std::{future::Future, net::SocketAddr};

use axum::{
    middleware,
    routing::{any, get},
    Router,
};
use tokio::net::TcpListener;
use tracing::info;

#[cfg(feature = "metrics")]
use crate::svc::http::metrics;
use crate::svc::http::{layer, livez, not_found, readyz, status, Health};

// -----------------------------------------------------------------------------
// Error

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to bind on socket '{0}', {1}")]
    Bind(SocketAddr, std::io::Error),
    #[error("failed to listen on socket '{0}', {1}")]
    Serve(SocketAddr, std::io::Error),
}

// -----------------------------------------------------------------------------
// router

pub fn router(health: Health) -> Router {
    let router = Router::new()
        .route("/healthz", get(livez))
        .route("/livez", get(livez))
        .route("/readyz", get(readyz))
        .route("/status", get(status));

    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(metrics::handler));

    router
        .fallback(any(not_found))
        .layer(middleware::from_fn(layer::access))
        .with_state(health)
}

// -----------------------------------------------------------------------------
// helpers

/// serves requests until `shutdown` completes, in-flight requests are
/// answered before returning
#[tracing::instrument(skip(router, shutdown))]
pub async fn serve<F>(router: Router, addr: SocketAddr, shutdown: F) -> Result<(), Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|err| Error::Bind(addr, err))?;

    info!(addr = addr.to_string(), "Begin to listen on address");
    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|err| Error::Serve(addr, err))?;

    info!(addr = addr.to_string(), "Stop to listen on address");
    Ok(())
}
