//! # Logging module
//!
//! This module provides logging facilities and helpers

use tracing::Level;
use tracing_subscriber::{filter::LevelFilter, layer::SubscriberExt, Layer, Registry};

use crate::svc::cfg::Configuration;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to set global default subscriber, {0}")]
    GlobalDefaultSubscriber(tracing::subscriber::SetGlobalDefaultError),
}

// -----------------------------------------------------------------------------
// helpers

pub const fn level(verbosity: usize) -> Level {
    match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// installs the global subscriber, events are also forwarded to sentry when a
/// dsn is configured
#[cfg_attr(not(feature = "tracker"), allow(unused_variables))]
pub fn initialize(config: &Configuration, verbosity: usize) -> Result<(), Error> {
    let fmt = tracing_subscriber::fmt::layer()
        .with_thread_names(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(true)
        .with_filter(LevelFilter::from_level(level(verbosity)));

    let registry = Registry::default().with(fmt);

    #[cfg(feature = "tracker")]
    let registry = registry.with(config.sentry.dsn.as_ref().map(|_| sentry_tracing::layer()));

    tracing::subscriber::set_global_default(registry).map_err(Error::GlobalDefaultSubscriber)
}
