//! # Black Duck operator
//!
//! A kubernetes operator that deploys and reconciles black duck instances
//! through custom resource definition

use std::{convert::TryFrom, sync::Arc};

use clap::Parser;
use tracing::{error, info};

use crate::{
    cmd::{daemon, Args, Executor},
    svc::cfg::Configuration,
};

pub mod cmd;
pub mod logging;
pub mod svc;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to interact with command line interface, {0}")]
    Command(cmd::Error),
    #[error("failed to initialize logging system, {0}")]
    Logging(logging::Error),
    #[error("failed to load configuration, {0}")]
    Configuration(svc::cfg::Error),
}

impl From<cmd::Error> for Error {
    fn from(err: cmd::Error) -> Self {
        Self::Command(err)
    }
}

impl From<logging::Error> for Error {
    fn from(err: logging::Error) -> Self {
        Self::Logging(err)
    }
}

impl From<svc::cfg::Error> for Error {
    fn from(err: svc::cfg::Error) -> Self {
        Self::Configuration(err)
    }
}

// -----------------------------------------------------------------------------
// helpers

fn configuration(args: &Args) -> Result<Arc<Configuration>, Error> {
    let config = match &args.config {
        Some(path) => Configuration::try_from(path.to_owned())?,
        None => Configuration::try_default()?,
    };

    Ok(Arc::new(config))
}

/// errors are forwarded to sentry for as long as the guard lives
#[cfg(feature = "tracker")]
fn tracker(config: &Configuration) -> Option<sentry::ClientInitGuard> {
    let dsn = config.sentry.dsn.as_deref()?;

    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}

// -----------------------------------------------------------------------------
// main entrypoint

#[tokio::main]
pub(crate) async fn main() -> Result<(), Error> {
    let args = Args::parse();
    let config = configuration(&args)?;

    logging::initialize(&config, args.verbosity as usize)?;
    config.help();

    #[cfg(feature = "tracker")]
    let _guard = tracker(&config);

    if args.check {
        println!("{} configuration is healthy!", env!("CARGO_PKG_NAME"));
        return Ok(());
    }

    let result = match args.command {
        Some(cmd) => cmd.execute(config).await,
        None => daemon(args.kubeconfig, config).await,
    };

    if let Err(err) = result {
        error!(error = err.to_string(), "Could not execute {} properly", env!("CARGO_PKG_NAME"));
        return Err(Error::Command(err));
    }

    info!("{} halted!", env!("CARGO_PKG_NAME"));
    Ok(())
}
