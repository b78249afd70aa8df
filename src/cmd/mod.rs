//! # Command module
//!
//! This module provide command line interface structures and helpers
use std::{io, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use clap::{ArgAction, Parser, Subcommand};
use kube::Api;
use tokio::sync::Notify;
use tracing::{error, info};

use crate::svc::{
    blackduck::Reconciler,
    cfg::Configuration,
    crd::blackduck::Blackduck,
    database::{Helper, PostgresConnector},
    http,
    k8s::{
        client::{self, KubeClient},
        controller::Controller,
        deployer::KubeDeployer,
        informer::Informer,
        queue::{Backoff, WorkQueue},
    },
    prober::{self, HttpProbe},
};

pub mod configmap;
pub mod crd;

// -----------------------------------------------------------------------------
// Executor trait

#[async_trait]
pub trait Executor {
    type Error;

    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error>;
}

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to execute command '{0}', {1}")]
    Execution(String, Arc<Error>),
    #[error("failed to execute command, {0}")]
    CustomResourceDefinition(crd::CustomResourceDefinitionError),
    #[error("failed to execute command, {0}")]
    ConfigMap(configmap::ConfigMapError),
    #[error("failed to handle termination signal, {0}")]
    SigTerm(io::Error),
    #[error("failed to create kubernetes client, {0}")]
    Client(client::Error),
    #[error("failed to create health check client, {0}")]
    Prober(prober::Error),
}

// -----------------------------------------------------------------------------
// Command enumeration

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Interact with custom resource definition
    #[clap(name = "custom-resource-definition", aliases = &["crd"], subcommand)]
    CustomResourceDefinition(crd::CustomResourceDefinition),
    /// Interact with the configuration of the operator
    #[clap(name = "configmap", aliases = &["cm"], subcommand)]
    ConfigMap(configmap::ConfigMap),
}

#[async_trait]
impl Executor for Command {
    type Error = Error;

    #[cfg_attr(feature = "trace", tracing::instrument(skip(config)))]
    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error> {
        match self {
            Self::CustomResourceDefinition(crd) => crd
                .execute(config)
                .await
                .map_err(Error::CustomResourceDefinition)
                .map_err(|err| Error::Execution("custom-resource-definition".into(), Arc::new(err))),
            Self::ConfigMap(configmap) => configmap
                .execute(config)
                .await
                .map_err(Error::ConfigMap)
                .map_err(|err| Error::Execution("configmap".into(), Arc::new(err))),
        }
    }
}

// -----------------------------------------------------------------------------
// Args structure

#[derive(Parser, Clone, Debug)]
#[clap(author, version, about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct Args {
    /// Increase log verbosity
    #[clap(short = 'v', global = true, action = ArgAction::Count)]
    pub verbosity: u8,
    /// Specify location of kubeconfig
    #[clap(short = 'k', long = "kubeconfig", global = true)]
    pub kubeconfig: Option<PathBuf>,
    /// Specify location of configuration
    #[clap(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,
    /// Check if configuration is healthy
    #[clap(short = 't', long = "check", global = true)]
    pub check: bool,
    #[clap(subcommand)]
    pub command: Option<Command>,
}

// -----------------------------------------------------------------------------
// daemon function

#[cfg_attr(feature = "trace", tracing::instrument(skip(config)))]
pub async fn daemon(kubeconfig: Option<PathBuf>, config: Arc<Configuration>) -> Result<(), Error> {
    // -------------------------------------------------------------------------
    // Create a new kubernetes client from path if defined, or via the
    // environment or defaults locations
    let kube = client::try_new(kubeconfig).await.map_err(Error::Client)?;

    // -------------------------------------------------------------------------
    // Create the work queue and the informer feeding it
    let queue = Arc::new(WorkQueue::new("blackduck", Backoff::from(&config.queue)));

    let api: Api<Blackduck> = if config.operator.cluster_scoped {
        Api::all(kube.to_owned())
    } else {
        Api::namespaced(kube.to_owned(), &config.operator.namespace)
    };

    let informer = Informer::new(api, queue.to_owned(), config.resync());
    let store = Arc::new(informer.store());

    // -------------------------------------------------------------------------
    // Create the reconciler and its collaborators
    let client = Arc::new(KubeClient::from(kube.to_owned()));
    let lifecycle = Helper::new(
        client.to_owned(),
        Arc::new(PostgresConnector),
        config.database.to_owned(),
    );
    let probe = HttpProbe::try_from(&config.prober).map_err(Error::Prober)?;

    let reconciler = Reconciler::new(
        client,
        Arc::new(KubeDeployer::from(kube)),
        Arc::new(lifecycle),
        Arc::new(probe),
        config.to_owned(),
    );

    let controller = Controller::new(
        queue.to_owned(),
        store,
        Arc::new(reconciler),
        config.operator.workers,
    );

    // -------------------------------------------------------------------------
    // Start the informer, the controller workers and the http server
    info!(cluster_scoped = config.operator.cluster_scoped, namespace = &config.operator.namespace, "Start to listen for events of black duck custom resource");
    let informer = tokio::spawn(informer.run());
    let controller = tokio::spawn(controller.run());

    let listen = config.operator.listen;
    let router = http::server::router(http::Health::from(queue.to_owned()));
    let stopped = Arc::new(Notify::new());
    let server = tokio::spawn({
        let stopped = stopped.to_owned();
        async move {
            let shutdown = async move { stopped.notified().await };
            if let Err(err) = http::server::serve(router, listen, shutdown).await {
                error!(error = err.to_string(), "Could not serve http requests");
            }
        }
    });

    // -------------------------------------------------------------------------
    // Wait for termination signal
    tokio::signal::ctrl_c().await.map_err(Error::SigTerm)?;

    // -------------------------------------------------------------------------
    // Stop accepting keys, let in-flight reconciliations complete
    info!("Received termination signal, drain the work queue");
    queue.shut_down();
    informer.abort();

    if let Err(err) = controller.await {
        error!(error = err.to_string(), "Could not wait for the controller to complete");
    }

    stopped.notify_one();
    if let Err(err) = server.await {
        error!(error = err.to_string(), "Could not wait for the http server to complete");
    }

    if let Err(err) = informer.await {
        if !err.is_cancelled() {
            error!(error = err.to_string(), "Could not wait for the informer to complete");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn arguments_are_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn verbosity_is_counted() {
        let args = Args::parse_from(["blackduck-operator", "-vvv", "-t"]);

        assert_eq!(args.verbosity, 3);
        assert!(args.check);
        assert!(args.command.is_none());
    }

    #[test]
    fn crd_view_is_a_subcommand() {
        let args = Args::parse_from(["blackduck-operator", "crd", "view"]);

        assert!(matches!(
            args.command,
            Some(Command::CustomResourceDefinition(crd::CustomResourceDefinition::View))
        ));
    }
}
