//! # Configuration module
//!
//! This module provide utilities and helpers to interact with the configuration

use std::{convert::TryFrom, net::SocketAddr, path::PathBuf, time::Duration};

use config::{builder::DefaultState, Config, ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// -----------------------------------------------------------------------------
// Constants

pub const OPERATOR_NAMESPACE: &str = "synopsys-operator";
pub const OPERATOR_LISTEN: &str = "0.0.0.0:8000";
pub const OPERATOR_CREDENTIALS: &str = "blackduck-secret";
pub const CLONE_IMAGE: &str = "registry.access.redhat.com/rhscl/postgresql-96-rhel7:1";
pub const PROBER_PATH: &str = "/api/current-version";

// -----------------------------------------------------------------------------
// Operator structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Operator {
    #[serde(rename = "namespace")]
    pub namespace: String,
    #[serde(rename = "listen")]
    pub listen: SocketAddr,
    #[serde(rename = "workers")]
    pub workers: usize,
    /// periodic resync interval in seconds, zero disables it
    #[serde(rename = "resync")]
    pub resync: u64,
    #[serde(rename = "cluster_scoped")]
    pub cluster_scoped: bool,
    /// name of the secret in the operator namespace that holds generated passwords
    #[serde(rename = "credentials")]
    pub credentials: String,
}

// -----------------------------------------------------------------------------
// Queue structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Queue {
    /// in milliseconds
    #[serde(rename = "base_delay")]
    pub base_delay: u64,
    /// in seconds
    #[serde(rename = "max_delay")]
    pub max_delay: u64,
    #[serde(rename = "max_retries")]
    pub max_retries: u32,
}

// -----------------------------------------------------------------------------
// Prober structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Prober {
    #[serde(rename = "attempts")]
    pub attempts: u32,
    #[serde(rename = "interval")]
    pub interval: u64,
    #[serde(rename = "timeout")]
    pub timeout: u64,
    #[serde(rename = "path")]
    pub path: String,
}

// -----------------------------------------------------------------------------
// Network structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Network {
    #[serde(rename = "attempts")]
    pub attempts: u32,
    #[serde(rename = "interval")]
    pub interval: u64,
}

// -----------------------------------------------------------------------------
// Database structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Database {
    /// connectivity retry interval, the wait itself is unbounded
    #[serde(rename = "interval")]
    pub interval: u64,
    #[serde(rename = "clone_attempts")]
    pub clone_attempts: u32,
    #[serde(rename = "clone_interval")]
    pub clone_interval: u64,
    #[serde(rename = "clone_image")]
    pub clone_image: String,
}

// -----------------------------------------------------------------------------
// Defaults structure

/// operator-wide values used when an instance does not set them
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Defaults {
    /// unset means the latest supported release
    #[serde(rename = "version", default)]
    pub version: Option<String>,
    #[serde(rename = "size")]
    pub size: String,
    #[serde(rename = "expose_service")]
    pub expose_service: String,
    #[serde(rename = "persistent_storage")]
    pub persistent_storage: bool,
    #[serde(rename = "liveness_probes")]
    pub liveness_probes: bool,
    #[serde(rename = "certificate_name")]
    pub certificate_name: String,
    #[serde(rename = "pvc_storage_class", default)]
    pub pvc_storage_class: Option<String>,
}

// -----------------------------------------------------------------------------
// Sentry structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Sentry {
    #[serde(rename = "dsn", default)]
    pub dsn: Option<String>,
}

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to build configuration, {0}")]
    Build(ConfigError),
    #[error("failed to deserialize configuration, {0}")]
    Cast(ConfigError),
    #[error("failed to set default for key '{0}', {1}")]
    Default(String, ConfigError),
    #[error("invalid configuration for key '{0}', {1}")]
    Invalid(String, String),
}

// -----------------------------------------------------------------------------
// Configuration structures

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Configuration {
    #[serde(rename = "operator")]
    pub operator: Operator,
    #[serde(rename = "queue")]
    pub queue: Queue,
    #[serde(rename = "prober")]
    pub prober: Prober,
    #[serde(rename = "network")]
    pub network: Network,
    #[serde(rename = "database")]
    pub database: Database,
    #[serde(rename = "defaults")]
    pub defaults: Defaults,
    #[serde(rename = "sentry", default)]
    pub sentry: Sentry,
}

impl TryFrom<PathBuf> for Configuration {
    type Error = Error;

    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        defaults(Config::builder())?
            .add_source(environment())
            .add_source(File::from(path).required(true))
            .build()
            .map_err(Error::Build)?
            .try_deserialize::<Self>()
            .map_err(Error::Cast)?
            .validate()
    }
}

impl Configuration {
    pub fn try_default() -> Result<Self, Error> {
        let mut builder = defaults(Config::builder())?.add_source(environment());

        let mut paths = vec![
            PathBuf::from(format!("/usr/share/{}/config", env!("CARGO_PKG_NAME"))),
            PathBuf::from(format!("/etc/{}/config", env!("CARGO_PKG_NAME"))),
        ];

        if let Some(home) = std::env::var_os("HOME") {
            let home = PathBuf::from(home);
            paths.push(home.join(".config").join(env!("CARGO_PKG_NAME")).join("config"));
            paths.push(
                home.join(".local")
                    .join("share")
                    .join(env!("CARGO_PKG_NAME"))
                    .join("config"),
            );
        }

        paths.push(PathBuf::from("config"));
        for path in paths {
            builder = builder.add_source(File::from(path).required(false));
        }

        builder
            .build()
            .map_err(Error::Build)?
            .try_deserialize::<Self>()
            .map_err(Error::Cast)?
            .validate()
    }

    fn validate(self) -> Result<Self, Error> {
        if self.operator.workers == 0 {
            return Err(Error::Invalid(
                "operator.workers".into(),
                "at least one worker is required".into(),
            ));
        }

        if self.queue.base_delay == 0 {
            return Err(Error::Invalid(
                "queue.base_delay".into(),
                "backoff base delay must be greater than zero".into(),
            ));
        }

        if self.prober.timeout == 0 {
            return Err(Error::Invalid(
                "prober.timeout".into(),
                "probe timeout must be greater than zero".into(),
            ));
        }

        Ok(self)
    }

    /// print diagnostics about the loaded configuration
    pub fn help(&self) {
        info!(
            namespace = &self.operator.namespace,
            cluster_scoped = self.operator.cluster_scoped,
            workers = self.operator.workers,
            "Configuration loaded"
        );

        if self.operator.resync == 0 {
            warn!("Periodic resynchronisation is disabled, dropped keys will only be retried on watch events");
        }

        if self.sentry.dsn.is_none() {
            info!("Sentry dsn is not set, errors will not be forwarded to an error tracker");
        }
    }

    pub fn resync(&self) -> Option<Duration> {
        match self.operator.resync {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

// -----------------------------------------------------------------------------
// Helpers

fn environment() -> Environment {
    Environment::with_prefix(&env!("CARGO_PKG_NAME").replace('-', "_")).separator("__")
}

fn defaults(
    builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, Error> {
    let values: Vec<(&str, config::Value)> = vec![
        ("operator.namespace", OPERATOR_NAMESPACE.into()),
        ("operator.listen", OPERATOR_LISTEN.into()),
        ("operator.workers", 2_i64.into()),
        ("operator.resync", 300_i64.into()),
        ("operator.cluster_scoped", false.into()),
        ("operator.credentials", OPERATOR_CREDENTIALS.into()),
        ("queue.base_delay", 5_i64.into()),
        ("queue.max_delay", 1000_i64.into()),
        ("queue.max_retries", 15_i64.into()),
        ("prober.attempts", 120_i64.into()),
        ("prober.interval", 10_i64.into()),
        ("prober.timeout", 5_i64.into()),
        ("prober.path", PROBER_PATH.into()),
        ("network.attempts", 10_i64.into()),
        ("network.interval", 10_i64.into()),
        ("database.interval", 5_i64.into()),
        ("database.clone_attempts", 180_i64.into()),
        ("database.clone_interval", 10_i64.into()),
        ("database.clone_image", CLONE_IMAGE.into()),
        ("defaults.size", "small".into()),
        ("defaults.expose_service", "LoadBalancer".into()),
        ("defaults.persistent_storage", false.into()),
        ("defaults.liveness_probes", false.into()),
        ("defaults.certificate_name", "default".into()),
    ];

    values.into_iter().try_fold(builder, |builder, (key, value)| {
        builder
            .set_default(key, value)
            .map_err(|err| Error::Default(key.to_string(), err))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load() -> Configuration {
        defaults(Config::builder())
            .expect("defaults to be valid")
            .build()
            .expect("configuration to build")
            .try_deserialize::<Configuration>()
            .expect("configuration to deserialize")
    }

    #[test]
    fn defaults_are_complete() {
        let config = load().validate().expect("defaults to be valid");

        assert_eq!(config.operator.namespace, OPERATOR_NAMESPACE);
        assert_eq!(config.operator.workers, 2);
        assert_eq!(config.prober.attempts, 120);
        assert_eq!(config.prober.path, PROBER_PATH);
        assert_eq!(config.network.attempts, 10);
        assert_eq!(config.database.clone_image, CLONE_IMAGE);
        assert_eq!(config.defaults.size, "small");
        assert_eq!(config.defaults.version, None);
        assert_eq!(config.resync(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn zero_workers_is_rejected() {
        let mut config = load();
        config.operator.workers = 0;

        assert!(matches!(config.validate(), Err(Error::Invalid(key, _)) if key == "operator.workers"));
    }

    #[test]
    fn zero_resync_disables_it() {
        let mut config = load();
        config.operator.resync = 0;

        assert_eq!(config.resync(), None);
    }
}
