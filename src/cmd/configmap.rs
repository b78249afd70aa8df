//! # ConfigMap module
//!
//! This module renders the operator configuration as a kubernetes configmap,
//! ready to be mounted at `/etc/blackduck-operator/config.toml`

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use clap::Subcommand;
use k8s_openapi::api::core::v1;
use kube::api::ObjectMeta;

use crate::{cmd::Executor, svc::cfg::Configuration};

// -----------------------------------------------------------------------------
// Constants

pub const CONFIG_FILE: &str = "config.toml";

// -----------------------------------------------------------------------------
// ConfigMapError enum

#[derive(thiserror::Error, Debug)]
pub enum ConfigMapError {
    #[error("failed to serialize configmap, {0}")]
    Serialize(serde_yaml::Error),
    #[error("failed to encode configuration, {0}")]
    Encode(toml::ser::Error),
}

// -----------------------------------------------------------------------------
// ConfigMap enum

#[derive(Subcommand, Clone, Debug)]
pub enum ConfigMap {
    /// Generate a configmap holding the current configuration
    #[clap(name = "generate", aliases = &["g"])]
    Generate {
        /// Name of the configmap, defaults to the operator name
        #[clap(short = 'n', long = "name")]
        name: Option<String>,
        /// Namespace of the configmap, defaults to the operator namespace
        #[clap(short = 'N', long = "namespace")]
        namespace: Option<String>,
    },
}

#[async_trait]
impl Executor for ConfigMap {
    type Error = ConfigMapError;

    #[cfg_attr(feature = "trace", tracing::instrument(skip(config)))]
    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error> {
        match self {
            Self::Generate { namespace, name } => {
                let configmap = render(&config, name.to_owned(), namespace.to_owned())?;

                println!(
                    "{}",
                    serde_yaml::to_string(&configmap).map_err(ConfigMapError::Serialize)?
                );
                Ok(())
            }
        }
    }
}

// -----------------------------------------------------------------------------
// render function

pub fn render(
    config: &Configuration,
    name: Option<String>,
    namespace: Option<String>,
) -> Result<v1::ConfigMap, ConfigMapError> {
    let configuration = toml::to_string(config).map_err(ConfigMapError::Encode)?;

    Ok(v1::ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string())),
            namespace: Some(namespace.unwrap_or_else(|| config.operator.namespace.to_owned())),
            labels: Some(BTreeMap::from([(
                "app".to_string(),
                env!("CARGO_PKG_NAME").to_string(),
            )])),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(CONFIG_FILE.to_string(), configuration)])),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svc::testing;

    #[test]
    fn configmap_defaults_to_the_operator_namespace() {
        let config = testing::configuration();
        let configmap = render(&config, None, None).expect("configmap to render");

        assert_eq!(configmap.metadata.name.as_deref(), Some("blackduck-operator"));
        assert_eq!(
            configmap.metadata.namespace.as_deref(),
            Some(config.operator.namespace.as_str())
        );
    }

    #[test]
    fn embedded_configuration_loads_back() {
        let config = testing::configuration();
        let configmap = render(&config, Some("cfg".into()), Some("ops".into()))
            .expect("configmap to render");

        let data = configmap.data.unwrap_or_default();
        let decoded: Configuration =
            toml::from_str(&data[CONFIG_FILE]).expect("configuration to be decoded");

        assert_eq!(decoded, config);
        assert_eq!(configmap.metadata.namespace.as_deref(), Some("ops"));
    }
}
