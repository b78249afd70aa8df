//! # Client module
//!
//! This module provide an helper to create a kubernetes client and the
//! [`ResourceClient`] surface the reconciler relies on to read and mutate the
//! cluster.

use std::{collections::BTreeMap, convert::TryFrom, fmt::Debug, path::PathBuf};

use async_trait::async_trait;
use k8s_openapi::{
    api::{
        batch::v1::Job,
        core::v1::{Namespace, PersistentVolume, PersistentVolumeClaim, Secret, Service},
    },
    apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
};
use kube::{
    api::{ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig, KubeconfigError},
    Api, Config, CustomResourceExt,
};
use serde_json::json;
use tracing::debug;

use crate::svc::{
    crd::blackduck::Blackduck,
    k8s::{
        recorder::{self, event::Reporter, Level},
        resource::{self, ObjectKey},
    },
};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to read kubernetes configuration file, {0}")]
    Kubeconfig(KubeconfigError),
    #[error("failed to create kubernetes client, {0}")]
    CreateClient(kube::Error),
}

#[cfg_attr(feature = "trace", tracing::instrument)]
/// returns a new kubernetes client from the given path if defined
/// or retrieve it from environment or defaults paths
pub async fn try_new(path: Option<PathBuf>) -> Result<kube::Client, Error> {
    let config = match path {
        None => Config::infer()
            .await
            .map_err(|err| Error::CreateClient(kube::Error::InferConfig(err)))?,
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(Error::Kubeconfig)?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(Error::Kubeconfig)?
        }
    };

    kube::Client::try_from(config).map_err(Error::CreateClient)
}

// -----------------------------------------------------------------------------
// Helpers

/// returns the api resource of openshift routes
pub fn route_api_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("route.openshift.io", "v1", "Route"),
        "routes",
    )
}

/// returns if the error is a 404 answered by the api server
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

// -----------------------------------------------------------------------------
// ResourceClient trait

/// read and write primitives against the orchestrator, every method maps to a
/// single api call
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// fetch the instance from the api server, bypassing the informer cache
    async fn get_instance(&self, key: &ObjectKey) -> Result<Option<Blackduck>, kube::Error>;

    /// write the status difference between `origin` and `modified`
    async fn patch_instance_status(
        &self,
        origin: &Blackduck,
        modified: &Blackduck,
    ) -> Result<(), kube::Error>;

    /// returns if the black duck custom resource definition exists and is not
    /// being deleted
    async fn crd_active(&self) -> Result<bool, kube::Error>;

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, kube::Error>;

    async fn list_namespaces(&self, selector: &str) -> Result<Vec<Namespace>, kube::Error>;

    /// merge the given labels in the namespace, a none value removes the label
    async fn patch_namespace_labels(
        &self,
        name: &str,
        labels: BTreeMap<String, Option<String>>,
    ) -> Result<(), kube::Error>;

    async fn delete_namespace(&self, name: &str) -> Result<(), kube::Error>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, kube::Error>;

    async fn get_service(&self, namespace: &str, name: &str)
        -> Result<Option<Service>, kube::Error>;

    async fn get_route_host(&self, namespace: &str, name: &str)
        -> Result<Option<String>, kube::Error>;

    async fn list_persistent_volume_claims(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>, kube::Error>;

    async fn delete_persistent_volume(&self, name: &str) -> Result<(), kube::Error>;

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<(), kube::Error>;

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, kube::Error>;

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;

    async fn record_event(
        &self,
        obj: &Blackduck,
        level: Level,
        action: &str,
        message: &str,
    ) -> Result<(), kube::Error>;
}

// -----------------------------------------------------------------------------
// KubeClient structure

#[derive(Clone)]
pub struct KubeClient {
    client: kube::Client,
    reporter: Reporter,
}

impl From<kube::Client> for KubeClient {
    fn from(client: kube::Client) -> Self {
        Self {
            client,
            reporter: Reporter::default(),
        }
    }
}

#[async_trait]
impl ResourceClient for KubeClient {
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn get_instance(&self, key: &ObjectKey) -> Result<Option<Blackduck>, kube::Error> {
        Api::<Blackduck>::namespaced(self.client.to_owned(), &key.namespace)
            .get_opt(&key.name)
            .await
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, origin, modified)))]
    async fn patch_instance_status(
        &self,
        origin: &Blackduck,
        modified: &Blackduck,
    ) -> Result<(), kube::Error> {
        let patch = resource::diff(origin, modified).map_err(kube::Error::SerdeError)?;
        let Some(key) = ObjectKey::of(modified) else {
            return Ok(());
        };

        if patch.0.is_empty() {
            debug!(namespace = &key.namespace, name = &key.name, "skip patch request on resource's status, no operation to apply");
            return Ok(());
        }

        debug!(namespace = &key.namespace, name = &key.name, patch = serde_json::to_string(&patch).unwrap_or_default(), "execute patch request on resource's status");
        Api::<Blackduck>::namespaced(self.client.to_owned(), &key.namespace)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Json::<()>(patch))
            .await
            .map(|_| ())
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn crd_active(&self) -> Result<bool, kube::Error> {
        let name = Blackduck::crd_name();
        let crd = Api::<CustomResourceDefinition>::all(self.client.to_owned())
            .get_opt(name)
            .await?;

        Ok(crd
            .map(|crd| crd.metadata.deletion_timestamp.is_none())
            .unwrap_or(false))
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, kube::Error> {
        Api::<Namespace>::all(self.client.to_owned())
            .get_opt(name)
            .await
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn list_namespaces(&self, selector: &str) -> Result<Vec<Namespace>, kube::Error> {
        Ok(Api::<Namespace>::all(self.client.to_owned())
            .list(&ListParams::default().labels(selector))
            .await?
            .items)
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn patch_namespace_labels(
        &self,
        name: &str,
        labels: BTreeMap<String, Option<String>>,
    ) -> Result<(), kube::Error> {
        let patch = json!({ "metadata": { "labels": labels } });

        Api::<Namespace>::all(self.client.to_owned())
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map(|_| ())
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn delete_namespace(&self, name: &str) -> Result<(), kube::Error> {
        match Api::<Namespace>::all(self.client.to_owned())
            .delete(name, &DeleteParams::default())
            .await
        {
            Err(err) if is_not_found(&err) => Ok(()),
            result => result.map(|_| ()),
        }
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, kube::Error> {
        Api::<Secret>::namespaced(self.client.to_owned(), namespace)
            .get_opt(name)
            .await
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Service>, kube::Error> {
        Api::<Service>::namespaced(self.client.to_owned(), namespace)
            .get_opt(name)
            .await
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn get_route_host(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<String>, kube::Error> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.to_owned(), namespace, &route_api_resource());

        match api.get_opt(name).await {
            Ok(route) => Ok(route.and_then(|route| {
                route
                    .data
                    .pointer("/spec/host")
                    .and_then(|host| host.as_str())
                    .map(ToString::to_string)
            })),
            // the route api only exists on openshift clusters
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(err),
        }
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn list_persistent_volume_claims(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>, kube::Error> {
        Ok(
            Api::<PersistentVolumeClaim>::namespaced(self.client.to_owned(), namespace)
                .list(&ListParams::default().labels(selector))
                .await?
                .items,
        )
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn delete_persistent_volume(&self, name: &str) -> Result<(), kube::Error> {
        match Api::<PersistentVolume>::all(self.client.to_owned())
            .delete(name, &DeleteParams::default())
            .await
        {
            Err(err) if is_not_found(&err) => Ok(()),
            result => result.map(|_| ()),
        }
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, job)))]
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<(), kube::Error> {
        Api::<Job>::namespaced(self.client.to_owned(), namespace)
            .create(&PostParams::default(), job)
            .await
            .map(|_| ())
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, kube::Error> {
        Api::<Job>::namespaced(self.client.to_owned(), namespace)
            .get_opt(name)
            .await
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        match Api::<Job>::namespaced(self.client.to_owned(), namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Err(err) if is_not_found(&err) => Ok(()),
            result => result.map(|_| ()),
        }
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, obj)))]
    async fn record_event(
        &self,
        obj: &Blackduck,
        level: Level,
        action: &str,
        message: &str,
    ) -> Result<(), kube::Error> {
        recorder::record(self.client.to_owned(), &self.reporter, obj, level, action, message)
            .await
            .map(|_| ())
    }
}
