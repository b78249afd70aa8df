//! # Deployer module
//!
//! This module provide the idempotent apply primitive. Missing objects are
//! created, objects whose desired fields differ from the live ones are updated
//! with a server-side apply, identical objects are left untouched. Pruning
//! only ever deletes objects matching the owner selector.

use std::{collections::HashSet, fmt::Debug};

use async_trait::async_trait;
use k8s_openapi::{
    api::{
        apps::v1::Deployment,
        batch::v1::Job,
        core::v1::{ConfigMap, PersistentVolumeClaim, Secret, Service, ServiceAccount},
    },
    NamespaceResourceScope,
};
use kube::{
    api::{DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams},
    Api, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

use crate::svc::k8s::{
    client::{is_not_found, route_api_resource},
    manifest::{Kind, Manifest, Object},
    resource,
};

// -----------------------------------------------------------------------------
// Constants

pub const FIELD_MANAGER: &str = env!("CARGO_PKG_NAME");

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to apply '{0}', {1}")]
    Apply(String, kube::Error),
    #[error("failed to prune '{0}' objects, {1}")]
    Prune(Kind, kube::Error),
}

// -----------------------------------------------------------------------------
// Change enumeration

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Change {
    Created,
    Updated,
    Unchanged,
}

// -----------------------------------------------------------------------------
// Report structure

/// `Kind/name` references of the objects that were written
#[derive(PartialEq, Eq, Clone, Debug, Default)]
pub struct Report {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
}

impl Report {
    pub fn record(&mut self, reference: String, change: Change) {
        match change {
            Change::Created => self.created.push(reference),
            Change::Updated => self.updated.push(reference),
            Change::Unchanged => {}
        }
    }

    pub fn merge(&mut self, other: Report) {
        self.created.extend(other.created);
        self.updated.extend(other.updated);
        self.deleted.extend(other.deleted);
    }

    pub fn changed(&self) -> bool {
        !self.created.is_empty() || !self.updated.is_empty() || !self.deleted.is_empty()
    }
}

// -----------------------------------------------------------------------------
// Deployer trait

#[async_trait]
pub trait Deployer: Send + Sync {
    /// create or update the given manifests, in the given order
    async fn apply(&self, namespace: &str, manifests: &[Manifest]) -> Result<Report, Error>;

    /// delete objects matching the label selector that are not part of `keep`
    async fn prune(&self, namespace: &str, selector: &str, keep: &[Manifest])
        -> Result<Report, Error>;
}

// -----------------------------------------------------------------------------
// KubeDeployer structure

#[derive(Clone)]
pub struct KubeDeployer {
    client: kube::Client,
}

impl From<kube::Client> for KubeDeployer {
    fn from(client: kube::Client) -> Self {
        Self { client }
    }
}

impl KubeDeployer {
    async fn apply_typed<K>(&self, namespace: &str, obj: &K) -> Result<Change, kube::Error>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        let api = Api::<K>::namespaced(self.client.to_owned(), namespace);
        self.apply_with(api, obj).await
    }

    async fn apply_with<K>(&self, api: Api<K>, obj: &K) -> Result<Change, kube::Error>
    where
        K: Resource + Clone + DeserializeOwned + Serialize + Debug,
    {
        let name = obj.name_any();

        match api.get_opt(&name).await? {
            None => {
                api.create(&PostParams::default(), obj).await?;
                Ok(Change::Created)
            }
            Some(existing) => {
                if unchanged(&existing, obj).map_err(kube::Error::SerdeError)? {
                    return Ok(Change::Unchanged);
                }

                let params = PatchParams::apply(FIELD_MANAGER).force();
                api.patch(&name, &params, &Patch::Apply(obj)).await?;
                Ok(Change::Updated)
            }
        }
    }

    async fn prune_typed<K>(
        &self,
        namespace: &str,
        selector: &str,
        keep: &HashSet<String>,
    ) -> Result<Vec<String>, kube::Error>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api = Api::<K>::namespaced(self.client.to_owned(), namespace);
        prune_with(api, selector, keep).await
    }
}

/// returns if the live object already holds every field set on the desired one
fn unchanged<K>(existing: &K, desired: &K) -> Result<bool, serde_json::Error>
where
    K: Serialize,
{
    Ok(resource::contains(
        &serde_json::to_value(existing)?,
        &serde_json::to_value(desired)?,
    ))
}

async fn prune_with<K>(
    api: Api<K>,
    selector: &str,
    keep: &HashSet<String>,
) -> Result<Vec<String>, kube::Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let mut deleted = vec![];
    let objects = api.list(&ListParams::default().labels(selector)).await?;

    for obj in objects.items {
        let name = obj.name_any();
        if keep.contains(&name) || resource::deleted(&obj) {
            continue;
        }

        match api.delete(&name, &DeleteParams::background()).await {
            Err(err) if is_not_found(&err) => {}
            Err(err) => return Err(err),
            Ok(_) => deleted.push(name),
        }
    }

    Ok(deleted)
}

#[async_trait]
impl Deployer for KubeDeployer {
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, manifests)))]
    async fn apply(&self, namespace: &str, manifests: &[Manifest]) -> Result<Report, Error> {
        let mut report = Report::default();

        for manifest in manifests {
            let reference = manifest.reference();
            let change = match &manifest.object {
                Object::Secret(obj) => self.apply_typed(namespace, obj).await,
                Object::ConfigMap(obj) => self.apply_typed(namespace, obj).await,
                Object::ServiceAccount(obj) => self.apply_typed(namespace, obj).await,
                Object::PersistentVolumeClaim(obj) => self.apply_typed(namespace, obj).await,
                Object::Service(obj) => self.apply_typed(namespace, obj).await,
                Object::Deployment(obj) => self.apply_typed(namespace, obj).await,
                Object::Route(obj) => {
                    let api: Api<DynamicObject> = Api::namespaced_with(
                        self.client.to_owned(),
                        namespace,
                        &route_api_resource(),
                    );
                    self.apply_with(api, obj).await
                }
            }
            .map_err(|err| Error::Apply(reference.to_owned(), err))?;

            debug!(namespace = namespace, object = &reference, change = ?change, "Applied manifest");
            report.record(reference, change);
        }

        Ok(report)
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, keep)))]
    async fn prune(
        &self,
        namespace: &str,
        selector: &str,
        keep: &[Manifest],
    ) -> Result<Report, Error> {
        let mut report = Report::default();
        let kinds = [
            Kind::Route,
            Kind::Deployment,
            Kind::Job,
            Kind::Service,
            Kind::ServiceAccount,
            Kind::ConfigMap,
            Kind::Secret,
            Kind::PersistentVolumeClaim,
        ];

        for kind in kinds {
            let keep: HashSet<String> = keep
                .iter()
                .filter(|manifest| manifest.kind() == kind)
                .map(Manifest::name)
                .collect();

            let deleted = match kind {
                Kind::Secret => self.prune_typed::<Secret>(namespace, selector, &keep).await,
                Kind::ConfigMap => self.prune_typed::<ConfigMap>(namespace, selector, &keep).await,
                Kind::ServiceAccount => {
                    self.prune_typed::<ServiceAccount>(namespace, selector, &keep)
                        .await
                }
                Kind::PersistentVolumeClaim => {
                    self.prune_typed::<PersistentVolumeClaim>(namespace, selector, &keep)
                        .await
                }
                Kind::Service => self.prune_typed::<Service>(namespace, selector, &keep).await,
                Kind::Deployment => {
                    self.prune_typed::<Deployment>(namespace, selector, &keep)
                        .await
                }
                Kind::Job => self.prune_typed::<Job>(namespace, selector, &keep).await,
                Kind::Route => {
                    let api: Api<DynamicObject> = Api::namespaced_with(
                        self.client.to_owned(),
                        namespace,
                        &route_api_resource(),
                    );

                    match prune_with(api, selector, &keep).await {
                        // the route api only exists on openshift clusters
                        Err(err) if is_not_found(&err) => Ok(vec![]),
                        result => result,
                    }
                }
            }
            .map_err(|err| Error::Prune(kind, err))?;

            report
                .deleted
                .extend(deleted.into_iter().map(|name| format!("{kind}/{name}")));
        }

        if report.changed() {
            info!(namespace = namespace, selector = selector, deleted = report.deleted.len(), "Pruned objects");
        }

        Ok(report)
    }
}
