//! # Manifest module
//!
//! This module provide the typed manifests that make up a deployment plan.
//! A plan only lives for one reconciliation pass.

use std::fmt::{self, Display, Formatter};

use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{ConfigMap, PersistentVolumeClaim, Secret, Service, ServiceAccount},
};
use kube::{api::DynamicObject, ResourceExt};

// -----------------------------------------------------------------------------
// Group enumeration

/// apply order of manifests, the reconciler applies groups in this order
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Debug)]
pub enum Group {
    Configuration,
    Storage,
    Database,
    Workload,
    Exposure,
}

impl Display for Group {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Storage => write!(f, "storage"),
            Self::Database => write!(f, "database"),
            Self::Workload => write!(f, "workload"),
            Self::Exposure => write!(f, "exposure"),
        }
    }
}

// -----------------------------------------------------------------------------
// Kind enumeration

#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Debug)]
pub enum Kind {
    Secret,
    ConfigMap,
    ServiceAccount,
    PersistentVolumeClaim,
    Service,
    Deployment,
    Job,
    Route,
}

impl Display for Kind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Secret => write!(f, "Secret"),
            Self::ConfigMap => write!(f, "ConfigMap"),
            Self::ServiceAccount => write!(f, "ServiceAccount"),
            Self::PersistentVolumeClaim => write!(f, "PersistentVolumeClaim"),
            Self::Service => write!(f, "Service"),
            Self::Deployment => write!(f, "Deployment"),
            Self::Job => write!(f, "Job"),
            Self::Route => write!(f, "Route"),
        }
    }
}

// -----------------------------------------------------------------------------
// Object enumeration

#[derive(Clone, Debug)]
pub enum Object {
    Secret(Secret),
    ConfigMap(ConfigMap),
    ServiceAccount(ServiceAccount),
    PersistentVolumeClaim(PersistentVolumeClaim),
    Service(Service),
    Deployment(Deployment),
    Route(DynamicObject),
}

impl Object {
    pub fn kind(&self) -> Kind {
        match self {
            Self::Secret(_) => Kind::Secret,
            Self::ConfigMap(_) => Kind::ConfigMap,
            Self::ServiceAccount(_) => Kind::ServiceAccount,
            Self::PersistentVolumeClaim(_) => Kind::PersistentVolumeClaim,
            Self::Service(_) => Kind::Service,
            Self::Deployment(_) => Kind::Deployment,
            Self::Route(_) => Kind::Route,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Self::Secret(obj) => obj.name_any(),
            Self::ConfigMap(obj) => obj.name_any(),
            Self::ServiceAccount(obj) => obj.name_any(),
            Self::PersistentVolumeClaim(obj) => obj.name_any(),
            Self::Service(obj) => obj.name_any(),
            Self::Deployment(obj) => obj.name_any(),
            Self::Route(obj) => obj.name_any(),
        }
    }
}

// -----------------------------------------------------------------------------
// Manifest structure

#[derive(Clone, Debug)]
pub struct Manifest {
    pub component: String,
    pub group: Group,
    pub object: Object,
}

impl Manifest {
    pub fn new(component: impl Into<String>, group: Group, object: Object) -> Self {
        Self {
            component: component.into(),
            group,
            object,
        }
    }

    pub fn kind(&self) -> Kind {
        self.object.kind()
    }

    pub fn name(&self) -> String {
        self.object.name()
    }

    /// `Kind/name` reference used in logs, events and reports
    pub fn reference(&self) -> String {
        format!("{}/{}", self.kind(), self.name())
    }
}

// -----------------------------------------------------------------------------
// Plan structure

/// the manifests computed for an instance during one reconciliation pass
#[derive(Clone, Debug, Default)]
pub struct Plan {
    manifests: Vec<Manifest>,
}

impl From<Vec<Manifest>> for Plan {
    fn from(manifests: Vec<Manifest>) -> Self {
        Self { manifests }
    }
}

impl Plan {
    pub fn manifests(&self) -> &[Manifest] {
        &self.manifests
    }

    /// returns the manifests belonging to the given groups, in plan order
    pub fn select(&self, groups: &[Group]) -> Vec<Manifest> {
        self.manifests
            .iter()
            .filter(|manifest| groups.contains(&manifest.group))
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }
}
