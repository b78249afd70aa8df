//! # Black Duck custom resource
//!
//! This module provide the black duck custom resource and its definition.
//! Every field of the spec is optional so that the operator can tell a value
//! the user wrote apart from one it should take from the defaults.

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------------
// DesiredState enumeration

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug, Default)]
pub enum DesiredState {
    #[default]
    #[serde(rename = "", alias = "Start", alias = "START")]
    Start,
    #[serde(rename = "Stop", alias = "STOP")]
    Stop,
    #[serde(rename = "DbMigrate", alias = "DBMIGRATE")]
    DbMigrate,
}

impl Display for DesiredState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, ""),
            Self::Stop => write!(f, "Stop"),
            Self::DbMigrate => write!(f, "DbMigrate"),
        }
    }
}

// -----------------------------------------------------------------------------
// State enumeration

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug)]
pub enum State {
    Starting,
    Running,
    Stopped,
    Error,
    DbMigration,
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "Starting"),
            Self::Running => write!(f, "Running"),
            Self::Stopped => write!(f, "Stopped"),
            Self::Error => write!(f, "Error"),
            Self::DbMigration => write!(f, "DbMigration"),
        }
    }
}

// -----------------------------------------------------------------------------
// ExposeService enumeration

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug)]
pub enum ExposeService {
    #[serde(rename = "LoadBalancer", alias = "LOADBALANCER")]
    LoadBalancer,
    #[serde(rename = "NodePort", alias = "NODEPORT")]
    NodePort,
    #[serde(rename = "OpenShift", alias = "OPENSHIFT")]
    OpenShift,
    #[serde(rename = "None", alias = "NONE")]
    None,
}

impl FromStr for ExposeService {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "loadbalancer" => Ok(Self::LoadBalancer),
            "nodeport" => Ok(Self::NodePort),
            "openshift" => Ok(Self::OpenShift),
            "none" => Ok(Self::None),
            _ => Err(format!("failed to parse '{s}', available options are 'LoadBalancer', 'NodePort', 'OpenShift' or 'None'")),
        }
    }
}

// -----------------------------------------------------------------------------
// ExternalDatabase structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct ExternalDatabase {
    #[serde(rename = "postgresHost", default)]
    pub host: String,
    #[serde(rename = "postgresPort", default)]
    pub port: Option<i32>,
    #[serde(rename = "postgresAdmin", default)]
    pub admin: Option<String>,
    #[serde(rename = "postgresUser", default)]
    pub user: Option<String>,
    #[serde(rename = "postgresSsl", default)]
    pub ssl: bool,
    #[serde(rename = "postgresAdminPassword", default)]
    pub admin_password: Option<String>,
    #[serde(rename = "postgresUserPassword", default)]
    pub user_password: Option<String>,
}

// -----------------------------------------------------------------------------
// Pvc structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Pvc {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "size", default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(rename = "storageClass", default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    #[serde(rename = "volumeName", default, skip_serializing_if = "Option::is_none")]
    pub volume_name: Option<String>,
}

// -----------------------------------------------------------------------------
// RegistryConfiguration structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct RegistryConfiguration {
    #[serde(rename = "registry", default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
    #[serde(rename = "namespace", default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(rename = "pullSecrets", default, skip_serializing_if = "Vec::is_empty")]
    pub pull_secrets: Vec<String>,
}

// -----------------------------------------------------------------------------
// Spec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
#[kube(group = "synopsys.com")]
#[kube(version = "v1")]
#[kube(kind = "Blackduck")]
#[kube(singular = "blackduck")]
#[kube(plural = "blackducks")]
#[kube(shortname = "bd")]
#[kube(status = "BlackduckStatus")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
#[kube(printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#)]
#[kube(printcolumn = r#"{"name":"Address", "type":"string", "jsonPath":".status.ip"}"#)]
pub struct BlackduckSpec {
    #[serde(rename = "size", default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(rename = "version", default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(rename = "exposeService", default, skip_serializing_if = "Option::is_none")]
    pub expose_service: Option<String>,
    #[serde(rename = "dbPrototype", default, skip_serializing_if = "Option::is_none")]
    pub db_prototype: Option<String>,
    #[serde(rename = "externalPostgres", default, skip_serializing_if = "Option::is_none")]
    pub external_database: Option<ExternalDatabase>,
    #[serde(rename = "pvcStorageClass", default, skip_serializing_if = "Option::is_none")]
    pub pvc_storage_class: Option<String>,
    #[serde(rename = "livenessProbes", default, skip_serializing_if = "Option::is_none")]
    pub liveness_probes: Option<bool>,
    #[serde(rename = "persistentStorage", default, skip_serializing_if = "Option::is_none")]
    pub persistent_storage: Option<bool>,
    #[serde(rename = "pvc", default, skip_serializing_if = "Vec::is_empty")]
    pub pvc: Vec<Pvc>,
    #[serde(rename = "certificateName", default, skip_serializing_if = "Option::is_none")]
    pub certificate_name: Option<String>,
    #[serde(rename = "certificate", default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    #[serde(rename = "certificateKey", default, skip_serializing_if = "Option::is_none")]
    pub certificate_key: Option<String>,
    #[serde(rename = "proxyCertificate", default, skip_serializing_if = "Option::is_none")]
    pub proxy_certificate: Option<String>,
    #[serde(rename = "authCustomCa", default, skip_serializing_if = "Option::is_none")]
    pub auth_custom_ca: Option<String>,
    #[serde(rename = "desiredState", default)]
    pub desired_state: DesiredState,
    /// `KEY:VALUE` pairs appended to the shared configuration
    #[serde(rename = "environs", default, skip_serializing_if = "Vec::is_empty")]
    pub environs: Vec<String>,
    #[serde(rename = "imageRegistries", default, skip_serializing_if = "Vec::is_empty")]
    pub image_registries: Vec<String>,
    #[serde(rename = "imageUidMap", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub image_uid_map: BTreeMap<String, i64>,
    #[serde(rename = "registryConfiguration", default, skip_serializing_if = "Option::is_none")]
    pub registry_configuration: Option<RegistryConfiguration>,
    #[serde(rename = "adminPassword", default, skip_serializing_if = "Option::is_none")]
    pub admin_password: Option<String>,
    #[serde(rename = "userPassword", default, skip_serializing_if = "Option::is_none")]
    pub user_password: Option<String>,
    #[serde(rename = "postgresPassword", default, skip_serializing_if = "Option::is_none")]
    pub postgres_password: Option<String>,
}

// -----------------------------------------------------------------------------
// Status structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct BlackduckStatus {
    #[serde(rename = "state", default, skip_serializing_if = "Option::is_none")]
    pub state: Option<State>,
    #[serde(rename = "ip", default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(rename = "fqdn", default, skip_serializing_if = "Option::is_none")]
    pub fqdn: Option<String>,
    #[serde(rename = "pvcVolumeName", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pvc_volume_name: BTreeMap<String, String>,
    #[serde(rename = "errorMessage", default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

// -----------------------------------------------------------------------------
// Blackduck implementation

impl Blackduck {
    pub fn state(&self) -> Option<State> {
        self.status.as_ref().and_then(|status| status.state)
    }
}
