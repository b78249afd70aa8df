//! # Builder module
//!
//! This module turns a resolved black duck spec into the deployment plan of
//! an instance. Builders are pure functions of their inputs, they never read
//! the cluster nor call back into the reconciler.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy},
        core::v1::{
            ConfigMap, ConfigMapEnvSource, Container, ContainerPort, EmptyDirVolumeSource,
            EnvFromSource, EnvVar, EnvVarSource, ExecAction, KeyToPath, LocalObjectReference,
            PersistentVolumeClaim, PersistentVolumeClaimSpec,
            PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Probe,
            ResourceRequirements, Secret, SecretKeySelector, SecretVolumeSource, SecurityContext,
            Service, ServiceAccount, ServicePort, ServiceSpec, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::{
        api::resource::Quantity,
        apis::meta::v1::{LabelSelector, ObjectMeta},
        util::intstr::IntOrString,
    },
    ByteString,
};
use kube::{api::DynamicObject, ResourceExt};
use serde_json::json;

use crate::svc::{
    blackduck::{
        catalog::{self, Component},
        defaults::Resolved,
        flavor::Limits,
    },
    crd::blackduck::{Blackduck, ExposeService},
    database::Credentials,
    k8s::{
        client::route_api_resource,
        manifest::{Group, Manifest, Object, Plan},
    },
};

// -----------------------------------------------------------------------------
// Constants

pub const APP: &str = "blackduck";
pub const LABEL_DOMAIN: &str = "synopsys.com";
pub const SECRETS_DIR: &str = "/tmp/secrets";
pub const POSTGRES_PORT: i32 = 5432;
pub const WEBSERVER_PORT: i32 = 8443;
pub const EXPOSED_PORT: i32 = 443;

pub const ADMIN_PASSWORD_KEY: &str = "HUB_POSTGRES_ADMIN_PASSWORD_FILE";
pub const USER_PASSWORD_KEY: &str = "HUB_POSTGRES_USER_PASSWORD_FILE";
pub const POSTGRES_PASSWORD_KEY: &str = "HUB_POSTGRES_POSTGRES_PASSWORD_FILE";

const HEALTHCHECK: &str = "/usr/local/bin/docker-healthcheck.sh";

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, PartialEq, Eq, Clone, Debug)]
pub enum Error {
    #[error("failed to build plan, instance has no {0}")]
    Metadata(&'static str),
    #[error("failed to build plan, no image is available for component '{0}'")]
    Image(Component),
}

// -----------------------------------------------------------------------------
// Naming helpers

/// returns the name of a component's objects, `<instance>-blackduck-<component>`
pub fn name(instance: &str, component: impl AsRef<str>) -> String {
    format!("{instance}-{APP}-{}", component.as_ref())
}

pub fn exposed_name(instance: &str) -> String {
    name(instance, "webserver-exposed")
}

pub fn credentials_name(instance: &str) -> String {
    name(instance, "db-creds")
}

/// returns the instance-scoped name of a persistent volume claim
pub fn claim_name(instance: &str, claim: &str) -> String {
    format!("{instance}-{claim}")
}

pub fn labels(instance: &str, component: impl AsRef<str>) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), APP.to_string()),
        ("name".to_string(), instance.to_string()),
        ("component".to_string(), component.as_ref().to_string()),
    ])
}

/// returns the namespace label recording that the instance lives there, its
/// value is the deployed version
pub fn namespace_label(instance: &str) -> String {
    format!("{LABEL_DOMAIN}/{APP}.{instance}")
}

/// returns the label selector matching every object owned by the instance
pub fn selector(instance: &str) -> String {
    format!("app={APP},name={instance}")
}

// -----------------------------------------------------------------------------
// ResourceBuilder trait

/// computes the deployment plan of an instance
pub trait ResourceBuilder: Send + Sync {
    fn build(
        &self,
        instance: &Blackduck,
        resolved: &Resolved,
        credentials: &Credentials,
    ) -> Result<Plan, Error>;
}

// -----------------------------------------------------------------------------
// StandardBuilder structure

#[derive(Clone, Copy, Debug, Default)]
pub struct StandardBuilder;

impl ResourceBuilder for StandardBuilder {
    fn build(
        &self,
        instance: &Blackduck,
        resolved: &Resolved,
        credentials: &Credentials,
    ) -> Result<Plan, Error> {
        let context = Context {
            name: instance.metadata.name.to_owned().ok_or(Error::Metadata("name"))?,
            namespace: instance.namespace().ok_or(Error::Metadata("namespace"))?,
            resolved,
        };

        let mut manifests = context.configuration(credentials);
        manifests.extend(context.storage());
        if resolved.external_database().is_none() {
            manifests.extend(context.postgres()?);
        }
        manifests.extend(context.workloads()?);
        manifests.extend(context.exposure());

        Ok(Plan::from(manifests))
    }
}

// -----------------------------------------------------------------------------
// Workload structure

/// the description of a single component's deployment and service
struct Workload<'a> {
    component: Component,
    group: Group,
    limits: &'a Limits,
    ports: Vec<i32>,
    volumes: Vec<(Volume, &'static str)>,
    env: Vec<EnvVar>,
    database: bool,
    liveness: Option<Vec<String>>,
}

impl<'a> Workload<'a> {
    fn new(component: Component, limits: &'a Limits, ports: &[i32]) -> Self {
        Self {
            component,
            group: Group::Workload,
            limits,
            ports: ports.to_vec(),
            volumes: vec![],
            env: vec![],
            database: false,
            liveness: None,
        }
    }

    fn volume(mut self, volume: Volume, path: &'static str) -> Self {
        self.volumes.push((volume, path));
        self
    }

    fn volumes(mut self, volumes: Vec<(Volume, &'static str)>) -> Self {
        self.volumes.extend(volumes);
        self
    }

    fn database(mut self) -> Self {
        self.database = true;
        self
    }

    fn liveness(mut self, command: &[&str]) -> Self {
        self.liveness = Some(command.iter().map(ToString::to_string).collect());
        self
    }
}

// -----------------------------------------------------------------------------
// Context structure

struct Context<'a> {
    name: String,
    namespace: String,
    resolved: &'a Resolved,
}

impl<'a> Context<'a> {
    fn metadata(&self, name: String, component: impl AsRef<str>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.namespace.to_owned()),
            labels: Some(labels(&self.name, component)),
            ..Default::default()
        }
    }

    fn image(&self, component: Component) -> Result<String, Error> {
        self.resolved
            .images
            .get(&component)
            .cloned()
            .ok_or(Error::Image(component))
    }

    // -------------------------------------------------------------------------
    // Configuration group

    fn configuration(&self, credentials: &Credentials) -> Vec<Manifest> {
        let spec = &self.resolved.spec;
        let mut manifests = vec![];

        let mut data = BTreeMap::from([
            (ADMIN_PASSWORD_KEY.to_string(), ByteString(credentials.admin.as_bytes().to_vec())),
            (USER_PASSWORD_KEY.to_string(), ByteString(credentials.user.as_bytes().to_vec())),
        ]);
        if self.resolved.external_database().is_none() {
            data.insert(
                POSTGRES_PASSWORD_KEY.to_string(),
                ByteString(credentials.postgres.as_bytes().to_vec()),
            );
        }

        manifests.push(Manifest::new(
            "postgres",
            Group::Configuration,
            Object::Secret(Secret {
                metadata: self.metadata(credentials_name(&self.name), "postgres"),
                data: Some(data),
                type_: Some("Opaque".into()),
                ..Default::default()
            }),
        ));

        manifests.push(Manifest::new(
            "configmap",
            Group::Configuration,
            Object::ConfigMap(ConfigMap {
                metadata: self.metadata(name(&self.name, "config"), "configmap"),
                data: Some(self.shared_configuration()),
                ..Default::default()
            }),
        ));

        manifests.push(Manifest::new(
            "postgres",
            Group::Configuration,
            Object::ConfigMap(ConfigMap {
                metadata: self.metadata(name(&self.name, "db-config"), "postgres"),
                data: Some(self.database_configuration()),
                ..Default::default()
            }),
        ));

        manifests.push(Manifest::new(
            "serviceaccount",
            Group::Configuration,
            Object::ServiceAccount(ServiceAccount {
                metadata: self.metadata(name(&self.name, "service-account"), "serviceaccount"),
                ..Default::default()
            }),
        ));

        if let (Some(certificate), Some(key)) = (&spec.certificate, &spec.certificate_key) {
            manifests.push(self.secret(
                "webserver",
                name(&self.name, "webserver-certificate"),
                BTreeMap::from([
                    ("WEBSERVER_CUSTOM_CERT_FILE", certificate.as_str()),
                    ("WEBSERVER_CUSTOM_KEY_FILE", key.as_str()),
                ]),
            ));
        }

        if let Some(certificate) = &spec.proxy_certificate {
            manifests.push(self.secret(
                "proxy",
                name(&self.name, "proxy-certificate"),
                BTreeMap::from([("HUB_PROXY_CERT_FILE", certificate.as_str())]),
            ));
        }

        if let Some(ca) = &spec.auth_custom_ca {
            manifests.push(self.secret(
                "authentication",
                name(&self.name, "auth-custom-ca"),
                BTreeMap::from([("AUTH_CUSTOM_CA", ca.as_str())]),
            ));
        }

        manifests
    }

    fn secret(&self, component: &str, name: String, entries: BTreeMap<&str, &str>) -> Manifest {
        let data = entries
            .into_iter()
            .map(|(key, value)| (key.to_string(), ByteString(value.as_bytes().to_vec())))
            .collect();

        Manifest::new(
            component,
            Group::Configuration,
            Object::Secret(Secret {
                metadata: self.metadata(name, component),
                data: Some(data),
                type_: Some("Opaque".into()),
                ..Default::default()
            }),
        )
    }

    fn shared_configuration(&self) -> BTreeMap<String, String> {
        let host = |component: Component| name(&self.name, component.to_string());
        let mut data = BTreeMap::from([
            ("RUN_SECRETS_DIR".to_string(), SECRETS_DIR.to_string()),
            ("HUB_VERSION".to_string(), self.resolved.release.version.to_string()),
            ("HUB_AUTHENTICATION_HOST".to_string(), host(Component::Authentication)),
            ("AUTHENTICATION_HOST".to_string(), host(Component::Authentication)),
            ("CLIENT_CERT_CN".to_string(), host(Component::BinaryScanner)),
            ("CFSSL".to_string(), format!("{}:8888", host(Component::Cfssl))),
            ("HUB_CFSSL_HOST".to_string(), host(Component::Cfssl)),
            ("BLACKDUCK_CFSSL_HOST".to_string(), host(Component::Cfssl)),
            ("HUB_DOC_HOST".to_string(), host(Component::Documentation)),
            ("HUB_JOBRUNNER_HOST".to_string(), host(Component::Jobrunner)),
            ("HUB_LOGSTASH_HOST".to_string(), host(Component::Logstash)),
            ("RABBIT_MQ_HOST".to_string(), host(Component::Rabbitmq)),
            ("BROKER_URL".to_string(), format!("amqps://{}/protecodesc", host(Component::Rabbitmq))),
            ("HUB_REGISTRATION_HOST".to_string(), host(Component::Registration)),
            ("HUB_SCAN_HOST".to_string(), host(Component::Scan)),
            ("HUB_SOLR_HOST".to_string(), host(Component::Solr)),
            ("HUB_WEBSERVER_HOST".to_string(), host(Component::Webserver)),
            ("HUB_ZOOKEEPER_HOST".to_string(), host(Component::Zookeeper)),
        ]);

        // user values win over the computed host names
        data.extend(
            self.resolved
                .environs
                .iter()
                .filter(|(_, value)| !value.is_empty())
                .map(|(key, value)| (key.to_owned(), value.to_owned())),
        );

        data
    }

    fn database_configuration(&self) -> BTreeMap<String, String> {
        match self.resolved.external_database() {
            Some(external) => {
                let mut data = BTreeMap::from([
                    ("HUB_POSTGRES_ADMIN".to_string(), external.admin.to_owned().unwrap_or_else(|| "blackduck".into())),
                    ("HUB_POSTGRES_USER".to_string(), external.user.to_owned().unwrap_or_else(|| "blackduck_user".into())),
                    ("HUB_POSTGRES_PORT".to_string(), external.port.unwrap_or(POSTGRES_PORT).to_string()),
                    ("HUB_POSTGRES_HOST".to_string(), external.host.to_owned()),
                    ("HUB_POSTGRES_ENABLE_SSL".to_string(), external.ssl.to_string()),
                ]);

                if external.ssl {
                    data.insert("HUB_POSTGRES_ENABLE_SSL_CERT_AUTH".into(), "false".into());
                }

                data
            }
            None => BTreeMap::from([
                ("HUB_POSTGRES_ADMIN".to_string(), "blackduck".to_string()),
                ("HUB_POSTGRES_USER".to_string(), "blackduck_user".to_string()),
                ("HUB_POSTGRES_PORT".to_string(), POSTGRES_PORT.to_string()),
                ("HUB_POSTGRES_HOST".to_string(), name(&self.name, Component::Postgres.to_string())),
                ("HUB_POSTGRES_ENABLE_SSL".to_string(), "false".to_string()),
            ]),
        }
    }

    // -------------------------------------------------------------------------
    // Storage group

    fn storage(&self) -> Vec<Manifest> {
        if !self.resolved.persistent_storage {
            return vec![];
        }

        let spec = &self.resolved.spec;
        spec.pvc
            .iter()
            .filter(|pvc| {
                // the postgres claim is useless with an external database
                !(self.resolved.external_database().is_some() && pvc.name == "blackduck-postgres")
            })
            .map(|pvc| {
                let size = pvc.size.to_owned().unwrap_or_else(|| "2Gi".into());

                Manifest::new(
                    "pvc",
                    Group::Storage,
                    Object::PersistentVolumeClaim(PersistentVolumeClaim {
                        metadata: self.metadata(claim_name(&self.name, &pvc.name), "pvc"),
                        spec: Some(PersistentVolumeClaimSpec {
                            access_modes: Some(vec!["ReadWriteOnce".into()]),
                            storage_class_name: pvc
                                .storage_class
                                .to_owned()
                                .or_else(|| spec.pvc_storage_class.to_owned())
                                .filter(|class| !class.is_empty()),
                            volume_name: pvc.volume_name.to_owned().filter(|name| !name.is_empty()),
                            resources: Some(ResourceRequirements {
                                requests: Some(BTreeMap::from([("storage".to_string(), Quantity(size))])),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                )
            })
            .collect()
    }

    /// returns a claim backed volume when storage is persistent and the claim
    /// is part of the spec, an empty dir otherwise
    fn data_volume(&self, volume: &str, claim: &str) -> Volume {
        let persistent = self.resolved.persistent_storage
            && self.resolved.spec.pvc.iter().any(|pvc| pvc.name == claim);

        if persistent {
            Volume {
                name: volume.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim_name(&self.name, claim),
                    read_only: None,
                }),
                ..Default::default()
            }
        } else {
            empty_dir(volume)
        }
    }

    fn credentials_volume(&self) -> (Volume, &'static str) {
        let items = [ADMIN_PASSWORD_KEY, USER_PASSWORD_KEY]
            .into_iter()
            .map(|key| KeyToPath {
                key: key.to_string(),
                path: key.to_string(),
                mode: None,
            })
            .collect();

        (secret_volume("db-passwords", credentials_name(&self.name), Some(items)), SECRETS_DIR)
    }

    fn optional_secrets(&self, component: Component) -> Vec<(Volume, &'static str)> {
        let spec = &self.resolved.spec;
        let mut volumes = vec![];

        if spec.proxy_certificate.is_some()
            && matches!(component, Component::Authentication | Component::Registration | Component::Scan | Component::Webapp)
        {
            volumes.push((
                secret_volume("proxy-certificate", name(&self.name, "proxy-certificate"), None),
                "/tmp/secrets/proxy",
            ));
        }

        if spec.auth_custom_ca.is_some() && component == Component::Authentication {
            volumes.push((
                secret_volume("auth-custom-ca", name(&self.name, "auth-custom-ca"), None),
                "/tmp/secrets/ca",
            ));
        }

        if spec.certificate.is_some() && spec.certificate_key.is_some() && component == Component::Webserver {
            volumes.push((
                secret_volume("certificate", name(&self.name, "webserver-certificate"), None),
                "/tmp/secrets/certificate",
            ));
        }

        volumes
    }

    // -------------------------------------------------------------------------
    // Database group

    fn postgres(&self) -> Result<Vec<Manifest>, Error> {
        let credentials = credentials_name(&self.name);
        let from_secret = |variable: &str, key: &str| EnvVar {
            name: variable.to_string(),
            value: None,
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: Some(credentials.to_owned()),
                    key: key.to_string(),
                    optional: None,
                }),
                ..Default::default()
            }),
        };

        let mut workload = Workload::new(Component::Postgres, &self.resolved.flavor.postgres, &[POSTGRES_PORT])
            .volume(self.data_volume("postgres-persistent-vol", "blackduck-postgres"), "/var/lib/pgsql/data");

        workload.group = Group::Database;
        workload.database = true;
        workload.env = vec![
            env("POSTGRESQL_MAX_CONNECTIONS", "300"),
            env("POSTGRESQL_SHARED_BUFFERS", "1024MB"),
            env("POSTGRESQL_DATABASE", "blackduck"),
            env("POSTGRESQL_USER", "blackduck"),
            from_secret("POSTGRESQL_PASSWORD", ADMIN_PASSWORD_KEY),
            from_secret("POSTGRESQL_ADMIN_PASSWORD", POSTGRES_PASSWORD_KEY),
        ];

        let mut manifests = self.workload(workload)?;
        for manifest in manifests.iter_mut() {
            if let Object::Deployment(deployment) = &mut manifest.object {
                if let Some(spec) = deployment.spec.as_mut() {
                    // two postgres must never share the data directory
                    spec.strategy = Some(DeploymentStrategy {
                        type_: Some("Recreate".into()),
                        rolling_update: None,
                    });
                }
            }
        }

        Ok(manifests)
    }

    // -------------------------------------------------------------------------
    // Workload group

    fn workloads(&self) -> Result<Vec<Manifest>, Error> {
        let flavor = &self.resolved.flavor;
        let mut workloads = vec![
            Workload::new(Component::Cfssl, &flavor.cfssl, &[8888])
                .volume(self.data_volume("dir-cfssl", "blackduck-cfssl"), "/etc/cfssl")
                .liveness(&[HEALTHCHECK, "http://localhost:8888/api/v1/cfssl/scaninfo"]),
            Workload::new(Component::Authentication, &flavor.authentication, &[8443])
                .volume(self.data_volume("dir-authentication", "blackduck-authentication"), "/opt/blackduck/hub/hub-authentication/ldap")
                .volume(empty_dir("dir-authentication-security"), "/opt/blackduck/hub/hub-authentication/security")
                .volumes(vec![self.credentials_volume()])
                .volumes(self.optional_secrets(Component::Authentication))
                .database()
                .liveness(&[HEALTHCHECK, "https://127.0.0.1:8443/api/health-checks/liveness", "/opt/blackduck/hub/hub-authentication/security/root.crt"]),
            Workload::new(Component::Documentation, &flavor.documentation, &[8443])
                .volume(empty_dir("dir-documentation"), "/opt/blackduck/hub/hub-documentation/security")
                .liveness(&[HEALTHCHECK, "https://127.0.0.1:8443/hubdoc/health-checks/liveness", "/opt/blackduck/hub/hub-documentation/security/root.crt"]),
            Workload::new(Component::Jobrunner, &flavor.jobrunner, &[3001])
                .volume(empty_dir("dir-jobrunner"), "/opt/blackduck/hub/jobrunner/security")
                .volumes(vec![self.credentials_volume()])
                .database()
                .liveness(&["/usr/local/bin/docker-healthcheck.sh"]),
            Workload::new(Component::Logstash, &flavor.logstash, &[5044])
                .volume(self.data_volume("dir-logstash", "blackduck-logstash"), "/var/lib/logstash/data")
                .liveness(&[HEALTHCHECK, "http://localhost:9600/"]),
            Workload::new(Component::Rabbitmq, &flavor.rabbitmq, &[5671])
                .volume(empty_dir("dir-rabbitmq-security"), "/opt/blackduck/rabbitmq/security"),
            Workload::new(Component::Registration, &flavor.registration, &[8443])
                .volume(self.data_volume("dir-registration", "blackduck-registration"), "/opt/blackduck/hub/hub-registration/config")
                .volume(empty_dir("dir-registration-security"), "/opt/blackduck/hub/hub-registration/security")
                .volumes(self.optional_secrets(Component::Registration))
                .liveness(&[HEALTHCHECK, "https://localhost:8443/registration/health-checks/liveness", "/opt/blackduck/hub/hub-registration/security/root.crt"]),
            Workload::new(Component::Scan, &flavor.scan, &[8443])
                .volume(empty_dir("dir-scan"), "/opt/blackduck/hub/hub-scan/security")
                .volumes(vec![self.credentials_volume()])
                .volumes(self.optional_secrets(Component::Scan))
                .database()
                .liveness(&[HEALTHCHECK, "https://127.0.0.1:8443/api/health-checks/liveness", "/opt/blackduck/hub/hub-scan/security/root.crt"]),
            Workload::new(Component::Uploadcache, &flavor.uploadcache, &[9443, 9444])
                .volume(empty_dir("dir-uploadcache-security"), "/opt/blackduck/hub/blackduck-upload-cache/security")
                .volume(self.data_volume("dir-uploadcache-data", "blackduck-uploadcache-data"), "/opt/blackduck/hub/blackduck-upload-cache/uploads")
                .volume(self.data_volume("dir-uploadcache-key", "blackduck-uploadcache-key"), "/opt/blackduck/hub/blackduck-upload-cache/keys")
                .liveness(&["curl", "--insecure", "-X", "GET", "--verbose", "http://localhost:8086/live?full=1"]),
            Workload::new(Component::Webapp, &flavor.webapp, &[8443])
                .volume(self.data_volume("dir-webapp", "blackduck-webapp"), "/opt/blackduck/hub/hub-webapp/security")
                .volume(empty_dir("dir-webapp-logs"), "/opt/blackduck/hub/logs")
                .volumes(vec![self.credentials_volume()])
                .volumes(self.optional_secrets(Component::Webapp))
                .database()
                .liveness(&[HEALTHCHECK, "https://127.0.0.1:8443/api/health-checks/liveness", "/opt/blackduck/hub/hub-webapp/security/root.crt"]),
            Workload::new(Component::Webserver, &flavor.webserver, &[WEBSERVER_PORT])
                .volume(empty_dir("dir-webserver"), "/opt/blackduck/hub/webserver/security")
                .volumes(self.optional_secrets(Component::Webserver))
                .liveness(&[HEALTHCHECK, "https://localhost:8443/health-checks/liveness", "/opt/blackduck/hub/webserver/security/root.crt"]),
            Workload::new(Component::Zookeeper, &flavor.zookeeper, &[2181])
                .volume(self.data_volume("dir-zookeeper-data", "blackduck-zookeeper-data"), "/opt/blackduck/zookeeper/data")
                .volume(self.data_volume("dir-zookeeper-datalog", "blackduck-zookeeper-datalog"), "/opt/blackduck/zookeeper/datalog")
                .liveness(&["zkServer.sh", "status", "/opt/blackduck/zookeeper/conf/zoo.cfg"]),
            Workload::new(Component::BinaryScanner, &flavor.binary_scanner, &[3001]),
        ];

        // solr was folded into other components in later releases
        if self.resolved.images.contains_key(&Component::Solr) {
            workloads.push(
                Workload::new(Component::Solr, &flavor.solr, &[8983])
                    .volume(self.data_volume("dir-solr", "blackduck-solr"), "/opt/blackduck/hub/solr/cores.data")
                    .liveness(&[HEALTHCHECK, "http://localhost:8983/solr/project/admin/ping?wt=json"]),
            );
        }

        let mut manifests = vec![];
        for workload in workloads {
            manifests.extend(self.workload(workload)?);
        }

        Ok(manifests)
    }

    fn workload(&self, workload: Workload<'_>) -> Result<Vec<Manifest>, Error> {
        let component = workload.component.to_string();
        let object_name = name(&self.name, &component);
        let image = self.image(workload.component)?;
        let spec = &self.resolved.spec;

        let mut env = workload.env;
        if let Some(heap) = workload.limits.heap {
            env.push(self::env("HUB_MAX_MEMORY", heap));
        }

        let mut env_from = vec![];
        if workload.group == Group::Workload {
            env_from.push(config_map_env(name(&self.name, "config")));
        }
        if workload.database {
            env_from.push(config_map_env(name(&self.name, "db-config")));
        }

        let mut limits = BTreeMap::from([(
            "memory".to_string(),
            Quantity(workload.limits.memory.to_string()),
        )]);
        let mut requests = limits.to_owned();
        if let Some(cpu) = workload.limits.cpu {
            requests.insert("cpu".into(), Quantity(cpu.to_string()));
            limits.insert("cpu".into(), Quantity(cpu.to_string()));
        }

        let run_as_user = spec
            .image_uid_map
            .get(&component)
            .or_else(|| spec.image_uid_map.get(catalog::repository(&image)))
            .copied();

        let liveness_probe = workload
            .liveness
            .filter(|_| self.resolved.liveness_probes)
            .map(|command| Probe {
                exec: Some(ExecAction {
                    command: Some(command),
                }),
                initial_delay_seconds: Some(240),
                period_seconds: Some(30),
                timeout_seconds: Some(10),
                failure_threshold: Some(10),
                ..Default::default()
            });

        let (volumes, volume_mounts): (Vec<Volume>, Vec<VolumeMount>) = workload
            .volumes
            .into_iter()
            .map(|(volume, path)| {
                let mount = VolumeMount {
                    name: volume.name.to_owned(),
                    mount_path: path.to_string(),
                    ..Default::default()
                };

                (volume, mount)
            })
            .unzip();

        let container = Container {
            name: component.to_owned(),
            image: Some(image),
            image_pull_policy: Some("Always".into()),
            env: Some(env).filter(|env| !env.is_empty()),
            env_from: Some(env_from).filter(|env_from| !env_from.is_empty()),
            ports: Some(
                workload
                    .ports
                    .iter()
                    .map(|port| ContainerPort {
                        container_port: *port,
                        protocol: Some("TCP".into()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            resources: Some(ResourceRequirements {
                limits: Some(limits),
                requests: Some(requests),
                ..Default::default()
            }),
            volume_mounts: Some(volume_mounts).filter(|mounts| !mounts.is_empty()),
            liveness_probe,
            security_context: run_as_user.map(|uid| SecurityContext {
                run_as_user: Some(uid),
                ..Default::default()
            }),
            ..Default::default()
        };

        let pull_secrets = spec
            .registry_configuration
            .as_ref()
            .map(|registry| {
                registry
                    .pull_secrets
                    .iter()
                    .map(|secret| LocalObjectReference {
                        name: Some(secret.to_owned()),
                    })
                    .collect::<Vec<_>>()
            })
            .filter(|secrets| !secrets.is_empty());

        let deployment = Deployment {
            metadata: self.metadata(object_name.to_owned(), &component),
            spec: Some(DeploymentSpec {
                replicas: Some(workload.limits.replicas),
                selector: LabelSelector {
                    match_labels: Some(labels(&self.name, &component)),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels(&self.name, &component)),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        volumes: Some(volumes).filter(|volumes| !volumes.is_empty()),
                        service_account_name: Some(name(&self.name, "service-account")),
                        image_pull_secrets: pull_secrets,
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        };

        let mut manifests = vec![Manifest::new(
            &component,
            workload.group,
            Object::Deployment(deployment),
        )];

        if !workload.ports.is_empty() {
            let ports = workload
                .ports
                .iter()
                .map(|port| match (workload.component, *port) {
                    (Component::Webserver, WEBSERVER_PORT) => service_port(EXPOSED_PORT, WEBSERVER_PORT),
                    (_, port) => service_port(port, port),
                })
                .collect();

            manifests.push(Manifest::new(
                &component,
                workload.group,
                Object::Service(self.service(object_name, &component, "ClusterIP", ports)),
            ));
        }

        Ok(manifests)
    }

    fn service(&self, name: String, component: &str, type_: &str, ports: Vec<ServicePort>) -> Service {
        Service {
            metadata: self.metadata(name, component),
            spec: Some(ServiceSpec {
                type_: Some(type_.to_string()),
                selector: Some(labels(&self.name, component)),
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    // -------------------------------------------------------------------------
    // Exposure group

    fn exposure(&self) -> Vec<Manifest> {
        let component = Component::Webserver.to_string();
        let exposed = exposed_name(&self.name);

        match self.resolved.expose {
            ExposeService::None => vec![],
            ExposeService::LoadBalancer | ExposeService::NodePort => {
                let type_ = if self.resolved.expose == ExposeService::NodePort {
                    "NodePort"
                } else {
                    "LoadBalancer"
                };

                let mut service = self.service(
                    exposed,
                    &component,
                    type_,
                    vec![service_port(EXPOSED_PORT, WEBSERVER_PORT)],
                );
                if let Some(labels) = service.metadata.labels.as_mut() {
                    labels.insert("component".into(), "webserver-exposed".into());
                }

                vec![Manifest::new("webserver-exposed", Group::Exposure, Object::Service(service))]
            }
            ExposeService::OpenShift => {
                let mut route = DynamicObject::new(&exposed, &route_api_resource())
                    .within(&self.namespace)
                    .data(json!({
                        "spec": {
                            "to": {
                                "kind": "Service",
                                "name": name(&self.name, &component),
                            },
                            "port": {
                                "targetPort": format!("port-{EXPOSED_PORT}"),
                            },
                            "tls": {
                                "termination": "passthrough",
                            },
                            "wildcardPolicy": "None",
                        }
                    }));
                route.metadata.labels = Some(labels(&self.name, "route"));

                vec![Manifest::new("route", Group::Exposure, Object::Route(route))]
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Helpers

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

fn config_map_env(name: String) -> EnvFromSource {
    EnvFromSource {
        config_map_ref: Some(ConfigMapEnvSource {
            name: Some(name),
            optional: None,
        }),
        ..Default::default()
    }
}

fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

fn secret_volume(name: &str, secret: String, items: Option<Vec<KeyToPath>>) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret),
            items,
            default_mode: Some(0o444),
            optional: None,
        }),
        ..Default::default()
    }
}

fn service_port(port: i32, target: i32) -> ServicePort {
    ServicePort {
        name: Some(format!("port-{port}")),
        port,
        target_port: Some(IntOrString::Int(target)),
        protocol: Some("TCP".into()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svc::{
        blackduck::{catalog::Catalog, defaults::Defaults},
        cfg,
        crd::blackduck::{BlackduckSpec, ExternalDatabase, RegistryConfiguration},
    };

    fn resolve(spec: BlackduckSpec) -> (Blackduck, Resolved) {
        let defaults = Defaults::from(&cfg::Defaults {
            version: None,
            size: "small".into(),
            expose_service: "LoadBalancer".into(),
            persistent_storage: false,
            liveness_probes: false,
            certificate_name: "default".into(),
            pvc_storage_class: None,
        });

        let resolved = defaults
            .resolve(&spec, &Catalog::default())
            .expect("spec to resolve");

        let mut instance = Blackduck::new("hub", spec);
        instance.metadata.namespace = Some("hub-ns".into());

        (instance, resolved)
    }

    fn credentials() -> Credentials {
        Credentials {
            admin: "admin".into(),
            user: "user".into(),
            postgres: "postgres".into(),
        }
    }

    fn names(plan: &Plan, group: Group) -> Vec<String> {
        plan.select(&[group]).iter().map(Manifest::reference).collect()
    }

    #[test]
    fn default_plan_covers_every_group_but_storage() {
        let (instance, resolved) = resolve(BlackduckSpec::default());
        let plan = StandardBuilder.build(&instance, &resolved, &credentials()).expect("plan");

        assert!(names(&plan, Group::Configuration).contains(&"Secret/hub-blackduck-db-creds".to_string()));
        assert!(names(&plan, Group::Configuration).contains(&"ConfigMap/hub-blackduck-config".to_string()));
        assert!(names(&plan, Group::Storage).is_empty());
        assert_eq!(
            names(&plan, Group::Database),
            vec!["Deployment/hub-blackduck-postgres", "Service/hub-blackduck-postgres"]
        );
        assert!(names(&plan, Group::Workload).contains(&"Deployment/hub-blackduck-webapp".to_string()));
        assert!(!names(&plan, Group::Workload).contains(&"Deployment/hub-blackduck-solr".to_string()));
        assert_eq!(names(&plan, Group::Exposure), vec!["Service/hub-blackduck-webserver-exposed"]);

        let all_namespaced = plan.manifests().iter().all(|manifest| match &manifest.object {
            Object::Deployment(obj) => obj.metadata.namespace.as_deref() == Some("hub-ns"),
            Object::Service(obj) => obj.metadata.namespace.as_deref() == Some("hub-ns"),
            _ => true,
        });
        assert!(all_namespaced);
    }

    #[test]
    fn webserver_service_maps_443_to_8443() {
        let (instance, resolved) = resolve(BlackduckSpec::default());
        let plan = StandardBuilder.build(&instance, &resolved, &credentials()).expect("plan");

        let service = plan
            .manifests()
            .iter()
            .find_map(|manifest| match &manifest.object {
                Object::Service(service) if service.metadata.name.as_deref() == Some("hub-blackduck-webserver") => Some(service.to_owned()),
                _ => None,
            })
            .expect("webserver service");

        let port = &service.spec.expect("spec").ports.expect("ports")[0];
        assert_eq!(port.port, 443);
        assert_eq!(port.target_port, Some(IntOrString::Int(8443)));
    }

    #[test]
    fn external_database_skips_postgres_and_its_claim() {
        let (instance, resolved) = resolve(BlackduckSpec {
            persistent_storage: Some(true),
            external_database: Some(ExternalDatabase {
                host: "db.example.com".into(),
                ..Default::default()
            }),
            ..Default::default()
        });
        let plan = StandardBuilder.build(&instance, &resolved, &credentials()).expect("plan");

        assert!(names(&plan, Group::Database).is_empty());
        let storage = names(&plan, Group::Storage);
        assert!(!storage.is_empty());
        assert!(!storage.contains(&"PersistentVolumeClaim/hub-blackduck-postgres".to_string()));
        assert!(storage.contains(&"PersistentVolumeClaim/hub-blackduck-webapp".to_string()));

        let secret = plan
            .manifests()
            .iter()
            .find_map(|manifest| match &manifest.object {
                Object::Secret(secret) => Some(secret.to_owned()),
                _ => None,
            })
            .expect("credentials secret");
        assert!(!secret.data.expect("data").contains_key(POSTGRES_PASSWORD_KEY));
    }

    #[test]
    fn openshift_exposure_is_a_route() {
        let (instance, resolved) = resolve(BlackduckSpec {
            expose_service: Some("OpenShift".into()),
            ..Default::default()
        });
        let plan = StandardBuilder.build(&instance, &resolved, &credentials()).expect("plan");

        let exposure = plan.select(&[Group::Exposure]);
        assert_eq!(exposure.len(), 1);
        match &exposure[0].object {
            Object::Route(route) => {
                assert_eq!(route.metadata.namespace.as_deref(), Some("hub-ns"));
                assert_eq!(
                    route.data.pointer("/spec/to/name").and_then(|name| name.as_str()),
                    Some("hub-blackduck-webserver")
                );
            }
            object => panic!("expected a route, got {:?}", object.kind()),
        }
    }

    #[test]
    fn registry_settings_reach_the_pods() {
        let (instance, resolved) = resolve(BlackduckSpec {
            image_uid_map: BTreeMap::from([("webapp".to_string(), 1000)]),
            registry_configuration: Some(RegistryConfiguration {
                registry: Some("registry.local".into()),
                namespace: None,
                pull_secrets: vec!["pull".into()],
            }),
            ..Default::default()
        });
        let plan = StandardBuilder.build(&instance, &resolved, &credentials()).expect("plan");

        let pod = plan
            .manifests()
            .iter()
            .find_map(|manifest| match &manifest.object {
                Object::Deployment(obj) if manifest.component == "webapp" => obj.spec.to_owned(),
                _ => None,
            })
            .and_then(|spec| spec.template.spec)
            .expect("webapp pod");

        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some("registry.local/blackduck-webapp:2019.6.1"));
        assert_eq!(
            container.security_context.as_ref().and_then(|context| context.run_as_user),
            Some(1000)
        );
        assert_eq!(
            pod.image_pull_secrets.expect("pull secrets")[0].name.as_deref(),
            Some("pull")
        );
    }
}
