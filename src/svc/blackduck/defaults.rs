//! # Defaults module
//!
//! This module provide the operator defaults of a black duck instance and the
//! typed overlay that merges them with the user's spec. Each field states its
//! own precedence rule, a value set by the user always wins.

use std::collections::BTreeMap;

use crate::svc::{
    blackduck::{
        catalog::{self, Catalog, Component, Release},
        flavor::{self, Flavor, Size},
    },
    cfg,
    crd::blackduck::{BlackduckSpec, ExposeService, ExternalDatabase, Pvc},
};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, PartialEq, Eq, Clone, Debug)]
pub enum Error {
    #[error("invalid size, {0}")]
    Size(flavor::Error),
    #[error("version '{0}' is not supported, supported versions are {1:?}")]
    Version(String, Vec<&'static str>),
    #[error("no release is available in the catalog")]
    EmptyCatalog,
    #[error("invalid exposed service, {0}")]
    Expose(String),
    #[error("invalid external database, {0}")]
    ExternalDatabase(String),
    #[error("invalid environment variable '{0}', expected 'KEY:VALUE'")]
    Environ(String),
    #[error("invalid persistent volume claim '{0}', {1}")]
    Pvc(String, String),
}

// -----------------------------------------------------------------------------
// Defaults structure

/// values that fill the fields a user left unset
#[derive(PartialEq, Clone, Debug)]
pub struct Defaults {
    pub spec: BlackduckSpec,
}

impl From<&cfg::Defaults> for Defaults {
    fn from(config: &cfg::Defaults) -> Self {
        Self {
            spec: BlackduckSpec {
                size: Some(config.size.to_owned()),
                version: config.version.to_owned(),
                expose_service: Some(config.expose_service.to_owned()),
                pvc_storage_class: config.pvc_storage_class.to_owned(),
                liveness_probes: Some(config.liveness_probes),
                persistent_storage: Some(config.persistent_storage),
                pvc: claims(),
                certificate_name: Some(config.certificate_name.to_owned()),
                environs: environs(),
                ..Default::default()
            },
        }
    }
}

/// default persistent volume claims of an instance
pub fn claims() -> Vec<Pvc> {
    [
        ("blackduck-postgres", "150Gi"),
        ("blackduck-authentication", "2Gi"),
        ("blackduck-cfssl", "2Gi"),
        ("blackduck-registration", "2Gi"),
        ("blackduck-solr", "2Gi"),
        ("blackduck-webapp", "2Gi"),
        ("blackduck-logstash", "20Gi"),
        ("blackduck-zookeeper-data", "2Gi"),
        ("blackduck-zookeeper-datalog", "2Gi"),
        ("blackduck-uploadcache-data", "100Gi"),
        ("blackduck-uploadcache-key", "2Gi"),
    ]
    .into_iter()
    .map(|(name, size)| Pvc {
        name: name.to_string(),
        size: Some(size.to_string()),
        ..Default::default()
    })
    .collect()
}

/// shared configuration every instance starts from
pub fn environs() -> Vec<String> {
    [
        "IPV4_ONLY:0",
        "USE_ALERT:0",
        "USE_BINARY_UPLOADS:0",
        "ENABLE_SOURCE_UPLOADS:false",
        "DATA_RETENTION_IN_DAYS:180",
        "MAX_TOTAL_SOURCE_SIZE_MB:4000",
        "HUB_WEBSERVER_PORT:8443",
        "HUB_PROXY_NON_PROXY_HOSTS:solr",
        "BROKER_USE_SSL:yes",
        "SCANNER_CONCURRENCY:1",
        "HTTPS_VERIFY_CERTS:yes",
        "RABBIT_MQ_PORT:5671",
        "RABBITMQ_DEFAULT_VHOST:protecodesc",
        "RABBITMQ_SSL_FAIL_IF_NO_PEER_CERT:false",
        "CLIENT_CERT_CN:binaryscanner",
        "PUBLIC_HUB_WEBSERVER_HOST:localhost",
    ]
    .into_iter()
    .map(ToString::to_string)
    .collect()
}

impl Defaults {
    /// merge the user spec over the defaults, field by field
    pub fn overlay(&self, user: &BlackduckSpec) -> BlackduckSpec {
        let defaults = &self.spec;

        BlackduckSpec {
            size: set(&user.size).or_else(|| defaults.size.to_owned()),
            version: set(&user.version).or_else(|| defaults.version.to_owned()),
            expose_service: set(&user.expose_service).or_else(|| defaults.expose_service.to_owned()),
            db_prototype: set(&user.db_prototype),
            external_database: user.external_database.to_owned(),
            pvc_storage_class: set(&user.pvc_storage_class)
                .or_else(|| defaults.pvc_storage_class.to_owned()),
            liveness_probes: user.liveness_probes.or(defaults.liveness_probes),
            persistent_storage: user.persistent_storage.or(defaults.persistent_storage),
            pvc: overlay_claims(&defaults.pvc, &user.pvc),
            certificate_name: set(&user.certificate_name)
                .or_else(|| defaults.certificate_name.to_owned()),
            certificate: user.certificate.to_owned(),
            certificate_key: user.certificate_key.to_owned(),
            proxy_certificate: user.proxy_certificate.to_owned(),
            auth_custom_ca: user.auth_custom_ca.to_owned(),
            desired_state: user.desired_state,
            environs: overlay_environs(&defaults.environs, &user.environs),
            image_registries: user.image_registries.to_owned(),
            image_uid_map: defaults
                .image_uid_map
                .iter()
                .chain(user.image_uid_map.iter())
                .map(|(name, uid)| (name.to_owned(), *uid))
                .collect(),
            registry_configuration: user.registry_configuration.to_owned(),
            admin_password: user.admin_password.to_owned(),
            user_password: user.user_password.to_owned(),
            postgres_password: user.postgres_password.to_owned(),
        }
    }

    /// merge and validate the user spec
    pub fn resolve(&self, user: &BlackduckSpec, catalog: &Catalog) -> Result<Resolved, Error> {
        let spec = self.overlay(user);

        let size = spec
            .size
            .as_deref()
            .unwrap_or("small")
            .parse::<Size>()
            .map_err(Error::Size)?;

        let release = ensure_version(catalog, spec.version.as_deref())?.to_owned();

        let expose = spec
            .expose_service
            .as_deref()
            .unwrap_or("LoadBalancer")
            .parse::<ExposeService>()
            .map_err(Error::Expose)?;

        if let Some(external) = &spec.external_database {
            validate_external(external)?;
        }

        let environs = parse_environs(&spec.environs)?;

        if let Some(pvc) = spec.pvc.iter().find(|pvc| pvc.name.is_empty()) {
            return Err(Error::Pvc(pvc.name.to_owned(), "name must not be empty".into()));
        }

        let mut images = release.images();
        catalog::override_images(
            &mut images,
            &spec.image_registries,
            spec.registry_configuration.as_ref(),
        );

        Ok(Resolved {
            flavor: Flavor::from(size),
            persistent_storage: spec.persistent_storage.unwrap_or(false),
            liveness_probes: spec.liveness_probes.unwrap_or(false),
            release,
            expose,
            images,
            environs,
            spec,
        })
    }
}

/// user claims replace the default claim of the same name field by field,
/// claims unknown to the defaults are appended
/// an empty string is an unset value
fn set(value: &Option<String>) -> Option<String> {
    value.to_owned().filter(|value| !value.is_empty())
}

fn overlay_claims(defaults: &[Pvc], user: &[Pvc]) -> Vec<Pvc> {
    let mut claims: Vec<Pvc> = defaults
        .iter()
        .map(|default| match user.iter().find(|pvc| pvc.name == default.name) {
            Some(pvc) => Pvc {
                name: default.name.to_owned(),
                size: set(&pvc.size).or_else(|| default.size.to_owned()),
                storage_class: set(&pvc.storage_class).or_else(|| default.storage_class.to_owned()),
                volume_name: set(&pvc.volume_name).or_else(|| default.volume_name.to_owned()),
            },
            None => default.to_owned(),
        })
        .collect();

    claims.extend(
        user.iter()
            .filter(|pvc| !defaults.iter().any(|default| default.name == pvc.name))
            .cloned(),
    );

    claims
}

/// later entries override earlier ones with the same key, order of first
/// appearance is kept
fn overlay_environs(defaults: &[String], user: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = vec![];

    for environ in defaults.iter().chain(user.iter()) {
        let key = environ.split_once(':').map(|(key, _)| key).unwrap_or(environ);
        match merged
            .iter_mut()
            .find(|existing| existing.split_once(':').map(|(k, _)| k).unwrap_or(existing) == key)
        {
            Some(existing) => *existing = environ.to_owned(),
            None => merged.push(environ.to_owned()),
        }
    }

    merged
}

fn parse_environs(environs: &[String]) -> Result<BTreeMap<String, String>, Error> {
    environs
        .iter()
        .map(|environ| match environ.split_once(':') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.trim().to_string()))
            }
            _ => Err(Error::Environ(environ.to_owned())),
        })
        .collect()
}

fn validate_external(external: &ExternalDatabase) -> Result<(), Error> {
    if external.host.trim().is_empty() {
        return Err(Error::ExternalDatabase("postgresHost must be set".into()));
    }

    if let Some(port) = external.port {
        if !(1..=65535).contains(&port) {
            return Err(Error::ExternalDatabase(format!("postgresPort '{port}' is out of range")));
        }
    }

    Ok(())
}

/// resolves the release to deploy, an empty version means the latest one
pub fn ensure_version<'a>(catalog: &'a Catalog, version: Option<&str>) -> Result<&'a Release, Error> {
    match version.filter(|version| !version.is_empty()) {
        None => catalog.latest().ok_or(Error::EmptyCatalog),
        Some(version) => catalog
            .find(version)
            .ok_or_else(|| Error::Version(version.to_string(), catalog.versions())),
    }
}

// -----------------------------------------------------------------------------
// Resolved structure

/// the merged and validated spec of an instance, everything the builder needs
#[derive(PartialEq, Clone, Debug)]
pub struct Resolved {
    pub spec: BlackduckSpec,
    pub flavor: Flavor,
    pub release: Release,
    pub expose: ExposeService,
    pub persistent_storage: bool,
    pub liveness_probes: bool,
    pub images: BTreeMap<Component, String>,
    pub environs: BTreeMap<String, String>,
}

impl Resolved {
    pub fn external_database(&self) -> Option<&ExternalDatabase> {
        self.spec.external_database.as_ref()
    }
}
