//! # Catalog module
//!
//! This module provide the supported black duck releases and the container
//! images each of them is made of.

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
};

use crate::svc::crd::blackduck::RegistryConfiguration;

// -----------------------------------------------------------------------------
// Constants

pub const DEFAULT_REPOSITORY: &str = "docker.io/blackducksoftware";
pub const POSTGRES_IMAGE: &str = "registry.access.redhat.com/rhscl/postgresql-96-rhel7:1";

// -----------------------------------------------------------------------------
// Component enumeration

#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Debug)]
pub enum Component {
    Authentication,
    BinaryScanner,
    Cfssl,
    Documentation,
    Jobrunner,
    Logstash,
    Postgres,
    Rabbitmq,
    Registration,
    Scan,
    Solr,
    Uploadcache,
    Webapp,
    Webserver,
    Zookeeper,
}

impl Display for Component {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Authentication => "authentication",
            Self::BinaryScanner => "binaryscanner",
            Self::Cfssl => "cfssl",
            Self::Documentation => "documentation",
            Self::Jobrunner => "jobrunner",
            Self::Logstash => "logstash",
            Self::Postgres => "postgres",
            Self::Rabbitmq => "rabbitmq",
            Self::Registration => "registration",
            Self::Scan => "scan",
            Self::Solr => "solr",
            Self::Uploadcache => "uploadcache",
            Self::Webapp => "webapp",
            Self::Webserver => "webserver",
            Self::Zookeeper => "zookeeper",
        };

        write!(f, "{name}")
    }
}

// -----------------------------------------------------------------------------
// Release structure

#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Release {
    pub version: &'static str,
    nginx: &'static str,
    logstash: &'static str,
    uploadcache: &'static str,
    appcheck: &'static str,
    solr: bool,
}

impl Release {
    const fn new(
        version: &'static str,
        nginx: &'static str,
        logstash: &'static str,
        uploadcache: &'static str,
        appcheck: &'static str,
        solr: bool,
    ) -> Self {
        Self {
            version,
            nginx,
            logstash,
            uploadcache,
            appcheck,
            solr,
        }
    }

    /// returns the components this release is made of, with their image
    pub fn images(&self) -> BTreeMap<Component, String> {
        let mut images = BTreeMap::from([
            (Component::Authentication, format!("{DEFAULT_REPOSITORY}/blackduck-authentication:{}", self.version)),
            (Component::BinaryScanner, format!("{DEFAULT_REPOSITORY}/appcheck-worker:{}", self.appcheck)),
            (Component::Cfssl, format!("{DEFAULT_REPOSITORY}/blackduck-cfssl:1.0.0")),
            (Component::Documentation, format!("{DEFAULT_REPOSITORY}/blackduck-documentation:{}", self.version)),
            (Component::Jobrunner, format!("{DEFAULT_REPOSITORY}/blackduck-jobrunner:{}", self.version)),
            (Component::Logstash, format!("{DEFAULT_REPOSITORY}/blackduck-logstash:{}", self.logstash)),
            (Component::Postgres, POSTGRES_IMAGE.to_string()),
            (Component::Rabbitmq, format!("{DEFAULT_REPOSITORY}/rabbitmq:1.0.0")),
            (Component::Registration, format!("{DEFAULT_REPOSITORY}/blackduck-registration:{}", self.version)),
            (Component::Scan, format!("{DEFAULT_REPOSITORY}/blackduck-scan:{}", self.version)),
            (Component::Uploadcache, format!("{DEFAULT_REPOSITORY}/blackduck-upload-cache:{}", self.uploadcache)),
            (Component::Webapp, format!("{DEFAULT_REPOSITORY}/blackduck-webapp:{}", self.version)),
            (Component::Webserver, format!("{DEFAULT_REPOSITORY}/blackduck-nginx:{}", self.nginx)),
            (Component::Zookeeper, format!("{DEFAULT_REPOSITORY}/blackduck-zookeeper:1.0.0")),
        ]);

        if self.solr {
            images.insert(Component::Solr, format!("{DEFAULT_REPOSITORY}/blackduck-solr:1.0.0"));
        }

        images
    }
}

// -----------------------------------------------------------------------------
// Catalog structure

/// supported releases, oldest first
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Catalog {
    releases: Vec<Release>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            releases: vec![
                Release::new("2018.12.0", "1.0.0", "1.0.2", "1.0.3", "2019.01", true),
                Release::new("2018.12.1", "1.0.0", "1.0.2", "1.0.3", "2019.01", true),
                Release::new("2018.12.2", "1.0.0", "1.0.2", "1.0.3", "2019.01", true),
                Release::new("2018.12.3", "1.0.0", "1.0.2", "1.0.3", "2019.01", true),
                Release::new("2018.12.4", "1.0.0", "1.0.2", "1.0.3", "2019.01", true),
                Release::new("2019.2.0", "1.0.2", "1.0.2", "1.0.3", "2019.01", true),
                Release::new("2019.2.1", "1.0.2", "1.0.2", "1.0.3", "2019.01", true),
                Release::new("2019.2.2", "1.0.2", "1.0.2", "1.0.3", "2019.01", true),
                Release::new("2019.4.0", "1.0.7", "1.0.4", "1.0.8", "2019.01", false),
                Release::new("2019.4.1", "1.0.7", "1.0.4", "1.0.8", "2019.01", false),
                Release::new("2019.4.2", "1.0.7", "1.0.4", "1.0.8", "2019.01", false),
                Release::new("2019.4.3", "1.0.7", "1.0.4", "1.0.8", "2019.01", false),
                Release::new("2019.6.0", "1.0.7", "1.0.4", "1.0.8", "2019.03", false),
                Release::new("2019.6.1", "1.0.7", "1.0.4", "1.0.8", "2019.03", false),
            ],
        }
    }
}

impl Catalog {
    pub fn versions(&self) -> Vec<&'static str> {
        self.releases.iter().map(|release| release.version).collect()
    }

    pub fn latest(&self) -> Option<&Release> {
        self.releases.last()
    }

    pub fn find(&self, version: &str) -> Option<&Release> {
        self.releases
            .iter()
            .find(|release| release.version == version)
    }
}

// -----------------------------------------------------------------------------
// Helpers

/// returns the repository name of an image, without registry nor tag
pub fn repository(image: &str) -> &str {
    let name = image.rsplit('/').next().unwrap_or(image);
    name.split(['@', ':']).next().unwrap_or(name)
}

/// applies user overrides to the release images. An override replaces the
/// image sharing its repository name, then the registry configuration
/// rewrites the registry of every image.
pub fn override_images(
    images: &mut BTreeMap<Component, String>,
    overrides: &[String],
    registry: Option<&RegistryConfiguration>,
) {
    for image in images.values_mut() {
        if let Some(found) = overrides
            .iter()
            .find(|candidate| repository(candidate) == repository(image))
        {
            *image = found.to_owned();
        }
    }

    if let Some(host) = registry.and_then(|registry| registry.registry.as_deref()) {
        for image in images.values_mut() {
            let name = image.rsplit('/').next().unwrap_or(image).to_string();
            *image = match registry.and_then(|registry| registry.namespace.as_deref()) {
                Some(namespace) => format!("{host}/{namespace}/{name}"),
                None => format!("{host}/{name}"),
            };
        }
    }
}
