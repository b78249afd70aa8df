//! # Flavor module
//!
//! This module provide the sizing table mapping a size class to memory, cpu
//! and replica counts for every black duck component.

use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, PartialEq, Eq, Clone, Debug)]
pub enum Error {
    #[error("failed to parse size '{0}', available options are 'small', 'medium', 'large' or 'x-large'")]
    Parse(String),
}

// -----------------------------------------------------------------------------
// Size enumeration

#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Debug)]
pub enum Size {
    Small,
    Medium,
    Large,
    XLarge,
}

impl FromStr for Size {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "small" => Ok(Self::Small),
            "medium" => Ok(Self::Medium),
            "large" => Ok(Self::Large),
            "x-large" | "xlarge" => Ok(Self::XLarge),
            _ => Err(Error::Parse(s.to_string())),
        }
    }
}

impl Display for Size {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Small => write!(f, "small"),
            Self::Medium => write!(f, "medium"),
            Self::Large => write!(f, "large"),
            Self::XLarge => write!(f, "x-large"),
        }
    }
}

// -----------------------------------------------------------------------------
// Limits structure

#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Limits {
    pub replicas: i32,
    /// kubernetes quantity, e.g. `2560M`
    pub memory: &'static str,
    pub cpu: Option<&'static str>,
    /// maximum java heap, exported to the container as `HUB_MAX_MEMORY`
    pub heap: Option<&'static str>,
}

impl Limits {
    const fn memory(memory: &'static str) -> Self {
        Self {
            replicas: 1,
            memory,
            cpu: None,
            heap: None,
        }
    }

    const fn heap(memory: &'static str, heap: &'static str) -> Self {
        Self {
            replicas: 1,
            memory,
            cpu: None,
            heap: Some(heap),
        }
    }
}

// -----------------------------------------------------------------------------
// Flavor structure

#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Flavor {
    pub size: Size,
    pub authentication: Limits,
    pub binary_scanner: Limits,
    pub cfssl: Limits,
    pub documentation: Limits,
    pub jobrunner: Limits,
    pub logstash: Limits,
    pub postgres: Limits,
    pub rabbitmq: Limits,
    pub registration: Limits,
    pub scan: Limits,
    pub solr: Limits,
    pub uploadcache: Limits,
    pub webapp: Limits,
    pub webserver: Limits,
    pub zookeeper: Limits,
}

impl From<Size> for Flavor {
    fn from(size: Size) -> Self {
        let (webserver, solr) = match size {
            Size::Small => ("512M", "640M"),
            _ => ("2048M", "1024M"),
        };

        let (webapp, scan, jobrunner, postgres) = match size {
            Size::Small => (
                ("1", "2560M", "2048m"),
                (1, "2560M", "2048m"),
                (1, "4608M", "4096m"),
                ("1", "3072M"),
            ),
            Size::Medium => (
                ("2", "5120M", "4096m"),
                (2, "5120M", "4096m"),
                (4, "7168M", "6144m"),
                ("2", "8192M"),
            ),
            Size::Large => (
                ("2", "9728M", "8192m"),
                (3, "9728M", "8192m"),
                (6, "13824M", "12288m"),
                ("2", "12288M"),
            ),
            Size::XLarge => (
                ("3", "19728M", "8192m"),
                (5, "9728M", "8192m"),
                (10, "13824M", "12288m"),
                ("3", "12288M"),
            ),
        };

        Self {
            size,
            authentication: Limits::heap("1024M", "512m"),
            binary_scanner: Limits::memory("2048M"),
            cfssl: Limits::memory("640M"),
            documentation: Limits::memory("512M"),
            jobrunner: Limits {
                replicas: jobrunner.0,
                memory: jobrunner.1,
                cpu: None,
                heap: Some(jobrunner.2),
            },
            logstash: Limits::memory("1G"),
            postgres: Limits {
                replicas: 1,
                memory: postgres.1,
                cpu: Some(postgres.0),
                heap: None,
            },
            rabbitmq: Limits::memory("1024M"),
            registration: Limits::memory("1G"),
            scan: Limits {
                replicas: scan.0,
                memory: scan.1,
                cpu: None,
                heap: Some(scan.2),
            },
            solr: Limits::memory(solr),
            uploadcache: Limits::memory("512M"),
            webapp: Limits {
                replicas: 1,
                memory: webapp.1,
                cpu: Some(webapp.0),
                heap: Some(webapp.2),
            },
            webserver: Limits::memory(webserver),
            zookeeper: Limits::memory("640M"),
        }
    }
}
