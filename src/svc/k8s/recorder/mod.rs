//! # Event recorder module
//!
//! This module records kubernetes events on black duck instances, in the
//! spirit of client-go's EventRecorder
//!
//! See <https://github.com/kubernetes/client-go/blob/master/tools/record/event.go>

use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use k8s_openapi::api::core::v1::Event;
use kube::{api::PostParams, Api, Client, Resource, ResourceExt};
use tracing::debug;

pub mod event;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to parse '{0}', available options are 'normal' or 'warning'")]
    Parse(String),
}

// -----------------------------------------------------------------------------
// Level enumeration

#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug)]
pub enum Level {
    Warning,
    Normal,
}

impl FromStr for Level {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "warning" => Self::Warning,
            "normal" => Self::Normal,
            _ => {
                return Err(Error::Parse(s.to_string()));
            }
        })
    }
}

impl Display for Level {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Warning => write!(f, "Warning"),
            Self::Normal => write!(f, "Normal"),
        }
    }
}

// -----------------------------------------------------------------------------
// Helper methods

/// record an event for the given object in its namespace
#[cfg_attr(feature = "trace", tracing::instrument(skip(client, obj)))]
pub async fn record<T>(
    client: Client,
    reporter: &event::Reporter,
    obj: &T,
    level: Level,
    action: &str,
    message: &str,
) -> Result<Event, kube::Error>
where
    T: Resource<DynamicType = ()> + ResourceExt + Debug,
{
    let namespace = obj.namespace().unwrap_or_default();
    debug!(namespace = &namespace, name = obj.name_any(), level = %level, action = action, message = message, "Record event");

    Api::<Event>::namespaced(client, &namespace)
        .create(&PostParams::default(), &event::new(obj, reporter, level, action, message))
        .await
}
