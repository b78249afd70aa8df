//! # Event module
//!
//! This module builds core/v1 events attached to black duck instances

use std::fmt::Debug;

use chrono::Utc;
use k8s_openapi::{
    api::core::v1::{Event, EventSource},
    apimachinery::pkg::apis::meta::v1::{MicroTime, Time},
};
use kube::{api::ObjectMeta, Resource, ResourceExt};

use crate::svc::k8s::{recorder::Level, resource};

// -----------------------------------------------------------------------------
// Reporter structure

/// identity of the operator replica emitting events
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Reporter {
    pub component: String,
    pub host: Option<String>,
}

impl Default for Reporter {
    fn default() -> Self {
        Self {
            component: env!("CARGO_PKG_NAME").to_string(),
            host: hostname::get()
                .ok()
                .map(|host| host.to_string_lossy().to_string()),
        }
    }
}

impl Reporter {
    /// returns `<component>/<host>`, the host being the pod name in cluster
    pub fn instance(&self) -> String {
        match &self.host {
            Some(host) => format!("{}/{host}", self.component),
            None => self.component.to_owned(),
        }
    }

    pub fn source(&self) -> EventSource {
        EventSource {
            component: Some(self.component.to_owned()),
            host: self.host.to_owned(),
        }
    }
}

// -----------------------------------------------------------------------------
// Helper functions

/// create a new event, named `<object>.<timestamp in hex>` like client-go does
pub fn new<T>(obj: &T, reporter: &Reporter, level: Level, action: &str, message: &str) -> Event
where
    T: Resource<DynamicType = ()> + ResourceExt + Debug,
{
    let now = Utc::now();

    Event {
        metadata: ObjectMeta {
            namespace: obj.namespace(),
            name: Some(format!("{}.{:x}", obj.name_any(), now.timestamp_millis())),
            ..Default::default()
        },
        type_: Some(level.to_string()),
        action: Some(action.to_string()),
        reason: Some(action.to_string()),
        message: Some(message.to_string()),
        count: Some(1),
        event_time: Some(MicroTime(now)),
        first_timestamp: Some(Time(now)),
        last_timestamp: Some(Time(now)),
        involved_object: resource::object_reference(obj),
        reporting_component: Some(reporter.component.to_owned()),
        reporting_instance: Some(reporter.instance()),
        source: Some(reporter.source()),
        ..Default::default()
    }
}
