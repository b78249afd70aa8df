//! # Resource module
//!
//! This module provide helpers on kubernetes [`Resource`] and the key used to
//! identify an instance while it travels through the work queue.

use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use k8s_openapi::api::core::v1::ObjectReference;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde_json::Value;

// -----------------------------------------------------------------------------
// ObjectKey structure

/// `namespace/name` identifier of a namespaced object
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Debug)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// returns the key of the given object, none if it is not namespaced
    pub fn of<T>(obj: &T) -> Option<Self>
    where
        T: ResourceExt,
    {
        obj.namespace().map(|namespace| Self::new(namespace, obj.name_any()))
    }
}

impl Display for ObjectKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(thiserror::Error, PartialEq, Eq, Debug)]
#[error("failed to parse '{0}' as a resource key, expected 'namespace/name'")]
pub struct ParseKeyError(String);

impl FromStr for ObjectKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((namespace, name))
                if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(namespace, name))
            }
            _ => Err(ParseKeyError(s.to_string())),
        }
    }
}

// -----------------------------------------------------------------------------
// Helpers functions

/// returns if the resource is considered from kubernetes point of view as deleted
pub fn deleted<T>(obj: &T) -> bool
where
    T: Resource,
{
    obj.meta().deletion_timestamp.is_some()
}

/// returns differnce between the two given object serialize as json patch
pub fn diff<T>(origin: &T, modified: &T) -> Result<json_patch::Patch, serde_json::Error>
where
    T: Serialize,
{
    Ok(json_patch::diff(
        &serde_json::to_value(origin)?,
        &serde_json::to_value(modified)?,
    ))
}

/// returns if every field set in `desired` holds the same value in `actual`.
/// Fields only present in `actual` (defaults filled by the api server, status,
/// managed fields...) are ignored.
pub fn contains(actual: &Value, desired: &Value) -> bool {
    match (actual, desired) {
        (_, Value::Null) => true,
        (Value::Object(actual), Value::Object(desired)) => desired.iter().all(|(key, value)| {
            match actual.get(key) {
                Some(found) => contains(found, value),
                None => value.is_null() || is_empty(value),
            }
        }),
        (Value::Array(actual), Value::Array(desired)) => {
            actual.len() == desired.len()
                && actual
                    .iter()
                    .zip(desired.iter())
                    .all(|(found, value)| contains(found, value))
        }
        (actual, desired) => actual == desired,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// returns a reference to the given object suitable for events
pub fn object_reference<T>(obj: &T) -> ObjectReference
where
    T: Resource<DynamicType = ()> + ResourceExt,
{
    ObjectReference {
        api_version: Some(T::api_version(&()).to_string()),
        kind: Some(T::kind(&()).to_string()),
        name: Some(obj.name_any()),
        namespace: obj.namespace(),
        resource_version: obj.resource_version(),
        uid: obj.uid(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn key_round_trips_through_display() {
        let key: ObjectKey = "blackduck/hub".parse().expect("key");

        assert_eq!(key, ObjectKey::new("blackduck", "hub"));
        assert_eq!(key.to_string(), "blackduck/hub");
    }

    #[test]
    fn malformed_keys_are_rejected() {
        assert!("hub".parse::<ObjectKey>().is_err());
        assert!("/hub".parse::<ObjectKey>().is_err());
        assert!("a/b/c".parse::<ObjectKey>().is_err());
    }

    #[test]
    fn subset_ignores_server_side_fields() {
        let actual = json!({
            "metadata": { "name": "hub", "uid": "1234", "labels": { "app": "blackduck" } },
            "spec": { "replicas": 1, "revisionHistoryLimit": 10 },
            "status": { "readyReplicas": 1 }
        });

        let desired = json!({
            "metadata": { "name": "hub", "labels": { "app": "blackduck" } },
            "spec": { "replicas": 1 }
        });

        assert!(contains(&actual, &desired));
    }

    #[test]
    fn subset_detects_changed_values() {
        let actual = json!({ "spec": { "replicas": 1, "template": { "image": "a:1" } } });

        assert!(!contains(&actual, &json!({ "spec": { "replicas": 2 } })));
        assert!(!contains(&actual, &json!({ "spec": { "template": { "image": "a:2" } } })));
        assert!(!contains(&actual, &json!({ "spec": { "paused": true } })));
    }

    #[test]
    fn subset_compares_arrays_element_wise() {
        let actual = json!({ "ports": [{ "port": 443, "protocol": "TCP" }] });

        assert!(contains(&actual, &json!({ "ports": [{ "port": 443 }] })));
        assert!(!contains(&actual, &json!({ "ports": [{ "port": 443 }, { "port": 80 }] })));
    }
}
