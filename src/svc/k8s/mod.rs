//! # Kubernetes module
//!
//! This module provide the reconciliation plumbing: the informer turning watch
//! events into keys, the work queue, the controller loop dispatching keys to a
//! [`Reconciler`], and helpers to interact with kubernetes.

use std::{error::Error, fmt::Debug, sync::Arc};

use async_trait::async_trait;
use kube::{
    runtime::reflector::{ObjectRef, Store},
    Resource,
};
#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use prometheus::{opts, register_counter_vec, CounterVec};
use tokio::time::Instant;
use tracing::{error, info};
#[cfg(feature = "trace")]
use tracing::Instrument;

use crate::svc::k8s::resource::ObjectKey;

pub mod client;
pub mod controller;
pub mod deployer;
pub mod informer;
pub mod manifest;
pub mod queue;
pub mod recorder;
pub mod resource;

// -----------------------------------------------------------------------------
// constants

pub const RECONCILIATION_UPSERT_EVENT: &str = "upsert";
pub const RECONCILIATION_DELETE_EVENT: &str = "delete";

// -----------------------------------------------------------------------------
// Telemetry

#[cfg(feature = "metrics")]
static RECONCILIATION_SUCCESS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_reconciliation_success",
            "number of successful reconciliation"
        ),
        &["kind"]
    )
    .expect("metrics 'kubernetes_operator_reconciliation_success' to not be already initialized")
});

#[cfg(feature = "metrics")]
static RECONCILIATION_FAILED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_reconciliation_failed",
            "number of failed reconciliation"
        ),
        &["kind"]
    )
    .expect("metrics 'kubernetes_operator_reconciliation_failed' to not be already initialized")
});

#[cfg(feature = "metrics")]
static RECONCILIATION_EVENT: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_reconciliation_event",
            "number of reconciliation event",
        ),
        &["kind", "namespace", "event"]
    )
    .expect("metrics 'kubernetes_operator_reconciliation_event' to not be already initialized")
});

#[cfg(feature = "metrics")]
static RECONCILIATION_DURATION: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_reconciliation_duration",
            "duration of reconciliation",
        ),
        &["kind", "unit"]
    )
    .expect("metrics 'kubernetes_operator_reconciliation_duration' to not be already initialized")
});

// -----------------------------------------------------------------------------
// Cache trait

/// read access to the informer's local copy of the watched objects
pub trait Cache<T>: Send + Sync {
    fn get(&self, key: &ObjectKey) -> Option<Arc<T>>;

    fn keys(&self) -> Vec<ObjectKey>;
}

impl<T> Cache<T> for Store<T>
where
    T: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn get(&self, key: &ObjectKey) -> Option<Arc<T>> {
        Store::get(self, &ObjectRef::new(&key.name).within(&key.namespace))
    }

    fn keys(&self) -> Vec<ObjectKey> {
        self.state()
            .iter()
            .filter_map(|obj| ObjectKey::of(obj.as_ref()))
            .collect()
    }
}

// -----------------------------------------------------------------------------
// Reconciler trait

/// provides the two paths a key can be dispatched to by the controller loop
#[async_trait]
pub trait Reconciler<T>: Send + Sync
where
    T: Resource<DynamicType = ()> + Debug + Send + Sync + 'static,
{
    type Error: Error + Send + Sync;

    /// create or update the object, this is part of the the reconcile function
    async fn upsert(&self, obj: Arc<T>) -> Result<(), Self::Error>;

    /// clean up after an object that is no longer in the cache
    async fn delete(&self, key: &ObjectKey) -> Result<(), Self::Error>;

    /// dispatch to [`Reconciler::upsert`] or [`Reconciler::delete`] depending
    /// on whether the object still exists
    async fn reconcile(&self, key: &ObjectKey, obj: Option<Arc<T>>) -> Result<(), Self::Error> {
        let kind = T::kind(&()).to_string();
        let begin = Instant::now();

        let result = match obj {
            Some(obj) if !resource::deleted(obj.as_ref()) => {
                info!(kind = &kind, namespace = &key.namespace, name = &key.name, "Received upsertion event for custom resource");
                #[cfg(feature = "metrics")]
                RECONCILIATION_EVENT
                    .with_label_values(&[&kind, &key.namespace, RECONCILIATION_UPSERT_EVENT])
                    .inc();

                #[cfg(not(feature = "trace"))]
                let result = self.upsert(obj).await;
                #[cfg(feature = "trace")]
                let result = self
                    .upsert(obj)
                    .instrument(tracing::info_span!("Reconciler::upsert"))
                    .await;

                result
            }
            _ => {
                info!(kind = &kind, namespace = &key.namespace, name = &key.name, "Received deletion event for custom resource");
                #[cfg(feature = "metrics")]
                RECONCILIATION_EVENT
                    .with_label_values(&[&kind, &key.namespace, RECONCILIATION_DELETE_EVENT])
                    .inc();

                #[cfg(not(feature = "trace"))]
                let result = self.delete(key).await;
                #[cfg(feature = "trace")]
                let result = self
                    .delete(key)
                    .instrument(tracing::info_span!("Reconciler::delete"))
                    .await;

                result
            }
        };

        #[cfg(feature = "metrics")]
        RECONCILIATION_DURATION
            .with_label_values(&[&kind, "us"])
            .inc_by(begin.elapsed().as_micros() as f64);

        match result {
            Ok(()) => {
                info!(kind = &kind, namespace = &key.namespace, name = &key.name, duration = begin.elapsed().as_millis() as u64, "Successfully reconcile resource");
                #[cfg(feature = "metrics")]
                RECONCILIATION_SUCCESS.with_label_values(&[&kind]).inc();
                Ok(())
            }
            Err(err) => {
                error!(kind = &kind, namespace = &key.namespace, name = &key.name, error = err.to_string(), "Failed to reconcile resource");
                #[cfg(feature = "metrics")]
                RECONCILIATION_FAILED.with_label_values(&[&kind]).inc();
                Err(err)
            }
        }
    }
}
