//! # Controller module
//!
//! This module provide the controller loop: a fixed pool of workers draining
//! the shared work queue. The queue guarantees that two workers never hold
//! the same key, so passes for one instance are serialized while passes for
//! different instances run in parallel.

use std::{fmt::Debug, marker::PhantomData, sync::Arc};

use kube::Resource;
use tracing::{debug, error, info, warn};

use crate::svc::k8s::{queue::WorkQueue, resource::ObjectKey, Cache, Reconciler};

// -----------------------------------------------------------------------------
// Controller structure

pub struct Controller<T, C, R> {
    queue: Arc<WorkQueue<ObjectKey>>,
    cache: Arc<C>,
    reconciler: Arc<R>,
    workers: usize,
    phantom: PhantomData<fn() -> T>,
}

impl<T, C, R> Controller<T, C, R>
where
    T: Resource<DynamicType = ()> + Debug + Send + Sync + 'static,
    C: Cache<T> + 'static,
    R: Reconciler<T> + 'static,
{
    pub fn new(
        queue: Arc<WorkQueue<ObjectKey>>,
        cache: Arc<C>,
        reconciler: Arc<R>,
        workers: usize,
    ) -> Self {
        Self {
            queue,
            cache,
            reconciler,
            workers,
            phantom: PhantomData,
        }
    }

    /// run the workers until the queue is shut down, in-flight passes are
    /// allowed to complete
    pub async fn run(self) {
        info!(workers = self.workers, "Start controller workers");

        let mut handles = vec![];
        for id in 0..self.workers {
            let queue = self.queue.to_owned();
            let cache = self.cache.to_owned();
            let reconciler = self.reconciler.to_owned();

            handles.push(tokio::spawn(async move {
                while let Some(key) = queue.get().await {
                    process(&queue, cache.as_ref(), reconciler.as_ref(), key).await;
                }

                debug!(worker = id, "Worker observed queue shutdown");
            }));
        }

        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = err.to_string(), "could not wait for the worker to complete");
            }
        }

        info!("Controller workers halted");
    }
}

/// reconcile a single key taken from the queue and report the result back
pub async fn process<T, C, R>(queue: &Arc<WorkQueue<ObjectKey>>, cache: &C, reconciler: &R, key: ObjectKey)
where
    T: Resource<DynamicType = ()> + Debug + Send + Sync + 'static,
    C: Cache<T> + ?Sized,
    R: Reconciler<T> + ?Sized,
{
    // a cache miss means the object was deleted
    let obj = cache.get(&key);

    match reconciler.reconcile(&key, obj).await {
        Ok(()) => queue.forget(&key),
        Err(_) => match queue.add_rate_limited(key.to_owned()) {
            Some(delay) => {
                debug!(key = key.to_string(), delay = delay.as_millis() as u64, "Requeue failed reconciliation");
            }
            None => {
                warn!(key = key.to_string(), "Give up on key after too many failed reconciliations");
            }
        },
    }

    queue.done(&key);
}
