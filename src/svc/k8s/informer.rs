//! # Informer module
//!
//! This module watches a custom resource, keeps the local cache up to date
//! and turns every notification into a key pushed to the work queue. It never
//! calls the reconciler itself.

use std::{collections::HashSet, fmt::Debug, sync::Arc, time::Duration};

use futures::StreamExt;
use kube::{
    runtime::{
        reflector::{self, store::Writer, Store},
        watcher, WatchStreamExt,
    },
    Api, Resource,
};
use serde::de::DeserializeOwned;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::svc::k8s::{queue::WorkQueue, resource::ObjectKey, Cache};

// -----------------------------------------------------------------------------
// Informer structure

pub struct Informer<T>
where
    T: Resource<DynamicType = ()> + Clone + 'static,
{
    api: Api<T>,
    writer: Writer<T>,
    store: Store<T>,
    queue: Arc<WorkQueue<ObjectKey>>,
    resync: Option<Duration>,
}

impl<T> Informer<T>
where
    T: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    pub fn new(api: Api<T>, queue: Arc<WorkQueue<ObjectKey>>, resync: Option<Duration>) -> Self {
        let (store, writer) = reflector::store();

        Self {
            api,
            writer,
            store,
            queue,
            resync,
        }
    }

    /// returns a read handle on the local cache
    pub fn store(&self) -> Store<T> {
        self.store.to_owned()
    }

    /// consume watch events until the stream ends, an error of the watch
    /// stream is logged and the stream retried with a backoff
    pub async fn run(self) {
        let Self {
            api,
            writer,
            store,
            queue,
            resync,
        } = self;

        let kind = T::kind(&()).to_string();
        let mut known = HashSet::new();
        let mut ticker = resync.map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        let mut stream = reflector::reflector(writer, watcher(api, watcher::Config::default()))
            .default_backoff()
            .boxed();

        info!(kind = &kind, "Start to listen for events of custom resource");
        loop {
            tokio::select! {
                event = stream.next() => match event {
                    None => {
                        debug!(kind = &kind, "We have reached the end of the infinite watch stream");
                        return;
                    }
                    Some(Ok(event)) => {
                        for key in keys(&mut known, event) {
                            debug!(kind = &kind, key = key.to_string(), "Enqueue key from watch event");
                            queue.add(key);
                        }
                    }
                    Some(Err(err)) => {
                        warn!(kind = &kind, error = err.to_string(), "Failed to watch custom resource");
                    }
                },
                _ = tick(&mut ticker) => {
                    let keys = store.keys();
                    debug!(kind = &kind, count = keys.len(), "Resynchronise keys from cache");
                    for key in keys {
                        queue.add(key);
                    }
                }
            }
        }
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => futures::future::pending::<()>().await,
    }
}

/// returns the keys affected by the event. A restart of the watch replaces the
/// whole listing, so every key known before or after it is returned which lets
/// the controller notice objects deleted while the watch was down.
pub fn keys<T>(known: &mut HashSet<ObjectKey>, event: watcher::Event<T>) -> Vec<ObjectKey>
where
    T: Resource,
{
    match event {
        watcher::Event::Applied(obj) => ObjectKey::of(&obj)
            .map(|key| {
                known.insert(key.to_owned());
                vec![key]
            })
            .unwrap_or_default(),
        watcher::Event::Deleted(obj) => ObjectKey::of(&obj)
            .map(|key| {
                known.remove(&key);
                vec![key]
            })
            .unwrap_or_default(),
        watcher::Event::Restarted(objs) => {
            let listed: HashSet<ObjectKey> = objs.iter().filter_map(ObjectKey::of).collect();
            let mut keys: Vec<ObjectKey> = known.union(&listed).cloned().collect();

            keys.sort();
            *known = listed;
            keys
        }
    }
}
