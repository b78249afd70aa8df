//! # Work queue module
//!
//! This module provide a de-duplicating, rate-limited FIFO of keys. A key that
//! is queued or being processed is never handed out twice, and a key that
//! keeps failing is re-added with an exponential backoff until it reaches the
//! maximum number of retries.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt::Debug,
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use prometheus::{opts, register_counter_vec, CounterVec};
use tokio::{sync::Notify, time::sleep};
use tracing::{debug, warn};

use crate::svc::cfg;

// -----------------------------------------------------------------------------
// Telemetry

#[cfg(feature = "metrics")]
static QUEUE_DROPPED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_queue_dropped",
            "number of keys dropped after too many retries"
        ),
        &["queue"]
    )
    .expect("metrics 'kubernetes_operator_queue_dropped' to not be already initialized")
});

// -----------------------------------------------------------------------------
// Backoff structure

#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub retries: u32,
}

impl From<&cfg::Queue> for Backoff {
    fn from(config: &cfg::Queue) -> Self {
        Self {
            base: Duration::from_millis(config.base_delay),
            max: Duration::from_secs(config.max_delay),
            retries: config.max_retries,
        }
    }
}

impl Backoff {
    /// delay before the given failure, `failures` starts at one
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);

        self.base
            .checked_mul(1 << exponent)
            .map(|delay| delay.min(self.max))
            .unwrap_or(self.max)
    }
}

// -----------------------------------------------------------------------------
// Inner structure

struct Inner<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    failures: HashMap<T, u32>,
    shutting_down: bool,
}

impl<T> Default for Inner<T> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            failures: HashMap::new(),
            shutting_down: false,
        }
    }
}

// -----------------------------------------------------------------------------
// WorkQueue structure

pub struct WorkQueue<T> {
    name: String,
    backoff: Backoff,
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

impl<T> WorkQueue<T>
where
    T: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, backoff: Backoff) -> Self {
        Self {
            name: name.into(),
            backoff,
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        // the lock is never held across a panic-prone section, a poisoned
        // mutex still has consistent bookkeeping
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// marks the item as needing processing. Returns false once the queue is
    /// shutting down.
    pub fn add(&self, item: T) -> bool {
        let mut inner = self.lock();

        if inner.shutting_down {
            return false;
        }

        if !inner.dirty.insert(item.to_owned()) {
            return true;
        }

        // re-queued by `done` once the current processing completes
        if inner.processing.contains(&item) {
            return true;
        }

        inner.queue.push_back(item);
        drop(inner);

        self.notify.notify_one();
        true
    }

    /// waits for the next item, returns none once the queue is shutting down.
    /// The caller must call [`WorkQueue::done`] with the item afterward.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();

                if inner.shutting_down {
                    return None;
                }

                if let Some(item) = inner.queue.pop_front() {
                    inner.dirty.remove(&item);
                    inner.processing.insert(item.to_owned());

                    let remaining = !inner.queue.is_empty();
                    drop(inner);

                    if remaining {
                        self.notify.notify_one();
                    }

                    return Some(item);
                }
            }

            notified.await;
        }
    }

    /// marks the item as processed, an item added meanwhile is queued again
    pub fn done(&self, item: &T) {
        let mut inner = self.lock();

        inner.processing.remove(item);
        if inner.dirty.contains(item) && !inner.shutting_down {
            inner.queue.push_back(item.to_owned());
            drop(inner);

            self.notify.notify_one();
        }
    }

    /// resets the failure count of the item
    pub fn forget(&self, item: &T) {
        self.lock().failures.remove(item);
    }

    pub fn failures(&self, item: &T) -> u32 {
        self.lock().failures.get(item).copied().unwrap_or(0)
    }

    /// re-adds the item after a delay that grows with its failure count.
    /// Returns the delay, or none when the item exceeded the maximum number
    /// of retries and was dropped.
    pub fn add_rate_limited(self: &Arc<Self>, item: T) -> Option<Duration> {
        let failures = {
            let mut inner = self.lock();
            if inner.shutting_down {
                return None;
            }

            let failures = inner.failures.entry(item.to_owned()).or_insert(0);
            *failures += 1;
            let failures = *failures;

            if failures > self.backoff.retries {
                inner.failures.remove(&item);
                drop(inner);

                warn!(queue = &self.name, item = ?item, retries = self.backoff.retries, "Drop item from queue, too many retries");
                #[cfg(feature = "metrics")]
                QUEUE_DROPPED.with_label_values(&[&self.name]).inc();
                return None;
            }

            failures
        };

        let delay = self.backoff.delay(failures);
        debug!(queue = &self.name, item = ?item, failures = failures, delay = delay.as_millis() as u64, "Requeue item with backoff");

        let queue = self.to_owned();
        tokio::spawn(async move {
            sleep(delay).await;
            queue.add(item);
        });

        Some(delay)
    }

    /// stops handing out items and refuses new ones, processing items are
    /// allowed to finish
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::time::{timeout, Instant};

    use super::*;

    fn queue() -> Arc<WorkQueue<String>> {
        Arc::new(WorkQueue::new(
            "test",
            Backoff {
                base: Duration::from_millis(5),
                max: Duration::from_secs(1),
                retries: 3,
            },
        ))
    }

    #[test]
    fn backoff_grows_exponentially_and_is_capped() {
        let backoff = Backoff {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1000),
            retries: 15,
        };

        assert_eq!(backoff.delay(1), Duration::from_millis(5));
        assert_eq!(backoff.delay(2), Duration::from_millis(10));
        assert_eq!(backoff.delay(4), Duration::from_millis(40));
        assert_eq!(backoff.delay(64), Duration::from_secs(1000));
    }

    #[tokio::test]
    async fn duplicates_are_coalesced() {
        let queue = queue();

        assert!(queue.add("a/b".to_string()));
        assert!(queue.add("a/b".to_string()));
        assert!(queue.add("c/d".to_string()));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await, Some("a/b".to_string()));
        assert_eq!(queue.get().await, Some("c/d".to_string()));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn item_added_while_processing_is_held_until_done() {
        let queue = queue();

        queue.add("a/b".to_string());
        let item = queue.get().await.expect("item");

        queue.add("a/b".to_string());
        queue.add("a/b".to_string());
        assert!(queue.is_empty(), "processing item must not be handed out twice");

        queue.done(&item);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some("a/b".to_string()));
    }

    #[tokio::test]
    async fn at_most_one_worker_processes_a_key() {
        let queue = queue();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let processed = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..4 {
            let queue = queue.clone();
            let in_flight = in_flight.clone();
            let max_in_flight = max_in_flight.clone();
            let processed = processed.clone();

            handles.push(tokio::spawn(async move {
                while let Some(item) = queue.get().await {
                    let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_in_flight.fetch_max(current, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    processed.fetch_add(1, Ordering::SeqCst);
                    queue.done(&item);
                }
            }));
        }

        for _ in 0..50 {
            queue.add("a/b".to_string());
            tokio::task::yield_now().await;
        }

        timeout(Duration::from_secs(5), async {
            while !queue.is_empty() || in_flight.load(Ordering::SeqCst) > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("queue to drain");

        queue.shut_down();
        for handle in handles {
            handle.await.expect("worker to stop");
        }

        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        assert!(processed.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_requeued_with_backoff_then_dropped() {
        let queue = queue();
        let item = "a/b".to_string();

        let begin = Instant::now();
        assert_eq!(queue.add_rate_limited(item.to_owned()), Some(Duration::from_millis(5)));
        assert_eq!(queue.get().await, Some(item.to_owned()));
        assert!(begin.elapsed() >= Duration::from_millis(5));
        queue.done(&item);

        assert_eq!(queue.add_rate_limited(item.to_owned()), Some(Duration::from_millis(10)));
        assert_eq!(queue.add_rate_limited(item.to_owned()), Some(Duration::from_millis(20)));
        assert_eq!(queue.failures(&item), 3);

        assert_eq!(queue.add_rate_limited(item.to_owned()), None);
        assert_eq!(queue.failures(&item), 0);
    }

    #[tokio::test]
    async fn forget_resets_failures() {
        let queue = queue();
        let item = "a/b".to_string();

        queue.add_rate_limited(item.to_owned());
        assert_eq!(queue.failures(&item), 1);

        queue.forget(&item);
        assert_eq!(queue.failures(&item), 0);
    }

    #[tokio::test]
    async fn shutdown_wakes_waiting_workers_and_refuses_items() {
        let queue = queue();

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };

        tokio::task::yield_now().await;
        queue.shut_down();

        assert_eq!(waiter.await.expect("waiter"), None);
        assert!(!queue.add("a/b".to_string()));
        assert!(queue.is_shutting_down());
    }
}
