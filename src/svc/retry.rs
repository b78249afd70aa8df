//! # Retry module
//!
//! This module provides a polling helper used by every "wait for X to become
//! ready" call site. Each call states how many attempts it is allowed to make
//! and how long to sleep between two of them.

use std::{future::Future, time::Duration};

use tokio::time::sleep;
use tracing::trace;

// -----------------------------------------------------------------------------
// Attempts enumeration

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Attempts {
    /// give up once the given number of attempts have been consumed
    Bounded(u32),
    /// keep trying until the predicate succeeds or aborts
    Unbounded,
}

impl Attempts {
    fn allows(&self, attempt: u32) -> bool {
        match self {
            Self::Bounded(max) => attempt < *max,
            Self::Unbounded => true,
        }
    }
}

// -----------------------------------------------------------------------------
// Step enumeration

/// result of a single attempt
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum Step<T> {
    Ready(T),
    Retry,
    Abort,
}

// -----------------------------------------------------------------------------
// Outcome enumeration

/// result of the whole polling sequence
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum Outcome<T> {
    Ready(T),
    Exhausted,
    Aborted,
}

impl<T> Outcome<T> {
    pub fn ready(self) -> Option<T> {
        match self {
            Self::Ready(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

// -----------------------------------------------------------------------------
// poll function

/// calls the predicate until it returns [`Step::Ready`] or [`Step::Abort`], or
/// until attempts are exhausted. The predicate receives the zero-based attempt
/// number. There is no sleep after the last attempt.
pub async fn poll<F, Fut, T>(attempts: Attempts, interval: Duration, mut predicate: F) -> Outcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Step<T>>,
{
    let mut attempt = 0;

    while attempts.allows(attempt) {
        match predicate(attempt).await {
            Step::Ready(value) => return Outcome::Ready(value),
            Step::Abort => return Outcome::Aborted,
            Step::Retry => {}
        }

        attempt += 1;
        if attempts.allows(attempt) {
            trace!(attempt = attempt, interval = interval.as_secs(), "Retry after interval");
            sleep(interval).await;
        }
    }

    Outcome::Exhausted
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use tokio::time::Instant;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ready_after_failures_takes_one_interval_per_failure() {
        let begin = Instant::now();
        let outcome = poll(Attempts::Bounded(10), Duration::from_secs(10), |attempt| async move {
            if attempt == 3 {
                Step::Ready(attempt)
            } else {
                Step::Retry
            }
        })
        .await;

        assert_eq!(outcome, Outcome::Ready(3));
        assert_eq!(begin.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_poll_is_exhausted() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let outcome: Outcome<()> = poll(Attempts::Bounded(4), Duration::from_secs(1), |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Step::Retry
            }
        })
        .await;

        assert_eq!(outcome, Outcome::Exhausted);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_stops_immediately() {
        let outcome: Outcome<()> =
            poll(Attempts::Unbounded, Duration::from_secs(1), |attempt| async move {
                if attempt == 2 {
                    Step::Abort
                } else {
                    Step::Retry
                }
            })
            .await;

        assert_eq!(outcome, Outcome::Aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_never_calls_predicate() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let outcome: Outcome<()> = poll(Attempts::Bounded(0), Duration::from_secs(1), |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Step::Ready(())
            }
        })
        .await;

        assert_eq!(outcome, Outcome::Exhausted);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
