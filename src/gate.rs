use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::sleep;

use crate::retry::is_retryable_error;

/// Caps how many thunks run at once across every key.
///
/// Admission goes through a fair `Semaphore`, so waiters are served in
/// arrival order. A thunk that fails with a transient error keeps its slot
/// through an exponential delay and runs again ahead of every queued waiter,
/// up to `requeue_limit` times. This recovers from throttling caused by too
/// many concurrent batches and sits outside the per-request retry.
#[derive(Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    limit: usize,
    requeue_limit: u32,
    requeue_base_delay: Duration,
}

impl ConcurrencyGate {
    pub fn new(limit: usize) -> Self {
        Self::with_requeue(limit, 2, Duration::from_millis(500))
    }

    pub fn with_requeue(limit: usize, requeue_limit: u32, requeue_base_delay: Duration) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
            requeue_limit,
            requeue_base_delay,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Slots free right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub async fn acquire(&self, key: &str) -> Result<OwnedSemaphorePermit> {
        if self.semaphore.available_permits() == 0 {
            log::debug!(
                "Concurrency gate saturated ({} slots), {} waits",
                self.limit,
                key
            );
        }
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .with_context(|| format!("Concurrency gate closed while {} was waiting", key))
    }

    /// Runs `thunk` once a slot is free, retrying transient failures in the
    /// same slot.
    pub async fn run<T, F, Fut>(&self, key: &str, mut thunk: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _permit = self.acquire(key).await?;
        let mut requeues = 0u32;

        loop {
            match thunk().await {
                Ok(value) => return Ok(value),
                Err(err) if requeues < self.requeue_limit && is_retryable_error(&err) => {
                    let delay = self
                        .requeue_base_delay
                        .saturating_mul(2_u32.saturating_pow(requeues));
                    log::warn!(
                        "{} throttled, running again at head in {}ms ({}/{}): {:#}",
                        key,
                        delay.as_millis(),
                        requeues + 1,
                        self.requeue_limit,
                        err
                    );
                    sleep(delay).await;
                    requeues += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_limit_under_flood() {
        for limit in [1usize, 2, 5] {
            let gate = ConcurrencyGate::new(limit);
            let current = Arc::new(AtomicUsize::new(0));
            let peak = Arc::new(AtomicUsize::new(0));
            let completed = Arc::new(AtomicUsize::new(0));

            let mut handles = Vec::new();
            for index in 0..1000 {
                let gate = gate.clone();
                let current = current.clone();
                let peak = peak.clone();
                let completed = completed.clone();
                handles.push(tokio::spawn(async move {
                    let key = format!("key-{}", index % 7);
                    gate.run(&key, || {
                        let current = current.clone();
                        let peak = peak.clone();
                        async move {
                            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            sleep(Duration::from_millis(1)).await;
                            current.fetch_sub(1, Ordering::SeqCst);
                            Ok::<(), anyhow::Error>(())
                        }
                    })
                    .await?;
                    completed.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), anyhow::Error>(())
                }));
            }

            for handle in handles {
                handle.await.unwrap().unwrap();
            }

            assert_eq!(completed.load(Ordering::SeqCst), 1000);
            assert_eq!(peak.load(Ordering::SeqCst), limit);
            assert_eq!(gate.available(), limit);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_are_served_in_arrival_order() {
        let gate = ConcurrencyGate::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let blocker = gate.acquire("blocker").await.unwrap();

        let mut handles = Vec::new();
        for index in 0..4 {
            let gate = gate.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                gate.run("batch", || {
                    let order = order.clone();
                    async move {
                        order.lock().unwrap().push(index);
                        Ok::<(), anyhow::Error>(())
                    }
                })
                .await
            }));
            // Let each task register before spawning the next.
            tokio::task::yield_now().await;
        }

        assert_eq!(gate.available(), 0);
        drop(blocker);

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_requeued_with_bound() {
        let gate = ConcurrencyGate::with_requeue(2, 2, Duration::from_millis(100));
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let started = tokio::time::Instant::now();
        let result = gate
            .run("batch", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), anyhow::Error>(ServiceError::status(503, "too many batches").into())
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(300));
        assert_eq!(gate.available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeued_thunk_runs_before_queued_waiters() {
        let gate = ConcurrencyGate::with_requeue(1, 2, Duration::from_millis(100));
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let gate = gate.clone();
            let order = order.clone();
            tokio::spawn(async move {
                let attempts = Arc::new(AtomicUsize::new(0));
                gate.run("first", || {
                    let order = order.clone();
                    let attempts = attempts.clone();
                    async move {
                        let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                        order.lock().unwrap().push(format!("first-{attempt}"));
                        if attempt == 0 {
                            Err(ServiceError::status(503, "busy").into())
                        } else {
                            Ok::<(), anyhow::Error>(())
                        }
                    }
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        let second = {
            let gate = gate.clone();
            let order = order.clone();
            tokio::spawn(async move {
                gate.run("second", || {
                    let order = order.clone();
                    async move {
                        order.lock().unwrap().push("second".to_string());
                        Ok::<(), anyhow::Error>(())
                    }
                })
                .await
            })
        };

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(
            *order.lock().unwrap(),
            vec!["first-0".to_string(), "first-1".to_string(), "second".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_recovers_after_throttle() {
        let gate = ConcurrencyGate::with_requeue(1, 2, Duration::from_millis(100));
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let result = gate
            .run("batch", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(ServiceError::status(503, "busy").into())
                    } else {
                        Ok::<&str, anyhow::Error>("ok")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_failure_is_not_requeued() {
        let gate = ConcurrencyGate::new(2);
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let result = gate
            .run("batch", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), anyhow::Error>(ServiceError::status(400, "bad").into())
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_waiter_does_not_leak_slot() {
        let gate = ConcurrencyGate::new(1);
        let held = gate.acquire("a").await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let _permit = gate.acquire("b").await;
            })
        };
        tokio::task::yield_now().await;

        waiter.abort();
        let _ = waiter.await;
        drop(held);

        let permit = tokio::time::timeout(Duration::from_secs(1), gate.acquire("c")).await;
        assert!(permit.is_ok());
        assert_eq!(gate.available(), 0);
    }
}
