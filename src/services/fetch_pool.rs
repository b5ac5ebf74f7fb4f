use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::time::timeout;

/// Terminal result of one pooled fetch. Every submission resolves to exactly
/// one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome<T> {
    Completed(T),
    TimedOut,
    Cancelled,
}

impl<T> FetchOutcome<T> {
    pub fn into_completed(self) -> Option<T> {
        match self {
            FetchOutcome::Completed(value) => Some(value),
            _ => None,
        }
    }
}

type SharedOutcome<T> = Shared<BoxFuture<'static, FetchOutcome<T>>>;

/// Bounded pool for external-process invocations.
///
/// Work runs on spawned tasks and completion is signalled by future
/// resolution; there is no flag-polling sleep loop anywhere, which is what
/// previously allowed completions to be missed or double-counted. At most
/// one invocation is in flight per fetch key; a second submission for the
/// same key joins the existing one instead of spawning a duplicate process.
pub struct FetchPool<T: Clone + Send + 'static> {
    semaphore: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashMap<String, SharedOutcome<T>>>>,
    shutdown: watch::Sender<bool>,
    task_timeout: Duration,
}

impl<T: Clone + Send + 'static> FetchPool<T> {
    pub fn new(workers: usize, task_timeout: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            semaphore: Arc::new(Semaphore::new(workers)),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            shutdown,
            task_timeout,
        }
    }

    /// Submit work under a fetch key, joining any in-flight work for the
    /// same key. Resolves exactly once per submission.
    pub async fn submit<F>(&self, key: &str, work: F) -> FetchOutcome<T>
    where
        F: Future<Output = T> + Send + 'static,
    {
        if *self.shutdown.borrow() {
            return FetchOutcome::Cancelled;
        }

        let shared = {
            let mut in_flight = self
                .in_flight
                .lock()
                .expect("fetch pool lock poisoned");
            if let Some(existing) = in_flight.get(key) {
                log::debug!("Joining in-flight fetch for key '{key}'");
                existing.clone()
            } else {
                let shared = self.spawn_work(work);
                in_flight.insert(key.to_string(), shared.clone());
                shared
            }
        };

        let outcome = shared.await;

        // First resolver wins the removal; duplicates removing again is harmless.
        self.in_flight
            .lock()
            .expect("fetch pool lock poisoned")
            .remove(key);

        outcome
    }

    fn spawn_work<F>(&self, work: F) -> SharedOutcome<T>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        let mut shutdown_rx = self.shutdown.subscribe();
        let task_timeout = self.task_timeout;

        let handle = tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return FetchOutcome::Cancelled,
            };
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    // Dropping the work future kills any spawned child process.
                    FetchOutcome::Cancelled
                }
                result = timeout(task_timeout, work) => match result {
                    Ok(value) => FetchOutcome::Completed(value),
                    Err(_) => FetchOutcome::TimedOut,
                },
            }
        });

        async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(_) => FetchOutcome::Cancelled,
            }
        }
        .boxed()
        .shared()
    }

    /// Cancel all in-flight work. Permits are released as the cancelled
    /// tasks unwind, so nothing blocks a later restart of the daemon loop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn completes_with_result() {
        let pool: FetchPool<u32> = FetchPool::new(2, Duration::from_secs(5));
        let outcome = pool.submit("k", async { 7 }).await;
        assert_eq!(outcome, FetchOutcome::Completed(7));
    }

    #[tokio::test]
    async fn concurrent_submissions_for_one_key_run_once() {
        let pool: Arc<FetchPool<u32>> = Arc::new(FetchPool::new(2, Duration::from_secs(5)));
        let runs = Arc::new(AtomicUsize::new(0));

        let make_work = |runs: Arc<AtomicUsize>| async move {
            runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            42u32
        };

        let a = {
            let pool = Arc::clone(&pool);
            let work = make_work(Arc::clone(&runs));
            tokio::spawn(async move { pool.submit("usage", work).await })
        };
        let b = {
            let pool = Arc::clone(&pool);
            let work = make_work(Arc::clone(&runs));
            tokio::spawn(async move { pool.submit("usage", work).await })
        };

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert_eq!(a, FetchOutcome::Completed(42));
        assert_eq!(b, FetchOutcome::Completed(42));
        assert_eq!(runs.load(Ordering::SeqCst), 1, "work ran more than once");
    }

    #[tokio::test]
    async fn distinct_keys_run_independently() {
        let pool: FetchPool<u32> = FetchPool::new(2, Duration::from_secs(5));
        let a = pool.submit("a", async { 1 }).await;
        let b = pool.submit("b", async { 2 }).await;
        assert_eq!(a, FetchOutcome::Completed(1));
        assert_eq!(b, FetchOutcome::Completed(2));
    }

    #[tokio::test]
    async fn slow_work_times_out() {
        let pool: FetchPool<u32> = FetchPool::new(1, Duration::from_millis(20));
        let outcome = pool
            .submit("slow", async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                1
            })
            .await;
        assert_eq!(outcome, FetchOutcome::TimedOut);
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight_work() {
        let pool: Arc<FetchPool<u32>> = Arc::new(FetchPool::new(1, Duration::from_secs(30)));
        let task = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.submit("usage", async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    1
                })
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.shutdown();

        assert_eq!(task.await.unwrap(), FetchOutcome::Cancelled);
    }

    #[tokio::test]
    async fn submissions_after_shutdown_are_cancelled() {
        let pool: FetchPool<u32> = FetchPool::new(1, Duration::from_secs(5));
        pool.shutdown();
        assert_eq!(pool.submit("k", async { 1 }).await, FetchOutcome::Cancelled);
    }

    #[tokio::test]
    async fn key_is_reusable_after_completion() {
        let pool: FetchPool<u32> = FetchPool::new(1, Duration::from_secs(5));
        assert_eq!(pool.submit("k", async { 1 }).await, FetchOutcome::Completed(1));
        assert_eq!(pool.submit("k", async { 2 }).await, FetchOutcome::Completed(2));
    }
}
