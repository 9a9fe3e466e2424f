//! Elastic worker pool. Keeps between `min` and `max` workers alive,
//! prefers idle workers, constructs new ones below the cap, and shrinks
//! back to `min` after a quiet period with every worker idle.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::ServiceError;
use crate::worker::Worker;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

type Factory<R> = dyn Fn(usize) -> Result<Worker<R>, ServiceError> + Send + Sync;

pub struct Pool<R: 'static> {
    inner: Arc<Inner<R>>,
}

struct Inner<R: 'static> {
    min: usize,
    max: usize,
    idle_timeout: Duration,
    factory: Box<Factory<R>>,
    state: Mutex<State<R>>,
    available: Notify,
}

struct State<R: 'static> {
    idle: Vec<Worker<R>>,
    total: usize,
    spawned: usize,
    epoch: u64,
    disposed: bool,
}

impl<R: 'static> Pool<R> {
    /// Builds the pool and eagerly constructs `min` workers. The worker
    /// threads initialize their resources in parallel; this returns once
    /// every one of them is ready.
    pub async fn new<F>(
        min: usize,
        max: usize,
        idle_timeout: Duration,
        factory: F,
    ) -> Result<Self, ServiceError>
    where
        F: Fn(usize) -> Result<Worker<R>, ServiceError> + Send + Sync + 'static,
    {
        let max = max.max(min).max(1);
        let inner = Arc::new(Inner {
            min,
            max,
            idle_timeout,
            factory: Box::new(factory),
            state: Mutex::new(State {
                idle: Vec::new(),
                total: 0,
                spawned: 0,
                epoch: 0,
                disposed: false,
            }),
            available: Notify::new(),
        });

        let mut starting = Vec::with_capacity(min);
        for ordinal in 0..min {
            starting.push((inner.factory)(ordinal)?);
        }
        for worker in &mut starting {
            worker.ready().await?;
        }
        {
            let mut state = inner.state.lock().unwrap();
            state.total = starting.len();
            state.spawned = starting.len();
            state.idle = starting;
        }
        Ok(Self { inner })
    }

    /// Takes an idle worker, constructs a new one below `max`, or waits for
    /// a release. Any acquire cancels a pending shrink.
    pub async fn acquire(&self) -> Result<PooledWorker<R>, ServiceError> {
        enum Next {
            Create(usize),
            Wait,
        }
        loop {
            let waiter = self.inner.available.notified();
            let next = {
                let mut state = self.inner.state.lock().unwrap();
                if state.disposed {
                    return Err(ServiceError::PoolDisposed);
                }
                state.epoch = state.epoch.wrapping_add(1);
                if let Some(worker) = state.idle.pop() {
                    return Ok(PooledWorker {
                        worker: Some(worker),
                        pool: Arc::clone(&self.inner),
                    });
                }
                if state.total < self.inner.max {
                    state.total += 1;
                    state.spawned += 1;
                    Next::Create(state.spawned)
                } else {
                    Next::Wait
                }
            };
            match next {
                Next::Create(ordinal) => {
                    let mut worker = match (self.inner.factory)(ordinal) {
                        Ok(worker) => worker,
                        Err(err) => {
                            self.inner.forget_one();
                            return Err(err);
                        }
                    };
                    if let Err(err) = worker.ready().await {
                        self.inner.forget_one();
                        return Err(err);
                    }
                    return Ok(PooledWorker {
                        worker: Some(worker),
                        pool: Arc::clone(&self.inner),
                    });
                }
                Next::Wait => waiter.await,
            }
        }
    }

    /// After this, every release destroys its worker and acquire fails.
    /// Idle workers are destroyed immediately.
    pub fn dispose(&self) {
        let victims = {
            let mut state = self.inner.state.lock().unwrap();
            state.disposed = true;
            state.total -= state.idle.len();
            std::mem::take(&mut state.idle)
        };
        self.inner.available.notify_waiters();
        drop(victims);
    }

    pub fn total(&self) -> usize {
        self.inner.state.lock().unwrap().total
    }

    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().unwrap().idle.len()
    }
}

impl<R: 'static> Inner<R> {
    fn forget_one(&self) {
        let mut state = self.state.lock().unwrap();
        state.total -= 1;
        drop(state);
        self.available.notify_one();
    }
}

fn release<R: 'static>(inner: &Arc<Inner<R>>, worker: Worker<R>) {
    let schedule_shrink = {
        let mut state = inner.state.lock().unwrap();
        if state.disposed {
            state.total -= 1;
            drop(state);
            drop(worker);
            return;
        }
        state.idle.push(worker);
        let all_idle = state.idle.len() == state.total && state.total > inner.min;
        all_idle.then_some(state.epoch)
    };
    inner.available.notify_one();
    if let Some(epoch) = schedule_shrink {
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            tokio::time::sleep(inner.idle_timeout).await;
            shrink_if_quiet(&inner, epoch);
        });
    }
}

fn shrink_if_quiet<R: 'static>(inner: &Arc<Inner<R>>, epoch: u64) {
    let victims = {
        let mut state = inner.state.lock().unwrap();
        if state.disposed || state.epoch != epoch || state.idle.len() != state.total {
            return;
        }
        let mut victims = Vec::new();
        while state.total > inner.min {
            match state.idle.pop() {
                Some(worker) => {
                    victims.push(worker);
                    state.total -= 1;
                }
                None => break,
            }
        }
        victims
    };
    if victims.is_empty() {
        return;
    }
    // Destroying a worker joins its thread; keep that off the async workers.
    tokio::task::spawn_blocking(move || drop(victims));
}

/// Guard over a checked-out worker; returns it to the pool on drop.
pub struct PooledWorker<R: 'static> {
    worker: Option<Worker<R>>,
    pool: Arc<Inner<R>>,
}

impl<R: 'static> std::ops::Deref for PooledWorker<R> {
    type Target = Worker<R>;

    fn deref(&self) -> &Worker<R> {
        self.worker.as_ref().expect("worker present until drop")
    }
}

impl<R: 'static> Drop for PooledWorker<R> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            release(&self.pool, worker);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn counter_factory() -> impl Fn(usize) -> Result<Worker<u64>, ServiceError> + Send + Sync {
        |ordinal| Worker::spawn(format!("pool-test-{ordinal}"), || Ok(0u64))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn eagerly_builds_min_workers() {
        let pool = Pool::new(2, 4, DEFAULT_IDLE_TIMEOUT, counter_factory())
            .await
            .unwrap();
        assert_eq!(pool.total(), 2);
        assert_eq!(pool.idle_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn grows_to_max_then_waits() {
        let pool = Pool::new(0, 2, DEFAULT_IDLE_TIMEOUT, counter_factory())
            .await
            .unwrap();
        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert_eq!(pool.total(), 2);

        // Saturated: a third acquire parks until a release.
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(blocked.is_err(), "acquire should wait at max");

        drop(first);
        let third = pool.acquire().await.unwrap();
        assert_eq!(pool.total(), 2);
        drop(second);
        drop(third);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shrinks_to_min_after_quiet_period() {
        let pool = Pool::new(1, 4, Duration::from_millis(50), counter_factory())
            .await
            .unwrap();
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        assert_eq!(pool.total(), 3);
        drop(a);
        drop(b);
        drop(c);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(pool.total(), 1);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn min_zero_pool_drains_completely() {
        let pool = Pool::new(0, 4, Duration::from_millis(50), counter_factory())
            .await
            .unwrap();
        let a = pool.acquire().await.unwrap();
        drop(a);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(pool.total(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn acquire_cancels_pending_shrink() {
        let pool = Pool::new(0, 4, Duration::from_millis(100), counter_factory())
            .await
            .unwrap();
        let a = pool.acquire().await.unwrap();
        drop(a);
        // Race an acquire in before the timer fires; the held worker must
        // survive the original deadline.
        tokio::time::sleep(Duration::from_millis(30)).await;
        let b = pool.acquire().await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(pool.total(), 1);
        drop(b);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dispose_destroys_on_release() {
        let pool = Pool::new(1, 4, DEFAULT_IDLE_TIMEOUT, counter_factory())
            .await
            .unwrap();
        let held = pool.acquire().await.unwrap();
        pool.dispose();
        assert_eq!(pool.total(), 1, "held worker not destroyed yet");
        drop(held);
        assert_eq!(pool.total(), 0);
        assert!(matches!(
            pool.acquire().await,
            Err(ServiceError::PoolDisposed)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_construction_releases_the_slot() {
        let pool: Pool<u64> = Pool::new(0, 1, DEFAULT_IDLE_TIMEOUT, |ordinal| {
            if ordinal == 1 {
                Err(ServiceError::Upstream("factory failed".to_string()))
            } else {
                Worker::spawn(format!("pool-test-{ordinal}"), || Ok(0u64))
            }
        })
        .await
        .unwrap();
        assert!(pool.acquire().await.is_err());
        // The failed slot was returned; the next acquire may construct again.
        let ok = pool.acquire().await.unwrap();
        assert_eq!(pool.total(), 1);
        drop(ok);
    }
}
