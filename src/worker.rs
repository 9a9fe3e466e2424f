//! A worker is one OS thread owning one native resource. The resource is
//! constructed on the thread, every job runs on the thread, and the resource
//! is torn down on the thread when the queue closes. Request handlers only
//! ever talk to the thread through [`Worker::submit`].

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread;

use tokio::sync::oneshot;

use crate::error::ServiceError;

type Job<R> = Box<dyn FnOnce(&mut R) + Send + 'static>;

pub struct Worker<R> {
    tx: Option<mpsc::Sender<Job<R>>>,
    init: Option<oneshot::Receiver<Result<(), String>>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl<R: 'static> Worker<R> {
    /// Spawns the thread and starts constructing the resource on it. Returns
    /// immediately; await [`Worker::ready`] to observe construction failures.
    pub fn spawn<F>(name: String, init: F) -> Result<Self, ServiceError>
    where
        F: FnOnce() -> anyhow::Result<R> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Job<R>>();
        let (ack_tx, ack_rx) = oneshot::channel();
        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || {
                let mut resource = match init() {
                    Ok(resource) => {
                        let _ = ack_tx.send(Ok(()));
                        resource
                    }
                    Err(err) => {
                        let _ = ack_tx.send(Err(err.to_string()));
                        return;
                    }
                };
                while let Ok(job) = rx.recv() {
                    job(&mut resource);
                }
                // Queue closed: the resource drops here, on its own thread.
            })
            .map_err(|err| {
                ServiceError::Internal(anyhow::anyhow!("failed to spawn worker thread: {err}"))
            })?;
        Ok(Self {
            tx: Some(tx),
            init: Some(ack_rx),
            thread: Some(thread),
        })
    }

    /// Completes once the thread has finished constructing its resource.
    pub async fn ready(&mut self) -> Result<(), ServiceError> {
        let Some(rx) = self.init.take() else {
            return Ok(());
        };
        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(ServiceError::Upstream(message)),
            Err(_) => Err(ServiceError::Upstream(
                "worker thread exited during startup".to_string(),
            )),
        }
    }

    /// Enqueues a job and resolves with its result. Jobs run strictly one at
    /// a time in submission order; a panicking job is caught and surfaced
    /// here while the thread stays alive for later jobs.
    pub async fn submit<T, F>(&self, job: F) -> Result<T, ServiceError>
    where
        T: Send + 'static,
        F: FnOnce(&mut R) -> Result<T, ServiceError> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let job: Job<R> = Box::new(move |resource| {
            let result = match catch_unwind(AssertUnwindSafe(|| job(resource))) {
                Ok(result) => result,
                Err(payload) => Err(ServiceError::WorkerPanic(panic_message(payload.as_ref()))),
            };
            let _ = done_tx.send(result);
        });
        let tx = self.tx.as_ref().ok_or(ServiceError::PoolDisposed)?;
        tx.send(job)
            .map_err(|_| ServiceError::Upstream("worker queue is closed".to_string()))?;
        done_rx
            .await
            .map_err(|_| ServiceError::Upstream("worker dropped the job".to_string()))?
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl<R> Drop for Worker<R> {
    fn drop(&mut self) {
        // Closing the queue lets the thread drain pending jobs, then drop
        // the resource on its own thread before exiting.
        self.tx.take();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn runs_jobs_on_one_thread_with_state() {
        let mut worker = Worker::spawn("test".to_string(), || Ok(0u64)).unwrap();
        worker.ready().await.unwrap();
        for _ in 0..10 {
            worker
                .submit(|count: &mut u64| {
                    *count += 1;
                    Ok(())
                })
                .await
                .unwrap();
        }
        let total = worker.submit(|count: &mut u64| Ok(*count)).await.unwrap();
        assert_eq!(total, 10);
    }

    #[tokio::test]
    async fn jobs_never_overlap() {
        let worker = Arc::new({
            let mut w = Worker::spawn("test".to_string(), || Ok(())).unwrap();
            w.ready().await.unwrap();
            w
        });
        let running = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let worker = Arc::clone(&worker);
            let running = Arc::clone(&running);
            handles.push(tokio::spawn(async move {
                worker
                    .submit(move |_: &mut ()| {
                        let now = running.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(now, 0, "two jobs ran concurrently");
                        std::thread::sleep(Duration::from_millis(5));
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn panics_are_captured_and_thread_survives() {
        let mut worker = Worker::spawn("test".to_string(), || Ok(())).unwrap();
        worker.ready().await.unwrap();
        let err = worker
            .submit(|_: &mut ()| -> Result<(), ServiceError> { panic!("boom") })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::WorkerPanic(message) if message.contains("boom")));
        // Later jobs still run.
        let answer = worker.submit(|_: &mut ()| Ok(42)).await.unwrap();
        assert_eq!(answer, 42);
    }

    #[tokio::test]
    async fn init_failure_is_reported() {
        let mut worker: Worker<()> =
            Worker::spawn("test".to_string(), || anyhow::bail!("no device")).unwrap();
        let err = worker.ready().await.unwrap_err();
        assert!(matches!(err, ServiceError::Upstream(message) if message.contains("no device")));
    }
}
