//! Fixed-size pool of tokio workers pulling jobs from one shared queue.
//!
//! Client submissions go through [`WorkerPool::submit`], which refuses work
//! once the queue holds `capacity` jobs or shutdown has begun. Follow-up steps
//! of work already accepted use [`WorkerPool::spawn`], which is never refused
//! before the pool stops, so an in-flight request can always finish its chain
//! while the pool drains.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type Job = BoxFuture<'static, ()>;

/// Reasons a job is refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Worker pool is shut down")]
    Shutdown,

    #[error("Worker pool queue is full ({0} jobs)")]
    QueueFull(usize),
}

#[derive(Default)]
struct PoolState {
    accepting: AtomicBool,
    stopped: AtomicBool,
    queued: AtomicUsize,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl PoolState {
    fn finish_job(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Bounded worker pool shared by every pipeline step
pub struct WorkerPool {
    sender: mpsc::UnboundedSender<Job>,
    state: Arc<PoolState>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    capacity: usize,
}

impl WorkerPool {
    /// Start `size` workers. Must be called inside a tokio runtime.
    pub fn new(size: usize, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel::<Job>();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let state = Arc::new(PoolState::default());
        state.accepting.store(true, Ordering::SeqCst);

        let size = size.max(1);
        let workers = (0..size)
            .map(|worker_id| {
                let receiver = receiver.clone();
                let state = state.clone();
                tokio::spawn(async move {
                    debug!(worker_id, "Pool worker started");
                    loop {
                        let job = { receiver.lock().await.recv().await };
                        let Some(job) = job else { break };
                        state.queued.fetch_sub(1, Ordering::SeqCst);

                        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                            error!(worker_id, "Pool job panicked");
                        }
                        state.finish_job();
                    }
                    debug!(worker_id, "Pool worker stopped");
                })
            })
            .collect();

        info!(workers = size, capacity, "Worker pool started");

        Self {
            sender,
            state,
            workers: Mutex::new(workers),
            capacity,
        }
    }

    /// Queue a new unit of client work
    pub fn submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.state.accepting.load(Ordering::SeqCst) {
            return Err(PoolError::Shutdown);
        }
        if self.state.queued.load(Ordering::SeqCst) >= self.capacity {
            return Err(PoolError::QueueFull(self.capacity));
        }
        self.enqueue(job.boxed())
    }

    /// Queue a follow-up step of work the pool already accepted
    pub fn spawn<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.enqueue(job.boxed())
    }

    fn enqueue(&self, job: Job) -> Result<(), PoolError> {
        if self.state.stopped.load(Ordering::SeqCst) {
            return Err(PoolError::Shutdown);
        }

        self.state.in_flight.fetch_add(1, Ordering::SeqCst);
        self.state.queued.fetch_add(1, Ordering::SeqCst);

        if self.sender.send(job).is_err() {
            self.state.queued.fetch_sub(1, Ordering::SeqCst);
            self.state.finish_job();
            return Err(PoolError::Shutdown);
        }
        Ok(())
    }

    /// Jobs queued or running
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_accepting(&self) -> bool {
        self.state.accepting.load(Ordering::SeqCst)
    }

    /// Wait until no job is queued or running
    pub async fn idle(&self) {
        loop {
            let notified = self.state.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting submissions, let in-flight work drain for up to
    /// `grace`, then stop the workers. Returns whether everything drained.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.state.accepting.store(false, Ordering::SeqCst);
        info!(in_flight = self.in_flight(), "Worker pool draining");

        let drained = tokio::time::timeout(grace, self.idle()).await.is_ok();
        if !drained {
            warn!(
                in_flight = self.in_flight(),
                grace_secs = grace.as_secs_f64(),
                "Worker pool did not drain before the grace period ended"
            );
        }

        self.state.stopped.store(true, Ordering::SeqCst);
        for worker in self.workers.lock().drain(..) {
            worker.abort();
        }

        info!(drained, "Worker pool stopped");
        drained
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for worker in self.workers.get_mut().drain(..) {
            worker.abort();
        }
    }
}
