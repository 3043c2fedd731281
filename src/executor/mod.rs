//! Async send executor
//!
//! A fixed pool of worker tasks pulling jobs from one bounded queue. The
//! pool size caps how many stanza writes are in flight; the queue capacity
//! caps how many may wait. A full queue is reported to the submitter instead
//! of blocking it.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use futures::future::join_all;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::utils::error::ExecutorError;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub struct SendExecutor {
    queue: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SendExecutor {
    /// Spawns `workers` worker tasks. Must run inside a tokio runtime.
    pub fn new(workers: usize, queue_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|worker| {
                let rx = rx.clone();
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        let Some(job) = job else { break };
                        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                            error!("Send worker {worker}: job panicked");
                        }
                    }
                    debug!("Send worker {worker} stopped");
                })
            })
            .collect();

        Self {
            queue: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
        }
    }

    /// Queues a job without waiting for it.
    pub fn submit<F>(&self, job: F) -> Result<(), ExecutorError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let queue = self.lock_queue();
        let tx = queue.as_ref().ok_or(ExecutorError::Shutdown)?;
        tx.try_send(Box::pin(job)).map_err(|e| match e {
            TrySendError::Full(_) => ExecutorError::Saturated,
            TrySendError::Closed(_) => ExecutorError::Shutdown,
        })
    }

    /// Queues a job and returns a receiver for its output.
    pub fn execute<F, T>(&self, job: F) -> Result<oneshot::Receiver<T>, ExecutorError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(async move {
            let _ = tx.send(job.await);
        })?;
        Ok(rx)
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock_queue().is_none()
    }

    /// Stops accepting jobs and waits for the queued ones to finish.
    pub async fn shutdown(&self) {
        self.lock_queue().take();
        let workers: Vec<_> = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *workers)
        };
        for result in join_all(workers).await {
            if let Err(e) = result {
                error!("Send worker failed: {e}");
            }
        }
    }

    fn lock_queue(&self) -> MutexGuard<'_, Option<mpsc::Sender<Job>>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}
