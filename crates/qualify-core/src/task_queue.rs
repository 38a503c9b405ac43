//! Shared worker task queue
//!
//! Timer firings, registry notifications and management requests never do
//! their work inline. They push a task here and a fixed pool of workers runs
//! it. Pushing never blocks: a full or stopped queue rejects the task and
//! the caller releases whatever it had prepared for it.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{Mutex, mpsc};
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use crate::error::{QualifyError, Result};

struct QueuedTask {
    name: String,
    future: BoxFuture<'static, ()>,
}

/// Fixed-size pool of async workers fed by a bounded queue
pub struct TaskQueue {
    name: String,
    sender: mpsc::Sender<QueuedTask>,
    cancel_token: CancellationToken,
    workers: TaskTracker,
    active_count: Arc<AtomicUsize>,
    shutdown_timeout: Duration,
}

impl TaskQueue {
    /// Create the queue and start its workers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        name: impl Into<String>,
        worker_count: usize,
        depth: usize,
        shutdown_timeout: Duration,
    ) -> Self {
        let name = name.into();
        let (sender, receiver) = mpsc::channel(depth.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let cancel_token = CancellationToken::new();
        let active_count = Arc::new(AtomicUsize::new(0));
        let workers = TaskTracker::new();

        for worker_id in 0..worker_count.max(1) {
            workers.spawn(run_worker(
                name.clone(),
                worker_id,
                receiver.clone(),
                cancel_token.clone(),
                active_count.clone(),
            ));
        }
        workers.close();

        debug!("Task queue {} started with {} workers", name, worker_count.max(1));

        Self {
            name,
            sender,
            cancel_token,
            workers,
            active_count,
            shutdown_timeout,
        }
    }

    /// Queue a task for the workers
    pub fn push<F>(&self, name: impl Into<String>, future: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        if self.cancel_token.is_cancelled() {
            return Err(QualifyError::TaskQueue(format!(
                "{} is shut down, rejecting task {}",
                self.name, name
            )));
        }

        self.sender
            .try_send(QueuedTask {
                name,
                future: Box::pin(future),
            })
            .map_err(|err| match err {
                TrySendError::Full(task) => QualifyError::TaskQueue(format!(
                    "{} is full, rejecting task {}",
                    self.name, task.name
                )),
                TrySendError::Closed(task) => QualifyError::TaskQueue(format!(
                    "{} is closed, rejecting task {}",
                    self.name, task.name
                )),
            })
    }

    /// Number of tasks currently executing
    pub fn active_task_count(&self) -> usize {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Number of tasks waiting for a worker
    pub fn queued_task_count(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Stop accepting tasks, cancel running ones and wait for the workers
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();

        match tokio::time::timeout(self.shutdown_timeout, self.workers.wait()).await {
            Ok(()) => debug!("Task queue {} shut down", self.name),
            Err(_) => warn!(
                "Task queue {} workers still running after {:?}",
                self.name, self.shutdown_timeout
            ),
        }
    }
}

async fn run_worker(
    queue_name: String,
    worker_id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<QueuedTask>>>,
    cancel_token: CancellationToken,
    active_count: Arc<AtomicUsize>,
) {
    loop {
        let next = tokio::select! {
            _ = cancel_token.cancelled() => break,
            task = async { receiver.lock().await.recv().await } => task,
        };
        let Some(task) = next else {
            break;
        };

        active_count.fetch_add(1, Ordering::SeqCst);
        trace!("Worker {}/{} running task {}", queue_name, worker_id, task.name);

        let cancelled = tokio::select! {
            _ = task.future => false,
            _ = cancel_token.cancelled() => true,
        };

        active_count.fetch_sub(1, Ordering::SeqCst);
        if cancelled {
            debug!("Worker {}/{} cancelled during task {}", queue_name, worker_id, task.name);
            break;
        }
    }

    trace!("Worker {}/{} exiting", queue_name, worker_id);
}
