//! Bounded worker pool
//!
//! A fixed number of workers pull boxed futures from a bounded channel.
//! Submission never blocks: when the buffer is full the task is dropped.

use crate::platform::pipeline::panic_message;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

/// Default capacity of the task buffer
pub const DEFAULT_TASK_BUFFER: usize = 100;

pub type Task = BoxFuture<'static, ()>;

struct Running {
    tx: mpsc::Sender<Task>,
    workers: Vec<JoinHandle<()>>,
}

pub struct TaskQueue {
    workers: usize,
    buffer: usize,
    state: Mutex<Option<Running>>,
}

impl TaskQueue {
    pub fn new(workers: usize) -> Self {
        Self::with_buffer(workers, DEFAULT_TASK_BUFFER)
    }

    pub fn with_buffer(workers: usize, buffer: usize) -> Self {
        Self {
            workers: workers.max(1),
            buffer: buffer.max(1),
            state: Mutex::new(None),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Spawn the workers. Must be called inside a tokio runtime; a second
    /// call while running does nothing.
    pub fn start(&self) {
        let mut state = self.state.lock();
        if state.is_some() {
            return;
        }

        let (tx, rx) = mpsc::channel::<Task>(self.buffer);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let workers = (0..self.workers)
            .map(|id| tokio::spawn(worker(id, rx.clone())))
            .collect();

        *state = Some(Running { tx, workers });
        tracing::debug!(workers = self.workers, buffer = self.buffer, "Task queue started");
    }

    /// Close the buffer; workers finish what is queued and exit
    pub fn stop(&self) {
        if self.state.lock().take().is_some() {
            tracing::debug!("Task queue stopped");
        }
    }

    /// Stop and wait for every worker to drain
    pub async fn shutdown(&self) {
        let Some(running) = self.state.lock().take() else {
            return;
        };
        drop(running.tx);
        for handle in running.workers {
            if let Err(e) = handle.await {
                tracing::error!("Task worker failed: {}", e);
            }
        }
    }

    /// Queue `task` without waiting. Returns `false` when it was dropped
    /// because the queue is stopped or the buffer is full.
    pub fn add_task<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let tx = match self.state.lock().as_ref() {
            Some(running) => running.tx.clone(),
            None => {
                tracing::debug!("Task queue is not running, ignoring task");
                return false;
            }
        };

        match tx.try_send(Box::pin(task)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Task queue is full, dropping task");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn worker(id: usize, rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>) {
    loop {
        // Only the receive holds the lock, never the task itself
        let next = rx.lock().await.recv().await;
        let Some(task) = next else {
            break;
        };
        if let Err(payload) = AssertUnwindSafe(task).catch_unwind().await {
            tracing::error!(worker = id, "Task panicked: {}", panic_message(payload.as_ref()));
        }
    }
    tracing::trace!(worker = id, "Task worker exited");
}
