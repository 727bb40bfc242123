//! Single-worker FIFO task queue
//!
//! Long-running operations are queued here and executed strictly one at a
//! time, in submission order, by a single worker task. The owner decides
//! what happens to a failed task by installing an error handler; without
//! one, a failure stops the worker.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::error::LinkError;

type TaskFuture = Pin<Box<dyn Future<Output = Result<(), LinkError>> + Send>>;

/// Called with every task failure; aborts land here too
pub type ErrorHandler = Arc<dyn Fn(&LinkError) + Send + Sync>;

pub struct TaskQueue {
    tx: mpsc::UnboundedSender<TaskFuture>,
    pending: watch::Sender<usize>,
    pending_rx: watch::Receiver<usize>,
    stop: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TaskQueue {
    /// Queue whose worker stops on the first unhandled task failure
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Queue that routes task failures to `handler` and keeps running
    pub fn with_error_handler(handler: ErrorHandler) -> Self {
        Self::build(Some(handler))
    }

    fn build(handler: Option<ErrorHandler>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<TaskFuture>();
        let (pending, pending_rx) = watch::channel(0usize);
        let (stop, mut stop_rx) = watch::channel(false);

        let pending_worker = pending.clone();
        let worker = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                    task = rx.recv() => {
                        let Some(task) = task else { break };
                        let result = task.await;
                        pending_worker.send_modify(|n| *n = n.saturating_sub(1));
                        if let Err(err) = result {
                            match &handler {
                                Some(handler) => handler(&err),
                                None => {
                                    error!("task failed with no error handler installed: {err}");
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        });

        Self {
            tx,
            pending,
            pending_rx,
            stop,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueue a task; it runs after everything queued before it
    pub fn add<F>(&self, task: F)
    where
        F: Future<Output = Result<(), LinkError>> + Send + 'static,
    {
        self.pending.send_modify(|n| *n += 1);
        if self.tx.send(Box::pin(task)).is_err() {
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
            warn!("task dropped: queue worker is stopped");
        }
    }

    /// No task queued and none running
    pub fn is_idle(&self) -> bool {
        *self.pending_rx.borrow() == 0
    }

    /// Wait until the queue drains, without stopping the worker
    pub async fn join(&self) {
        let mut rx = self.pending_rx.clone();
        // wait_for checks the current value first, so no wakeup is missed
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Discard queued tasks and stop the worker after the current one
    pub async fn stop(&self) {
        let _ = self.stop.send(true);
        if let Some(worker) = self.worker.lock().await.take() {
            let _ = worker.await;
        }
        self.pending.send_modify(|n| *n = 0);
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
