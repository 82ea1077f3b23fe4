//! Process-wide task executor
//!
//! Same FIFO contract as a session executor, plus detached execution
//! for long-running tasks: those are spawned onto the runtime and
//! observe a shared cancellation token instead of blocking the queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::context::AppContext;
use crate::task::BoxedTask;

pub struct GlobalExecutor {
    tx: mpsc::UnboundedSender<BoxedTask>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<BoxedTask>>>,
    cancel: CancellationToken,
    /// Stop signal handed to every detached task.
    detached_cancel: CancellationToken,
    running: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    tracker: TaskTracker,
}

impl GlobalExecutor {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            cancel: CancellationToken::new(),
            detached_cancel: CancellationToken::new(),
            running: AtomicBool::new(false),
            worker: Mutex::new(None),
            tracker: TaskTracker::new(),
        }
    }

    /// Token detached tasks poll to learn the executor is stopping.
    pub fn stop_token(&self) -> CancellationToken {
        self.detached_cancel.clone()
    }

    pub fn start(&self, ctx: Arc<AppContext>) {
        let Some(mut rx) = self.rx.lock().take() else {
            warn!("global executor started twice");
            return;
        };
        self.running.store(true, Ordering::SeqCst);

        let cancel = self.cancel.clone();
        let detached_cancel = self.detached_cancel.clone();
        let tracker = self.tracker.clone();
        let handle = tokio::spawn(async move {
            info!("global executor started");
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    task = rx.recv() => {
                        let Some(mut task) = task else { break };
                        if task.detached() {
                            let ctx = ctx.clone();
                            let stop = detached_cancel.clone();
                            tracker.spawn(async move {
                                let stopped = tokio::select! {
                                    _ = stop.cancelled() => true,
                                    _ = task.run(&ctx) => false,
                                };
                                if stopped {
                                    task.abort();
                                }
                            });
                        } else {
                            debug!(task = task.label(), "running global task");
                            task.run(&ctx).await;
                        }
                    }
                }
            }
            // executor is going down: everything still queued is aborted
            while let Ok(mut task) = rx.try_recv() {
                task.abort();
            }
            info!("global executor stopped");
        });
        *self.worker.lock() = Some(handle);
    }

    /// Queue a task. Returns `false` (after aborting the task) once the
    /// executor has been stopped.
    pub fn add_task(&self, mut task: BoxedTask) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            task.abort();
            return false;
        }
        if let Err(rejected) = self.tx.send(task) {
            let mut task = rejected.0;
            task.abort();
            return false;
        }
        true
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.detached_cancel.cancel();
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Default for GlobalExecutor {
    fn default() -> Self {
        Self::new()
    }
}
