//! Per-session task executor
//!
//! One worker per session draining an MPSC FIFO. Tasks run strictly in
//! enqueue order with no overlap; a stopping executor aborts everything
//! still queued so synchronous waiters unblock with a failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::context::AppContext;
use crate::task::BoxedTask;

pub struct SessionExecutor {
    session_id: u32,
    tx: mpsc::UnboundedSender<BoxedTask>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<BoxedTask>>>,
    cancel: CancellationToken,
    running: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SessionExecutor {
    pub fn new(session_id: u32) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            session_id,
            tx,
            rx: Mutex::new(Some(rx)),
            cancel: CancellationToken::new(),
            running: AtomicBool::new(false),
            worker: Mutex::new(None),
        }
    }

    pub fn start(&self, ctx: Arc<AppContext>) {
        let Some(mut rx) = self.rx.lock().take() else {
            return;
        };
        self.running.store(true, Ordering::SeqCst);

        let session_id = self.session_id;
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            info!(session = session_id, "session executor started");
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    task = rx.recv() => {
                        let Some(mut task) = task else { break };
                        debug!(session = session_id, task = task.label(), "running task");
                        task.run(&ctx).await;
                    }
                }
            }
            // abort whatever is still queued so waiters unblock
            while let Ok(mut task) = rx.try_recv() {
                task.abort();
            }
            info!(session = session_id, "session executor stopped");
        });
        *self.worker.lock() = Some(handle);
    }

    /// Queue a task on the session. Fails (and aborts the task) once
    /// the executor has stopped.
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

    /// Request the worker to stop after the task currently running.
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.cancel.cancel();
    }

    /// Stop and wait for the worker to drain.
    pub async fn stop(&self) {
        self.request_stop();
        self.join().await;
    }

    /// Wait for the worker to finish without requesting a stop; used
    /// when a queued shutdown task is expected to stop the executor
    /// itself.
    pub async fn join(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
