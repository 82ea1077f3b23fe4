//! Process monitor
//!
//! Watches registered backend children. When a process flagged
//! terminate-session-on-exit dies while its module context is still the
//! session's current one, an end-task is queued on that session. A
//! context that was replaced in the meantime (re-auth swapped the
//! backend) produces no task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::context::AppContext;
use crate::protocol::PROCESS_MONITOR_INTERVAL_MS;
use crate::session::tasks::TaskEnd;

struct ProcessRecord {
    pid: u32,
    session_id: u32,
    terminate_session_on_exit: bool,
    context_id: u64,
    /// Present for children we spawned ourselves; polled through the
    /// handle so reaping does not race the runtime's own reaper.
    child: Option<Child>,
}

pub struct ProcessMonitor {
    records: Mutex<Vec<ProcessRecord>>,
    cancel: CancellationToken,
    running: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessMonitor {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            running: AtomicBool::new(false),
            worker: Mutex::new(None),
        }
    }

    /// Track a child we spawned. The monitor takes ownership of the
    /// handle.
    pub fn add_child(
        &self,
        child: Child,
        session_id: u32,
        terminate_session_on_exit: bool,
        context_id: u64,
    ) {
        let Some(pid) = child.id() else {
            warn!(session = session_id, "child already gone at registration");
            return;
        };
        self.records.lock().push(ProcessRecord {
            pid,
            session_id,
            terminate_session_on_exit,
            context_id,
            child: Some(child),
        });
    }

    /// Track a foreign pid (reported by a module, not spawned here).
    pub fn add_process(
        &self,
        pid: u32,
        session_id: u32,
        terminate_session_on_exit: bool,
        context_id: u64,
    ) {
        self.records.lock().push(ProcessRecord {
            pid,
            session_id,
            terminate_session_on_exit,
            context_id,
            child: None,
        });
    }

    pub fn remove_process(&self, pid: u32) -> bool {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|r| r.pid != pid);
        records.len() != before
    }

    pub fn watched_count(&self) -> usize {
        self.records.lock().len()
    }

    pub fn watched_pids(&self) -> Vec<u32> {
        self.records.lock().iter().map(|r| r.pid).collect()
    }

    pub fn start(&self, ctx: Arc<AppContext>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("process monitor already started");
            return;
        }
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            info!("process monitor started");
            let mut interval =
                tokio::time::interval(Duration::from_millis(PROCESS_MONITOR_INTERVAL_MS));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                ctx.monitor.sweep(&ctx);
            }
            info!("process monitor stopped");
        });
        *self.worker.lock() = Some(handle);
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// One poll pass. End-tasks are queued outside the record lock; at
    /// most one per session and pass.
    fn sweep(&self, ctx: &Arc<AppContext>) {
        let mut ended: HashMap<u32, u64> = HashMap::new();

        {
            let mut records = self.records.lock();
            records.retain_mut(|rec| {
                let exited = match rec.child.as_mut() {
                    Some(child) => match child.try_wait() {
                        Ok(Some(status)) => {
                            trace!(pid = rec.pid, ?status, "registered process exited");
                            true
                        }
                        Ok(None) => false,
                        Err(err) => {
                            warn!(pid = rec.pid, %err, "try_wait failed, dropping record");
                            true
                        }
                    },
                    None => match waitpid(Pid::from_raw(rec.pid as i32), Some(WaitPidFlag::WNOHANG))
                    {
                        Ok(WaitStatus::StillAlive) => false,
                        Ok(status) => {
                            trace!(pid = rec.pid, ?status, "registered process exited");
                            true
                        }
                        Err(Errno::ECHILD) => {
                            debug!(pid = rec.pid, "waitpid: ECHILD, dropping record");
                            true
                        }
                        Err(err) => {
                            warn!(pid = rec.pid, %err, "waitpid failed");
                            false
                        }
                    },
                };

                if exited && rec.terminate_session_on_exit {
                    ended.entry(rec.session_id).or_insert(rec.context_id);
                }
                !exited
            });
        }

        for (session_id, context_id) in ended {
            let Some(session) = ctx.sessions.get(session_id) else {
                debug!(session = session_id, "session gone, ignoring process exit");
                continue;
            };
            if !session.is_current_module(context_id) {
                trace!(session = session_id, "exit was for a previous module");
                continue;
            }
            info!(
                session = session_id,
                "backend process exited, ending session"
            );
            let (task, _done) = TaskEnd::new(session_id);
            session.add_task(Box::new(task));
        }
    }
}

impl Default for ProcessMonitor {
    fn default() -> Self {
        Self::new()
    }
}
