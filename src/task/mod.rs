//! Task model
//!
//! Units of work dispatched onto an executor: every session owns one
//! (strictly serialized), and a process-wide executor runs work not
//! tied to a single session. Callers that need the outcome hold a
//! [`tokio::sync::oneshot`] receiver handed out by the concrete task's
//! constructor; `abort` must resolve that receiver with a failure so
//! waiters never hang on a dead executor.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::AppContext;

pub mod executor;

pub use executor::GlobalExecutor;

/// A queued unit of work.
///
/// `run` executes on the owning executor; tasks may re-enqueue
/// follow-up work on the same executor from inside `run`. `abort` is
/// invoked instead of `run` when the executor is stopping (or has
/// stopped), and must signal any completion channel with a failure.
#[async_trait]
pub trait Task: Send {
    async fn run(&mut self, ctx: &Arc<AppContext>);

    fn abort(&mut self) {}

    /// Detached tasks are spawned off the global executor's loop so
    /// long-running work cannot starve queued tasks. They observe the
    /// executor's stop token cooperatively. Ignored by session
    /// executors.
    fn detached(&self) -> bool {
        false
    }

    /// Short name for log lines.
    fn label(&self) -> &'static str;
}

pub type BoxedTask = Box<dyn Task>;
