//! Session shutdown
//!
//! Runs as the last task on a session's executor: brings the state
//! machine to Down, releases everything the session owns and stops the
//! executor. Queued by the store on removal, so the task holds its own
//! session reference.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::AppContext;
use crate::session::session::Session;
use crate::session::state::ConnectState;
use crate::task::Task;

pub struct TaskShutdown {
    session: Arc<Session>,
}

impl TaskShutdown {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Task for TaskShutdown {
    async fn run(&mut self, ctx: &Arc<AppContext>) {
        if self.session.connect_state() != ConnectState::Down {
            self.session.set_connect_state(ctx, ConnectState::Down).await;
        }
        self.session.release(ctx).await;
        self.session.executor().request_stop();
    }

    fn label(&self) -> &'static str {
        "shutdown"
    }
}
