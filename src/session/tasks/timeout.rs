//! Disconnect-timeout reaper
//!
//! Posted to the global executor when a session goes Disconnected with
//! a nonzero `session.timeout`. Runs detached; if the session is still
//! in the same disconnected episode when the timer fires, it is ended.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tracing::info;

use crate::context::AppContext;
use crate::session::state::ConnectState;
use crate::session::tasks::end::end_session;
use crate::task::Task;

pub struct TaskSessionTimeout {
    session_id: u32,
    disconnected_at: SystemTime,
    timeout_secs: u64,
}

impl TaskSessionTimeout {
    pub fn new(session_id: u32, disconnected_at: SystemTime, timeout_secs: u64) -> Self {
        Self {
            session_id,
            disconnected_at,
            timeout_secs,
        }
    }
}

#[async_trait]
impl Task for TaskSessionTimeout {
    async fn run(&mut self, ctx: &Arc<AppContext>) {
        tokio::time::sleep(Duration::from_secs(self.timeout_secs)).await;

        let Some(session) = ctx.sessions.get(self.session_id) else {
            return;
        };
        // a reconnect in the meantime starts a new episode
        if session.connect_state() != ConnectState::Disconnected
            || session.disconnect_time() != Some(self.disconnected_at)
        {
            return;
        }
        info!(
            session = self.session_id,
            timeout = self.timeout_secs,
            "disconnect timeout expired, ending session"
        );
        end_session(ctx, self.session_id).await;
    }

    fn detached(&self) -> bool {
        true
    }

    fn label(&self) -> &'static str {
        "session-timeout"
    }
}
