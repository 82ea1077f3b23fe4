//! Ending a session
//!
//! If the session still has a connection the front end is asked to log
//! it off first (bounded wait); the session is then removed from the
//! store, which queues its shutdown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::context::AppContext;
use crate::protocol::SHUTDOWN_TIMEOUT_MS;
use crate::rpc::calls::out;
use crate::task::Task;

pub struct TaskEnd {
    session_id: u32,
    done: Option<oneshot::Sender<bool>>,
}

impl TaskEnd {
    pub fn new(session_id: u32) -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                session_id,
                done: Some(tx),
            },
            rx,
        )
    }
}

#[async_trait]
impl Task for TaskEnd {
    async fn run(&mut self, ctx: &Arc<AppContext>) {
        let success = end_session(ctx, self.session_id).await;
        if let Some(done) = self.done.take() {
            let _ = done.send(success);
        }
    }

    fn abort(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(false);
        }
    }

    fn label(&self) -> &'static str {
        "end-session"
    }
}

/// Log the connection off at the front end (when one is bound), then
/// drop the session.
pub async fn end_session(ctx: &Arc<AppContext>, session_id: u32) -> bool {
    let connection_id = ctx.connections.connection_id_for_session(session_id);
    if connection_id == 0 {
        debug!(
            session = session_id,
            "no connection bound, stopping session directly"
        );
        return stop_session(ctx, session_id);
    }

    match out::logoff_user_session(
        ctx,
        connection_id,
        Duration::from_millis(SHUTDOWN_TIMEOUT_MS),
    )
    .await
    {
        Ok(true) => debug!(session = session_id, "front end logged the connection off"),
        Ok(false) => warn!(
            session = session_id,
            "front end reported logoff failure, removing connection anyway"
        ),
        Err(failure) => warn!(
            session = session_id,
            code = failure.code,
            "logoff call failed, removing connection anyway"
        ),
    }

    let success = stop_session(ctx, session_id);
    ctx.connections.remove(connection_id);
    success
}

fn stop_session(ctx: &Arc<AppContext>, session_id: u32) -> bool {
    if ctx.sessions.get(session_id).is_none() {
        warn!(session = session_id, "session not found");
        return false;
    }
    ctx.sessions.remove(session_id);
    true
}
