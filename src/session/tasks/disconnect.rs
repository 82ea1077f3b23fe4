//! Disconnecting sessions
//!
//! Addressed either by connection id (front end dropped the client) or
//! by session id (administrative disconnect). A Connected session is an
//! abandoned greeter and is removed outright; Active/Shadow sessions go
//! through the session's disconnect path.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::debug;

use crate::context::AppContext;
use crate::session::state::ConnectState;
use crate::task::Task;

pub struct TaskDisconnect {
    connection_id: u32,
    session_id: u32,
    done: Option<oneshot::Sender<Option<bool>>>,
}

impl TaskDisconnect {
    /// Disconnect whatever session is bound to `connection_id`.
    pub fn for_connection(connection_id: u32) -> (Self, oneshot::Receiver<Option<bool>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                connection_id,
                session_id: 0,
                done: Some(tx),
            },
            rx,
        )
    }

    /// Disconnect a session directly.
    pub fn for_session(session_id: u32) -> (Self, oneshot::Receiver<Option<bool>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                connection_id: 0,
                session_id,
                done: Some(tx),
            },
            rx,
        )
    }
}

#[async_trait]
impl Task for TaskDisconnect {
    async fn run(&mut self, ctx: &Arc<AppContext>) {
        let result = if self.session_id != 0 {
            disconnect_session(ctx, self.session_id).await
        } else {
            disconnect_connection(ctx, self.connection_id).await
        };
        if let Some(done) = self.done.take() {
            let _ = done.send(result);
        }
    }

    fn abort(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(None);
        }
    }

    fn label(&self) -> &'static str {
        "disconnect"
    }
}

/// `None` when connection or session cannot be resolved, otherwise
/// whether a disconnect actually happened.
pub async fn disconnect_connection(ctx: &Arc<AppContext>, connection_id: u32) -> Option<bool> {
    let connection = ctx.connections.get(connection_id)?;
    let session_id = connection.session_id();
    if session_id == 0 {
        debug!(connection = connection_id, "connection has no session");
        return None;
    }
    let session = ctx.sessions.get(session_id)?;

    ctx.connections.remove(connection_id);
    finish_disconnect(ctx, session_id, &session).await
}

pub async fn disconnect_session(ctx: &Arc<AppContext>, session_id: u32) -> Option<bool> {
    let session = ctx.sessions.get(session_id)?;

    let connection_id = ctx.connections.connection_id_for_session(session_id);
    if connection_id != 0 {
        ctx.connections.remove(connection_id);
    }
    finish_disconnect(ctx, session_id, &session).await
}

async fn finish_disconnect(
    ctx: &Arc<AppContext>,
    session_id: u32,
    session: &Arc<crate::session::session::Session>,
) -> Option<bool> {
    match session.connect_state() {
        // a Connected session without a user is a greeter: remove it
        ConnectState::Connected => {
            ctx.sessions.remove(session_id);
            Some(true)
        }
        ConnectState::Active | ConnectState::Shadow => {
            debug!(session = session_id, "disconnecting session");
            session.disconnect(ctx).await;
            Some(true)
        }
        state => {
            debug!(session = session_id, %state, "session not in a disconnectable state");
            Some(false)
        }
    }
}
