//! Switching a connection onto this session
//!
//! Runs on the target session's executor. Any connection currently
//! bound to the target is disconnected first, then the front end is
//! told to re-attach the given connection to the target's backend.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::context::AppContext;
use crate::rpc::calls::out;
use crate::session::state::ConnectState;
use crate::session::tasks::disconnect::disconnect_connection;
use crate::task::Task;

pub struct TaskSwitchTo {
    connection_id: u32,
    session_id: u32,
    done: Option<oneshot::Sender<bool>>,
}

impl TaskSwitchTo {
    pub fn new(connection_id: u32, session_id: u32) -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                connection_id,
                session_id,
                done: Some(tx),
            },
            rx,
        )
    }

    async fn switch(&self, ctx: &Arc<AppContext>) -> bool {
        let Some(session) = ctx.sessions.get(self.session_id) else {
            debug!(session = self.session_id, "session not found");
            return false;
        };

        // detach whoever is currently on the target session
        let bound = ctx.connections.connection_id_for_session(self.session_id);
        if bound != 0 {
            disconnect_connection(ctx, bound).await;
        }

        let (ogon_cookie, backend_cookie) = session.cookies();
        let result = out::switch_to(
            ctx,
            self.connection_id,
            &session.pipe_name(),
            session.max_x_res() as u32,
            session.max_y_res() as u32,
            &ogon_cookie,
            &backend_cookie,
        )
        .await;

        match result {
            Ok(true) => {}
            Ok(false) => {
                error!(session = self.session_id, "front end failed to switch");
                session
                    .set_connect_state(ctx, ConnectState::Disconnected)
                    .await;
                return false;
            }
            Err(failure) => {
                error!(
                    session = self.session_id,
                    code = failure.code,
                    "switch-to call failed"
                );
                session
                    .set_connect_state(ctx, ConnectState::Disconnected)
                    .await;
                return false;
            }
        }

        if let Some(connection) = ctx.connections.get(self.connection_id) {
            connection.bind_session(self.session_id);
        }
        session.set_connect_state(ctx, ConnectState::Active).await;
        true
    }
}

#[async_trait]
impl Task for TaskSwitchTo {
    async fn run(&mut self, ctx: &Arc<AppContext>) {
        let success = self.switch(ctx).await;
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
        "switch-to"
    }
}
