//! Remote-control (shadowing) tasks
//!
//! Starting remote control runs on the shadowing session's executor.
//! When the target user has to be asked first, the question is sent
//! from a detached stage so the 30 s message wait never stalls the
//! executor; the task re-enqueues itself with the answer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::context::AppContext;
use crate::protocol::message::{IDTIMEOUT, IDYES, MB_YESNO, REQUEST_REMOTE_CONTROL};
use crate::protocol::OTSAPI_TIMEOUT_MS;
use crate::rpc::calls::out;
use crate::session::state::ConnectState;
use crate::task::Task;

const ASK_TIMEOUT_SECS: u32 = 30;

enum Stage {
    Initial,
    AfterAsk(u32),
}

pub struct TaskStartRemoteControl {
    session_id: u32,
    target_session_id: u32,
    hotkey_vk: u8,
    hotkey_modifiers: u16,
    flags: u32,
    stage: Stage,
    done: Option<oneshot::Sender<bool>>,
}

impl TaskStartRemoteControl {
    pub fn new(
        session_id: u32,
        target_session_id: u32,
        hotkey_vk: u8,
        hotkey_modifiers: u16,
        flags: u32,
    ) -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                session_id,
                target_session_id,
                hotkey_vk,
                hotkey_modifiers,
                flags,
                stage: Stage::Initial,
                done: Some(tx),
            },
            rx,
        )
    }

    fn finish(&mut self, success: bool) {
        if let Some(done) = self.done.take() {
            let _ = done.send(success);
        }
    }

    /// Ask the target user for consent from a detached stage, then
    /// re-enqueue with the answer.
    fn start_ask_stage(&mut self, ctx: &Arc<AppContext>) {
        let ctx = ctx.clone();
        let session_id = self.session_id;
        let target_session_id = self.target_session_id;
        let hotkey_vk = self.hotkey_vk;
        let hotkey_modifiers = self.hotkey_modifiers;
        let flags = self.flags;
        let done = self.done.take();

        tokio::spawn(async move {
            let asking_user = ctx
                .sessions
                .get(session_id)
                .map(|s| s.user_name())
                .unwrap_or_default();
            let target_connection = ctx
                .connections
                .connection_id_for_session(target_session_id);

            let answer = if target_connection == 0 {
                IDTIMEOUT
            } else {
                out::message(
                    &ctx,
                    target_connection,
                    REQUEST_REMOTE_CONTROL,
                    MB_YESNO,
                    ASK_TIMEOUT_SECS,
                    &[asking_user],
                    Duration::from_secs(u64::from(ASK_TIMEOUT_SECS) + 1),
                )
                .await
                .unwrap_or(IDTIMEOUT)
            };

            let Some(session) = ctx.sessions.get(session_id) else {
                if let Some(done) = done {
                    let _ = done.send(false);
                }
                return;
            };
            let followup = TaskStartRemoteControl {
                session_id,
                target_session_id,
                hotkey_vk,
                hotkey_modifiers,
                flags,
                stage: Stage::AfterAsk(answer),
                done,
            };
            session.add_task(Box::new(followup));
        });
    }

    async fn start(&mut self, ctx: &Arc<AppContext>) -> bool {
        let Some(session) = ctx.sessions.get(self.session_id) else {
            error!(session = self.session_id, "no session");
            return false;
        };
        let Some(target) = ctx.sessions.get(self.target_session_id) else {
            error!(session = self.target_session_id, "no target session");
            return false;
        };
        if session.connect_state() == ConnectState::Shadow {
            error!(session = self.session_id, "session is already shadowing");
            return false;
        }
        if target.connect_state() != ConnectState::Active {
            error!(
                session = self.target_session_id,
                "target session is not active"
            );
            return false;
        }
        let connection_id = ctx.connections.connection_id_for_session(self.session_id);
        let target_connection_id = ctx
            .connections
            .connection_id_for_session(self.target_session_id);
        if connection_id == 0 || target_connection_id == 0 {
            error!(
                session = self.session_id,
                target = self.target_session_id,
                "remote control needs both sessions connected"
            );
            return false;
        }

        let ask = ctx
            .property_bool(self.target_session_id, "session.remotecontrol.ask")
            .unwrap_or(false);

        match self.stage {
            Stage::Initial if ask => {
                debug!(
                    session = self.session_id,
                    target = self.target_session_id,
                    "asking target user for remote control consent"
                );
                self.start_ask_stage(ctx);
                return false; // completion travels with the follow-up
            }
            Stage::AfterAsk(answer) if ask && answer != IDYES => {
                info!(
                    session = self.session_id,
                    target = self.target_session_id,
                    "target user denied remote control"
                );
                return false;
            }
            _ => {}
        }

        let started = out::start_remote_control(
            ctx,
            connection_id,
            target_connection_id,
            self.hotkey_vk,
            self.hotkey_modifiers,
            self.flags,
            Duration::from_millis(OTSAPI_TIMEOUT_MS),
        )
        .await
        .unwrap_or(false);
        if !started {
            error!(
                session = self.session_id,
                target = self.target_session_id,
                "front end rejected remote control"
            );
            return false;
        }

        session.start_remote_control(ctx).await;
        target.add_shadowed_by(self.session_id);
        info!(
            session = self.session_id,
            target = self.target_session_id,
            "remote control started"
        );
        true
    }
}

#[async_trait]
impl Task for TaskStartRemoteControl {
    async fn run(&mut self, ctx: &Arc<AppContext>) {
        let success = self.start(ctx).await;
        // when the ask stage took over, `done` is already gone
        self.finish(success);
    }

    fn abort(&mut self) {
        self.finish(false);
    }

    fn label(&self) -> &'static str {
        "start-remote-control"
    }
}

pub struct TaskStopRemoteControl {
    session_id: u32,
    done: Option<oneshot::Sender<bool>>,
}

impl TaskStopRemoteControl {
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
impl Task for TaskStopRemoteControl {
    async fn run(&mut self, ctx: &Arc<AppContext>) {
        let success = stop_remote_control(ctx, self.session_id).await;
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
        "stop-remote-control"
    }
}

async fn stop_remote_control(ctx: &Arc<AppContext>, session_id: u32) -> bool {
    let Some(session) = ctx.sessions.get(session_id) else {
        return false;
    };
    let connection_id = ctx.connections.connection_id_for_session(session_id);
    if connection_id == 0 {
        return false;
    }

    let stopped = out::stop_remote_control(
        ctx,
        connection_id,
        Duration::from_millis(OTSAPI_TIMEOUT_MS),
    )
    .await
    .unwrap_or(false);

    if stopped {
        session.stop_remote_control(ctx).await;
        for other in ctx.sessions.all() {
            other.remove_shadowed_by(session_id);
        }
    }
    stopped
}
