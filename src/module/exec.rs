//! Exec-backed backend modules
//!
//! The common case on Linux: the backend (greeter, X11 server, …) is
//! an external program. `ExecModule` spawns the command configured
//! under the session's module config, hands it the prepared environment
//! block, registers the child with the process monitor
//! (terminate-session-on-exit) and reports the per-session backend
//! pipe name the program is expected to listen on.
//!
//! `NullModule` is the in-process stand-in used by development setups
//! and the test suite: same lifecycle, no child process.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::context::AppContext;
use crate::module::{BackendModule, ModuleContext, ModuleError};
use crate::protocol::backend_pipe_name;

/// Backend module that runs an external command per session.
pub struct ExecModule {
    name: String,
    /// context id -> child pid
    children: Mutex<HashMap<u64, u32>>,
}

impl ExecModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl BackendModule for ExecModule {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(
        &self,
        ctx: &Arc<AppContext>,
        mctx: &ModuleContext,
    ) -> Result<String, ModuleError> {
        let command_key = format!("{}.command", mctx.base_config_path);
        let command = ctx
            .property_string(mctx.session_id, &command_key)
            .ok_or(ModuleError::MissingConfig(command_key))?;

        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| ModuleError::MissingConfig("empty module command".into()))?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(parts);
        cmd.env_clear();
        cmd.envs(mctx.env.iter());
        if let Some(token) = mctx.user_token {
            cmd.uid(token.uid);
            cmd.gid(token.gid);
        }

        let child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| ModuleError::Spawn(std::io::Error::other("child exited at spawn")))?;

        info!(
            session = mctx.session_id,
            module = %self.name,
            pid,
            "backend process started"
        );

        self.children.lock().insert(mctx.context_id, pid);
        ctx.monitor
            .add_child(child, mctx.session_id, true, mctx.context_id);

        Ok(backend_pipe_name(mctx.session_id, &self.name))
    }

    async fn stop(&self, ctx: &Arc<AppContext>, mctx: &ModuleContext) -> Result<(), ModuleError> {
        let Some(pid) = self.children.lock().remove(&mctx.context_id) else {
            return Err(ModuleError::UnknownContext(mctx.context_id));
        };
        ctx.monitor.remove_process(pid);
        if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!(session = mctx.session_id, pid, %err, "failed to signal backend");
        }
        Ok(())
    }

    fn custom_info(&self, mctx: &ModuleContext) -> Option<String> {
        Some(format!("{}-{}", self.name, mctx.session_id))
    }

    fn free_context(&self, mctx: &ModuleContext) {
        self.children.lock().remove(&mctx.context_id);
    }
}

/// In-process backend used for development and tests.
pub struct NullModule {
    name: String,
    started: Mutex<HashMap<u64, bool>>,
}

impl NullModule {
    pub fn new() -> Self {
        Self {
            name: "null".to_string(),
            started: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for NullModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendModule for NullModule {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(
        &self,
        _ctx: &Arc<AppContext>,
        mctx: &ModuleContext,
    ) -> Result<String, ModuleError> {
        debug!(session = mctx.session_id, "null backend started");
        self.started.lock().insert(mctx.context_id, true);
        Ok(backend_pipe_name(mctx.session_id, &self.name))
    }

    async fn stop(&self, _ctx: &Arc<AppContext>, mctx: &ModuleContext) -> Result<(), ModuleError> {
        self.started.lock().remove(&mctx.context_id);
        Ok(())
    }

    fn custom_info(&self, mctx: &ModuleContext) -> Option<String> {
        Some(format!("null-{}", mctx.session_id))
    }

    fn free_context(&self, mctx: &ModuleContext) {
        self.started.lock().remove(&mctx.context_id);
    }
}
