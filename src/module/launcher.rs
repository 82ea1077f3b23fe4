//! Out-of-process launcher wrapper
//!
//! Wraps a backend module so its process is started through the
//! privileged launcher helper instead of directly. The helper performs
//! the system-session bookkeeping (PAM session, utmp) that is outside
//! this crate, then execs the real backend with the environment we
//! prepared.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::context::AppContext;
use crate::module::{BackendModule, ModuleContext, ModuleError};
use crate::protocol::backend_pipe_name;

const DEFAULT_LAUNCHER: &str = "wrd-session-launcher";

pub struct LauncherModule {
    inner_name: String,
    children: Mutex<HashMap<u64, u32>>,
}

impl LauncherModule {
    pub fn new(inner_name: impl Into<String>) -> Self {
        Self {
            inner_name: inner_name.into(),
            children: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl BackendModule for LauncherModule {
    fn name(&self) -> &str {
        &self.inner_name
    }

    async fn start(
        &self,
        ctx: &Arc<AppContext>,
        mctx: &ModuleContext,
    ) -> Result<String, ModuleError> {
        let launcher = ctx
            .property_string(0, "launcher.path")
            .unwrap_or_else(|| DEFAULT_LAUNCHER.to_string());

        let mut cmd = tokio::process::Command::new(&launcher);
        cmd.arg("--module")
            .arg(&self.inner_name)
            .arg("--session-id")
            .arg(mctx.session_id.to_string())
            .arg("--config")
            .arg(&mctx.base_config_path);
        if !mctx.user_name.is_empty() {
            cmd.arg("--user").arg(&mctx.user_name);
        }
        cmd.env_clear();
        cmd.envs(mctx.env.iter());

        let child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| ModuleError::Spawn(std::io::Error::other("launcher exited at spawn")))?;

        info!(
            session = mctx.session_id,
            module = %self.inner_name,
            launcher = %launcher,
            pid,
            "backend started via launcher"
        );

        self.children.lock().insert(mctx.context_id, pid);
        ctx.monitor
            .add_child(child, mctx.session_id, true, mctx.context_id);

        Ok(backend_pipe_name(mctx.session_id, &self.inner_name))
    }

    async fn stop(&self, ctx: &Arc<AppContext>, mctx: &ModuleContext) -> Result<(), ModuleError> {
        let Some(pid) = self.children.lock().remove(&mctx.context_id) else {
            return Err(ModuleError::UnknownContext(mctx.context_id));
        };
        ctx.monitor.remove_process(pid);
        if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!(session = mctx.session_id, pid, %err, "failed to signal launcher");
        }
        Ok(())
    }

    fn custom_info(&self, mctx: &ModuleContext) -> Option<String> {
        Some(format!("{}-{}", self.inner_name, mctx.session_id))
    }

    fn free_context(&self, mctx: &ModuleContext) {
        self.children.lock().remove(&mctx.context_id);
    }
}
