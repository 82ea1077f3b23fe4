//! Backend and authentication modules
//!
//! Backend modules own the display side of a session (greeter, X11,
//! …): the session manager starts one per session and talks to it over
//! the backend pipe whose name the module returns from `start`. Auth
//! modules verify credentials on behalf of the manager. Both kinds are
//! registered at startup; out-of-process execution goes through the
//! launcher wrapper.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::context::AppContext;

pub mod auth;
pub mod exec;
pub mod launcher;
pub mod manager;

pub use auth::{AuthModule, AuthOutcome, AuthStatus};
pub use manager::ModuleManager;

/// Environment handed to a backend process.
pub type EnvBlock = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("module returned no pipe name")]
    NoPipeName,

    #[error("module has no runtime state for context {0}")]
    UnknownContext(u64),

    #[error("missing configuration: {0}")]
    MissingConfig(String),

    #[error("failed to spawn backend process: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Resolved unix identity of the session user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserIdentity {
    pub uid: u32,
    pub gid: u32,
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Per-session instance data of a module. String fields are owned
/// copies taken at hand-off; the context id stands in for pointer
/// identity when the process monitor asks whether a context is still
/// current.
#[derive(Debug, Clone)]
pub struct ModuleContext {
    pub context_id: u64,
    pub session_id: u32,
    pub user_name: String,
    pub domain: String,
    pub user_token: Option<UserIdentity>,
    pub env: EnvBlock,
    pub base_config_path: String,
    pub remote_ip: Option<String>,
}

impl ModuleContext {
    pub fn new(session_id: u32) -> Self {
        Self {
            context_id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            session_id,
            user_name: String::new(),
            domain: String::new(),
            user_token: None,
            env: EnvBlock::new(),
            base_config_path: String::new(),
            remote_ip: None,
        }
    }
}

/// Entry points of a backend module.
///
/// `start` returns the name of the backend pipe the front end should
/// attach to; an error leaves the session without a current module.
/// `free_context` releases whatever runtime state the module keeps for
/// the context (child process handles and the like).
#[async_trait]
pub trait BackendModule: Send + Sync {
    fn name(&self) -> &str;

    /// One-time module setup, run at registration.
    fn init(&self) -> Result<(), ModuleError> {
        Ok(())
    }

    /// One-time module teardown, run at manager shutdown.
    fn destroy(&self) {}

    fn new_context(&self, session_id: u32) -> ModuleContext {
        ModuleContext::new(session_id)
    }

    async fn start(&self, ctx: &Arc<AppContext>, mctx: &ModuleContext)
        -> Result<String, ModuleError>;

    async fn stop(&self, ctx: &Arc<AppContext>, mctx: &ModuleContext) -> Result<(), ModuleError>;

    async fn connect(&self, _ctx: &Arc<AppContext>, _mctx: &ModuleContext) -> Result<(), ModuleError> {
        Ok(())
    }

    async fn disconnect(
        &self,
        _ctx: &Arc<AppContext>,
        _mctx: &ModuleContext,
    ) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Module-specific info string (reported as winstation name).
    fn custom_info(&self, _mctx: &ModuleContext) -> Option<String> {
        None
    }

    fn free_context(&self, _mctx: &ModuleContext) {}
}
