//! Application context
//!
//! One explicit struct owning every store and engine handle, passed as
//! `Arc` into components and tasks. Property lookups that need more
//! than the raw store (session scope, the synthetic connection scope)
//! live here.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::module::ModuleManager;
use crate::permission::PermissionStore;
use crate::process::ProcessMonitor;
use crate::properties::{PropertyStore, PropertyValue, CONNECTION_PREFIX};
use crate::protocol::{self, SHUTDOWN_TIMEOUT_MS};
use crate::rpc::calls::CallRegistry;
use crate::rpc::RpcCore;
use crate::session::notifier::SessionNotifier;
use crate::session::state::ConnectState;
use crate::session::tasks::{TaskDisconnect, TaskEnd};
use crate::session::{ConnectionStore, SessionStore};
use crate::task::GlobalExecutor;

pub struct AppContext {
    pub properties: PropertyStore,
    pub permissions: PermissionStore,
    pub sessions: SessionStore,
    pub connections: ConnectionStore,
    pub modules: ModuleManager,
    pub monitor: ProcessMonitor,
    pub rpc: Arc<RpcCore>,
    pub calls: CallRegistry,
    pub notifier: Box<dyn SessionNotifier>,
    pub global_executor: GlobalExecutor,
    scratch_dir: PathBuf,
    pipe_dir: PathBuf,
    shutting_down: AtomicBool,
}

impl AppContext {
    pub fn new(
        notifier: Box<dyn SessionNotifier>,
        scratch_dir: impl Into<PathBuf>,
        pipe_dir: impl Into<PathBuf>,
    ) -> Arc<Self> {
        let scratch_dir = scratch_dir.into();
        Arc::new(Self {
            properties: PropertyStore::new(),
            permissions: PermissionStore::new(&scratch_dir),
            sessions: SessionStore::new(),
            connections: ConnectionStore::new(),
            modules: ModuleManager::new(),
            monitor: ProcessMonitor::new(),
            rpc: Arc::new(RpcCore::new()),
            calls: CallRegistry::standard(),
            notifier,
            global_executor: GlobalExecutor::new(),
            scratch_dir,
            pipe_dir: pipe_dir.into(),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Context with default system paths.
    pub fn with_defaults(notifier: Box<dyn SessionNotifier>) -> Arc<Self> {
        Self::new(
            notifier,
            protocol::DEFAULT_SCRATCH_DIR,
            protocol::DEFAULT_PIPE_DIR,
        )
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Unix socket path behind a Windows-style pipe name.
    pub fn pipe_path(&self, pipe_name: &str) -> PathBuf {
        protocol::pipe_path(&self.pipe_dir, pipe_name)
    }

    pub fn token_file_path(&self, session_id: u32) -> PathBuf {
        protocol::token_file_path(&self.scratch_dir, session_id)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    // -- property resolution -------------------------------------------

    /// Layered lookup in the scope of a session: the synthetic
    /// `CURRENT.CONNECTION.` paths resolve against the bound
    /// connection, everything else through the user override of the
    /// session's user, then the global map. Session id 0 is the global
    /// scope.
    pub fn property(&self, session_id: u32, path: &str) -> Option<PropertyValue> {
        let upper = path.to_uppercase();
        if session_id != 0 {
            if let Some(rest) = upper.strip_prefix(CONNECTION_PREFIX) {
                let connection = self.connections.connection_for_session(session_id)?;
                return connection.connection_property(rest);
            }
            let user = self.sessions.get(session_id)?.user_name();
            let user = (!user.is_empty()).then_some(user);
            return self.properties.lookup(user.as_deref(), &upper);
        }
        self.properties.lookup(None, &upper)
    }

    pub fn property_bool(&self, session_id: u32, path: &str) -> Option<bool> {
        self.property(session_id, path).and_then(|v| v.as_bool())
    }

    pub fn property_number(&self, session_id: u32, path: &str) -> Option<i64> {
        self.property(session_id, path).and_then(|v| v.as_number())
    }

    pub fn property_string(&self, session_id: u32, path: &str) -> Option<String> {
        self.property(session_id, path)
            .and_then(|v| v.as_text().map(str::to_string))
    }

    // -- transport reset -----------------------------------------------

    /// The front end went away: wipe all connections and reap
    /// abandoned greeter sessions (Connected without a logged-in
    /// user).
    pub fn rpc_disconnected(self: &Arc<Self>) {
        info!("front end connection reset");
        self.connections.reset();
        for session in self.sessions.all() {
            if session.connect_state() == ConnectState::Connected
                && session.user_name().is_empty()
            {
                let (task, _done) = TaskDisconnect::for_session(session.id());
                session.add_task(Box::new(task));
            }
        }
    }

    // -- shutdown ------------------------------------------------------

    /// End every session, each wait bounded by the shutdown timeout.
    pub async fn shutdown_all_sessions(self: &Arc<Self>) {
        self.begin_shutdown();
        for session in self.sessions.all() {
            let (task, done) = TaskEnd::new(session.id());
            if !session.add_task(Box::new(task)) {
                continue;
            }
            match tokio::time::timeout(Duration::from_millis(SHUTDOWN_TIMEOUT_MS), done).await {
                Ok(Ok(true)) => {}
                _ => warn!(session = session.id(), "session did not end in time"),
            }
            // the queued shutdown task stops the executor; force it
            // only when that does not happen in time
            let drained = tokio::time::timeout(
                Duration::from_millis(SHUTDOWN_TIMEOUT_MS),
                session.executor().join(),
            )
            .await;
            if drained.is_err() {
                session.executor().stop().await;
            }
        }
    }
}
