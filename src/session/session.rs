//! The session entity
//!
//! Identity, environment, module binding, connect-state machine and the
//! private executor. Two locks guard a session: `inner` for identity
//! and module binding, `state` for the connect state and its
//! timestamps. Neither is held across module calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use thiserror::Error;
use uzers::os::unix::UserExt;
use tracing::{debug, error, info, trace, warn};

use crate::context::AppContext;
use crate::module::{BackendModule, EnvBlock, ModuleContext, ModuleError, UserIdentity};
use crate::permission::{
    check_permission, PERM_FLAGS_FULL, PERM_FLAGS_GUEST, PERM_FLAGS_USER,
};
use crate::protocol::DEFAULT_PATH;
use crate::session::executor::SessionExecutor;
use crate::session::state::{ConnectState, NotificationReason};
use crate::task::BoxedTask;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session has no user name")]
    NoUserName,

    #[error("user lookup failed for {0}")]
    UserLookup(String),

    #[error("module already started")]
    AlreadyStarted,

    #[error("no module started")]
    NotStarted,

    #[error("no backend module registered under {0}")]
    ModuleNotFound(String),

    #[error("missing configuration: {0}")]
    MissingConfig(String),

    #[error(transparent)]
    Module(#[from] ModuleError),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Login token of the session user. `close` is idempotent; a closed
/// token yields no identity.
#[derive(Debug)]
pub struct UserToken {
    identity: UserIdentity,
    closed: AtomicBool,
}

impl UserToken {
    pub fn new(identity: UserIdentity) -> Self {
        Self {
            identity,
            closed: AtomicBool::new(false),
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn identity(&self) -> Option<UserIdentity> {
        if self.closed.load(Ordering::SeqCst) {
            None
        } else {
            Some(self.identity)
        }
    }
}

type ModuleBinding = (Arc<dyn BackendModule>, Arc<ModuleContext>);

struct SessionInner {
    user_name: String,
    domain: String,
    auth_user_name: String,
    auth_domain: String,
    client_host_name: String,
    module_config_name: String,
    module_name: String,
    pipe_name: String,
    win_station_name: String,
    session_started: bool,
    permissions: u32,
    max_x_res: i64,
    max_y_res: i64,
    user_token: Option<UserToken>,
    env: EnvBlock,
    auth_token: String,
    current_module: Option<ModuleBinding>,
    auth_module: Option<(ModuleBinding, String)>,
    shadowed_by: Vec<u32>,
    allowed_channels: Option<Vec<String>>,
}

struct StateInner {
    state: ConnectState,
    state_change_time: SystemTime,
    connect_time: Option<SystemTime>,
    disconnect_time: Option<SystemTime>,
    logon_time: Option<SystemTime>,
}

pub struct Session {
    id: u32,
    ogon_cookie: String,
    backend_cookie: String,
    executor: SessionExecutor,
    sbp_compatible: AtomicBool,
    inner: Mutex<SessionInner>,
    state: Mutex<StateInner>,
}

impl Session {
    /// Construct an unstarted session. Cookies come from the CSPRNG of
    /// the permission store; [`Session::init`] registers the token and
    /// starts the executor.
    pub fn new(id: u32, ogon_cookie: String, backend_cookie: String) -> Self {
        Self {
            id,
            ogon_cookie,
            backend_cookie,
            executor: SessionExecutor::new(id),
            sbp_compatible: AtomicBool::new(false),
            inner: Mutex::new(SessionInner {
                user_name: String::new(),
                domain: String::new(),
                auth_user_name: String::new(),
                auth_domain: String::new(),
                client_host_name: String::new(),
                module_config_name: String::new(),
                module_name: String::new(),
                pipe_name: String::new(),
                win_station_name: String::new(),
                session_started: false,
                permissions: 0,
                max_x_res: 0,
                max_y_res: 0,
                user_token: None,
                env: EnvBlock::new(),
                auth_token: String::new(),
                current_module: None,
                auth_module: None,
                shadowed_by: Vec::new(),
                allowed_channels: None,
            }),
            state: Mutex::new(StateInner {
                state: ConnectState::Init,
                state_change_time: SystemTime::now(),
                connect_time: None,
                disconnect_time: None,
                logon_time: None,
            }),
        }
    }

    /// Register the auth token, persist the token file and start the
    /// executor.
    pub fn init(&self, ctx: &Arc<AppContext>) {
        let token = ctx.permissions.register_session(self.id);
        self.inner.lock().auth_token = token;
        self.apply_auth_token(ctx);
        self.executor.start(ctx.clone());
    }

    // -- identity ------------------------------------------------------

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn cookies(&self) -> (String, String) {
        (self.ogon_cookie.clone(), self.backend_cookie.clone())
    }

    pub fn user_name(&self) -> String {
        self.inner.lock().user_name.clone()
    }

    pub fn set_user_name(&self, user_name: &str) {
        self.inner.lock().user_name = user_name.to_string();
    }

    pub fn domain(&self) -> String {
        self.inner.lock().domain.clone()
    }

    pub fn set_domain(&self, domain: &str) {
        self.inner.lock().domain = domain.to_string();
    }

    pub fn auth_user_name(&self) -> String {
        self.inner.lock().auth_user_name.clone()
    }

    pub fn set_auth_user_name(&self, user_name: &str) {
        self.inner.lock().auth_user_name = user_name.to_string();
    }

    pub fn auth_domain(&self) -> String {
        self.inner.lock().auth_domain.clone()
    }

    pub fn set_auth_domain(&self, domain: &str) {
        self.inner.lock().auth_domain = domain.to_string();
    }

    pub fn client_host_name(&self) -> String {
        self.inner.lock().client_host_name.clone()
    }

    pub fn set_client_host_name(&self, host: &str) {
        self.inner.lock().client_host_name = host.to_string();
    }

    pub fn module_config_name(&self) -> String {
        self.inner.lock().module_config_name.clone()
    }

    pub fn set_module_config_name(&self, name: &str) {
        self.inner.lock().module_config_name = name.to_string();
    }

    pub fn pipe_name(&self) -> String {
        self.inner.lock().pipe_name.clone()
    }

    pub fn win_station_name(&self) -> String {
        self.inner.lock().win_station_name.clone()
    }

    pub fn max_x_res(&self) -> i64 {
        self.inner.lock().max_x_res
    }

    pub fn max_y_res(&self) -> i64 {
        self.inner.lock().max_y_res
    }

    pub fn auth_token(&self) -> String {
        self.inner.lock().auth_token.clone()
    }

    pub fn user_identity(&self) -> Option<UserIdentity> {
        self.inner
            .lock()
            .user_token
            .as_ref()
            .and_then(UserToken::identity)
    }

    // -- SBP -----------------------------------------------------------

    pub fn is_sbp_compatible(&self) -> bool {
        self.sbp_compatible.load(Ordering::SeqCst)
    }

    pub fn set_sbp_compatible(&self, compatible: bool) {
        self.sbp_compatible.store(compatible, Ordering::SeqCst);
    }

    // -- permissions ---------------------------------------------------

    pub fn permissions(&self) -> u32 {
        self.inner.lock().permissions
    }

    pub fn check_permission(&self, requested: u32) -> bool {
        check_permission(self.permissions(), requested)
    }

    /// Resolve `permission.level` (FULL/USER/GUEST, default GUEST).
    pub fn init_permissions(&self, ctx: &Arc<AppContext>) {
        let mask = match ctx
            .property_string(self.id, "permission.level")
            .as_deref()
            .map(str::to_ascii_uppercase)
            .as_deref()
        {
            Some("FULL") => PERM_FLAGS_FULL,
            Some("USER") => PERM_FLAGS_USER,
            _ => PERM_FLAGS_GUEST,
        };
        self.inner.lock().permissions = mask;
    }

    // -- executor ------------------------------------------------------

    pub fn add_task(&self, task: BoxedTask) -> bool {
        self.executor.add_task(task)
    }

    pub fn executor(&self) -> &SessionExecutor {
        &self.executor
    }

    /// Queue the shutdown task that releases everything this session
    /// owns and stops the executor.
    pub fn shutdown(self: &Arc<Self>) {
        let task = crate::session::tasks::TaskShutdown::new(self.clone());
        self.add_task(Box::new(task));
    }

    // -- state machine -------------------------------------------------

    pub fn connect_state(&self) -> ConnectState {
        self.state.lock().state
    }

    pub fn state_change_time(&self) -> SystemTime {
        self.state.lock().state_change_time
    }

    pub fn connect_time(&self) -> Option<SystemTime> {
        self.state.lock().connect_time
    }

    pub fn disconnect_time(&self) -> Option<SystemTime> {
        self.state.lock().disconnect_time
    }

    pub fn logon_time(&self) -> Option<SystemTime> {
        self.state.lock().logon_time
    }

    /// Claim a Disconnected session for reconnection. Pure state flip,
    /// no side-effects on this edge.
    pub fn try_mark_connect_query(&self) -> bool {
        let mut st = self.state.lock();
        if st.state != ConnectState::Disconnected {
            return false;
        }
        st.state = ConnectState::ConnectQuery;
        st.state_change_time = SystemTime::now();
        true
    }

    /// Drive the state machine. Unexpected transitions are logged, not
    /// rejected; side-effects only fire on the reachable edges.
    pub async fn set_connect_state(&self, ctx: &Arc<AppContext>, target: ConnectState) {
        enum ModuleAction {
            None,
            Connect,
            Disconnect,
        }

        let mut action = ModuleAction::None;
        let mut notification = None;

        {
            let mut st = self.state.lock();
            let previous = st.state;
            if previous == target {
                return;
            }
            let now = SystemTime::now();
            st.state_change_time = now;

            match target {
                ConnectState::Connected => {
                    if previous != ConnectState::Init {
                        warn!(
                            session = self.id,
                            from = %previous,
                            "unexpected transition to Connected"
                        );
                    }
                    st.state = target;
                    st.connect_time = Some(now);
                    notification = Some(NotificationReason::RemoteConnect);
                    action = ModuleAction::Connect;
                }
                ConnectState::Active => {
                    if !matches!(
                        previous,
                        ConnectState::Connected
                            | ConnectState::Disconnected
                            | ConnectState::ConnectQuery
                            | ConnectState::Shadow
                    ) {
                        warn!(
                            session = self.id,
                            from = %previous,
                            "unexpected transition to Active"
                        );
                    }
                    st.state = target;
                    if st.logon_time.is_none() {
                        st.logon_time = Some(now);
                    }
                    match previous {
                        ConnectState::Connected => {
                            notification = Some(NotificationReason::SessionLogon);
                        }
                        ConnectState::Disconnected | ConnectState::ConnectQuery => {
                            notification = Some(NotificationReason::RemoteConnect);
                            st.connect_time = Some(now);
                            action = ModuleAction::Connect;
                        }
                        ConnectState::Shadow => {
                            notification = Some(NotificationReason::SessionRemoteControl);
                        }
                        _ => {}
                    }
                }
                ConnectState::Disconnected => {
                    if previous != ConnectState::Active {
                        warn!(
                            session = self.id,
                            from = %previous,
                            "unexpected transition to Disconnected"
                        );
                    }
                    st.state = target;
                    st.disconnect_time = Some(now);
                    notification = Some(NotificationReason::RemoteDisconnect);
                    action = ModuleAction::Disconnect;
                }
                ConnectState::Down => {
                    if !matches!(
                        previous,
                        ConnectState::Disconnected | ConnectState::Connected
                    ) {
                        warn!(
                            session = self.id,
                            from = %previous,
                            "unexpected transition to Down"
                        );
                    }
                    notification = Some(if previous == ConnectState::Connected {
                        NotificationReason::RemoteDisconnect
                    } else {
                        NotificationReason::SessionLogoff
                    });
                    st.state = target;
                }
                ConnectState::ConnectQuery => {
                    st.state = target;
                }
                ConnectState::Shadow => {
                    if previous != ConnectState::Active {
                        warn!(
                            session = self.id,
                            from = %previous,
                            "unexpected transition to Shadow"
                        );
                    }
                    notification = Some(NotificationReason::SessionRemoteControl);
                    st.state = target;
                }
                ConnectState::Init
                | ConnectState::Idle
                | ConnectState::Listen
                | ConnectState::Reset => {
                    error!(session = self.id, target = %target, "invalid target state");
                    return;
                }
            }
            debug!(session = self.id, from = %previous, to = %target, "state transition");
        }

        if let Some(reason) = notification {
            ctx.notifier.notify(reason, self.id);
        }
        match action {
            ModuleAction::Connect => {
                if let Err(err) = self.connect_module(ctx).await {
                    warn!(session = self.id, %err, "module connect failed");
                }
            }
            ModuleAction::Disconnect => {
                if let Err(err) = self.disconnect_module(ctx).await {
                    warn!(session = self.id, %err, "module disconnect failed");
                }
            }
            ModuleAction::None => {}
        }
    }

    /// Disconnect path shared by the disconnect tasks: Shadow resolves
    /// back to Active first, then the session goes Disconnected. With
    /// `session.timeout` 0 (or reconnect disabled) the session ends
    /// immediately; otherwise a timeout reaper is scheduled.
    pub async fn disconnect(self: &Arc<Self>, ctx: &Arc<AppContext>) {
        if self.connect_state() == ConnectState::Shadow {
            self.set_connect_state(ctx, ConnectState::Active).await;
        }
        self.set_connect_state(ctx, ConnectState::Disconnected).await;

        let user = self.user_name();
        let user = (!user.is_empty()).then_some(user);
        let timeout = ctx
            .properties
            .get_number(user.as_deref(), "session.timeout")
            .unwrap_or(0);
        let reconnect = ctx
            .properties
            .get_bool(user.as_deref(), "session.reconnect")
            .unwrap_or(true);

        if timeout == 0 || !reconnect {
            crate::session::tasks::end_session(ctx, self.id).await;
            self.set_connect_state(ctx, ConnectState::Down).await;
        } else if let Some(since) = self.disconnect_time() {
            let task =
                crate::session::tasks::TaskSessionTimeout::new(self.id, since, timeout as u64);
            ctx.global_executor.add_task(Box::new(task));
        }
    }

    // -- shadowing -----------------------------------------------------

    pub async fn start_remote_control(&self, ctx: &Arc<AppContext>) -> bool {
        if self.connect_state() != ConnectState::Active {
            return false;
        }
        self.set_connect_state(ctx, ConnectState::Shadow).await;
        true
    }

    pub async fn stop_remote_control(&self, ctx: &Arc<AppContext>) -> bool {
        if self.connect_state() != ConnectState::Shadow {
            return false;
        }
        self.set_connect_state(ctx, ConnectState::Active).await;
        true
    }

    pub fn shadowed_by(&self) -> Vec<u32> {
        self.inner.lock().shadowed_by.clone()
    }

    pub fn add_shadowed_by(&self, session_id: u32) {
        self.inner.lock().shadowed_by.push(session_id);
    }

    pub fn remove_shadowed_by(&self, session_id: u32) {
        self.inner.lock().shadowed_by.retain(|id| *id != session_id);
    }

    pub fn clear_shadowed_by(&self) {
        self.inner.lock().shadowed_by.clear();
    }

    // -- virtual channels ----------------------------------------------

    /// Check the per-session channel whitelist
    /// (`virtualChannel.whiteList`, semicolon list, `*` wildcard; an
    /// absent property allows everything).
    pub fn is_virtual_channel_allowed(&self, ctx: &Arc<AppContext>, channel: &str) -> bool {
        {
            let inner = self.inner.lock();
            if let Some(channels) = &inner.allowed_channels {
                return Self::channel_allowed(channels, channel);
            }
        }
        let parsed = self.parse_allowed_channels(ctx);
        let allowed = Self::channel_allowed(&parsed, channel);
        self.inner.lock().allowed_channels = Some(parsed);
        allowed
    }

    fn channel_allowed(channels: &[String], channel: &str) -> bool {
        channels
            .iter()
            .any(|c| c == "*" || c.eq_ignore_ascii_case(channel))
    }

    fn parse_allowed_channels(&self, ctx: &Arc<AppContext>) -> Vec<String> {
        let Some(value) = ctx.property_string(self.id, "virtualChannel.whiteList") else {
            return vec!["*".to_string()];
        };
        let mut channels = Vec::new();
        for entry in value.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            if entry == "*" {
                return vec!["*".to_string()];
            }
            channels.push(entry.to_string());
        }
        channels
    }

    // -- user token ----------------------------------------------------

    /// Resolve the session user's unix identity; replaces (and closes)
    /// any previous token.
    pub async fn generate_user_token(&self) -> Result<(), SessionError> {
        let user_name = self.user_name();
        if user_name.is_empty() {
            return Err(SessionError::NoUserName);
        }

        let lookup_name = user_name.clone();
        let identity = tokio::task::spawn_blocking(move || {
            uzers::get_user_by_name(&lookup_name).map(|u| UserIdentity {
                uid: u.uid(),
                gid: u.primary_group_id(),
            })
        })
        .await
        .ok()
        .flatten()
        .ok_or(SessionError::UserLookup(user_name))?;

        let mut inner = self.inner.lock();
        if let Some(previous) = inner.user_token.take() {
            previous.close();
        }
        inner.user_token = Some(UserToken::new(identity));
        Ok(())
    }

    // -- environment ---------------------------------------------------

    /// Base environment after `environment.filter` / `environment.add`.
    fn filtered_environment(&self, ctx: &Arc<AppContext>) -> EnvBlock {
        let mut env = EnvBlock::new();

        let filter = ctx
            .property_string(self.id, "environment.filter")
            .unwrap_or_default();
        let filter = filter.trim();
        if filter == "*" {
            for (name, value) in std::env::vars() {
                env.insert(name, value);
            }
        } else if !filter.is_empty() {
            for name in filter.split(';').map(str::trim).filter(|s| !s.is_empty()) {
                if let Ok(value) = std::env::var(name) {
                    env.insert(name.to_string(), value);
                }
            }
        }

        if let Some(additions) = ctx.property_string(self.id, "environment.add") {
            for entry in additions.split(';').map(str::trim).filter(|s| !s.is_empty()) {
                match entry.split_once(':') {
                    Some((name, value)) => {
                        env.insert(name.to_string(), value.to_string());
                    }
                    None => debug!(
                        session = self.id,
                        entry, "environment.add entries use NAME:VALUE"
                    ),
                }
            }
        }

        if !env.contains_key("PATH") {
            env.insert("PATH".to_string(), DEFAULT_PATH.to_string());
        }
        env
    }

    fn apply_max_resolutions(&self, ctx: &Arc<AppContext>, scope_session: u32, env: &mut EnvBlock) {
        let max_x = ctx
            .property_number(scope_session, "session.maxXRes")
            .unwrap_or(0);
        let max_y = ctx
            .property_number(scope_session, "session.maxYRes")
            .unwrap_or(0);
        {
            let mut inner = self.inner.lock();
            inner.max_x_res = max_x;
            inner.max_y_res = max_y;
        }
        if max_x != 0 && max_y != 0 {
            env.insert("OGON_SMAX".to_string(), format!("{}x{}", max_x, max_y));
        } else {
            trace!(session = self.id, "no resolution maximum configured");
        }
    }

    /// Build the environment block for a logged-in user session.
    pub async fn generate_env_block(
        &self,
        ctx: &Arc<AppContext>,
        client_name: &str,
        client_address: &str,
    ) -> Result<(), SessionError> {
        let user_name = self.user_name();
        if user_name.is_empty() {
            return Err(SessionError::NoUserName);
        }

        let mut env = self.filtered_environment(ctx);

        let lookup_name = user_name.clone();
        let account = tokio::task::spawn_blocking(move || {
            uzers::get_user_by_name(&lookup_name).map(|u| {
                (
                    u.uid(),
                    u.home_dir().to_string_lossy().into_owned(),
                    u.shell().to_string_lossy().into_owned(),
                    u.name().to_string_lossy().into_owned(),
                )
            })
        })
        .await
        .ok()
        .flatten()
        .ok_or(SessionError::UserLookup(user_name))?;

        let (uid, home, shell, name) = account;
        env.insert("UID".to_string(), uid.to_string());
        env.insert("SHELL".to_string(), shell);
        env.insert("USER".to_string(), name);
        env.insert("HOME".to_string(), home);
        env.insert("OGON_COOKIE".to_string(), self.ogon_cookie.clone());
        env.insert(
            "OGON_BACKEND_COOKIE".to_string(),
            self.backend_cookie.clone(),
        );
        env.insert("OGON_SID".to_string(), self.id.to_string());
        if !client_name.is_empty() {
            env.insert("OGON_SESSION_CLIENT_NAME".to_string(), client_name.into());
        }
        if !client_address.is_empty() {
            env.insert(
                "OGON_SESSION_CLIENT_ADDRESS".to_string(),
                client_address.into(),
            );
        }

        self.apply_max_resolutions(ctx, self.id, &mut env);

        if let Some(peer) = ctx.rpc.peer_credentials() {
            env.insert("OGON_UID".to_string(), peer.uid.to_string());
            // OGON_PID is left unset for user sessions so they survive
            // a front-end restart (the pid would change)
        }

        self.inner.lock().env = env;
        Ok(())
    }

    /// Build the environment block for a greeter (auth) session.
    pub fn generate_auth_env_block(
        &self,
        ctx: &Arc<AppContext>,
        client_name: &str,
        client_address: &str,
    ) -> Result<(), SessionError> {
        let mut env = self.filtered_environment(ctx);

        env.insert("OGON_COOKIE".to_string(), self.ogon_cookie.clone());
        env.insert(
            "OGON_BACKEND_COOKIE".to_string(),
            self.backend_cookie.clone(),
        );
        env.insert("OGON_SID".to_string(), self.id.to_string());

        let auth_user = self.auth_user_name();
        if !auth_user.is_empty() {
            env.insert("OGON_USER".to_string(), auth_user);
        }
        let auth_domain = self.auth_domain();
        if !auth_domain.is_empty() {
            env.insert("OGON_DOMAIN".to_string(), auth_domain);
        }
        if !client_name.is_empty() {
            env.insert("OGON_SESSION_CLIENT_NAME".to_string(), client_name.into());
        }
        if !client_address.is_empty() {
            env.insert(
                "OGON_SESSION_CLIENT_ADDRESS".to_string(),
                client_address.into(),
            );
        }

        self.apply_max_resolutions(ctx, 0, &mut env);

        if let Some(peer) = ctx.rpc.peer_credentials() {
            env.insert("OGON_UID".to_string(), peer.uid.to_string());
            if let Some(pid) = peer.pid {
                env.insert("OGON_PID".to_string(), pid.to_string());
            }
        }

        self.inner.lock().env = env;
        Ok(())
    }

    pub fn environment(&self) -> EnvBlock {
        self.inner.lock().env.clone()
    }

    fn set_client_bpp(&self, ctx: &Arc<AppContext>) -> Result<(), SessionError> {
        let depth = ctx
            .property_number(self.id, "current.connection.colordepth")
            .ok_or_else(|| {
                SessionError::MissingConfig("current.connection.colordepth".to_string())
            })?;
        self.inner
            .lock()
            .env
            .insert("OGON_CONNECTION_BPP".to_string(), depth.to_string());
        Ok(())
    }

    // -- module lifecycle ----------------------------------------------

    /// Start the configured backend module for this session and return
    /// the backend pipe name.
    pub async fn start_module(&self, ctx: &Arc<AppContext>) -> Result<String, SessionError> {
        if self.inner.lock().session_started {
            warn!(session = self.id, "module already started, stop first");
            return Err(SessionError::AlreadyStarted);
        }

        self.set_client_bpp(ctx)?;

        let config_name = self.module_config_name();
        let base_config_path = format!("module.{}", config_name);
        let module_name = ctx
            .property_string(self.id, &format!("{}.modulename", base_config_path))
            .ok_or_else(|| {
                SessionError::MissingConfig(format!("{}.modulename", base_config_path))
            })?;
        let use_launcher = ctx
            .property_bool(0, &format!("{}.uselauncher", base_config_path))
            .unwrap_or(true);

        let module = ctx
            .modules
            .backend(&module_name, use_launcher)
            .ok_or_else(|| SessionError::ModuleNotFound(module_name.clone()))?;

        let mut mctx = module.new_context(self.id);
        {
            let inner = self.inner.lock();
            mctx.user_name = inner.user_name.clone();
            mctx.domain = inner.domain.clone();
            mctx.user_token = inner.user_token.as_ref().and_then(UserToken::identity);
            mctx.env = inner.env.clone();
        }
        mctx.base_config_path = base_config_path;
        if let Some(connection) = ctx.connections.connection_for_session(self.id) {
            mctx.remote_ip = Some(connection.client_information().client_address);
        }
        let mctx = Arc::new(mctx);

        let pipe_name = match module.start(ctx, &mctx).await {
            Ok(pipe_name) if !pipe_name.is_empty() => pipe_name,
            Ok(_) => {
                warn!(session = self.id, module = %module_name, "module returned no pipe name");
                let _ = module.stop(ctx, &mctx).await;
                module.free_context(&mctx);
                return Err(SessionError::Module(ModuleError::NoPipeName));
            }
            Err(err) => {
                warn!(session = self.id, module = %module_name, %err, "module start failed");
                module.free_context(&mctx);
                return Err(err.into());
            }
        };

        let win_station = module.custom_info(&mctx).unwrap_or_default();
        {
            let mut inner = self.inner.lock();
            inner.module_name = module_name;
            inner.pipe_name = pipe_name.clone();
            inner.win_station_name = win_station;
            inner.session_started = true;
            inner.current_module = Some((module, mctx));
        }
        info!(session = self.id, pipe = %pipe_name, "module started");
        Ok(pipe_name)
    }

    pub async fn connect_module(&self, ctx: &Arc<AppContext>) -> Result<(), SessionError> {
        let Some((module, mctx)) = self.current_binding() else {
            return Err(SessionError::NotStarted);
        };
        module.connect(ctx, &mctx).await?;
        Ok(())
    }

    pub async fn disconnect_module(&self, ctx: &Arc<AppContext>) -> Result<(), SessionError> {
        let Some((module, mctx)) = self.current_binding() else {
            return Err(SessionError::NotStarted);
        };
        module.disconnect(ctx, &mctx).await?;
        Ok(())
    }

    pub async fn stop_module(&self, ctx: &Arc<AppContext>) -> Result<(), SessionError> {
        let binding = {
            let mut inner = self.inner.lock();
            if !inner.session_started {
                trace!(session = self.id, "module not started");
                return Err(SessionError::NotStarted);
            }
            inner.session_started = false;
            inner.pipe_name.clear();
            inner.current_module.take()
        };
        let Some((module, mctx)) = binding else {
            return Err(SessionError::NotStarted);
        };
        if let Err(err) = module.stop(ctx, &mctx).await {
            warn!(session = self.id, %err, "module stop failed");
        }
        module.free_context(&mctx);
        Ok(())
    }

    fn current_binding(&self) -> Option<ModuleBinding> {
        self.inner.lock().current_module.clone()
    }

    pub fn is_current_module(&self, context_id: u64) -> bool {
        self.inner
            .lock()
            .current_module
            .as_ref()
            .map(|(_, mctx)| mctx.context_id == context_id)
            .unwrap_or(false)
    }

    // -- auth backend preservation -------------------------------------

    /// Park the running greeter as the auth backend. Only legal while
    /// Connected.
    pub fn mark_backend_as_auth(&self) -> bool {
        if self.connect_state() != ConnectState::Connected {
            error!(
                session = self.id,
                state = %self.connect_state(),
                "auth backend can only be preserved while Connected"
            );
            return false;
        }
        let mut inner = self.inner.lock();
        let Some(binding) = inner.current_module.take() else {
            return false;
        };
        let module_name = std::mem::take(&mut inner.module_name);
        inner.auth_module = Some((binding, module_name));
        inner.pipe_name.clear();
        inner.session_started = false;
        true
    }

    /// Reinstate the preserved greeter as the current backend.
    pub fn restore_backend_from_auth(&self) {
        let mut inner = self.inner.lock();
        if let Some((binding, module_name)) = inner.auth_module.take() {
            inner.current_module = Some(binding);
            inner.module_name = module_name;
            inner.session_started = true;
        }
    }

    /// Disconnect, stop and free the preserved greeter.
    pub async fn destroy_auth_backend(&self, ctx: &Arc<AppContext>) {
        let binding = self.inner.lock().auth_module.take();
        let Some(((module, mctx), _name)) = binding else {
            return;
        };
        if let Err(err) = module.disconnect(ctx, &mctx).await {
            debug!(session = self.id, %err, "auth backend disconnect failed");
        }
        if let Err(err) = module.stop(ctx, &mctx).await {
            warn!(session = self.id, %err, "auth backend stop failed");
        }
        module.free_context(&mctx);
    }

    // -- auth token file -----------------------------------------------

    /// Write the token file (single line, 0400).
    pub fn apply_auth_token(&self, ctx: &Arc<AppContext>) {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;

        let path = ctx.token_file_path(self.id);
        let token = self.auth_token();
        let result = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o400)
            .open(&path)
            .and_then(|mut file| file.write_all(token.as_bytes()));
        if let Err(err) = result {
            error!(session = self.id, file = %path.display(), %err, "cannot write token file");
        }
    }

    /// Chown the token file to the session user.
    pub fn apply_auth_token_permissions(&self, ctx: &Arc<AppContext>) {
        let Some(identity) = self.user_identity() else {
            return;
        };
        let path = ctx.token_file_path(self.id);
        if let Err(err) = nix::unistd::chown(
            &path,
            Some(nix::unistd::Uid::from_raw(identity.uid)),
            Some(nix::unistd::Gid::from_raw(identity.gid)),
        ) {
            error!(
                session = self.id,
                file = %path.display(),
                uid = identity.uid,
                %err,
                "chown of token file failed"
            );
        }
    }

    pub fn remove_auth_token(&self, ctx: &Arc<AppContext>) {
        let _ = std::fs::remove_file(ctx.token_file_path(self.id));
    }

    /// Release everything the session owns. Called by the shutdown
    /// task right before the executor stops.
    pub async fn release(&self, ctx: &Arc<AppContext>) {
        if let Err(err) = self.stop_module(ctx).await {
            trace!(session = self.id, %err, "stop module during release");
        }
        self.destroy_auth_backend(ctx).await;
        ctx.permissions.unregister(&self.auth_token());
        self.remove_auth_token(ctx);
        self.clear_shadowed_by();
        let mut inner = self.inner.lock();
        if let Some(token) = inner.user_token.take() {
            token.close();
        }
        inner.env.clear();
    }
}
