//! OTSAPI operation handler
//!
//! Resolves the caller's token to a session or a logon record,
//! enforces the permission bit of each operation and dispatches onto
//! session executors. The same user always has full access to their
//! own sessions.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::context::AppContext;
use crate::module::auth::AuthStatus;
use crate::permission::{
    check_permission, local_groups, TokenBinding, PERM_DISCONNECT, PERM_FLAGS_FULL,
    PERM_FLAGS_GUEST, PERM_FLAGS_USER, PERM_LOGOFF, PERM_MESSAGE, PERM_QUERY_INFORMATION,
    PERM_REMOTE_CONTROL, PERM_VIRTUAL_CHANNEL,
};
use crate::protocol::{
    message, OTSAPI_TIMEOUT_MS, PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR,
};
use crate::rpc::calls::out;
use crate::session::tasks::{TaskDisconnect, TaskEnd};
use crate::session::Session;
use crate::otsapi::remote_control::{TaskStartRemoteControl, TaskStopRemoteControl};
use crate::otsapi::{ConnectionStats, OtsRequest, OtsResponse, SessionDetails, SessionInfo};

/// The dynamic-channel option flag of `virtualChannelOpen`.
const CHANNEL_OPTION_DYNAMIC: u32 = 0x0000_0001;

pub struct OtsApiHandler {
    ctx: Arc<AppContext>,
}

impl OtsApiHandler {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    pub async fn handle(&self, request: OtsRequest) -> OtsResponse {
        match request {
            OtsRequest::Ping { value } => OtsResponse::Pong { value },
            OtsRequest::GetVersionInfo => OtsResponse::Version {
                major: PROTOCOL_VERSION_MAJOR,
                minor: PROTOCOL_VERSION_MINOR,
            },
            OtsRequest::LogonConnection {
                user_name,
                domain,
                password,
            } => self.logon_connection(&user_name, &domain, &password).await,
            OtsRequest::LogoffConnection { token } => {
                self.ctx.permissions.unregister(&token);
                OtsResponse::Done { success: true }
            }
            OtsRequest::EnumerateSessions { token } => self.enumerate_sessions(&token),
            OtsRequest::QuerySessionInformation { token, session_id } => {
                self.query_session_information(&token, session_id).await
            }
            OtsRequest::DisconnectSession {
                token,
                session_id,
                wait,
            } => self.disconnect_session(&token, session_id, wait).await,
            OtsRequest::LogoffSession {
                token,
                session_id,
                wait,
            } => self.logoff_session(&token, session_id, wait).await,
            OtsRequest::StartRemoteControlSession {
                token,
                session_id,
                target_session_id,
                hotkey_vk,
                hotkey_modifiers,
                flags,
            } => {
                self.start_remote_control(
                    &token,
                    session_id,
                    target_session_id,
                    hotkey_vk,
                    hotkey_modifiers,
                    flags,
                )
                .await
            }
            OtsRequest::StopRemoteControlSession { token, session_id } => {
                self.stop_remote_control(&token, session_id).await
            }
            OtsRequest::VirtualChannelOpen {
                token,
                session_id,
                virtual_name,
                dynamic,
                flags,
            } => {
                self.virtual_channel_open(&token, session_id, &virtual_name, dynamic, flags)
                    .await
            }
            OtsRequest::VirtualChannelClose {
                token,
                session_id,
                virtual_name,
                instance,
            } => {
                self.virtual_channel_close(&token, session_id, &virtual_name, instance)
                    .await
            }
            OtsRequest::SendMessage {
                token,
                session_id,
                title,
                message,
                style,
                timeout,
                wait,
            } => {
                self.send_message(&token, session_id, title, message, style, timeout, wait)
                    .await
            }
        }
    }

    /// Target session for `token`, provided the token grants
    /// `permission` — or owns the session outright.
    fn session_with_permission(
        &self,
        token: &str,
        session_id: u32,
        permission: u32,
    ) -> Option<Arc<Session>> {
        let target = self.ctx.sessions.get(session_id)?;
        match self.ctx.permissions.binding(token)? {
            TokenBinding::Session(owner_id) => {
                if owner_id == session_id {
                    return Some(target);
                }
                let owner = self.ctx.sessions.get(owner_id)?;
                let same_user = !owner.user_name().is_empty()
                    && owner.user_name() == target.user_name()
                    && owner.domain() == target.domain();
                (same_user || owner.check_permission(permission)).then_some(target)
            }
            TokenBinding::Logon(record) => {
                let same_user = !record.user.is_empty()
                    && record.user == target.user_name()
                    && record.domain == target.domain();
                (same_user || check_permission(record.mask, permission)).then_some(target)
            }
        }
    }

    fn token_grants(&self, token: &str, permission: u32) -> bool {
        match self.ctx.permissions.binding(token) {
            Some(TokenBinding::Session(id)) => self
                .ctx
                .sessions
                .get(id)
                .map(|s| s.check_permission(permission))
                .unwrap_or(false),
            Some(TokenBinding::Logon(record)) => check_permission(record.mask, permission),
            None => false,
        }
    }

    /// Authenticate an API client and issue a logon token carrying the
    /// user's configured permission level.
    async fn logon_connection(&self, user_name: &str, domain: &str, password: &str) -> OtsResponse {
        let groups_user = user_name.to_string();
        let groups = tokio::task::spawn_blocking(move || local_groups(&groups_user))
            .await
            .unwrap_or_default();
        if !self.ctx.permissions.is_logon_allowed(&groups) {
            debug!(user = user_name, "API logon rejected by group policy");
            return OtsResponse::Token { token: None };
        }

        let module_name = self
            .ctx
            .properties
            .get_string(Some(user_name), "auth.module")
            .unwrap_or_else(|| "PAM".to_string());
        let Some(auth) = self.ctx.modules.auth_module(&module_name) else {
            warn!(module = %module_name, "auth module not registered");
            return OtsResponse::Token { token: None };
        };
        let outcome = auth.logon_user(user_name, domain, password).await;
        if outcome.status != AuthStatus::Success {
            return OtsResponse::Token { token: None };
        }

        let mask = match self
            .ctx
            .properties
            .get_string(Some(user_name), "permission.level")
            .as_deref()
            .map(str::to_ascii_uppercase)
            .as_deref()
        {
            Some("FULL") => PERM_FLAGS_FULL,
            Some("USER") => PERM_FLAGS_USER,
            _ => PERM_FLAGS_GUEST,
        };
        let token = self.ctx.permissions.register_logon(user_name, domain, mask);
        info!(user = user_name, "API logon token issued");
        OtsResponse::Token { token: Some(token) }
    }

    fn enumerate_sessions(&self, token: &str) -> OtsResponse {
        let all = self.token_grants(token, PERM_QUERY_INFORMATION);
        let caller_user = match self.ctx.permissions.binding(token) {
            Some(TokenBinding::Session(id)) => {
                self.ctx.sessions.get(id).map(|s| (s.user_name(), s.domain()))
            }
            Some(TokenBinding::Logon(record)) => Some((record.user, record.domain)),
            None => return OtsResponse::Error {
                message: "invalid token".to_string(),
            },
        };

        let sessions = self
            .ctx
            .sessions
            .all()
            .into_iter()
            .filter(|s| {
                all || caller_user
                    .as_ref()
                    .map(|(user, domain)| {
                        !user.is_empty() && s.user_name() == *user && s.domain() == *domain
                    })
                    .unwrap_or(false)
            })
            .map(|s| SessionInfo {
                session_id: s.id(),
                win_station_name: s.win_station_name(),
                connect_state: s.connect_state().as_wts(),
            })
            .collect();
        OtsResponse::Sessions { sessions }
    }

    async fn query_session_information(&self, token: &str, session_id: u32) -> OtsResponse {
        let Some(session) =
            self.session_with_permission(token, session_id, PERM_QUERY_INFORMATION)
        else {
            return OtsResponse::SessionInformation { info: None };
        };

        // transport counters are best-effort
        let connection_id = self.ctx.connections.connection_id_for_session(session_id);
        let stats = if connection_id != 0 {
            out::connection_stats(
                &self.ctx,
                connection_id,
                Duration::from_millis(OTSAPI_TIMEOUT_MS),
            )
            .await
            .ok()
            .map(|stats| ConnectionStats {
                incoming_bytes: stats.incoming_bytes,
                outgoing_bytes: stats.outgoing_bytes,
                incoming_frames: stats.incoming_frames,
                outgoing_frames: stats.outgoing_frames,
            })
        } else {
            None
        };

        let info = SessionDetails {
            session_id: session.id(),
            user_name: session.user_name(),
            domain: session.domain(),
            client_host_name: session.client_host_name(),
            win_station_name: session.win_station_name(),
            connect_state: session.connect_state().as_wts(),
            connect_time: session.connect_time().map(unix_seconds),
            disconnect_time: session.disconnect_time().map(unix_seconds),
            logon_time: session.logon_time().map(unix_seconds),
            max_width: session.max_x_res() as u32,
            max_height: session.max_y_res() as u32,
            shadowed_by: session.shadowed_by(),
            stats,
        };
        OtsResponse::SessionInformation { info: Some(info) }
    }

    async fn disconnect_session(&self, token: &str, session_id: u32, wait: bool) -> OtsResponse {
        let Some(session) = self.session_with_permission(token, session_id, PERM_DISCONNECT)
        else {
            return access_denied();
        };

        // tell the front end first so the client is dropped cleanly
        let connection_id = self.ctx.connections.connection_id_for_session(session_id);
        if connection_id != 0 {
            let _ = out::disconnect_user_session(
                &self.ctx,
                connection_id,
                Duration::from_millis(OTSAPI_TIMEOUT_MS),
            )
            .await;
        }

        let (task, done) = TaskDisconnect::for_session(session_id);
        if !session.add_task(Box::new(task)) {
            return OtsResponse::Done { success: false };
        }
        if !wait {
            return OtsResponse::Done { success: true };
        }
        let success = matches!(done.await, Ok(Some(true)));
        OtsResponse::Done { success }
    }

    async fn logoff_session(&self, token: &str, session_id: u32, wait: bool) -> OtsResponse {
        let Some(session) = self.session_with_permission(token, session_id, PERM_LOGOFF) else {
            return access_denied();
        };
        let (task, done) = TaskEnd::new(session_id);
        if !session.add_task(Box::new(task)) {
            return OtsResponse::Done { success: false };
        }
        if !wait {
            return OtsResponse::Done { success: true };
        }
        let success = done.await.unwrap_or(false);
        OtsResponse::Done { success }
    }

    async fn start_remote_control(
        &self,
        token: &str,
        session_id: u32,
        target_session_id: u32,
        hotkey_vk: u8,
        hotkey_modifiers: u16,
        flags: u32,
    ) -> OtsResponse {
        // the permission is checked against the session being shadowed
        if self
            .session_with_permission(token, target_session_id, PERM_REMOTE_CONTROL)
            .is_none()
        {
            return access_denied();
        }
        let Some(shadow) = self.ctx.sessions.get(session_id) else {
            return OtsResponse::Done { success: false };
        };

        let (task, done) = TaskStartRemoteControl::new(
            session_id,
            target_session_id,
            hotkey_vk,
            hotkey_modifiers,
            flags,
        );
        if !shadow.add_task(Box::new(task)) {
            return OtsResponse::Done { success: false };
        }
        let success = done.await.unwrap_or(false);
        OtsResponse::Done { success }
    }

    async fn stop_remote_control(&self, token: &str, session_id: u32) -> OtsResponse {
        let Some(session) = self.session_with_permission(token, session_id, PERM_REMOTE_CONTROL)
        else {
            return access_denied();
        };
        let (task, done) = TaskStopRemoteControl::new(session_id);
        if !session.add_task(Box::new(task)) {
            return OtsResponse::Done { success: false };
        }
        let success = done.await.unwrap_or(false);
        OtsResponse::Done { success }
    }

    async fn virtual_channel_open(
        &self,
        token: &str,
        session_id: u32,
        virtual_name: &str,
        dynamic: bool,
        flags: u32,
    ) -> OtsResponse {
        let empty = OtsResponse::Channel {
            pipe_name: String::new(),
            instance: 0,
        };
        let Some(session) = self.session_with_permission(token, session_id, PERM_VIRTUAL_CHANNEL)
        else {
            warn!(session = session_id, "virtual channel open denied");
            return empty;
        };
        if !session.is_virtual_channel_allowed(&self.ctx, virtual_name) {
            warn!(
                session = session_id,
                channel = virtual_name,
                "virtual channel forbidden by configuration"
            );
            return empty;
        }
        let connection_id = self.ctx.connections.connection_id_for_session(session_id);
        if connection_id == 0 {
            warn!(session = session_id, "no connection for virtual channel");
            return empty;
        }

        let dynamic_channel = dynamic && (flags & CHANNEL_OPTION_DYNAMIC) != 0;
        match out::virtual_channel_open(
            &self.ctx,
            connection_id,
            virtual_name,
            dynamic_channel,
            if dynamic_channel { flags } else { 0 },
            Duration::from_millis(OTSAPI_TIMEOUT_MS),
        )
        .await
        {
            Ok((pipe_name, instance)) => OtsResponse::Channel {
                pipe_name,
                instance,
            },
            Err(failure) => {
                warn!(
                    session = session_id,
                    code = failure.code,
                    "virtual channel open failed"
                );
                empty
            }
        }
    }

    async fn virtual_channel_close(
        &self,
        token: &str,
        session_id: u32,
        virtual_name: &str,
        instance: u32,
    ) -> OtsResponse {
        if self
            .session_with_permission(token, session_id, PERM_VIRTUAL_CHANNEL)
            .is_none()
        {
            return access_denied();
        }
        let connection_id = self.ctx.connections.connection_id_for_session(session_id);
        if connection_id == 0 {
            return OtsResponse::Done { success: false };
        }
        let success = out::virtual_channel_close(
            &self.ctx,
            connection_id,
            virtual_name,
            instance,
            Duration::from_millis(OTSAPI_TIMEOUT_MS),
        )
        .await
        .unwrap_or(false);
        OtsResponse::Done { success }
    }

    /// Message boxes bypass the session executor: straight through the
    /// RPC out-queue.
    #[allow(clippy::too_many_arguments)]
    async fn send_message(
        &self,
        token: &str,
        session_id: u32,
        title: String,
        text: String,
        style: u32,
        timeout: u32,
        wait: bool,
    ) -> OtsResponse {
        if self
            .session_with_permission(token, session_id, PERM_MESSAGE)
            .is_none()
        {
            return access_denied();
        }
        let connection_id = self.ctx.connections.connection_id_for_session(session_id);
        if connection_id == 0 {
            return OtsResponse::MessageResult {
                response: message::IDTIMEOUT,
            };
        }

        let parameters = vec![title, text];
        if !wait {
            let wait_budget = Duration::from_millis(OTSAPI_TIMEOUT_MS);
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                let _ = out::message(&ctx, connection_id, 1, style, timeout, &parameters, wait_budget)
                    .await;
            });
            return OtsResponse::MessageResult { response: 0 };
        }

        let wait_budget = Duration::from_secs(u64::from(timeout) + 1);
        let response = out::message(
            &self.ctx,
            connection_id,
            1,
            style,
            timeout,
            &parameters,
            wait_budget,
        )
        .await
        .unwrap_or(message::IDTIMEOUT);
        OtsResponse::MessageResult { response }
    }
}

fn access_denied() -> OtsResponse {
    OtsResponse::Error {
        message: "session not found or access denied".to_string(),
    }
}

fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
