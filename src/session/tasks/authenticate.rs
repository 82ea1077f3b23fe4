//! Greeter re-authentication
//!
//! An SBP call from the greeter backend carrying fresh credentials.
//! Runs on the greeter session's executor: authenticates the
//! connection, applies the reconnect policy and either reuses the
//! greeter session for a brand-new user session (switching within the
//! session) or switches the connection over to an existing session and
//! drops the greeter.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

use crate::context::AppContext;
use crate::module::auth::AuthStatus;
use crate::rpc::calls::{out, IncomingCall};
use crate::rpc::messages::AuthenticateUserResponse;
use crate::session::session::Session;
use crate::session::state::ConnectState;
use crate::session::tasks::disconnect::TaskDisconnect;
use crate::session::tasks::end::TaskEnd;
use crate::session::tasks::switch_to::TaskSwitchTo;
use crate::task::Task;

pub struct TaskAuthenticateUser {
    session_id: u32,
    user_name: String,
    domain: String,
    password: Zeroizing<String>,
    call: Option<IncomingCall>,
}

impl TaskAuthenticateUser {
    pub fn new(
        session_id: u32,
        user_name: String,
        domain: String,
        password: String,
        call: IncomingCall,
    ) -> Self {
        Self {
            session_id,
            user_name,
            domain,
            password: Zeroizing::new(password),
            call: Some(call),
        }
    }

    async fn authenticate(&self, ctx: &Arc<AppContext>) -> AuthStatus {
        let Some(session) = ctx.sessions.get(self.session_id) else {
            error!(session = self.session_id, "no session for re-auth");
            return AuthStatus::InternalError;
        };
        if session.connect_state() != ConnectState::Connected {
            warn!(
                session = self.session_id,
                state = %session.connect_state(),
                "re-auth on a session that is not a greeter"
            );
            return AuthStatus::WrongSessionState;
        }
        let connection_id = ctx.connections.connection_id_for_session(self.session_id);
        let Some(connection) = ctx.connections.get(connection_id) else {
            error!(
                session = self.session_id,
                "no connection bound to greeter session"
            );
            return AuthStatus::ConnectionMissing;
        };
        connection
            .authenticate_user(ctx, &self.user_name, &self.domain, &self.password, self.session_id)
            .await
    }

    /// Reuse the greeter session for the new user: swap the greeter
    /// aside, start the user backend, tell the front end to switch
    /// pipes within the same session.
    async fn switch_within_session(
        &self,
        ctx: &Arc<AppContext>,
        session: &Arc<Session>,
    ) -> bool {
        let connection_id = ctx.connections.connection_id_for_session(self.session_id);
        let Some(connection) = ctx.connections.get(connection_id) else {
            return false;
        };

        session.set_user_name(&self.user_name);
        // domains are not meaningful on unix platforms
        session.set_domain("");
        session.init_permissions(ctx);

        if !session.check_permission(crate::permission::PERM_LOGON) {
            error!(
                session = session.id(),
                user = %self.user_name,
                "user has no permission to log on"
            );
            ctx.sessions.remove(session.id());
            connection.reset_authenticated_user();
            return false;
        }

        if let Err(err) = session.generate_user_token().await {
            error!(session = session.id(), %err, "user token generation failed");
            ctx.sessions.remove(session.id());
            connection.reset_authenticated_user();
            return false;
        }

        let client = connection.client_information();
        if let Err(err) = session
            .generate_env_block(ctx, &client.client_host_name, &client.client_address)
            .await
        {
            error!(session = session.id(), %err, "environment generation failed");
            ctx.sessions.remove(session.id());
            connection.reset_authenticated_user();
            return false;
        }

        if !session.mark_backend_as_auth() {
            return false;
        }
        session.apply_auth_token_permissions(ctx);

        let module_config = ctx
            .property_string(session.id(), "module")
            .unwrap_or_else(|| {
                info!(session = session.id(), "property module not set, using X11");
                "X11".to_string()
            });
        session.set_module_config_name(&module_config);

        // clamp the connection against the user session's maxima
        let max_width = session.max_x_res() as u32;
        let max_height = session.max_y_res() as u32;
        connection.update_client_information(|client| {
            if max_width != 0 && max_width < client.width {
                client.width = max_width;
            }
            if max_height != 0 && max_height < client.height {
                client.height = max_height;
            }
        });

        let pipe_name = match session.start_module(ctx).await {
            Ok(pipe_name) => pipe_name,
            Err(err) => {
                error!(
                    session = session.id(),
                    config = %module_config,
                    %err,
                    "user backend failed to start, restoring greeter"
                );
                session.restore_backend_from_auth();
                connection.reset_authenticated_user();
                return false;
            }
        };

        let (ogon_cookie, backend_cookie) = session.cookies();
        let switched = out::switch_to(
            ctx,
            connection_id,
            &pipe_name,
            max_width,
            max_height,
            &ogon_cookie,
            &backend_cookie,
        )
        .await;

        match switched {
            Ok(true) => {
                session.destroy_auth_backend(ctx).await;
            }
            Ok(false) | Err(_) => {
                error!(session = session.id(), "front end failed to switch pipes");
                return false;
            }
        }

        if let Err(err) = session.connect_module(ctx).await {
            warn!(session = session.id(), %err, "module connect failed");
        }
        session.set_connect_state(ctx, ConnectState::Active).await;
        true
    }

    /// Reconnect policy after successful re-auth; mirrors the logon
    /// flow but starts from a live greeter session.
    async fn attach_user_session(&self, ctx: &Arc<AppContext>) -> bool {
        let user = self.user_name.as_str();
        let domain = "";
        let reconnect_allowed = ctx
            .properties
            .get_bool(Some(user), "session.reconnect")
            .unwrap_or(true);
        let reconnect_same_client = ctx
            .properties
            .get_bool(Some(user), "session.reconnect.fromSameClient")
            .unwrap_or(false);
        let single_session = ctx
            .properties
            .get_bool(Some(user), "session.singleSession")
            .unwrap_or(false);

        let Some(greeter) = ctx.sessions.get(self.session_id) else {
            return false;
        };
        let client_host = greeter.client_host_name();
        let host_filter = reconnect_same_client.then_some(client_host.as_str());

        let mut target: Option<Arc<Session>> = None;
        if reconnect_allowed {
            if single_session {
                target = ctx.sessions.first_logged_in_session(user, domain, host_filter);
                if let Some(existing) = &target {
                    let bound = ctx.connections.connection_id_for_session(existing.id());
                    if bound != 0 {
                        info!(
                            session = existing.id(),
                            connection = bound,
                            "single session policy, disconnecting live connection"
                        );
                        let (task, done) = TaskDisconnect::for_session(existing.id());
                        if existing.add_task(Box::new(task)) {
                            let _ = done.await;
                        }
                    }
                }
            } else {
                target = ctx
                    .sessions
                    .first_disconnected_session(user, domain, host_filter);
            }
        } else if single_session {
            if let Some(existing) = ctx.sessions.first_logged_in_session(user, domain, host_filter)
            {
                let (task, done) = TaskEnd::new(existing.id());
                if existing.add_task(Box::new(task)) {
                    let _ = done.await;
                }
            }
        }

        match target {
            None => {
                info!(
                    session = self.session_id,
                    user,
                    reconnect_allowed,
                    reconnect_same_client,
                    single_session,
                    "replacing greeter with a new user session"
                );
                self.switch_within_session(ctx, &greeter).await
            }
            Some(existing) => {
                info!(
                    session = existing.id(),
                    user, "switching connection to existing session"
                );
                let connection_id = ctx.connections.connection_id_for_session(self.session_id);
                let (task, done) = TaskSwitchTo::new(connection_id, existing.id());
                if !existing.add_task(Box::new(task)) {
                    return false;
                }
                match done.await {
                    Ok(true) => {
                        // the greeter session is no longer needed
                        ctx.sessions.remove(self.session_id);
                        true
                    }
                    _ => {
                        error!(session = self.session_id, "switch to existing session failed");
                        false
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Task for TaskAuthenticateUser {
    async fn run(&mut self, ctx: &Arc<AppContext>) {
        let mut status = self.authenticate(ctx).await;
        if status == AuthStatus::Success && !self.attach_user_session(ctx).await {
            status = AuthStatus::InternalError;
        }
        if let Some(call) = self.call.take() {
            call.respond_success(&AuthenticateUserResponse {
                auth_status: status.as_wire(),
            });
        }
    }

    fn abort(&mut self) {
        if let Some(call) = self.call.take() {
            call.respond_failed("authentication aborted");
        }
    }

    fn label(&self) -> &'static str {
        "authenticate-user"
    }
}
