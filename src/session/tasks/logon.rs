//! Logon task
//!
//! Runs on the executor of the session chosen by the logon flow. Binds
//! the connection, applies resolution clamping, starts the backend (or
//! greeter) when needed, drains the connection's parked calls and
//! answers the logon request with the backend pipe name and cookies.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::context::AppContext;
use crate::protocol::SHUTDOWN_TIMEOUT_MS;
use crate::rpc::calls::{out, IncomingCall};
use crate::rpc::messages::LogonUserResponse;
use crate::session::connection::{Connection, ConnectionState};
use crate::session::session::Session;
use crate::session::state::ConnectState;
use crate::session::tasks::end::TaskEnd;
use crate::task::Task;

/// Client parameters the logon request carried.
#[derive(Debug, Clone)]
pub struct LogonParams {
    pub user_name: String,
    pub domain: String,
    pub client_host_name: String,
    pub client_address: String,
    pub client_build_number: u32,
    pub client_product_id: u16,
    pub client_hardware_id: u32,
    pub client_protocol_type: u16,
    pub width: u32,
    pub height: u32,
    pub color_depth: u32,
}

pub struct TaskLogonUser {
    connection_id: u32,
    session_id: u32,
    params: LogonParams,
    /// Bring up a greeter instead of a user backend.
    create_auth_session: bool,
    /// Single-session policy: disconnect the session's current
    /// connection before taking it over.
    disconnect_first: bool,
    /// Session to log off before this logon proceeds (single session
    /// without reconnect).
    logoff_session: u32,
    call: Option<IncomingCall>,
}

impl TaskLogonUser {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connection_id: u32,
        session_id: u32,
        params: LogonParams,
        create_auth_session: bool,
        disconnect_first: bool,
        logoff_session: u32,
        call: IncomingCall,
    ) -> Self {
        Self {
            connection_id,
            session_id,
            params,
            create_auth_session,
            disconnect_first,
            logoff_session,
            call: Some(call),
        }
    }

    /// Clamp the requested resolution against the session maxima and
    /// record the client information on the connection.
    fn apply_client_information(&self, session: &Session, connection: &Connection) {
        let max_width = session.max_x_res() as u32;
        let max_height = session.max_y_res() as u32;
        let width = if max_width != 0 && max_width < self.params.width {
            info!(
                session = session.id(),
                requested = self.params.width,
                max = max_width,
                "width exceeds maximum, clamping"
            );
            max_width
        } else {
            self.params.width
        };
        let height = if max_height != 0 && max_height < self.params.height {
            info!(
                session = session.id(),
                requested = self.params.height,
                max = max_height,
                "height exceeds maximum, clamping"
            );
            max_height
        } else {
            self.params.height
        };

        connection.update_client_information(|client| {
            client.width = width;
            client.height = height;
            client.initial_width = self.params.width;
            client.initial_height = self.params.height;
            client.color_depth = self.params.color_depth;
            client.client_host_name = self.params.client_host_name.clone();
            client.client_address = self.params.client_address.clone();
            client.client_build_number = self.params.client_build_number;
            client.client_product_id = self.params.client_product_id;
            client.client_hardware_id = self.params.client_hardware_id;
            client.client_protocol_type = self.params.client_protocol_type;
        });
    }

    /// Re-dispatch every call that was parked while the connection had
    /// no session.
    async fn fetch_queued_calls(&self, ctx: &Arc<AppContext>, connection: &Connection) {
        for parked in connection.set_state_take_parked(ConnectionState::HasSession) {
            ctx.calls.dispatch(parked, ctx).await;
        }
    }

    /// Single-session takeover: ask the front end to log off the other
    /// connection, then mark the session disconnected.
    async fn disconnect_existing_connection(&self, ctx: &Arc<AppContext>, session: &Arc<Session>) {
        let connection_id = ctx.connections.connection_id_for_session(session.id());
        if connection_id == 0 {
            return;
        }
        info!(
            session = session.id(),
            connection = connection_id,
            "single session policy, disconnecting previous connection"
        );
        match out::logoff_user_session(
            ctx,
            connection_id,
            Duration::from_millis(SHUTDOWN_TIMEOUT_MS),
        )
        .await
        {
            Ok(true) => {}
            Ok(false) => warn!(
                session = session.id(),
                "front end did not confirm logoff, removing connection anyway"
            ),
            Err(failure) => warn!(
                session = session.id(),
                code = failure.code,
                "logoff call failed, removing connection anyway"
            ),
        }
        ctx.connections.remove(connection_id);
        session
            .set_connect_state(ctx, ConnectState::Disconnected)
            .await;
    }

    async fn user_session(&self, ctx: &Arc<AppContext>) -> Option<Arc<Session>> {
        let connection = ctx.connections.get(self.connection_id);
        let Some(connection) = connection else {
            error!(
                connection = self.connection_id,
                "connection disappeared, aborting logon"
            );
            return None;
        };

        if self.logoff_session != 0 {
            if let Some(previous) = ctx.sessions.get(self.logoff_session) {
                let (task, done) = TaskEnd::new(self.logoff_session);
                if previous.add_task(Box::new(task)) {
                    let _ = done.await;
                }
            }
        }

        if self.session_id == 0 {
            error!("logon task needs a target session");
            connection.set_state_take_parked(ConnectionState::SessionFailed);
            return None;
        }
        let Some(session) = ctx.sessions.get(self.session_id) else {
            error!(session = self.session_id, "session disappeared, aborting logon");
            connection.set_state_take_parked(ConnectionState::SessionFailed);
            return None;
        };

        if self.disconnect_first {
            self.disconnect_existing_connection(ctx, &session).await;
        }

        connection.bind_session(session.id());
        self.apply_client_information(&session, &connection);

        if session.connect_state() == ConnectState::Init {
            if let Err(err) = session.start_module(ctx).await {
                error!(
                    session = session.id(),
                    config = %session.module_config_name(),
                    %err,
                    "backend module failed to start"
                );
                ctx.sessions.remove(session.id());
                connection.set_state_take_parked(ConnectionState::SessionFailed);
                return None;
            }
            session.set_connect_state(ctx, ConnectState::Connected).await;
        }

        self.fetch_queued_calls(ctx, &connection).await;
        session.set_connect_state(ctx, ConnectState::Active).await;
        Some(session)
    }

    async fn auth_session(&self, ctx: &Arc<AppContext>) -> Option<Arc<Session>> {
        let connection = ctx.connections.get_or_create(self.connection_id);
        let Some(session) = ctx.sessions.get(self.session_id) else {
            error!(session = self.session_id, "auth session disappeared");
            connection.set_state_take_parked(ConnectionState::SessionFailed);
            return None;
        };

        let greeter = ctx
            .properties
            .get_string(Some(&self.params.user_name), "auth.greeter")
            .unwrap_or_else(|| {
                info!(
                    session = session.id(),
                    "property auth.greeter not set, using Qt"
                );
                "Qt".to_string()
            });

        info!(
            session = session.id(),
            client = %self.params.client_host_name,
            "creating auth session"
        );

        session.set_module_config_name(&greeter);
        session.set_auth_user_name(&self.params.user_name);
        session.set_auth_domain(&self.params.domain);
        session.set_client_host_name(&self.params.client_host_name);
        session.init_permissions(ctx);

        if let Err(err) = session.generate_auth_env_block(
            ctx,
            &self.params.client_host_name,
            &self.params.client_address,
        ) {
            error!(session = session.id(), %err, "auth environment generation failed");
            return self.fail_auth_session(ctx, &connection);
        }

        connection.bind_session(session.id());
        self.apply_client_information(&session, &connection);

        if let Err(err) = session.start_module(ctx).await {
            error!(
                session = session.id(),
                config = %greeter,
                %err,
                "greeter module failed to start"
            );
            return self.fail_auth_session(ctx, &connection);
        }

        self.fetch_queued_calls(ctx, &connection).await;
        session.set_connect_state(ctx, ConnectState::Connected).await;
        Some(session)
    }

    fn fail_auth_session(
        &self,
        ctx: &Arc<AppContext>,
        connection: &Connection,
    ) -> Option<Arc<Session>> {
        ctx.sessions.remove(self.session_id);
        connection.set_state_take_parked(ConnectionState::SessionFailed);
        None
    }
}

#[async_trait]
impl Task for TaskLogonUser {
    async fn run(&mut self, ctx: &Arc<AppContext>) {
        let session = if self.create_auth_session {
            self.auth_session(ctx).await
        } else {
            self.user_session(ctx).await
        };

        let Some(call) = self.call.take() else { return };
        match session {
            Some(session) => {
                let (ogon_cookie, backend_cookie) = session.cookies();
                call.respond_success(&LogonUserResponse {
                    service_endpoint: session.pipe_name(),
                    max_width: session.max_x_res() as u32,
                    max_height: session.max_y_res() as u32,
                    ogon_cookie,
                    backend_cookie,
                });
                if !self.create_auth_session {
                    out::post_logon_info(
                        ctx,
                        self.connection_id,
                        session.id(),
                        &session.user_name(),
                        &session.domain(),
                    );
                }
            }
            None => call.respond_failed("logon failed"),
        }
    }

    fn abort(&mut self) {
        if let Some(call) = self.call.take() {
            call.respond_failed("logon aborted");
        }
    }

    fn label(&self) -> &'static str {
        "logon-user"
    }
}
