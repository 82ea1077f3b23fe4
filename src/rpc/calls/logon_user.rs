//! Logon request
//!
//! Authenticates the connection, applies the reconnect/single-session
//! policy and queues the logon task on the chosen session. On
//! authentication failure a fresh session is created for the greeter
//! so the front end still gets a pipe to display.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, error, info};

use crate::context::AppContext;
use crate::module::auth::AuthStatus;
use crate::permission::PERM_LOGON;
use crate::rpc::calls::IncomingCall;
use crate::rpc::messages::LogonUserRequest;
use crate::session::session::Session;
use crate::session::tasks::logon::{LogonParams, TaskLogonUser};

pub(super) fn handle(call: IncomingCall, ctx: &Arc<AppContext>) -> BoxFuture<'static, ()> {
    let ctx = ctx.clone();
    Box::pin(async move {
        let Ok(req) = call.decode::<LogonUserRequest>() else {
            call.respond_failed("bad logon request");
            return;
        };
        if ctx.is_shutting_down() {
            call.respond_failed("session manager is shutting down");
            return;
        }

        let connection = ctx.connections.get_or_create(req.connection_id);
        let status = connection
            .authenticate_user(&ctx, &req.user_name, &req.domain, &req.password, 0)
            .await;

        let params = params_from_request(&req);
        if status == AuthStatus::Success {
            user_session(&ctx, req.connection_id, params, call).await;
        } else {
            debug!(
                connection = req.connection_id,
                user = %req.user_name,
                ?status,
                "authentication failed, starting greeter"
            );
            auth_session(&ctx, req.connection_id, params, call);
        }
    })
}

fn params_from_request(req: &LogonUserRequest) -> LogonParams {
    LogonParams {
        user_name: req.user_name.clone(),
        // domains are not meaningful on unix platforms
        domain: String::new(),
        client_host_name: req.client_host_name.clone(),
        client_address: req.client_address.clone(),
        client_build_number: req.client_build_number,
        client_product_id: req.client_product_id as u16,
        client_hardware_id: req.client_hardware_id,
        client_protocol_type: req.client_protocol_type as u16,
        width: req.width,
        height: req.height,
        color_depth: req.color_depth,
    }
}

/// Pick or create the session for an authenticated logon and queue the
/// logon task on it.
async fn user_session(
    ctx: &Arc<AppContext>,
    connection_id: u32,
    params: LogonParams,
    call: IncomingCall,
) {
    let user = params.user_name.as_str();
    let domain = params.domain.as_str();
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

    let host_filter = reconnect_same_client.then_some(params.client_host_name.as_str());

    let mut session = None;
    let mut disconnect_first = false;
    let mut logoff_session = 0;

    if reconnect_allowed {
        if single_session {
            session = ctx.sessions.first_logged_in_session(user, domain, host_filter);
            if session.is_some() {
                disconnect_first = true;
            }
        } else {
            session = ctx
                .sessions
                .first_disconnected_session(user, domain, host_filter);
        }
    } else if single_session {
        if let Some(previous) = ctx.sessions.first_logged_in_session(user, domain, host_filter) {
            logoff_session = previous.id();
        }
    }

    let session = match session {
        Some(session) => {
            info!(
                session = session.id(),
                user,
                reconnect_allowed,
                reconnect_same_client,
                single_session,
                "reusing existing session"
            );
            session
        }
        None => match new_user_session(ctx, &params).await {
            Some(session) => session,
            None => {
                call.respond_failed("logon failed");
                return;
            }
        },
    };

    let task = TaskLogonUser::new(
        connection_id,
        session.id(),
        params,
        false,
        disconnect_first,
        logoff_session,
        call,
    );
    session.add_task(Box::new(task));
}

/// Fresh session for an authenticated user: identity, permissions,
/// user token, environment, module config.
async fn new_user_session(ctx: &Arc<AppContext>, params: &LogonParams) -> Option<Arc<Session>> {
    let session = ctx.sessions.create(ctx);
    let session_id = session.id();

    session.set_user_name(&params.user_name);
    session.set_domain(&params.domain);
    session.set_client_host_name(&params.client_host_name);
    session.init_permissions(ctx);

    if !session.check_permission(PERM_LOGON) {
        error!(
            session = session_id,
            user = %params.user_name,
            "user has no permission to log on"
        );
        ctx.sessions.remove(session_id);
        return None;
    }

    if let Err(err) = session.generate_user_token().await {
        error!(session = session_id, %err, "user token generation failed");
        ctx.sessions.remove(session_id);
        return None;
    }

    if let Err(err) = session
        .generate_env_block(ctx, &params.client_host_name, &params.client_address)
        .await
    {
        error!(session = session_id, %err, "environment generation failed");
        ctx.sessions.remove(session_id);
        return None;
    }

    session.apply_auth_token_permissions(ctx);

    let module_config = ctx
        .property_string(session_id, "module")
        .unwrap_or_else(|| {
            info!(session = session_id, "property module not set, using X11");
            "X11".to_string()
        });
    session.set_module_config_name(&module_config);

    debug!(
        session = session_id,
        user = %params.user_name,
        module = %module_config,
        "created session for user"
    );
    Some(session)
}

/// Greeter path: a fresh session in state Init; the logon task brings
/// it to Connected with the greeter module.
fn auth_session(ctx: &Arc<AppContext>, connection_id: u32, params: LogonParams, call: IncomingCall) {
    let session = ctx.sessions.create(ctx);
    let task = TaskLogonUser::new(connection_id, session.id(), params, true, false, 0, call);
    session.add_task(Box::new(task));
}
