//! Typed calls and the dispatch registry
//!
//! The factory keyed on call-type id: every in-call family registers a
//! handler; unknown call types are answered `NOTFOUND`. Handlers either
//! respond immediately or hand the call to a session executor via
//! [`CallTask`] (connection-addressed calls may get parked on the
//! connection until a session binds).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::context::AppContext;
use crate::protocol::{icp, sbp, SBP_CALL_TYPE_BASE};
use crate::rpc::envelope::RpcStatus;
use crate::rpc::{RpcCore, RpcError};
use crate::session::Session;
use crate::task::Task;

mod disconnect_user_session;
mod logon_user;
pub mod out;
mod ping;
mod property;
mod remote_control_ended;
mod sbp_calls;

/// An undispatched inbound request.
pub struct IncomingCall {
    pub tag: u32,
    pub call_type: u16,
    pub payload: Bytes,
    core: Arc<RpcCore>,
}

impl IncomingCall {
    pub fn new(tag: u32, call_type: u16, payload: Bytes, core: Arc<RpcCore>) -> Self {
        Self {
            tag,
            call_type,
            payload,
            core,
        }
    }

    pub fn decode<M: prost::Message + Default>(&self) -> Result<M, RpcError> {
        M::decode(self.payload.as_ref()).map_err(RpcError::Decode)
    }

    pub fn respond_success<M: prost::Message>(self, response: &M) {
        self.core.queue_response(
            self.tag,
            self.call_type,
            RpcStatus::Success,
            response.encode_to_vec(),
            None,
        );
    }

    pub fn respond_failed(self, description: impl Into<String>) {
        self.core.queue_response(
            self.tag,
            self.call_type,
            RpcStatus::Failed,
            Vec::new(),
            Some(description.into()),
        );
    }

    pub fn respond_not_found(self) {
        self.core.queue_response(
            self.tag,
            self.call_type,
            RpcStatus::NotFound,
            Vec::new(),
            None,
        );
    }
}

type Handler = fn(IncomingCall, &Arc<AppContext>) -> BoxFuture<'static, ()>;

/// Dispatch table keyed on call-type id.
pub struct CallRegistry {
    handlers: HashMap<u16, Handler>,
}

impl CallRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry with every built-in call family.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(icp::PING, ping::handle);
        registry.register(icp::LOGON_USER, logon_user::handle);
        registry.register(icp::DISCONNECT_USER_SESSION, disconnect_user_session::handle);
        registry.register(icp::PROPERTY_BOOL, property::handle_bool);
        registry.register(icp::PROPERTY_NUMBER, property::handle_number);
        registry.register(icp::PROPERTY_STRING, property::handle_string);
        registry.register(icp::PROPERTY_BULK, property::handle_bulk);
        registry.register(icp::REMOTE_CONTROL_ENDED, remote_control_ended::handle);
        registry.register(sbp::VERSION, sbp_calls::handle_version);
        registry.register(sbp::AUTHENTICATE_USER, sbp_calls::handle_authenticate_user);
        registry.register(sbp::END_SESSION, sbp_calls::handle_end_session);
        registry
    }

    pub fn register(&mut self, call_type: u16, handler: Handler) {
        self.handlers.insert(call_type, handler);
    }

    pub async fn dispatch(&self, call: IncomingCall, ctx: &Arc<AppContext>) {
        match self.handlers.get(&call.call_type) {
            Some(handler) => handler(call, ctx).await,
            None => {
                warn!(call_type = call.call_type, "no handler for call type");
                call.respond_not_found();
            }
        }
    }
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

/// Session task wrapping an in-call; aborting answers the peer with an
/// error so no request is left dangling.
pub struct CallTask {
    label: &'static str,
    call: Option<IncomingCall>,
    run_fn: fn(IncomingCall, Arc<AppContext>) -> BoxFuture<'static, ()>,
}

impl CallTask {
    pub fn new(
        label: &'static str,
        call: IncomingCall,
        run_fn: fn(IncomingCall, Arc<AppContext>) -> BoxFuture<'static, ()>,
    ) -> Self {
        Self {
            label,
            call: Some(call),
            run_fn,
        }
    }
}

#[async_trait]
impl Task for CallTask {
    async fn run(&mut self, ctx: &Arc<AppContext>) {
        if let Some(call) = self.call.take() {
            (self.run_fn)(call, ctx.clone()).await;
        }
    }

    fn abort(&mut self) {
        if let Some(call) = self.call.take() {
            call.respond_failed("call aborted");
        }
    }

    fn label(&self) -> &'static str {
        self.label
    }
}

/// Route a connection-addressed call onto the session bound to the
/// connection, parking it while the connection has none yet.
pub fn route_via_connection(
    ctx: &Arc<AppContext>,
    connection_id: u32,
    task_label: &'static str,
    call: IncomingCall,
    run_fn: fn(IncomingCall, Arc<AppContext>) -> BoxFuture<'static, ()>,
) {
    let Some(connection) = ctx.connections.get(connection_id) else {
        debug!(connection = connection_id, "call for unknown connection");
        call.respond_failed("unknown connection");
        return;
    };

    let Some(call) = connection.park_or_route(call) else {
        return;
    };

    let session_id = connection.session_id();
    let Some(session) = ctx.sessions.get(session_id) else {
        call.respond_failed("session gone");
        return;
    };
    session.add_task(Box::new(CallTask::new(task_label, call, run_fn)));
}

/// Resolve the target session of an SBP call and enforce the
/// version-compatibility gate (the version call itself is exempt).
pub fn sbp_session(
    ctx: &Arc<AppContext>,
    session_id: u32,
    call: IncomingCall,
) -> Option<(Arc<Session>, IncomingCall)> {
    debug_assert!(call.call_type >= SBP_CALL_TYPE_BASE);
    let Some(session) = ctx.sessions.get(session_id) else {
        call.respond_failed("unknown session");
        return None;
    };
    if call.call_type != sbp::VERSION && !session.is_sbp_compatible() {
        warn!(
            session = session_id,
            call_type = call.call_type,
            "SBP call without version compatibility, aborting"
        );
        call.respond_failed("SBP version incompatible");
        return None;
    }
    Some((session, call))
}
