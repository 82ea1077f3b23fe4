//! SBP in-calls from backend modules
//!
//! Relayed by the front end on the same pipe; call types at or above
//! the SBP base. Everything except the version exchange requires the
//! target session to have negotiated a compatible SBP version.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{info, warn};

use crate::context::AppContext;
use crate::protocol::SBP_VERSION_MAJOR;
use crate::rpc::calls::{sbp_session, CallTask, IncomingCall};
use crate::rpc::messages::{
    AuthenticateUserRequest, EndSessionRequest, EndSessionResponse, SbpVersionRequest,
    SbpVersionResponse,
};
use crate::session::tasks::{end_session, TaskAuthenticateUser};

pub(super) fn handle_version(call: IncomingCall, ctx: &Arc<AppContext>) -> BoxFuture<'static, ()> {
    let ctx = ctx.clone();
    Box::pin(async move {
        let Ok(req) = call.decode::<SbpVersionRequest>() else {
            call.respond_failed("bad version request");
            return;
        };
        let Some((session, call)) = sbp_session(&ctx, req.session_id, call) else {
            return;
        };

        let compatible = req.vmajor == SBP_VERSION_MAJOR;
        if !compatible {
            warn!(
                session = req.session_id,
                remote_major = req.vmajor,
                local_major = SBP_VERSION_MAJOR,
                "backend speaks an incompatible SBP version"
            );
        }
        session.set_sbp_compatible(compatible);
        call.respond_success(&SbpVersionResponse { compatible });
    })
}

pub(super) fn handle_authenticate_user(
    call: IncomingCall,
    ctx: &Arc<AppContext>,
) -> BoxFuture<'static, ()> {
    let ctx = ctx.clone();
    Box::pin(async move {
        let Ok(req) = call.decode::<AuthenticateUserRequest>() else {
            call.respond_failed("bad authenticate request");
            return;
        };
        let Some((session, call)) = sbp_session(&ctx, req.session_id, call) else {
            return;
        };

        let task = TaskAuthenticateUser::new(
            req.session_id,
            req.user_name,
            req.domain,
            req.password,
            call,
        );
        session.add_task(Box::new(task));
    })
}

pub(super) fn handle_end_session(
    call: IncomingCall,
    ctx: &Arc<AppContext>,
) -> BoxFuture<'static, ()> {
    let ctx = ctx.clone();
    Box::pin(async move {
        let Ok(req) = call.decode::<EndSessionRequest>() else {
            call.respond_failed("bad end-session request");
            return;
        };
        let Some((session, call)) = sbp_session(&ctx, req.session_id, call) else {
            return;
        };

        info!(session = req.session_id, "backend requested session end");
        session.add_task(Box::new(CallTask::new("end-session", call, run_end)));
    })
}

fn run_end(call: IncomingCall, ctx: Arc<AppContext>) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let Ok(req) = call.decode::<EndSessionRequest>() else {
            call.respond_failed("bad end-session request");
            return;
        };
        let success = end_session(&ctx, req.session_id).await;
        call.respond_success(&EndSessionResponse { success });
    })
}
