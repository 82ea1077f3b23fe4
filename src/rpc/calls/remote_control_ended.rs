//! Shadowing ended notification
//!
//! The front end reports that remote control stopped (hotkey or
//! channel teardown). The shadowing session returns to Active and is
//! removed from the target's shadowed-by list.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use crate::context::AppContext;
use crate::rpc::calls::{route_via_connection, IncomingCall};
use crate::rpc::messages::{RemoteControlEndedRequest, RemoteControlEndedResponse};

pub(super) fn handle(call: IncomingCall, ctx: &Arc<AppContext>) -> BoxFuture<'static, ()> {
    let ctx = ctx.clone();
    Box::pin(async move {
        let Ok(req) = call.decode::<RemoteControlEndedRequest>() else {
            call.respond_failed("bad remote-control-ended request");
            return;
        };
        route_via_connection(&ctx, req.connection_id, "remote-control-ended", call, run);
    })
}

fn run(call: IncomingCall, ctx: Arc<AppContext>) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let Ok(req) = call.decode::<RemoteControlEndedRequest>() else {
            call.respond_failed("bad remote-control-ended request");
            return;
        };

        let shadow_session_id = ctx
            .connections
            .get(req.connection_id)
            .map(|c| c.session_id())
            .unwrap_or(0);
        let Some(shadow) = ctx.sessions.get(shadow_session_id) else {
            call.respond_success(&RemoteControlEndedResponse { success: false });
            return;
        };

        let success = shadow.stop_remote_control(&ctx).await;

        let target_session_id = ctx
            .connections
            .get(req.target_connection_id)
            .map(|c| c.session_id())
            .unwrap_or(0);
        if let Some(target) = ctx.sessions.get(target_session_id) {
            target.remove_shadowed_by(shadow_session_id);
        } else {
            debug!(
                connection = req.target_connection_id,
                "no target session for ended remote control"
            );
        }

        call.respond_success(&RemoteControlEndedResponse { success });
    })
}
