//! Front-end initiated disconnect

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::context::AppContext;
use crate::rpc::calls::{route_via_connection, IncomingCall};
use crate::rpc::messages::{DisconnectUserSessionRequest, DisconnectUserSessionResponse};
use crate::session::tasks::disconnect_connection;

pub(super) fn handle(call: IncomingCall, ctx: &Arc<AppContext>) -> BoxFuture<'static, ()> {
    let ctx = ctx.clone();
    Box::pin(async move {
        let Ok(req) = call.decode::<DisconnectUserSessionRequest>() else {
            call.respond_failed("bad disconnect request");
            return;
        };
        route_via_connection(&ctx, req.connection_id, "disconnect-user-session", call, run);
    })
}

fn run(call: IncomingCall, ctx: Arc<AppContext>) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let Ok(req) = call.decode::<DisconnectUserSessionRequest>() else {
            call.respond_failed("bad disconnect request");
            return;
        };
        let disconnected = disconnect_connection(&ctx, req.connection_id)
            .await
            .unwrap_or(false);
        call.respond_success(&DisconnectUserSessionResponse { disconnected });
    })
}
