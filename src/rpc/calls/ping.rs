//! Ping

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::trace;

use crate::context::AppContext;
use crate::rpc::calls::IncomingCall;
use crate::rpc::messages::PingResponse;

pub(super) fn handle(call: IncomingCall, _ctx: &Arc<AppContext>) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        trace!(tag = call.tag, "ping");
        call.respond_success(&PingResponse { pong: true });
    })
}
