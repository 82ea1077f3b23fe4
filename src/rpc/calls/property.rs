//! Property queries from the front end
//!
//! Each request names a connection; values are resolved in the scope of
//! the session bound to it (which also enables the synthetic
//! `CURRENT.CONNECTION.` paths).

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::context::AppContext;
use crate::rpc::calls::IncomingCall;
use crate::rpc::messages::{
    property_kind, PropertyBoolResponse, PropertyBulkRequest, PropertyBulkResponse,
    PropertyBulkValue, PropertyNumberResponse, PropertyRequest, PropertyStringResponse,
};

fn session_for_connection(ctx: &Arc<AppContext>, connection_id: u32) -> u32 {
    ctx.connections
        .get(connection_id)
        .map(|c| c.session_id())
        .unwrap_or(0)
}

pub(super) fn handle_bool(call: IncomingCall, ctx: &Arc<AppContext>) -> BoxFuture<'static, ()> {
    let ctx = ctx.clone();
    Box::pin(async move {
        let Ok(req) = call.decode::<PropertyRequest>() else {
            call.respond_failed("bad property request");
            return;
        };
        let session_id = session_for_connection(&ctx, req.connection_id);
        let value = ctx.property_bool(session_id, &req.path);
        call.respond_success(&PropertyBoolResponse {
            success: value.is_some(),
            value: value.unwrap_or(false),
        });
    })
}

pub(super) fn handle_number(call: IncomingCall, ctx: &Arc<AppContext>) -> BoxFuture<'static, ()> {
    let ctx = ctx.clone();
    Box::pin(async move {
        let Ok(req) = call.decode::<PropertyRequest>() else {
            call.respond_failed("bad property request");
            return;
        };
        let session_id = session_for_connection(&ctx, req.connection_id);
        let value = ctx.property_number(session_id, &req.path);
        call.respond_success(&PropertyNumberResponse {
            success: value.is_some(),
            value: value.unwrap_or(0),
        });
    })
}

pub(super) fn handle_string(call: IncomingCall, ctx: &Arc<AppContext>) -> BoxFuture<'static, ()> {
    let ctx = ctx.clone();
    Box::pin(async move {
        let Ok(req) = call.decode::<PropertyRequest>() else {
            call.respond_failed("bad property request");
            return;
        };
        let session_id = session_for_connection(&ctx, req.connection_id);
        let value = ctx.property_string(session_id, &req.path);
        call.respond_success(&PropertyStringResponse {
            success: value.is_some(),
            value: value.unwrap_or_default(),
        });
    })
}

pub(super) fn handle_bulk(call: IncomingCall, ctx: &Arc<AppContext>) -> BoxFuture<'static, ()> {
    let ctx = ctx.clone();
    Box::pin(async move {
        let Ok(req) = call.decode::<PropertyBulkRequest>() else {
            call.respond_failed("bad property request");
            return;
        };
        let session_id = session_for_connection(&ctx, req.connection_id);

        let results = req
            .properties
            .iter()
            .map(|entry| {
                let mut result = PropertyBulkValue::default();
                match entry.kind {
                    property_kind::BOOL => {
                        if let Some(value) = ctx.property_bool(session_id, &entry.path) {
                            result.success = true;
                            result.bool_value = value;
                        }
                    }
                    property_kind::NUMBER => {
                        if let Some(value) = ctx.property_number(session_id, &entry.path) {
                            result.success = true;
                            result.number_value = value;
                        }
                    }
                    property_kind::STRING => {
                        if let Some(value) = ctx.property_string(session_id, &entry.path) {
                            result.success = true;
                            result.string_value = value;
                        }
                    }
                    _ => {}
                }
                result
            })
            .collect();

        call.respond_success(&PropertyBulkResponse { results });
    })
}
