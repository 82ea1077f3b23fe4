//! RPC engine integration tests
//!
//! Runs the engine on a real socket with an in-test front end on the
//! other side: version handshake, request dispatch, out-call
//! correlation, SBP gating and the transport-reset cascade.

mod common;

use std::sync::Arc;
use std::time::Duration;

use prost::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use wrd_session_manager::context::AppContext;
use wrd_session_manager::permission::PERM_VIRTUAL_CHANNEL;
use wrd_session_manager::properties::{PropertyLevel, PropertyValue};
use wrd_session_manager::protocol::{
    icp, sbp, status, PROTOCOL_VERSION_MAJOR, SESSION_MANAGER_PIPE,
};
use wrd_session_manager::otsapi::{OtsApiHandler, OtsRequest, OtsResponse};
use wrd_session_manager::rpc::envelope::{Framer, RpcEnvelope, RpcStatus, VersionInfo};
use wrd_session_manager::rpc::messages::{
    AuthenticateUserRequest, AuthenticateUserResponse, PingRequest, PingResponse,
    SbpVersionRequest, SbpVersionResponse, SwitchToResponse, VirtualChannelCloseResponse,
    VirtualChannelOpenResponse,
};
use wrd_session_manager::rpc::RpcEngine;
use wrd_session_manager::session::ConnectState;

use common::harness;

struct FrontEnd {
    stream: UnixStream,
    framer: Framer,
    next_tag: u32,
}

impl FrontEnd {
    async fn connect(ctx: &Arc<AppContext>) -> Self {
        let path = ctx.pipe_path(SESSION_MANAGER_PIPE);
        let stream = UnixStream::connect(path).await.expect("connect to engine");
        Self {
            stream,
            framer: Framer::new(),
            next_tag: 100,
        }
    }

    async fn send(&mut self, env: &RpcEnvelope) {
        self.stream
            .write_all(&env.to_frame())
            .await
            .expect("write frame");
    }

    /// Read one envelope; `None` on EOF.
    async fn read(&mut self) -> Option<RpcEnvelope> {
        let mut buffer = [0u8; 4096];
        loop {
            if let Some(body) = self.framer.next_frame().expect("framing") {
                return Some(RpcEnvelope::decode_body(&body).expect("envelope"));
            }
            match self.stream.read(&mut buffer).await {
                Ok(0) => return None,
                Ok(n) => self.framer.extend(&buffer[..n]),
                Err(_) => return None,
            }
        }
    }

    async fn handshake(&mut self, vmajor: u32) -> RpcEnvelope {
        self.send(&RpcEnvelope {
            tag: 1,
            msgtype: 0,
            isresponse: false,
            status: RpcStatus::Success as i32,
            payload: None,
            errordescription: None,
            versioninfo: Some(VersionInfo { vmajor, vminor: 0 }),
        })
        .await;
        self.read().await.expect("version reply")
    }

    async fn request<M: Message>(&mut self, msgtype: u16, payload: &M) -> u32 {
        self.next_tag += 1;
        let tag = self.next_tag;
        self.send(&RpcEnvelope {
            tag,
            msgtype: msgtype as u32,
            isresponse: false,
            status: RpcStatus::Success as i32,
            payload: Some(payload.encode_to_vec()),
            errordescription: None,
            versioninfo: None,
        })
        .await;
        tag
    }

    async fn respond<M: Message>(&mut self, tag: u32, msgtype: u32, payload: &M) {
        self.send(&RpcEnvelope {
            tag,
            msgtype,
            isresponse: true,
            status: RpcStatus::Success as i32,
            payload: Some(payload.encode_to_vec()),
            errordescription: None,
            versioninfo: None,
        })
        .await;
    }
}

#[tokio::test]
async fn version_handshake_then_ping() {
    let h = harness();
    let ctx = h.ctx.clone();
    let engine = RpcEngine::start(ctx.clone()).unwrap();

    let mut fe = FrontEnd::connect(&ctx).await;
    let reply = fe.handshake(PROTOCOL_VERSION_MAJOR).await;
    assert!(reply.isresponse);
    assert_eq!(reply.versioninfo.unwrap().vmajor, PROTOCOL_VERSION_MAJOR);

    let tag = fe.request(icp::PING, &PingRequest {}).await;
    let response = fe.read().await.expect("ping response");
    assert_eq!(response.tag, tag);
    assert!(response.isresponse);
    assert_eq!(response.status(), RpcStatus::Success);
    let pong = PingResponse::decode(response.payload.unwrap().as_slice()).unwrap();
    assert!(pong.pong);

    engine.stop(&ctx).await;
}

#[tokio::test]
async fn version_mismatch_gets_one_reply_then_close() {
    let h = harness();
    let ctx = h.ctx.clone();
    let engine = RpcEngine::start(ctx.clone()).unwrap();

    let mut fe = FrontEnd::connect(&ctx).await;
    let reply = fe.handshake(PROTOCOL_VERSION_MAJOR + 5).await;
    assert_eq!(reply.versioninfo.unwrap().vmajor, PROTOCOL_VERSION_MAJOR);

    // nothing after the single version reply; the pipe is closed
    assert!(fe.read().await.is_none());

    engine.stop(&ctx).await;
}

#[tokio::test]
async fn unknown_call_type_answers_not_found() {
    let h = harness();
    let ctx = h.ctx.clone();
    let engine = RpcEngine::start(ctx.clone()).unwrap();

    let mut fe = FrontEnd::connect(&ctx).await;
    fe.handshake(PROTOCOL_VERSION_MAJOR).await;

    let tag = fe.request(999, &PingRequest {}).await;
    let response = fe.read().await.expect("response");
    assert_eq!(response.tag, tag);
    assert_eq!(response.status(), RpcStatus::NotFound);

    engine.stop(&ctx).await;
}

#[tokio::test]
async fn out_call_is_correlated_by_tag() {
    let h = harness();
    let ctx = h.ctx.clone();
    let engine = RpcEngine::start(ctx.clone()).unwrap();

    let mut fe = FrontEnd::connect(&ctx).await;
    fe.handshake(PROTOCOL_VERSION_MAJOR).await;

    let call_ctx = ctx.clone();
    let caller = tokio::spawn(async move {
        call_ctx
            .rpc
            .call(icp::SWITCH_TO, Vec::new(), Duration::from_secs(5))
            .await
    });

    let request = fe.read().await.expect("outgoing request");
    assert!(!request.isresponse);
    assert_eq!(request.msgtype, icp::SWITCH_TO as u32);

    fe.respond(request.tag, request.msgtype, &SwitchToResponse { success: true })
        .await;

    let outcome = caller.await.unwrap();
    assert!(outcome.is_success());
    let decoded: SwitchToResponse = outcome.decode().unwrap();
    assert!(decoded.success);
    assert_eq!(ctx.rpc.pending_count(), 0);

    engine.stop(&ctx).await;
}

#[tokio::test]
async fn transport_reset_cascades() {
    let h = harness();
    let ctx = h.ctx.clone();
    let engine = RpcEngine::start(ctx.clone()).unwrap();

    let mut fe = FrontEnd::connect(&ctx).await;
    fe.handshake(PROTOCOL_VERSION_MAJOR).await;

    // populate connection store and an abandoned greeter session
    ctx.connections.get_or_create(1);
    ctx.connections.get_or_create(2);
    let greeter = ctx.sessions.create(&ctx);
    greeter
        .set_connect_state(&ctx, ConnectState::Connected)
        .await;

    // several in-flight out-calls
    let mut callers = Vec::new();
    for _ in 0..5 {
        let call_ctx = ctx.clone();
        callers.push(tokio::spawn(async move {
            call_ctx
                .rpc
                .call(icp::MESSAGE, Vec::new(), Duration::from_secs(30))
                .await
        }));
    }
    for _ in 0..5 {
        let request = fe.read().await.expect("request");
        assert!(!request.isresponse);
    }

    // peer drops abruptly
    drop(fe);

    for caller in callers {
        let outcome = caller.await.unwrap();
        assert_eq!(outcome.code, status::TRANSPORT_ERROR);
    }
    assert_eq!(ctx.rpc.pending_count(), 0);

    // connection store wiped, greeter session reaped
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if ctx.connections.is_empty() && ctx.sessions.get(greeter.id()).is_none() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "reset did not cascade"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    engine.stop(&ctx).await;
}

#[tokio::test]
async fn sbp_calls_are_gated_on_version_compatibility() {
    let h = harness();
    let ctx = h.ctx.clone();
    let engine = RpcEngine::start(ctx.clone()).unwrap();

    let mut fe = FrontEnd::connect(&ctx).await;
    fe.handshake(PROTOCOL_VERSION_MAJOR).await;

    let session = ctx.sessions.create(&ctx);

    // before the version exchange every SBP call is rejected
    let tag = fe
        .request(
            sbp::AUTHENTICATE_USER,
            &AuthenticateUserRequest {
                session_id: session.id(),
                user_name: "alice".into(),
                domain: String::new(),
                password: "secret".into(),
            },
        )
        .await;
    let rejected = fe.read().await.expect("response");
    assert_eq!(rejected.tag, tag);
    assert_eq!(rejected.status(), RpcStatus::Failed);

    // negotiate
    let tag = fe
        .request(
            sbp::VERSION,
            &SbpVersionRequest {
                session_id: session.id(),
                vmajor: 1,
                vminor: 0,
            },
        )
        .await;
    let reply = fe.read().await.expect("version response");
    assert_eq!(reply.tag, tag);
    let decoded = SbpVersionResponse::decode(reply.payload.unwrap().as_slice()).unwrap();
    assert!(decoded.compatible);
    assert!(session.is_sbp_compatible());

    // now the call is dispatched; the session is no greeter, so the
    // re-auth reports a wrong session state instead of a rejection
    let tag = fe
        .request(
            sbp::AUTHENTICATE_USER,
            &AuthenticateUserRequest {
                session_id: session.id(),
                user_name: "alice".into(),
                domain: String::new(),
                password: "secret".into(),
            },
        )
        .await;
    let response = fe.read().await.expect("auth response");
    assert_eq!(response.tag, tag);
    assert_eq!(response.status(), RpcStatus::Success);
    let decoded = AuthenticateUserResponse::decode(response.payload.unwrap().as_slice()).unwrap();
    assert_ne!(decoded.auth_status, 0);

    engine.stop(&ctx).await;
}

#[tokio::test]
async fn virtual_channel_open_and_close() {
    let h = harness();
    let ctx = h.ctx.clone();
    ctx.properties.set(
        PropertyLevel::Global,
        "virtualChannel.whiteList",
        PropertyValue::Text("cliprdr".into()),
    );
    let engine = RpcEngine::start(ctx.clone()).unwrap();

    let mut fe = FrontEnd::connect(&ctx).await;
    fe.handshake(PROTOCOL_VERSION_MAJOR).await;

    let session = ctx.sessions.create(&ctx);
    session.set_user_name("alice");
    let connection = ctx.connections.get_or_create(4);
    connection.bind_session(session.id());

    let token = ctx
        .permissions
        .register_logon("alice", "", PERM_VIRTUAL_CHANNEL);

    // front end side: answer channel requests
    let responder = tokio::spawn(async move {
        while let Some(request) = fe.read().await {
            match request.msgtype as u16 {
                icp::OTSAPI_VIRTUAL_CHANNEL_OPEN => {
                    fe.respond(
                        request.tag,
                        request.msgtype,
                        &VirtualChannelOpenResponse {
                            pipe_name: "\\\\.\\pipe\\ogon_cliprdr_4".into(),
                            instance: 1,
                        },
                    )
                    .await;
                }
                icp::OTSAPI_VIRTUAL_CHANNEL_CLOSE => {
                    fe.respond(
                        request.tag,
                        request.msgtype,
                        &VirtualChannelCloseResponse { success: true },
                    )
                    .await;
                }
                other => panic!("unexpected request type {}", other),
            }
        }
    });

    let handler = OtsApiHandler::new(ctx.clone());

    let response = handler
        .handle(OtsRequest::VirtualChannelOpen {
            token: token.clone(),
            session_id: session.id(),
            virtual_name: "cliprdr".into(),
            dynamic: false,
            flags: 0,
        })
        .await;
    match response {
        OtsResponse::Channel {
            pipe_name,
            instance,
        } => {
            assert!(!pipe_name.is_empty());
            assert_eq!(instance, 1);
        }
        other => panic!("unexpected response: {:?}", other),
    }

    // a channel outside the whitelist never reaches the front end
    let response = handler
        .handle(OtsRequest::VirtualChannelOpen {
            token: token.clone(),
            session_id: session.id(),
            virtual_name: "rdpsnd".into(),
            dynamic: false,
            flags: 0,
        })
        .await;
    match response {
        OtsResponse::Channel {
            pipe_name,
            instance,
        } => {
            assert!(pipe_name.is_empty());
            assert_eq!(instance, 0);
        }
        other => panic!("unexpected response: {:?}", other),
    }

    let response = handler
        .handle(OtsRequest::VirtualChannelClose {
            token,
            session_id: session.id(),
            virtual_name: "cliprdr".into(),
            instance: 1,
        })
        .await;
    match response {
        OtsResponse::Done { success } => assert!(success),
        other => panic!("unexpected response: {:?}", other),
    }

    engine.stop(&ctx).await;
    responder.abort();
}
