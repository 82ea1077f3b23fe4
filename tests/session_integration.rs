//! Session lifecycle integration tests
//!
//! Drives the logon call path end-to-end against the in-process call
//! registry: greeter fallback, single-session takeover, reconnect,
//! executor ordering and the store invariants.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use prost::Message;
use tokio::sync::oneshot;

use wrd_session_manager::context::AppContext;
use wrd_session_manager::permission::{PERM_FLAGS_GUEST, TokenBinding};
use wrd_session_manager::properties::{PropertyLevel, PropertyValue};
use wrd_session_manager::protocol::{icp, status};
use wrd_session_manager::rpc::calls::IncomingCall;
use wrd_session_manager::rpc::envelope::RpcStatus;
use wrd_session_manager::rpc::messages::{LogonUserRequest, LogonUserResponse};
use wrd_session_manager::rpc::OutboundItem;
use wrd_session_manager::session::tasks::TaskDisconnect;
use wrd_session_manager::session::{ConnectState, NotificationReason};
use wrd_session_manager::task::Task;

use common::{harness, local_account};

async fn dispatch_logon(
    ctx: &Arc<AppContext>,
    tag: u32,
    connection_id: u32,
    user: &str,
    password: &str,
    client_host: &str,
) {
    let request = LogonUserRequest {
        connection_id,
        user_name: user.to_string(),
        domain: String::new(),
        password: password.to_string(),
        width: 1280,
        height: 800,
        color_depth: 24,
        client_host_name: client_host.to_string(),
        client_address: "10.0.0.7".to_string(),
        client_build_number: 19041,
        client_product_id: 1,
        client_hardware_id: 7,
        client_protocol_type: 2,
    };
    let call = IncomingCall::new(
        tag,
        icp::LOGON_USER,
        request.encode_to_vec().into(),
        ctx.rpc.clone(),
    );
    ctx.calls.dispatch(call, ctx).await;
}

/// Next queued response (requests like LogonInfo are skipped).
async fn wait_response(ctx: &Arc<AppContext>) -> (u32, u16, RpcStatus, Vec<u8>) {
    // larger than every internal call timeout so paused-clock
    // auto-advance resolves those first
    let deadline = Duration::from_secs(120);
    tokio::time::timeout(deadline, async {
        loop {
            for item in ctx.rpc.outgoing().drain() {
                if let OutboundItem::Response {
                    tag,
                    call_type,
                    status,
                    payload,
                    ..
                } = item
                {
                    return (tag, call_type, status, payload);
                }
            }
            ctx.rpc.outgoing().ready().await;
        }
    })
    .await
    .expect("no response within deadline")
}

#[tokio::test(start_paused = true)]
async fn failed_logon_starts_greeter_session() {
    let mut h = harness();
    let ctx = h.ctx.clone();

    dispatch_logon(&ctx, 11, 1, "alice", "", "client-1").await;
    let (tag, call_type, status, payload) = wait_response(&ctx).await;

    assert_eq!(tag, 11);
    assert_eq!(call_type, icp::LOGON_USER);
    assert_eq!(status, RpcStatus::Success);

    let response = LogonUserResponse::decode(payload.as_slice()).unwrap();
    assert!(!response.service_endpoint.is_empty());
    assert_eq!(response.ogon_cookie.len(), 50);
    assert_eq!(response.backend_cookie.len(), 50);

    let sessions = ctx.sessions.all();
    assert_eq!(sessions.len(), 1);
    let session = &sessions[0];
    assert_eq!(session.connect_state(), ConnectState::Connected);
    assert_eq!(session.module_config_name(), "Qt");
    // the attempted identity is only recorded for the greeter
    assert_eq!(session.auth_user_name(), "alice");
    assert!(session.user_name().is_empty());
    assert_eq!(session.permissions(), PERM_FLAGS_GUEST);

    let (reason, id) = h.notifications.recv().await.unwrap();
    assert_eq!(reason, NotificationReason::RemoteConnect);
    assert_eq!(id, session.id());
}

#[tokio::test(start_paused = true)]
async fn successful_logon_activates_session() {
    let mut h = harness();
    let ctx = h.ctx.clone();
    let user = local_account();

    dispatch_logon(&ctx, 21, 1, &user, "secret", "client-1").await;
    let (_, _, status, payload) = wait_response(&ctx).await;
    assert_eq!(status, RpcStatus::Success);

    let response = LogonUserResponse::decode(payload.as_slice()).unwrap();
    assert!(!response.service_endpoint.is_empty());

    let sessions = ctx.sessions.all();
    assert_eq!(sessions.len(), 1);
    let session = &sessions[0];
    assert_eq!(session.connect_state(), ConnectState::Active);
    assert_eq!(session.user_name(), user);
    assert!(session.logon_time().is_some());
    assert!(session.connect_time().is_some());

    // Connected then logged on
    let (first, _) = h.notifications.recv().await.unwrap();
    let (second, _) = h.notifications.recv().await.unwrap();
    assert_eq!(first, NotificationReason::RemoteConnect);
    assert_eq!(second, NotificationReason::SessionLogon);

    // token file exists in the scratch dir
    assert!(ctx.token_file_path(session.id()).exists());
}

#[tokio::test(start_paused = true)]
async fn single_session_policy_replaces_previous_session() {
    let h = harness();
    let ctx = h.ctx.clone();
    let user = local_account();
    ctx.properties.set(
        PropertyLevel::Global,
        "session.reconnect",
        PropertyValue::Bool(false),
    );
    ctx.properties.set(
        PropertyLevel::Global,
        "session.singleSession",
        PropertyValue::Bool(true),
    );

    dispatch_logon(&ctx, 31, 1, &user, "secret", "host-1").await;
    let (_, _, status, _) = wait_response(&ctx).await;
    assert_eq!(status, RpcStatus::Success);

    let first = ctx.sessions.all().pop().unwrap();
    let first_id = first.id();
    let first_token = first.auth_token();
    assert_eq!(
        ctx.permissions.binding(&first_token),
        Some(TokenBinding::Session(first_id))
    );

    dispatch_logon(&ctx, 32, 2, &user, "secret", "host-2").await;
    let (_, _, status, payload) = wait_response(&ctx).await;
    assert_eq!(status, RpcStatus::Success);
    let response = LogonUserResponse::decode(payload.as_slice()).unwrap();

    // the old session was logged off: store entry gone, executor
    // drained, token revoked
    assert!(ctx.sessions.get(first_id).is_none());
    tokio::time::timeout(Duration::from_secs(60), first.executor().join())
        .await
        .expect("old executor did not stop");
    assert_eq!(ctx.permissions.binding(&first_token), None);

    let sessions = ctx.sessions.all();
    assert_eq!(sessions.len(), 1);
    let second = &sessions[0];
    assert_ne!(second.id(), first_id);
    assert_eq!(second.connect_state(), ConnectState::Active);
    assert_eq!(response.service_endpoint, second.pipe_name());
}

#[tokio::test(start_paused = true)]
async fn reconnect_reuses_disconnected_session() {
    let h = harness();
    let ctx = h.ctx.clone();
    let user = local_account();
    ctx.properties.set(
        PropertyLevel::Global,
        "session.timeout",
        PropertyValue::Number(3600),
    );

    dispatch_logon(&ctx, 41, 1, &user, "secret", "host-1").await;
    let (_, _, status, _) = wait_response(&ctx).await;
    assert_eq!(status, RpcStatus::Success);
    let session = ctx.sessions.all().pop().unwrap();
    let session_id = session.id();

    let (task, done) = TaskDisconnect::for_session(session_id);
    assert!(session.add_task(Box::new(task)));
    assert_eq!(done.await.unwrap(), Some(true));
    assert_eq!(session.connect_state(), ConnectState::Disconnected);

    dispatch_logon(&ctx, 42, 2, &user, "secret", "host-2").await;
    let (_, _, status, _) = wait_response(&ctx).await;
    assert_eq!(status, RpcStatus::Success);

    // no new session was created; the old one is active again
    assert_eq!(ctx.sessions.len(), 1);
    let reused = ctx.sessions.get(session_id).expect("session kept");
    assert_eq!(reused.connect_state(), ConnectState::Active);
}

#[tokio::test(start_paused = true)]
async fn out_call_timeout_clears_pending_slot() {
    let h = harness();
    let ctx = h.ctx.clone();

    let outcome = ctx
        .rpc
        .call(icp::PING, Vec::new(), Duration::from_millis(100))
        .await;
    assert_eq!(outcome.code, status::CALL_TIMEOUT);
    assert_eq!(ctx.rpc.pending_count(), 0);
}

// ---------------------------------------------------------------------
// executor ordering and abort
// ---------------------------------------------------------------------

struct RecordTask {
    n: usize,
    log: Arc<Mutex<Vec<usize>>>,
    done: Option<oneshot::Sender<bool>>,
}

#[async_trait]
impl Task for RecordTask {
    async fn run(&mut self, _ctx: &Arc<AppContext>) {
        self.log.lock().push(self.n);
        if let Some(done) = self.done.take() {
            let _ = done.send(true);
        }
    }

    fn abort(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(false);
        }
    }

    fn label(&self) -> &'static str {
        "record"
    }
}

struct GateTask {
    gate: Option<oneshot::Receiver<()>>,
}

#[async_trait]
impl Task for GateTask {
    async fn run(&mut self, _ctx: &Arc<AppContext>) {
        if let Some(gate) = self.gate.take() {
            let _ = gate.await;
        }
    }

    fn label(&self) -> &'static str {
        "gate"
    }
}

#[tokio::test]
async fn session_executor_runs_tasks_in_fifo_order() {
    let h = harness();
    let ctx = h.ctx.clone();
    let session = ctx.sessions.create(&ctx);

    let log = Arc::new(Mutex::new(Vec::new()));
    let mut last = None;
    for n in 0..32 {
        let (tx, rx) = oneshot::channel();
        last = Some(rx);
        assert!(session.add_task(Box::new(RecordTask {
            n,
            log: log.clone(),
            done: Some(tx),
        })));
    }
    assert!(last.unwrap().await.unwrap());
    assert_eq!(*log.lock(), (0..32).collect::<Vec<_>>());
}

#[tokio::test]
async fn stopping_executor_aborts_queued_tasks() {
    let h = harness();
    let ctx = h.ctx.clone();
    let session = ctx.sessions.create(&ctx);

    let (gate_tx, gate_rx) = oneshot::channel();
    assert!(session.add_task(Box::new(GateTask {
        gate: Some(gate_rx),
    })));

    let log = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = oneshot::channel();
    assert!(session.add_task(Box::new(RecordTask {
        n: 1,
        log: log.clone(),
        done: Some(tx),
    })));

    // stop while the gate task is still running, then release it
    session.executor().request_stop();
    let _ = gate_tx.send(());

    // the queued task must be aborted, not run
    assert!(!rx.await.unwrap());
    assert!(log.lock().is_empty());

    // and nothing can be queued any more
    let (tx, rx) = oneshot::channel();
    assert!(!session.add_task(Box::new(RecordTask {
        n: 2,
        log: log.clone(),
        done: Some(tx),
    })));
    assert!(!rx.await.unwrap());
}

// ---------------------------------------------------------------------
// store invariants
// ---------------------------------------------------------------------

#[tokio::test]
async fn session_ids_and_cookies_are_unique() {
    let h = harness();
    let ctx = h.ctx.clone();

    let mut ids = HashSet::new();
    let mut cookies = HashSet::new();
    for _ in 0..40 {
        let session = ctx.sessions.create(&ctx);
        assert_ne!(session.id(), 0);
        assert!(ids.insert(session.id()), "duplicate session id");
        let (ogon, backend) = session.cookies();
        assert_eq!(ogon.len(), 50);
        assert!(cookies.insert(ogon), "duplicate cookie");
        assert!(cookies.insert(backend), "duplicate cookie");

        // token resolves back to this session while it is live
        assert_eq!(
            ctx.permissions.binding(&session.auth_token()),
            Some(TokenBinding::Session(session.id()))
        );
    }
}

#[tokio::test]
async fn removed_session_loses_its_token() {
    let h = harness();
    let ctx = h.ctx.clone();

    let session = ctx.sessions.create(&ctx);
    let token = session.auth_token();
    ctx.sessions.remove(session.id());

    // the shutdown task unregisters the token and stops the executor
    tokio::time::timeout(Duration::from_secs(5), session.executor().join())
        .await
        .expect("executor did not stop");
    assert_eq!(ctx.permissions.binding(&token), None);
    assert!(!ctx.token_file_path(session.id()).exists());
}

#[tokio::test]
async fn reconnect_candidate_selection_is_deterministic() {
    let h = harness();
    let ctx = h.ctx.clone();

    let mut ids = Vec::new();
    for _ in 0..3 {
        let session = ctx.sessions.create(&ctx);
        session.set_user_name("bob");
        session.set_domain("");
        session.set_client_host_name("host-1");
        ids.push(session.id());
    }
    // all disconnected
    for id in &ids {
        let session = ctx.sessions.get(*id).unwrap();
        session.set_connect_state(&ctx, ConnectState::Connected).await;
        session.set_connect_state(&ctx, ConnectState::Active).await;
        session
            .set_connect_state(&ctx, ConnectState::Disconnected)
            .await;
    }

    let picked = ctx
        .sessions
        .first_disconnected_session("bob", "", None)
        .expect("candidate");
    assert_eq!(picked.id(), *ids.iter().min().unwrap());
    assert_eq!(picked.connect_state(), ConnectState::ConnectQuery);
}

#[tokio::test(start_paused = true)]
async fn state_machine_emits_expected_notifications() {
    let mut h = harness();
    let ctx = h.ctx.clone();
    let session = ctx.sessions.create(&ctx);

    session.set_connect_state(&ctx, ConnectState::Connected).await;
    session.set_connect_state(&ctx, ConnectState::Active).await;
    session
        .set_connect_state(&ctx, ConnectState::Disconnected)
        .await;
    session.set_connect_state(&ctx, ConnectState::Down).await;

    let mut reasons = Vec::new();
    while let Ok((reason, _)) = h.notifications.try_recv() {
        reasons.push(reason);
    }
    assert_eq!(
        reasons,
        vec![
            NotificationReason::RemoteConnect,
            NotificationReason::SessionLogon,
            NotificationReason::RemoteDisconnect,
            NotificationReason::SessionLogoff,
        ]
    );
    assert!(session.connect_time().is_some());
    assert!(session.disconnect_time().is_some());
    assert!(session.logon_time().is_some());
}

#[tokio::test]
async fn connection_scope_properties_resolve_client_information() {
    let h = harness();
    let ctx = h.ctx.clone();

    let session = ctx.sessions.create(&ctx);
    let connection = ctx.connections.get_or_create(9);
    connection.bind_session(session.id());
    connection.update_client_information(|client| {
        client.width = 1920;
        client.height = 1080;
        client.color_depth = 32;
        client.initial_width = 2560;
        client.initial_height = 1440;
    });

    assert_eq!(
        ctx.property_number(session.id(), "current.connection.XRES"),
        Some(1920)
    );
    assert_eq!(
        ctx.property_number(session.id(), "current.connection.COLORDEPTH"),
        Some(32)
    );
    assert_eq!(
        ctx.property_number(session.id(), "current.connection.INITIALYRES"),
        Some(1440)
    );
    // unknown synthetic field is a miss
    assert_eq!(
        ctx.property_number(session.id(), "current.connection.REFRESH"),
        None
    );
}
