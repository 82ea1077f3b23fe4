//! Process monitor integration test
//!
//! Spawns a real backend process through the exec module and checks
//! that its death ends the session exactly once, and that a replaced
//! module context produces no end-task.

mod common;

use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use wrd_session_manager::properties::{PropertyLevel, PropertyValue};
use wrd_session_manager::session::ConnectState;

use common::harness;

#[tokio::test]
async fn backend_exit_ends_the_session() {
    let h = harness();
    let ctx = h.ctx.clone();

    // exec-backed module config
    ctx.properties.set(
        PropertyLevel::Global,
        "module.SLEEP.modulename",
        PropertyValue::Text("exec".into()),
    );
    ctx.properties.set(
        PropertyLevel::Global,
        "module.SLEEP.uselauncher",
        PropertyValue::Bool(false),
    );
    ctx.properties.set(
        PropertyLevel::Global,
        "module.SLEEP.command",
        PropertyValue::Text("/bin/sleep 600".into()),
    );

    let session = ctx.sessions.create(&ctx);
    session.set_module_config_name("SLEEP");
    let connection = ctx.connections.get_or_create(1);
    connection.bind_session(session.id());
    connection.update_client_information(|client| {
        client.color_depth = 24;
    });

    let pipe = session.start_module(&ctx).await.expect("module start");
    assert!(!pipe.is_empty());
    assert_eq!(ctx.monitor.watched_count(), 1);
    session
        .set_connect_state(&ctx, ConnectState::Connected)
        .await;

    // the client is gone by the time the backend dies
    ctx.connections.remove(1);

    ctx.monitor.start(ctx.clone());

    let token = session.auth_token();
    let pid = ctx.monitor.watched_pids()[0];
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();

    // the monitor reaps the child and queues exactly one end-task
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while ctx.sessions.get(session.id()).is_some() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "session was not ended"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // teardown unregistered the token as well
    tokio::time::timeout(Duration::from_secs(5), session.executor().join())
        .await
        .expect("executor did not stop");
    assert!(ctx.permissions.binding(&token).is_none());
    assert_eq!(ctx.monitor.watched_count(), 0);

    ctx.monitor.stop().await;
}

#[tokio::test]
async fn replaced_module_context_produces_no_end_task() {
    let h = harness();
    let ctx = h.ctx.clone();

    let session = ctx.sessions.create(&ctx);

    // a watched pid whose context is NOT the current module
    ctx.monitor.add_process(spawn_short_child(), session.id(), true, 9999);
    ctx.monitor.start(ctx.clone());

    tokio::time::sleep(Duration::from_millis(800)).await;

    // record reaped, session untouched
    assert_eq!(ctx.monitor.watched_count(), 0);
    assert!(ctx.sessions.get(session.id()).is_some());

    ctx.monitor.stop().await;
}

fn spawn_short_child() -> u32 {
    let child = std::process::Command::new("/bin/sleep")
        .arg("0.1")
        .spawn()
        .expect("spawn sleep");
    child.id()
}
