//! Shared fixtures for the integration tests
#![allow(dead_code)]

use std::sync::Arc;

use tempfile::TempDir;

use wrd_session_manager::context::AppContext;
use wrd_session_manager::module::auth::StaticAuthModule;
use wrd_session_manager::module::exec::{ExecModule, NullModule};
use wrd_session_manager::properties::{PropertyLevel, PropertyValue};
use wrd_session_manager::session::notifier::{ChannelNotifier, SessionNotifier};
use wrd_session_manager::session::NotificationReason;

pub struct TestHarness {
    pub ctx: Arc<AppContext>,
    pub notifications: tokio::sync::mpsc::UnboundedReceiver<(NotificationReason, u32)>,
    // keeps the scratch/pipe directories alive for the test's duration
    _dirs: (TempDir, TempDir),
}

/// Name of an account that exists on the machine running the tests.
pub fn local_account() -> String {
    uzers::get_current_username()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "root".to_string())
}

/// Context with the null backend wired up as both user backend and
/// greeter, a static auth table (alice/secret, bob/fish, plus the
/// local account) and an open group policy.
pub fn harness() -> TestHarness {
    let scratch = TempDir::new().expect("scratch dir");
    let pipes = TempDir::new().expect("pipe dir");

    let (notifier, notifications) = ChannelNotifier::new();
    let ctx = AppContext::new(
        Box::new(notifier) as Box<dyn SessionNotifier>,
        scratch.path(),
        pipes.path(),
    );

    for (path, value) in [
        ("auth.module", PropertyValue::Text("static".into())),
        ("auth.greeter", PropertyValue::Text("Qt".into())),
        ("module", PropertyValue::Text("X11".into())),
        ("module.X11.modulename", PropertyValue::Text("null".into())),
        ("module.X11.uselauncher", PropertyValue::Bool(false)),
        ("module.Qt.modulename", PropertyValue::Text("null".into())),
        ("module.Qt.uselauncher", PropertyValue::Bool(false)),
        (
            "permission.groups.whiteList",
            PropertyValue::Text("*".into()),
        ),
    ] {
        ctx.properties.set(PropertyLevel::Global, path, value);
    }
    ctx.permissions.reload_group_policy(&ctx.properties);

    ctx.modules.register_backend(Arc::new(NullModule::new()));
    ctx.modules.register_backend(Arc::new(ExecModule::new("exec")));

    let auth = StaticAuthModule::new();
    auth.add_user("alice", "secret");
    auth.add_user("bob", "fish");
    // a real account is needed where the logon path resolves the unix
    // identity of the session user
    auth.add_user(&local_account(), "secret");
    ctx.modules.register_auth(Arc::new(auth));

    TestHarness {
        ctx,
        notifications,
        _dirs: (scratch, pipes),
    }
}
