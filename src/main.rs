//! wrd-session-manager
//!
//! Entry point for the session manager daemon.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wrd_session_manager::config::Config;
use wrd_session_manager::context::AppContext;
use wrd_session_manager::module::auth::{StaticAuthModule, SystemAuthModule};
use wrd_session_manager::module::exec::{ExecModule, NullModule};
use wrd_session_manager::otsapi::OtsApiServer;
use wrd_session_manager::rpc::RpcEngine;
use wrd_session_manager::session::LogNotifier;

/// Command-line arguments for wrd-session-manager
#[derive(Parser, Debug)]
#[command(name = "wrd-session-manager")]
#[command(version, about = "Remote desktop services session manager", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(
        short,
        long,
        env = "WRD_SESSION_MANAGER_CONFIG",
        default_value = "/etc/wrd-session-manager/config.toml"
    )]
    pub config: String,

    /// Verbose logging (can be specified multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log format (json|pretty|compact)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!(
        "Starting wrd-session-manager v{} ({} {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_DATE")
    );

    let config = Config::load(&args.config).unwrap_or_else(|err| {
        warn!("Failed to load config: {}, using defaults", err);
        Config::default_config()
    });

    let ctx = AppContext::new(
        Box::new(LogNotifier),
        config.manager.scratch_dir.clone(),
        config.manager.pipe_dir.clone(),
    );
    config.apply_to(&ctx.properties);
    ctx.permissions.reload_group_policy(&ctx.properties);
    register_modules(&ctx);

    ctx.global_executor.start(ctx.clone());
    ctx.monitor.start(ctx.clone());

    let engine = RpcEngine::start(ctx.clone())?;
    let otsapi = OtsApiServer::start(ctx.clone())?;

    info!("session manager up");
    wait_for_shutdown_signal().await;
    info!("shutdown signal received");

    engine.stop(&ctx).await;
    otsapi.stop().await;
    ctx.shutdown_all_sessions().await;
    ctx.global_executor.stop().await;
    ctx.monitor.stop().await;
    ctx.modules.shutdown();

    info!("session manager stopped");
    Ok(())
}

fn register_modules(ctx: &Arc<AppContext>) {
    ctx.modules.register_backend(Arc::new(NullModule::new()));
    ctx.modules.register_backend(Arc::new(ExecModule::new("exec")));

    ctx.modules.register_auth(Arc::new(SystemAuthModule));
    if let Some(spec) = ctx.properties.get_string(None, "auth.static.users") {
        warn!("static auth module enabled, do not use in production");
        ctx.modules
            .register_auth(Arc::new(StaticAuthModule::from_spec(&spec)));
    }
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            warn!(%err, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

fn init_logging(args: &Args) -> Result<()> {
    let log_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("wrd_session_manager={},warn", log_level))
    });

    match args.log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        "compact" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().compact())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}
