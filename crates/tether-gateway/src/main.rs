//! tether-gateway — control-plane ingress daemon.
//!
//! Boots the in-process declarative store with admission installed,
//! starts the session and policy reconcilers on their work queues, wires
//! the notification dispatcher, and serves the HTTP surfaces (webhooks,
//! read API, runner callbacks, health, metrics) on one listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use tether_core::notify::Dispatcher;
use tether_core::reconcile::{
    spawn_workers, PolicyReconciler, PolicyReconcilerConfig, SessionReconciler,
    SessionReconcilerConfig, WorkQueue,
};
use tether_core::workload::CallbackTokenIssuer;

use tether_gateway::notify_http::HttpSink;
use tether_gateway::state::InProcess;
use tether_gateway::webhook::factory::FactoryConfig;

/// tether control-plane gateway.
#[derive(Parser, Debug)]
#[command(name = "tether-gateway")]
#[command(version, about, long_about = None)]
struct Args {
    /// Listen address for all HTTP surfaces.
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Base URL runners use to reach the callback surface.
    #[arg(long, default_value = "http://tether-gateway.tether-system:8080")]
    callback_base_url: String,

    /// Default framework type for webhook-triggered sessions.
    #[arg(long, default_value = "claude-code")]
    default_framework: String,

    /// Default framework version tag.
    #[arg(long, default_value = "latest")]
    default_framework_version: String,

    /// Session reconciler worker count.
    #[arg(long, default_value = "8")]
    session_workers: usize,

    /// Policy reconciler worker count.
    #[arg(long, default_value = "2")]
    policy_workers: usize,

    /// Policy reconciler tick interval in seconds.
    #[arg(long, default_value = "60")]
    policy_tick_secs: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(listen = %args.listen, "starting tether-gateway");

    let in_process = InProcess::build(FactoryConfig {
        default_framework_type: args.default_framework.clone(),
        default_framework_version: args.default_framework_version.clone(),
        default_artifact_storage: None,
    });
    let state = in_process.state.clone();

    // Notification dispatcher: outbox -> tenant sinks, off the reconcile
    // path.
    let sink = Arc::new(HttpSink::new().context("notification sink init")?);
    let dispatcher_handle =
        Dispatcher::new(Arc::clone(&state.policies), sink).spawn(in_process.outbox_rx);

    // Session controller.
    let session_queue = WorkQueue::new();
    let session_reconciler = Arc::new(SessionReconciler::new(
        Arc::clone(&state.sessions),
        Arc::clone(&state.policies),
        Arc::clone(&state.registry),
        Arc::clone(&state.orchestrator),
        Arc::clone(&state.callback_tokens) as Arc<dyn CallbackTokenIssuer>,
        state.outbox.clone(),
        Arc::clone(&state.audit),
        SessionReconcilerConfig {
            callback_base_url: args.callback_base_url.clone(),
            ..SessionReconcilerConfig::default()
        },
    ));
    let session_watch = session_reconciler.spawn_watch(&session_queue);
    let session_workers = spawn_workers(
        session_reconciler,
        Arc::clone(&session_queue),
        args.session_workers,
    );

    // Policy controller.
    let policy_queue = WorkQueue::new();
    let policy_reconciler = Arc::new(PolicyReconciler::new(
        Arc::clone(&state.sessions),
        Arc::clone(&state.policies),
        Arc::clone(&state.audit),
        state.outbox.clone(),
        PolicyReconcilerConfig {
            tick_interval: Duration::from_secs(args.policy_tick_secs),
        },
    ));
    let policy_watch = policy_reconciler.spawn_watch(&policy_queue);
    let policy_workers = spawn_workers(
        policy_reconciler,
        Arc::clone(&policy_queue),
        args.policy_workers,
    );

    let app = tether_gateway::app(state);
    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    info!(addr = %args.listen, "http surfaces listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;

    // Drain reconcile work before exit: workers finish their in-flight
    // pass, then stop.
    info!("shutting down reconcilers");
    session_queue.close();
    policy_queue.close();
    for handle in session_workers.into_iter().chain(policy_workers) {
        let _ = handle.await;
    }
    session_watch.abort();
    policy_watch.abort();
    dispatcher_handle.abort();

    info!("tether-gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
            unreachable!();
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
            unreachable!();
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
}
