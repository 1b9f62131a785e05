//! Autotune API - Autonomous Configuration Optimizer
//!
//! Turns analyzer signals into reviewable configuration proposals and applies
//! them safely.
//!
//! PIPELINE:
//! - Proposal factory: classifies signals, dedups, bounds the pending queue
//! - Auto-approval gate: rule predicates with hourly quotas
//! - Approval queue: approve / reject / defer with expiry
//! - Apply engine: backup, validate, atomic write, rollback deadline
//! - Rollback monitor: reverts unconfirmed updates past their deadline

mod approval;
mod audit;
mod backup;
mod clock;
mod config;
mod controller;
mod engine;
mod error;
mod fsutil;
mod models;
mod monitor;
mod proposal;
mod routes;
mod state;
#[cfg(test)]
mod testing;

use crate::clock::SystemClock;
use crate::config::{ControllerConfig, Settings};
use crate::controller::Controller;
use crate::monitor::spawn_background_tasks;
use crate::proposal::{InboxSignalSource, SignalSource};
use crate::routes::create_router;
use crate::state::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber for structured logging
    init_tracing();

    info!("🚀 Starting Autotune - Autonomous Configuration Optimizer...");

    // Load configuration
    let settings = Settings::load()?;
    let controller_config = ControllerConfig::load_or_init(&settings.paths.controller_config())?;
    info!("📋 Configuration loaded successfully");

    let controller = Arc::new(
        Controller::open(controller_config, &settings.paths, Arc::new(SystemClock)).await?,
    );
    info!("✅ Controller initialized (data in {})", settings.paths.data_dir.display());

    // Background loops share the controller with the HTTP layer
    let source = settings.paths.signal_inbox.clone().map(|dir| {
        info!("📥 Watching signal inbox {}", dir.display());
        Arc::new(InboxSignalSource::new(dir)) as Arc<dyn SignalSource>
    });
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let tasks = spawn_background_tasks(controller.clone(), source, shutdown_rx);
    info!("⏱️  {} background tasks running", tasks.len());

    // Build the router
    let state = Arc::new(AppState::new(controller));
    let app = create_router(state, &settings);

    // Create socket address
    let addr = SocketAddr::from((settings.server.host, settings.server.port));

    info!("🌐 Server listening on http://{}", addr);
    info!("");
    info!("📚 API Endpoints:");
    info!("   ─── Signals & Proposals ───");
    info!("   POST /api/signals                  - Submit an improvement signal");
    info!("   GET  /api/proposals                - List pending proposals");
    info!("   GET  /api/proposals/{{id}}           - Pending proposal detail");
    info!("   POST /api/proposals/{{id}}/approve   - Approve and apply");
    info!("   POST /api/proposals/{{id}}/reject    - Reject");
    info!("   POST /api/proposals/{{id}}/defer     - Defer by the configured window");
    info!("   GET  /api/history                  - Decision history");
    info!("   GET  /api/rules                    - Auto-approval rules");
    info!("");
    info!("   ─── Updates & Backups ───");
    info!("   GET  /api/updates                  - Active and recent updates");
    info!("   POST /api/updates                  - Apply a change set directly");
    info!("   POST /api/updates/{{id}}/confirm     - Confirm an applied update");
    info!("   POST /api/updates/{{id}}/rollback    - Roll back from backup");
    info!("   GET  /api/backups                  - Backup history");
    info!("   GET  /api/backups/{{id}}             - Backup metadata");
    info!("");
    info!("   ─── Operations ───");
    info!("   GET  /api/audit                    - Audit trail");
    info!("   GET  /api/stats                    - Controller statistics");
    info!("");

    // Create TCP listener and serve
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop background loops before exiting
    let _ = shutdown_tx.send(true);
    tasks.join().await;

    info!("👋 Server shutdown complete");
    Ok(())
}

/// Initialize tracing with structured logging
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,autotune_api=debug,tower_http=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .compact(),
        )
        .init();
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("📴 Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("📴 Received terminate signal, initiating graceful shutdown...");
        },
    }
}
