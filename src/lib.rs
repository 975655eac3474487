//! tickwarden -- crash-safe polling task scheduler backed by SQLite.
//!
//! Tasks are external commands with a fixed interval. A single loop polls for
//! due tasks and fans them out to a bounded pool of executors; each execution
//! is recorded so that at most one run of a task is ever in flight, and runs
//! interrupted by a crash are repaired on the next start.

pub mod config;
pub mod executor;
pub mod scheduler;
pub mod storage;
pub mod task;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::config::TickwardenConfig;

/// Start the tickwarden daemon and block until SIGINT or SIGTERM.
pub async fn serve(config: &TickwardenConfig) -> Result<()> {
    let db_path = &config.database.path;
    // Held until we return, so no second daemon or `recover` can repair our running rows.
    let lock = storage::DatabaseLock::acquire(db_path)?;
    tracing::info!(db_path = %db_path.display(), lock = %lock.path().display(), "Initializing database");
    let pool = storage::open_pool(db_path)?;

    let scheduler = scheduler::Scheduler::new(pool, &config.scheduler);

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    scheduler.run(cancel).await;
    tracing::info!("tickwarden stopped");
    Ok(())
}

fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::warn!("Failed to listen for SIGTERM, only Ctrl+C will stop the daemon: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            return;
        }
    };

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
                term.recv().await;
            }
        }
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}
