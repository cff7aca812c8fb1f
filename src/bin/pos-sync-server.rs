use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

use pos_offline_sync::logging;
use pos_offline_sync::server::{router, AppState, BatchPolicy, Reconciler, ServerDb};

#[derive(Parser, Debug)]
#[command(name = "pos-sync-server", about = "Reconciliation server for offline POS terminals", version)]
struct ServerConfig {
    /// Address to listen on
    #[arg(long, env = "POS_SYNC_BIND", default_value = "127.0.0.1:8787")]
    bind: SocketAddr,

    /// SQLite database file holding the canonical records
    #[arg(long = "db", env = "POS_SYNC_DB", default_value = "pos-sync-server.db")]
    db_path: PathBuf,

    /// What happens to valid records when one record in a push is invalid
    /// (`all-or-nothing` or `per-item`)
    #[arg(long, env = "POS_SYNC_BATCH_POLICY", default_value_t = BatchPolicy::AllOrNothing)]
    batch_policy: BatchPolicy,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Default log level when RUST_LOG is unset
    #[arg(long, env = "POS_SYNC_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::parse();
    logging::init_server(config.json_logs, &config.log_level).map_err(anyhow::Error::msg)?;

    let db = ServerDb::open(&config.db_path)
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("opening {}", config.db_path.display()))?;
    let reconciler = Arc::new(Reconciler::new(db, config.batch_policy));
    let app = router(AppState { reconciler });

    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    info!(
        addr = %listener.local_addr()?,
        db = %config.db_path.display(),
        batch_policy = %config.batch_policy,
        "Reconciliation server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = signal::ctrl_c().await {
                tracing::error!("failed to listen for shutdown signal: {e}");
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
        })
        .await
        .context("server error")?;
    Ok(())
}
