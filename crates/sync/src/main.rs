//! `wardsync`: run the outbox as a standalone process.
//!
//! ```text
//! wardsync [daemon]   flush in the background until Ctrl-C
//! wardsync flush      flush once and print the report as JSON
//! wardsync status     print queue metadata as JSON
//! wardsync logs       print recent flush history as JSON
//! ```
//!
//! Configuration comes from `WARDSYNC_*` variables (see `SyncConfig`). The
//! process has no way to observe the network, so it assumes it is online and
//! relies on the periodic timer to retry.

use std::sync::Arc;

use anyhow::Context;
use wardsync_sync::{ConnectivityMonitor, ConnectivityState, Outbox, StaticToken, SyncConfig};

const RECENT_LOGS: usize = 50;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    wardsync_observability::init();

    let command = std::env::args().nth(1).unwrap_or_else(|| "daemon".to_string());
    let config = SyncConfig::from_env().context("invalid configuration")?;
    if config.token.is_none() {
        tracing::warn!("WARDSYNC_TOKEN is not set; deliveries will stop at the first job");
    }

    let network = Arc::new(ConnectivityMonitor::new(ConnectivityState::Online));
    let outbox = Outbox::open(&config, StaticToken::from(config.token.clone()), network)
        .await
        .context("failed to open outbox")?;

    match command.as_str() {
        "daemon" => {
            let daemon = outbox.start_daemon(config.daemon_options());
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;
            tracing::info!("shutdown requested");
            daemon.stop().await;
        }
        "flush" => {
            let report = outbox.trigger_flush().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        "status" => {
            let meta = outbox.meta().await.context("failed to read outbox")?;
            println!("{}", serde_json::to_string_pretty(&meta)?);
        }
        "logs" => {
            let entries = outbox.logs(RECENT_LOGS).await.context("failed to read sync log")?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        other => anyhow::bail!("unknown command {other:?} (expected daemon, flush, status or logs)"),
    }

    Ok(())
}
