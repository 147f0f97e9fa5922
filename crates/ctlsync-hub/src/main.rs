use ctlsync_hub::demo::CounterApp;
use ctlsync_hub::logging::{init_logging, LogGuard};
use ctlsync_hub::{load_config, run};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = load_config();
    let log_guard = init_logging(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "shutdown_requested");
        let _ = shutdown_tx.send(true);
    });

    let result = run(config, Arc::new(CounterApp::new()), shutdown_rx).await;
    if let Some(failed) = log_guard
        .as_ref()
        .map(LogGuard::failed_writes)
        .filter(|failed| *failed > 0)
    {
        info!(event = "log_file_incomplete", failed_writes = failed);
    }
    if let Err(err) = result {
        error!(event = "hub_error", error = %err);
        std::process::exit(1);
    }
}
