mod app;
mod config;
mod core;

use std::sync::Arc;

use anyhow::{Context, Result};
use app::AppState;
use config::Config;
use core::{
    ClientRegistry, DdosDetector, HEARTBEAT_TIMEOUT, Store, run_csv_store_loop,
    run_rule_distributor, run_server,
};
use savd_helpers::{logging, shutdown};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    logging::init_logging(
        "savd_controller=info,sqlx=warn,tokio=warn",
        "SAVD_CONTROLLER_LOG",
        "savd-controller",
        config.log.path().as_deref(),
    );

    for dir in [&config.sniffer.readinfo_path, &config.sniffer.writeinfo_path] {
        tokio::fs::create_dir_all(dir).await.with_context(|| {
            format!("failed to create spool dir {}", dir.display())
        })?;
    }

    let store = Arc::new(
        Store::connect(&config.database.db_path)
            .await
            .context("failed to open blacklist store")?,
    );

    let state = AppState {
        registry: Arc::new(ClientRegistry::new(HEARTBEAT_TIMEOUT)),
        store,
        detector: Arc::new(Mutex::new(DdosDetector::new(config.ddos.threshold))),
        config: Arc::new(config),
        shutdown: CancellationToken::new(),
    };

    info!(
        "controller starting: listen={}, db={}, threshold={}",
        state.config.controller.listen_addr(),
        state.config.database.db_path.display(),
        state.config.ddos.threshold
    );

    tokio::spawn(shutdown::listen_shutdown(state.shutdown.clone()));
    tokio::spawn(
        state.registry.clone().run_sweep_loop(state.shutdown.clone()),
    );
    tokio::spawn(run_csv_store_loop(state.clone()));
    tokio::spawn(run_rule_distributor(state.clone()));

    run_server(state).await
}
