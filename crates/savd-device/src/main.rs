mod args;
mod config;
mod core;

use std::env;

use anyhow::{Context, Result};
use args::{DeviceArgs, Mode};
use config::DeviceConfig;
use core::{
    FilterRules, IptablesTable, RuleCache, Session, SpoolDirs,
    reapply_cached_rules, run_rule_applier, run_spool_writer, run_upload_loop,
};
use savd_helpers::{logging, shutdown};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = DeviceArgs::parse(env::args().skip(1))?;
    let mut config = DeviceConfig::load(&args.config_path)
        .context("failed to load configuration")?;
    config.sava.is_sava = args.mode == Mode::Sava;

    logging::init_logging(
        "savd_device=info,tokio=warn",
        "SAVD_DEVICE_LOG",
        "savd-device",
        config.log.path().as_deref(),
    );

    info!(
        "device starting: mode={}, controller={}",
        args.mode,
        config.controller.addr()
    );

    let shutdown_token = CancellationToken::new();
    tokio::spawn(shutdown::listen_shutdown(shutdown_token.clone()));

    let dirs = SpoolDirs::new(
        config.monitor.sniffer_file_path.clone(),
        &config.monitor.sniffer_file_name,
    );
    dirs.ensure_dirs().await?;

    let cache = RuleCache::new(
        config.rule.cache_path.clone(),
        config.rule.cache_max_size,
    );
    let mut filter = FilterRules::new(IptablesTable::default());
    if args.flush_rules {
        info!("flushing packet filter chains before startup");
        filter.flush().await;
    }
    if !config.sava.is_sava {
        reapply_cached_rules(&mut filter, &cache).await;
    }

    let session = Session::new(
        config.controller.addr(),
        config.connection.heartbeat_interval,
        config.connection.reconnect_interval,
    );

    // The OS capture integration publishes observation tuples into this
    // sink; the spool writer rotates them into upload/ for the uploader.
    let (capture_sink, capture_rx) =
        mpsc::channel(config.monitor.sniffer_queue_size);
    let _capture_sink = capture_sink;
    if config.sava.is_sava {
        match config.monitor.capture_interface() {
            Some(interface) => {
                info!("capture configured: interface={interface}");
            }
            None => info!("capture configured: interface=all"),
        }
        tokio::spawn(run_spool_writer(
            dirs.clone(),
            config.monitor.sniffer_queue_size,
            capture_rx,
            shutdown_token.clone(),
        ));
    }

    let (rules_tx, rules_rx) = mpsc::channel(16);
    let receive_task = tokio::spawn(
        session.clone().run_receive(rules_tx, shutdown_token.clone()),
    );
    let heartbeat_task =
        tokio::spawn(session.clone().run_heartbeat(shutdown_token.clone()));
    let applier_task = tokio::spawn(run_rule_applier(
        rules_rx,
        filter,
        cache,
        shutdown_token.clone(),
    ));
    let upload_task = tokio::spawn(run_upload_loop(
        session.clone(),
        dirs,
        config.monitor.sniffer_upload_interval,
        shutdown_token.clone(),
    ));

    shutdown_token.cancelled().await;

    if let Err(err) = receive_task.await.context("receive task join failed")? {
        warn!("receive task stopped with error: error={err}");
    }
    if let Err(err) =
        heartbeat_task.await.context("heartbeat task join failed")?
    {
        warn!("heartbeat task stopped with error: error={err}");
    }
    applier_task.await.context("rule applier task join failed")?;
    if let Err(err) = upload_task.await.context("upload task join failed")? {
        warn!("upload task stopped with error: error={err}");
    }

    Ok(())
}
