use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use savd_proto::Observation;
use tokio::time::interval;
use tracing::{info, warn};

use crate::app::AppState;

/// Handles one uploaded batch: the rows are appended to the peer's CSV
/// spool for audit/replay and fed straight into the detector. The two
/// paths overlap on purpose; the store absorbs duplicate flaggings.
pub async fn ingest_batch(
    state: &AppState,
    peer: SocketAddr,
    rows: &[Observation],
) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }

    let spool_path = state
        .config
        .sniffer
        .readinfo_path
        .join(state.config.sniffer.peer_spool_name(&peer));
    if let Err(err) = append_rows(&spool_path, rows.to_vec()).await {
        // spooling is an audit trail; a disk problem must not stall detection
        warn!(
            "failed to spool observation rows: path={}, error={}",
            spool_path.display(),
            err
        );
    }

    let flagged = {
        let mut detector = state.detector.lock().await;
        detector.detect(rows)
    };

    for (src, dst) in flagged {
        warn!("ddos attack detected: src={src}, dst={dst}");
        state
            .store
            .blacklist_upsert(&dst)
            .await
            .context("failed to blacklist attack target")?;
    }

    Ok(())
}

/// Periodic spool drain: every `task_time`, CSV files under
/// `readinfo_path` are parsed, moved to `writeinfo_path`, and bulk-upserted
/// into the SnifferInfo table.
pub async fn run_csv_store_loop(state: AppState) {
    let mut ticker = interval(state.config.sniffer.task_time);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                info!("csv store loop stopping");
                break;
            }
            _ = ticker.tick() => {
                if let Err(err) = drain_spool_once(&state).await {
                    warn!("csv store pass failed: error={err}");
                }
            }
        }
    }
}

/// One drain pass. A file that fails to parse is still moved aside so a
/// poisoned spool cannot wedge the loop; its rows are skipped.
pub async fn drain_spool_once(state: &AppState) -> Result<()> {
    let read_dir = &state.config.sniffer.readinfo_path;
    let write_dir = &state.config.sniffer.writeinfo_path;

    let mut entries = match tokio::fs::read_dir(read_dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(());
        }
        Err(err) => {
            return Err(err).with_context(|| {
                format!("failed to scan spool dir {}", read_dir.display())
            });
        }
    };

    let mut drained = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if !is_csv_file(&path) {
            continue;
        }

        let rows = match read_rows(path.clone()).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(
                    "skipping unreadable spool file: path={}, error={}",
                    path.display(),
                    err
                );
                Vec::new()
            }
        };

        let file_name =
            path.file_name().context("spool path has no file name")?;
        let target = write_dir.join(file_name);
        tokio::fs::rename(&path, &target).await.with_context(|| {
            format!(
                "failed to move spool file: {} -> {}",
                path.display(),
                target.display()
            )
        })?;

        info!(
            "drained spool file: path={}, rows={}",
            target.display(),
            rows.len()
        );
        drained.extend(rows);
    }

    if !drained.is_empty() {
        state
            .store
            .sniffer_info_upsert_batch(&drained)
            .await
            .context("failed to store drained observations")?;
    }

    Ok(())
}

async fn append_rows(
    path: &Path,
    rows: Vec<Observation>,
) -> Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| {
                format!("failed to open spool file {}", path.display())
            })?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        for row in &rows {
            writer.serialize(row).with_context(|| {
                format!("failed to write spool row to {}", path.display())
            })?;
        }
        writer.flush().with_context(|| {
            format!("failed to flush spool file {}", path.display())
        })?;
        Ok(())
    })
    .await
    .context("spool append task panicked")?
}

async fn read_rows(path: PathBuf) -> Result<Vec<Observation>> {
    tokio::task::spawn_blocking(move || {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(&path)
            .with_context(|| {
                format!("failed to open spool file {}", path.display())
            })?;

        let mut rows = Vec::new();
        for record in reader.deserialize() {
            let row: Observation = record.with_context(|| {
                format!("failed to parse spool row in {}", path.display())
            })?;
            rows.push(row);
        }
        Ok(rows)
    })
    .await
    .context("spool read task panicked")?
}

fn is_csv_file(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some("csv")
}
