use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use savd_proto::Envelope;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::session::Session;
use super::spool::{self, SpoolDirs};

/// Rows per OBSERVATION_BATCH envelope.
pub const UPLOAD_BATCH_SIZE: usize = 128;

/// Upload loop: on every tick, each spooled CSV in `upload/` is sent in
/// bounded batches and then moved to `uploaded/`. A file that fails
/// mid-send stays in place and is retried on the next tick.
pub async fn run_upload_loop(
    session: Arc<Session>,
    dirs: SpoolDirs,
    upload_interval: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        _ = session.wait_ready() => {}
    }

    let mut ticker = interval(upload_interval);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("upload loop stopping");
                break;
            }
            _ = ticker.tick() => {
                if let Err(err) = upload_pending(&session, &dirs).await {
                    warn!("upload pass failed: error={err}");
                }
            }
        }
    }

    Ok(())
}

pub async fn upload_pending(
    session: &Session,
    dirs: &SpoolDirs,
) -> Result<()> {
    let mut entries = match tokio::fs::read_dir(&dirs.upload).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(());
        }
        Err(err) => {
            return Err(err).with_context(|| {
                format!("failed to scan upload dir {}", dirs.upload.display())
            });
        }
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if !is_csv_file(&path) {
            continue;
        }

        match upload_file(session, &path).await {
            Ok(rows) => {
                let file_name =
                    path.file_name().context("spool path has no file name")?;
                let target = dirs.uploaded.join(file_name);
                tokio::fs::rename(&path, &target).await.with_context(|| {
                    format!(
                        "failed to move uploaded file: {} -> {}",
                        path.display(),
                        target.display()
                    )
                })?;
                info!(
                    "uploaded spool file: path={}, rows={}",
                    target.display(),
                    rows
                );
            }
            Err(err) => {
                warn!(
                    "spool upload failed, leaving file for retry: path={}, error={}",
                    path.display(),
                    err
                );
            }
        }
    }

    Ok(())
}

/// Sends every row of one file in ≤128-row batches. The file is only
/// considered done once every batch went out.
async fn upload_file(
    session: &Session,
    path: &Path,
) -> Result<usize> {
    let rows = {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || spool::read_rows_blocking(&path))
            .await
            .context("spool read task panicked")??
    };

    for chunk in rows.chunks(UPLOAD_BATCH_SIZE) {
        session
            .send(&Envelope::observation_batch(chunk.to_vec()))
            .await
            .context("failed to send observation batch")?;
    }

    Ok(rows.len())
}

fn is_csv_file(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some("csv")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use savd_proto::{
        DEFAULT_MAX_BODY_LEN, MessageKind, Observation, Protocol,
        read_envelope_async,
    };
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    use super::upload_pending;
    use crate::core::session::Session;
    use crate::core::spool::{self, SpoolDirs};

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    fn scratch_dirs() -> SpoolDirs {
        let root = std::env::temp_dir()
            .join(format!("savd-upload-{}", uuid::Uuid::now_v7()));
        SpoolDirs::new(root, "sniffer.csv")
    }

    fn row(index: u32) -> Observation {
        Observation {
            src_ip: "192.168.10.2".to_string(),
            dst_ip: "10.10.0.2".to_string(),
            src_port: 4444,
            dst_port: 80,
            protocol: Protocol::Tcp,
            flags: Some("SYN".to_string()),
            timestamp: 1_000.0 + f64::from(index),
            length: 100,
        }
    }

    #[tokio::test]
    async fn spooled_file_is_chunked_and_moved_to_uploaded() {
        let dirs = scratch_dirs();
        dirs.ensure_dirs().await.expect("dirs");

        let rows: Vec<Observation> = (0..200).map(row).collect();
        let spooled = dirs.upload.join("sniffer-2024-01-01_00-00-00.csv");
        spool::append_rows_blocking(&spooled, &rows).expect("spool");

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let session = Session::new(
            addr.to_string(),
            Duration::from_secs(60),
            Duration::from_secs(1),
        );
        let shutdown = CancellationToken::new();
        let (rules_tx, _rules_rx) = mpsc::channel(1);
        let receive = tokio::spawn(
            session.clone().run_receive(rules_tx, shutdown.clone()),
        );

        let (mut server_side, _) = listener.accept().await.expect("accept");
        // the session introduces itself with a heartbeat on connect
        let heartbeat = timeout(
            TEST_TIMEOUT,
            read_envelope_async(&mut server_side, DEFAULT_MAX_BODY_LEN),
        )
        .await
        .expect("heartbeat in time")
        .expect("heartbeat decodes");
        assert_eq!(heartbeat.kind, MessageKind::Heartbeat);

        session.wait_ready().await;
        upload_pending(&session, &dirs).await.expect("upload");

        let mut sizes = Vec::new();
        for _ in 0..2 {
            let envelope = timeout(
                TEST_TIMEOUT,
                read_envelope_async(&mut server_side, DEFAULT_MAX_BODY_LEN),
            )
            .await
            .expect("batch in time")
            .expect("batch decodes");
            assert_eq!(envelope.kind, MessageKind::ObservationBatch);
            sizes.push(
                envelope.payload.as_observations().expect("rows").len(),
            );
        }
        assert_eq!(sizes, vec![128, 72]);

        let mut upload_entries =
            tokio::fs::read_dir(&dirs.upload).await.expect("read dir");
        assert!(
            upload_entries.next_entry().await.expect("entry").is_none(),
            "upload dir should be empty after a successful pass"
        );
        assert!(
            tokio::fs::try_exists(
                dirs.uploaded.join("sniffer-2024-01-01_00-00-00.csv")
            )
            .await
            .expect("exists")
        );

        shutdown.cancel();
        drop(server_side);
        let _ = timeout(TEST_TIMEOUT, receive).await;
        let _ = tokio::fs::remove_dir_all(&dirs.root).await;
    }

    #[tokio::test]
    async fn failed_upload_leaves_the_file_for_retry() {
        let dirs = scratch_dirs();
        dirs.ensure_dirs().await.expect("dirs");

        let rows: Vec<Observation> = (0..5).map(row).collect();
        let spooled = dirs.upload.join("sniffer-2024-01-01_00-00-01.csv");
        spool::append_rows_blocking(&spooled, &rows).expect("spool");

        // never connected: every send fails
        let session = Session::new(
            "127.0.0.1:1".to_string(),
            Duration::from_secs(60),
            Duration::from_secs(1),
        );

        upload_pending(&session, &dirs).await.expect("pass completes");

        assert!(
            tokio::fs::try_exists(&spooled).await.expect("exists"),
            "file must remain spooled after a failed upload"
        );

        let _ = tokio::fs::remove_dir_all(&dirs.root).await;
    }
}
