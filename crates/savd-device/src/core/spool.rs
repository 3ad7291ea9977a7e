use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use savd_proto::Observation;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Capture spool layout: an active CSV under `root`, rotated files in
/// `upload/`, sent files in `uploaded/`.
#[derive(Debug, Clone)]
pub struct SpoolDirs {
    pub root: PathBuf,
    pub upload: PathBuf,
    pub uploaded: PathBuf,
    pub active_file: PathBuf,
}

impl SpoolDirs {
    pub fn new(
        root: PathBuf,
        active_name: &str,
    ) -> Self {
        Self {
            upload: root.join("upload"),
            uploaded: root.join("uploaded"),
            active_file: root.join(active_name),
            root,
        }
    }

    pub async fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.root, &self.upload, &self.uploaded] {
            tokio::fs::create_dir_all(dir).await.with_context(|| {
                format!("failed to create spool dir {}", dir.display())
            })?;
        }
        Ok(())
    }
}

/// Buffers observations coming from the capture integration and rotates
/// a full buffer into `upload/` as a time-stamped CSV. The OS capture
/// feeds the channel; it is the only producer this module knows about.
pub async fn run_spool_writer(
    dirs: SpoolDirs,
    capacity: usize,
    mut observations_rx: mpsc::Receiver<Observation>,
    shutdown: CancellationToken,
) -> Result<()> {
    let capacity = capacity.max(1);
    let mut buffer: Vec<Observation> = Vec::with_capacity(capacity);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("spool writer stopping");
                break;
            }
            maybe_row = observations_rx.recv() => {
                let Some(row) = maybe_row else {
                    info!("spool writer stopping: capture channel closed");
                    break;
                };

                buffer.push(row);
                if buffer.len() >= capacity {
                    let rows = std::mem::replace(
                        &mut buffer,
                        Vec::with_capacity(capacity),
                    );
                    if let Err(err) = flush_rotation(&dirs, rows).await {
                        warn!("spool rotation failed: error={err}");
                    }
                }
            }
        }
    }

    if !buffer.is_empty() {
        if let Err(err) = flush_rotation(&dirs, buffer).await {
            warn!("final spool flush failed: error={err}");
        }
    }

    Ok(())
}

/// Appends the rows to the active CSV, then moves the file into
/// `upload/`. A rotation landing on an existing name (two flushes in the
/// same second) merges into that file instead of clobbering it.
async fn flush_rotation(
    dirs: &SpoolDirs,
    rows: Vec<Observation>,
) -> Result<()> {
    let dirs = dirs.clone();
    let count = rows.len();

    tokio::task::spawn_blocking(move || {
        append_rows_blocking(&dirs.active_file, &rows)?;

        let target = dirs.upload.join(rotation_file_name(
            OffsetDateTime::now_utc(),
        ));
        if target.exists() {
            let pending = std::fs::read(&dirs.active_file).with_context(|| {
                format!(
                    "failed to read active spool file {}",
                    dirs.active_file.display()
                )
            })?;
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&target)
                .with_context(|| {
                    format!("failed to open {}", target.display())
                })?;
            use std::io::Write;
            file.write_all(&pending).with_context(|| {
                format!("failed to append to {}", target.display())
            })?;
            std::fs::remove_file(&dirs.active_file).with_context(|| {
                format!(
                    "failed to remove active spool file {}",
                    dirs.active_file.display()
                )
            })?;
        } else {
            std::fs::rename(&dirs.active_file, &target).with_context(|| {
                format!(
                    "failed to rotate spool file: {} -> {}",
                    dirs.active_file.display(),
                    target.display()
                )
            })?;
        }

        info!(
            "spool rotated: target={}, rows={}",
            target.display(),
            count
        );
        Ok(())
    })
    .await
    .context("spool rotation task panicked")?
}

fn rotation_file_name(now: OffsetDateTime) -> String {
    format!(
        "sniffer-{:04}-{:02}-{:02}_{:02}-{:02}-{:02}.csv",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

pub(crate) fn append_rows_blocking(
    path: &Path,
    rows: &[Observation],
) -> Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    let mut writer =
        csv::WriterBuilder::new().has_headers(false).from_writer(file);
    for row in rows {
        writer.serialize(row).with_context(|| {
            format!("failed to write spool row to {}", path.display())
        })?;
    }
    writer
        .flush()
        .with_context(|| format!("failed to flush {}", path.display()))?;
    Ok(())
}

pub(crate) fn read_rows_blocking(path: &Path) -> Result<Vec<Observation>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    let mut rows = Vec::new();
    for record in reader.deserialize() {
        let row: Observation = record.with_context(|| {
            format!("failed to parse spool row in {}", path.display())
        })?;
        rows.push(row);
    }
    Ok(rows)
}
