use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use savd_proto::{
    DEFAULT_MAX_BODY_LEN, Envelope, ProtoError, read_envelope_async,
    write_envelope_async,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::{interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dispatch;

/// Client session to the controller.
///
/// The receive loop owns the read half and drives reconnects; every
/// producer (heartbeat, uploader, future callers) writes through `send`,
/// which serializes frames on the single writer lock.
pub struct Session {
    controller_addr: String,
    heartbeat_interval: Duration,
    reconnect_interval: Duration,
    writer: Mutex<Option<OwnedWriteHalf>>,
    connected: AtomicBool,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl Session {
    pub fn new(
        controller_addr: String,
        heartbeat_interval: Duration,
        reconnect_interval: Duration,
    ) -> Arc<Self> {
        let (ready_tx, ready_rx) = watch::channel(false);
        Arc::new(Self {
            controller_addr,
            heartbeat_interval,
            reconnect_interval,
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
            ready_tx,
            ready_rx,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Resolves once the first connection has been established. The latch
    /// stays set across later reconnects.
    pub async fn wait_ready(&self) {
        let mut ready = self.ready_rx.clone();
        let _ = ready.wait_for(|latched| *latched).await;
    }

    /// The only write path of the session.
    pub async fn send(
        &self,
        envelope: &Envelope,
    ) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            bail!("not connected to controller");
        };

        write_envelope_async(writer, envelope)
            .await
            .context("failed to send envelope")?;
        Ok(())
    }

    /// Receive loop: reads framed envelopes and hands them to dispatch in
    /// arrival order. A short read or transport error triggers the
    /// reconnect supervisor; a malformed frame is discarded and reading
    /// continues on the same connection.
    pub async fn run_receive(
        self: Arc<Self>,
        rules_tx: mpsc::Sender<Vec<String>>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let Some(mut reader) = self.connect_with_retry(&shutdown).await else {
            return Ok(());
        };

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("session receive loop stopping");
                    break;
                }
                frame = read_envelope_async(&mut reader, DEFAULT_MAX_BODY_LEN) => {
                    match frame {
                        Ok(envelope) => {
                            dispatch::handle_envelope(&rules_tx, envelope).await;
                        }
                        Err(ProtoError::ShortRead) => {
                            error!("controller closed the connection, reconnecting");
                            self.mark_disconnected().await;
                            match self.connect_with_retry(&shutdown).await {
                                Some(new_reader) => reader = new_reader,
                                None => break,
                            }
                        }
                        Err(ProtoError::Io(err)) => {
                            error!("controller read failed: error={err}, reconnecting");
                            self.mark_disconnected().await;
                            match self.connect_with_retry(&shutdown).await {
                                Some(new_reader) => reader = new_reader,
                                None => break,
                            }
                        }
                        Err(err) => {
                            warn!("discarding malformed frame: error={err}");
                        }
                    }
                }
            }
        }

        self.mark_disconnected().await;
        Ok(())
    }

    /// Heartbeat emitter. Send failures are logged and swallowed; the
    /// receive loop's error handling owns reconnection.
    pub async fn run_heartbeat(
        self: Arc<Self>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut ticker = interval(self.heartbeat_interval);
        // the connect path sends the first heartbeat itself
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("heartbeat loop stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if !self.is_connected() {
                        debug!("skipping heartbeat while disconnected");
                        continue;
                    }
                    match self.send(&Envelope::heartbeat()).await {
                        Ok(()) => debug!("heartbeat sent"),
                        Err(err) => warn!("failed to send heartbeat: error={err}"),
                    }
                }
            }
        }

        Ok(())
    }

    /// Dial loop: retries forever on `reconnect_interval` until the dial
    /// succeeds or shutdown fires. On success the writer is installed and
    /// a heartbeat goes out immediately so the controller re-registers
    /// this peer without waiting out a full heartbeat period.
    async fn connect_with_retry(
        &self,
        shutdown: &CancellationToken,
    ) -> Option<OwnedReadHalf> {
        loop {
            if shutdown.is_cancelled() {
                return None;
            }

            match TcpStream::connect(&self.controller_addr).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    let (reader, writer) = stream.into_split();
                    *self.writer.lock().await = Some(writer);
                    self.connected.store(true, Ordering::SeqCst);
                    let _ = self.ready_tx.send(true);
                    info!(
                        "connected to controller: addr={}",
                        self.controller_addr
                    );

                    if let Err(err) = self.send(&Envelope::heartbeat()).await {
                        warn!("initial heartbeat failed: error={err}");
                    }
                    return Some(reader);
                }
                Err(err) => {
                    warn!(
                        "connection failed: addr={}, error={err}, retrying",
                        self.controller_addr
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return None,
                        _ = sleep(self.reconnect_interval) => {}
                    }
                }
            }
        }
    }

    async fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}
