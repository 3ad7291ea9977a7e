use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use savd_proto::{Envelope, encode_envelope, write_frame_async};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio::time::{Instant, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A peer is evicted once its last heartbeat is strictly older than this.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(300);

pub type PeerKey = (IpAddr, u16);

/// Per-connection send handle. All writes to one peer serialize through
/// this lock so a frame's length prefix and body are never interleaved.
pub type PeerWriter = Arc<Mutex<OwnedWriteHalf>>;

struct ClientEntry {
    last_heartbeat: Instant,
    writer: PeerWriter,
}

/// Trusted-client registry. The inner mutex guards every mutation and
/// iteration; no I/O happens while it is held. Connection handlers never
/// remove entries: the liveness sweep owns eviction, so a TCP flap that
/// reconnects within the timeout keeps its entry warm.
pub struct ClientRegistry {
    clients: StdMutex<HashMap<PeerKey, ClientEntry>>,
    heartbeat_timeout: Duration,
}

impl ClientRegistry {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self { clients: StdMutex::new(HashMap::new()), heartbeat_timeout }
    }

    /// Registers or refreshes a peer on heartbeat. The writer is replaced
    /// with the current connection's handle (last-writer-wins), which also
    /// repairs entries after a reconnect. Returns true for a new peer.
    pub fn touch(
        &self,
        peer: PeerKey,
        writer: PeerWriter,
    ) -> bool {
        let mut clients = self.clients.lock().expect("registry mutex poisoned");
        let now = Instant::now();
        match clients.get_mut(&peer) {
            Some(entry) => {
                entry.last_heartbeat = now;
                entry.writer = writer;
                false
            }
            None => {
                clients
                    .insert(peer, ClientEntry { last_heartbeat: now, writer });
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.clients.lock().expect("registry mutex poisoned").len()
    }

    #[cfg(test)]
    pub(crate) fn contains(
        &self,
        peer: &PeerKey,
    ) -> bool {
        self.clients.lock().expect("registry mutex poisoned").contains_key(peer)
    }

    /// Removes every entry whose heartbeat is strictly older than the
    /// timeout. Writers are not closed here; a dead handle simply fails
    /// its next send.
    pub fn sweep_expired(&self) -> Vec<PeerKey> {
        let mut clients = self.clients.lock().expect("registry mutex poisoned");
        let now = Instant::now();
        let expired: Vec<PeerKey> = clients
            .iter()
            .filter(|(_, entry)| {
                now.duration_since(entry.last_heartbeat) > self.heartbeat_timeout
            })
            .map(|(peer, _)| *peer)
            .collect();

        for peer in &expired {
            clients.remove(peer);
        }
        expired
    }

    fn snapshot(&self) -> Vec<(PeerKey, PeerWriter)> {
        let clients = self.clients.lock().expect("registry mutex poisoned");
        clients
            .iter()
            .map(|(peer, entry)| (*peer, entry.writer.clone()))
            .collect()
    }

    /// Broadcasts one CONTROL envelope carrying `rules` to every trusted
    /// client. Per-recipient failures are logged and skipped.
    pub async fn send_control_message(
        &self,
        rules: &[String],
    ) {
        let envelope = Envelope::control(rules.to_vec());
        let body = match encode_envelope(&envelope) {
            Ok(body) => body,
            Err(err) => {
                warn!("failed to encode control message: error={err}");
                return;
            }
        };

        for ((peer_ip, peer_port), writer) in self.snapshot() {
            let mut writer = writer.lock().await;
            match write_frame_async(&mut *writer, &body).await {
                Ok(()) => debug!(
                    "control message sent: peer={peer_ip}:{peer_port}, rules={}",
                    rules.len()
                ),
                Err(err) => warn!(
                    "control message send failed: peer={peer_ip}:{peer_port}, error={err}"
                ),
            }
        }
    }

    /// Background liveness sweep, one pass per heartbeat-timeout period.
    pub async fn run_sweep_loop(
        self: Arc<Self>,
        shutdown: CancellationToken,
    ) {
        let mut ticker = interval(self.heartbeat_timeout);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("liveness sweep stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let evicted = self.sweep_expired();
                    for (peer_ip, peer_port) in &evicted {
                        info!(
                            "client timed out: peer={peer_ip}:{peer_port}"
                        );
                    }
                    if !evicted.is_empty() {
                        info!(
                            "liveness sweep evicted clients: removed={}, remaining={}",
                            evicted.len(),
                            self.len()
                        );
                    }
                }
            }
        }
    }
}
