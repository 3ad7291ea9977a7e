use std::net::SocketAddr;

use savd_proto::{Envelope, MessageKind, Observation, Payload, write_envelope_async};
use tracing::{debug, info, warn};

use super::intake;
use super::registry::PeerWriter;
use crate::app::AppState;

/// Routes one received envelope by kind. Failures are logged per message
/// and never close the connection.
pub async fn handle_envelope(
    state: &AppState,
    peer: SocketAddr,
    writer: &PeerWriter,
    envelope: Envelope,
) {
    match envelope.kind {
        MessageKind::Heartbeat => {
            let newly_registered = state
                .registry
                .touch((peer.ip(), peer.port()), writer.clone());
            if newly_registered {
                info!(
                    "client registered: peer={}, clients={}",
                    peer,
                    state.registry.len()
                );
            } else {
                debug!("heartbeat refreshed: peer={peer}");
            }
            respond(peer, writer, "heartbeat received").await;
        }
        MessageKind::ObservationBatch => {
            match batch_rows(&envelope.payload) {
                Some(rows) => {
                    if let Err(err) =
                        intake::ingest_batch(state, peer, rows).await
                    {
                        warn!(
                            "observation intake failed: peer={peer}, error={err}"
                        );
                    }
                }
                None => warn!(
                    "observation batch with unexpected payload: peer={peer}"
                ),
            }
            respond(peer, writer, "sniffer data received").await;
        }
        MessageKind::Control => {
            info!("control message from peer ignored: peer={peer}");
        }
        MessageKind::Response => {
            debug!(
                "response received: peer={}, message={}",
                peer,
                envelope.payload.as_text().unwrap_or("-")
            );
        }
        MessageKind::Unknown(kind) => {
            warn!("unknown message kind: peer={peer}, kind={kind}");
        }
    }
}

/// An empty JSON list decodes as an empty rule list; treat it as an empty
/// batch rather than a payload mismatch.
fn batch_rows(payload: &Payload) -> Option<&[Observation]> {
    match payload {
        Payload::Observations(rows) => Some(rows),
        Payload::Rules(rules) if rules.is_empty() => Some(&[]),
        _ => None,
    }
}

async fn respond(
    peer: SocketAddr,
    writer: &PeerWriter,
    message: &str,
) {
    let envelope = Envelope::response(message);
    let mut writer = writer.lock().await;
    if let Err(err) = write_envelope_async(&mut *writer, &envelope).await {
        warn!("failed to send response: peer={peer}, error={err}");
    }
}
