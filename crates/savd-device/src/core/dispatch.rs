use savd_proto::{Envelope, MessageKind};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Routes one envelope received from the controller. CONTROL payloads are
/// forwarded to the rule applier; everything else is logged. Failures
/// never terminate the receive loop.
pub async fn handle_envelope(
    rules_tx: &mpsc::Sender<Vec<String>>,
    envelope: Envelope,
) {
    match envelope.kind {
        MessageKind::Heartbeat => {
            debug!("heartbeat from controller");
        }
        MessageKind::ObservationBatch => {
            warn!("unexpected observation batch from controller, ignoring");
        }
        MessageKind::Control => match envelope.payload.as_rules() {
            Some(rules) => {
                info!("control message received: rules={}", rules.len());
                if rules_tx.send(rules.to_vec()).await.is_err() {
                    warn!("rule applier unavailable, dropping control message");
                }
            }
            None => warn!("control message with unexpected payload, ignoring"),
        },
        MessageKind::Response => {
            info!(
                "response from controller: message={}",
                envelope.payload.as_text().unwrap_or("-")
            );
        }
        MessageKind::Unknown(kind) => {
            warn!("unknown message kind: kind={kind}");
        }
    }
}
