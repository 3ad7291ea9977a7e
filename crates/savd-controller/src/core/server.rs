use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use savd_proto::{DEFAULT_MAX_BODY_LEN, ProtoError, read_envelope_async};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::dispatch;
use crate::app::AppState;

/// Runs the controller's accept loop, one handler task per device. Bind
/// failure is fatal; per-connection failures are logged and contained.
pub async fn run_server(state: AppState) -> Result<()> {
    let listen = state.config.controller.listen_addr();
    let listener = TcpListener::bind(&listen).await.with_context(|| {
        format!("failed to bind controller listener on {listen}")
    })?;

    info!("controller listening: addr={listen}");

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                info!("controller server stopping");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("tcp accept failed")?;
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, peer, state).await {
                        warn!(
                            "connection handler failed: peer={}, error={}",
                            peer,
                            err
                        );
                    }
                });
            }
        }
    }

    Ok(())
}

/// Per-connection receive loop. Frames are dispatched in arrival order; a
/// malformed frame is discarded and the session continues. A short read or
/// transport error closes the writer and drops the connection — the
/// trusted-client entry stays for the liveness sweep to reap.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: AppState,
) -> Result<()> {
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(Mutex::new(writer));

    info!("client connected: peer={peer}");

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            frame = read_envelope_async(&mut reader, DEFAULT_MAX_BODY_LEN) => {
                match frame {
                    Ok(envelope) => {
                        dispatch::handle_envelope(&state, peer, &writer, envelope)
                            .await;
                    }
                    Err(ProtoError::ShortRead) => {
                        info!("client disconnected: peer={peer}");
                        break;
                    }
                    Err(ProtoError::Io(err)) => {
                        warn!("client read failed: peer={peer}, error={err}");
                        break;
                    }
                    Err(err) => {
                        warn!("discarding malformed frame: peer={peer}, error={err}");
                    }
                }
            }
        }
    }

    let _ = writer.lock().await.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use savd_proto::{
        DEFAULT_MAX_BODY_LEN, Envelope, MessageKind, Observation, Payload,
        Protocol, read_envelope_async, write_envelope_async,
    };
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    use super::run_server;
    use crate::app::AppState;
    use crate::config::Config;
    use crate::core::{ClientRegistry, DdosDetector, Store};

    async fn test_state(threshold: u64) -> (AppState, std::net::SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let scratch = std::env::temp_dir()
            .join(format!("savd-server-{}", uuid::Uuid::now_v7()));
        for dir in ["read", "write"] {
            tokio::fs::create_dir_all(scratch.join(dir))
                .await
                .expect("scratch dir");
        }

        let config = Config::from_yaml_str(&format!(
            "controller:\n  controller_ip: {}\n  controller_port: {}\nddos:\n  threshold: {}\nsniffer:\n  readinfo_path: {}\n  writeinfo_path: {}\n",
            addr.ip(),
            addr.port(),
            threshold,
            scratch.join("read").display(),
            scratch.join("write").display(),
        ))
        .expect("config yaml");

        let state = AppState {
            registry: Arc::new(ClientRegistry::new(Duration::from_secs(300))),
            store: Arc::new(
                Store::connect_in_memory().await.expect("store"),
            ),
            detector: Arc::new(Mutex::new(DdosDetector::new(
                config.ddos.threshold,
            ))),
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        };
        (state, addr)
    }

    async fn connect_with_retry(addr: std::net::SocketAddr) -> TcpStream {
        for _ in 0..50 {
            if let Ok(stream) = TcpStream::connect(addr).await {
                return stream;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("server did not come up on {addr}");
    }

    #[tokio::test]
    async fn heartbeat_registers_and_is_acknowledged() {
        let (state, addr) = test_state(100).await;
        let server = tokio::spawn(run_server(state.clone()));

        let mut stream = connect_with_retry(addr).await;
        write_envelope_async(&mut stream, &Envelope::heartbeat())
            .await
            .expect("send heartbeat");

        let reply = read_envelope_async(&mut stream, DEFAULT_MAX_BODY_LEN)
            .await
            .expect("read response");
        assert_eq!(reply.kind, MessageKind::Response);
        assert_eq!(reply.payload.as_text(), Some("heartbeat received"));
        assert_eq!(state.registry.len(), 1);

        state.shutdown.cancel();
        let _ = server.await;
    }

    #[tokio::test]
    async fn observation_batch_crossing_threshold_lands_in_blacklist() {
        let (state, addr) = test_state(100).await;
        let server = tokio::spawn(run_server(state.clone()));

        let rows: Vec<Observation> = (0..150)
            .map(|_| Observation {
                src_ip: "10.0.0.1".to_string(),
                dst_ip: "10.0.0.2".to_string(),
                src_port: 4444,
                dst_port: 80,
                protocol: Protocol::Tcp,
                flags: Some("SYN".to_string()),
                timestamp: 1_000_000.0,
                length: 60,
            })
            .collect();

        let mut stream = connect_with_retry(addr).await;
        write_envelope_async(&mut stream, &Envelope::observation_batch(rows))
            .await
            .expect("send batch");

        let reply = read_envelope_async(&mut stream, DEFAULT_MAX_BODY_LEN)
            .await
            .expect("read response");
        assert_eq!(reply.payload.as_text(), Some("sniffer data received"));

        assert!(
            state
                .store
                .blacklist_contains("10.0.0.2")
                .await
                .expect("blacklist query")
        );

        state.shutdown.cancel();
        let _ = server.await;
    }

    #[tokio::test]
    async fn malformed_frame_does_not_drop_the_session() {
        let (state, addr) = test_state(100).await;
        let server = tokio::spawn(run_server(state.clone()));

        let mut stream = connect_with_retry(addr).await;

        let garbage = b"definitely not json";
        let mut framed = (garbage.len() as u32).to_be_bytes().to_vec();
        framed.extend_from_slice(garbage);
        use tokio::io::AsyncWriteExt;
        stream.write_all(&framed).await.expect("send garbage");

        write_envelope_async(&mut stream, &Envelope::heartbeat())
            .await
            .expect("send heartbeat after garbage");
        let reply = read_envelope_async(&mut stream, DEFAULT_MAX_BODY_LEN)
            .await
            .expect("session still alive");
        assert_eq!(reply.payload.as_text(), Some("heartbeat received"));

        state.shutdown.cancel();
        let _ = server.await;
    }

    #[tokio::test]
    async fn control_from_a_peer_is_ignored() {
        let (state, addr) = test_state(100).await;
        let server = tokio::spawn(run_server(state.clone()));

        let mut stream = connect_with_retry(addr).await;
        write_envelope_async(
            &mut stream,
            &Envelope::new(
                MessageKind::Control,
                Payload::Rules(vec!["10.9.9.9".to_string()]),
            ),
        )
        .await
        .expect("send control");

        // the session stays usable and no registry entry appears
        write_envelope_async(&mut stream, &Envelope::heartbeat())
            .await
            .expect("send heartbeat");
        let reply = read_envelope_async(&mut stream, DEFAULT_MAX_BODY_LEN)
            .await
            .expect("read response");
        assert_eq!(reply.kind, MessageKind::Response);
        assert_eq!(state.registry.len(), 1);

        state.shutdown.cancel();
        let _ = server.await;
    }
}
