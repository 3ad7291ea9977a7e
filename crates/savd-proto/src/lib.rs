use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
#[cfg(feature = "tokio")]
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PROTOCOL_VERSION: f64 = 0.1;

/// Upper bound on a decoded frame body unless the caller configures one.
pub const DEFAULT_MAX_BODY_LEN: u32 = 4 * 1024 * 1024;

/// Wire tag selecting dispatch behavior. Unknown tags survive decode so
/// receivers can log them instead of dropping the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum MessageKind {
    Heartbeat,
    ObservationBatch,
    Control,
    Response,
    Unknown(u8),
}

impl From<u8> for MessageKind {
    fn from(value: u8) -> Self {
        match value {
            0 => MessageKind::Heartbeat,
            1 => MessageKind::ObservationBatch,
            2 => MessageKind::Control,
            3 => MessageKind::Response,
            other => MessageKind::Unknown(other),
        }
    }
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Heartbeat => 0,
            MessageKind::ObservationBatch => 1,
            MessageKind::Control => 2,
            MessageKind::Response => 3,
            MessageKind::Unknown(other) => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Arp,
}

impl std::fmt::Display for Protocol {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        let name = match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Icmp => "ICMP",
            Protocol::Arp => "ARP",
        };
        f.write_str(name)
    }
}

type ObservationRow =
    (String, String, u16, u16, Protocol, Option<String>, f64, u32);

/// One captured-packet metadata tuple. On the wire and in spool files it is
/// an ordered 8-element row; portless protocols record port 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ObservationRow", into = "ObservationRow")]
pub struct Observation {
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: Protocol,
    pub flags: Option<String>,
    pub timestamp: f64,
    pub length: u32,
}

impl From<ObservationRow> for Observation {
    fn from(row: ObservationRow) -> Self {
        let (src_ip, dst_ip, src_port, dst_port, protocol, flags, timestamp, length) =
            row;
        Self {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            protocol,
            flags,
            timestamp,
            length,
        }
    }
}

impl From<Observation> for ObservationRow {
    fn from(obs: Observation) -> Self {
        (
            obs.src_ip,
            obs.dst_ip,
            obs.src_port,
            obs.dst_port,
            obs.protocol,
            obs.flags,
            obs.timestamp,
            obs.length,
        )
    }
}

/// Kind-dependent payload. Variant order matters for untagged decoding: a
/// JSON string is text, an array of strings is a rule list, an array of
/// 8-element rows is an observation batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Text(String),
    Rules(Vec<String>),
    Observations(Vec<Observation>),
}

impl Payload {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_rules(&self) -> Option<&[String]> {
        match self {
            Payload::Rules(rules) => Some(rules),
            _ => None,
        }
    }

    pub fn as_observations(&self) -> Option<&[Observation]> {
        match self {
            Payload::Observations(rows) => Some(rows),
            _ => None,
        }
    }
}

/// One framed message. `kind` and `payload` are mandatory on decode;
/// `timestamp` defaults to the receiver's clock when the sender omitted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default = "default_version")]
    pub version: f64,
    pub kind: MessageKind,
    #[serde(default = "now_unix")]
    pub timestamp: f64,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(
        kind: MessageKind,
        payload: Payload,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind,
            timestamp: now_unix(),
            payload,
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(MessageKind::Heartbeat, Payload::Text("heartbeat".to_string()))
    }

    pub fn response(text: impl Into<String>) -> Self {
        Self::new(MessageKind::Response, Payload::Text(text.into()))
    }

    pub fn control(rules: Vec<String>) -> Self {
        Self::new(MessageKind::Control, Payload::Rules(rules))
    }

    pub fn observation_batch(rows: Vec<Observation>) -> Self {
        Self::new(MessageKind::ObservationBatch, Payload::Observations(rows))
    }
}

fn default_version() -> f64 {
    PROTOCOL_VERSION
}

/// Seconds since epoch as the protocol's timestamp representation.
pub fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("frame body too large: {0} bytes")]
    BodyTooLarge(u32),
    #[error("stream ended mid-frame")]
    ShortRead,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, ProtoError> {
    serde_json::to_vec(envelope)
        .map_err(|err| ProtoError::Malformed(err.to_string()))
}

pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, ProtoError> {
    serde_json::from_slice(bytes)
        .map_err(|err| ProtoError::Malformed(err.to_string()))
}

/// Writes one frame: big-endian u32 body length, then the body. Both writes
/// must complete before the writer is reused.
#[cfg(feature = "tokio")]
pub async fn write_frame_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    body: &[u8],
) -> Result<(), ProtoError> {
    let body_len = u32::try_from(body.len())
        .map_err(|_| ProtoError::BodyTooLarge(u32::MAX))?;

    writer.write_all(&body_len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    Ok(())
}

/// Reads one frame body, enforcing `max_body_len` before allocating. A
/// stream that ends inside the prefix or the body reports `ShortRead`.
/// An oversized body is drained in bounded chunks before the error is
/// returned, so the stream stays aligned on the next frame and the
/// session can discard the frame without reconnecting.
#[cfg(feature = "tokio")]
pub async fn read_frame_async<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_body_len: u32,
) -> Result<Vec<u8>, ProtoError> {
    let mut body_len_buf = [0_u8; 4];
    read_exact_or_short(reader, &mut body_len_buf).await?;
    let body_len = u32::from_be_bytes(body_len_buf);
    if body_len > max_body_len {
        let mut remaining = body_len as usize;
        let mut scratch = [0_u8; 8192];
        while remaining > 0 {
            let take = remaining.min(scratch.len());
            read_exact_or_short(reader, &mut scratch[..take]).await?;
            remaining -= take;
        }
        return Err(ProtoError::BodyTooLarge(body_len));
    }

    let mut body = vec![0_u8; body_len as usize];
    read_exact_or_short(reader, &mut body).await?;
    Ok(body)
}

#[cfg(feature = "tokio")]
pub async fn write_envelope_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> Result<(), ProtoError> {
    let body = encode_envelope(envelope)?;
    write_frame_async(writer, &body).await
}

#[cfg(feature = "tokio")]
pub async fn read_envelope_async<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_body_len: u32,
) -> Result<Envelope, ProtoError> {
    let body = read_frame_async(reader, max_body_len).await?;
    decode_envelope(&body)
}

#[cfg(feature = "tokio")]
async fn read_exact_or_short<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<(), ProtoError> {
    reader.read_exact(buf).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtoError::ShortRead
        } else {
            ProtoError::Io(err)
        }
    })?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::{
        Envelope, MessageKind, Observation, Payload, PROTOCOL_VERSION,
        Protocol, ProtoError, decode_envelope, encode_envelope, now_unix,
    };

    fn sample_observation() -> Observation {
        Observation {
            src_ip: "10.0.0.1".to_string(),
            dst_ip: "10.0.0.2".to_string(),
            src_port: 4444,
            dst_port: 80,
            protocol: Protocol::Tcp,
            flags: Some("SYN".to_string()),
            timestamp: 1_000_000.25,
            length: 60,
        }
    }

    #[test]
    fn round_trip_every_kind() {
        let envelopes = vec![
            Envelope::heartbeat(),
            Envelope::observation_batch(vec![sample_observation()]),
            Envelope::control(vec!["10.0.0.1".to_string()]),
            Envelope::response("heartbeat received"),
        ];

        for sent in envelopes {
            let bytes = encode_envelope(&sent).expect("encode");
            let received = decode_envelope(&bytes).expect("decode");
            assert_eq!(received, sent);
        }
    }

    #[test]
    fn kind_is_an_integer_on_the_wire() {
        let bytes = encode_envelope(&Envelope::control(vec![])).expect("encode");
        let value: serde_json::Value =
            serde_json::from_slice(&bytes).expect("json");
        assert_eq!(value["kind"], serde_json::json!(2));
        assert_eq!(value["version"], serde_json::json!(PROTOCOL_VERSION));
    }

    #[test]
    fn observation_is_an_ordered_row_on_the_wire() {
        let bytes =
            encode_envelope(&Envelope::observation_batch(vec![
                sample_observation(),
            ]))
            .expect("encode");
        let value: serde_json::Value =
            serde_json::from_slice(&bytes).expect("json");
        assert_eq!(
            value["payload"][0],
            serde_json::json!([
                "10.0.0.1",
                "10.0.0.2",
                4444,
                80,
                "TCP",
                "SYN",
                1_000_000.25,
                60
            ])
        );
    }

    #[test]
    fn missing_kind_or_payload_is_malformed() {
        let missing_kind = br#"{"version":0.1,"payload":"heartbeat"}"#;
        assert!(matches!(
            decode_envelope(missing_kind),
            Err(ProtoError::Malformed(_))
        ));

        let missing_payload = br#"{"version":0.1,"kind":0}"#;
        assert!(matches!(
            decode_envelope(missing_payload),
            Err(ProtoError::Malformed(_))
        ));

        assert!(matches!(
            decode_envelope(b"not json at all"),
            Err(ProtoError::Malformed(_))
        ));
    }

    #[test]
    fn missing_timestamp_defaults_to_now() {
        let before = now_unix();
        let envelope =
            decode_envelope(br#"{"kind":0,"payload":"heartbeat"}"#)
                .expect("decode");
        let after = now_unix();

        assert!(envelope.timestamp >= before && envelope.timestamp <= after);
        assert_eq!(envelope.version, PROTOCOL_VERSION);
    }

    #[test]
    fn unknown_kind_survives_decode() {
        let envelope = decode_envelope(br#"{"kind":9,"payload":"later"}"#)
            .expect("decode");
        assert_eq!(envelope.kind, MessageKind::Unknown(9));

        let bytes = encode_envelope(&envelope).expect("encode");
        let value: serde_json::Value =
            serde_json::from_slice(&bytes).expect("json");
        assert_eq!(value["kind"], serde_json::json!(9));
    }

    #[test]
    fn null_flags_decode_to_none() {
        let body = br#"{"kind":1,"payload":[["1.1.1.1","2.2.2.2",0,0,"ICMP",null,5.5,84]]}"#;
        let envelope = decode_envelope(body).expect("decode");
        let rows = envelope.payload.as_observations().expect("observations");
        assert_eq!(rows[0].protocol, Protocol::Icmp);
        assert!(rows[0].flags.is_none());
    }

    #[test]
    fn payload_accessors_match_variants() {
        assert_eq!(
            Payload::Text("ok".to_string()).as_text(),
            Some("ok")
        );
        assert!(Payload::Text("ok".to_string()).as_rules().is_none());
        assert_eq!(
            Payload::Rules(vec!["10.0.0.1".to_string()])
                .as_rules()
                .map(|rules| rules.len()),
            Some(1)
        );
        assert!(
            Payload::Observations(vec![sample_observation()])
                .as_observations()
                .is_some()
        );
    }
}
