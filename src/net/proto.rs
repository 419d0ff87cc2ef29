//! Protocol message schemas and body codecs.
//!
//! Envelope layout is `{v, type, body}` on both wires: CBOR maps with string
//! keys on the binary wire (definite lengths only), the same shape as JSON on
//! the text wire. Unknown map keys are skipped so fields can be added without
//! breaking older peers.

use std::convert::Infallible;

use bytes::Bytes;
use minicbor::{Decoder, Encoder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{ChannelId, ErrorCode, ErrorPayload, HostId, ReplicatedChange};

use super::wire::WireFormat;

pub const PROTOCOL_VERSION: u32 = 1;

/// Entries allowed in one protocol-level CBOR map.
const MAX_MAP_ENTRIES: u64 = 64;
/// Longest text field (session names, asset paths, error messages).
const MAX_TEXT_LEN: usize = 4096;

#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub version: u32,
    pub message: NodeMessage,
}

impl Envelope {
    pub fn new(message: NodeMessage) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "UPPERCASE")]
pub enum NodeMessage {
    Header(Header),
    Asset(AssetFrame),
    Channel(ChannelFrame),
    Heartbeat(Heartbeat),
    Error(ErrorPayload),
}

impl NodeMessage {
    /// Wire name of this payload, used in protocol-error messages.
    pub fn classification(&self) -> &'static str {
        self.message_type().as_str()
    }

    fn message_type(&self) -> MessageType {
        match self {
            NodeMessage::Header(_) => MessageType::Header,
            NodeMessage::Asset(_) => MessageType::Asset,
            NodeMessage::Channel(_) => MessageType::Channel,
            NodeMessage::Heartbeat(_) => MessageType::Heartbeat,
            NodeMessage::Error(_) => MessageType::Error,
        }
    }
}

/// Handshake frame: the first application-level message on a connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub session_name: String,
    /// Present when the remote end is a cluster node; marks the connection
    /// as a replication peer.
    #[serde(default)]
    pub host_id: Option<HostId>,
    /// Overrides the sniffed wire format from the next frame onwards.
    #[serde(default)]
    pub wire: Option<WireFormat>,
    #[serde(default)]
    pub security_token: Option<String>,
    /// Heartbeat-timeout override in milliseconds.
    #[serde(default)]
    pub heartbeat_ms: Option<u64>,
    pub nonce: u64,
}

/// Business frame addressed to the asset tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssetFrame {
    pub path: String,
    pub payload: Bytes,
}

/// Business frame addressed to a replication channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelFrame {
    pub channel: ChannelId,
    pub origin: HostId,
    pub seq: u64,
    pub payload: Bytes,
}

impl From<ReplicatedChange> for ChannelFrame {
    fn from(change: ReplicatedChange) -> Self {
        Self {
            channel: change.channel,
            origin: change.origin,
            seq: change.seq,
            payload: change.payload,
        }
    }
}

impl From<ChannelFrame> for ReplicatedChange {
    fn from(frame: ChannelFrame) -> Self {
        Self {
            channel: frame.channel,
            origin: frame.origin,
            seq: frame.seq,
            payload: frame.payload,
        }
    }
}

/// Liveness frame; any traffic resets the idle timer, this one exists to be
/// sent when there is nothing else to say.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub nonce: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MessageType {
    Header,
    Asset,
    Channel,
    Heartbeat,
    Error,
}

impl MessageType {
    fn as_str(self) -> &'static str {
        match self {
            MessageType::Header => "HEADER",
            MessageType::Asset => "ASSET",
            MessageType::Channel => "CHANNEL",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::Error => "ERROR",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "HEADER" => Some(MessageType::Header),
            "ASSET" => Some(MessageType::Asset),
            "CHANNEL" => Some(MessageType::Channel),
            "HEARTBEAT" => Some(MessageType::Heartbeat),
            "ERROR" => Some(MessageType::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtoEncodeError {
    #[error("cbor encode: {0}")]
    Cbor(#[from] minicbor::encode::Error<Infallible>),
    #[error("json encode: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ProtoDecodeError {
    #[error("indefinite-length CBOR not allowed")]
    IndefiniteLength,
    #[error("map too large: {got} entries")]
    MapTooLarge { got: u64 },
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("trailing bytes after message body")]
    TrailingBytes,
    #[error("protocol version mismatch: expected {expected} got {got}")]
    VersionMismatch { expected: u32, got: u32 },
    #[error("cbor decode: {0}")]
    Cbor(#[from] minicbor::decode::Error),
    #[error("json decode: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtoDecodeError {
    /// Wire payload sent back before tearing the connection down.
    pub fn as_error_payload(&self) -> ErrorPayload {
        match self {
            ProtoDecodeError::MissingField(field) => ErrorPayload::new(
                ErrorCode::InvalidRequest,
                format!("missing field {field}"),
                false,
            ),
            ProtoDecodeError::InvalidField { field, reason } => ErrorPayload::new(
                ErrorCode::InvalidRequest,
                format!("invalid field {field}: {reason}"),
                false,
            ),
            ProtoDecodeError::UnknownMessageType(raw) => ErrorPayload::new(
                ErrorCode::InvalidRequest,
                format!("unknown message type {raw}"),
                false,
            ),
            ProtoDecodeError::VersionMismatch { expected, got } => ErrorPayload::new(
                ErrorCode::InvalidRequest,
                format!("protocol version mismatch: expected {expected} got {got}"),
                false,
            ),
            ProtoDecodeError::IndefiniteLength
            | ProtoDecodeError::MapTooLarge { .. }
            | ProtoDecodeError::TrailingBytes
            | ProtoDecodeError::Cbor(_)
            | ProtoDecodeError::Json(_) => ErrorPayload::new(
                ErrorCode::MalformedPayload,
                "failed to decode message body",
                false,
            ),
        }
    }
}

pub fn encode_envelope(
    envelope: &Envelope,
    wire: WireFormat,
) -> Result<Vec<u8>, ProtoEncodeError> {
    match wire {
        WireFormat::Binary => encode_envelope_cbor(envelope),
        WireFormat::Text => {
            let text = TextEnvelope {
                v: envelope.version,
                message: envelope.message.clone(),
            };
            Ok(serde_json::to_vec(&text)?)
        }
    }
}

pub fn decode_envelope(bytes: &[u8], wire: WireFormat) -> Result<Envelope, ProtoDecodeError> {
    let envelope = match wire {
        WireFormat::Binary => decode_envelope_cbor(bytes)?,
        WireFormat::Text => {
            let text: TextEnvelope = serde_json::from_slice(bytes)?;
            Envelope {
                version: text.v,
                message: text.message,
            }
        }
    };
    if envelope.version != PROTOCOL_VERSION {
        return Err(ProtoDecodeError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            got: envelope.version,
        });
    }
    Ok(envelope)
}

/// JSON rendition of the `{v, type, body}` envelope.
#[derive(Serialize, Deserialize)]
struct TextEnvelope {
    v: u32,
    #[serde(flatten)]
    message: NodeMessage,
}

fn encode_envelope_cbor(envelope: &Envelope) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(3)?;
    enc.str("v")?;
    enc.u32(envelope.version)?;
    enc.str("type")?;
    enc.str(envelope.message.message_type().as_str())?;
    enc.str("body")?;
    encode_body(&mut enc, &envelope.message)?;
    Ok(buf)
}

fn decode_envelope_cbor(bytes: &[u8]) -> Result<Envelope, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec)?;

    let mut version = None;
    let mut message_type = None;
    let mut body_span = None;

    for _ in 0..map_len {
        let key = decode_text(&mut dec, "key")?;
        match key {
            "v" => version = Some(dec.u32().map_err(ProtoDecodeError::Cbor)?),
            "type" => {
                let raw = decode_text(&mut dec, "type")?;
                message_type = Some(
                    MessageType::parse(raw)
                        .ok_or_else(|| ProtoDecodeError::UnknownMessageType(raw.to_string()))?,
                );
            }
            "body" => {
                let start = dec.position();
                dec.skip()?;
                body_span = Some((start, dec.position()));
            }
            _ => dec.skip()?,
        }
    }
    if dec.datatype().is_ok() {
        return Err(ProtoDecodeError::TrailingBytes);
    }

    let version = version.ok_or(ProtoDecodeError::MissingField("v"))?;
    let message_type = message_type.ok_or(ProtoDecodeError::MissingField("type"))?;
    let (start, end) = body_span.ok_or(ProtoDecodeError::MissingField("body"))?;
    let message = decode_body(message_type, &bytes[start..end])?;
    Ok(Envelope { version, message })
}

fn encode_body(
    enc: &mut Encoder<&mut Vec<u8>>,
    message: &NodeMessage,
) -> Result<(), ProtoEncodeError> {
    match message {
        NodeMessage::Header(header) => encode_header(enc, header),
        NodeMessage::Asset(frame) => encode_asset(enc, frame),
        NodeMessage::Channel(frame) => encode_channel(enc, frame),
        NodeMessage::Heartbeat(hb) => {
            enc.map(1)?;
            enc.str("nonce")?;
            enc.u64(hb.nonce)?;
            Ok(())
        }
        NodeMessage::Error(payload) => encode_error(enc, payload),
    }
}

fn decode_body(message_type: MessageType, bytes: &[u8]) -> Result<NodeMessage, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let message = match message_type {
        MessageType::Header => NodeMessage::Header(decode_header(&mut dec)?),
        MessageType::Asset => NodeMessage::Asset(decode_asset(&mut dec)?),
        MessageType::Channel => NodeMessage::Channel(decode_channel(&mut dec)?),
        MessageType::Heartbeat => NodeMessage::Heartbeat(decode_heartbeat(&mut dec)?),
        MessageType::Error => NodeMessage::Error(decode_error(&mut dec)?),
    };
    if dec.datatype().is_ok() {
        return Err(ProtoDecodeError::TrailingBytes);
    }
    Ok(message)
}

fn encode_header(
    enc: &mut Encoder<&mut Vec<u8>>,
    header: &Header,
) -> Result<(), ProtoEncodeError> {
    let mut len = 2;
    len += u64::from(header.host_id.is_some());
    len += u64::from(header.wire.is_some());
    len += u64::from(header.security_token.is_some());
    len += u64::from(header.heartbeat_ms.is_some());
    enc.map(len)?;

    enc.str("session_name")?;
    enc.str(&header.session_name)?;
    enc.str("nonce")?;
    enc.u64(header.nonce)?;
    if let Some(host) = header.host_id {
        enc.str("host_id")?;
        enc.u8(host.get())?;
    }
    if let Some(wire) = header.wire {
        enc.str("wire")?;
        enc.str(wire.as_str())?;
    }
    if let Some(token) = &header.security_token {
        enc.str("security_token")?;
        enc.str(token)?;
    }
    if let Some(ms) = header.heartbeat_ms {
        enc.str("heartbeat_ms")?;
        enc.u64(ms)?;
    }
    Ok(())
}

fn decode_header(dec: &mut Decoder<'_>) -> Result<Header, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut session_name = None;
    let mut nonce = None;
    let mut host_id = None;
    let mut wire = None;
    let mut security_token = None;
    let mut heartbeat_ms = None;

    for _ in 0..map_len {
        let key = decode_text(dec, "key")?;
        match key {
            "session_name" => {
                session_name = Some(decode_text(dec, "session_name")?.to_string());
            }
            "nonce" => nonce = Some(dec.u64().map_err(ProtoDecodeError::Cbor)?),
            "host_id" => {
                let raw = dec.u8().map_err(ProtoDecodeError::Cbor)?;
                host_id = Some(HostId::new(raw).map_err(|err| {
                    ProtoDecodeError::InvalidField {
                        field: "host_id",
                        reason: err.to_string(),
                    }
                })?);
            }
            "wire" => {
                let raw = decode_text(dec, "wire")?;
                wire = Some(WireFormat::parse(raw).ok_or_else(|| {
                    ProtoDecodeError::InvalidField {
                        field: "wire",
                        reason: format!("unknown wire format {raw}"),
                    }
                })?);
            }
            "security_token" => {
                security_token = Some(decode_text(dec, "security_token")?.to_string());
            }
            "heartbeat_ms" => heartbeat_ms = Some(dec.u64().map_err(ProtoDecodeError::Cbor)?),
            _ => dec.skip()?,
        }
    }

    Ok(Header {
        session_name: session_name.ok_or(ProtoDecodeError::MissingField("session_name"))?,
        host_id,
        wire,
        security_token,
        heartbeat_ms,
        nonce: nonce.ok_or(ProtoDecodeError::MissingField("nonce"))?,
    })
}

fn encode_asset(
    enc: &mut Encoder<&mut Vec<u8>>,
    frame: &AssetFrame,
) -> Result<(), ProtoEncodeError> {
    enc.map(2)?;
    enc.str("path")?;
    enc.str(&frame.path)?;
    enc.str("payload")?;
    enc.bytes(&frame.payload)?;
    Ok(())
}

fn decode_asset(dec: &mut Decoder<'_>) -> Result<AssetFrame, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut path = None;
    let mut payload = None;
    for _ in 0..map_len {
        let key = decode_text(dec, "key")?;
        match key {
            "path" => path = Some(decode_text(dec, "path")?.to_string()),
            "payload" => {
                payload = Some(Bytes::copy_from_slice(
                    dec.bytes().map_err(ProtoDecodeError::Cbor)?,
                ));
            }
            _ => dec.skip()?,
        }
    }
    Ok(AssetFrame {
        path: path.ok_or(ProtoDecodeError::MissingField("path"))?,
        payload: payload.ok_or(ProtoDecodeError::MissingField("payload"))?,
    })
}

fn encode_channel(
    enc: &mut Encoder<&mut Vec<u8>>,
    frame: &ChannelFrame,
) -> Result<(), ProtoEncodeError> {
    enc.map(4)?;
    enc.str("channel")?;
    enc.u16(frame.channel.get())?;
    enc.str("origin")?;
    enc.u8(frame.origin.get())?;
    enc.str("seq")?;
    enc.u64(frame.seq)?;
    enc.str("payload")?;
    enc.bytes(&frame.payload)?;
    Ok(())
}

fn decode_channel(dec: &mut Decoder<'_>) -> Result<ChannelFrame, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut channel = None;
    let mut origin = None;
    let mut seq = None;
    let mut payload = None;
    for _ in 0..map_len {
        let key = decode_text(dec, "key")?;
        match key {
            "channel" => {
                let raw = dec.u16().map_err(ProtoDecodeError::Cbor)?;
                channel = Some(ChannelId::new(raw).map_err(|err| {
                    ProtoDecodeError::InvalidField {
                        field: "channel",
                        reason: err.to_string(),
                    }
                })?);
            }
            "origin" => {
                let raw = dec.u8().map_err(ProtoDecodeError::Cbor)?;
                origin = Some(HostId::new(raw).map_err(|err| {
                    ProtoDecodeError::InvalidField {
                        field: "origin",
                        reason: err.to_string(),
                    }
                })?);
            }
            "seq" => seq = Some(dec.u64().map_err(ProtoDecodeError::Cbor)?),
            "payload" => {
                payload = Some(Bytes::copy_from_slice(
                    dec.bytes().map_err(ProtoDecodeError::Cbor)?,
                ));
            }
            _ => dec.skip()?,
        }
    }
    let seq = seq.ok_or(ProtoDecodeError::MissingField("seq"))?;
    if seq == 0 {
        return Err(ProtoDecodeError::InvalidField {
            field: "seq",
            reason: "sequence numbers start at 1".to_string(),
        });
    }
    Ok(ChannelFrame {
        channel: channel.ok_or(ProtoDecodeError::MissingField("channel"))?,
        origin: origin.ok_or(ProtoDecodeError::MissingField("origin"))?,
        seq,
        payload: payload.ok_or(ProtoDecodeError::MissingField("payload"))?,
    })
}

fn decode_heartbeat(dec: &mut Decoder<'_>) -> Result<Heartbeat, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut nonce = None;
    for _ in 0..map_len {
        let key = decode_text(dec, "key")?;
        match key {
            "nonce" => nonce = Some(dec.u64().map_err(ProtoDecodeError::Cbor)?),
            _ => dec.skip()?,
        }
    }
    Ok(Heartbeat {
        nonce: nonce.ok_or(ProtoDecodeError::MissingField("nonce"))?,
    })
}

fn encode_error(
    enc: &mut Encoder<&mut Vec<u8>>,
    payload: &ErrorPayload,
) -> Result<(), ProtoEncodeError> {
    enc.map(3)?;
    enc.str("code")?;
    enc.str(payload.code.as_str())?;
    enc.str("message")?;
    enc.str(&payload.message)?;
    enc.str("retryable")?;
    enc.bool(payload.retryable)?;
    Ok(())
}

fn decode_error(dec: &mut Decoder<'_>) -> Result<ErrorPayload, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut code = None;
    let mut message = None;
    let mut retryable = None;
    for _ in 0..map_len {
        let key = decode_text(dec, "key")?;
        match key {
            "code" => {
                let raw = decode_text(dec, "code")?;
                code = Some(ErrorCode::parse(raw).ok_or_else(|| {
                    ProtoDecodeError::InvalidField {
                        field: "code",
                        reason: format!("unknown error code {raw}"),
                    }
                })?);
            }
            "message" => message = Some(decode_text(dec, "message")?.to_string()),
            "retryable" => retryable = Some(dec.bool().map_err(ProtoDecodeError::Cbor)?),
            _ => dec.skip()?,
        }
    }
    Ok(ErrorPayload {
        code: code.ok_or(ProtoDecodeError::MissingField("code"))?,
        message: message.ok_or(ProtoDecodeError::MissingField("message"))?,
        retryable: retryable.ok_or(ProtoDecodeError::MissingField("retryable"))?,
    })
}

fn decode_map_len(dec: &mut Decoder<'_>) -> Result<u64, ProtoDecodeError> {
    let Some(len) = dec.map().map_err(ProtoDecodeError::Cbor)? else {
        return Err(ProtoDecodeError::IndefiniteLength);
    };
    if len > MAX_MAP_ENTRIES {
        return Err(ProtoDecodeError::MapTooLarge { got: len });
    }
    Ok(len)
}

fn decode_text<'a>(
    dec: &mut Decoder<'a>,
    field: &'static str,
) -> Result<&'a str, ProtoDecodeError> {
    let raw = dec.str().map_err(ProtoDecodeError::Cbor)?;
    if raw.len() > MAX_TEXT_LEN {
        return Err(ProtoDecodeError::InvalidField {
            field,
            reason: format!("text longer than {MAX_TEXT_LEN} bytes"),
        });
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: NodeMessage) {
        for wire in [WireFormat::Binary, WireFormat::Text] {
            let envelope = Envelope::new(message.clone());
            let bytes = encode_envelope(&envelope, wire).unwrap();
            let decoded = decode_envelope(&bytes, wire).unwrap();
            assert_eq!(decoded, envelope, "wire {wire:?}");
        }
    }

    #[test]
    fn header_roundtrips_on_both_wires() {
        roundtrip(NodeMessage::Header(Header {
            session_name: "node-a@box".into(),
            host_id: Some(HostId::new(3).unwrap()),
            wire: Some(WireFormat::Binary),
            security_token: Some("t0k3n".into()),
            heartbeat_ms: Some(7_500),
            nonce: 42,
        }));
        roundtrip(NodeMessage::Header(Header {
            session_name: "anon".into(),
            host_id: None,
            wire: None,
            security_token: None,
            heartbeat_ms: None,
            nonce: 1,
        }));
    }

    #[test]
    fn asset_and_channel_roundtrip() {
        roundtrip(NodeMessage::Asset(AssetFrame {
            path: "/cluster/nodes/3".into(),
            payload: Bytes::from_static(b"value"),
        }));
        roundtrip(NodeMessage::Channel(ChannelFrame {
            channel: ChannelId::new(1).unwrap(),
            origin: HostId::new(2).unwrap(),
            seq: 9,
            payload: Bytes::from_static(b"delta"),
        }));
    }

    #[test]
    fn heartbeat_and_error_roundtrip() {
        roundtrip(NodeMessage::Heartbeat(Heartbeat { nonce: 77 }));
        roundtrip(NodeMessage::Error(ErrorPayload::new(
            ErrorCode::UnknownChannel,
            "unknown channel id 9",
            false,
        )));
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(3).unwrap();
        enc.str("v").unwrap();
        enc.u32(PROTOCOL_VERSION).unwrap();
        enc.str("type").unwrap();
        enc.str("GOSSIP").unwrap();
        enc.str("body").unwrap();
        enc.map(0).unwrap();
        assert!(matches!(
            decode_envelope(&buf, WireFormat::Binary),
            Err(ProtoDecodeError::UnknownMessageType(_))
        ));
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(3).unwrap();
        enc.str("v").unwrap();
        enc.u32(PROTOCOL_VERSION).unwrap();
        enc.str("type").unwrap();
        enc.str("HEARTBEAT").unwrap();
        enc.str("body").unwrap();
        enc.map(0).unwrap();
        assert!(matches!(
            decode_envelope(&buf, WireFormat::Binary),
            Err(ProtoDecodeError::MissingField("nonce"))
        ));
    }

    #[test]
    fn indefinite_map_is_rejected() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.begin_map().unwrap();
        enc.str("v").unwrap();
        enc.u32(PROTOCOL_VERSION).unwrap();
        enc.end().unwrap();
        assert!(matches!(
            decode_envelope(&buf, WireFormat::Binary),
            Err(ProtoDecodeError::IndefiniteLength)
        ));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let envelope = Envelope::new(NodeMessage::Heartbeat(Heartbeat { nonce: 1 }));
        let mut bytes = encode_envelope(&envelope, WireFormat::Binary).unwrap();
        bytes.push(0x00);
        assert!(matches!(
            decode_envelope(&bytes, WireFormat::Binary),
            Err(ProtoDecodeError::TrailingBytes)
        ));
    }

    #[test]
    fn version_mismatch_is_rejected_on_both_wires() {
        for wire in [WireFormat::Binary, WireFormat::Text] {
            let envelope = Envelope {
                version: PROTOCOL_VERSION + 1,
                message: NodeMessage::Heartbeat(Heartbeat { nonce: 1 }),
            };
            let bytes = encode_envelope(&envelope, wire).unwrap();
            assert!(matches!(
                decode_envelope(&bytes, wire),
                Err(ProtoDecodeError::VersionMismatch { .. })
            ));
        }
    }

    #[test]
    fn zero_sequence_number_is_rejected() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(3).unwrap();
        enc.str("v").unwrap();
        enc.u32(PROTOCOL_VERSION).unwrap();
        enc.str("type").unwrap();
        enc.str("CHANNEL").unwrap();
        enc.str("body").unwrap();
        enc.map(4).unwrap();
        enc.str("channel").unwrap();
        enc.u16(1).unwrap();
        enc.str("origin").unwrap();
        enc.u8(2).unwrap();
        enc.str("seq").unwrap();
        enc.u64(0).unwrap();
        enc.str("payload").unwrap();
        enc.bytes(b"x").unwrap();
        assert!(matches!(
            decode_envelope(&buf, WireFormat::Binary),
            Err(ProtoDecodeError::InvalidField { field: "seq", .. })
        ));
    }

    #[test]
    fn unknown_keys_are_skipped() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(3).unwrap();
        enc.str("v").unwrap();
        enc.u32(PROTOCOL_VERSION).unwrap();
        enc.str("type").unwrap();
        enc.str("HEARTBEAT").unwrap();
        enc.str("body").unwrap();
        enc.map(2).unwrap();
        enc.str("nonce").unwrap();
        enc.u64(5).unwrap();
        enc.str("future_field").unwrap();
        enc.str("ignored").unwrap();
        let decoded = decode_envelope(&buf, WireFormat::Binary).unwrap();
        assert_eq!(
            decoded.message,
            NodeMessage::Heartbeat(Heartbeat { nonce: 5 })
        );
    }
}
