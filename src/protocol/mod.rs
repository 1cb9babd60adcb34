//! Radio Session Protocols
//!
//! Binary request/response layer spoken to a companion radio over a raw
//! byte transport. Each radio family has its own [`FrameCodec`] owning the
//! framing and opcode tables; [`ProtocolSession`] handles correlation,
//! timeouts and the debug capture ring for all of them.

pub mod capture;
pub mod meshcore;
pub mod meshtastic;
pub mod session;

pub use capture::{CapturedFrame, DebugCapture, FrameDirection};
pub use meshcore::MeshCoreCodec;
pub use meshtastic::MeshtasticCodec;
pub use session::{ProtocolSession, SessionEvent};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::bluetooth::ProtocolKind;
use crate::error::ProtocolError;

/// Tag carried by frames the radio sends without being asked.
pub const UNSOLICITED_TAG: u16 = 0;

/// Identity reported by the radio during the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfInfo {
    pub node_num: u32,
    pub long_name: String,
    pub short_name: Option<String>,
    pub firmware_version: Option<String>,
    pub hardware_model: Option<String>,
    pub battery_millivolts: Option<u16>,
    pub battery_percent: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub node_num: u32,
    pub name: String,
    pub hops_away: Option<u8>,
    pub last_heard: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub index: u8,
    pub name: String,
    /// Hex encoded pre-shared key
    pub psk: Option<String>,
}

/// A packet heard on the mesh and handed up by the radio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshPacket {
    pub from: u32,
    pub packet_id: Option<u32>,
    pub channel: u8,
    pub hop_count: Option<u8>,
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    GetSelfInfo,
    GetContacts,
    GetChannels,
    SetChannel(ChannelInfo),
    Ping,
    SendPayload { channel: u8, payload: Vec<u8> },
}

impl Request {
    pub fn operation(&self) -> &'static str {
        match self {
            Request::GetSelfInfo => "get_self_info",
            Request::GetContacts => "get_contacts",
            Request::GetChannels => "get_channels",
            Request::SetChannel(_) => "set_channel",
            Request::Ping => "ping",
            Request::SendPayload { .. } => "send_payload",
        }
    }

    pub fn expected_reply(&self) -> ReplyKind {
        match self {
            Request::GetSelfInfo => ReplyKind::SelfInfo,
            Request::GetContacts => ReplyKind::Contacts,
            Request::GetChannels => ReplyKind::Channels,
            Request::SetChannel(_) | Request::SendPayload { .. } => ReplyKind::Ack,
            Request::Ping => ReplyKind::Pong,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    SelfInfo,
    Contacts,
    Channels,
    Ack,
    Pong,
    Error,
}

impl fmt::Display for ReplyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReplyKind::SelfInfo => "self_info",
            ReplyKind::Contacts => "contacts",
            ReplyKind::Channels => "channels",
            ReplyKind::Ack => "ack",
            ReplyKind::Pong => "pong",
            ReplyKind::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    SelfInfo(SelfInfo),
    Contacts(Vec<Contact>),
    Channels(Vec<ChannelInfo>),
    Ack,
    Pong,
    Error { code: u8 },
}

impl Reply {
    pub fn kind(&self) -> ReplyKind {
        match self {
            Reply::SelfInfo(_) => ReplyKind::SelfInfo,
            Reply::Contacts(_) => ReplyKind::Contacts,
            Reply::Channels(_) => ReplyKind::Channels,
            Reply::Ack => ReplyKind::Ack,
            Reply::Pong => ReplyKind::Pong,
            Reply::Error { .. } => ReplyKind::Error,
        }
    }
}

/// A decoded radio-to-app frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Reply { tag: u16, reply: Reply },
    MeshPacket(MeshPacket),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCapabilities {
    pub ping: bool,
    pub debug_topology: bool,
}

/// Family-specific framing. Both directions are implemented so the same
/// codec can drive a simulated radio.
pub trait FrameCodec: Send + Sync {
    fn kind(&self) -> ProtocolKind;

    fn capabilities(&self) -> SessionCapabilities;

    /// App to radio
    fn encode_request(&self, tag: u16, request: &Request) -> Result<Vec<u8>, ProtocolError>;

    /// Radio to app
    fn decode_inbound(&self, frame: &[u8]) -> Result<Inbound, ProtocolError>;

    /// Radio side: parse a request written by the app
    fn decode_request(&self, frame: &[u8]) -> Result<(u16, Request), ProtocolError>;

    /// Radio side: answer a request
    fn encode_reply(&self, tag: u16, reply: &Reply) -> Result<Vec<u8>, ProtocolError>;

    /// Radio side: forward a packet heard on the mesh
    fn encode_mesh_packet(&self, packet: &MeshPacket) -> Result<Vec<u8>, ProtocolError>;
}

/// Pick the codec for a detected family.
pub fn codec_for(kind: ProtocolKind) -> Option<Arc<dyn FrameCodec>> {
    match kind {
        ProtocolKind::Meshtastic => Some(Arc::new(MeshtasticCodec)),
        ProtocolKind::MeshCore => Some(Arc::new(MeshCoreCodec)),
        ProtocolKind::Unknown => None,
    }
}

/// Byte order of multi-byte header fields.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Endian {
    Big,
    Little,
}

impl Endian {
    fn write_u16(self, value: u16) -> [u8; 2] {
        match self {
            Endian::Big => value.to_be_bytes(),
            Endian::Little => value.to_le_bytes(),
        }
    }

    fn read_u16(self, bytes: [u8; 2]) -> u16 {
        match self {
            Endian::Big => u16::from_be_bytes(bytes),
            Endian::Little => u16::from_le_bytes(bytes),
        }
    }
}

/// Frame body shared by both families: opcode, correlation tag, payload.
pub(crate) fn encode_body(opcode: u8, tag: u16, payload: &[u8], endian: Endian) -> Vec<u8> {
    let mut body = Vec::with_capacity(3 + payload.len());
    body.push(opcode);
    body.extend_from_slice(&endian.write_u16(tag));
    body.extend_from_slice(payload);
    body
}

pub(crate) fn decode_body(body: &[u8], endian: Endian) -> Result<(u8, u16, &[u8]), ProtocolError> {
    if body.len() < 3 {
        return Err(ProtocolError::Malformed(format!(
            "frame body too short: {} bytes",
            body.len()
        )));
    }
    let tag = endian.read_u16([body[1], body[2]]);
    Ok((body[0], tag, &body[3..]))
}

/// Read a length-prefixed frame: `header`, then a u16 length, then the body.
pub(crate) fn split_frame<'a>(
    frame: &'a [u8],
    header: &[u8],
    endian: Endian,
) -> Result<&'a [u8], ProtocolError> {
    let prefix = header.len() + 2;
    if frame.len() < prefix || !frame.starts_with(header) {
        return Err(ProtocolError::Malformed("missing frame header".to_string()));
    }
    let len = endian.read_u16([frame[header.len()], frame[header.len() + 1]]) as usize;
    if frame.len() - prefix != len {
        return Err(ProtocolError::Malformed(format!(
            "length mismatch: header says {len}, frame carries {}",
            frame.len() - prefix
        )));
    }
    Ok(&frame[prefix..])
}

pub(crate) fn join_frame(
    header: &[u8],
    body: Vec<u8>,
    endian: Endian,
) -> Result<Vec<u8>, ProtocolError> {
    let len = u16::try_from(body.len()).map_err(|_| {
        ProtocolError::Malformed(format!("frame body too large: {} bytes", body.len()))
    })?;
    let mut frame = Vec::with_capacity(header.len() + 2 + body.len());
    frame.extend_from_slice(header);
    frame.extend_from_slice(&endian.write_u16(len));
    frame.extend(body);
    Ok(frame)
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

pub(crate) fn from_json<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(payload).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Payload of a broadcast request.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SendPayloadBody {
    pub channel: u8,
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ErrorBody {
    pub code: u8,
}

// Binary payloads travel as hex strings inside JSON bodies
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        hex::decode(raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_length_must_match_header() {
        let frame = join_frame(&[0xAA], vec![1, 2, 3], Endian::Big).unwrap();
        assert_eq!(frame, vec![0xAA, 0x00, 0x03, 1, 2, 3]);
        assert_eq!(split_frame(&frame, &[0xAA], Endian::Big).unwrap(), &[1, 2, 3]);

        let truncated = &frame[..5];
        assert!(matches!(
            split_frame(truncated, &[0xAA], Endian::Big),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn body_respects_byte_order() {
        let body = encode_body(0x05, 0x0102, b"x", Endian::Little);
        assert_eq!(body, vec![0x05, 0x02, 0x01, b'x']);
        assert_eq!(decode_body(&body, Endian::Little).unwrap(), (0x05, 0x0102, &b"x"[..]));
    }

    #[test]
    fn unknown_family_has_no_codec() {
        assert!(codec_for(ProtocolKind::Unknown).is_none());
        assert_eq!(codec_for(ProtocolKind::MeshCore).unwrap().kind(), ProtocolKind::MeshCore);
    }
}
