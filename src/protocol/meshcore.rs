//! MeshCore companion framing
//!
//! Frames carry a direction marker (`<` app to radio, `>` radio to app) and
//! a little-endian length, then `opcode | tag (u16 LE) | JSON payload`.
//! The companion protocol has no ping command.

use super::{
    decode_body, encode_body, from_json, join_frame, split_frame, to_json, ChannelInfo, Contact,
    Endian, ErrorBody, FrameCodec, Inbound, MeshPacket, Reply, Request, SelfInfo, SendPayloadBody,
    SessionCapabilities, UNSOLICITED_TAG,
};
use crate::bluetooth::ProtocolKind;
use crate::error::ProtocolError;

const TO_RADIO: [u8; 1] = [b'<'];
const FROM_RADIO: [u8; 1] = [b'>'];
const ENDIAN: Endian = Endian::Little;

// Commands
const CMD_APP_START: u8 = 0x01;
const CMD_SEND_CHANNEL_TXT: u8 = 0x03;
const CMD_GET_CONTACTS: u8 = 0x04;
const CMD_GET_CHANNELS: u8 = 0x1F;
const CMD_SET_CHANNEL: u8 = 0x20;

// Responses and pushes
const RESP_OK: u8 = 0x00;
const RESP_ERR: u8 = 0x01;
const RESP_CONTACTS: u8 = 0x03;
const RESP_SELF_INFO: u8 = 0x05;
const RESP_CHANNELS: u8 = 0x12;
const PUSH_CHANNEL_MSG: u8 = 0x88;

#[derive(Debug, Clone, Copy, Default)]
pub struct MeshCoreCodec;

impl FrameCodec for MeshCoreCodec {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::MeshCore
    }

    fn capabilities(&self) -> SessionCapabilities {
        SessionCapabilities {
            ping: false,
            debug_topology: false,
        }
    }

    fn encode_request(&self, tag: u16, request: &Request) -> Result<Vec<u8>, ProtocolError> {
        let (opcode, payload) = match request {
            Request::GetSelfInfo => (CMD_APP_START, Vec::new()),
            Request::GetContacts => (CMD_GET_CONTACTS, Vec::new()),
            Request::GetChannels => (CMD_GET_CHANNELS, Vec::new()),
            Request::SetChannel(channel) => (CMD_SET_CHANNEL, to_json(channel)?),
            Request::SendPayload { channel, payload } => (
                CMD_SEND_CHANNEL_TXT,
                to_json(&SendPayloadBody {
                    channel: *channel,
                    payload: payload.clone(),
                })?,
            ),
            Request::Ping => return Err(ProtocolError::Unsupported("ping")),
        };
        join_frame(&TO_RADIO, encode_body(opcode, tag, &payload, ENDIAN), ENDIAN)
    }

    fn decode_inbound(&self, frame: &[u8]) -> Result<Inbound, ProtocolError> {
        let body = split_frame(frame, &FROM_RADIO, ENDIAN)?;
        let (opcode, tag, payload) = decode_body(body, ENDIAN)?;

        let reply = match opcode {
            PUSH_CHANNEL_MSG => return Ok(Inbound::MeshPacket(from_json(payload)?)),
            RESP_OK => Reply::Ack,
            RESP_ERR => Reply::Error {
                code: from_json::<ErrorBody>(payload)?.code,
            },
            RESP_CONTACTS => Reply::Contacts(from_json::<Vec<Contact>>(payload)?),
            RESP_SELF_INFO => Reply::SelfInfo(from_json::<SelfInfo>(payload)?),
            RESP_CHANNELS => Reply::Channels(from_json::<Vec<ChannelInfo>>(payload)?),
            other => {
                return Err(ProtocolError::Malformed(format!(
                    "unknown meshcore response 0x{other:02x}"
                )))
            }
        };
        Ok(Inbound::Reply { tag, reply })
    }

    fn decode_request(&self, frame: &[u8]) -> Result<(u16, Request), ProtocolError> {
        let body = split_frame(frame, &TO_RADIO, ENDIAN)?;
        let (opcode, tag, payload) = decode_body(body, ENDIAN)?;

        let request = match opcode {
            CMD_APP_START => Request::GetSelfInfo,
            CMD_GET_CONTACTS => Request::GetContacts,
            CMD_GET_CHANNELS => Request::GetChannels,
            CMD_SET_CHANNEL => Request::SetChannel(from_json(payload)?),
            CMD_SEND_CHANNEL_TXT => {
                let body: SendPayloadBody = from_json(payload)?;
                Request::SendPayload {
                    channel: body.channel,
                    payload: body.payload,
                }
            }
            other => {
                return Err(ProtocolError::Malformed(format!(
                    "unknown meshcore command 0x{other:02x}"
                )))
            }
        };
        Ok((tag, request))
    }

    fn encode_reply(&self, tag: u16, reply: &Reply) -> Result<Vec<u8>, ProtocolError> {
        let (opcode, payload) = match reply {
            Reply::SelfInfo(info) => (RESP_SELF_INFO, to_json(info)?),
            Reply::Contacts(contacts) => (RESP_CONTACTS, to_json(contacts)?),
            Reply::Channels(channels) => (RESP_CHANNELS, to_json(channels)?),
            Reply::Ack => (RESP_OK, Vec::new()),
            Reply::Error { code } => (RESP_ERR, to_json(&ErrorBody { code: *code })?),
            Reply::Pong => return Err(ProtocolError::Unsupported("ping")),
        };
        join_frame(&FROM_RADIO, encode_body(opcode, tag, &payload, ENDIAN), ENDIAN)
    }

    fn encode_mesh_packet(&self, packet: &MeshPacket) -> Result<Vec<u8>, ProtocolError> {
        join_frame(
            &FROM_RADIO,
            encode_body(PUSH_CHANNEL_MSG, UNSOLICITED_TAG, &to_json(packet)?, ENDIAN),
            ENDIAN,
        )
    }
}
