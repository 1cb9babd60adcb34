//! Meshtastic framing
//!
//! Every frame starts with the 0x94 0xC3 stream marker and a big-endian
//! length, followed by `opcode | tag (u16 BE) | JSON payload`.

use super::{
    decode_body, encode_body, from_json, join_frame, split_frame, to_json, ChannelInfo, Contact,
    Endian, ErrorBody, FrameCodec, Inbound, MeshPacket, Reply, Request, SelfInfo, SendPayloadBody,
    SessionCapabilities, UNSOLICITED_TAG,
};
use crate::bluetooth::ProtocolKind;
use crate::error::ProtocolError;

const START: [u8; 2] = [0x94, 0xC3];
const ENDIAN: Endian = Endian::Big;

// App to radio
const WANT_CONFIG: u8 = 0x01;
const GET_NODES: u8 = 0x02;
const GET_CHANNELS: u8 = 0x03;
const SET_CHANNEL: u8 = 0x04;
const HEARTBEAT: u8 = 0x05;
const SEND_TEXT: u8 = 0x06;

// Radio to app
const MY_INFO: u8 = 0x81;
const NODE_LIST: u8 = 0x82;
const CHANNEL_LIST: u8 = 0x83;
const ACK: u8 = 0x84;
const HEARTBEAT_ACK: u8 = 0x85;
const MESH_PACKET: u8 = 0x90;
const ERROR: u8 = 0xEE;

#[derive(Debug, Clone, Copy, Default)]
pub struct MeshtasticCodec;

impl FrameCodec for MeshtasticCodec {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Meshtastic
    }

    fn capabilities(&self) -> SessionCapabilities {
        SessionCapabilities {
            ping: true,
            debug_topology: true,
        }
    }

    fn encode_request(&self, tag: u16, request: &Request) -> Result<Vec<u8>, ProtocolError> {
        let (opcode, payload) = match request {
            Request::GetSelfInfo => (WANT_CONFIG, Vec::new()),
            Request::GetContacts => (GET_NODES, Vec::new()),
            Request::GetChannels => (GET_CHANNELS, Vec::new()),
            Request::SetChannel(channel) => (SET_CHANNEL, to_json(channel)?),
            Request::Ping => (HEARTBEAT, Vec::new()),
            Request::SendPayload { channel, payload } => (
                SEND_TEXT,
                to_json(&SendPayloadBody {
                    channel: *channel,
                    payload: payload.clone(),
                })?,
            ),
        };
        join_frame(&START, encode_body(opcode, tag, &payload, ENDIAN), ENDIAN)
    }

    fn decode_inbound(&self, frame: &[u8]) -> Result<Inbound, ProtocolError> {
        let body = split_frame(frame, &START, ENDIAN)?;
        let (opcode, tag, payload) = decode_body(body, ENDIAN)?;

        let reply = match opcode {
            MESH_PACKET => return Ok(Inbound::MeshPacket(from_json(payload)?)),
            MY_INFO => Reply::SelfInfo(from_json::<SelfInfo>(payload)?),
            NODE_LIST => Reply::Contacts(from_json::<Vec<Contact>>(payload)?),
            CHANNEL_LIST => Reply::Channels(from_json::<Vec<ChannelInfo>>(payload)?),
            ACK => Reply::Ack,
            HEARTBEAT_ACK => Reply::Pong,
            ERROR => Reply::Error {
                code: from_json::<ErrorBody>(payload)?.code,
            },
            other => {
                return Err(ProtocolError::Malformed(format!(
                    "unknown meshtastic opcode 0x{other:02x}"
                )))
            }
        };
        Ok(Inbound::Reply { tag, reply })
    }

    fn decode_request(&self, frame: &[u8]) -> Result<(u16, Request), ProtocolError> {
        let body = split_frame(frame, &START, ENDIAN)?;
        let (opcode, tag, payload) = decode_body(body, ENDIAN)?;

        let request = match opcode {
            WANT_CONFIG => Request::GetSelfInfo,
            GET_NODES => Request::GetContacts,
            GET_CHANNELS => Request::GetChannels,
            SET_CHANNEL => Request::SetChannel(from_json(payload)?),
            HEARTBEAT => Request::Ping,
            SEND_TEXT => {
                let body: SendPayloadBody = from_json(payload)?;
                Request::SendPayload {
                    channel: body.channel,
                    payload: body.payload,
                }
            }
            other => {
                return Err(ProtocolError::Malformed(format!(
                    "unknown meshtastic request 0x{other:02x}"
                )))
            }
        };
        Ok((tag, request))
    }

    fn encode_reply(&self, tag: u16, reply: &Reply) -> Result<Vec<u8>, ProtocolError> {
        let (opcode, payload) = match reply {
            Reply::SelfInfo(info) => (MY_INFO, to_json(info)?),
            Reply::Contacts(contacts) => (NODE_LIST, to_json(contacts)?),
            Reply::Channels(channels) => (CHANNEL_LIST, to_json(channels)?),
            Reply::Ack => (ACK, Vec::new()),
            Reply::Pong => (HEARTBEAT_ACK, Vec::new()),
            Reply::Error { code } => (ERROR, to_json(&ErrorBody { code: *code })?),
        };
        join_frame(&START, encode_body(opcode, tag, &payload, ENDIAN), ENDIAN)
    }

    fn encode_mesh_packet(&self, packet: &MeshPacket) -> Result<Vec<u8>, ProtocolError> {
        join_frame(
            &START,
            encode_body(MESH_PACKET, UNSOLICITED_TAG, &to_json(packet)?, ENDIAN),
            ENDIAN,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_layout() {
        let frame = MeshtasticCodec.encode_request(0x0203, &Request::GetSelfInfo).unwrap();
        assert_eq!(frame, vec![0x94, 0xC3, 0x00, 0x03, WANT_CONFIG, 0x02, 0x03]);
    }

    #[test]
    fn radio_side_understands_app_requests() {
        let channel = ChannelInfo {
            index: 1,
            name: "signals".to_string(),
            psk: Some("01".to_string()),
        };
        let frame = MeshtasticCodec
            .encode_request(7, &Request::SetChannel(channel.clone()))
            .unwrap();

        assert_eq!(
            MeshtasticCodec.decode_request(&frame).unwrap(),
            (7, Request::SetChannel(channel))
        );
    }

    #[test]
    fn error_reply_carries_code() {
        let frame = MeshtasticCodec.encode_reply(9, &Reply::Error { code: 3 }).unwrap();
        assert_eq!(
            MeshtasticCodec.decode_inbound(&frame).unwrap(),
            Inbound::Reply {
                tag: 9,
                reply: Reply::Error { code: 3 }
            }
        );
    }

    #[test]
    fn mesh_packets_are_unsolicited() {
        let packet = MeshPacket {
            from: 0x1234,
            packet_id: Some(77),
            channel: 0,
            hop_count: Some(2),
            payload: vec![0x53, 0x01],
        };
        let frame = MeshtasticCodec.encode_mesh_packet(&packet).unwrap();
        assert_eq!(&frame[4..7], &[MESH_PACKET, 0x00, 0x00]);
        assert_eq!(MeshtasticCodec.decode_inbound(&frame).unwrap(), Inbound::MeshPacket(packet));
    }

    #[test]
    fn unknown_opcode_is_malformed() {
        let frame = join_frame(&START, encode_body(0x42, 1, &[], ENDIAN), ENDIAN).unwrap();
        assert!(matches!(
            MeshtasticCodec.decode_inbound(&frame),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
