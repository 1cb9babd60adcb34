//! Mesh wire format for signals
//!
//! `0x53 | version | flags | body`, where body is the JSON form of the
//! signal, LZ4 compressed (size prepended) when flag bit 0 is set. The
//! compressed form is only used when it is actually smaller. The size
//! prefix comes off the radio and is checked before anything is allocated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{
    AuthorRef, CoarseLocation, MediaRef, MediaState, Signal, SignalKind, SignalOrigin,
};
use crate::error::WireError;

pub const SIGNAL_MARKER: u8 = 0x53;
pub const WIRE_VERSION: u8 = 1;

const FLAG_LZ4: u8 = 0x01;
const HEADER_LEN: usize = 3;
const SIZE_PREFIX_LEN: usize = 4;
/// Largest decompressed body accepted from the mesh. A full-length signal
/// with location and presence is a small fraction of this.
pub const MAX_BODY_LEN: usize = 16 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct WireSignal {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    node: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user: Option<String>,
    content: String,
    created_ms: i64,
    expires_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    location: Option<CoarseLocation>,
    /// Media bytes never cross the mesh; only the fact that some exist
    #[serde(default)]
    has_media: bool,
    kind: SignalKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    presence: Option<serde_json::Value>,
}

pub fn encode(signal: &Signal) -> Result<Vec<u8>, WireError> {
    let wire = WireSignal {
        id: signal.id.clone(),
        node: signal.author.mesh_node,
        user: signal.author.cloud_user.clone(),
        content: signal.content.clone(),
        created_ms: signal.created_at.timestamp_millis(),
        expires_ms: signal.expires_at.timestamp_millis(),
        location: signal.location,
        has_media: signal.media.as_ref().is_some_and(|m| m.state != MediaState::None),
        kind: signal.kind,
        presence: signal.presence.clone(),
    };

    let json = serde_json::to_vec(&wire)?;
    let compressed = lz4_flex::compress_prepend_size(&json);
    let (flags, body) = if compressed.len() < json.len() {
        (FLAG_LZ4, compressed)
    } else {
        (0, json)
    };

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&[SIGNAL_MARKER, WIRE_VERSION, flags]);
    out.extend(body);
    Ok(out)
}

pub fn is_signal_payload(payload: &[u8]) -> bool {
    payload.first() == Some(&SIGNAL_MARKER)
}

/// Decode a mesh payload. `from` fills in the author when the sender left
/// it out; `hop_count` comes from the radio, not the payload.
pub fn decode(payload: &[u8], from: u32, hop_count: Option<u8>) -> Result<Signal, WireError> {
    if payload.len() < HEADER_LEN || !is_signal_payload(payload) {
        return Err(WireError::NotASignal);
    }
    if payload[1] != WIRE_VERSION {
        return Err(WireError::UnsupportedVersion(payload[1]));
    }

    let body = &payload[HEADER_LEN..];
    let wire: WireSignal = if payload[2] & FLAG_LZ4 != 0 {
        let json = decompress(body)?;
        serde_json::from_slice(&json)?
    } else {
        serde_json::from_slice(body)?
    };

    let created_at = timestamp(wire.created_ms)?;
    let expires_at = timestamp(wire.expires_ms)?;
    if expires_at <= created_at {
        return Err(WireError::Invalid("expiry is not after creation".to_string()));
    }
    if wire.id.trim().is_empty() {
        return Err(WireError::Invalid("empty id".to_string()));
    }

    Ok(Signal {
        id: wire.id,
        author: AuthorRef {
            mesh_node: wire.node.or(Some(from)),
            cloud_user: wire.user,
        },
        content: wire.content,
        created_at,
        expires_at,
        location: wire.location,
        media: wire.has_media.then_some(MediaRef {
            state: MediaState::PendingCloud,
            local_path: None,
            url: None,
        }),
        hop_count,
        presence: wire.presence,
        kind: wire.kind,
        origin: SignalOrigin::Mesh,
        cloud_synced: false,
    })
}

fn decompress(body: &[u8]) -> Result<Vec<u8>, WireError> {
    if body.len() < SIZE_PREFIX_LEN {
        return Err(WireError::Decompress("missing size prefix".to_string()));
    }
    let (prefix, block) = body.split_at(SIZE_PREFIX_LEN);
    let size = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    if size > MAX_BODY_LEN {
        return Err(WireError::Decompress(format!(
            "declared size {size} exceeds {MAX_BODY_LEN} bytes"
        )));
    }
    lz4_flex::decompress(block, size).map_err(|e| WireError::Decompress(e.to_string()))
}

fn timestamp(ms: i64) -> Result<DateTime<Utc>, WireError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| WireError::Invalid(format!("timestamp {ms} out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample(content: &str) -> Signal {
        let created_at = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        Signal {
            id: "0b6e3c1e-5f0a-4a8e-9a43-2f4b1f1f7a10".to_string(),
            author: AuthorRef {
                mesh_node: Some(0x1234),
                cloud_user: None,
            },
            content: content.to_string(),
            created_at,
            expires_at: created_at + Duration::minutes(30),
            location: Some(CoarseLocation {
                latitude: 47.608,
                longitude: -122.332,
                radius_m: 500.0,
            }),
            media: Some(MediaRef {
                state: MediaState::PendingCloud,
                local_path: Some("/private/photo.jpg".to_string()),
                url: None,
            }),
            hop_count: None,
            presence: None,
            kind: SignalKind::Text,
            origin: SignalOrigin::Local,
            cloud_synced: false,
        }
    }

    #[test]
    fn mesh_copy_drops_local_only_fields() {
        let original = sample("rockfall on the north switchbacks");
        let decoded = decode(&encode(&original).unwrap(), 0x9999, Some(2)).unwrap();

        assert_eq!(decoded.id, original.id);
        assert_eq!(decoded.created_at, original.created_at);
        assert_eq!(decoded.author.mesh_node, Some(0x1234));
        assert_eq!(decoded.hop_count, Some(2));
        assert_eq!(decoded.origin, SignalOrigin::Mesh);
        let media = decoded.media.unwrap();
        assert_eq!(media.state, MediaState::PendingCloud);
        assert_eq!(media.local_path, None);
    }

    #[test]
    fn repetitive_content_is_compressed() {
        let payload = encode(&sample(&"ha".repeat(140))).unwrap();
        assert_eq!(payload[2] & FLAG_LZ4, FLAG_LZ4);
        assert_eq!(decode(&payload, 1, None).unwrap().content, "ha".repeat(140));
    }

    #[test]
    fn sender_fills_missing_author() {
        let mut signal = sample("x");
        signal.author.mesh_node = None;
        let decoded = decode(&encode(&signal).unwrap(), 0x42, None).unwrap();
        assert_eq!(decoded.author.mesh_node, Some(0x42));
    }

    #[test]
    fn foreign_payloads_are_rejected() {
        assert!(matches!(decode(b"hello", 1, None), Err(WireError::NotASignal)));
        assert!(matches!(
            decode(&[SIGNAL_MARKER, 9, 0, b'{', b'}'], 1, None),
            Err(WireError::UnsupportedVersion(9))
        ));
        assert!(matches!(decode(&[SIGNAL_MARKER, 1, 0, b'{'], 1, None), Err(WireError::Json(_))));
    }

    #[test]
    fn oversized_size_prefix_is_rejected_before_allocating() {
        let payload = [SIGNAL_MARKER, WIRE_VERSION, FLAG_LZ4, 0xFF, 0xFF, 0xFF, 0xFF, 0x10, 0x41];
        assert!(matches!(decode(&payload, 1, None), Err(WireError::Decompress(_))));

        let truncated = [SIGNAL_MARKER, WIRE_VERSION, FLAG_LZ4, 0x05, 0x00];
        assert!(matches!(decode(&truncated, 1, None), Err(WireError::Decompress(_))));
    }
}
