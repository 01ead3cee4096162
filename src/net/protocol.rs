use serde::{Deserialize, Serialize};

use crate::avatar::data::AvatarPose;
use crate::avatar::identity::AvatarIdentity;
use crate::net::peer::PeerId;

/// Bytes a peer id occupies on the wire (RFC 4122 form)
pub const PEER_ID_BYTES: usize = 16;

/// Packets from clients to the mixer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InboundPacket {
    /// Latest pose, tagged with the client's modular sequence number
    AvatarData { sequence: u16, pose: AvatarPose },
    /// Descriptive identity (display name, model)
    AvatarIdentity(AvatarIdentity),
    /// Client is leaving
    KillAvatar,
    /// Explicitly ignore (or stop ignoring) other peers
    NodeIgnoreRequest { ignored: Vec<PeerId>, enabled: bool },
    /// Toggle the proximity ignore bubble
    RadiusIgnoreRequest { enabled: bool },
}

/// Why an avatar was removed from everyone's view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KillAvatarReason {
    NoReason,
    AvatarDisconnected,
}

/// Packets from the mixer to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OutboundPacket {
    /// One tick's worth of other avatars for a single receiver
    BulkAvatarData(AvatarBatch),
    /// Identity of `avatar_id`
    AvatarIdentity { avatar_id: PeerId, identity: AvatarIdentity },
    /// `avatar_id` is gone
    KillAvatar { avatar_id: PeerId, reason: KillAvatarReason },
}

/// A self-describing segment inside a bulk batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvatarSegment {
    pub sender: PeerId,
    /// Encoded `AvatarUpdate`
    pub payload: Vec<u8>,
}

impl AvatarSegment {
    #[inline]
    pub fn wire_len(&self) -> usize {
        PEER_ID_BYTES + self.payload.len()
    }
}

/// Append-only container of avatar segments for one receiver
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AvatarBatch {
    segments: Vec<AvatarSegment>,
}

impl AvatarBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a segment, returning the bytes it adds to the batch
    pub fn push(&mut self, sender: PeerId, payload: Vec<u8>) -> usize {
        let segment = AvatarSegment { sender, payload };
        let len = segment.wire_len();
        self.segments.push(segment);
        len
    }

    pub fn segments(&self) -> &[AvatarSegment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn contains(&self, sender: PeerId) -> bool {
        self.segments.iter().any(|s| s.sender == sender)
    }

    pub fn wire_len(&self) -> usize {
        self.segments.iter().map(AvatarSegment::wire_len).sum()
    }
}

/// Encode a message using bincode
/// Uses legacy config for fixed-size integers
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, EncodeError> {
    bincode::serde::encode_to_vec(message, bincode::config::legacy())
        .map_err(|e| EncodeError(e.to_string()))
}

/// Decode a message using bincode
pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, DecodeError> {
    bincode::serde::decode_from_slice(data, bincode::config::legacy())
        .map(|(msg, _)| msg)
        .map_err(|e| DecodeError(e.to_string()))
}

#[derive(Debug, thiserror::Error)]
#[error("Encode error: {0}")]
pub struct EncodeError(String);

#[derive(Debug, thiserror::Error)]
#[error("Decode error: {0}")]
pub struct DecodeError(String);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::vec3::Vec3;
    use uuid::Uuid;

    #[test]
    fn test_batch_accounting() {
        let mut batch = AvatarBatch::new();
        assert!(batch.is_empty());

        let a = Uuid::new_v4();
        let added = batch.push(a, vec![0u8; 10]);
        assert_eq!(added, PEER_ID_BYTES + 10);
        batch.push(Uuid::new_v4(), vec![0u8; 4]);

        assert_eq!(batch.len(), 2);
        assert!(batch.contains(a));
        assert_eq!(batch.wire_len(), 2 * PEER_ID_BYTES + 14);
    }

    #[test]
    fn test_inbound_avatar_data_decodes() {
        let pose = AvatarPose {
            global_position: Vec3::new(4.0, 5.0, 6.0),
            ..Default::default()
        };
        let bytes = encode(&InboundPacket::AvatarData { sequence: 42, pose }).unwrap();

        match decode::<InboundPacket>(&bytes).unwrap() {
            InboundPacket::AvatarData { sequence, pose } => {
                assert_eq!(sequence, 42);
                assert_eq!(pose.global_position, Vec3::new(4.0, 5.0, 6.0));
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode::<InboundPacket>(&[0xff, 0xff, 0xff, 0xff, 0x01]).is_err());
    }
}
