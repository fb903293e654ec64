//! Pilot Wire Protocol Types
//!
//! This crate defines the Protobuf message types exchanged between peers of a
//! session. Every peer depends on it, so host and clients always agree on the
//! schema.
//!
//! # Message Directions
//!
//! - **Client → State Authority**: [`InputCmdProto`], [`SetFieldRequest`]
//! - **State Authority → Clients**: [`Welcome`], [`EntitySpawned`],
//!   [`EntityDespawned`], [`InputAuthorityChanged`], [`SnapshotProto`],
//!   [`FieldUpdate`]
//!
//! Every message travels inside a [`Packet`] envelope. The sending peer is
//! bound by the transport and is never part of the payload.

#![deny(unsafe_code)]

use prost::{Message, Oneof};
use thiserror::Error;

// ============================================================================
// Type Aliases (matching simulation crate)
// ============================================================================

pub type Tick = u64;

pub type PeerId = u32;

pub type EntityId = u64;

/// Wire value meaning "no peer" (peer ids start at 1).
pub const NO_PEER: PeerId = 0;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum WireError {
    #[error("failed to decode packet: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("packet carries no body")]
    EmptyPacket,

    #[error("{field} must have exactly {expected} elements, got {actual}")]
    BadLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
}

// ============================================================================
// Session Messages
// ============================================================================

/// Sent by the state authority to a peer right after it joined.
#[derive(Clone, PartialEq, Message)]
pub struct Welcome {
    /// Peer holding state authority for every entity of the session.
    #[prost(uint32, tag = "1")]
    pub host_peer_id: PeerId,

    /// Authority's current (pre-step) tick.
    #[prost(uint64, tag = "2")]
    pub tick: Tick,

    #[prost(uint32, tag = "3")]
    pub tick_rate_hz: u32,

    /// Earliest tick the authority will accept input for.
    #[prost(uint64, tag = "4")]
    pub target_tick_floor: Tick,

    /// Digest algorithm used for snapshot desync detection.
    #[prost(string, tag = "5")]
    pub state_digest_algo_id: String,
}

// ============================================================================
// Input Replication
// ============================================================================

/// Input sampled by the input authority for one tick.
#[derive(Clone, PartialEq, Message)]
pub struct InputCmdProto {
    /// Target tick for this input.
    #[prost(uint64, tag = "1")]
    pub tick: Tick,

    /// Movement axes [x, y], each within [-1, 1].
    #[prost(double, repeated, tag = "2")]
    pub move_axis: Vec<f64>,

    #[prost(bool, tag = "3")]
    pub action: bool,
}

// ============================================================================
// Entity Replication
// ============================================================================

#[derive(Clone, PartialEq, Message)]
pub struct TransformProto {
    /// Position [x, y, z].
    #[prost(double, repeated, tag = "1")]
    pub position: Vec<f64>,

    /// Heading about the vertical axis, radians.
    #[prost(double, tag = "2")]
    pub yaw: f64,
}

/// A named text field and its current value.
#[derive(Clone, PartialEq, Message)]
pub struct FieldValueProto {
    #[prost(string, tag = "1")]
    pub field_name: String,

    #[prost(string, tag = "2")]
    pub value: String,
}

/// Announces a replicated entity, with everything a late joiner needs to
/// catch up.
#[derive(Clone, PartialEq, Message)]
pub struct EntitySpawned {
    #[prost(uint64, tag = "1")]
    pub entity_id: EntityId,

    #[prost(uint32, tag = "2")]
    pub state_authority: PeerId,

    /// `NO_PEER` when nobody controls the entity.
    #[prost(uint32, tag = "3")]
    pub input_authority: PeerId,

    #[prost(message, optional, tag = "4")]
    pub transform: Option<TransformProto>,

    #[prost(message, repeated, tag = "5")]
    pub fields: Vec<FieldValueProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct EntityDespawned {
    #[prost(uint64, tag = "1")]
    pub entity_id: EntityId,
}

#[derive(Clone, PartialEq, Message)]
pub struct InputAuthorityChanged {
    #[prost(uint64, tag = "1")]
    pub entity_id: EntityId,

    /// `NO_PEER` when control was revoked.
    #[prost(uint32, tag = "2")]
    pub input_authority: PeerId,
}

/// Entity transform embedded in [`SnapshotProto`].
#[derive(Clone, PartialEq, Message)]
pub struct EntityTransformProto {
    #[prost(uint64, tag = "1")]
    pub entity_id: EntityId,

    #[prost(message, optional, tag = "2")]
    pub transform: Option<TransformProto>,
}

/// Post-step transform broadcast.
#[derive(Clone, PartialEq, Message)]
pub struct SnapshotProto {
    /// Post-step tick.
    #[prost(uint64, tag = "1")]
    pub tick: Tick,

    /// Ordered by entity_id ascending.
    #[prost(message, repeated, tag = "2")]
    pub entities: Vec<EntityTransformProto>,

    #[prost(uint64, tag = "3")]
    pub digest: u64,

    #[prost(uint64, tag = "4")]
    pub target_tick_floor: Tick,
}

/// Authoritative value of a field that changed during `tick`.
#[derive(Clone, PartialEq, Message)]
pub struct FieldUpdate {
    #[prost(uint64, tag = "1")]
    pub entity_id: EntityId,

    #[prost(uint64, tag = "2")]
    pub tick: Tick,

    #[prost(message, optional, tag = "3")]
    pub field: Option<FieldValueProto>,
}

// ============================================================================
// Remote Mutation
// ============================================================================

/// Request from the input authority asking the state authority to assign a
/// networked field.
#[derive(Clone, PartialEq, Message)]
pub struct SetFieldRequest {
    #[prost(uint64, tag = "1")]
    pub entity_id: EntityId,

    #[prost(string, tag = "2")]
    pub field_name: String,

    #[prost(string, tag = "3")]
    pub value: String,
}

// ============================================================================
// Envelope
// ============================================================================

#[derive(Clone, PartialEq, Message)]
pub struct Packet {
    #[prost(oneof = "Body", tags = "1, 2, 3, 4, 5, 6, 7, 8")]
    pub body: Option<Body>,
}

#[derive(Clone, PartialEq, Oneof)]
pub enum Body {
    #[prost(message, tag = "1")]
    Welcome(Welcome),
    #[prost(message, tag = "2")]
    Input(InputCmdProto),
    #[prost(message, tag = "3")]
    SetField(SetFieldRequest),
    #[prost(message, tag = "4")]
    Spawned(EntitySpawned),
    #[prost(message, tag = "5")]
    Despawned(EntityDespawned),
    #[prost(message, tag = "6")]
    AuthorityChanged(InputAuthorityChanged),
    #[prost(message, tag = "7")]
    Snapshot(SnapshotProto),
    #[prost(message, tag = "8")]
    FieldUpdate(FieldUpdate),
}

impl Body {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Welcome(_) => "welcome",
            Self::Input(_) => "input",
            Self::SetField(_) => "set_field",
            Self::Spawned(_) => "spawned",
            Self::Despawned(_) => "despawned",
            Self::AuthorityChanged(_) => "authority_changed",
            Self::Snapshot(_) => "snapshot",
            Self::FieldUpdate(_) => "field_update",
        }
    }
}

/// Encode a packet body into bytes ready for the transport.
pub fn encode_packet(body: Body) -> Vec<u8> {
    Packet { body: Some(body) }.encode_to_vec()
}

/// Decode bytes received from the transport.
pub fn decode_packet(bytes: &[u8]) -> Result<Body, WireError> {
    Packet::decode(bytes)?.body.ok_or(WireError::EmptyPacket)
}

// ============================================================================
// Conversion Traits
// ============================================================================

impl From<pilot_sim::Transform> for TransformProto {
    fn from(t: pilot_sim::Transform) -> Self {
        Self {
            position: t.position.to_vec(),
            yaw: t.yaw,
        }
    }
}

impl TryFrom<TransformProto> for pilot_sim::Transform {
    type Error = WireError;

    fn try_from(t: TransformProto) -> Result<Self, Self::Error> {
        let position: [f64; 3] =
            t.position
                .as_slice()
                .try_into()
                .map_err(|_| WireError::BadLength {
                    field: "position",
                    expected: 3,
                    actual: t.position.len(),
                })?;
        Ok(Self { position, yaw: t.yaw })
    }
}

impl From<pilot_sim::EntitySnapshot> for EntityTransformProto {
    fn from(e: pilot_sim::EntitySnapshot) -> Self {
        Self {
            entity_id: e.entity_id,
            transform: Some(e.transform.into()),
        }
    }
}

impl TryFrom<EntityTransformProto> for pilot_sim::EntitySnapshot {
    type Error = WireError;

    fn try_from(e: EntityTransformProto) -> Result<Self, Self::Error> {
        Ok(Self {
            entity_id: e.entity_id,
            transform: e.transform.unwrap_or_default().try_into()?,
        })
    }
}

impl SnapshotProto {
    /// Build the broadcast form of a simulation snapshot.
    pub fn from_snapshot(snapshot: pilot_sim::Snapshot, target_tick_floor: Tick) -> Self {
        Self {
            tick: snapshot.tick,
            entities: snapshot.entities.into_iter().map(Into::into).collect(),
            digest: snapshot.digest,
            target_tick_floor,
        }
    }
}

impl TryFrom<SnapshotProto> for pilot_sim::Snapshot {
    type Error = WireError;

    fn try_from(s: SnapshotProto) -> Result<Self, Self::Error> {
        let entities: Result<Vec<_>, _> = s.entities.into_iter().map(TryInto::try_into).collect();
        Ok(Self {
            tick: s.tick,
            entities: entities?,
            digest: s.digest,
        })
    }
}

/// Map a wire peer id to an optional peer.
pub fn peer_from_wire(peer: PeerId) -> Option<PeerId> {
    (peer != NO_PEER).then_some(peer)
}

/// Map an optional peer to its wire form.
pub fn peer_to_wire(peer: Option<PeerId>) -> PeerId {
    peer.unwrap_or(NO_PEER)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_roundtrip_keeps_body_variant() {
        let body = Body::SetField(SetFieldRequest {
            entity_id: 3,
            field_name: "PlayerName".to_string(),
            value: "Player_2".to_string(),
        });

        let bytes = encode_packet(body.clone());
        let decoded = decode_packet(&bytes).unwrap();

        assert_eq!(decoded, body);
        assert_eq!(decoded.kind(), "set_field");
    }

    #[test]
    fn test_empty_packet_rejected() {
        let bytes = Packet { body: None }.encode_to_vec();
        assert!(matches!(decode_packet(&bytes), Err(WireError::EmptyPacket)));
    }

    #[test]
    fn test_garbage_rejected() {
        let result = decode_packet(&[0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(result, Err(WireError::Decode(_))));
    }

    #[test]
    fn test_transform_requires_three_axes() {
        let proto = TransformProto {
            position: vec![1.0, 2.0],
            yaw: 0.0,
        };
        let result: Result<pilot_sim::Transform, _> = proto.try_into();
        assert!(matches!(
            result,
            Err(WireError::BadLength {
                field: "position",
                expected: 3,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_snapshot_conversion_preserves_transforms() {
        let snapshot = pilot_sim::Snapshot {
            tick: 11,
            entities: vec![pilot_sim::EntitySnapshot {
                entity_id: 1,
                transform: pilot_sim::Transform {
                    position: [0.5, 0.0, -2.0],
                    yaw: 1.25,
                },
            }],
            digest: 0xdeadbeef,
        };

        let proto = SnapshotProto::from_snapshot(snapshot.clone(), 12);
        assert_eq!(proto.target_tick_floor, 12);

        let bytes = encode_packet(Body::Snapshot(proto));
        let Body::Snapshot(decoded) = decode_packet(&bytes).unwrap() else {
            panic!("expected snapshot body");
        };
        let back: pilot_sim::Snapshot = decoded.try_into().unwrap();
        assert_eq!(back, snapshot);
    }

    #[test]
    fn test_peer_wire_mapping() {
        assert_eq!(peer_from_wire(NO_PEER), None);
        assert_eq!(peer_from_wire(4), Some(4));
        assert_eq!(peer_to_wire(None), NO_PEER);
        assert_eq!(peer_to_wire(Some(4)), 4);
    }
}
