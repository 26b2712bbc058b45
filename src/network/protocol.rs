//! Protocol Messages
//!
//! Wire format for peer-to-peer calls relayed through the host.
//! Frames are bincode on the wire, with JSON helpers for debugging.
//!
//! Enums are externally tagged: bincode cannot decode internally tagged
//! (`#[serde(tag = ...)]`) representations.

use serde::{Serialize, Deserialize};

use crate::game::entity::{FieldDelta, PeerId, ReplicatedFields};

/// Delivery guarantee requested from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Delivery {
    /// Ordered, retransmitted.
    Reliable,
    /// May be dropped or reordered.
    Unreliable,
}

/// Who a call is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    /// One peer.
    Peer(PeerId),
    /// The session host.
    Host,
    /// Every peer except the sender.
    All,
}

// =============================================================================
// REMOTE CALLS
// =============================================================================

/// A remote procedure invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteCall {
    /// Owner -> everyone: replicated field changes.
    ApplyState {
        /// Entity being updated.
        entity: PeerId,
        /// Per-entity sequence number (strictly increasing per owner).
        seq: u64,
        /// Changed fields.
        delta: FieldDelta,
    },

    /// Shooter -> victim's owner: apply damage.
    TakeDamage {
        /// Victim entity.
        entity: PeerId,
        /// Damage amount.
        amount: u32,
        /// Shooter's entity.
        attacker: PeerId,
    },

    /// Victim's owner -> attacker's owner: credit a kill.
    AddKill {
        /// Entity to credit.
        attacker: PeerId,
    },

    /// Host -> clients: authoritative match clock.
    SetRemainingTime {
        /// Seconds left.
        seconds: f64,
    },

    /// Host -> clients: match result.
    AnnounceResult {
        /// Winner, `None` on a tie.
        winner: Option<PeerId>,
    },

    /// Host -> clients: an entity exists.
    SpawnEntity {
        /// Entity id (and owner).
        entity: PeerId,
        /// Full current state.
        fields: ReplicatedFields,
    },

    /// Host -> clients: an entity is gone.
    DespawnEntity {
        /// Entity id.
        entity: PeerId,
    },
}

impl RemoteCall {
    /// Procedure name, used as the dispatch-table key.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ApplyState { .. } => "apply_state",
            Self::TakeDamage { .. } => "take_damage",
            Self::AddKill { .. } => "add_kill",
            Self::SetRemainingTime { .. } => "set_remaining_time",
            Self::AnnounceResult { .. } => "announce_result",
            Self::SpawnEntity { .. } => "spawn_entity",
            Self::DespawnEntity { .. } => "despawn_entity",
        }
    }

    /// The entity whose ownership the authority rules refer to.
    pub fn subject(&self) -> Option<PeerId> {
        match self {
            Self::ApplyState { entity, .. }
            | Self::TakeDamage { entity, .. }
            | Self::SpawnEntity { entity, .. }
            | Self::DespawnEntity { entity } => Some(*entity),
            Self::AddKill { attacker } => Some(*attacker),
            Self::SetRemainingTime { .. } | Self::AnnounceResult { .. } => None,
        }
    }

    /// Delivery class. State snapshots tolerate loss; everything else does not.
    pub fn delivery(&self) -> Delivery {
        match self {
            Self::ApplyState { .. } => Delivery::Unreliable,
            _ => Delivery::Reliable,
        }
    }
}

/// A call plus routing information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Peer that issued the call. Preserved across host relay.
    pub origin: PeerId,
    /// Addressee.
    pub target: Target,
    /// The call.
    pub call: RemoteCall,
}

impl Envelope {
    /// Create an envelope.
    pub fn new(origin: PeerId, target: Target, call: RemoteCall) -> Self {
        Self { origin, target, call }
    }
}

// =============================================================================
// FRAMES
// =============================================================================

/// Top-level wire frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// Host -> new client: handshake with the assigned id.
    Welcome {
        /// Id assigned to the client.
        peer_id: PeerId,
    },
    /// A routed call.
    Call(Envelope),
}

/// Encode/decode failure.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Binary codec failure.
    #[error("binary codec error: {0}")]
    Binary(#[from] bincode::Error),

    /// JSON codec failure.
    #[error("json codec error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Frame {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Serialize to binary (bincode).
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from binary (bincode).
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::vec3::Vec3;

    #[test]
    fn test_binary_frame_with_partial_delta() {
        let frame = Frame::Call(Envelope::new(
            PeerId(3),
            Target::All,
            RemoteCall::ApplyState {
                entity: PeerId(3),
                seq: 41,
                delta: FieldDelta {
                    position: Some(Vec3::new(1.0, 2.0, 3.0)),
                    kills: Some(4),
                    ..Default::default()
                },
            },
        ));

        let bytes = frame.to_bytes().unwrap();
        assert_eq!(Frame::from_bytes(&bytes).unwrap(), frame);

        // A partial delta is smaller than a keyframe
        let full = Frame::Call(Envelope::new(
            PeerId(3),
            Target::All,
            RemoteCall::ApplyState {
                entity: PeerId(3),
                seq: 42,
                delta: FieldDelta::full(&ReplicatedFields::default()),
            },
        ));
        assert!(bytes.len() < full.to_bytes().unwrap().len());
    }

    #[test]
    fn test_welcome_json() {
        let frame = Frame::Welcome { peer_id: PeerId(2) };
        let json = frame.to_json().unwrap();
        assert!(json.contains("Welcome"));
        assert_eq!(Frame::from_json(&json).unwrap(), frame);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(Frame::from_bytes(&[0xff, 0xff, 0xff, 0xff, 0x01]), Err(ProtocolError::Binary(_))));
        assert!(matches!(Frame::from_json("{\"Nope\":1}"), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn test_call_metadata() {
        let state = RemoteCall::ApplyState { entity: PeerId(2), seq: 1, delta: FieldDelta::default() };
        assert_eq!(state.name(), "apply_state");
        assert_eq!(state.delivery(), Delivery::Unreliable);
        assert_eq!(state.subject(), Some(PeerId(2)));

        let kill = RemoteCall::AddKill { attacker: PeerId(5) };
        assert_eq!(kill.subject(), Some(PeerId(5)));
        assert_eq!(kill.delivery(), Delivery::Reliable);

        assert_eq!(RemoteCall::SetRemainingTime { seconds: 10.0 }.subject(), None);
    }
}
