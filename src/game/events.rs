//! Session Events
//!
//! Everything observable that happens in a session, published on a
//! broadcast channel. Presentation layers (HUD, scoreboard, audio)
//! subscribe instead of being called directly.

use serde::{Serialize, Deserialize};

use crate::core::vec3::Vec3;
use crate::game::entity::PeerId;

/// Event published by a `SessionManager`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SessionEvent {
    // -------------------------------------------------------------------------
    // Connection
    // -------------------------------------------------------------------------

    /// Hosting started; local id is always the host id.
    SessionStarted {
        /// Local peer id.
        local_id: PeerId,
        /// Listening port.
        port: u16,
    },

    /// Joined a host.
    SessionJoined {
        /// Id assigned by the host.
        local_id: PeerId,
    },

    /// A start/join attempt failed. The session stays idle.
    NetworkError {
        /// Transport error text.
        reason: String,
    },

    /// Local teardown completed.
    SessionEnded,

    /// The host went away (client only).
    HostLost,

    /// A peer joined the session.
    PeerConnected {
        /// Joining peer.
        peer: PeerId,
    },

    /// A peer left the session.
    PeerDisconnected {
        /// Departed peer.
        peer: PeerId,
    },

    // -------------------------------------------------------------------------
    // Entities
    // -------------------------------------------------------------------------

    /// An entity appeared.
    EntitySpawned {
        /// Entity id (same as its owner).
        entity: PeerId,
        /// Spawn position.
        position: Vec3,
    },

    /// An entity was removed.
    EntityDespawned {
        /// Entity id.
        entity: PeerId,
    },

    /// No spawn points were available; the fallback position was used.
    SpawnFallback {
        /// Entity id.
        entity: PeerId,
        /// Fallback position used.
        position: Vec3,
    },

    /// The scene never became ready for a pending spawn.
    SpawnAbandoned {
        /// Peer still waiting; spawned once the scene reports ready.
        entity: PeerId,
        /// Attempts made.
        attempts: u32,
    },

    // -------------------------------------------------------------------------
    // Combat
    // -------------------------------------------------------------------------

    /// A locally owned entity took damage.
    EntityDamaged {
        /// Damaged entity.
        entity: PeerId,
        /// Attacking peer.
        attacker: PeerId,
        /// Damage requested.
        amount: u32,
        /// Health after the hit.
        health: u32,
    },

    /// A locally owned entity died and respawned.
    PlayerDied {
        /// Entity that died.
        victim: PeerId,
        /// Peer credited with the kill.
        killer: PeerId,
        /// Respawn position.
        respawn_at: Vec3,
    },

    /// A locally owned entity was credited a kill.
    KillCredited {
        /// Entity credited.
        entity: PeerId,
        /// Kill total after crediting.
        kills: u32,
    },

    /// A remote call was refused by the authority rules.
    AuthorityRejected {
        /// Peer that issued the call.
        origin: PeerId,
        /// Procedure name.
        call: String,
        /// Violation text.
        reason: String,
    },

    // -------------------------------------------------------------------------
    // Match
    // -------------------------------------------------------------------------

    /// The match clock started.
    MatchStarted {
        /// Seconds on the clock.
        remaining: f64,
    },

    /// Remaining time changed (whole-second boundary).
    RemainingTime {
        /// Seconds left.
        seconds: f64,
    },

    /// The match is over.
    MatchEnded {
        /// Winner, or `None` on a tie.
        winner: Option<PeerId>,
    },
}

impl SessionEvent {
    /// Short name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionStarted { .. } => "session_started",
            Self::SessionJoined { .. } => "session_joined",
            Self::NetworkError { .. } => "network_error",
            Self::SessionEnded => "session_ended",
            Self::HostLost => "host_lost",
            Self::PeerConnected { .. } => "peer_connected",
            Self::PeerDisconnected { .. } => "peer_disconnected",
            Self::EntitySpawned { .. } => "entity_spawned",
            Self::EntityDespawned { .. } => "entity_despawned",
            Self::SpawnFallback { .. } => "spawn_fallback",
            Self::SpawnAbandoned { .. } => "spawn_abandoned",
            Self::EntityDamaged { .. } => "entity_damaged",
            Self::PlayerDied { .. } => "player_died",
            Self::KillCredited { .. } => "kill_credited",
            Self::AuthorityRejected { .. } => "authority_rejected",
            Self::MatchStarted { .. } => "match_started",
            Self::RemainingTime { .. } => "remaining_time",
            Self::MatchEnded { .. } => "match_ended",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json() {
        let event = SessionEvent::PlayerDied {
            victim: PeerId(2),
            killer: PeerId::HOST,
            respawn_at: Vec3::new(1.0, 0.5, 0.0),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("PlayerDied"));
        let back: SessionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.name(), "player_died");
    }
}
