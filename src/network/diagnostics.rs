//! Session Diagnostics
//!
//! Point-in-time views of a session for debug overlays and the scoreboard.

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::core::vec3::Vec3;
use crate::game::entity::PeerId;
use crate::game::lifecycle::MatchPhase;
use crate::network::replication::ReplicationStats;
use crate::network::session::{ConnectionState, PeerRole};

/// One scoreboard row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreLine {
    /// Player.
    pub peer: PeerId,
    /// Kills.
    pub kills: u32,
    /// Deaths.
    pub deaths: u32,
    /// This row is the local player.
    pub is_local: bool,
}

/// Sort rows by kills (descending), then peer id.
pub fn sort_scoreboard(rows: &mut [ScoreLine]) {
    rows.sort_by(|a, b| b.kills.cmp(&a.kills).then(a.peer.cmp(&b.peer)));
}

/// A peer as seen locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerSummary {
    /// Peer id.
    pub id: PeerId,
    /// Host or client.
    pub role: PeerRole,
    /// Link state.
    pub state: ConnectionState,
}

/// An entity as seen locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySummary {
    /// Entity id.
    pub id: PeerId,
    /// Owning peer.
    pub owner: PeerId,
    /// Position.
    pub position: Vec3,
    /// Health.
    pub health: u32,
    /// Owned by this peer.
    pub local: bool,
}

/// Everything a debug overlay shows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// When the snapshot was taken.
    pub captured_at: DateTime<Utc>,
    /// Session id (hex, first four bytes).
    pub session: Option<String>,
    /// Local peer id, if in a session.
    pub local_id: Option<PeerId>,
    /// Local role.
    pub role: Option<PeerRole>,
    /// Known peers.
    pub peers: Vec<PeerSummary>,
    /// Known entities.
    pub entities: Vec<EntitySummary>,
    /// Match phase.
    pub phase: MatchPhase,
    /// Match clock.
    pub remaining_secs: f64,
    /// Replication counters.
    pub replication: ReplicationStats,
}

impl SessionSnapshot {
    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Check if this peer is the host.
    pub fn is_host(&self) -> bool {
        self.role == Some(PeerRole::Host)
    }
}
