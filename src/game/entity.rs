//! Player Entities
//!
//! The replicated avatar of one connected peer. An entity's id is the id of
//! the peer that owns it, and ownership is fixed at construction.
//!
//! ## Replicated fields
//!
//! ```text
//! position, rotation, velocity   transform (owner writes every frame)
//! health                         0..=100, clamped on every write
//! kills, deaths                  monotonic while the peer participates
//! ```

use std::fmt;
use serde::{Serialize, Deserialize};

use crate::core::vec3::Vec3;

/// Full health for every player.
pub const MAX_HEALTH: u32 = 100;

// =============================================================================
// PEER ID
// =============================================================================

/// Transport-assigned peer identifier. Also used as entity id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct PeerId(pub u32);

impl PeerId {
    /// The session host is always peer 1.
    pub const HOST: PeerId = PeerId(1);

    /// First id handed to a connecting client.
    pub const FIRST_CLIENT: PeerId = PeerId(2);

    /// Check if this is the host's id.
    #[inline]
    pub fn is_host(self) -> bool {
        self == Self::HOST
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Peer#{}", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// FIELDS & DELTAS
// =============================================================================

/// The replicated state of one entity.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplicatedFields {
    /// World position.
    pub position: Vec3,
    /// Euler rotation in radians.
    pub rotation: Vec3,
    /// Linear velocity.
    pub velocity: Vec3,
    /// Current health.
    pub health: u32,
    /// Kills credited to this player.
    pub kills: u32,
    /// Times this player died.
    pub deaths: u32,
}

impl ReplicatedFields {
    /// Fresh fields at a spawn position.
    pub fn spawned_at(position: Vec3) -> Self {
        Self {
            position,
            rotation: Vec3::ZERO,
            velocity: Vec3::ZERO,
            health: MAX_HEALTH,
            kills: 0,
            deaths: 0,
        }
    }

    /// Clamp fields that arrived from outside into their valid range.
    pub fn sanitized(mut self) -> Self {
        self.health = self.health.min(MAX_HEALTH);
        self
    }
}

impl Default for ReplicatedFields {
    fn default() -> Self {
        Self::spawned_at(Vec3::ZERO)
    }
}

/// Field-level change set. `None` means "unchanged".
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldDelta {
    /// New position.
    pub position: Option<Vec3>,
    /// New rotation.
    pub rotation: Option<Vec3>,
    /// New velocity.
    pub velocity: Option<Vec3>,
    /// New health.
    pub health: Option<u32>,
    /// New kill count.
    pub kills: Option<u32>,
    /// New death count.
    pub deaths: Option<u32>,
}

impl FieldDelta {
    /// A delta carrying every field (keyframe).
    pub fn full(fields: &ReplicatedFields) -> Self {
        Self {
            position: Some(fields.position),
            rotation: Some(fields.rotation),
            velocity: Some(fields.velocity),
            health: Some(fields.health),
            kills: Some(fields.kills),
            deaths: Some(fields.deaths),
        }
    }

    /// Only the fields of `current` that differ from `previous`.
    pub fn diff(previous: &ReplicatedFields, current: &ReplicatedFields) -> Self {
        fn changed<T: PartialEq + Copy>(a: T, b: T) -> Option<T> {
            if a == b { None } else { Some(b) }
        }

        Self {
            position: changed(previous.position, current.position),
            rotation: changed(previous.rotation, current.rotation),
            velocity: changed(previous.velocity, current.velocity),
            health: changed(previous.health, current.health),
            kills: changed(previous.kills, current.kills),
            deaths: changed(previous.deaths, current.deaths),
        }
    }

    /// True if no field changed.
    pub fn is_empty(&self) -> bool {
        self.position.is_none()
            && self.rotation.is_none()
            && self.velocity.is_none()
            && self.health.is_none()
            && self.kills.is_none()
            && self.deaths.is_none()
    }

    /// Number of fields carried.
    pub fn field_count(&self) -> usize {
        [
            self.position.is_some(),
            self.rotation.is_some(),
            self.velocity.is_some(),
            self.health.is_some(),
            self.kills.is_some(),
            self.deaths.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count()
    }

    /// Overwrite the present fields of `target`. Health is clamped.
    pub fn apply_to(&self, target: &mut ReplicatedFields) {
        if let Some(p) = self.position {
            target.position = p;
        }
        if let Some(r) = self.rotation {
            target.rotation = r;
        }
        if let Some(v) = self.velocity {
            target.velocity = v;
        }
        if let Some(h) = self.health {
            target.health = h.min(MAX_HEALTH);
        }
        if let Some(k) = self.kills {
            target.kills = k;
        }
        if let Some(d) = self.deaths {
            target.deaths = d;
        }
    }
}

// =============================================================================
// PLAYER ENTITY
// =============================================================================

/// Result of applying damage to an entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DamageOutcome {
    /// Entity survived with this much health left.
    Damaged {
        /// Health after the hit.
        remaining: u32,
    },
    /// Health reached zero. The caller must respawn the entity.
    Killed,
}

/// One player's avatar.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlayerEntity {
    id: PeerId,
    owner: PeerId,
    /// Replicated state.
    pub fields: ReplicatedFields,
}

impl PlayerEntity {
    /// Create a fresh entity for `owner` at a spawn position.
    pub fn new(owner: PeerId, position: Vec3) -> Self {
        Self::from_fields(owner, ReplicatedFields::spawned_at(position))
    }

    /// Rebuild an entity from replicated fields.
    pub fn from_fields(owner: PeerId, fields: ReplicatedFields) -> Self {
        Self {
            id: owner,
            owner,
            fields: fields.sanitized(),
        }
    }

    /// Entity id (equal to the owning peer id).
    #[inline]
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// The only peer allowed to mutate this entity.
    #[inline]
    pub fn owner(&self) -> PeerId {
        self.owner
    }

    /// Check if `peer` owns this entity.
    #[inline]
    pub fn is_owned_by(&self, peer: PeerId) -> bool {
        self.owner == peer
    }

    /// Subtract damage, clamping at zero.
    pub fn apply_damage(&mut self, amount: u32) -> DamageOutcome {
        self.fields.health = self.fields.health.saturating_sub(amount).min(MAX_HEALTH);
        if self.fields.health == 0 {
            DamageOutcome::Killed
        } else {
            DamageOutcome::Damaged { remaining: self.fields.health }
        }
    }

    /// Record a death and reset at a fresh spawn position.
    pub fn respawn_at(&mut self, position: Vec3) {
        self.fields.deaths = self.fields.deaths.saturating_add(1);
        self.fields.health = MAX_HEALTH;
        self.fields.position = position;
        self.fields.velocity = Vec3::ZERO;
    }

    /// Credit one kill.
    pub fn add_kill(&mut self) {
        self.fields.kills = self.fields.kills.saturating_add(1);
    }

    /// Overwrite the transform (local movement input).
    pub fn set_transform(&mut self, position: Vec3, rotation: Vec3, velocity: Vec3) {
        self.fields.position = position;
        self.fields.rotation = rotation;
        self.fields.velocity = velocity;
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_equals_owner() {
        let e = PlayerEntity::new(PeerId(7), Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(e.id(), PeerId(7));
        assert_eq!(e.owner(), PeerId(7));
        assert!(e.is_owned_by(PeerId(7)));
        assert!(!e.is_owned_by(PeerId::HOST));
        assert_eq!(e.fields.health, MAX_HEALTH);
    }

    #[test]
    fn test_damage_clamps_and_kills() {
        let mut e = PlayerEntity::new(PeerId(2), Vec3::ZERO);

        assert_eq!(e.apply_damage(25), DamageOutcome::Damaged { remaining: 75 });
        assert_eq!(e.apply_damage(60), DamageOutcome::Damaged { remaining: 15 });
        assert_eq!(e.apply_damage(1000), DamageOutcome::Killed);
        assert_eq!(e.fields.health, 0);

        e.respawn_at(Vec3::new(5.0, 0.5, 5.0));
        assert_eq!(e.fields.health, MAX_HEALTH);
        assert_eq!(e.fields.deaths, 1);
        assert_eq!(e.fields.velocity, Vec3::ZERO);
        assert_eq!(e.fields.position, Vec3::new(5.0, 0.5, 5.0));
    }

    #[test]
    fn test_four_hits_kill() {
        let mut e = PlayerEntity::new(PeerId(3), Vec3::ZERO);
        let outcomes: Vec<_> = (0..4).map(|_| e.apply_damage(25)).collect();
        assert_eq!(outcomes[3], DamageOutcome::Killed);
        assert!(outcomes[..3].iter().all(|o| matches!(o, DamageOutcome::Damaged { .. })));
    }

    #[test]
    fn test_diff_only_changed_fields() {
        let before = ReplicatedFields::spawned_at(Vec3::ZERO);
        let mut after = before;
        after.position = Vec3::new(1.0, 0.0, 0.0);
        after.kills = 2;

        let delta = FieldDelta::diff(&before, &after);
        assert_eq!(delta.field_count(), 2);
        assert_eq!(delta.position, Some(Vec3::new(1.0, 0.0, 0.0)));
        assert_eq!(delta.kills, Some(2));
        assert!(delta.health.is_none());

        assert!(FieldDelta::diff(&after, &after).is_empty());
        assert_eq!(FieldDelta::full(&after).field_count(), 6);
    }

    #[test]
    fn test_apply_delta_clamps_health() {
        let mut fields = ReplicatedFields::default();
        let delta = FieldDelta {
            health: Some(250),
            deaths: Some(3),
            ..Default::default()
        };
        delta.apply_to(&mut fields);
        assert_eq!(fields.health, MAX_HEALTH);
        assert_eq!(fields.deaths, 3);
        assert_eq!(fields.position, Vec3::ZERO);
    }

    #[test]
    fn test_from_fields_sanitizes() {
        let mut fields = ReplicatedFields::default();
        fields.health = 9000;
        let e = PlayerEntity::from_fields(PeerId(4), fields);
        assert_eq!(e.fields.health, MAX_HEALTH);
    }
}
