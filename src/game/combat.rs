//! Combat
//!
//! Hit-scan resolution, weapon cooldown and the hit ledger. Damage itself is
//! never applied here: the shooter only decides *who* was hit, and the
//! victim's owner applies the damage when the `TakeDamage` call arrives.

use std::collections::BTreeMap;
use serde::{Serialize, Deserialize};

use crate::core::vec3::Vec3;
use crate::game::entity::{PeerId, PlayerEntity};

/// First thing a ray hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    /// Entity hit, `None` for level geometry.
    pub entity: Option<PeerId>,
    /// World-space hit point.
    pub point: Vec3,
    /// Distance from the ray origin.
    pub distance: f32,
}

/// External spatial query (physics raycast).
pub trait SpatialQuery {
    /// First hit along `direction` (unit length) within `max_distance`.
    fn cast_ray(&self, origin: Vec3, direction: Vec3, max_distance: f32) -> Option<RayHit>;
}

/// Result of a fire attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FireOutcome {
    /// Nothing within range.
    Miss,
    /// Level geometry or an untracked body.
    HitWorld,
    /// The shooter's own entity. No damage.
    HitSelf,
    /// Another player; damage requested from its owner.
    Hit {
        /// Entity hit.
        target: PeerId,
    },
}

/// Classify a ray hit from `shooter`'s point of view.
pub fn resolve_hit(shooter: PeerId, hit: Option<RayHit>, is_tracked: impl Fn(PeerId) -> bool) -> FireOutcome {
    match hit {
        None => FireOutcome::Miss,
        Some(RayHit { entity: None, .. }) => FireOutcome::HitWorld,
        Some(RayHit { entity: Some(id), .. }) if id == shooter => FireOutcome::HitSelf,
        Some(RayHit { entity: Some(id), .. }) if is_tracked(id) => FireOutcome::Hit { target: id },
        Some(_) => FireOutcome::HitWorld,
    }
}

// =============================================================================
// REFERENCE SPATIAL QUERY
// =============================================================================

/// Sphere hitboxes around entity positions, plus an optional ground plane.
///
/// Spheres containing the ray origin are skipped, so a shooter standing in
/// its own hitbox does not hit itself.
#[derive(Debug, Clone, Default)]
pub struct PlayerHitboxes {
    spheres: Vec<(PeerId, Vec3)>,
    radius: f32,
    ground: Option<f32>,
}

impl PlayerHitboxes {
    /// Default hitbox radius.
    pub const DEFAULT_RADIUS: f32 = 0.6;

    /// Hitboxes for every entity.
    pub fn from_entities<'a>(entities: impl IntoIterator<Item = &'a PlayerEntity>, radius: f32) -> Self {
        Self {
            spheres: entities.into_iter().map(|e| (e.id(), e.fields.position)).collect(),
            radius,
            ground: None,
        }
    }

    /// Add a horizontal ground plane at `height`.
    pub fn with_ground(mut self, height: f32) -> Self {
        self.ground = Some(height);
        self
    }

    fn sphere_hit(&self, center: Vec3, origin: Vec3, dir: Vec3) -> Option<f32> {
        let oc = origin - center;
        let c = oc.length_squared() - self.radius * self.radius;
        if c <= 0.0 {
            return None;
        }
        let b = oc.dot(dir);
        if b > 0.0 {
            return None;
        }
        let disc = b * b - c;
        if disc < 0.0 {
            return None;
        }
        Some(-b - disc.sqrt())
    }

    fn ground_hit(&self, origin: Vec3, dir: Vec3) -> Option<f32> {
        let height = self.ground?;
        if dir.y.abs() <= f32::EPSILON {
            return None;
        }
        let t = (height - origin.y) / dir.y;
        (t > 0.0).then_some(t)
    }
}

impl SpatialQuery for PlayerHitboxes {
    fn cast_ray(&self, origin: Vec3, direction: Vec3, max_distance: f32) -> Option<RayHit> {
        let dir = direction.normalize();
        if dir == Vec3::ZERO {
            return None;
        }

        let mut best: Option<RayHit> = None;
        let mut consider = |entity: Option<PeerId>, t: f32| {
            if t > max_distance {
                return;
            }
            if best.map_or(true, |b| t < b.distance) {
                best = Some(RayHit { entity, point: origin + dir * t, distance: t });
            }
        };

        for (id, center) in &self.spheres {
            if let Some(t) = self.sphere_hit(*center, origin, dir) {
                consider(Some(*id), t);
            }
        }
        if let Some(t) = self.ground_hit(origin, dir) {
            consider(None, t);
        }

        best
    }
}

// =============================================================================
// WEAPON COOLDOWN
// =============================================================================

/// Minimum time between shots.
#[derive(Debug, Clone)]
pub struct WeaponCooldown {
    cooldown: f64,
    remaining: f64,
}

impl WeaponCooldown {
    /// Cooldown of `cooldown_secs` between shots.
    pub fn new(cooldown_secs: f64) -> Self {
        Self { cooldown: cooldown_secs.max(0.0), remaining: 0.0 }
    }

    /// Check if the weapon can fire.
    pub fn is_ready(&self) -> bool {
        self.remaining <= 0.0
    }

    /// Start the cooldown after a shot.
    pub fn trigger(&mut self) {
        self.remaining = self.cooldown;
    }

    /// Advance by `elapsed` seconds.
    pub fn advance(&mut self, elapsed: f64) {
        self.remaining = (self.remaining - elapsed).max(0.0);
    }

    /// Ready immediately.
    pub fn reset(&mut self) {
        self.remaining = 0.0;
    }
}

// =============================================================================
// HIT LEDGER
// =============================================================================

/// Hits this peer sent, keyed by the owner of the entity that was hit.
///
/// A kill credit from peer O is only honoured while at least one hit on
/// O's entity is outstanding. Each credit consumes one hit.
#[derive(Debug, Clone, Default)]
pub struct HitLedger {
    outstanding: BTreeMap<PeerId, u32>,
}

impl HitLedger {
    /// Empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a `TakeDamage` sent to `victim_owner`.
    pub fn record_hit(&mut self, victim_owner: PeerId) {
        *self.outstanding.entry(victim_owner).or_insert(0) += 1;
    }

    /// Outstanding hits against `victim_owner`.
    pub fn outstanding(&self, victim_owner: PeerId) -> u32 {
        self.outstanding.get(&victim_owner).copied().unwrap_or(0)
    }

    /// Consume one hit backing a kill credit from `origin`. False if none is outstanding.
    pub fn redeem(&mut self, origin: PeerId) -> bool {
        match self.outstanding.get_mut(&origin) {
            Some(hits) if *hits > 1 => {
                *hits -= 1;
                true
            }
            Some(_) => {
                self.outstanding.remove(&origin);
                true
            }
            None => false,
        }
    }

    /// Drop everything recorded against `peer`.
    pub fn forget(&mut self, peer: PeerId) {
        self.outstanding.remove(&peer);
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.outstanding.clear();
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(id: u32, pos: Vec3) -> PlayerEntity {
        PlayerEntity::new(PeerId(id), pos)
    }

    #[test]
    fn test_ray_hits_nearest_player() {
        let entities = vec![
            entity(1, Vec3::ZERO),
            entity(2, Vec3::new(0.0, 0.0, -10.0)),
            entity(3, Vec3::new(0.0, 0.0, -20.0)),
        ];
        let hitboxes = PlayerHitboxes::from_entities(&entities, 0.5);

        // Fired from inside entity 1's hitbox
        let hit = hitboxes.cast_ray(Vec3::ZERO, Vec3::FORWARD, 1000.0).unwrap();
        assert_eq!(hit.entity, Some(PeerId(2)));
        assert!((hit.distance - 9.5).abs() < 1e-4);
    }

    #[test]
    fn test_ray_respects_range() {
        let entities = vec![entity(2, Vec3::new(0.0, 0.0, -10.0))];
        let hitboxes = PlayerHitboxes::from_entities(&entities, 0.5);
        assert!(hitboxes.cast_ray(Vec3::ZERO, Vec3::FORWARD, 5.0).is_none());
        assert!(hitboxes.cast_ray(Vec3::ZERO, Vec3::new(0.0, 0.0, 1.0), 1000.0).is_none());
    }

    #[test]
    fn test_ground_blocks_ray() {
        let entities = vec![entity(2, Vec3::new(0.0, -5.0, -10.0))];
        let hitboxes = PlayerHitboxes::from_entities(&entities, 0.5).with_ground(-1.0);
        let dir = Vec3::new(0.0, -0.5, -1.0);
        let hit = hitboxes.cast_ray(Vec3::ZERO, dir, 1000.0).unwrap();
        assert_eq!(hit.entity, None);
    }

    #[test]
    fn test_resolve_hit() {
        let me = PeerId(2);
        let tracked = |id: PeerId| id.0 < 10;
        let hit = |entity| Some(RayHit { entity, point: Vec3::ZERO, distance: 1.0 });

        assert_eq!(resolve_hit(me, None, tracked), FireOutcome::Miss);
        assert_eq!(resolve_hit(me, hit(None), tracked), FireOutcome::HitWorld);
        assert_eq!(resolve_hit(me, hit(Some(me)), tracked), FireOutcome::HitSelf);
        assert_eq!(resolve_hit(me, hit(Some(PeerId(3))), tracked), FireOutcome::Hit { target: PeerId(3) });
        assert_eq!(resolve_hit(me, hit(Some(PeerId(42))), tracked), FireOutcome::HitWorld);
    }

    #[test]
    fn test_weapon_cooldown() {
        let mut weapon = WeaponCooldown::new(0.5);
        assert!(weapon.is_ready());
        weapon.trigger();
        assert!(!weapon.is_ready());
        weapon.advance(0.25);
        assert!(!weapon.is_ready());
        weapon.advance(0.25);
        assert!(weapon.is_ready());
    }

    #[test]
    fn test_hit_ledger_backs_kills() {
        let mut ledger = HitLedger::new();
        assert!(!ledger.redeem(PeerId(3)));

        ledger.record_hit(PeerId(3));
        ledger.record_hit(PeerId(3));
        assert_eq!(ledger.outstanding(PeerId(3)), 2);

        assert!(ledger.redeem(PeerId(3)));
        assert!(ledger.redeem(PeerId(3)));
        assert!(!ledger.redeem(PeerId(3)));
        assert_eq!(ledger.outstanding(PeerId(3)), 0);

        ledger.record_hit(PeerId(4));
        ledger.forget(PeerId(4));
        assert!(!ledger.redeem(PeerId(4)));
    }
}
