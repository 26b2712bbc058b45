//! Entity Authority & Spawn
//!
//! Owns the entity table: exactly one `PlayerEntity` per connected peer.
//! Spawning waits for the scene to be ready; until then requests sit in a
//! bounded exponential-backoff queue.
//!
//! ## Spawn flow
//!
//! ```text
//! spawn_entity(peer)
//!   ├─ already present / pending ──► no-op
//!   ├─ scene ready ──► select point ──► insert ──► Spawned
//!   └─ scene not ready ──► PendingSpawn (0.5s, 1s, 2s, 4s, 4s ...)
//!                            └─ attempts exhausted ──► SceneNotReady, parked until ready
//! ```

use std::collections::{BTreeMap, BTreeSet};
use serde::{Serialize, Deserialize};
use tracing::{debug, warn};

use crate::core::rng::DeterministicRng;
use crate::core::vec3::Vec3;
use crate::game::entity::{PeerId, PlayerEntity};
use crate::game::spawn::{select_spawn, SpawnPointProvider, SpawnSelection};

/// Non-fatal spawn diagnostics.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SpawnError {
    /// No spawn points were discoverable; the fallback position was used.
    #[error("no spawn points available for peer {peer}, used fallback {position}")]
    SpawnUnavailable {
        /// Peer being spawned.
        peer: PeerId,
        /// Fallback position used.
        position: Vec3,
    },

    /// The scene never became ready; the request was dropped.
    #[error("scene not ready after {attempts} attempts, abandoned spawn for peer {peer}")]
    SceneNotReady {
        /// Peer whose spawn was abandoned.
        peer: PeerId,
        /// Attempts made.
        attempts: u32,
    },
}

/// Backoff policy for spawns requested before the scene is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnRetryPolicy {
    /// Delay before the first retry (ms).
    pub initial_delay_ms: u64,
    /// Upper bound on the delay (ms).
    pub max_delay_ms: u64,
    /// Attempts before giving up.
    pub max_attempts: u32,
}

impl Default for SpawnRetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 4000,
            max_attempts: 8,
        }
    }
}

impl SpawnRetryPolicy {
    /// Delay (seconds) after `attempts` failed attempts.
    pub fn delay_after(&self, attempts: u32) -> f64 {
        let factor = 1u64 << attempts.min(16);
        let ms = self.initial_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        ms as f64 / 1000.0
    }
}

/// A spawn request waiting on the scene.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSpawn {
    /// Peer to spawn.
    pub peer: PeerId,
    /// Failed attempts so far.
    pub attempts: u32,
    /// Seconds until the next attempt.
    pub retry_in: f64,
}

/// Result of a spawn request.
#[derive(Debug, Clone, PartialEq)]
pub enum SpawnOutcome {
    /// Entity created.
    Spawned {
        /// Entity id.
        entity: PeerId,
        /// Where it was placed.
        position: Vec3,
        /// Set when the fallback position had to be used.
        diagnostic: Option<SpawnError>,
    },
    /// Scene not ready yet, request queued.
    Deferred,
    /// Entity or pending request already exists.
    AlreadyPresent,
}

/// Progress on pending spawns during a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum SpawnProgress {
    /// A pending spawn completed.
    Spawned {
        /// Entity id.
        entity: PeerId,
        /// Where it was placed.
        position: Vec3,
        /// Set when the fallback position had to be used.
        diagnostic: Option<SpawnError>,
    },
    /// A pending spawn ran out of attempts.
    Abandoned(SpawnError),
}

/// The entity table plus spawn bookkeeping.
#[derive(Debug)]
pub struct EntityAuthority {
    entities: BTreeMap<PeerId, PlayerEntity>,
    pending: BTreeMap<PeerId, PendingSpawn>,
    /// Requests that ran out of retries; completed when the scene reports ready.
    parked: BTreeSet<PeerId>,
    retry: SpawnRetryPolicy,
    height_offset: f32,
    fallback_position: Vec3,
    rng: DeterministicRng,
    scene_ready: bool,
}

impl EntityAuthority {
    /// Create an empty authority.
    pub fn new(retry: SpawnRetryPolicy, height_offset: f32, fallback_position: Vec3) -> Self {
        Self {
            entities: BTreeMap::new(),
            pending: BTreeMap::new(),
            parked: BTreeSet::new(),
            retry,
            height_offset,
            fallback_position,
            rng: DeterministicRng::default(),
            scene_ready: false,
        }
    }

    /// Replace the spawn-selection RNG.
    pub fn reseed(&mut self, rng: DeterministicRng) {
        self.rng = rng;
    }

    /// Check if the scene has reported ready.
    pub fn is_scene_ready(&self) -> bool {
        self.scene_ready
    }

    /// Request an entity for `peer`.
    pub fn spawn_entity(&mut self, peer: PeerId, provider: &dyn SpawnPointProvider) -> SpawnOutcome {
        if self.entities.contains_key(&peer) || self.pending.contains_key(&peer) {
            return SpawnOutcome::AlreadyPresent;
        }

        if !self.scene_ready {
            debug!("Scene not ready, deferring spawn for peer {}", peer);
            self.parked.remove(&peer);
            self.pending.insert(peer, PendingSpawn {
                peer,
                attempts: 0,
                retry_in: self.retry.delay_after(0),
            });
            return SpawnOutcome::Deferred;
        }

        let (position, diagnostic) = self.place(peer, provider);
        SpawnOutcome::Spawned { entity: peer, position, diagnostic }
    }

    /// Mark the scene ready and complete every pending or abandoned spawn.
    pub fn mark_scene_ready(&mut self, provider: &dyn SpawnPointProvider) -> Vec<SpawnProgress> {
        self.scene_ready = true;
        let waiting: BTreeSet<PeerId> = self
            .pending
            .keys()
            .chain(self.parked.iter())
            .copied()
            .filter(|peer| !self.entities.contains_key(peer))
            .collect();
        self.pending.clear();
        self.parked.clear();

        waiting
            .into_iter()
            .map(|peer| {
                let (position, diagnostic) = self.place(peer, provider);
                SpawnProgress::Spawned { entity: peer, position, diagnostic }
            })
            .collect()
    }

    /// Advance retry timers by `elapsed` seconds.
    pub fn advance(&mut self, elapsed: f64, provider: &dyn SpawnPointProvider) -> Vec<SpawnProgress> {
        if self.pending.is_empty() {
            return Vec::new();
        }

        let mut progress = Vec::new();
        let mut due = Vec::new();

        for pending in self.pending.values_mut() {
            pending.retry_in -= elapsed;
            if pending.retry_in <= 0.0 {
                due.push(pending.peer);
            }
        }

        for peer in due {
            if self.scene_ready {
                self.pending.remove(&peer);
                let (position, diagnostic) = self.place(peer, provider);
                progress.push(SpawnProgress::Spawned { entity: peer, position, diagnostic });
                continue;
            }

            let Some(pending) = self.pending.get_mut(&peer) else { continue };
            pending.attempts += 1;

            if pending.attempts >= self.retry.max_attempts {
                let attempts = pending.attempts;
                self.pending.remove(&peer);
                self.parked.insert(peer);
                let err = SpawnError::SceneNotReady { peer, attempts };
                warn!("{}", err);
                progress.push(SpawnProgress::Abandoned(err));
            } else {
                pending.retry_in = self.retry.delay_after(pending.attempts);
                debug!(
                    "Spawn retry {} for peer {} in {:.1}s",
                    pending.attempts, peer, pending.retry_in
                );
            }
        }

        progress
    }

    /// Remove an entity and cancel any pending spawn for it.
    pub fn despawn_entity(&mut self, peer: PeerId) -> Option<PlayerEntity> {
        self.pending.remove(&peer);
        self.parked.remove(&peer);
        self.entities.remove(&peer)
    }

    /// Insert an entity announced by the host. Idempotent.
    pub fn insert_mirror(&mut self, entity: PlayerEntity) -> bool {
        if self.entities.contains_key(&entity.id()) {
            return false;
        }
        self.pending.remove(&entity.id());
        self.parked.remove(&entity.id());
        self.entities.insert(entity.id(), entity);
        true
    }

    /// Pick a respawn position using the same rule as the initial spawn.
    pub fn select_respawn(&mut self, provider: &dyn SpawnPointProvider) -> SpawnSelection {
        select_spawn(provider, &mut self.rng, self.height_offset, self.fallback_position)
    }

    /// Look up an entity.
    pub fn get(&self, id: PeerId) -> Option<&PlayerEntity> {
        self.entities.get(&id)
    }

    /// Look up an entity mutably.
    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut PlayerEntity> {
        self.entities.get_mut(&id)
    }

    /// Owner of an entity, if tracked.
    pub fn owner_of(&self, id: PeerId) -> Option<PeerId> {
        self.entities.get(&id).map(PlayerEntity::owner)
    }

    /// All entities, ordered by id.
    pub fn entities(&self) -> impl Iterator<Item = &PlayerEntity> {
        self.entities.values()
    }

    /// Number of entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// True if no entities exist.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Check if a spawn is queued for `peer`.
    pub fn is_pending(&self, peer: PeerId) -> bool {
        self.pending.contains_key(&peer)
    }

    /// Number of queued spawns.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Check if a spawn for `peer` gave up retrying and waits for the scene.
    pub fn is_parked(&self, peer: PeerId) -> bool {
        self.parked.contains(&peer)
    }

    /// Drop all entities and pending spawns. The scene is no longer ready.
    pub fn clear(&mut self) {
        self.entities.clear();
        self.pending.clear();
        self.parked.clear();
        self.scene_ready = false;
    }

    fn place(&mut self, peer: PeerId, provider: &dyn SpawnPointProvider) -> (Vec3, Option<SpawnError>) {
        let selection = self.select_respawn(provider);
        let diagnostic = if selection.is_fallback() {
            let err = SpawnError::SpawnUnavailable { peer, position: selection.position };
            warn!("{}", err);
            Some(err)
        } else {
            None
        };

        // Identity and owner are fixed before the entity becomes visible.
        let entity = PlayerEntity::new(peer, selection.position);
        self.entities.insert(peer, entity);
        debug!("Spawned entity {} at {}", peer, selection.position);

        (selection.position, diagnostic)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::spawn::StaticSpawnPoints;
    use proptest::prelude::*;

    const FALLBACK: Vec3 = Vec3::new(0.0, 2.0, 0.0);

    fn authority() -> EntityAuthority {
        EntityAuthority::new(SpawnRetryPolicy::default(), 0.5, FALLBACK)
    }

    #[test]
    fn test_retry_delays() {
        let policy = SpawnRetryPolicy::default();
        let delays: Vec<f64> = (0..6).map(|a| policy.delay_after(a)).collect();
        assert_eq!(delays, vec![0.5, 1.0, 2.0, 4.0, 4.0, 4.0]);
    }

    #[test]
    fn test_spawn_when_ready() {
        let mut auth = authority();
        let points = StaticSpawnPoints::ring(4, 10.0);
        auth.mark_scene_ready(&points);

        let outcome = auth.spawn_entity(PeerId(2), &points);
        match outcome {
            SpawnOutcome::Spawned { entity, position, diagnostic } => {
                assert_eq!(entity, PeerId(2));
                assert_eq!(position.y, 0.5);
                assert!(diagnostic.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(auth.owner_of(PeerId(2)), Some(PeerId(2)));
        assert_eq!(auth.spawn_entity(PeerId(2), &points), SpawnOutcome::AlreadyPresent);
        assert_eq!(auth.len(), 1);
    }

    #[test]
    fn test_empty_spawn_set_falls_back() {
        let mut auth = authority();
        let none = StaticSpawnPoints::empty();
        auth.mark_scene_ready(&none);

        let outcome = auth.spawn_entity(PeerId::HOST, &none);
        assert_eq!(
            outcome,
            SpawnOutcome::Spawned {
                entity: PeerId::HOST,
                position: FALLBACK,
                diagnostic: Some(SpawnError::SpawnUnavailable { peer: PeerId::HOST, position: FALLBACK }),
            }
        );
    }

    #[test]
    fn test_deferred_spawn_completes_on_ready() {
        let mut auth = authority();
        let points = StaticSpawnPoints::ring(2, 3.0);

        assert_eq!(auth.spawn_entity(PeerId(3), &points), SpawnOutcome::Deferred);
        assert_eq!(auth.spawn_entity(PeerId(3), &points), SpawnOutcome::AlreadyPresent);
        assert!(auth.is_pending(PeerId(3)));
        assert!(auth.get(PeerId(3)).is_none());

        let progress = auth.mark_scene_ready(&points);
        assert_eq!(progress.len(), 1);
        assert!(matches!(progress[0], SpawnProgress::Spawned { entity: PeerId(3), .. }));
        assert_eq!(auth.pending_count(), 0);
        assert!(auth.get(PeerId(3)).is_some());
    }

    #[test]
    fn test_pending_spawn_abandoned() {
        let mut auth = authority();
        let points = StaticSpawnPoints::ring(2, 3.0);
        auth.spawn_entity(PeerId(4), &points);

        let mut abandoned = Vec::new();
        // 0.5 + 1 + 2 + 4 * 5 = 23.5 seconds of retries
        for _ in 0..300 {
            abandoned.extend(auth.advance(0.1, &points));
        }

        assert_eq!(
            abandoned,
            vec![SpawnProgress::Abandoned(SpawnError::SceneNotReady { peer: PeerId(4), attempts: 8 })]
        );
        assert!(!auth.is_pending(PeerId(4)));
        assert!(auth.is_parked(PeerId(4)));
        assert!(auth.is_empty());

        // A late ready signal still spawns the peer
        let progress = auth.mark_scene_ready(&points);
        assert!(matches!(&progress[..], [SpawnProgress::Spawned { entity: PeerId(4), .. }]));
        assert!(!auth.is_parked(PeerId(4)));
        assert_eq!(auth.owner_of(PeerId(4)), Some(PeerId(4)));
    }

    #[test]
    fn test_despawn_clears_parked_spawn() {
        let mut auth = authority();
        let points = StaticSpawnPoints::ring(2, 3.0);
        auth.spawn_entity(PeerId(6), &points);
        for _ in 0..300 {
            auth.advance(0.1, &points);
        }
        assert!(auth.is_parked(PeerId(6)));

        auth.despawn_entity(PeerId(6));
        assert!(auth.mark_scene_ready(&points).is_empty());
        assert!(auth.is_empty());
    }

    #[test]
    fn test_despawn_cancels_pending() {
        let mut auth = authority();
        let points = StaticSpawnPoints::ring(2, 3.0);
        auth.spawn_entity(PeerId(5), &points);
        assert!(auth.despawn_entity(PeerId(5)).is_none());
        assert!(auth.mark_scene_ready(&points).is_empty());
        assert!(auth.is_empty());
    }

    #[test]
    fn test_insert_mirror_idempotent() {
        let mut auth = authority();
        let e = PlayerEntity::new(PeerId(2), Vec3::new(1.0, 0.0, 1.0));
        assert!(auth.insert_mirror(e.clone()));

        let mut moved = e;
        moved.fields.position = Vec3::new(9.0, 9.0, 9.0);
        assert!(!auth.insert_mirror(moved));
        assert_eq!(auth.get(PeerId(2)).unwrap().fields.position, Vec3::new(1.0, 0.0, 1.0));
    }

    proptest! {
        #[test]
        fn prop_one_entity_per_peer(ops in proptest::collection::vec((any::<bool>(), 2u32..8), 1..60)) {
            let mut auth = authority();
            let points = StaticSpawnPoints::ring(3, 4.0);
            auth.mark_scene_ready(&points);
            let mut connected = std::collections::BTreeSet::new();

            for (connect, id) in ops {
                let peer = PeerId(id);
                if connect {
                    connected.insert(peer);
                    auth.spawn_entity(peer, &points);
                } else {
                    connected.remove(&peer);
                    auth.despawn_entity(peer);
                }

                let ids: std::collections::BTreeSet<PeerId> = auth.entities().map(|e| e.id()).collect();
                prop_assert_eq!(&ids, &connected);
                for e in auth.entities() {
                    prop_assert_eq!(e.owner(), e.id());
                }
            }
        }
    }
}
