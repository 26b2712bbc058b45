//! Replication Channel
//!
//! Fixed-rate fan-out of locally owned entity state, and ordered apply of
//! remote state for everything else.
//!
//! ## Per interval (owner side)
//!
//! ```text
//! for each locally owned entity:
//!   keyframe due?  ──► send every field
//!   otherwise      ──► diff against last sent, send changed fields only
//!   nothing changed ──► send nothing
//! ```
//!
//! Every outgoing delta carries a per-entity sequence number. Receivers drop
//! anything not newer than what they last applied, so counters never move
//! backwards even when datagrams arrive out of order.

use std::collections::BTreeMap;
use serde::{Serialize, Deserialize};
use tracing::debug;

use crate::game::entity::{FieldDelta, PeerId, PlayerEntity, ReplicatedFields};
use crate::network::protocol::RemoteCall;
use crate::network::rpc::AuthorityViolation;

/// Replication settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Broadcast interval (ms). 50 ms = 20 Hz.
    pub interval_ms: u64,
    /// Send a full snapshot every N intervals.
    pub keyframe_every: u32,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            interval_ms: crate::REPLICATION_INTERVAL_MS,
            keyframe_every: 20,
        }
    }
}

/// Channel counters (for diagnostics).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationStats {
    /// Deltas sent.
    pub sent: u64,
    /// Remote deltas applied.
    pub applied: u64,
    /// Remote deltas dropped as stale.
    pub stale: u64,
    /// Remote calls rejected by authority rules.
    pub rejected: u64,
}

/// Result of applying a remote delta.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyResult {
    /// Fields overwritten.
    Applied,
    /// Sequence not newer than the last applied one.
    Stale,
}

/// Replication state for one participant.
#[derive(Debug)]
pub struct ReplicationChannel {
    config: ReplicationConfig,
    accumulator: f64,
    intervals: u64,
    last_sent: BTreeMap<PeerId, ReplicatedFields>,
    next_seq: BTreeMap<PeerId, u64>,
    last_applied: BTreeMap<PeerId, u64>,
    stats: ReplicationStats,
}

impl ReplicationChannel {
    /// Create a channel.
    pub fn new(config: ReplicationConfig) -> Self {
        Self {
            config,
            accumulator: 0.0,
            intervals: 0,
            last_sent: BTreeMap::new(),
            next_seq: BTreeMap::new(),
            last_applied: BTreeMap::new(),
            stats: ReplicationStats::default(),
        }
    }

    /// Interval in seconds.
    pub fn interval_secs(&self) -> f64 {
        self.config.interval_ms.max(1) as f64 / 1000.0
    }

    /// Advance the timer. Returns true when a broadcast interval elapsed.
    ///
    /// Multiple elapsed intervals collapse into one broadcast.
    pub fn advance(&mut self, elapsed: f64) -> bool {
        self.accumulator += elapsed;
        let interval = self.interval_secs();
        if self.accumulator < interval {
            return false;
        }
        self.accumulator %= interval;
        self.intervals += 1;
        true
    }

    /// Build `ApplyState` calls for every entity owned by `local`.
    pub fn collect_owned<'a>(
        &mut self,
        local: PeerId,
        entities: impl IntoIterator<Item = &'a PlayerEntity>,
    ) -> Vec<RemoteCall> {
        let keyframe = self.config.keyframe_every > 0
            && self.intervals % self.config.keyframe_every as u64 == 0;

        let mut calls = Vec::new();
        for entity in entities.into_iter().filter(|e| e.is_owned_by(local)) {
            let current = entity.fields;
            let delta = match self.last_sent.get(&entity.id()) {
                Some(previous) if !keyframe => FieldDelta::diff(previous, &current),
                _ => FieldDelta::full(&current),
            };
            if delta.is_empty() {
                continue;
            }

            let seq = self.next_seq.entry(entity.id()).or_insert(0);
            *seq += 1;
            calls.push(RemoteCall::ApplyState { entity: entity.id(), seq: *seq, delta });
            self.last_sent.insert(entity.id(), current);
            self.stats.sent += 1;
        }
        calls
    }

    /// Apply a remote delta to a mirrored entity.
    pub fn apply_remote(
        &mut self,
        local: PeerId,
        origin: PeerId,
        entity: &mut PlayerEntity,
        seq: u64,
        delta: &FieldDelta,
    ) -> Result<ApplyResult, AuthorityViolation> {
        if entity.is_owned_by(local) {
            self.stats.rejected += 1;
            return Err(AuthorityViolation::LocallyOwned { call: "apply_state", origin, entity: entity.id() });
        }
        if !entity.is_owned_by(origin) {
            self.stats.rejected += 1;
            return Err(AuthorityViolation::NotOwner {
                call: "apply_state",
                origin,
                entity: entity.id(),
                owner: Some(entity.owner()),
            });
        }

        let last = self.last_applied.get(&entity.id()).copied().unwrap_or(0);
        if seq <= last {
            self.stats.stale += 1;
            debug!("Stale state for {} (seq {} <= {})", entity.id(), seq, last);
            return Ok(ApplyResult::Stale);
        }

        delta.apply_to(&mut entity.fields);
        self.last_applied.insert(entity.id(), seq);
        self.stats.applied += 1;
        Ok(ApplyResult::Applied)
    }

    /// Count a rejection raised outside the channel.
    pub fn record_rejected(&mut self) {
        self.stats.rejected += 1;
    }

    /// Forget all per-entity state for `entity`.
    pub fn forget(&mut self, entity: PeerId) {
        self.last_sent.remove(&entity);
        self.next_seq.remove(&entity);
        self.last_applied.remove(&entity);
    }

    /// Force a full snapshot of `entity` on the next interval.
    pub fn invalidate(&mut self, entity: PeerId) {
        self.last_sent.remove(&entity);
    }

    /// Counters.
    pub fn stats(&self) -> ReplicationStats {
        self.stats
    }

    /// Drop everything.
    pub fn reset(&mut self) {
        self.accumulator = 0.0;
        self.intervals = 0;
        self.last_sent.clear();
        self.next_seq.clear();
        self.last_applied.clear();
        self.stats = ReplicationStats::default();
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::vec3::Vec3;
    use proptest::prelude::*;

    fn channel() -> ReplicationChannel {
        ReplicationChannel::new(ReplicationConfig::default())
    }

    #[test]
    fn test_interval_timer() {
        let mut ch = channel();
        assert!(!ch.advance(0.02));
        assert!(!ch.advance(0.02));
        assert!(ch.advance(0.02));
        assert!(!ch.advance(0.02));
        // A long frame fires once
        assert!(ch.advance(0.5));
    }

    #[test]
    fn test_only_owned_and_changed_are_sent() {
        let mut ch = channel();
        let me = PeerId(2);
        let mut mine = PlayerEntity::new(me, Vec3::ZERO);
        let other = PlayerEntity::new(PeerId(3), Vec3::ZERO);

        // First interval is a keyframe
        ch.advance(0.05);
        let calls = ch.collect_owned(me, [&mine, &other]);
        assert_eq!(calls.len(), 1);
        match &calls[0] {
            RemoteCall::ApplyState { entity, seq, delta } => {
                assert_eq!(*entity, me);
                assert_eq!(*seq, 1);
                assert_eq!(delta.field_count(), 6);
            }
            other => panic!("unexpected {:?}", other),
        }

        // Nothing changed: nothing sent
        ch.advance(0.05);
        assert!(ch.collect_owned(me, [&mine, &other]).is_empty());

        // One field changed: one field sent
        mine.fields.position = Vec3::new(1.0, 0.0, 0.0);
        ch.advance(0.05);
        let calls = ch.collect_owned(me, [&mine]);
        match &calls[0] {
            RemoteCall::ApplyState { seq, delta, .. } => {
                assert_eq!(*seq, 2);
                assert_eq!(delta.field_count(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(ch.stats().sent, 2);
    }

    #[test]
    fn test_keyframe_resends_everything() {
        let mut ch = ReplicationChannel::new(ReplicationConfig { interval_ms: 50, keyframe_every: 3 });
        let me = PeerId(2);
        let e = PlayerEntity::new(me, Vec3::ZERO);

        let mut sent = Vec::new();
        for _ in 0..7 {
            ch.advance(0.05);
            sent.push(ch.collect_owned(me, [&e]).len());
        }
        // intervals 1..=7: keyframes at 3 and 6, plus the initial snapshot
        assert_eq!(sent, vec![1, 0, 1, 0, 0, 1, 0]);
    }

    #[test]
    fn test_invalidate_forces_full_snapshot() {
        let mut ch = channel();
        let me = PeerId(2);
        let e = PlayerEntity::new(me, Vec3::ZERO);

        ch.advance(0.05);
        assert_eq!(ch.collect_owned(me, [&e]).len(), 1);
        ch.advance(0.05);
        assert!(ch.collect_owned(me, [&e]).is_empty());

        ch.invalidate(me);
        ch.advance(0.05);
        match ch.collect_owned(me, [&e]).as_slice() {
            [RemoteCall::ApplyState { seq, delta, .. }] => {
                assert_eq!(*seq, 2);
                assert_eq!(delta.field_count(), 6);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_apply_remote_rules() {
        let mut ch = channel();
        let local = PeerId::HOST;
        let mut remote = PlayerEntity::new(PeerId(2), Vec3::ZERO);
        let delta = FieldDelta { kills: Some(3), ..Default::default() };

        assert_eq!(ch.apply_remote(local, PeerId(2), &mut remote, 5, &delta), Ok(ApplyResult::Applied));
        assert_eq!(remote.fields.kills, 3);

        // Older sequence is stale
        let old = FieldDelta { kills: Some(1), ..Default::default() };
        assert_eq!(ch.apply_remote(local, PeerId(2), &mut remote, 4, &old), Ok(ApplyResult::Stale));
        assert_eq!(remote.fields.kills, 3);

        // Wrong origin
        assert!(ch.apply_remote(local, PeerId(3), &mut remote, 9, &delta).is_err());

        // Never apply to our own entity
        let mut mine = PlayerEntity::new(local, Vec3::ZERO);
        assert!(ch.apply_remote(local, local, &mut mine, 1, &delta).is_err());

        let stats = ch.stats();
        assert_eq!((stats.applied, stats.stale, stats.rejected), (1, 1, 2));
    }

    proptest! {
        #[test]
        fn prop_counters_monotonic_under_reordering(order in Just((1u64..=30).collect::<Vec<_>>()).prop_shuffle()) {
            let mut ch = channel();
            let mut mirror = PlayerEntity::new(PeerId(2), Vec3::ZERO);
            let mut last_kills = 0;

            for seq in order {
                // Owner's kill count equals its sequence number here
                let delta = FieldDelta { kills: Some(seq as u32), deaths: Some(seq as u32), ..Default::default() };
                ch.apply_remote(PeerId::HOST, PeerId(2), &mut mirror, seq, &delta).unwrap();
                prop_assert!(mirror.fields.kills >= last_kills);
                last_kills = mirror.fields.kills;
            }
        }
    }
}
