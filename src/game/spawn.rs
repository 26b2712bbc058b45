//! Spawn Points
//!
//! Discoverable set of named (re)spawn locations and the selection rule.

use serde::{Serialize, Deserialize};

use crate::core::rng::DeterministicRng;
use crate::core::vec3::Vec3;

/// A named spawn location.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpawnPoint {
    /// Display name (debug only).
    pub name: String,
    /// Ground position.
    pub position: Vec3,
}

impl SpawnPoint {
    /// Create a spawn point.
    pub fn new(name: impl Into<String>, position: Vec3) -> Self {
        Self { name: name.into(), position }
    }
}

/// Source of spawn points, usually the loaded scene.
pub trait SpawnPointProvider {
    /// All currently discoverable spawn points. May be empty.
    fn spawn_points(&self) -> &[SpawnPoint];
}

impl SpawnPointProvider for Vec<SpawnPoint> {
    fn spawn_points(&self) -> &[SpawnPoint] {
        self.as_slice()
    }
}

/// A fixed layout of spawn points.
#[derive(Clone, Debug, Default)]
pub struct StaticSpawnPoints {
    points: Vec<SpawnPoint>,
}

impl StaticSpawnPoints {
    /// No spawn points at all (everything falls back).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Spawn points from explicit positions, named `Spawn0`, `Spawn1`, ...
    pub fn from_positions(positions: impl IntoIterator<Item = Vec3>) -> Self {
        let points = positions
            .into_iter()
            .enumerate()
            .map(|(i, p)| SpawnPoint::new(format!("Spawn{}", i), p))
            .collect();
        Self { points }
    }

    /// `count` points evenly spaced on a ground-level circle.
    pub fn ring(count: usize, radius: f32) -> Self {
        let step = std::f32::consts::TAU / count.max(1) as f32;
        Self::from_positions((0..count).map(|i| {
            let angle = step * i as f32;
            Vec3::new(radius * angle.cos(), 0.0, radius * angle.sin())
        }))
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True if there are no points.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

impl SpawnPointProvider for StaticSpawnPoints {
    fn spawn_points(&self) -> &[SpawnPoint] {
        &self.points
    }
}

/// Where an entity will (re)spawn.
#[derive(Clone, Debug, PartialEq)]
pub struct SpawnSelection {
    /// Final position, height offset applied.
    pub position: Vec3,
    /// Name of the chosen point, `None` when the fallback was used.
    pub point: Option<String>,
}

impl SpawnSelection {
    /// True if no spawn point was available.
    pub fn is_fallback(&self) -> bool {
        self.point.is_none()
    }
}

/// Pick a spawn point uniformly at random and raise it by `height_offset`.
///
/// With no points available, returns `fallback` unchanged.
pub fn select_spawn(
    provider: &dyn SpawnPointProvider,
    rng: &mut DeterministicRng,
    height_offset: f32,
    fallback: Vec3,
) -> SpawnSelection {
    match rng.choose(provider.spawn_points()) {
        Some(point) => SpawnSelection {
            position: point.position.raised(height_offset),
            point: Some(point.name.clone()),
        },
        None => SpawnSelection {
            position: fallback,
            point: None,
        },
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const FALLBACK: Vec3 = Vec3::new(0.0, 2.0, 0.0);

    #[test]
    fn test_empty_set_uses_fallback() {
        let mut rng = DeterministicRng::new(1);
        let sel = select_spawn(&StaticSpawnPoints::empty(), &mut rng, 0.5, FALLBACK);
        assert!(sel.is_fallback());
        assert_eq!(sel.position, FALLBACK);
    }

    #[test]
    fn test_selection_applies_height_offset() {
        let points = vec![SpawnPoint::new("only", Vec3::new(4.0, 1.0, -2.0))];
        let mut rng = DeterministicRng::new(1);
        let sel = select_spawn(&points, &mut rng, 0.5, FALLBACK);
        assert_eq!(sel.point.as_deref(), Some("only"));
        assert_eq!(sel.position, Vec3::new(4.0, 1.5, -2.0));
    }

    #[test]
    fn test_selection_is_uniformish() {
        let points = StaticSpawnPoints::ring(4, 10.0);
        let mut rng = DeterministicRng::new(77);
        let mut counts = [0u32; 4];

        for _ in 0..4000 {
            let sel = select_spawn(&points, &mut rng, 0.0, FALLBACK);
            let name = sel.point.unwrap();
            let idx: usize = name.trim_start_matches("Spawn").parse().unwrap();
            counts[idx] += 1;
        }

        // Each bucket should be near 1000
        for c in counts {
            assert!(c > 850 && c < 1150, "bucket count {}", c);
        }
    }

    #[test]
    fn test_selection_deterministic_for_seed() {
        let points = StaticSpawnPoints::ring(8, 5.0);
        let mut a = DeterministicRng::new(5);
        let mut b = DeterministicRng::new(5);
        for _ in 0..20 {
            assert_eq!(
                select_spawn(&points, &mut a, 0.5, FALLBACK),
                select_spawn(&points, &mut b, 0.5, FALLBACK),
            );
        }
    }

    #[test]
    fn test_ring_layout() {
        let ring = StaticSpawnPoints::ring(4, 10.0);
        assert_eq!(ring.len(), 4);
        for p in ring.spawn_points() {
            assert!((p.position.length() - 10.0).abs() < 1e-4);
            assert_eq!(p.position.y, 0.0);
        }
    }
}
