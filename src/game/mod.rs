//! Game Logic Module
//!
//! Entity state, spawning, combat resolution and the match clock. Nothing in
//! here touches the network; the session layer decides where each piece runs.
//!
//! ## Module Structure
//!
//! - `entity`: Player entities and their replicated fields
//! - `spawn`: Spawn point discovery and selection
//! - `authority`: Entity table, ownership, deferred spawns
//! - `combat`: Hit-scan resolution and weapon cooldown
//! - `lifecycle`: Match phases, clock and winner
//! - `events`: Session events for UI and tests

pub mod entity;
pub mod spawn;
pub mod authority;
pub mod combat;
pub mod lifecycle;
pub mod events;

// Re-export key types
pub use entity::{PeerId, PlayerEntity, ReplicatedFields, FieldDelta, DamageOutcome, MAX_HEALTH};
pub use spawn::{SpawnPoint, SpawnPointProvider, StaticSpawnPoints, SpawnSelection};
pub use authority::{EntityAuthority, SpawnError, SpawnOutcome, SpawnProgress, SpawnRetryPolicy};
pub use combat::{FireOutcome, PlayerHitboxes, RayHit, SpatialQuery, WeaponCooldown};
pub use lifecycle::{MatchLifecycle, MatchPhase, MatchError, compute_winner};
pub use events::SessionEvent;
