//! Core primitives.
//!
//! Vector math for transforms and a deterministic PRNG for spawn selection.

pub mod vec3;
pub mod rng;

// Re-export core types
pub use vec3::Vec3;
pub use rng::DeterministicRng;
