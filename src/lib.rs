//! # Skirmish Server
//!
//! Networking and authority core for a small peer-hosted multiplayer shooter.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      SKIRMISH SERVER                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/              - Primitives                             │
//! │  ├── vec3.rs        - 3D vector math                         │
//! │  └── rng.rs         - Seeded Xorshift128+ PRNG               │
//! │                                                              │
//! │  game/              - Game rules (no I/O)                    │
//! │  ├── entity.rs      - Player entities, replicated fields     │
//! │  ├── spawn.rs       - Spawn point selection                  │
//! │  ├── authority.rs   - Ownership and deferred spawns          │
//! │  ├── combat.rs      - Hit-scan and cooldown                  │
//! │  ├── lifecycle.rs   - Match clock and winner                 │
//! │  └── events.rs      - Session events                         │
//! │                                                              │
//! │  network/           - Sessions and transport                 │
//! │  ├── protocol.rs    - Remote calls and frames                │
//! │  ├── transport.rs   - Transport trait                        │
//! │  ├── ws.rs          - WebSocket transport                    │
//! │  ├── loopback.rs    - In-process transport                   │
//! │  ├── rpc.rs         - Caller/receiver authority table        │
//! │  ├── replication.rs - 20 Hz delta replication                │
//! │  ├── diagnostics.rs - Scoreboard and snapshots               │
//! │  └── session.rs     - Session manager                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Authority Model
//!
//! Every entity is owned by exactly one peer, and only that peer writes it.
//! Damage is requested from the victim's owner, kills are credited by the
//! attacker's owner, and only the host runs the match clock. Everything else
//! is a mirror fed by replication.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod network;

// Re-export commonly used types
pub use core::vec3::Vec3;
pub use core::rng::DeterministicRng;
pub use game::entity::{PeerId, PlayerEntity, MAX_HEALTH};
pub use game::events::SessionEvent;
pub use game::lifecycle::MatchPhase;
pub use network::session::{SessionConfig, SessionError, SessionManager};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default listening port
pub const DEFAULT_PORT: u16 = 28960;

/// Default maximum number of clients
pub const DEFAULT_MAX_PEERS: usize = 32;

/// Replication interval (ms), 20 Hz
pub const REPLICATION_INTERVAL_MS: u64 = 50;

/// Match length (seconds)
pub const MATCH_DURATION_SECS: u32 = 300;
