//! Session Management
//!
//! One `SessionManager` per participant. It owns the peer table, the entity
//! authority, the replication channel and the match clock, and routes every
//! remote call through the authority table before any handler runs.
//!
//! ## Topology
//!
//! ```text
//!   client ──► host ──► client
//!      │        │
//!      └── every call goes through the host, which checks the caller
//!          rule, then applies and/or relays it with the origin preserved
//! ```
//!
//! The external simulation loop calls `tick(elapsed)` once per frame.
//! Transport events and locally addressed calls are applied only there.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use chrono::Utc;
use serde::{Serialize, Deserialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::core::rng::DeterministicRng;
use crate::core::vec3::Vec3;
use crate::game::authority::{
    EntityAuthority, SpawnError, SpawnOutcome, SpawnProgress, SpawnRetryPolicy,
};
use crate::game::combat::{resolve_hit, FireOutcome, HitLedger, SpatialQuery, WeaponCooldown};
use crate::game::entity::{DamageOutcome, FieldDelta, PeerId, PlayerEntity, ReplicatedFields};
use crate::game::events::SessionEvent;
use crate::game::lifecycle::{compute_winner, MatchLifecycle, MatchPhase};
use crate::game::spawn::SpawnPointProvider;
use crate::network::diagnostics::{
    sort_scoreboard, EntitySummary, PeerSummary, ScoreLine, SessionSnapshot,
};
use crate::network::protocol::{Delivery, Envelope, Frame, RemoteCall, Target};
use crate::network::replication::{ReplicationChannel, ReplicationConfig, ReplicationStats};
use crate::network::rpc::{AuthorityViolation, RpcTable};
use crate::network::transport::{Transport, TransportError, TransportEvent};

/// Unique session identifier.
pub type SessionId = [u8; 16];

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Configuration for a session participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Listening port when hosting.
    pub port: u16,
    /// Maximum clients when hosting.
    pub max_peers: usize,
    /// Replication timing.
    pub replication: ReplicationConfig,
    /// Match length (seconds).
    pub match_duration_secs: f64,
    /// Damage per hit.
    pub damage_per_hit: u32,
    /// Hit-scan range.
    pub weapon_range: f32,
    /// Minimum time between shots (ms).
    pub fire_cooldown_ms: u64,
    /// Height added above the chosen spawn point.
    pub spawn_height_offset: f32,
    /// Position used when no spawn point exists.
    pub fallback_spawn: Vec3,
    /// Backoff for spawns requested before the scene is ready.
    pub spawn_retry: SpawnRetryPolicy,
    /// Event channel capacity.
    pub event_capacity: usize,
    /// Fixed spawn-selection seed (tests, replays). Random per session if unset.
    pub rng_seed: Option<u64>,
    /// Join handshake timeout (ms).
    pub connect_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: crate::DEFAULT_PORT,
            max_peers: crate::DEFAULT_MAX_PEERS,
            replication: ReplicationConfig::default(),
            match_duration_secs: crate::MATCH_DURATION_SECS as f64,
            damage_per_hit: 25,
            weapon_range: 1000.0,
            fire_cooldown_ms: 500,
            spawn_height_offset: 0.5,
            fallback_spawn: Vec3::new(0.0, 2.0, 0.0),
            spawn_retry: SpawnRetryPolicy::default(),
            event_capacity: 256,
            rng_seed: None,
            connect_timeout_ms: 5000,
        }
    }
}

impl SessionConfig {
    /// Parse from JSON. Missing fields take defaults.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Join handshake timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

// =============================================================================
// PEERS
// =============================================================================

/// Role of a peer in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    /// Listening peer, id 1.
    Host,
    /// Joined peer.
    Client,
}

/// Link state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Handshake in progress.
    Connecting,
    /// Link up.
    Connected,
    /// Link down.
    Disconnected,
}

/// A participant as seen locally.
#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    /// Transport-assigned id.
    pub id: PeerId,
    /// Host or client.
    pub role: PeerRole,
    /// Link state.
    pub state: ConnectionState,
}

impl Peer {
    fn connected(id: PeerId) -> Self {
        Self {
            id,
            role: if id.is_host() { PeerRole::Host } else { PeerRole::Client },
            state: ConnectionState::Connected,
        }
    }
}

/// Session errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    /// Host/join while a session is running.
    #[error("a session is already active")]
    AlreadyActive,

    /// Operation needs a running session.
    #[error("no active session")]
    NotActive,

    /// Local peer does not own the entity.
    #[error("local peer has no authority over entity {0}")]
    NotAuthority(PeerId),

    /// Weapon still cooling down.
    #[error("weapon cooling down")]
    CooldownActive,

    /// Match already ended.
    #[error("match is over")]
    MatchOver,

    /// Transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Map loopback aliases to the IPv4 loopback address.
pub fn canonical_address(address: &str) -> String {
    match address.trim() {
        "localhost" | "127.0.0.1" | "::1" | "[::1]" => "127.0.0.1".to_string(),
        other => other.to_string(),
    }
}

// =============================================================================
// SESSION MANAGER
// =============================================================================

/// Networking and authority core for one participant.
pub struct SessionManager<T: Transport> {
    config: SessionConfig,
    transport: T,
    spawn_points: Box<dyn SpawnPointProvider + Send>,
    session_id: Option<SessionId>,
    local_id: Option<PeerId>,
    role: Option<PeerRole>,
    peers: BTreeMap<PeerId, Peer>,
    authority: EntityAuthority,
    replication: ReplicationChannel,
    lifecycle: MatchLifecycle,
    weapon: WeaponCooldown,
    hits: HitLedger,
    rpc: RpcTable,
    local_queue: VecDeque<Envelope>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl<T: Transport> SessionManager<T> {
    /// Create an idle session manager.
    pub fn new(
        config: SessionConfig,
        transport: T,
        spawn_points: Box<dyn SpawnPointProvider + Send>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));

        Self {
            authority: EntityAuthority::new(
                config.spawn_retry,
                config.spawn_height_offset,
                config.fallback_spawn,
            ),
            replication: ReplicationChannel::new(config.replication),
            lifecycle: MatchLifecycle::new(config.match_duration_secs),
            weapon: WeaponCooldown::new(config.fire_cooldown_ms as f64 / 1000.0),
            hits: HitLedger::new(),
            rpc: RpcTable::default(),
            transport,
            spawn_points,
            session_id: None,
            local_id: None,
            role: None,
            peers: BTreeMap::new(),
            local_queue: VecDeque::new(),
            event_tx,
            config,
        }
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    // -------------------------------------------------------------------------
    // Connection lifecycle
    // -------------------------------------------------------------------------

    /// Start hosting on `port`.
    #[instrument(skip(self))]
    pub fn start_host(&mut self, port: u16, max_peers: usize) -> Result<(), SessionError> {
        if self.is_active() {
            return Err(SessionError::AlreadyActive);
        }

        if let Err(e) = self.transport.listen(port, max_peers) {
            error!("Failed to host on port {}: {}", port, e);
            self.emit(SessionEvent::NetworkError { reason: e.to_string() });
            return Err(e.into());
        }

        let session_id = *Uuid::new_v4().as_bytes();
        self.begin(session_id, PeerId::HOST, PeerRole::Host);
        info!(
            "Session {} hosting on port {} (max {} peers)",
            hex::encode(&session_id[..4]),
            port,
            max_peers
        );
        self.emit(SessionEvent::SessionStarted { local_id: PeerId::HOST, port });
        Ok(())
    }

    /// Join a host. Returns the local peer id.
    #[instrument(skip(self))]
    pub fn join_host(&mut self, address: &str, port: u16) -> Result<PeerId, SessionError> {
        if self.is_active() {
            return Err(SessionError::AlreadyActive);
        }

        let address = canonical_address(address);
        let local = match self.transport.connect(&address, port) {
            Ok(id) => id,
            Err(e) => {
                warn!("Failed to join {}:{}: {}", address, port, e);
                self.emit(SessionEvent::NetworkError { reason: e.to_string() });
                return Err(e.into());
            }
        };

        let session_id = *Uuid::new_v4().as_bytes();
        self.begin(session_id, local, PeerRole::Client);
        info!(
            "Session {} joined {}:{} as peer {}",
            hex::encode(&session_id[..4]),
            address,
            port,
            local
        );
        self.emit(SessionEvent::SessionJoined { local_id: local });
        Ok(local)
    }

    /// Leave the session and return to idle. Safe to call repeatedly.
    pub fn disconnect(&mut self) {
        if !self.is_active() {
            return;
        }

        self.transport.close();
        self.session_id = None;
        self.local_id = None;
        self.role = None;
        self.peers.clear();
        self.authority.clear();
        self.replication.reset();
        self.lifecycle.reset();
        self.weapon.reset();
        self.hits.clear();
        self.local_queue.clear();

        info!("Session ended");
        self.emit(SessionEvent::SessionEnded);
    }

    /// The scene finished loading. On the host this spawns every connected
    /// peer still lacking an entity (the host included) and starts the match.
    pub fn notify_scene_ready(&mut self) -> Result<(), SessionError> {
        if !self.is_active() {
            return Err(SessionError::NotActive);
        }
        if self.authority.is_scene_ready() {
            return Ok(());
        }

        let progress = self.authority.mark_scene_ready(self.spawn_points.as_ref());
        for p in progress {
            self.on_spawn_progress(p);
        }

        if self.is_host() {
            let connected: Vec<PeerId> = self.peers.keys().copied().collect();
            for peer in connected {
                let outcome = self.authority.spawn_entity(peer, self.spawn_points.as_ref());
                self.on_spawn_outcome(outcome);
            }
            self.start_match();
        }
        Ok(())
    }

    /// Per-frame entry point.
    pub fn tick(&mut self, elapsed: Duration) {
        if !self.is_active() {
            return;
        }
        let dt = elapsed.as_secs_f64();

        for event in self.transport.poll() {
            self.on_transport_event(event);
            if !self.is_active() {
                return;
            }
        }
        self.drain_local_queue();

        let progress = self.authority.advance(dt, self.spawn_points.as_ref());
        for p in progress {
            self.on_spawn_progress(p);
        }

        self.weapon.advance(dt);
        self.replicate(dt);

        if self.is_host() {
            self.advance_match(dt);
        }
        self.drain_local_queue();
    }

    // -------------------------------------------------------------------------
    // Local authority actions
    // -------------------------------------------------------------------------

    /// Fire the local player's weapon.
    pub fn fire(
        &mut self,
        query: &dyn SpatialQuery,
        origin: Vec3,
        direction: Vec3,
    ) -> Result<FireOutcome, SessionError> {
        let local = self.local_id.ok_or(SessionError::NotActive)?;
        if self.authority.get(local).is_none() {
            return Err(SessionError::NotAuthority(local));
        }
        if self.lifecycle.is_ended() {
            return Err(SessionError::MatchOver);
        }
        if !self.weapon.is_ready() {
            return Err(SessionError::CooldownActive);
        }
        self.weapon.trigger();

        let hit = query.cast_ray(origin, direction.normalize(), self.config.weapon_range);
        let authority = &self.authority;
        let outcome = resolve_hit(local, hit, |id| authority.get(id).is_some());

        if let FireOutcome::Hit { target } = outcome {
            let owner = self.authority.owner_of(target).unwrap_or(target);
            debug!("Peer {} hit {}, requesting damage from owner {}", local, target, owner);
            self.hits.record_hit(owner);
            self.send_call(
                Target::Peer(owner),
                RemoteCall::TakeDamage {
                    entity: target,
                    amount: self.config.damage_per_hit,
                    attacker: local,
                },
            );
        }
        Ok(outcome)
    }

    /// Write the local player's transform.
    pub fn update_local_entity(
        &mut self,
        position: Vec3,
        rotation: Vec3,
        velocity: Vec3,
    ) -> Result<(), SessionError> {
        let local = self.local_id.ok_or(SessionError::NotActive)?;
        self.update_entity(local, position, rotation, velocity)
    }

    /// Write an entity's transform. Refused unless the local peer owns it.
    pub fn update_entity(
        &mut self,
        entity: PeerId,
        position: Vec3,
        rotation: Vec3,
        velocity: Vec3,
    ) -> Result<(), SessionError> {
        let local = self.local_id.ok_or(SessionError::NotActive)?;
        match self.authority.get_mut(entity) {
            Some(e) if e.is_owned_by(local) => {
                e.set_transform(position, rotation, velocity);
                Ok(())
            }
            _ => Err(SessionError::NotAuthority(entity)),
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Check if a session is running.
    pub fn is_active(&self) -> bool {
        self.local_id.is_some()
    }

    /// Check if this participant is the host.
    pub fn is_host(&self) -> bool {
        self.role == Some(PeerRole::Host)
    }

    /// Local peer id.
    pub fn local_id(&self) -> Option<PeerId> {
        self.local_id
    }

    /// Local role.
    pub fn role(&self) -> Option<PeerRole> {
        self.role
    }

    /// Short hex session id for logs.
    pub fn session_tag(&self) -> Option<String> {
        self.session_id.map(|id| hex::encode(&id[..4]))
    }

    /// Known peers, ordered by id.
    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Look up a peer.
    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    /// Look up an entity.
    pub fn entity(&self, id: PeerId) -> Option<&PlayerEntity> {
        self.authority.get(id)
    }

    /// All entities, ordered by id.
    pub fn entities(&self) -> impl Iterator<Item = &PlayerEntity> {
        self.authority.entities()
    }

    /// The local player's entity.
    pub fn local_entity(&self) -> Option<&PlayerEntity> {
        self.local_id.and_then(|id| self.authority.get(id))
    }

    /// Match phase.
    pub fn match_phase(&self) -> MatchPhase {
        self.lifecycle.phase()
    }

    /// Match clock (seconds).
    pub fn remaining_time(&self) -> f64 {
        self.lifecycle.remaining()
    }

    /// Match winner once ended.
    pub fn winner(&self) -> Option<PeerId> {
        self.lifecycle.winner()
    }

    /// Replication counters.
    pub fn replication_stats(&self) -> ReplicationStats {
        self.replication.stats()
    }

    /// Configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Underlying transport, mutably.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Scoreboard rows, most kills first.
    pub fn scoreboard(&self) -> Vec<ScoreLine> {
        let mut rows: Vec<ScoreLine> = self
            .authority
            .entities()
            .map(|e| ScoreLine {
                peer: e.id(),
                kills: e.fields.kills,
                deaths: e.fields.deaths,
                is_local: Some(e.id()) == self.local_id,
            })
            .collect();
        sort_scoreboard(&mut rows);
        rows
    }

    /// Debug snapshot of the whole session.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            captured_at: Utc::now(),
            session: self.session_tag(),
            local_id: self.local_id,
            role: self.role,
            peers: self
                .peers
                .values()
                .map(|p| PeerSummary { id: p.id, role: p.role, state: p.state })
                .collect(),
            entities: self
                .authority
                .entities()
                .map(|e| EntitySummary {
                    id: e.id(),
                    owner: e.owner(),
                    position: e.fields.position,
                    health: e.fields.health,
                    local: Some(e.owner()) == self.local_id,
                })
                .collect(),
            phase: self.lifecycle.phase(),
            remaining_secs: self.lifecycle.remaining(),
            replication: self.replication.stats(),
        }
    }

    // -------------------------------------------------------------------------
    // Internals: session state
    // -------------------------------------------------------------------------

    fn begin(&mut self, session_id: SessionId, local: PeerId, role: PeerRole) {
        let rng = match self.config.rng_seed {
            Some(seed) => DeterministicRng::new(seed ^ local.0 as u64),
            None => DeterministicRng::for_session(&session_id, local.0),
        };

        self.session_id = Some(session_id);
        self.local_id = Some(local);
        self.role = Some(role);
        self.peers.clear();
        self.peers.insert(local, Peer { id: local, role, state: ConnectionState::Connected });
        self.authority.clear();
        self.authority.reseed(rng);
        self.replication.reset();
        self.lifecycle.reset();
        self.weapon.reset();
        self.hits.clear();
        self.local_queue.clear();
    }

    fn emit(&self, event: SessionEvent) {
        #[cfg(feature = "debug-tracing")]
        tracing::trace!("event {}", event.name());
        let _ = self.event_tx.send(event);
    }

    fn start_match(&mut self) {
        if self.lifecycle.start().is_err() {
            return;
        }
        let remaining = self.lifecycle.remaining();
        self.emit(SessionEvent::MatchStarted { remaining });
        self.send_call(Target::All, RemoteCall::SetRemainingTime { seconds: remaining });
    }

    fn advance_match(&mut self, dt: f64) {
        let update = self.lifecycle.advance(dt);

        if let Some(seconds) = update.broadcast {
            self.emit(SessionEvent::RemainingTime { seconds });
            self.send_call(Target::All, RemoteCall::SetRemainingTime { seconds });
        }

        if update.expired {
            let winner = compute_winner(self.authority.entities().map(|e| (e.id(), e.fields.kills)));
            if self.lifecycle.end(winner).is_ok() {
                self.send_call(Target::All, RemoteCall::AnnounceResult { winner });
                self.emit(SessionEvent::MatchEnded { winner });
            }
        }
    }

    fn replicate(&mut self, dt: f64) {
        if !self.replication.advance(dt) {
            return;
        }
        let Some(local) = self.local_id else { return };

        let calls = self.replication.collect_owned(local, self.authority.entities());
        for call in calls {
            self.send_call(Target::All, call);
        }
    }

    // -------------------------------------------------------------------------
    // Internals: spawning
    // -------------------------------------------------------------------------

    fn on_spawn_outcome(&mut self, outcome: SpawnOutcome) {
        match outcome {
            SpawnOutcome::Spawned { entity, position, diagnostic } => {
                self.on_spawned(entity, position, diagnostic);
            }
            SpawnOutcome::Deferred => {}
            SpawnOutcome::AlreadyPresent => {}
        }
    }

    fn on_spawn_progress(&mut self, progress: SpawnProgress) {
        match progress {
            SpawnProgress::Spawned { entity, position, diagnostic } => {
                self.on_spawned(entity, position, diagnostic);
            }
            SpawnProgress::Abandoned(SpawnError::SceneNotReady { peer, attempts }) => {
                self.emit(SessionEvent::SpawnAbandoned { entity: peer, attempts });
            }
            SpawnProgress::Abandoned(other) => warn!("{}", other),
        }
    }

    fn on_spawned(&mut self, entity: PeerId, position: Vec3, diagnostic: Option<SpawnError>) {
        if let Some(SpawnError::SpawnUnavailable { peer, position }) = diagnostic {
            self.emit(SessionEvent::SpawnFallback { entity: peer, position });
        }
        info!("Entity {} spawned at {}", entity, position);
        self.emit(SessionEvent::EntitySpawned { entity, position });

        if self.is_host() {
            if let Some(fields) = self.authority.get(entity).map(|e| e.fields) {
                self.send_call(Target::All, RemoteCall::SpawnEntity { entity, fields });
            }
        }
    }

    // -------------------------------------------------------------------------
    // Internals: transport events
    // -------------------------------------------------------------------------

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PeerConnected(peer) => self.on_peer_connected(peer),
            TransportEvent::PeerDisconnected(peer) => self.on_peer_disconnected(peer),
            TransportEvent::Message { from, envelope } => self.on_message(from, envelope),
        }
    }

    fn on_peer_connected(&mut self, peer: PeerId) {
        self.peers.insert(peer, Peer::connected(peer));
        info!("Peer {} connected", peer);
        self.emit(SessionEvent::PeerConnected { peer });

        if let Some(local) = self.local_id {
            self.replication.invalidate(local);
        }
        if !self.is_host() {
            return;
        }

        // Existing entities first, then the newcomer's own
        let existing: Vec<(PeerId, ReplicatedFields)> =
            self.authority.entities().map(|e| (e.id(), e.fields)).collect();
        for (entity, fields) in existing {
            self.send_call(Target::Peer(peer), RemoteCall::SpawnEntity { entity, fields });
        }

        let outcome = self.authority.spawn_entity(peer, self.spawn_points.as_ref());
        self.on_spawn_outcome(outcome);

        // Late join
        match self.lifecycle.phase() {
            MatchPhase::Active => {
                let seconds = self.lifecycle.remaining();
                self.send_call(Target::Peer(peer), RemoteCall::SetRemainingTime { seconds });
            }
            MatchPhase::Ended => {
                let winner = self.lifecycle.winner();
                self.send_call(Target::Peer(peer), RemoteCall::AnnounceResult { winner });
            }
            MatchPhase::Idle => {}
        }
    }

    fn on_peer_disconnected(&mut self, peer: PeerId) {
        if !self.is_host() && peer.is_host() {
            warn!("Lost connection to host");
            self.emit(SessionEvent::HostLost);
            self.disconnect();
            return;
        }

        if self.peers.remove(&peer).is_none() {
            return;
        }
        let removed = self.authority.despawn_entity(peer);
        self.replication.forget(peer);
        self.hits.forget(peer);
        info!("Peer {} disconnected", peer);

        if removed.is_some() {
            self.emit(SessionEvent::EntityDespawned { entity: peer });
        }
        if self.is_host() {
            self.send_call(Target::All, RemoteCall::DespawnEntity { entity: peer });
        }
        self.emit(SessionEvent::PeerDisconnected { peer });
    }

    fn on_message(&mut self, from: PeerId, envelope: Envelope) {
        let Some(local) = self.local_id else { return };

        if !self.is_host() {
            self.dispatch(envelope);
            return;
        }

        if envelope.origin != from {
            let violation = AuthorityViolation::SpoofedOrigin { claimed: envelope.origin, link: from };
            self.reject(from, envelope.call.name(), violation);
            return;
        }

        let target = envelope.target;
        let relayed = match target {
            Target::Peer(id) => id != local,
            Target::Host => false,
            Target::All => true,
        };

        if relayed {
            let subject_owner = envelope.call.subject().and_then(|id| self.authority.owner_of(id));
            if let Err(violation) = self.rpc.check_caller(&envelope.call, envelope.origin, subject_owner) {
                self.reject(envelope.origin, envelope.call.name(), violation);
                return;
            }
        }

        match target {
            Target::Peer(id) if id != local => self.forward(id, &envelope),
            Target::All => {
                let frame = Frame::Call(envelope.clone());
                let delivery = envelope.call.delivery();
                let recipients: Vec<PeerId> = self
                    .peers
                    .keys()
                    .copied()
                    .filter(|id| *id != local && *id != envelope.origin)
                    .collect();
                for id in recipients {
                    self.transmit(id, &frame, delivery);
                }
                self.dispatch(envelope);
            }
            _ => self.dispatch(envelope),
        }
    }

    fn forward(&mut self, to: PeerId, envelope: &Envelope) {
        if !self.peers.contains_key(&to) {
            debug!("Dropping {} for departed peer {}", envelope.call.name(), to);
            return;
        }
        let frame = Frame::Call(envelope.clone());
        self.transmit(to, &frame, envelope.call.delivery());
    }

    // -------------------------------------------------------------------------
    // Internals: outgoing calls
    // -------------------------------------------------------------------------

    fn send_call(&mut self, target: Target, call: RemoteCall) {
        let Some(local) = self.local_id else { return };
        let envelope = Envelope::new(local, target, call);

        match target {
            Target::Peer(id) if id == local => self.local_queue.push_back(envelope),
            Target::Host if self.is_host() => self.local_queue.push_back(envelope),
            Target::Peer(id) if self.is_host() => {
                let delivery = envelope.call.delivery();
                self.transmit(id, &Frame::Call(envelope), delivery);
            }
            Target::All if self.is_host() => {
                let delivery = envelope.call.delivery();
                let frame = Frame::Call(envelope);
                let recipients: Vec<PeerId> =
                    self.peers.keys().copied().filter(|id| *id != local).collect();
                for id in recipients {
                    self.transmit(id, &frame, delivery);
                }
            }
            // Clients route everything through the host
            _ => {
                let delivery = envelope.call.delivery();
                self.transmit(PeerId::HOST, &Frame::Call(envelope), delivery);
            }
        }
    }

    fn transmit(&mut self, to: PeerId, frame: &Frame, delivery: Delivery) {
        if let Err(e) = self.transport.send(to, frame, delivery) {
            debug!("Send to {} failed: {}", to, e);
        }
    }

    fn drain_local_queue(&mut self) {
        while let Some(envelope) = self.local_queue.pop_front() {
            self.dispatch(envelope);
        }
    }

    // -------------------------------------------------------------------------
    // Internals: dispatch
    // -------------------------------------------------------------------------

    fn reject(&mut self, origin: PeerId, call: &str, violation: AuthorityViolation) {
        self.replication.record_rejected();
        self.publish_rejection(origin, call, &violation);
    }

    fn publish_rejection(&self, origin: PeerId, call: &str, violation: &AuthorityViolation) {
        warn!("Rejected {} from peer {}: {}", call, origin, violation);
        self.emit(SessionEvent::AuthorityRejected {
            origin,
            call: call.to_string(),
            reason: violation.to_string(),
        });
    }

    fn dispatch(&mut self, envelope: Envelope) {
        let Some(local) = self.local_id else { return };
        let Envelope { origin, call, .. } = envelope;
        let subject_owner = call.subject().and_then(|id| self.authority.owner_of(id));

        // State for an entity we no longer (or not yet) track
        if matches!(call, RemoteCall::ApplyState { .. }) && subject_owner.is_none() {
            debug!("Dropping state for unknown entity {:?}", call.subject());
            return;
        }

        if let Err(violation) = self.rpc.check(&call, origin, local, subject_owner) {
            self.reject(origin, call.name(), violation);
            return;
        }

        match call {
            RemoteCall::ApplyState { entity, seq, delta } => {
                self.on_apply_state(local, origin, entity, seq, &delta);
            }
            RemoteCall::TakeDamage { entity, amount, attacker } => {
                if attacker != origin {
                    let violation = AuthorityViolation::ForgedAttacker { origin, claimed: attacker };
                    self.reject(origin, "take_damage", violation);
                    return;
                }
                self.on_take_damage(entity, amount, attacker);
            }
            RemoteCall::AddKill { attacker } => {
                if origin != local && !self.hits.redeem(origin) {
                    let violation = AuthorityViolation::UnbackedKill { origin, attacker };
                    self.reject(origin, "add_kill", violation);
                    return;
                }
                self.credit_kill_local(attacker);
            }
            RemoteCall::SetRemainingTime { seconds } => {
                if self.is_host() || self.lifecycle.is_ended() {
                    return;
                }
                if self.lifecycle.observe_remaining(seconds) {
                    self.emit(SessionEvent::MatchStarted { remaining: seconds });
                }
                self.emit(SessionEvent::RemainingTime { seconds });
            }
            RemoteCall::AnnounceResult { winner } => {
                if !self.is_host() && self.lifecycle.observe_result(winner) {
                    info!("Match result received, winner: {:?}", winner);
                    self.emit(SessionEvent::MatchEnded { winner });
                }
            }
            RemoteCall::SpawnEntity { entity, fields } => {
                if self.is_host() {
                    return;
                }
                if !self.authority.insert_mirror(PlayerEntity::from_fields(entity, fields)) {
                    return;
                }
                if !self.peers.contains_key(&entity) {
                    self.peers.insert(entity, Peer::connected(entity));
                    self.emit(SessionEvent::PeerConnected { peer: entity });
                }
                // The newcomer has no baseline for our entity yet
                self.replication.invalidate(local);
                self.emit(SessionEvent::EntitySpawned { entity, position: fields.position });
            }
            RemoteCall::DespawnEntity { entity } => {
                if self.is_host() || entity == local {
                    return;
                }
                if self.authority.despawn_entity(entity).is_some() {
                    self.replication.forget(entity);
                    self.emit(SessionEvent::EntityDespawned { entity });
                }
                if !entity.is_host() && self.peers.remove(&entity).is_some() {
                    self.emit(SessionEvent::PeerDisconnected { peer: entity });
                }
            }
        }
    }

    fn on_apply_state(&mut self, local: PeerId, origin: PeerId, entity: PeerId, seq: u64, delta: &FieldDelta) {
        let Some(target) = self.authority.get_mut(entity) else { return };
        if let Err(violation) = self.replication.apply_remote(local, origin, target, seq, delta) {
            self.publish_rejection(origin, "apply_state", &violation);
        }
    }

    fn on_take_damage(&mut self, entity: PeerId, amount: u32, attacker: PeerId) {
        let Some(victim) = self.authority.get_mut(entity) else { return };
        let outcome = victim.apply_damage(amount);
        let health = victim.fields.health;
        self.emit(SessionEvent::EntityDamaged { entity, attacker, amount, health });

        if outcome != DamageOutcome::Killed {
            return;
        }

        let spawn = self.authority.select_respawn(self.spawn_points.as_ref());
        if let Some(victim) = self.authority.get_mut(entity) {
            victim.respawn_at(spawn.position);
        }
        if spawn.is_fallback() {
            self.emit(SessionEvent::SpawnFallback { entity, position: spawn.position });
        }
        info!("Entity {} killed by {}, respawning at {}", entity, attacker, spawn.position);
        self.emit(SessionEvent::PlayerDied { victim: entity, killer: attacker, respawn_at: spawn.position });

        if attacker == entity {
            return;
        }
        if self.local_id.is_some() && self.authority.owner_of(attacker) == self.local_id {
            self.credit_kill_local(attacker);
        } else {
            self.send_call(Target::Peer(attacker), RemoteCall::AddKill { attacker });
        }
    }

    fn credit_kill_local(&mut self, attacker: PeerId) {
        let Some(entity) = self.authority.get_mut(attacker) else { return };
        entity.add_kill();
        let kills = entity.fields.kills;
        info!("Kill credited to {} ({} total)", attacker, kills);
        self.emit(SessionEvent::KillCredited { entity: attacker, kills });
    }
}

// =============================================================================
// TESTS
// =============================================================================
