//! Pilot Runner
//!
//! The runner is the per-peer driver of a replicated session. It owns:
//! - The transport session (hosting or joining a named room)
//! - Authority bookkeeping and capability tokens
//! - Input sampling, validation and tick-indexed buffering
//! - Entity spawning and the despawn policy
//! - Field replication, change detection and remote mutation requests
//!
//! # Architecture
//!
//! Exactly one peer, the host, is state authority for every entity. It runs
//! the simulation step with the inputs delivered for the current tick and
//! publishes the result. Every other peer mirrors what it is sent and only
//! ever asks for changes through the input and remote mutation channels.
//!
//! Nothing here is shared across threads. The runner is driven from one loop:
//! [`Runner::poll`], [`Runner::fixed_update`] and [`Runner::render`], or
//! [`Runner::run_ticks`] which paces the three with a tokio interval.

#![deny(unsafe_code)]

pub mod authority;
pub mod callbacks;
pub mod change_detector;
pub mod config;
pub mod error;
pub mod field;
pub mod input;
pub mod input_buffer;
pub mod presentation;
pub mod rpc;
pub mod session;
pub mod spawner;
pub mod transport;
pub mod validation;

use std::collections::{BTreeMap, BTreeSet};

use pilot_sim::{
    EntityId, PeerId, STATE_DIGEST_ALGO_ID, Snapshot, StepInput, Tick, Transform, World,
};
use pilot_wire::{
    Body, EntityDespawned, EntitySpawned, FieldUpdate, FieldValueProto, InputAuthorityChanged,
    InputCmdProto, SetFieldRequest, SnapshotProto, Welcome, decode_packet, encode_packet,
    peer_from_wire, peer_to_wire,
};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

pub use authority::{AuthorityMap, InputAuthority, Roles, StateAuthority};
pub use callbacks::{NoCallbacks, RunnerCallbacks};
pub use change_detector::{ChangeDetector, FieldChange};
pub use config::{CameraConfig, DespawnPolicy, GameMode, MovementConfig, RunnerConfig};
pub use error::{
    AuthorityError, ConfigError, ConnectError, RpcError, RunnerError, SpawnError, TransportError,
};
pub use field::{FieldKey, FieldValue, NetworkedField, PlayerName};
pub use input::{DeviceState, InputSnapshot, InputSource, NoInput, SharedInput, TickTargeting};
pub use presentation::{CameraRig, FixedCamera, LabelBoard, NameLabels};
pub use session::Session;
pub use spawner::{EntitySpawner, LeaveOutcome, SceneLocator, StaticScene};
pub use transport::{DisconnectReason, LoopbackNetwork, Transport, TransportEvent};

use input_buffer::InputBuffer;
use validation::{ValidationConfig, ValidationResult, validate_input};

// ============================================================================
// Default Parameters
// ============================================================================

/// Simulation tick rate in Hz.
pub const TICK_RATE_HZ: u32 = 60;

/// Maximum ticks ahead a client can target.
pub const MAX_FUTURE_TICKS: u64 = 120;

/// TargetTickFloor lead.
pub const INPUT_LEAD_TICKS: u64 = 1;

/// Connection timeout in milliseconds.
pub const CONNECT_TIMEOUT_MS: u64 = 30000;

/// Capacity of a hosted session, the host included.
pub const MAX_PEERS: usize = 16;

pub const DEFAULT_SESSION_NAME: &str = "TestRoom";

/// Scene tag of the spawn point.
pub const DEFAULT_SPAWN_TAG: &str = "Respawn";

// ============================================================================
// Entity State
// ============================================================================

/// Lifecycle of an entity as seen by the state authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityPhase {
    /// Spawned, no input consumed yet.
    Spawned,
    /// At least one input was consumed by the simulation step.
    Simulating,
    Despawned,
}

#[derive(Debug)]
struct EntityRecord {
    name: NetworkedField<PlayerName>,
    phase: EntityPhase,
}

/// Counters for everything the runner dropped or refused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunnerStats {
    pub inputs_accepted: u64,
    pub inputs_dropped: u64,
    pub inputs_missing: u64,
    pub rpcs_rejected: u64,
    pub malformed_packets: u64,
    pub desyncs: u64,
}

// ============================================================================
// Runner
// ============================================================================

/// One peer of a replicated session.
pub struct Runner {
    config: RunnerConfig,
    session: Session,
    world: World,
    authority: AuthorityMap,
    entities: BTreeMap<EntityId, EntityRecord>,
    despawned: BTreeSet<EntityId>,
    spawner: EntitySpawner,
    scene: Box<dyn SceneLocator>,
    detector: ChangeDetector,
    input_source: Box<dyn InputSource>,
    callbacks: Box<dyn RunnerCallbacks>,
    labels: Option<Box<dyn NameLabels>>,
    camera: Option<Box<dyn CameraRig>>,
    stats: RunnerStats,
    running: bool,
    /// `on_connected` is delivered from the first poll.
    announced: bool,

    // State authority
    input_buffer: InputBuffer,
    validation: ValidationConfig,
    /// Last emitted target tick floor.
    target_tick_floor: Tick,
    /// Peers that were sent a welcome and the catch-up spawns.
    welcomed: BTreeSet<PeerId>,

    // Replica
    welcome: Option<Welcome>,
    targeting: TickTargeting,
}

impl Runner {
    /// Validate `config` and host or join its session.
    ///
    /// Suspends until the session is established. Connection failures are
    /// returned without retry.
    pub async fn start(
        network: &LoopbackNetwork,
        config: RunnerConfig,
        scene: Box<dyn SceneLocator>,
    ) -> Result<Self, RunnerError> {
        config.validate()?;

        let session = Session::start(
            network,
            config.mode,
            &config.session_name,
            config.max_peers,
            config.connect_timeout(),
        )
        .await?;

        let world = World::new(config.tick_rate_hz, (&config.movement).into());
        let target_tick_floor = world.tick() + config.input_lead_ticks;

        Ok(Self {
            authority: AuthorityMap::new(session.local_peer()),
            spawner: EntitySpawner::new(&config.spawn_tag, config.despawn_policy),
            validation: ValidationConfig {
                max_future_ticks: config.max_future_ticks,
            },
            session,
            world,
            entities: BTreeMap::new(),
            despawned: BTreeSet::new(),
            scene,
            detector: ChangeDetector::new(),
            input_source: Box::new(NoInput),
            callbacks: Box::new(NoCallbacks),
            labels: None,
            camera: None,
            stats: RunnerStats::default(),
            running: true,
            announced: false,
            input_buffer: InputBuffer::new(),
            target_tick_floor,
            welcomed: BTreeSet::new(),
            welcome: None,
            targeting: TickTargeting::default(),
            config,
        })
    }

    pub fn with_input(mut self, source: impl InputSource + 'static) -> Self {
        self.input_source = Box::new(source);
        self
    }

    pub fn with_callbacks(mut self, callbacks: impl RunnerCallbacks + 'static) -> Self {
        self.callbacks = Box::new(callbacks);
        self
    }

    pub fn with_labels(mut self, labels: impl NameLabels + 'static) -> Self {
        self.labels = Some(Box::new(labels));
        self
    }

    pub fn with_camera(mut self, camera: impl CameraRig + 'static) -> Self {
        self.camera = Some(Box::new(camera));
        self
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn local_peer(&self) -> PeerId {
        self.session.local_peer()
    }

    pub fn host_peer(&self) -> PeerId {
        self.session.host_peer()
    }

    /// True on the state authority.
    pub fn is_server(&self) -> bool {
        self.session.is_server()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Current tick (pre-step on the authority, last snapshot on replicas).
    pub fn current_tick(&self) -> Tick {
        self.world.tick()
    }

    pub fn target_tick_floor(&self) -> Tick {
        if self.is_server() {
            self.target_tick_floor
        } else {
            self.targeting.floor()
        }
    }

    /// Tick targeting of locally sampled input (replicas).
    pub fn targeting(&self) -> &TickTargeting {
        &self.targeting
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn authority(&self) -> &AuthorityMap {
        &self.authority
    }

    pub fn stats(&self) -> RunnerStats {
        self.stats
    }

    /// Entities known to this peer, in id order.
    pub fn entities(&self) -> Vec<EntityId> {
        self.entities.keys().copied().collect()
    }

    /// Entity the local peer controls, if any.
    pub fn local_entity(&self) -> Option<EntityId> {
        self.authority.local_entity()
    }

    pub fn transform(&self, entity: EntityId) -> Option<Transform> {
        self.world.transform(entity)
    }

    pub fn player_name(&self, entity: EntityId) -> Option<&PlayerName> {
        self.entities.get(&entity).map(|record| record.name.get())
    }

    pub fn phase(&self, entity: EntityId) -> Option<EntityPhase> {
        if self.despawned.contains(&entity) {
            return Some(EntityPhase::Despawned);
        }
        self.entities.get(&entity).map(|record| record.phase)
    }

    pub fn state_authority(&self, entity: EntityId) -> Option<StateAuthority> {
        self.authority.state_authority(entity)
    }

    pub fn input_authority(&self, entity: EntityId) -> Option<InputAuthority> {
        self.authority.input_authority(entity)
    }

    /// State authority only: the input `peer` delivered for the current tick.
    ///
    /// `None` means nothing arrived (yet). There is no fallback to earlier
    /// input; the caller decides what absence means.
    pub fn try_get_input(&self, peer: PeerId) -> Option<InputSnapshot> {
        if !self.is_server() {
            return None;
        }
        self.input_buffer.get(peer, self.world.tick()).copied()
    }

    // ========================================================================
    // Loop
    // ========================================================================

    /// Drain transport events and messages.
    ///
    /// Only a missing spawn point or a closed transport is fatal; bad packets
    /// and refused requests are logged and counted.
    pub fn poll(&mut self) -> Result<(), RunnerError> {
        if !self.running {
            return Ok(());
        }
        if !self.announced {
            self.announced = true;
            self.callbacks
                .on_connected(self.session.local_peer(), self.session.host_peer());
        }

        for event in self.session.poll() {
            match event {
                TransportEvent::PeerJoined(peer) => self.handle_peer_joined(peer)?,
                TransportEvent::PeerLeft(peer) => self.handle_peer_left(peer)?,
                TransportEvent::Message { from, payload } => {
                    self.handle_message(from, &payload)?;
                }
                TransportEvent::Disconnected(reason) => {
                    warn!(?reason, "session lost");
                    self.teardown();
                    self.callbacks.on_disconnected(reason);
                    break;
                }
            }
        }
        Ok(())
    }

    /// One fixed simulation tick.
    ///
    /// On the state authority: consume the inputs delivered for the current
    /// tick, advance the world, publish the snapshot and changed fields.
    /// Elsewhere: sample local input and send it to the authority.
    pub fn fixed_update(&mut self) -> Result<(), RunnerError> {
        if !self.running || !self.session.is_open() {
            return Ok(());
        }
        if self.is_server() {
            self.step_authority()
        } else {
            self.send_local_input()
        }
    }

    /// Change detection and presentation.
    ///
    /// Runs identically on every peer. Returns the fields that changed since
    /// the previous pass, each once.
    pub fn render(&mut self) -> Vec<FieldChange> {
        let mut changes = Vec::new();
        if !self.running {
            return changes;
        }

        let ids: Vec<EntityId> = self.entities.keys().copied().collect();
        for entity in ids {
            let current = self.current_fields(entity);
            for change in self.detector.detect(entity, current) {
                if change.field == FieldKey::PlayerName
                    && let Some(labels) = self.labels.as_mut()
                    && let Some(record) = self.entities.get(&entity)
                {
                    labels.set_text(entity, record.name.get().as_str());
                }
                self.callbacks.on_field_changed(entity, change.field);
                changes.push(change);
            }
        }

        // Late update: camera follows the local player.
        if let Some(camera) = self.camera.as_mut()
            && let Some(entity) = self.authority.local_entity()
            && let Some(transform) = self.world.transform(entity)
        {
            presentation::follow(camera.as_mut(), transform, &self.config.camera);
        }

        changes
    }

    /// `poll`, `fixed_update` and `render` once.
    pub fn tick_once(&mut self) -> Result<Vec<FieldChange>, RunnerError> {
        self.poll()?;
        self.fixed_update()?;
        Ok(self.render())
    }

    /// Run `ticks` loop iterations paced at the configured tick rate.
    pub async fn run_ticks(&mut self, ticks: u64) -> Result<(), RunnerError> {
        let mut interval = tokio::time::interval(self.config.tick_duration());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        for _ in 0..ticks {
            interval.tick().await;
            if !self.running {
                break;
            }
            self.tick_once()?;
        }
        Ok(())
    }

    /// Leave the session, tearing down every entity and role assignment.
    pub fn shutdown(&mut self) {
        if !self.running {
            return;
        }
        self.session.shutdown();
        self.teardown();
        info!(session = %self.config.session_name, "runner shut down");
        self.callbacks.on_shutdown();
    }

    // ========================================================================
    // Field Mutation
    // ========================================================================

    /// Assign an entity's name on the state authority.
    pub fn set_player_name(
        &mut self,
        authority: &StateAuthority,
        name: &str,
    ) -> Result<bool, RunnerError> {
        let entity = authority.entity();
        self.authority.verify_state(authority, entity)?;
        let record = self
            .entities
            .get_mut(&entity)
            .ok_or(AuthorityError::UnknownEntity(entity))?;
        Ok(record.name.set(authority, PlayerName::new(name))?)
    }

    /// Ask the state authority to assign a field of the caller's entity.
    ///
    /// Applied directly when the local peer is also the state authority.
    pub fn request_set_field(
        &mut self,
        authority: &InputAuthority,
        field: FieldKey,
        value: &str,
    ) -> Result<(), RunnerError> {
        let request = rpc::build_request(authority, field, value, &self.authority)?;

        if self.authority.is_state_authority(authority.entity()) {
            let mutation = rpc::authorize(request, self.local_peer(), &self.authority)?;
            self.apply_mutation(mutation)?;
        } else {
            debug!(entity = request.entity_id, field = %field, "sending set-field request");
            self.session.send(
                self.session.host_peer(),
                encode_packet(Body::SetField(request)),
            )?;
        }
        Ok(())
    }

    fn apply_mutation(&mut self, mutation: rpc::AuthorizedMutation) -> Result<(), RunnerError> {
        let Some(token) = self.authority.state_authority(mutation.entity) else {
            return Err(AuthorityError::RoleNotHeld {
                role: "state authority",
                entity: mutation.entity,
            }
            .into());
        };
        match mutation.field {
            FieldKey::PlayerName => {
                self.set_player_name(&token, &mutation.value)?;
            }
            FieldKey::Transform => {
                return Err(RpcError::FieldNotSettable(mutation.field.as_str().to_string()).into());
            }
        }
        debug!(entity = mutation.entity, field = %mutation.field, "field assigned");
        Ok(())
    }

    // ========================================================================
    // Peer Lifecycle
    // ========================================================================

    fn handle_peer_joined(&mut self, peer: PeerId) -> Result<(), RunnerError> {
        self.callbacks.on_peer_joined(peer);
        if !self.is_server() {
            return Ok(());
        }

        if peer != self.local_peer() {
            self.welcome_peer(peer)?;
        }

        let host = self.host_peer();
        let entity = self.spawner.spawn_for(
            peer,
            host,
            self.scene.as_ref(),
            &mut self.world,
            &mut self.authority,
        )?;
        self.entities.insert(
            entity,
            EntityRecord {
                name: NetworkedField::new(entity, PlayerName::default()),
                phase: EntityPhase::Spawned,
            },
        );

        if let Some(message) = self.spawned_message(entity) {
            self.publish(Body::Spawned(message))?;
        }
        self.entity_ready(entity)
    }

    /// Send the welcome and every existing entity to a new peer.
    fn welcome_peer(&mut self, peer: PeerId) -> Result<(), RunnerError> {
        let welcome = Welcome {
            host_peer_id: self.host_peer(),
            tick: self.world.tick(),
            tick_rate_hz: self.config.tick_rate_hz,
            target_tick_floor: self.target_tick_floor,
            state_digest_algo_id: STATE_DIGEST_ALGO_ID.to_string(),
        };
        self.send_to(peer, Body::Welcome(welcome))?;

        let existing: Vec<EntitySpawned> = self
            .entities
            .keys()
            .filter_map(|&entity| self.spawned_message(entity))
            .collect();
        let count = existing.len();
        for message in existing {
            self.send_to(peer, Body::Spawned(message))?;
        }

        self.welcomed.insert(peer);
        info!(peer, entities = count, tick = self.world.tick(), "peer welcomed");
        Ok(())
    }

    fn handle_peer_left(&mut self, peer: PeerId) -> Result<(), RunnerError> {
        self.callbacks.on_peer_left(peer);
        if !self.is_server() {
            return Ok(());
        }

        self.welcomed.remove(&peer);
        self.input_buffer.remove_peer(peer);

        let outcomes = self
            .spawner
            .on_peer_left(peer, &mut self.world, &mut self.authority);
        for outcome in outcomes {
            match outcome {
                LeaveOutcome::Despawned(entity) => {
                    self.forget_entity(entity);
                    self.publish(Body::Despawned(EntityDespawned { entity_id: entity }))?;
                }
                LeaveOutcome::Retained(entity) => {
                    self.publish(Body::AuthorityChanged(InputAuthorityChanged {
                        entity_id: entity,
                        input_authority: peer_to_wire(None),
                    }))?;
                }
            }
        }
        Ok(())
    }

    /// Local bookkeeping once an entity exists on this peer.
    fn entity_ready(&mut self, entity: EntityId) -> Result<(), RunnerError> {
        let current = self.current_fields(entity);
        self.detector.track(entity, current);

        let is_local = self.authority.is_input_authority(entity);
        if let Some(labels) = self.labels.as_mut() {
            let text = self
                .entities
                .get(&entity)
                .map(|record| record.name.get().to_string())
                .unwrap_or_default();
            labels.set_text(entity, &text);
            labels.set_visible(entity, !is_local);
        }

        self.callbacks
            .on_entity_spawned(entity, self.authority.input_peer(entity));

        if is_local && let Some(token) = self.authority.input_authority(entity) {
            let name = format!("Player_{}", self.local_peer());
            self.request_set_field(&token, FieldKey::PlayerName, &name)?;
        }
        Ok(())
    }

    fn forget_entity(&mut self, entity: EntityId) {
        self.world.despawn(entity);
        self.authority.remove(entity);
        self.entities.remove(&entity);
        self.detector.forget(entity);
        self.despawned.insert(entity);
        if let Some(labels) = self.labels.as_mut() {
            labels.set_visible(entity, false);
        }
        self.callbacks.on_entity_despawned(entity);
    }

    fn teardown(&mut self) {
        self.running = false;
        let ids: Vec<EntityId> = self.entities.keys().copied().collect();
        for entity in ids {
            self.forget_entity(entity);
        }
        self.authority.clear();
        self.detector.clear();
        self.input_buffer.clear();
        self.welcomed.clear();
        self.welcome = None;
    }

    // ========================================================================
    // Messages
    // ========================================================================

    fn handle_message(&mut self, from: PeerId, payload: &[u8]) -> Result<(), RunnerError> {
        let body = match decode_packet(payload) {
            Ok(body) => body,
            Err(err) => {
                self.stats.malformed_packets += 1;
                warn!(peer = from, error = %err, "dropping malformed packet");
                return Ok(());
            }
        };
        trace!(peer = from, kind = body.kind(), "message received");

        if self.is_server() {
            match body {
                Body::Input(cmd) => self.receive_input(from, cmd),
                Body::SetField(request) => self.receive_set_field(from, request)?,
                other => warn!(peer = from, kind = other.kind(), "unexpected message on host"),
            }
            return Ok(());
        }

        if from != self.host_peer() {
            warn!(peer = from, kind = body.kind(), "ignoring message not sent by host");
            return Ok(());
        }
        match body {
            Body::Welcome(welcome) => self.receive_welcome(welcome),
            Body::Spawned(message) => self.receive_spawned(message)?,
            Body::Despawned(message) => {
                if self.entities.contains_key(&message.entity_id) {
                    info!(entity = message.entity_id, "entity despawned");
                    self.forget_entity(message.entity_id);
                }
            }
            Body::AuthorityChanged(message) => self.receive_authority_changed(message),
            Body::Snapshot(snapshot) => self.receive_snapshot(snapshot),
            Body::FieldUpdate(update) => self.receive_field_update(update),
            other => warn!(kind = other.kind(), "unexpected message on replica"),
        }
        Ok(())
    }

    fn receive_input(&mut self, from: PeerId, cmd: InputCmdProto) {
        let authorized = !self.authority.controlled_by(from).is_empty();
        let result = validate_input(
            &cmd,
            from,
            self.world.tick(),
            authorized,
            &self.validation,
            &mut self.input_buffer,
        );

        match result {
            ValidationResult::Accepted => {
                self.stats.inputs_accepted += 1;
            }
            ValidationResult::AcceptedWithClamp => {
                self.stats.inputs_accepted += 1;
                debug!(peer = from, tick = cmd.tick, "input axes clamped");
            }
            dropped => {
                self.stats.inputs_dropped += 1;
                warn!(peer = from, tick = cmd.tick, reason = dropped.reason(), "input dropped");
            }
        }
    }

    fn receive_set_field(
        &mut self,
        from: PeerId,
        request: SetFieldRequest,
    ) -> Result<(), RunnerError> {
        match rpc::authorize(request, from, &self.authority) {
            Ok(mutation) => self.apply_mutation(mutation),
            Err(err) => {
                self.stats.rpcs_rejected += 1;
                warn!(peer = from, error = %err, "set-field request rejected");
                self.callbacks.on_rpc_rejected(from, &err);
                Ok(())
            }
        }
    }

    fn receive_welcome(&mut self, welcome: Welcome) {
        if welcome.state_digest_algo_id != STATE_DIGEST_ALGO_ID {
            warn!(
                remote = %welcome.state_digest_algo_id,
                local = STATE_DIGEST_ALGO_ID,
                "state digest algorithm differs from host; desync checks unreliable"
            );
        }
        if welcome.tick_rate_hz != self.config.tick_rate_hz {
            warn!(
                remote = welcome.tick_rate_hz,
                local = self.config.tick_rate_hz,
                "tick rate differs from host"
            );
        }
        info!(
            host = welcome.host_peer_id,
            tick = welcome.tick,
            floor = welcome.target_tick_floor,
            "welcomed by host"
        );
        self.targeting = TickTargeting::new(welcome.target_tick_floor);
        self.welcome = Some(welcome);
    }

    fn receive_spawned(&mut self, message: EntitySpawned) -> Result<(), RunnerError> {
        let entity = message.entity_id;
        if self.entities.contains_key(&entity) {
            debug!(entity, "spawn for known entity ignored");
            return Ok(());
        }

        let transform: Transform = match message.transform.unwrap_or_default().try_into() {
            Ok(transform) => transform,
            Err(err) => {
                self.stats.malformed_packets += 1;
                warn!(entity, error = %err, "dropping malformed spawn");
                return Ok(());
            }
        };
        let input = peer_from_wire(message.input_authority);
        let name = message
            .fields
            .iter()
            .find(|field| field.field_name == FieldKey::PlayerName.as_str())
            .map(|field| PlayerName::new(&field.value))
            .unwrap_or_default();

        self.world.insert_avatar(entity, input, transform);
        self.authority.assign(
            entity,
            Roles {
                state: message.state_authority,
                input,
            },
        );
        self.despawned.remove(&entity);
        self.entities.insert(
            entity,
            EntityRecord {
                name: NetworkedField::new(entity, name),
                phase: EntityPhase::Spawned,
            },
        );
        info!(entity, input = ?input, "entity replicated");

        self.entity_ready(entity)
    }

    fn receive_authority_changed(&mut self, message: InputAuthorityChanged) {
        let entity = message.entity_id;
        let input = peer_from_wire(message.input_authority);
        if self.authority.set_input_authority(entity, input).is_err() {
            debug!(entity, "authority change for unknown entity ignored");
            return;
        }
        self.world.set_controller(entity, input);
        info!(entity, input = ?input, "input authority changed");
    }

    fn receive_snapshot(&mut self, proto: SnapshotProto) {
        self.targeting.observe_floor(proto.target_tick_floor);

        let snapshot: Snapshot = match proto.try_into() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.stats.malformed_packets += 1;
                warn!(error = %err, "dropping malformed snapshot");
                return;
            }
        };

        let in_sync = self.world.apply_snapshot(&snapshot);
        trace!(tick = snapshot.tick, "snapshot applied");
        // Digests only compare once the mirror holds every entity.
        if !in_sync && self.world.entity_count() == snapshot.entities.len() {
            self.stats.desyncs += 1;
            warn!(
                tick = snapshot.tick,
                remote = snapshot.digest,
                local = self.world.state_digest(),
                "state digest mismatch"
            );
        }
    }

    fn receive_field_update(&mut self, update: FieldUpdate) {
        let Some(field) = update.field else {
            self.stats.malformed_packets += 1;
            warn!(entity = update.entity_id, "field update without a field");
            return;
        };
        let Some(record) = self.entities.get_mut(&update.entity_id) else {
            debug!(entity = update.entity_id, "field update for unknown entity ignored");
            return;
        };
        match FieldKey::parse(&field.field_name) {
            Some(FieldKey::PlayerName) => {
                record.name.apply_replicated(PlayerName::new(&field.value));
                trace!(entity = update.entity_id, tick = update.tick, "name replicated");
            }
            _ => warn!(field = %field.field_name, "unknown replicated field"),
        }
    }

    // ========================================================================
    // Tick
    // ========================================================================

    fn step_authority(&mut self) -> Result<(), RunnerError> {
        let current_tick = self.world.tick();
        let local = self.local_peer();

        // The host's own input never travels, so it is always on time.
        if self.config.provide_input && self.authority.local_entity().is_some() {
            let device = self.input_source.sample();
            self.input_buffer.try_buffer(
                local,
                InputSnapshot {
                    tick: current_tick,
                    move_axis: device.move_axis,
                    action: device.action,
                },
            );
        }

        let controlled: Vec<(EntityId, PeerId)> = self
            .authority
            .entities()
            .filter_map(|entity| self.authority.input_peer(entity).map(|peer| (entity, peer)))
            .collect();

        let mut step_inputs = Vec::with_capacity(controlled.len());
        for (entity, peer) in controlled {
            let Some(input) = self.input_buffer.take_input(peer, current_tick) else {
                self.stats.inputs_missing += 1;
                trace!(peer, tick = current_tick, "no input for tick");
                self.callbacks.on_input_missing(peer, current_tick);
                continue;
            };

            if let Some(record) = self.entities.get_mut(&entity)
                && record.phase == EntityPhase::Spawned
            {
                record.phase = EntityPhase::Simulating;
                info!(entity, peer, tick = current_tick, "entity simulating");
            }
            step_inputs.push(StepInput {
                peer_id: peer,
                move_axis: input.move_axis,
                action: input.action,
            });
        }
        step_inputs.sort_by_key(|input| input.peer_id);

        let snapshot = self.world.advance(current_tick, &step_inputs);

        // Floor = post-step tick + lead
        self.target_tick_floor = self.world.tick() + self.config.input_lead_ticks;
        self.input_buffer.evict_before(self.world.tick());

        self.publish(Body::Snapshot(SnapshotProto::from_snapshot(
            snapshot,
            self.target_tick_floor,
        )))?;
        self.flush_fields()
    }

    /// Publish every field assigned since the last tick.
    fn flush_fields(&mut self) -> Result<(), RunnerError> {
        let tick = self.world.tick();
        let mut updates = Vec::new();
        for (&entity, record) in &mut self.entities {
            if record.name.take_dirty() {
                updates.push(FieldUpdate {
                    entity_id: entity,
                    tick,
                    field: Some(FieldValueProto {
                        field_name: FieldKey::PlayerName.as_str().to_string(),
                        value: record.name.get().to_string(),
                    }),
                });
            }
        }
        for update in updates {
            self.publish(Body::FieldUpdate(update))?;
        }
        Ok(())
    }

    fn send_local_input(&mut self) -> Result<(), RunnerError> {
        if !self.config.provide_input
            || self.welcome.is_none()
            || self.authority.local_entity().is_none()
        {
            return Ok(());
        }

        let device = self.input_source.sample();
        let cmd = InputCmdProto {
            tick: self.targeting.next_tick(),
            move_axis: device.move_axis.to_vec(),
            action: device.action,
        };
        trace!(tick = cmd.tick, "sending input");
        self.session
            .send(self.session.host_peer(), encode_packet(Body::Input(cmd)))?;
        Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn current_fields(&self, entity: EntityId) -> Vec<(FieldKey, FieldValue)> {
        let mut fields = Vec::with_capacity(FieldKey::ALL.len());
        if let Some(record) = self.entities.get(&entity) {
            fields.push((
                FieldKey::PlayerName,
                FieldValue::Text(record.name.get().clone()),
            ));
        }
        if let Some(transform) = self.world.transform(entity) {
            fields.push((FieldKey::Transform, FieldValue::Transform(transform)));
        }
        fields
    }

    fn spawned_message(&self, entity: EntityId) -> Option<EntitySpawned> {
        let roles = self.authority.roles(entity)?;
        let transform = self.world.transform(entity)?;
        let record = self.entities.get(&entity)?;
        Some(EntitySpawned {
            entity_id: entity,
            state_authority: roles.state,
            input_authority: peer_to_wire(roles.input),
            transform: Some(transform.into()),
            fields: vec![FieldValueProto {
                field_name: FieldKey::PlayerName.as_str().to_string(),
                value: record.name.get().to_string(),
            }],
        })
    }

    fn send_to(&self, peer: PeerId, body: Body) -> Result<(), TransportError> {
        let kind = body.kind();
        match self.session.send(peer, encode_packet(body)) {
            Err(TransportError::UnknownPeer(_)) => {
                debug!(peer, kind, "peer gone before delivery");
                Ok(())
            }
            other => other,
        }
    }

    /// Send to every welcomed peer.
    fn publish(&self, body: Body) -> Result<(), TransportError> {
        let kind = body.kind();
        let bytes = encode_packet(body);
        for &peer in &self.welcomed {
            match self.session.send(peer, bytes.clone()) {
                Ok(()) => {}
                Err(TransportError::UnknownPeer(_)) => {
                    debug!(peer, kind, "peer gone before delivery");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn scene() -> Box<dyn SceneLocator> {
        Box::new(StaticScene::new().with_tag(DEFAULT_SPAWN_TAG, Transform::at([0.0, 1.0, 0.0])))
    }

    fn config(mode: GameMode) -> RunnerConfig {
        RunnerConfig {
            mode,
            ..Default::default()
        }
    }

    async fn host(network: &LoopbackNetwork) -> Runner {
        Runner::start(network, config(GameMode::Host), scene())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_host_spawns_own_entity() {
        let network = LoopbackNetwork::new();
        let mut runner = host(&network).await;

        runner.poll().unwrap();

        let entity = runner.local_entity().unwrap();
        assert!(runner.authority().is_state_authority(entity));
        assert!(runner.authority().is_input_authority(entity));
        assert_eq!(runner.phase(entity), Some(EntityPhase::Spawned));
        assert_eq!(runner.transform(entity).unwrap().position, [0.0, 1.0, 0.0]);
    }

    #[tokio::test]
    async fn test_tick_floor_relationship() {
        let network = LoopbackNetwork::new();
        let mut runner = host(&network).await;
        runner.poll().unwrap();

        assert_eq!(runner.target_tick_floor(), INPUT_LEAD_TICKS);

        runner.fixed_update().unwrap();
        assert_eq!(runner.current_tick(), 1);
        assert_eq!(runner.target_tick_floor(), 1 + INPUT_LEAD_TICKS);

        runner.fixed_update().unwrap();
        assert_eq!(runner.current_tick(), 2);
        assert_eq!(runner.target_tick_floor(), 2 + INPUT_LEAD_TICKS);
    }

    #[tokio::test]
    async fn test_host_name_applied_locally() {
        let network = LoopbackNetwork::new();
        let mut runner = host(&network).await;
        runner.poll().unwrap();
        let entity = runner.local_entity().unwrap();

        assert_eq!(runner.player_name(entity).unwrap().as_str(), "Player_1");

        let changes = runner.render();
        assert!(changes.contains(&FieldChange {
            entity,
            field: FieldKey::PlayerName
        }));
        assert!(runner.render().is_empty());
    }

    #[tokio::test]
    async fn test_host_input_moves_entity() {
        let network = LoopbackNetwork::new();
        let input = SharedInput::new();
        let mut runner = host(&network).await.with_input(input.clone());
        runner.poll().unwrap();
        let entity = runner.local_entity().unwrap();

        input.set([0.0, 1.0], false);
        runner.fixed_update().unwrap();

        let position = runner.transform(entity).unwrap().position;
        assert_eq!(position, [0.0, 1.0, pilot_sim::MOVE_SPEED]);
        assert_eq!(runner.phase(entity), Some(EntityPhase::Simulating));
    }

    #[tokio::test]
    async fn test_missing_input_holds_position() {
        let network = LoopbackNetwork::new();
        let mut runner = Runner::start(
            &network,
            RunnerConfig {
                mode: GameMode::Host,
                provide_input: false,
                ..Default::default()
            },
            scene(),
        )
        .await
        .unwrap();
        runner.poll().unwrap();
        let entity = runner.local_entity().unwrap();

        assert_eq!(runner.try_get_input(runner.local_peer()), None);
        runner.fixed_update().unwrap();

        assert_eq!(runner.transform(entity).unwrap().position, [0.0, 1.0, 0.0]);
        assert_eq!(runner.stats().inputs_missing, 1);
        assert_eq!(runner.phase(entity), Some(EntityPhase::Spawned));
    }

    #[tokio::test]
    async fn test_dedicated_server_spawns_nothing_for_itself() {
        let network = LoopbackNetwork::new();
        let mut runner = Runner::start(&network, config(GameMode::Server), scene())
            .await
            .unwrap();

        runner.poll().unwrap();
        runner.fixed_update().unwrap();

        assert!(runner.entities().is_empty());
        assert!(runner.is_server());
    }

    #[tokio::test]
    async fn test_missing_spawn_point_is_fatal() {
        let network = LoopbackNetwork::new();
        let mut runner = Runner::start(
            &network,
            config(GameMode::Host),
            Box::new(StaticScene::new()),
        )
        .await
        .unwrap();

        let result = runner.poll();

        assert!(matches!(
            result,
            Err(RunnerError::Spawn(SpawnError::MissingSpawnPoint(_)))
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_before_connecting() {
        let network = LoopbackNetwork::new();
        let bad = RunnerConfig {
            tick_rate_hz: 0,
            ..Default::default()
        };

        let result = Runner::start(&network, bad, scene()).await;

        assert!(matches!(result, Err(RunnerError::Config(_))));
        assert!(!network.has_session(DEFAULT_SESSION_NAME));
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_everything() {
        let network = LoopbackNetwork::new();
        let mut runner = host(&network).await;
        runner.poll().unwrap();
        let entity = runner.local_entity().unwrap();

        runner.shutdown();

        assert!(!runner.is_running());
        assert!(runner.entities().is_empty());
        assert!(runner.authority().is_empty());
        assert_eq!(runner.phase(entity), Some(EntityPhase::Despawned));
        assert!(!network.has_session(DEFAULT_SESSION_NAME));

        // Idempotent.
        runner.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_advances_world() {
        let network = LoopbackNetwork::new();
        let mut runner = host(&network).await;

        runner.run_ticks(5).await.unwrap();

        assert_eq!(runner.current_tick(), 5);
    }

    #[tokio::test]
    async fn test_set_player_name_requires_matching_token() {
        let network = LoopbackNetwork::new();
        let mut runner = host(&network).await;
        runner.poll().unwrap();
        let entity = runner.local_entity().unwrap();
        let token = runner.state_authority(entity).unwrap();

        assert!(runner.set_player_name(&token, "Renamed").unwrap());
        assert_eq!(runner.player_name(entity).unwrap().as_str(), "Renamed");
        assert!(!runner.set_player_name(&token, "Renamed").unwrap());
    }
}
