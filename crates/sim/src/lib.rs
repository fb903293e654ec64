//! Pilot Simulation Core
//!
//! This crate contains the deterministic, fixed-timestep movement simulation
//! run by the state authority. It owns the canonical transform of every
//! replicated entity on the authority and a mirror of those transforms on
//! every other peer.
//!
//! # Constraints
//!
//! The simulation MUST NOT:
//! - Perform I/O operations (file, network, etc.)
//! - Read wall-clock time
//! - Depend on frame rate or variable delta time
//!
//! Everything that crosses a peer boundary is carried by `pilot-wire`
//! messages owned by the runner.

#![deny(unsafe_code)]

// ============================================================================
// Type Aliases
// ============================================================================

/// A single discrete simulation timestep.
pub type Tick = u64;

/// Opaque handle of a connected participant, assigned by the session.
///
/// Never assume ids are contiguous or start at a particular value; they are
/// only used as stable lookup and ordering keys.
pub type PeerId = u32;

/// Network-wide unique identifier of a replicated entity.
pub type EntityId = u64;

// ============================================================================
// Core Types
// ============================================================================

/// Position and heading of an entity.
///
/// Movement happens on the horizontal X/Z plane, so orientation is a single
/// heading (yaw, radians) about the vertical axis. Yaw 0 faces +Z.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Transform {
    pub position: [f64; 3],
    pub yaw: f64,
}

impl Transform {
    pub fn at(position: [f64; 3]) -> Self {
        Self { position, yaw: 0.0 }
    }
}

/// Simulation-plane input consumed by `advance()`.
///
/// `peer_id` is the input authority of the entity the intent applies to.
/// Values passed to `advance()` MUST be sorted by `peer_id` ascending.
#[derive(Debug, Clone, PartialEq)]
pub struct StepInput {
    pub peer_id: PeerId,
    /// Movement axes, each within [-1, 1].
    pub move_axis: [f64; 2],
    /// Discrete trigger (jump/action button) for this tick.
    pub action: bool,
}

/// Snapshot of a single entity's transform.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySnapshot {
    pub entity_id: EntityId,
    pub transform: Transform,
}

/// Post-step world state.
///
/// After `world.advance(T, inputs)`, the returned snapshot has `tick = T+1`.
/// Entities are sorted by `entity_id` ascending.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub tick: Tick,
    pub entities: Vec<EntitySnapshot>,
    pub digest: u64,
}

/// Tuning of the movement model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovementParams {
    /// Displacement per tick at full stick deflection.
    pub speed: f64,
    /// Heading catch-up rate; `rotation_speed * dt` is the slerp fraction per tick.
    pub rotation_speed: f64,
    /// Entities leaving the square `[-e, e]²` are returned to their spawn point.
    pub arena_half_extent: Option<f64>,
}

impl Default for MovementParams {
    fn default() -> Self {
        Self {
            speed: MOVE_SPEED,
            rotation_speed: ROTATION_SPEED,
            arena_half_extent: None,
        }
    }
}

// ============================================================================
// Movement Model Constants
// ============================================================================

/// Default displacement per tick at full stick deflection.
pub const MOVE_SPEED: f64 = 5.0;

/// Default heading catch-up rate.
pub const ROTATION_SPEED: f64 = 10.0;

/// Squared length of the per-tick displacement at or below which the heading
/// is held instead of turning toward the movement direction.
pub const ROTATION_DEADZONE_SQ: f64 = 0.001;

/// Direction vectors shorter than this normalize to zero.
const NORMALIZE_EPSILON: f64 = 1e-5;

// ============================================================================
// StateDigest Implementation
// ============================================================================

/// StateDigest algorithm identifier.
pub const STATE_DIGEST_ALGO_ID: &str = "statedigest-v0-fnv1a64-le-f64canon-eidasc-posyaw";

/// FNV-1a 64-bit offset basis.
const FNV1A_OFFSET_BASIS: u64 = 0xcbf29ce484222325;

/// FNV-1a 64-bit prime.
const FNV1A_PRIME: u64 = 0x100000001b3;

#[derive(Debug, Clone)]
struct Fnv1a64 {
    state: u64,
}

impl Fnv1a64 {
    fn new() -> Self {
        Self {
            state: FNV1A_OFFSET_BASIS,
        }
    }

    fn update(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state ^= u64::from(byte);
            self.state = self.state.wrapping_mul(FNV1A_PRIME);
        }
    }

    fn update_f64(&mut self, value: f64) {
        self.update(&canonicalize_f64(value).to_le_bytes());
    }

    fn finish(self) -> u64 {
        self.state
    }
}

/// Canonicalize an f64 value for deterministic hashing.
///
/// - `-0.0` → `+0.0`
/// - Any NaN → quiet NaN bit pattern `0x7ff8000000000000`
fn canonicalize_f64(value: f64) -> u64 {
    const QUIET_NAN_BITS: u64 = 0x7ff8000000000000;

    if value.is_nan() {
        QUIET_NAN_BITS
    } else if value == 0.0 {
        0u64
    } else {
        value.to_bits()
    }
}

// ============================================================================
// Internal Entity Types
// ============================================================================

#[derive(Debug, Clone)]
struct Avatar {
    entity_id: EntityId,
    /// Input authority; `None` once control has been revoked.
    controller: Option<PeerId>,
    transform: Transform,
    spawn: Transform,
    last_action_tick: Option<Tick>,
}

impl Avatar {
    fn to_snapshot(&self) -> EntitySnapshot {
        EntitySnapshot {
            entity_id: self.entity_id,
            transform: self.transform,
        }
    }
}

// ============================================================================
// World Implementation
// ============================================================================

/// The simulation state container.
///
/// On the state authority this is the source of truth and advances each tick.
/// On other peers it is a mirror updated with [`World::apply_snapshot`].
#[derive(Debug, Clone)]
pub struct World {
    tick: Tick,
    tick_rate_hz: u32,
    dt_seconds: f64,
    params: MovementParams,
    /// Kept sorted by entity_id for deterministic iteration.
    avatars: Vec<Avatar>,
    next_entity_id: EntityId,
}

impl World {
    /// Create a new World at tick 0.
    pub fn new(tick_rate_hz: u32, params: MovementParams) -> Self {
        assert!(tick_rate_hz > 0, "tick_rate_hz must be positive");

        Self {
            tick: 0,
            tick_rate_hz,
            dt_seconds: 1.0 / f64::from(tick_rate_hz),
            params,
            avatars: Vec::new(),
            next_entity_id: 1, // 0 is never a valid entity id on the wire
        }
    }

    /// Spawn an avatar controlled by `controller` at `spawn`.
    ///
    /// EntityId assignment is deterministic based on spawn order.
    pub fn spawn_avatar(&mut self, controller: Option<PeerId>, spawn: Transform) -> EntityId {
        let entity_id = self.next_entity_id;
        self.next_entity_id = self.next_entity_id.saturating_add(1);
        self.insert_avatar(entity_id, controller, spawn);
        entity_id
    }

    /// Insert an avatar under an id chosen elsewhere (replica mirrors).
    ///
    /// Returns false if the id is already present.
    pub fn insert_avatar(
        &mut self,
        entity_id: EntityId,
        controller: Option<PeerId>,
        transform: Transform,
    ) -> bool {
        if self.contains(entity_id) {
            return false;
        }
        self.avatars.push(Avatar {
            entity_id,
            controller,
            transform,
            spawn: transform,
            last_action_tick: None,
        });
        self.avatars.sort_by_key(|a| a.entity_id);
        self.next_entity_id = self.next_entity_id.max(entity_id.saturating_add(1));
        true
    }

    /// Remove an avatar. Returns false if it did not exist.
    pub fn despawn(&mut self, entity_id: EntityId) -> bool {
        let before = self.avatars.len();
        self.avatars.retain(|a| a.entity_id != entity_id);
        before != self.avatars.len()
    }

    pub fn contains(&self, entity_id: EntityId) -> bool {
        self.avatar(entity_id).is_some()
    }

    pub fn transform(&self, entity_id: EntityId) -> Option<Transform> {
        self.avatar(entity_id).map(|a| a.transform)
    }

    pub fn spawn_transform(&self, entity_id: EntityId) -> Option<Transform> {
        self.avatar(entity_id).map(|a| a.spawn)
    }

    pub fn last_action_tick(&self, entity_id: EntityId) -> Option<Tick> {
        self.avatar(entity_id).and_then(|a| a.last_action_tick)
    }

    /// Change (or clear) the controlling peer of an avatar.
    pub fn set_controller(&mut self, entity_id: EntityId, controller: Option<PeerId>) -> bool {
        match self.avatar_mut(entity_id) {
            Some(avatar) => {
                avatar.controller = controller;
                true
            }
            None => false,
        }
    }

    /// Get the current simulation tick.
    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn tick_rate_hz(&self) -> u32 {
        self.tick_rate_hz
    }

    pub fn params(&self) -> &MovementParams {
        &self.params
    }

    pub fn entity_count(&self) -> usize {
        self.avatars.len()
    }

    /// Current state of the world as a snapshot at `self.tick()`.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            tick: self.tick,
            entities: self.avatars.iter().map(Avatar::to_snapshot).collect(),
            digest: self.state_digest(),
        }
    }

    /// Advance simulation from tick T to T+1.
    ///
    /// # Arguments
    /// * `tick` - The pre-step tick (MUST equal self.tick())
    /// * `step_inputs` - Inputs sorted by peer_id ascending
    ///
    /// # Panics
    /// If `tick != self.tick()` (precondition violation)
    pub fn advance(&mut self, tick: Tick, step_inputs: &[StepInput]) -> Snapshot {
        assert_eq!(
            tick, self.tick,
            "advance() tick mismatch: expected {}, got {}",
            self.tick, tick
        );

        debug_assert!(
            step_inputs
                .windows(2)
                .all(|w| w[0].peer_id <= w[1].peer_id),
            "step_inputs must be sorted by peer_id ascending"
        );

        for input in step_inputs {
            self.apply_movement(tick, input);
        }

        self.tick += 1;
        self.snapshot()
    }

    /// Overwrite mirrored transforms with an authoritative snapshot.
    ///
    /// Entities unknown to this mirror are skipped (their spawn message has
    /// not arrived yet). Returns true if the resulting digest matches.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> bool {
        for entity in &snapshot.entities {
            if let Some(avatar) = self.avatar_mut(entity.entity_id) {
                avatar.transform = entity.transform;
            }
        }
        self.tick = snapshot.tick;
        self.state_digest() == snapshot.digest
    }

    /// Compute the StateDigest for the current world state.
    ///
    /// Algorithm: FNV-1a 64-bit over the tick, then for every entity in
    /// EntityId ascending order its id, position and yaw (f64 canonicalized,
    /// little-endian).
    pub fn state_digest(&self) -> u64 {
        let mut hasher = Fnv1a64::new();

        hasher.update(&self.tick.to_le_bytes());

        for avatar in &self.avatars {
            hasher.update(&avatar.entity_id.to_le_bytes());
            for axis in avatar.transform.position {
                hasher.update_f64(axis);
            }
            hasher.update_f64(avatar.transform.yaw);
        }

        hasher.finish()
    }

    // ========================================================================
    // Internal Methods
    // ========================================================================

    fn avatar(&self, entity_id: EntityId) -> Option<&Avatar> {
        self.avatars
            .binary_search_by_key(&entity_id, |a| a.entity_id)
            .ok()
            .map(|idx| &self.avatars[idx])
    }

    fn avatar_mut(&mut self, entity_id: EntityId) -> Option<&mut Avatar> {
        self.avatars
            .binary_search_by_key(&entity_id, |a| a.entity_id)
            .ok()
            .map(|idx| &mut self.avatars[idx])
    }

    fn apply_movement(&mut self, tick: Tick, input: &StepInput) {
        let dt = self.dt_seconds;
        let params = self.params;

        let Some(avatar) = self
            .avatars
            .iter_mut()
            .find(|a| a.controller == Some(input.peer_id))
        else {
            return;
        };

        if input.action {
            avatar.last_action_tick = Some(tick);
        }

        let dir = normalize([input.move_axis[0], 0.0, input.move_axis[1]]);
        let displacement = [
            dir[0] * params.speed,
            dir[1] * params.speed,
            dir[2] * params.speed,
        ];

        for (axis, delta) in avatar.transform.position.iter_mut().zip(displacement) {
            *axis += delta;
        }

        let moved_sq = displacement.iter().map(|d| d * d).sum::<f64>();
        if moved_sq > ROTATION_DEADZONE_SQ {
            let target = displacement[0].atan2(displacement[2]);
            let t = (params.rotation_speed * dt).clamp(0.0, 1.0);
            avatar.transform.yaw = slerp_yaw(avatar.transform.yaw, target, t);
        }

        if let Some(extent) = params.arena_half_extent {
            let [x, _, z] = avatar.transform.position;
            if x.abs() > extent || z.abs() > extent {
                avatar.transform.position = avatar.spawn.position;
            }
        }
    }
}

/// Normalize a vector, mapping near-zero vectors to zero.
fn normalize(v: [f64; 3]) -> [f64; 3] {
    let magnitude = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
    if magnitude > NORMALIZE_EPSILON {
        [v[0] / magnitude, v[1] / magnitude, v[2] / magnitude]
    } else {
        [0.0, 0.0, 0.0]
    }
}

/// Turn `from` toward `to` by fraction `t` along the shortest arc.
fn slerp_yaw(from: f64, to: f64, t: f64) -> f64 {
    use std::f64::consts::{PI, TAU};

    let delta = (to - from + PI).rem_euclid(TAU) - PI;
    let yaw = from + delta * t;
    (yaw + PI).rem_euclid(TAU) - PI
}

// ============================================================================
// Tests
// ============================================================================
