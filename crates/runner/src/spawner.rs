//! Entity spawner.
//!
//! Runs on the state authority only. A joining peer gets one avatar at the
//! scene's tagged spawn point, with input authority bound to that peer. When
//! the peer leaves, the configured [`DespawnPolicy`] decides what happens to
//! its avatar.

use std::collections::HashMap;

use pilot_sim::{EntityId, PeerId, Transform, World};
use tracing::info;

use crate::authority::{AuthorityMap, Roles};
use crate::config::DespawnPolicy;
use crate::error::SpawnError;

/// The engine's scene, queried for tagged objects.
pub trait SceneLocator {
    fn find_transform_by_tag(&self, tag: &str) -> Option<Transform>;
}

/// Scene made of a fixed set of tagged transforms.
#[derive(Debug, Clone, Default)]
pub struct StaticScene {
    tagged: HashMap<String, Transform>,
}

impl StaticScene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tag(mut self, tag: &str, transform: Transform) -> Self {
        self.tagged.insert(tag.to_string(), transform);
        self
    }
}

impl SceneLocator for StaticScene {
    fn find_transform_by_tag(&self, tag: &str) -> Option<Transform> {
        self.tagged.get(tag).copied()
    }
}

/// What happened to an entity whose input authority left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    Despawned(EntityId),
    /// Kept in the world with input authority revoked.
    Retained(EntityId),
}

#[derive(Debug, Clone)]
pub struct EntitySpawner {
    spawn_tag: String,
    policy: DespawnPolicy,
}

impl EntitySpawner {
    pub fn new(spawn_tag: &str, policy: DespawnPolicy) -> Self {
        Self {
            spawn_tag: spawn_tag.to_string(),
            policy,
        }
    }

    pub fn policy(&self) -> DespawnPolicy {
        self.policy
    }

    /// Look up the spawn point. Its absence is a fatal scene fault.
    pub fn spawn_point(&self, scene: &dyn SceneLocator) -> Result<Transform, SpawnError> {
        scene
            .find_transform_by_tag(&self.spawn_tag)
            .ok_or_else(|| SpawnError::MissingSpawnPoint(self.spawn_tag.clone()))
    }

    /// Spawn an avatar for `peer`, held by the local peer as state authority.
    pub fn spawn_for(
        &self,
        peer: PeerId,
        host: PeerId,
        scene: &dyn SceneLocator,
        world: &mut World,
        authority: &mut AuthorityMap,
    ) -> Result<EntityId, SpawnError> {
        let local = authority.local_peer();
        if local != host {
            return Err(SpawnError::NotStateAuthority(local));
        }

        let spawn = self.spawn_point(scene)?;
        let entity = world.spawn_avatar(Some(peer), spawn);
        authority.assign(
            entity,
            Roles {
                state: local,
                input: Some(peer),
            },
        );

        info!(entity, peer, position = ?spawn.position, "entity spawned");
        Ok(entity)
    }

    /// Apply the despawn policy to every entity `peer` controlled.
    pub fn on_peer_left(
        &self,
        peer: PeerId,
        world: &mut World,
        authority: &mut AuthorityMap,
    ) -> Vec<LeaveOutcome> {
        match self.policy {
            DespawnPolicy::Despawn => authority
                .controlled_by(peer)
                .into_iter()
                .map(|entity| {
                    world.despawn(entity);
                    authority.remove(entity);
                    info!(entity, peer, "entity despawned");
                    LeaveOutcome::Despawned(entity)
                })
                .collect(),
            DespawnPolicy::Retain => authority
                .revoke_input(peer)
                .into_iter()
                .map(|entity| {
                    world.set_controller(entity, None);
                    info!(entity, peer, "entity retained without input authority");
                    LeaveOutcome::Retained(entity)
                })
                .collect(),
        }
    }
}
