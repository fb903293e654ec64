//! Authority model.
//!
//! Every replicated entity has exactly one state authority (the peer that
//! owns the canonical field values and runs the simulation step) and at most
//! one input authority (the peer whose device input drives it). The map is a
//! pure local lookup; it never talks to the network.
//!
//! Mutating entry points take a capability token instead of checking which
//! code path they were reached from. Tokens are only minted here, and only for
//! the local peer when it actually holds the role.

use std::collections::BTreeMap;

use pilot_sim::{EntityId, PeerId};

use crate::error::AuthorityError;

/// Roles of one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roles {
    pub state: PeerId,
    pub input: Option<PeerId>,
}

/// Proof that the local peer holds state authority over an entity.
#[derive(Debug, PartialEq, Eq)]
pub struct StateAuthority {
    entity: EntityId,
}

impl StateAuthority {
    pub fn entity(&self) -> EntityId {
        self.entity
    }
}

/// Proof that the local peer holds input authority over an entity.
#[derive(Debug, PartialEq, Eq)]
pub struct InputAuthority {
    entity: EntityId,
    peer: PeerId,
}

impl InputAuthority {
    pub fn entity(&self) -> EntityId {
        self.entity
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }
}

/// Role assignments of every entity known to the local peer.
#[derive(Debug)]
pub struct AuthorityMap {
    local: PeerId,
    roles: BTreeMap<EntityId, Roles>,
}

impl AuthorityMap {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            roles: BTreeMap::new(),
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.local
    }

    /// Record the roles of a spawned entity, replacing any previous entry.
    pub fn assign(&mut self, entity: EntityId, roles: Roles) {
        self.roles.insert(entity, roles);
    }

    pub fn remove(&mut self, entity: EntityId) -> Option<Roles> {
        self.roles.remove(&entity)
    }

    /// Drop every assignment (session shutdown).
    pub fn clear(&mut self) {
        self.roles.clear();
    }

    pub fn roles(&self, entity: EntityId) -> Option<Roles> {
        self.roles.get(&entity).copied()
    }

    pub fn contains(&self, entity: EntityId) -> bool {
        self.roles.contains_key(&entity)
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    pub fn is_state_authority(&self, entity: EntityId) -> bool {
        self.roles
            .get(&entity)
            .is_some_and(|roles| roles.state == self.local)
    }

    pub fn is_input_authority(&self, entity: EntityId) -> bool {
        self.input_peer(entity) == Some(self.local)
    }

    /// Peer holding input authority over `entity`, if any.
    pub fn input_peer(&self, entity: EntityId) -> Option<PeerId> {
        self.roles.get(&entity).and_then(|roles| roles.input)
    }

    /// Reassign or revoke input authority.
    pub fn set_input_authority(
        &mut self,
        entity: EntityId,
        peer: Option<PeerId>,
    ) -> Result<(), AuthorityError> {
        let roles = self
            .roles
            .get_mut(&entity)
            .ok_or(AuthorityError::UnknownEntity(entity))?;
        roles.input = peer;
        Ok(())
    }

    /// Entities whose input authority is `peer`, in id order.
    pub fn controlled_by(&self, peer: PeerId) -> Vec<EntityId> {
        self.roles
            .iter()
            .filter(|(_, roles)| roles.input == Some(peer))
            .map(|(&entity, _)| entity)
            .collect()
    }

    /// Clear `peer`'s input authority everywhere. Returns the affected
    /// entities in id order.
    pub fn revoke_input(&mut self, peer: PeerId) -> Vec<EntityId> {
        self.roles
            .iter_mut()
            .filter(|(_, roles)| roles.input == Some(peer))
            .map(|(&entity, roles)| {
                roles.input = None;
                entity
            })
            .collect()
    }

    /// First entity the local peer controls.
    pub fn local_entity(&self) -> Option<EntityId> {
        self.roles
            .iter()
            .find(|(_, roles)| roles.input == Some(self.local))
            .map(|(&entity, _)| entity)
    }

    pub fn entities(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.roles.keys().copied()
    }

    // ========================================================================
    // Capabilities
    // ========================================================================

    pub fn state_authority(&self, entity: EntityId) -> Option<StateAuthority> {
        self.is_state_authority(entity)
            .then_some(StateAuthority { entity })
    }

    pub fn input_authority(&self, entity: EntityId) -> Option<InputAuthority> {
        self.is_input_authority(entity).then_some(InputAuthority {
            entity,
            peer: self.local,
        })
    }

    /// Check a state token against `target` and the current assignment.
    pub fn verify_state(
        &self,
        token: &StateAuthority,
        target: EntityId,
    ) -> Result<(), AuthorityError> {
        if token.entity != target {
            return Err(AuthorityError::TokenMismatch {
                token: token.entity,
                target,
            });
        }
        if !self.contains(target) {
            return Err(AuthorityError::UnknownEntity(target));
        }
        if !self.is_state_authority(target) {
            return Err(AuthorityError::RoleNotHeld {
                role: "state authority",
                entity: target,
            });
        }
        Ok(())
    }

    /// Check that an input token is still backed by the current assignment.
    ///
    /// Tokens outlive revocation, so this is re-checked on every use.
    pub fn verify_input(&self, token: &InputAuthority) -> Result<(), AuthorityError> {
        let entity = token.entity;
        if !self.contains(entity) {
            return Err(AuthorityError::UnknownEntity(entity));
        }
        if self.input_peer(entity) != Some(token.peer) || token.peer != self.local {
            return Err(AuthorityError::RoleNotHeld {
                role: "input authority",
                entity,
            });
        }
        Ok(())
    }
}
