//! Networked fields.
//!
//! The authoritative copy of a field lives on the state authority and can
//! only be assigned with a [`StateAuthority`] token. Every other peer holds a
//! replica that is only written by incoming field updates.

use std::fmt;

use pilot_sim::{EntityId, Transform};

use crate::authority::StateAuthority;
use crate::error::AuthorityError;

/// Longest player name kept, in characters.
pub const MAX_PLAYER_NAME_CHARS: usize = 32;

/// Display name of a player, at most [`MAX_PLAYER_NAME_CHARS`] characters.
#[derive(Debug, Clone, PartialEq, Eq, Default, Hash)]
pub struct PlayerName(String);

impl PlayerName {
    /// Build a name, truncating on a character boundary if too long.
    pub fn new(text: &str) -> Self {
        let text = match text.char_indices().nth(MAX_PLAYER_NAME_CHARS) {
            Some((end, _)) => &text[..end],
            None => text,
        };
        Self(text.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PlayerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fields observed by change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FieldKey {
    PlayerName,
    Transform,
}

impl FieldKey {
    pub const ALL: [FieldKey; 2] = [FieldKey::PlayerName, FieldKey::Transform];

    /// Name used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlayerName => "PlayerName",
            Self::Transform => "Transform",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.as_str() == name)
    }

    /// Whether an input authority may ask for this field to be assigned.
    pub fn is_remote_settable(&self) -> bool {
        matches!(self, Self::PlayerName)
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last observed value of a field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(PlayerName),
    Transform(Transform),
}

/// A replicated value of one entity.
#[derive(Debug, Clone)]
pub struct NetworkedField<T> {
    entity: EntityId,
    value: T,
    dirty: bool,
}

impl<T: PartialEq> NetworkedField<T> {
    pub fn new(entity: EntityId, value: T) -> Self {
        Self {
            entity,
            value,
            dirty: false,
        }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn entity(&self) -> EntityId {
        self.entity
    }

    /// Assign the authoritative copy.
    ///
    /// Marks the field for replication if the value changed. Returns whether
    /// it did.
    pub fn set(&mut self, authority: &StateAuthority, value: T) -> Result<bool, AuthorityError> {
        if authority.entity() != self.entity {
            return Err(AuthorityError::TokenMismatch {
                token: authority.entity(),
                target: self.entity,
            });
        }
        if self.value == value {
            return Ok(false);
        }
        self.value = value;
        self.dirty = true;
        Ok(true)
    }

    /// Overwrite a replica with the value received from the state authority.
    pub(crate) fn apply_replicated(&mut self, value: T) {
        self.value = value;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Clear the dirty flag, returning whether it was set.
    pub(crate) fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}

#[cfg(test)]
mod tests {
    use pilot_sim::PeerId;

    use super::*;
    use crate::authority::{AuthorityMap, Roles};

    const HOST: PeerId = 1;

    fn host_map() -> AuthorityMap {
        let mut map = AuthorityMap::new(HOST);
        map.assign(
            1,
            Roles {
                state: HOST,
                input: Some(2),
            },
        );
        map.assign(
            2,
            Roles {
                state: HOST,
                input: Some(3),
            },
        );
        map
    }

    #[test]
    fn test_name_truncated_to_limit() {
        let long = "x".repeat(40);
        assert_eq!(PlayerName::new(&long).as_str().len(), MAX_PLAYER_NAME_CHARS);

        let exact = "y".repeat(MAX_PLAYER_NAME_CHARS);
        assert_eq!(PlayerName::new(&exact).as_str(), exact);
    }

    #[test]
    fn test_name_truncated_on_char_boundary() {
        let long = "é".repeat(40);
        let name = PlayerName::new(&long);
        assert_eq!(name.as_str().chars().count(), MAX_PLAYER_NAME_CHARS);
    }

    #[test]
    fn test_field_key_names() {
        assert_eq!(FieldKey::parse("PlayerName"), Some(FieldKey::PlayerName));
        assert_eq!(FieldKey::parse("Transform"), Some(FieldKey::Transform));
        assert_eq!(FieldKey::parse("Health"), None);
        assert!(FieldKey::PlayerName.is_remote_settable());
        assert!(!FieldKey::Transform.is_remote_settable());
    }

    #[test]
    fn test_set_marks_dirty_only_on_change() {
        let map = host_map();
        let token = map.state_authority(1).unwrap();
        let mut field = NetworkedField::new(1, PlayerName::default());

        assert!(field.set(&token, PlayerName::new("Player_2")).unwrap());
        assert!(field.is_dirty());
        assert!(field.take_dirty());
        assert!(!field.is_dirty());

        assert!(!field.set(&token, PlayerName::new("Player_2")).unwrap());
        assert!(!field.is_dirty());
    }

    #[test]
    fn test_set_rejects_foreign_token() {
        let map = host_map();
        let token = map.state_authority(2).unwrap();
        let mut field = NetworkedField::new(1, PlayerName::default());

        let result = field.set(&token, PlayerName::new("Mallory"));

        assert_eq!(
            result,
            Err(AuthorityError::TokenMismatch {
                token: 2,
                target: 1
            })
        );
        assert!(field.get().is_empty());
    }

    #[test]
    fn test_replicated_value_not_dirty() {
        let mut field = NetworkedField::new(1, PlayerName::default());
        field.apply_replicated(PlayerName::new("Player_2"));
        assert_eq!(field.get().as_str(), "Player_2");
        assert!(!field.is_dirty());
    }
}
