//! Edge-triggered change detection.
//!
//! Each peer keeps, per entity, the last value it observed for every field.
//! A detection pass compares current values against that shadow copy,
//! reports each differing field once and refreshes the shadow. A field that
//! changed several times between two passes is reported once, with only its
//! final value observable.

use std::collections::BTreeMap;

use pilot_sim::EntityId;

use crate::field::{FieldKey, FieldValue};

/// A field observed to differ from its shadow copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldChange {
    pub entity: EntityId,
    pub field: FieldKey,
}

#[derive(Debug, Default)]
pub struct ChangeDetector {
    shadows: BTreeMap<EntityId, BTreeMap<FieldKey, FieldValue>>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start observing an entity. Values present now are not changes.
    pub fn track<I>(&mut self, entity: EntityId, current: I)
    where
        I: IntoIterator<Item = (FieldKey, FieldValue)>,
    {
        self.shadows.insert(entity, current.into_iter().collect());
    }

    pub fn forget(&mut self, entity: EntityId) {
        self.shadows.remove(&entity);
    }

    pub fn clear(&mut self) {
        self.shadows.clear();
    }

    pub fn is_tracked(&self, entity: EntityId) -> bool {
        self.shadows.contains_key(&entity)
    }

    pub fn shadow(&self, entity: EntityId, field: FieldKey) -> Option<&FieldValue> {
        self.shadows.get(&entity).and_then(|fields| fields.get(&field))
    }

    /// Compare `current` against the shadow of `entity`.
    ///
    /// Returns the fields that differ, in key order. An untracked entity is
    /// tracked from this pass on and reports nothing.
    pub fn detect<I>(&mut self, entity: EntityId, current: I) -> Vec<FieldChange>
    where
        I: IntoIterator<Item = (FieldKey, FieldValue)>,
    {
        let Some(shadow) = self.shadows.get_mut(&entity) else {
            self.track(entity, current);
            return Vec::new();
        };

        let mut changes = Vec::new();
        for (field, value) in current {
            if shadow.get(&field) != Some(&value) {
                shadow.insert(field, value);
                changes.push(FieldChange { entity, field });
            }
        }
        changes.sort_by_key(|change| change.field);
        changes
    }
}
