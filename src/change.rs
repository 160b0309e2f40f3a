//! Change capture.
//!
//! Every create, update or delete inside a transaction appends one [`Change`].
//! The shape is enforced by the constructors: creates carry only `after`,
//! deletes carry only `before`, updates carry both.

use serde::{Deserialize, Serialize};

use crate::entity::{Entity, EntityRecord, EntityType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        })
    }
}

/// One entity mutation observed during a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub entity: EntityType,
    pub action: Action,
    pub before: Option<EntityRecord>,
    pub after: Option<EntityRecord>,
}

impl Change {
    pub fn create(after: EntityRecord) -> Self {
        Self {
            entity: after.kind(),
            action: Action::Create,
            before: None,
            after: Some(after),
        }
    }

    pub fn update(before: EntityRecord, after: EntityRecord) -> Self {
        debug_assert_eq!(before.kind(), after.kind());
        Self {
            entity: after.kind(),
            action: Action::Update,
            before: Some(before),
            after: Some(after),
        }
    }

    pub fn delete(before: EntityRecord) -> Self {
        Self {
            entity: before.kind(),
            action: Action::Delete,
            before: Some(before),
            after: None,
        }
    }

    /// Identifier of the affected record.
    pub fn id(&self) -> &str {
        self.after
            .as_ref()
            .or(self.before.as_ref())
            .map(EntityRecord::id)
            .unwrap_or_default()
    }

    pub fn after_as<E: Entity>(&self) -> Option<&E> {
        self.after.as_ref().and_then(E::from_record_ref)
    }

    pub fn before_as<E: Entity>(&self) -> Option<&E> {
        self.before.as_ref().and_then(E::from_record_ref)
    }

    /// Both snapshots as `E`, skipping the missing side.
    pub fn snapshots_as<E: Entity>(&self) -> impl Iterator<Item = &E> {
        self.before_as::<E>().into_iter().chain(self.after_as::<E>())
    }
}
