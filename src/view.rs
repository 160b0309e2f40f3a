//! Read-only access to a transaction's state.

use crate::entity::{Entity, EntityRecord, EntityType};

/// Read-only lookups across every entity collection.
///
/// Implementations return owned copies; callers may keep them after the view
/// is gone.
pub trait TransactionView {
    fn find_record(&self, kind: EntityType, id: &str) -> Option<EntityRecord>;

    /// All records of one type, ordered by id.
    fn list_records(&self, kind: EntityType) -> Vec<EntityRecord>;
}

/// Typed helpers over any [`TransactionView`].
pub trait ViewExt: TransactionView {
    fn find<E: Entity>(&self, id: &str) -> Option<E> {
        self.find_record(E::KIND, id).and_then(E::from_record)
    }

    fn list<E: Entity>(&self) -> Vec<E> {
        self.list_records(E::KIND)
            .into_iter()
            .filter_map(E::from_record)
            .collect()
    }

    fn contains<E: Entity>(&self, id: &str) -> bool {
        self.find_record(E::KIND, id).is_some()
    }
}

impl<T: TransactionView + ?Sized> ViewExt for T {}
