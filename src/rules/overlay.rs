//! Dual-source record lookup for rules.

use std::collections::{BTreeMap, HashMap};

use crate::change::Change;
use crate::entity::{EntityRecord, EntityType};
use crate::view::TransactionView;

/// Resolves records from the change list first, then from the view.
///
/// The latest change for an id wins and a delete hides the record. Backends
/// that hand rules an already-applied view get the same answers either way;
/// the overlay keeps rules correct when the view lags the changes.
pub struct ChangeOverlay<'a> {
    view: &'a dyn TransactionView,
    latest: HashMap<(EntityType, &'a str), Option<&'a EntityRecord>>,
}

impl<'a> ChangeOverlay<'a> {
    pub fn new(view: &'a dyn TransactionView, changes: &'a [Change]) -> Self {
        let mut latest = HashMap::new();
        for change in changes {
            latest.insert((change.entity, change.id()), change.after.as_ref());
        }
        Self { view, latest }
    }

    /// Whether any change in the list touched this record.
    pub fn touched(&self, kind: EntityType, id: &str) -> bool {
        self.latest.contains_key(&(kind, id))
    }
}

impl TransactionView for ChangeOverlay<'_> {
    fn find_record(&self, kind: EntityType, id: &str) -> Option<EntityRecord> {
        match self.latest.get(&(kind, id)) {
            Some(after) => after.cloned(),
            None => self.view.find_record(kind, id),
        }
    }

    fn list_records(&self, kind: EntityType) -> Vec<EntityRecord> {
        let mut merged: BTreeMap<String, EntityRecord> = self
            .view
            .list_records(kind)
            .into_iter()
            .map(|r| (r.id().to_string(), r))
            .collect();
        for ((k, id), after) in &self.latest {
            if *k != kind {
                continue;
            }
            match after {
                Some(record) => {
                    merged.insert((*id).to_string(), (*record).clone());
                }
                None => {
                    merged.remove(*id);
                }
            }
        }
        merged.into_values().collect()
    }
}
