//! Committed state and the staging transaction shared by every backend.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::change::Change;
use crate::context::Context;
use crate::entity::{EntityRecord, EntityType};
use crate::error::{RuleViolationError, StoreError, StoreResult};
use crate::rules::{EvaluationResult, RulesEngine};
use crate::view::TransactionView;

use super::Transaction;

/// Every record, bucketed by type and ordered by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct State {
    tables: BTreeMap<EntityType, BTreeMap<String, EntityRecord>>,
}

impl State {
    pub fn get(&self, kind: EntityType, id: &str) -> Option<&EntityRecord> {
        self.tables.get(&kind).and_then(|t| t.get(id))
    }

    pub fn contains(&self, kind: EntityType, id: &str) -> bool {
        self.get(kind, id).is_some()
    }

    /// Insert or replace a record under its own type and id.
    pub fn insert(&mut self, record: EntityRecord) {
        self.tables
            .entry(record.kind())
            .or_default()
            .insert(record.id().to_string(), record);
    }

    pub fn remove(&mut self, kind: EntityType, id: &str) -> Option<EntityRecord> {
        self.tables.get_mut(&kind).and_then(|t| t.remove(id))
    }

    pub fn records(&self, kind: EntityType) -> impl Iterator<Item = &EntityRecord> {
        self.tables.get(&kind).into_iter().flat_map(|t| t.values())
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityRecord> {
        self.tables.values().flat_map(|t| t.values())
    }

    pub fn len(&self) -> usize {
        self.tables.values().map(BTreeMap::len).sum()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn view(&self) -> StateView<'_> {
        StateView(self)
    }
}

/// Read-only [`TransactionView`] over a borrowed [`State`].
#[derive(Debug, Clone, Copy)]
pub struct StateView<'a>(&'a State);

impl TransactionView for StateView<'_> {
    fn find_record(&self, kind: EntityType, id: &str) -> Option<EntityRecord> {
        self.0.get(kind, id).cloned()
    }

    fn list_records(&self, kind: EntityType) -> Vec<EntityRecord> {
        self.0.records(kind).cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Staging
// ---------------------------------------------------------------------------

/// 128 random bits, hex encoded.
pub(crate) fn generate_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// Transaction over a private copy of committed state.
pub(crate) struct StagedTransaction {
    state: State,
    changes: Vec<Change>,
    now: DateTime<Utc>,
}

impl StagedTransaction {
    pub(crate) fn new(state: State) -> Self {
        Self {
            state,
            changes: Vec::new(),
            now: Utc::now(),
        }
    }

    /// Required fields first, then every hard reference must resolve.
    fn check_references(&self, record: &EntityRecord) -> StoreResult<()> {
        record.validate().map_err(|message| StoreError::Invalid {
            entity: record.kind(),
            message: message.into(),
        })?;
        for (kind, id) in record.hard_references() {
            if !self.state.contains(kind, id) {
                return Err(StoreError::not_found(kind, id));
            }
        }
        Ok(())
    }
}

impl TransactionView for StagedTransaction {
    fn find_record(&self, kind: EntityType, id: &str) -> Option<EntityRecord> {
        self.state.get(kind, id).cloned()
    }

    fn list_records(&self, kind: EntityType) -> Vec<EntityRecord> {
        self.state.records(kind).cloned().collect()
    }
}

impl Transaction for StagedTransaction {
    fn create_record(&mut self, mut record: EntityRecord) -> StoreResult<EntityRecord> {
        let kind = record.kind();
        if record.id().is_empty() {
            record.base_mut().id = generate_id();
        } else if self.state.contains(kind, record.id()) {
            return Err(StoreError::AlreadyExists {
                entity: kind,
                id: record.id().to_string(),
            });
        }
        self.check_references(&record)?;

        let base = record.base_mut();
        base.created_at = self.now;
        base.updated_at = self.now;

        self.state.insert(record.clone());
        self.changes.push(Change::create(record.clone()));
        Ok(record)
    }

    fn update_record(
        &mut self,
        kind: EntityType,
        id: &str,
        mutate: &mut dyn FnMut(&mut EntityRecord) -> StoreResult<()>,
    ) -> StoreResult<EntityRecord> {
        let before = self
            .state
            .get(kind, id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(kind, id))?;

        let mut after = before.clone();
        mutate(&mut after)?;
        if after.kind() != kind {
            return Err(StoreError::Invalid {
                entity: kind,
                message: format!("update may not change the record type to {}", after.kind()),
            });
        }

        let base = after.base_mut();
        base.id = id.to_string();
        base.created_at = before.base().created_at;
        base.updated_at = self.now;
        self.check_references(&after)?;

        self.state.insert(after.clone());
        self.changes.push(Change::update(before, after.clone()));
        Ok(after)
    }

    fn delete_record(&mut self, kind: EntityType, id: &str) -> StoreResult<()> {
        if !self.state.contains(kind, id) {
            return Err(StoreError::not_found(kind, id));
        }
        let referrer = self.state.iter().find_map(|record| {
            record
                .hard_references()
                .into_iter()
                .any(|(k, rid)| k == kind && rid == id)
                .then(|| (record.kind(), record.id().to_string()))
        });
        if let Some((by_entity, by_id)) = referrer {
            return Err(StoreError::Referenced {
                entity: kind,
                id: id.to_string(),
                by_entity,
                by_id,
            });
        }

        let before = self
            .state
            .remove(kind, id)
            .ok_or_else(|| StoreError::not_found(kind, id))?;
        self.changes.push(Change::delete(before));
        Ok(())
    }

    fn changes(&self) -> &[Change] {
        &self.changes
    }
}

/// A transaction attempt that passed evaluation and is ready to commit.
pub(crate) struct Prepared {
    pub state: State,
    pub changes: Vec<Change>,
    pub result: EvaluationResult,
}

/// Run `body` on a copy of `committed` and evaluate `engine` against the
/// outcome. Blocking results become `StoreError::Blocked`.
pub(crate) fn prepare(
    engine: &RulesEngine,
    ctx: &Context,
    committed: &State,
    body: &mut dyn FnMut(&mut dyn Transaction) -> StoreResult<()>,
) -> StoreResult<Prepared> {
    ctx.check()?;
    let mut tx = StagedTransaction::new(committed.clone());
    body(&mut tx)?;
    ctx.check()?;

    let StagedTransaction { state, changes, .. } = tx;
    let result = engine.evaluate(ctx, &state.view(), &changes)?;
    if result.has_blocking() {
        tracing::warn!(
            changes = changes.len(),
            blocking = result.blocking().count(),
            violations = result.len(),
            "transaction blocked by rules"
        );
        return Err(RuleViolationError::new(result).into());
    }
    if !result.is_empty() {
        tracing::warn!(
            violations = result.len(),
            "committing with non-blocking violations"
        );
    }
    ctx.check()?;

    Ok(Prepared {
        state,
        changes,
        result,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Entity, Organism};
    use crate::rules::{Rule, Severity, Violation};
    use crate::error::RuleError;
    use crate::store::TransactionExt;

    struct BlockAll;

    impl Rule for BlockAll {
        fn name(&self) -> &str {
            "block_all"
        }

        fn evaluate(
            &self,
            _ctx: &Context,
            _view: &dyn TransactionView,
            changes: &[Change],
        ) -> Result<EvaluationResult, RuleError> {
            Ok(changes
                .iter()
                .map(|c| Violation::new("block_all", Severity::Block, "no").on(c.entity, c.id()))
                .collect::<Vec<_>>()
                .into())
        }
    }

    #[test]
    fn generated_ids_are_unique_hex() {
        let a = generate_id();
        let b = generate_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn prepare_leaves_committed_state_untouched() {
        let committed = State::default();
        let engine = RulesEngine::new();
        let prepared = prepare(&engine, &Context::new(), &committed, &mut |tx: &mut dyn Transaction| {
            tx.create(Organism::new("A", "mouse"))?;
            Ok(())
        })
        .unwrap();
        assert!(committed.is_empty());
        assert_eq!(prepared.state.len(), 1);
        assert_eq!(prepared.changes.len(), 1);
    }

    #[test]
    fn blocked_prepare_carries_result() {
        let engine = RulesEngine::new().with_rule(BlockAll);
        let err = prepare(&engine, &Context::new(), &State::default(), &mut |tx: &mut dyn Transaction| {
            tx.create(Organism::new("A", "mouse"))?;
            Ok(())
        })
        .err()
        .unwrap();
        let result = err.violations().unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.violations[0].entity, Some(Organism::KIND));
    }

    #[test]
    fn body_error_skips_rules() {
        let engine = RulesEngine::new().with_rule(BlockAll);
        let err = prepare(&engine, &Context::new(), &State::default(), &mut |tx: &mut dyn Transaction| {
            tx.create(Organism::new("A", "mouse"))?;
            Err(StoreError::aborted("caller gave up"))
        })
        .err()
        .unwrap();
        assert!(matches!(err, StoreError::Aborted { .. }));
    }

    #[test]
    fn update_of_missing_record_is_not_found() {
        let mut tx = StagedTransaction::new(State::default());
        let err = tx
            .update::<Organism, _>("ghost", |_| Ok(()))
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(tx.changes().is_empty());
    }
}
