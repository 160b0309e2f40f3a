//! Transaction contract, exercised against every backend.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use colony_core::change::Change;
use colony_core::config::StoreConfig;
use colony_core::context::Context;
use colony_core::entity::{EntityType, Facility, HousingUnit, Organism};
use colony_core::error::{RuleError, StoreError};
use colony_core::rules::{EvaluationResult, Rule, RulesEngine, Severity, Violation};
use colony_core::store::{
    PersistentStore, StorageDriver, StoreExt, TransactionExt, open_persistent_store,
};
use colony_core::view::{TransactionView, ViewExt};
use tempfile::TempDir;

/// One store per driver, each in its own directory.
fn stores(engine: impl Fn() -> RulesEngine) -> Vec<(TempDir, Arc<dyn PersistentStore>)> {
    [
        StorageDriver::Memory,
        StorageDriver::Snapshot,
        StorageDriver::Durable,
    ]
    .into_iter()
    .map(|driver| {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::with_driver(driver, dir.path());
        let store = open_persistent_store(&config, Arc::new(engine())).unwrap();
        assert_eq!(store.driver(), driver);
        (dir, store)
    })
    .collect()
}

struct WarnOnEveryChange;

impl Rule for WarnOnEveryChange {
    fn name(&self) -> &str {
        "warn_on_every_change"
    }

    fn evaluate(
        &self,
        _ctx: &Context,
        _view: &dyn TransactionView,
        changes: &[Change],
    ) -> Result<EvaluationResult, RuleError> {
        Ok(changes
            .iter()
            .map(|c| Violation::new(self.name(), Severity::Warn, "noted").on(c.entity, c.id()))
            .collect::<Vec<_>>()
            .into())
    }
}

struct Broken;

impl Rule for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    fn evaluate(
        &self,
        _ctx: &Context,
        _view: &dyn TransactionView,
        _changes: &[Change],
    ) -> Result<EvaluationResult, RuleError> {
        Err(RuleError::new("broken", "lookup table unavailable"))
    }
}

struct Counting(Arc<AtomicUsize>);

impl Rule for Counting {
    fn name(&self) -> &str {
        "counting"
    }

    fn evaluate(
        &self,
        _ctx: &Context,
        _view: &dyn TransactionView,
        _changes: &[Change],
    ) -> Result<EvaluationResult, RuleError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(EvaluationResult::new())
    }
}

#[test]
fn body_error_discards_every_mutation() {
    for (_dir, store) in stores(RulesEngine::with_defaults) {
        let ctx = Context::new();
        let err = store
            .transact(&ctx, |tx| {
                tx.create(Organism::new("A", "mouse"))?;
                let facility = tx.create(Facility::default())?;
                tx.create(HousingUnit::new("Rack 1", facility.base.id, 4))?;
                Err::<(), _>(StoreError::aborted("operator cancelled intake"))
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::Aborted { .. }), "{}", store.driver());
        assert!(store.list::<Organism>().is_empty());
        assert!(store.list::<HousingUnit>().is_empty());
        assert!(store.list::<Facility>().is_empty());
    }
}

#[test]
fn over_capacity_assignment_is_blocked_and_not_committed() {
    for (_dir, store) in stores(RulesEngine::with_defaults) {
        let ctx = Context::new();
        let (unit, _) = store
            .transact(&ctx, |tx| {
                let facility = tx.create(Facility::default())?;
                tx.create(HousingUnit::new("Tank", facility.base.id, 1))
            })
            .unwrap();
        let unit_id = unit.base.id.clone();

        let err = store
            .transact(&ctx, |tx| {
                for name in ["A", "B"] {
                    let mut frog = Organism::new(name, "xenopus");
                    frog.housing_id = Some(unit_id.clone());
                    tx.create(frog)?;
                }
                Ok(())
            })
            .unwrap_err();

        let result = err.violations().expect("blocked error carries a result");
        assert!(result.has_blocking());
        let violation = &result.violations[0];
        assert_eq!(violation.rule, "housing_capacity");
        assert_eq!(violation.entity, Some(EntityType::HousingUnit));
        assert_eq!(violation.entity_id.as_deref(), Some(unit_id.as_str()));
        assert!(store.list::<Organism>().is_empty(), "{}", store.driver());
    }
}

#[test]
fn non_blocking_violations_are_returned_with_the_commit() {
    for (_dir, store) in stores(|| RulesEngine::new().with_rule(WarnOnEveryChange)) {
        let (frog, result) = store
            .transact(&Context::new(), |tx| tx.create(Organism::new("A", "xenopus")))
            .unwrap();
        assert_eq!(result.len(), 1);
        assert!(!result.has_blocking());
        assert_eq!(result.violations[0].entity_id.as_deref(), Some(frog.base.id.as_str()));
        assert!(store.get::<Organism>(&frog.base.id).is_some());
    }
}

#[test]
fn failing_rule_stops_evaluation_and_commit() {
    let later = Arc::new(AtomicUsize::new(0));
    let engine = {
        let later = later.clone();
        move || {
            RulesEngine::new()
                .with_rule(Broken)
                .with_rule(Counting(later.clone()))
        }
    };
    for (_dir, store) in stores(engine) {
        let err = store
            .transact(&Context::new(), |tx| tx.create(Organism::new("A", "mouse")))
            .unwrap_err();
        match err {
            StoreError::Rule(e) => assert_eq!(e.rule, "broken"),
            other => panic!("expected rule error, got {other}"),
        }
        assert!(store.list::<Organism>().is_empty());
    }
    assert_eq!(later.load(Ordering::SeqCst), 0);
}

#[test]
fn cancellation_aborts_the_attempt() {
    for (_dir, store) in stores(RulesEngine::with_defaults) {
        let ctx = Context::new();
        let err = store
            .transact(&ctx, |tx| {
                tx.create(Organism::new("A", "mouse"))?;
                ctx.cancel();
                Ok(())
            })
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(store.list::<Organism>().is_empty());

        let err = store
            .transact(&ctx, |tx| tx.create(Organism::new("B", "mouse")))
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(store.read(&ctx, |_| Ok(())).unwrap_err().is_cancelled());
    }
}

#[test]
fn missing_records_are_not_found() {
    for (_dir, store) in stores(RulesEngine::with_defaults) {
        let ctx = Context::new();
        let err = store
            .transact(&ctx, |tx| {
                tx.update::<Organism, _>("ghost", |o| {
                    o.name = "never".into();
                    Ok(())
                })
            })
            .unwrap_err();
        assert!(err.is_not_found());

        let err = store
            .transact(&ctx, |tx| tx.delete::<HousingUnit>("ghost"))
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::NotFound {
                entity: EntityType::HousingUnit,
                ..
            }
        ));
    }
}

#[test]
fn views_only_see_committed_state() {
    for (_dir, store) in stores(RulesEngine::with_defaults) {
        let ctx = Context::new();
        store
            .transact(&ctx, |tx| tx.create(Organism::new("Committed", "mouse")))
            .unwrap();
        let _ = store.transact(&ctx, |tx| {
            tx.create(Organism::new("Discarded", "mouse"))?;
            Err::<(), _>(StoreError::aborted("rollback"))
        });

        let names = store
            .read(&ctx, |view| {
                Ok(view
                    .list::<Organism>()
                    .into_iter()
                    .map(|o| o.name)
                    .collect::<Vec<_>>())
            })
            .unwrap();
        assert_eq!(names, vec!["Committed".to_string()]);
    }
}

#[test]
fn changes_are_captured_in_order() {
    for (_dir, store) in stores(RulesEngine::new) {
        let ctx = Context::new();
        let (facility, _) = store
            .transact(&ctx, |tx| tx.create(Facility::default()))
            .unwrap();
        let (actions, _) = store
            .transact(&ctx, |tx| {
                let unit = tx.create(HousingUnit::new("Rack", facility.base.id.clone(), 2))?;
                tx.update::<HousingUnit, _>(&unit.base.id, |u| {
                    u.environment = "aquatic".into();
                    Ok(())
                })?;
                tx.delete::<HousingUnit>(&unit.base.id)?;
                Ok(tx
                    .changes()
                    .iter()
                    .map(|c| c.action.to_string())
                    .collect::<Vec<_>>())
            })
            .unwrap();
        assert_eq!(actions, vec!["create", "update", "delete"]);
        assert!(store.list::<HousingUnit>().is_empty());
    }
}

#[test]
fn rules_registered_after_open_apply_to_later_commits() {
    for (_dir, store) in stores(RulesEngine::new) {
        let ctx = Context::new();
        store
            .transact(&ctx, |tx| tx.create(Organism::new("A", "mouse")))
            .unwrap();
        store
            .rules_engine()
            .register(Arc::new(WarnOnEveryChange));
        let (_, result) = store
            .transact(&ctx, |tx| tx.create(Organism::new("B", "mouse")))
            .unwrap();
        assert_eq!(result.len(), 1);
    }
}
