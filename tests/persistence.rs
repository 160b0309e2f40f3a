//! Persistence and recovery tests for the disk-backed stores.
//!
//! These tests verify that committed records survive a close and reopen,
//! and that rejected transactions never reach disk.

use std::sync::Arc;

use colony_core::config::{RuleSet, StoreConfig};
use colony_core::context::Context;
use colony_core::entity::{
    BreedingUnit, Facility, HousingUnit, LifecycleStage, Organism, Sample, SampleCustodyEvent,
    SampleStatus,
};
use colony_core::error::StoreError;
use colony_core::rules::RulesEngine;
use colony_core::store::{
    DurableStore, PersistentStore, SnapshotStore, StorageDriver, StoreExt, TransactionExt,
};

fn open(driver: StorageDriver, dir: &std::path::Path) -> Arc<dyn PersistentStore> {
    let engine = Arc::new(RulesEngine::with_defaults());
    match driver {
        StorageDriver::Snapshot => Arc::new(SnapshotStore::open(dir, engine).unwrap()),
        StorageDriver::Durable => Arc::new(DurableStore::open(dir, engine).unwrap()),
        StorageDriver::Memory => unreachable!("memory store does not persist"),
    }
}

const DISK_DRIVERS: [StorageDriver; 2] = [StorageDriver::Snapshot, StorageDriver::Durable];

#[test]
fn records_survive_restart() {
    for driver in DISK_DRIVERS {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = Context::new();

        // First session: build a small colony.
        let (unit_id, frog_id, sample_id) = {
            let store = open(driver, dir.path());
            let (ids, _) = store
                .transact(&ctx, |tx| {
                    let facility = tx.create(Facility {
                        code: "AQ-1".into(),
                        name: "Aquatics".into(),
                        ..Default::default()
                    })?;
                    let unit =
                        tx.create(HousingUnit::new("Tank 1", facility.base.id.clone(), 2))?;

                    let mut frog = Organism::new("Frog 1", "xenopus");
                    frog.housing_id = Some(unit.base.id.clone());
                    frog.stage = LifecycleStage::Adult;
                    frog.attributes
                        .insert("clutch".into(), serde_json::json!(7));
                    let frog = tx.create(frog)?;

                    let sample = tx.create(Sample {
                        identifier: "S-001".into(),
                        organism_id: Some(frog.base.id.clone()),
                        facility_id: Some(facility.base.id.clone()),
                        chain_of_custody: vec![SampleCustodyEvent {
                            actor: "tech".into(),
                            location: "freezer B".into(),
                            ..Default::default()
                        }],
                        ..Default::default()
                    })?;
                    Ok((unit.base.id, frog.base.id, sample.base.id))
                })
                .unwrap();
            ids
        };

        // Second session: everything is back.
        {
            let store = open(driver, dir.path());
            let frog = store.get::<Organism>(&frog_id).expect("organism persisted");
            assert_eq!(frog.name, "Frog 1");
            assert_eq!(frog.stage, LifecycleStage::Adult);
            assert_eq!(frog.housing_id.as_deref(), Some(unit_id.as_str()));
            assert_eq!(frog.attributes["clutch"], 7);

            let sample = store.get::<Sample>(&sample_id).expect("sample persisted");
            assert_eq!(sample.status, SampleStatus::Stored);
            assert_eq!(sample.chain_of_custody.len(), 1);
            assert_eq!(sample.chain_of_custody[0].location, "freezer B");
            assert_eq!(store.list::<Facility>().len(), 1);
        }
    }
}

#[test]
fn blocked_transactions_never_reach_disk() {
    for driver in DISK_DRIVERS {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = Context::new();

        {
            let store = open(driver, dir.path());
            let (unit, _) = store
                .transact(&ctx, |tx| {
                    let facility = tx.create(Facility::default())?;
                    tx.create(HousingUnit::new("Tank", facility.base.id, 1))
                })
                .unwrap();
            let err = store
                .transact(&ctx, |tx| {
                    for name in ["A", "B"] {
                        let mut frog = Organism::new(name, "xenopus");
                        frog.housing_id = Some(unit.base.id.clone());
                        tx.create(frog)?;
                    }
                    Ok(())
                })
                .unwrap_err();
            assert!(matches!(err, StoreError::Blocked(_)));
        }

        {
            let store = open(driver, dir.path());
            assert_eq!(store.list::<HousingUnit>().len(), 1);
            assert_eq!(store.list::<Facility>().len(), 1);
            assert!(store.list::<Organism>().is_empty(), "{driver}");
        }
    }
}

#[test]
fn updates_and_deletes_survive_restart() {
    for driver in DISK_DRIVERS {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = Context::new();

        let (kept, removed) = {
            let store = open(driver, dir.path());
            let (ids, _) = store
                .transact(&ctx, |tx| {
                    let a = tx.create(Organism::new("A", "mouse"))?;
                    let b = tx.create(Organism::new("B", "mouse"))?;
                    Ok((a.base.id, b.base.id))
                })
                .unwrap();
            let (kept, removed) = ids;
            store
                .transact(&ctx, |tx| {
                    tx.update::<Organism, _>(&kept, |o| {
                        o.stage = LifecycleStage::Juvenile;
                        Ok(())
                    })?;
                    tx.delete::<Organism>(&removed)
                })
                .unwrap();
            (kept, removed)
        };

        let store = open(driver, dir.path());
        assert_eq!(
            store.get::<Organism>(&kept).map(|o| o.stage),
            Some(LifecycleStage::Juvenile)
        );
        assert!(store.get::<Organism>(&removed).is_none());
    }
}

#[test]
fn config_opens_the_same_data_twice() {
    let dir = tempfile::TempDir::new().unwrap();
    let config_path = dir.path().join("colony.toml");
    let config = StoreConfig {
        driver: StorageDriver::Durable,
        path: Some(dir.path().join("data")),
        rule_set: RuleSet::Extended,
    };
    config.save(&config_path).unwrap();

    let ctx = Context::new();
    let unit_id = {
        let store = StoreConfig::load(&config_path).unwrap().open().unwrap();
        assert_eq!(store.rules_engine().len(), 5);
        let (unit, _) = store
            .transact(&ctx, |tx| {
                tx.create(BreedingUnit {
                    name: "Pair 1".into(),
                    ..Default::default()
                })
            })
            .unwrap();
        unit.base.id
    };

    let store = StoreConfig::load(&config_path).unwrap().open().unwrap();
    assert_eq!(store.driver(), StorageDriver::Durable);
    assert_eq!(store.get::<BreedingUnit>(&unit_id).unwrap().name, "Pair 1");
}
