//! Transactional storage for colony records.
//!
//! Three backends implement the same [`PersistentStore`] contract:
//!
//! - [`MemoryStore`]: committed state in memory, lost on exit
//! - [`SnapshotStore`]: memory plus an atomically rewritten JSON snapshot (read back via memmap2)
//! - [`DurableStore`]: one redb table per entity type with ACID commits
//!
//! Every transaction stages its mutations, evaluates the store's
//! [`RulesEngine`] against the prospective state, and commits only when no
//! blocking violation was produced.

pub mod durable;
pub mod mem;
pub mod snapshot;
pub(crate) mod state;

pub use durable::DurableStore;
pub use mem::MemoryStore;
pub use snapshot::SnapshotStore;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::change::Change;
use crate::config::StoreConfig;
use crate::context::Context;
use crate::entity::{Entity, EntityRecord, EntityType};
use crate::error::{ColonyResult, ConfigError, StoreError};
use crate::rules::{EvaluationResult, RulesEngine};
use crate::view::TransactionView;

pub use crate::error::StoreResult;

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// Mutable unit of work. Every successful mutation appends one [`Change`].
///
/// Reads through the [`TransactionView`] supertrait observe this
/// transaction's own uncommitted writes.
pub trait Transaction: TransactionView {
    /// Insert a new record. An empty id is replaced with a generated one.
    fn create_record(&mut self, record: EntityRecord) -> StoreResult<EntityRecord>;

    /// Apply `mutate` to a copy of the stored record and store the result.
    ///
    /// The id and creation time cannot be changed by the mutator.
    fn update_record(
        &mut self,
        kind: EntityType,
        id: &str,
        mutate: &mut dyn FnMut(&mut EntityRecord) -> StoreResult<()>,
    ) -> StoreResult<EntityRecord>;

    fn delete_record(&mut self, kind: EntityType, id: &str) -> StoreResult<()>;

    /// Changes captured so far, in occurrence order.
    fn changes(&self) -> &[Change];
}

/// Typed CRUD over any [`Transaction`].
pub trait TransactionExt: Transaction {
    fn create<E: Entity>(&mut self, entity: E) -> StoreResult<E> {
        let record = self.create_record(entity.into_record())?;
        E::from_record(record).ok_or_else(|| kind_mismatch(E::KIND))
    }

    fn update<E, F>(&mut self, id: &str, mutate: F) -> StoreResult<E>
    where
        E: Entity,
        F: FnOnce(&mut E) -> StoreResult<()>,
    {
        let mut mutate = Some(mutate);
        let mut typed = |record: &mut EntityRecord| -> StoreResult<()> {
            let mutate = mutate
                .take()
                .ok_or_else(|| StoreError::aborted("update mutator invoked twice"))?;
            let entity = E::from_record_mut(record).ok_or_else(|| kind_mismatch(E::KIND))?;
            mutate(entity)
        };
        let record = self.update_record(E::KIND, id, &mut typed)?;
        E::from_record(record).ok_or_else(|| kind_mismatch(E::KIND))
    }

    fn delete<E: Entity>(&mut self, id: &str) -> StoreResult<()> {
        self.delete_record(E::KIND, id)
    }
}

impl<T: Transaction + ?Sized> TransactionExt for T {}

fn kind_mismatch(kind: EntityType) -> StoreError {
    StoreError::Invalid {
        entity: kind,
        message: "stored record has a different entity type".into(),
    }
}

// ---------------------------------------------------------------------------
// Store contract
// ---------------------------------------------------------------------------

/// Which backend a store is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageDriver {
    #[default]
    Memory,
    Snapshot,
    Durable,
}

impl StorageDriver {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Snapshot => "snapshot",
            Self::Durable => "durable",
        }
    }
}

impl fmt::Display for StorageDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageDriver {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(Self::Memory),
            "snapshot" | "file" => Ok(Self::Snapshot),
            "durable" | "redb" => Ok(Self::Durable),
            _ => Err(ConfigError::UnknownDriver {
                driver: s.to_string(),
            }),
        }
    }
}

/// Contract every storage backend satisfies.
pub trait PersistentStore: Send + Sync {
    fn driver(&self) -> StorageDriver;

    /// The engine evaluated on every commit. Register extra rules here at
    /// installation time.
    fn rules_engine(&self) -> &Arc<RulesEngine>;

    /// Run `body` against a fresh transaction, evaluate rules, then commit.
    ///
    /// - `body` fails: its error is returned verbatim and rules never run.
    /// - A rule fails internally: `StoreError::Rule`, nothing committed.
    /// - Blocking violations: `StoreError::Blocked`, nothing committed.
    /// - Otherwise the mutations are committed and the (possibly non-empty)
    ///   non-blocking result is returned.
    fn run_in_transaction(
        &self,
        ctx: &Context,
        body: &mut dyn FnMut(&mut dyn Transaction) -> StoreResult<()>,
    ) -> StoreResult<EvaluationResult>;

    /// Read-only access to committed state.
    fn view(
        &self,
        ctx: &Context,
        reader: &mut dyn FnMut(&dyn TransactionView) -> StoreResult<()>,
    ) -> StoreResult<()>;

    fn get_record(&self, kind: EntityType, id: &str) -> Option<EntityRecord>;

    fn list_records(&self, kind: EntityType) -> Vec<EntityRecord>;
}

/// Typed convenience over any [`PersistentStore`].
pub trait StoreExt: PersistentStore {
    fn get<E: Entity>(&self, id: &str) -> Option<E> {
        self.get_record(E::KIND, id).and_then(E::from_record)
    }

    fn list<E: Entity>(&self) -> Vec<E> {
        self.list_records(E::KIND)
            .into_iter()
            .filter_map(E::from_record)
            .collect()
    }

    /// Like [`PersistentStore::run_in_transaction`], but hands back the value
    /// the body produced alongside the evaluation result.
    fn transact<T, F>(&self, ctx: &Context, body: F) -> StoreResult<(T, EvaluationResult)>
    where
        F: FnOnce(&mut dyn Transaction) -> StoreResult<T>,
    {
        let mut body = Some(body);
        let mut output = None;
        let result = self.run_in_transaction(ctx, &mut |tx: &mut dyn Transaction| {
            let body = body
                .take()
                .ok_or_else(|| StoreError::aborted("transaction body invoked twice"))?;
            output = Some(body(tx)?);
            Ok(())
        })?;
        let value =
            output.ok_or_else(|| StoreError::aborted("transaction body produced no value"))?;
        Ok((value, result))
    }

    /// Like [`PersistentStore::view`], returning the reader's value.
    fn read<T, F>(&self, ctx: &Context, reader: F) -> StoreResult<T>
    where
        F: FnOnce(&dyn TransactionView) -> StoreResult<T>,
    {
        let mut reader = Some(reader);
        let mut output = None;
        self.view(ctx, &mut |view: &dyn TransactionView| {
            let reader = reader
                .take()
                .ok_or_else(|| StoreError::aborted("view reader invoked twice"))?;
            output = Some(reader(view)?);
            Ok(())
        })?;
        output.ok_or_else(|| StoreError::aborted("view reader produced no value"))
    }
}

impl<T: PersistentStore + ?Sized> StoreExt for T {}

/// Open the backend selected by `config`, owning `engine`.
pub fn open_persistent_store(
    config: &StoreConfig,
    engine: Arc<RulesEngine>,
) -> ColonyResult<Arc<dyn PersistentStore>> {
    let store: Arc<dyn PersistentStore> = match config.driver {
        StorageDriver::Memory => Arc::new(MemoryStore::new(engine)),
        StorageDriver::Snapshot => Arc::new(SnapshotStore::open(config.require_path()?, engine)?),
        StorageDriver::Durable => Arc::new(DurableStore::open(config.require_path()?, engine)?),
    };
    tracing::info!(
        driver = %store.driver(),
        rules = ?store.rules_engine().rule_names(),
        "persistent store opened"
    );
    Ok(store)
}
