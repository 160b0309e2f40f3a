//! ACID-durable backend built on redb.
//!
//! Each entity type gets its own table keyed by id, holding JSON-encoded
//! records. Committed state is also cached in memory for views and typed
//! getters. A transaction opens a native write transaction, stages the body
//! in memory, evaluates rules, writes the captured changes into the native
//! transaction and commits it before swapping the cache.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use redb::{Database, ReadableTable, TableDefinition, TableError};

use crate::context::Context;
use crate::entity::{EntityRecord, EntityType};
use crate::error::StoreError;
use crate::rules::{EvaluationResult, RulesEngine};
use crate::view::TransactionView;

use super::state::{State, prepare};
use super::{PersistentStore, StorageDriver, StoreResult, Transaction};

/// File name of the database inside the data directory.
pub const DATABASE_FILE: &str = "colony.redb";

fn table(kind: EntityType) -> TableDefinition<'static, &'static str, &'static [u8]> {
    TableDefinition::new(kind.bucket())
}

fn redb_error(op: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::Redb {
        message: format!("{op} failed: {e}"),
    }
}

/// redb-backed store with full transactional guarantees.
pub struct DurableStore {
    db: Database,
    path: PathBuf,
    cache: RwLock<State>,
    /// Serializes writers for the whole attempt, not just the native commit.
    writer: Mutex<()>,
    engine: Arc<RulesEngine>,
}

impl DurableStore {
    /// Open or create a durable store in `data_dir`.
    pub fn open(data_dir: &Path, engine: Arc<RulesEngine>) -> StoreResult<Self> {
        std::fs::create_dir_all(data_dir).map_err(|e| StoreError::Io { source: e })?;
        let path = data_dir.join(DATABASE_FILE);
        let db = Database::create(&path).map_err(|e| StoreError::Redb {
            message: format!("failed to open redb at {}: {e}", path.display()),
        })?;
        let cache = load_state(&db)?;
        tracing::info!(
            path = %path.display(),
            records = cache.len(),
            "durable store opened"
        );
        Ok(Self {
            db,
            path,
            cache: RwLock::new(cache),
            writer: Mutex::new(()),
            engine,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn load_state(db: &Database) -> StoreResult<State> {
    let txn = db
        .begin_read()
        .map_err(|e| redb_error("begin_read", e))?;
    let mut state = State::default();
    for kind in EntityType::ALL {
        let records = match txn.open_table(table(kind)) {
            Ok(t) => t,
            Err(TableError::TableDoesNotExist(_)) => continue,
            Err(e) => return Err(redb_error("open_table", e)),
        };
        for entry in records.iter().map_err(|e| redb_error("iter", e))? {
            let (key, value) = entry.map_err(|e| redb_error("read entry", e))?;
            let record: EntityRecord =
                serde_json::from_slice(value.value()).map_err(|e| StoreError::Serialization {
                    message: format!("failed to decode {kind} {:?}: {e}", key.value()),
                })?;
            if record.kind() != kind || record.id() != key.value() {
                return Err(StoreError::Serialization {
                    message: format!(
                        "table {} key {:?} holds {} {:?}",
                        kind.bucket(),
                        key.value(),
                        record.kind(),
                        record.id()
                    ),
                });
            }
            state.insert(record);
        }
    }
    Ok(state)
}

impl PersistentStore for DurableStore {
    fn driver(&self) -> StorageDriver {
        StorageDriver::Durable
    }

    fn rules_engine(&self) -> &Arc<RulesEngine> {
        &self.engine
    }

    fn run_in_transaction(
        &self,
        ctx: &Context,
        body: &mut dyn FnMut(&mut dyn Transaction) -> StoreResult<()>,
    ) -> StoreResult<EvaluationResult> {
        let _writer = self.writer.lock().expect("durable writer lock poisoned");

        // Dropping an uncommitted write transaction aborts it.
        let txn = self
            .db
            .begin_write()
            .map_err(|e| redb_error("begin_write", e))?;

        let prepared = {
            let committed = self.cache.read().expect("durable cache lock poisoned");
            prepare(&self.engine, ctx, &committed, body)?
        };

        for change in &prepared.changes {
            let mut records = txn
                .open_table(table(change.entity))
                .map_err(|e| redb_error("open_table", e))?;
            match &change.after {
                Some(record) => {
                    let bytes = serde_json::to_vec(record).map_err(|e| StoreError::Serialization {
                        message: format!("failed to encode {} {:?}: {e}", change.entity, change.id()),
                    })?;
                    records
                        .insert(change.id(), bytes.as_slice())
                        .map_err(|e| redb_error("insert", e))?;
                }
                None => {
                    records
                        .remove(change.id())
                        .map_err(|e| redb_error("remove", e))?;
                }
            }
        }

        ctx.check()?;
        txn.commit().map_err(|e| redb_error("commit", e))?;

        *self.cache.write().expect("durable cache lock poisoned") = prepared.state;
        tracing::debug!(
            path = %self.path.display(),
            changes = prepared.changes.len(),
            violations = prepared.result.len(),
            "durable transaction committed"
        );
        Ok(prepared.result)
    }

    fn view(
        &self,
        ctx: &Context,
        reader: &mut dyn FnMut(&dyn TransactionView) -> StoreResult<()>,
    ) -> StoreResult<()> {
        ctx.check()?;
        let state = self.cache.read().expect("durable cache lock poisoned");
        reader(&state.view())
    }

    fn get_record(&self, kind: EntityType, id: &str) -> Option<EntityRecord> {
        self.cache
            .read()
            .expect("durable cache lock poisoned")
            .get(kind, id)
            .cloned()
    }

    fn list_records(&self, kind: EntityType) -> Vec<EntityRecord> {
        self.cache
            .read()
            .expect("durable cache lock poisoned")
            .records(kind)
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for DurableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableStore")
            .field("path", &self.path)
            .finish()
    }
}
