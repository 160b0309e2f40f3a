//! Snapshot file backend.
//!
//! Behaves like [`MemoryStore`](super::MemoryStore), but every successful
//! commit first rewrites a JSON snapshot of the full state: written to a
//! temporary file, fsynced, then renamed over the previous snapshot. The
//! in-memory state is swapped only once the rename succeeded. Reopening reads
//! the snapshot through a read-only memory map.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::entity::{EntityRecord, EntityType};
use crate::error::StoreError;
use crate::rules::{EvaluationResult, RulesEngine};
use crate::view::TransactionView;

use super::state::{State, prepare};
use super::{PersistentStore, StorageDriver, StoreResult, Transaction};

/// File name of the snapshot inside the data directory.
pub const SNAPSHOT_FILE: &str = "colony-snapshot.json";

const SNAPSHOT_VERSION: u32 = 1;

/// On-disk layout: one bucket per entity type.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SnapshotDocument {
    version: u32,
    buckets: BTreeMap<String, Vec<EntityRecord>>,
}

impl SnapshotDocument {
    fn from_state(state: &State) -> Self {
        let buckets = EntityType::ALL
            .iter()
            .map(|kind| (kind.bucket().to_string(), state.records(*kind).cloned().collect()))
            .collect();
        Self {
            version: SNAPSHOT_VERSION,
            buckets,
        }
    }

    fn into_state(self) -> StoreResult<State> {
        if self.version != SNAPSHOT_VERSION {
            return Err(StoreError::Serialization {
                message: format!("unsupported snapshot version {}", self.version),
            });
        }
        let mut state = State::default();
        for (bucket, records) in self.buckets {
            let kind = EntityType::ALL
                .into_iter()
                .find(|k| k.bucket() == bucket)
                .ok_or_else(|| StoreError::Serialization {
                    message: format!("unknown snapshot bucket {bucket:?}"),
                })?;
            for record in records {
                if record.kind() != kind {
                    return Err(StoreError::Serialization {
                        message: format!(
                            "bucket {bucket:?} holds a {} record ({})",
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
}

pub struct SnapshotStore {
    path: PathBuf,
    state: RwLock<State>,
    engine: Arc<RulesEngine>,
}

impl SnapshotStore {
    /// Open or create a snapshot store in `data_dir`.
    pub fn open(data_dir: &Path, engine: Arc<RulesEngine>) -> StoreResult<Self> {
        fs::create_dir_all(data_dir).map_err(|e| StoreError::Io { source: e })?;
        let path = data_dir.join(SNAPSHOT_FILE);
        let state = if path.exists() {
            load_snapshot(&path)?
        } else {
            State::default()
        };
        tracing::info!(
            path = %path.display(),
            records = state.len(),
            "snapshot store opened"
        );
        Ok(Self {
            path,
            state: RwLock::new(state),
            engine,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, state: &State) -> StoreResult<()> {
        let bytes = serde_json::to_vec_pretty(&SnapshotDocument::from_state(state)).map_err(|e| {
            StoreError::Serialization {
                message: format!("failed to encode snapshot: {e}"),
            }
        })?;

        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp).map_err(|e| StoreError::Io { source: e })?;
            file.write_all(&bytes)
                .map_err(|e| StoreError::Io { source: e })?;
            file.sync_all().map_err(|e| StoreError::Io { source: e })?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| StoreError::Io { source: e })?;
        Ok(())
    }
}

fn load_snapshot(path: &Path) -> StoreResult<State> {
    let file = File::open(path).map_err(|e| StoreError::Io { source: e })?;
    let len = file
        .metadata()
        .map_err(|e| StoreError::Io { source: e })?
        .len();
    if len == 0 {
        return Ok(State::default());
    }

    // Safety: the snapshot is only ever replaced by rename, never written in place.
    let mmap = unsafe {
        Mmap::map(&file).map_err(|e| StoreError::Mmap {
            message: format!("failed to map {}: {e}", path.display()),
        })?
    };
    let document: SnapshotDocument =
        serde_json::from_slice(&mmap).map_err(|e| StoreError::Serialization {
            message: format!("failed to decode snapshot {}: {e}", path.display()),
        })?;
    document.into_state()
}

impl PersistentStore for SnapshotStore {
    fn driver(&self) -> StorageDriver {
        StorageDriver::Snapshot
    }

    fn rules_engine(&self) -> &Arc<RulesEngine> {
        &self.engine
    }

    fn run_in_transaction(
        &self,
        ctx: &Context,
        body: &mut dyn FnMut(&mut dyn Transaction) -> StoreResult<()>,
    ) -> StoreResult<EvaluationResult> {
        let mut committed = self.state.write().expect("snapshot store lock poisoned");
        let prepared = prepare(&self.engine, ctx, &committed, body)?;
        self.persist(&prepared.state)?;
        *committed = prepared.state;
        tracing::debug!(
            path = %self.path.display(),
            changes = prepared.changes.len(),
            violations = prepared.result.len(),
            "snapshot transaction committed"
        );
        Ok(prepared.result)
    }

    fn view(
        &self,
        ctx: &Context,
        reader: &mut dyn FnMut(&dyn TransactionView) -> StoreResult<()>,
    ) -> StoreResult<()> {
        ctx.check()?;
        let state = self.state.read().expect("snapshot store lock poisoned");
        reader(&state.view())
    }

    fn get_record(&self, kind: EntityType, id: &str) -> Option<EntityRecord> {
        self.state
            .read()
            .expect("snapshot store lock poisoned")
            .get(kind, id)
            .cloned()
    }

    fn list_records(&self, kind: EntityType) -> Vec<EntityRecord> {
        self.state
            .read()
            .expect("snapshot store lock poisoned")
            .records(kind)
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("path", &self.path)
            .finish()
    }
}
