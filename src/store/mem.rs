//! In-memory backend.
//!
//! Committed state lives behind a single `RwLock`. A transaction holds the
//! write lock for the whole attempt, works on a clone, and swaps the clone in
//! only after rules pass. All data is lost on process exit.

use std::sync::{Arc, RwLock};

use crate::context::Context;
use crate::entity::{EntityRecord, EntityType};
use crate::rules::{EvaluationResult, RulesEngine};
use crate::view::TransactionView;

use super::state::{State, prepare};
use super::{PersistentStore, StorageDriver, StoreResult, Transaction};

pub struct MemoryStore {
    state: RwLock<State>,
    engine: Arc<RulesEngine>,
}

impl MemoryStore {
    pub fn new(engine: Arc<RulesEngine>) -> Self {
        Self {
            state: RwLock::new(State::default()),
            engine,
        }
    }

    /// A store evaluating [`RulesEngine::with_defaults`].
    pub fn with_default_rules() -> Self {
        Self::new(Arc::new(RulesEngine::with_defaults()))
    }

    /// Number of committed records across all types.
    pub fn len(&self) -> usize {
        self.state.read().expect("memory store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_default_rules()
    }
}

impl PersistentStore for MemoryStore {
    fn driver(&self) -> StorageDriver {
        StorageDriver::Memory
    }

    fn rules_engine(&self) -> &Arc<RulesEngine> {
        &self.engine
    }

    fn run_in_transaction(
        &self,
        ctx: &Context,
        body: &mut dyn FnMut(&mut dyn Transaction) -> StoreResult<()>,
    ) -> StoreResult<EvaluationResult> {
        let mut committed = self.state.write().expect("memory store lock poisoned");
        let prepared = prepare(&self.engine, ctx, &committed, body)?;
        *committed = prepared.state;
        tracing::debug!(
            changes = prepared.changes.len(),
            violations = prepared.result.len(),
            "memory transaction committed"
        );
        Ok(prepared.result)
    }

    fn view(
        &self,
        ctx: &Context,
        reader: &mut dyn FnMut(&dyn TransactionView) -> StoreResult<()>,
    ) -> StoreResult<()> {
        ctx.check()?;
        let state = self.state.read().expect("memory store lock poisoned");
        reader(&state.view())
    }

    fn get_record(&self, kind: EntityType, id: &str) -> Option<EntityRecord> {
        self.state
            .read()
            .expect("memory store lock poisoned")
            .get(kind, id)
            .cloned()
    }

    fn list_records(&self, kind: EntityType) -> Vec<EntityRecord> {
        self.state
            .read()
            .expect("memory store lock poisoned")
            .records(kind)
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("records", &self.len())
            .field("engine", &self.engine)
            .finish()
    }
}
