//! Service layer: typed colony operations over a [`PersistentStore`].
//!
//! Every operation runs in one store transaction, is timed, logged through
//! `tracing`, and reported to an optional [`AuditSink`]. The sink only
//! observes; it cannot change whether a transaction commits.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::change::Action;
use crate::context::Context;
use crate::entity::{Entity, EntityType, HousingUnit, Organism, Protocol};
use crate::error::{StoreError, StoreResult};
use crate::rules::{EvaluationResult, Rule};
use crate::store::{PersistentStore, StoreExt, Transaction, TransactionExt};
use crate::view::ViewExt;

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    Error,
}

/// Outcome of one service operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub operation: String,
    pub entity: EntityType,
    pub action: Action,
    pub entity_id: Option<String>,
    pub status: AuditStatus,
    pub error: Option<String>,
    /// Non-blocking violations on success; the full result when rules blocked.
    pub violations: usize,
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
}

/// Receives an [`AuditEntry`] after every service operation.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditEntry);
}

/// What an operation does, for logging and audit.
#[derive(Debug, Clone)]
struct Operation {
    name: String,
    entity: EntityType,
    action: Action,
    entity_id: Option<String>,
}

impl Operation {
    fn new(action: Action, entity: EntityType, entity_id: Option<&str>) -> Self {
        Self {
            name: format!("{action}_{entity}"),
            entity,
            action,
            entity_id: entity_id.map(str::to_owned),
        }
    }

    fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Orchestrates typed operations against a store.
pub struct Service {
    store: Arc<dyn PersistentStore>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl Service {
    pub fn new(store: Arc<dyn PersistentStore>) -> Self {
        Self { store, audit: None }
    }

    pub fn with_audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn store(&self) -> &Arc<dyn PersistentStore> {
        &self.store
    }

    /// Append a rule to the store's engine. Intended for installation time.
    pub fn register_rule(&self, rule: Arc<dyn Rule>) {
        tracing::info!(rule = rule.name(), "registering rule");
        self.store.rules_engine().register(rule);
    }

    fn run<T, F>(&self, ctx: &Context, op: Operation, body: F) -> StoreResult<(T, EvaluationResult)>
    where
        T: HasId,
        F: FnOnce(&mut dyn Transaction) -> StoreResult<T>,
    {
        let start = Instant::now();
        let outcome = self.store.transact(ctx, body);
        let duration = start.elapsed();

        let (entity_id, status, error, violations) = match &outcome {
            Ok((value, result)) => (
                value.id().map(str::to_owned).or(op.entity_id.clone()),
                AuditStatus::Success,
                None,
                result.len(),
            ),
            Err(e) => (
                op.entity_id.clone(),
                AuditStatus::Error,
                Some(e.to_string()),
                e.violations().map_or(0, EvaluationResult::len),
            ),
        };

        match &outcome {
            Ok(_) => tracing::debug!(
                op = %op.name,
                entity_id = entity_id.as_deref().unwrap_or(""),
                violations,
                duration_ms = duration.as_millis() as u64,
                "service operation succeeded"
            ),
            Err(e) => tracing::error!(
                op = %op.name,
                entity_id = entity_id.as_deref().unwrap_or(""),
                error = %e,
                duration_ms = duration.as_millis() as u64,
                "service operation failed"
            ),
        }

        if let Some(sink) = &self.audit {
            sink.record(&AuditEntry {
                operation: op.name,
                entity: op.entity,
                action: op.action,
                entity_id,
                status,
                error,
                violations,
                duration,
                timestamp: Utc::now(),
            });
        }

        outcome
    }

    pub fn create<E: Entity>(&self, ctx: &Context, entity: E) -> StoreResult<(E, EvaluationResult)> {
        let id = Some(entity.id()).filter(|id| !id.is_empty());
        let op = Operation::new(Action::Create, E::KIND, id);
        self.run(ctx, op, move |tx| tx.create(entity).map(Typed))
            .map(|(Typed(e), result)| (e, result))
    }

    pub fn update<E, F>(&self, ctx: &Context, id: &str, mutate: F) -> StoreResult<(E, EvaluationResult)>
    where
        E: Entity,
        F: FnOnce(&mut E) -> StoreResult<()>,
    {
        let op = Operation::new(Action::Update, E::KIND, Some(id));
        self.run(ctx, op, |tx| tx.update::<E, F>(id, mutate).map(Typed))
            .map(|(Typed(e), result)| (e, result))
    }

    pub fn delete<E: Entity>(&self, ctx: &Context, id: &str) -> StoreResult<EvaluationResult> {
        let op = Operation::new(Action::Delete, E::KIND, Some(id));
        self.run(ctx, op, |tx| tx.delete::<E>(id))
            .map(|((), result)| result)
    }

    /// Move an organism into a housing unit. Capacity is checked by rules.
    pub fn assign_organism_housing(
        &self,
        ctx: &Context,
        organism_id: &str,
        housing_id: &str,
    ) -> StoreResult<(Organism, EvaluationResult)> {
        let op = Operation::new(Action::Update, EntityType::Organism, Some(organism_id))
            .named("assign_organism_housing");
        self.run(ctx, op, |tx| {
            if !tx.contains::<HousingUnit>(housing_id) {
                return Err(StoreError::not_found(EntityType::HousingUnit, housing_id));
            }
            tx.update::<Organism, _>(organism_id, |o| {
                o.housing_id = Some(housing_id.to_string());
                Ok(())
            })
            .map(Typed)
        })
        .map(|(Typed(o), result)| (o, result))
    }

    /// Enrol an organism in a protocol. The subject cap is checked by rules.
    pub fn assign_organism_protocol(
        &self,
        ctx: &Context,
        organism_id: &str,
        protocol_id: &str,
    ) -> StoreResult<(Organism, EvaluationResult)> {
        let op = Operation::new(Action::Update, EntityType::Organism, Some(organism_id))
            .named("assign_organism_protocol");
        self.run(ctx, op, |tx| {
            if !tx.contains::<Protocol>(protocol_id) {
                return Err(StoreError::not_found(EntityType::Protocol, protocol_id));
            }
            tx.update::<Organism, _>(organism_id, |o| {
                o.protocol_id = Some(protocol_id.to_string());
                Ok(())
            })
            .map(Typed)
        })
        .map(|(Typed(o), result)| (o, result))
    }

    pub fn get<E: Entity>(&self, id: &str) -> Option<E> {
        self.store.get(id)
    }

    pub fn list<E: Entity>(&self) -> Vec<E> {
        self.store.list()
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("driver", &self.store.driver())
            .field("audited", &self.audit.is_some())
            .finish()
    }
}

/// Lets `run` pull the affected id out of whatever the body returned.
trait HasId {
    fn id(&self) -> Option<&str>;
}

impl HasId for () {
    fn id(&self) -> Option<&str> {
        None
    }
}

struct Typed<E>(E);

impl<E: Entity> HasId for Typed<E> {
    fn id(&self) -> Option<&str> {
        Some(self.0.id())
    }
}
