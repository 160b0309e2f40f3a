//! Rule evaluation over a transaction's prospective state.
//!
//! A [`Rule`] inspects the post-mutation [`TransactionView`] together with the
//! ordered [`Change`]s and reports [`Violation`]s. The [`RulesEngine`] runs its
//! rules in registration order and merges their output into one
//! [`EvaluationResult`]. Only [`Severity::Block`] prevents a commit.
//!
//! ## Built-in rules
//!
//! - **housing_capacity**: occupancy of touched housing units
//! - **protocol_subject_cap**: enrolment of touched protocols
//! - **lineage_integrity**: parent links and breeding-unit membership
//! - **lifecycle_transition**: no moves out of terminal states (extended set)
//! - **protocol_coverage**: procedures and treatments run under an approved protocol (extended set)

mod coverage;
mod housing;
mod lifecycle;
mod lineage;
mod overlay;
mod protocol;

pub use coverage::ProtocolCoverageRule;
pub use housing::HousingCapacityRule;
pub use lifecycle::LifecycleTransitionRule;
pub use lineage::LineageIntegrityRule;
pub use overlay::ChangeOverlay;
pub use protocol::ProtocolSubjectCapRule;

use std::fmt;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::change::Change;
use crate::context::Context;
use crate::entity::EntityType;
use crate::error::{RuleError, StoreResult};
use crate::view::TransactionView;

// ---------------------------------------------------------------------------
// Violations and results
// ---------------------------------------------------------------------------

/// How serious a violation is. Ordered `Log < Warn < Block`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Log,
    Warn,
    Block,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Log => "log",
            Severity::Warn => "warn",
            Severity::Block => "block",
        })
    }
}

/// A single finding produced by a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl Violation {
    pub fn new(rule: impl Into<String>, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            severity,
            message: message.into(),
            entity: None,
            entity_id: None,
            context: None,
        }
    }

    /// Shorthand for a blocking violation.
    pub fn block(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(rule, Severity::Block, message)
    }

    pub fn on(mut self, entity: EntityType, id: impl Into<String>) -> Self {
        self.entity = Some(entity);
        self.entity_id = Some(id.into());
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Block
    }
}

/// Ordered collection of violations from one evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub violations: Vec<Violation>,
}

impl EvaluationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, violation: Violation) {
        self.violations.push(violation);
    }

    /// Append `other`'s violations after ours, preserving order.
    pub fn merge(&mut self, other: EvaluationResult) {
        self.violations.extend(other.violations);
    }

    /// By-value form of [`EvaluationResult::merge`].
    pub fn merged(mut self, other: EvaluationResult) -> Self {
        self.merge(other);
        self
    }

    pub fn has_blocking(&self) -> bool {
        self.violations.iter().any(Violation::is_blocking)
    }

    pub fn blocking(&self) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(|v| v.is_blocking())
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.violations.len()
    }
}

impl From<Vec<Violation>> for EvaluationResult {
    fn from(violations: Vec<Violation>) -> Self {
        Self { violations }
    }
}

// ---------------------------------------------------------------------------
// Rule trait
// ---------------------------------------------------------------------------

/// A unit of validation logic.
///
/// Rules must be pure functions of the view and the changes. Returning `Err`
/// signals an internal failure and aborts the whole evaluation; policy
/// findings belong in the returned [`EvaluationResult`].
pub trait Rule: Send + Sync {
    /// Stable, unique name reported on every violation.
    fn name(&self) -> &str;

    fn evaluate(
        &self,
        ctx: &Context,
        view: &dyn TransactionView,
        changes: &[Change],
    ) -> Result<EvaluationResult, RuleError>;
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Ordered, append-only collection of rules.
pub struct RulesEngine {
    rules: RwLock<Vec<Arc<dyn Rule>>>,
}

impl RulesEngine {
    /// An engine with no rules.
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
        }
    }

    /// housing_capacity, protocol_subject_cap and lineage_integrity, in that order.
    pub fn with_defaults() -> Self {
        Self::new()
            .with_rule(HousingCapacityRule)
            .with_rule(ProtocolSubjectCapRule)
            .with_rule(LineageIntegrityRule)
    }

    /// The defaults followed by lifecycle_transition and protocol_coverage.
    pub fn extended() -> Self {
        Self::with_defaults()
            .with_rule(LifecycleTransitionRule)
            .with_rule(ProtocolCoverageRule)
    }

    /// Builder form of [`RulesEngine::register`].
    pub fn with_rule(self, rule: impl Rule + 'static) -> Self {
        self.register(Arc::new(rule));
        self
    }

    /// Append a rule. It runs after every rule registered before it.
    pub fn register(&self, rule: Arc<dyn Rule>) {
        let mut rules = self.rules.write().expect("rules lock poisoned");
        tracing::debug!(rule = rule.name(), position = rules.len(), "rule registered");
        rules.push(rule);
    }

    pub fn rule_names(&self) -> Vec<String> {
        self.rules
            .read()
            .expect("rules lock poisoned")
            .iter()
            .map(|r| r.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rules.read().expect("rules lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every rule in order and merge the results.
    ///
    /// Stops at the first rule that fails internally and returns that error
    /// with no partial result. The context is checked before each rule.
    pub fn evaluate(
        &self,
        ctx: &Context,
        view: &dyn TransactionView,
        changes: &[Change],
    ) -> StoreResult<EvaluationResult> {
        // Snapshot the list so rules registered mid-evaluation don't run.
        let rules: Vec<Arc<dyn Rule>> = self.rules.read().expect("rules lock poisoned").clone();

        let mut result = EvaluationResult::new();
        for rule in &rules {
            ctx.check()?;
            let found = rule.evaluate(ctx, view, changes).map_err(|e| {
                tracing::warn!(rule = rule.name(), error = %e, "rule failed");
                e
            })?;
            result.merge(found);
        }

        tracing::debug!(
            rules = rules.len(),
            changes = changes.len(),
            violations = result.len(),
            blocking = result.has_blocking(),
            "rules evaluated"
        );
        Ok(result)
    }
}

impl Default for RulesEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RulesEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RulesEngine")
            .field("rules", &self.rule_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::state::State;

    struct Fixed {
        name: &'static str,
        severity: Severity,
    }

    impl Rule for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn evaluate(
            &self,
            _ctx: &Context,
            _view: &dyn TransactionView,
            _changes: &[Change],
        ) -> Result<EvaluationResult, RuleError> {
            Ok(vec![Violation::new(self.name, self.severity, "fixed")].into())
        }
    }

    struct Failing;

    impl Rule for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn evaluate(
            &self,
            _ctx: &Context,
            _view: &dyn TransactionView,
            _changes: &[Change],
        ) -> Result<EvaluationResult, RuleError> {
            Err(RuleError::new("failing", "boom"))
        }
    }

    fn fixed(name: &'static str, severity: Severity) -> Fixed {
        Fixed { name, severity }
    }

    #[test]
    fn default_engine_order() {
        assert_eq!(
            RulesEngine::with_defaults().rule_names(),
            vec!["housing_capacity", "protocol_subject_cap", "lineage_integrity"]
        );
        let extended = RulesEngine::extended().rule_names();
        assert_eq!(extended.len(), 5);
        assert_eq!(extended[3], "lifecycle_transition");
        assert_eq!(extended[4], "protocol_coverage");
        assert!(RulesEngine::new().is_empty());
    }

    #[test]
    fn results_merge_in_registration_order() {
        let engine = RulesEngine::new()
            .with_rule(fixed("a", Severity::Warn))
            .with_rule(fixed("b", Severity::Log));
        let state = State::default();
        let result = engine.evaluate(&Context::new(), &state.view(), &[]).unwrap();
        let names: Vec<_> = result.violations.iter().map(|v| v.rule.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(!result.has_blocking());
    }

    #[test]
    fn engine_is_fail_fast() {
        let engine = RulesEngine::new()
            .with_rule(fixed("a", Severity::Block))
            .with_rule(Failing)
            .with_rule(fixed("c", Severity::Warn));
        let state = State::default();
        let err = engine
            .evaluate(&Context::new(), &state.view(), &[])
            .unwrap_err();
        match err {
            StoreError::Rule(e) => assert_eq!(e.rule, "failing"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn cancelled_context_stops_evaluation() {
        let engine = RulesEngine::new().with_rule(fixed("a", Severity::Warn));
        let ctx = Context::new();
        ctx.cancel();
        let state = State::default();
        assert!(engine.evaluate(&ctx, &state.view(), &[]).unwrap_err().is_cancelled());
    }

    #[test]
    fn merge_is_associative() {
        let r = |name: &str| EvaluationResult::from(vec![Violation::new(name, Severity::Log, "x")]);
        let left = r("a").merged(r("b")).merged(r("c"));
        let right = r("a").merged(r("b").merged(r("c")));
        assert_eq!(left, right);
        assert_eq!(left.len(), 3);
        assert_eq!(EvaluationResult::new().merged(r("a")), r("a"));
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Block > Severity::Warn);
        assert!(Severity::Warn > Severity::Log);
        let v = Violation::block("r", "m").on(EntityType::Organism, "o-1");
        assert!(v.is_blocking());
        assert_eq!(v.entity_id.as_deref(), Some("o-1"));
    }
}
