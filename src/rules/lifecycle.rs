use crate::change::{Action, Change};
use crate::context::Context;
use crate::error::RuleError;
use crate::view::TransactionView;

use super::{EvaluationResult, Rule, Violation};

/// Blocks updates that move a stateful record out of a terminal state.
///
/// Covers organism stage, housing state and the status of procedures,
/// treatments, protocols, permits and samples. State vocabularies are closed
/// enums, so unknown states are rejected at deserialization instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct LifecycleTransitionRule;

impl LifecycleTransitionRule {
    pub const NAME: &'static str = "lifecycle_transition";
}

impl Rule for LifecycleTransitionRule {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn evaluate(
        &self,
        _ctx: &Context,
        _view: &dyn TransactionView,
        changes: &[Change],
    ) -> Result<EvaluationResult, RuleError> {
        let mut result = EvaluationResult::new();
        for change in changes.iter().filter(|c| c.action == Action::Update) {
            let (Some(before), Some(after)) = (&change.before, &change.after) else {
                continue;
            };
            let (Some(from), Some(to)) = (before.lifecycle(), after.lifecycle()) else {
                continue;
            };
            if from.terminal && from.value != to.value {
                result.push(
                    Violation::block(
                        Self::NAME,
                        format!(
                            "cannot move {} {} from terminal state {} to {}",
                            change.entity,
                            after.id(),
                            from.value,
                            to.value
                        ),
                    )
                    .on(change.entity, after.id()),
                );
            }
        }
        Ok(result)
    }
}
