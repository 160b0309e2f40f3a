use std::collections::BTreeSet;

use serde_json::json;

use crate::change::Change;
use crate::context::Context;
use crate::entity::{EntityType, Organism, Protocol};
use crate::error::RuleError;
use crate::view::{TransactionView, ViewExt};

use super::{EvaluationResult, Rule, Violation};

/// Blocks when a touched protocol enrols more organisms than `max_subjects`.
///
/// Protocols with `max_subjects <= 0` are uncapped.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolSubjectCapRule;

impl ProtocolSubjectCapRule {
    pub const NAME: &'static str = "protocol_subject_cap";
}

fn touched_protocols(changes: &[Change]) -> BTreeSet<&str> {
    let mut touched = BTreeSet::new();
    for change in changes {
        match change.entity {
            EntityType::Protocol => {
                touched.insert(change.id());
            }
            EntityType::Organism => {
                touched.extend(
                    change
                        .snapshots_as::<Organism>()
                        .filter_map(|o| o.protocol_id.as_deref()),
                );
            }
            _ => {}
        }
    }
    touched
}

impl Rule for ProtocolSubjectCapRule {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn evaluate(
        &self,
        _ctx: &Context,
        view: &dyn TransactionView,
        changes: &[Change],
    ) -> Result<EvaluationResult, RuleError> {
        let touched = touched_protocols(changes);
        let mut result = EvaluationResult::new();
        if touched.is_empty() {
            return Ok(result);
        }

        let organisms = view.list::<Organism>();
        for id in touched {
            let Some(protocol) = view.find::<Protocol>(id) else {
                continue;
            };
            if protocol.max_subjects <= 0 {
                continue;
            }
            let enrolled = organisms
                .iter()
                .filter(|o| o.protocol_id.as_deref() == Some(id))
                .count() as i64;
            if enrolled > protocol.max_subjects {
                result.push(
                    Violation::block(
                        Self::NAME,
                        format!(
                            "protocol {} ({}) over subject limit: {}/{}",
                            protocol.title, protocol.code, enrolled, protocol.max_subjects
                        ),
                    )
                    .on(EntityType::Protocol, id)
                    .with_context(json!({ "enrolled": enrolled, "max_subjects": protocol.max_subjects })),
                );
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use crate::store::state::State;

    fn protocol(id: &str, max: i64) -> Protocol {
        let mut p = Protocol::new(id, max);
        p.base.id = id.into();
        p
    }

    fn enrolled(id: &str, protocol: &str) -> Organism {
        let mut o = Organism::new(id, "zebrafish");
        o.base.id = id.into();
        o.protocol_id = Some(protocol.into());
        o
    }

    #[test]
    fn quota_boundary() {
        let mut state = State::default();
        state.insert(protocol("p-1", 1).into_record());
        state.insert(enrolled("o-1", "p-1").into_record());
        let changes = vec![Change::create(enrolled("o-1", "p-1").into_record())];
        let result = ProtocolSubjectCapRule
            .evaluate(&Context::new(), &state.view(), &changes)
            .unwrap();
        assert!(result.is_empty());

        state.insert(enrolled("o-2", "p-1").into_record());
        let changes = vec![Change::create(enrolled("o-2", "p-1").into_record())];
        let result = ProtocolSubjectCapRule
            .evaluate(&Context::new(), &state.view(), &changes)
            .unwrap();
        assert!(result.has_blocking());
        assert_eq!(result.violations[0].entity, Some(EntityType::Protocol));
    }

    #[test]
    fn non_positive_cap_is_uncapped() {
        let mut state = State::default();
        state.insert(protocol("p-0", 0).into_record());
        for i in 0..5 {
            state.insert(enrolled(&format!("o-{i}"), "p-0").into_record());
        }
        let changes = vec![Change::create(protocol("p-0", 0).into_record())];
        let result = ProtocolSubjectCapRule
            .evaluate(&Context::new(), &state.view(), &changes)
            .unwrap();
        assert!(result.is_empty());
    }
}
