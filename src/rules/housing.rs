use std::collections::BTreeSet;

use serde_json::json;

use crate::change::Change;
use crate::context::Context;
use crate::entity::{EntityType, HousingUnit, Organism};
use crate::error::RuleError;
use crate::view::{TransactionView, ViewExt};

use super::{EvaluationResult, Rule, Violation};

/// Blocks when a touched housing unit holds more organisms than its capacity.
///
/// A unit is touched when it changed itself or when an organism moved into or
/// out of it. Zero or negative capacity rejects any occupant.
#[derive(Debug, Clone, Copy, Default)]
pub struct HousingCapacityRule;

impl HousingCapacityRule {
    pub const NAME: &'static str = "housing_capacity";
}

fn touched_units(changes: &[Change]) -> BTreeSet<&str> {
    let mut touched = BTreeSet::new();
    for change in changes {
        match change.entity {
            EntityType::HousingUnit => {
                touched.insert(change.id());
            }
            EntityType::Organism => {
                touched.extend(
                    change
                        .snapshots_as::<Organism>()
                        .filter_map(|o| o.housing_id.as_deref()),
                );
            }
            _ => {}
        }
    }
    touched
}

impl Rule for HousingCapacityRule {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn evaluate(
        &self,
        _ctx: &Context,
        view: &dyn TransactionView,
        changes: &[Change],
    ) -> Result<EvaluationResult, RuleError> {
        let touched = touched_units(changes);
        let mut result = EvaluationResult::new();
        if touched.is_empty() {
            return Ok(result);
        }

        let organisms = view.list::<Organism>();
        for id in touched {
            // Deleted or dangling units have nothing to enforce.
            let Some(unit) = view.find::<HousingUnit>(id) else {
                continue;
            };
            let occupancy = organisms
                .iter()
                .filter(|o| o.housing_id.as_deref() == Some(id))
                .count() as i64;
            if occupancy > unit.capacity.max(0) {
                result.push(
                    Violation::block(
                        Self::NAME,
                        format!(
                            "housing {} ({}) over capacity: {}/{} occupants",
                            unit.name, id, occupancy, unit.capacity
                        ),
                    )
                    .on(EntityType::HousingUnit, id)
                    .with_context(json!({ "occupancy": occupancy, "capacity": unit.capacity })),
                );
            }
        }
        Ok(result)
    }
}
