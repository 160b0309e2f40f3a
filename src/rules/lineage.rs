use std::collections::{BTreeMap, HashMap, HashSet};

use crate::change::Change;
use crate::context::Context;
use crate::entity::{BreedingUnit, EntityType, Organism};
use crate::error::RuleError;
use crate::view::{TransactionView, ViewExt};

use super::{ChangeOverlay, EvaluationResult, Rule, Violation};

/// Validates parent links and breeding-unit membership.
///
/// Organisms checked are the ones created or updated in this transaction
/// plus every organism listing a touched organism as a parent, so deleting
/// or altering a parent re-validates its children. Species must match
/// exactly, an empty species included. Line and strain are compared only
/// when both sides set them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineageIntegrityRule;

impl LineageIntegrityRule {
    pub const NAME: &'static str = "lineage_integrity";
}

fn organism_violation(id: &str, message: String) -> Violation {
    Violation::block(LineageIntegrityRule::NAME, message).on(EntityType::Organism, id)
}

fn breeding_violation(id: &str, message: String) -> Violation {
    Violation::block(LineageIntegrityRule::NAME, message).on(EntityType::BreedingUnit, id)
}

fn species_label(species: &str) -> &str {
    if species.is_empty() {
        "<unset>"
    } else {
        species
    }
}

fn mismatched(a: Option<&str>, b: Option<&str>) -> bool {
    match (a.filter(|s| !s.is_empty()), b.filter(|s| !s.is_empty())) {
        (Some(a), Some(b)) => a != b,
        _ => false,
    }
}

fn check_parents(child: &Organism, lookup: &dyn TransactionView, result: &mut EvaluationResult) {
    let id = child.base.id.as_str();
    let mut seen = HashSet::new();
    for parent_id in child.parent_ids.iter().filter(|p| !p.is_empty()) {
        if parent_id == id {
            result.push(organism_violation(
                id,
                format!("organism {id} references itself as a parent"),
            ));
            continue;
        }
        if !seen.insert(parent_id.as_str()) {
            result.push(organism_violation(
                id,
                format!("organism {id} lists parent {parent_id} multiple times"),
            ));
            continue;
        }
        let Some(parent) = lookup.find::<Organism>(parent_id) else {
            result.push(organism_violation(
                id,
                format!("organism {id} references missing parent {parent_id}"),
            ));
            continue;
        };
        if child.species != parent.species {
            result.push(organism_violation(
                id,
                format!("organism {id} parent {parent_id} has mismatched species"),
            ));
        }
        if mismatched(child.line_id.as_deref(), parent.line_id.as_deref()) {
            result.push(organism_violation(
                id,
                format!("organism {id} parent {parent_id} has mismatched line"),
            ));
        }
        if mismatched(child.strain_id.as_deref(), parent.strain_id.as_deref()) {
            result.push(organism_violation(
                id,
                format!("organism {id} parent {parent_id} has mismatched strain"),
            ));
        }
    }
}

fn check_breeding_unit(
    unit: &BreedingUnit,
    lookup: &dyn TransactionView,
    result: &mut EvaluationResult,
) {
    let id = unit.base.id.as_str();
    let mut seen: HashMap<&str, &str> = HashMap::new();
    let mut species: Option<String> = None;

    let members = unit
        .female_ids
        .iter()
        .map(|m| ("female", m))
        .chain(unit.male_ids.iter().map(|m| ("male", m)));

    for (role, member_id) in members {
        if member_id.is_empty() {
            continue;
        }
        if let Some(previous) = seen.insert(member_id, role) {
            let message = if previous == role {
                format!("breeding unit {id} lists {role} {member_id} more than once")
            } else {
                format!("breeding unit {id} reuses organism {member_id} as both {previous} and {role}")
            };
            result.push(breeding_violation(id, message));
            continue;
        }
        let Some(member) = lookup.find::<Organism>(member_id) else {
            result.push(breeding_violation(
                id,
                format!("breeding unit {id} references missing organism {member_id}"),
            ));
            continue;
        };
        match species.as_deref() {
            Some(expected) if expected != member.species => {
                result.push(breeding_violation(
                    id,
                    format!(
                        "breeding unit {id} mixes species {} and {}",
                        species_label(expected),
                        species_label(&member.species)
                    ),
                ));
            }
            Some(_) => {}
            None => species = Some(member.species.clone()),
        }
        if mismatched(unit.line_id.as_deref(), member.line_id.as_deref()) {
            result.push(breeding_violation(
                id,
                format!(
                    "breeding unit {id} expected line {} for organism {member_id}",
                    unit.line_id.as_deref().unwrap_or_default()
                ),
            ));
        }
        if mismatched(unit.strain_id.as_deref(), member.strain_id.as_deref()) {
            result.push(breeding_violation(
                id,
                format!(
                    "breeding unit {id} expected strain {} for organism {member_id}",
                    unit.strain_id.as_deref().unwrap_or_default()
                ),
            ));
        }
    }
}

impl Rule for LineageIntegrityRule {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn evaluate(
        &self,
        _ctx: &Context,
        view: &dyn TransactionView,
        changes: &[Change],
    ) -> Result<EvaluationResult, RuleError> {
        let overlay = ChangeOverlay::new(view, changes);
        let mut result = EvaluationResult::new();

        let touched: HashSet<&str> = changes
            .iter()
            .filter(|c| c.entity == EntityType::Organism)
            .map(Change::id)
            .collect();

        if !touched.is_empty() {
            // Ordered by id so violations come out deterministically.
            let mut subjects: BTreeMap<String, Organism> = BTreeMap::new();
            for organism in overlay.list::<Organism>() {
                let changed = touched.contains(organism.base.id.as_str());
                let child_of_touched = organism
                    .parent_ids
                    .iter()
                    .any(|p| touched.contains(p.as_str()));
                if changed || child_of_touched {
                    subjects.insert(organism.base.id.clone(), organism);
                }
            }
            for child in subjects.values() {
                check_parents(child, &overlay, &mut result);
            }
        }

        for change in changes {
            if let Some(unit) = change.after_as::<BreedingUnit>() {
                check_breeding_unit(unit, &overlay, &mut result);
            }
        }

        Ok(result)
    }
}
