use crate::change::Change;
use crate::context::Context;
use crate::entity::{EntityType, Organism, Procedure, Protocol, ProtocolStatus, Treatment};
use crate::error::RuleError;
use crate::view::{TransactionView, ViewExt};

use super::{EvaluationResult, Rule, Violation};

/// Blocks procedures and treatments that do not run under an approved protocol
/// covering every listed organism.
///
/// Treatments inherit the protocol of the procedure they reference.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolCoverageRule;

impl ProtocolCoverageRule {
    pub const NAME: &'static str = "protocol_coverage";
}

struct Subject<'a> {
    kind: EntityType,
    id: &'a str,
    label: &'static str,
}

impl Subject<'_> {
    fn violation(&self, message: String) -> Violation {
        Violation::block(ProtocolCoverageRule::NAME, message).on(self.kind, self.id)
    }
}

/// Shared tail of both checks: approval status and organism enrolment.
fn check_protocol(
    subject: &Subject<'_>,
    protocol: &Protocol,
    organism_ids: &[String],
    view: &dyn TransactionView,
    result: &mut EvaluationResult,
) {
    let protocol_id = protocol.base.id.as_str();
    if protocol.status != ProtocolStatus::Approved {
        result.push(subject.violation(format!(
            "{} protocol {protocol_id} is not approved",
            subject.label
        )));
    }
    for organism_id in organism_ids {
        let Some(organism) = view.find::<Organism>(organism_id) else {
            result.push(subject.violation(format!(
                "{} references unknown organism {organism_id}",
                subject.label
            )));
            continue;
        };
        if organism.protocol_id.as_deref() != Some(protocol_id) {
            result.push(subject.violation(format!(
                "organism {organism_id} is not covered by protocol {protocol_id}"
            )));
        }
    }
}

fn check_procedure(procedure: &Procedure, view: &dyn TransactionView, result: &mut EvaluationResult) {
    let subject = Subject {
        kind: EntityType::Procedure,
        id: &procedure.base.id,
        label: "procedure",
    };
    let Some(protocol_id) = procedure.protocol_id.as_deref().filter(|p| !p.is_empty()) else {
        result.push(subject.violation("procedure is missing required protocol".into()));
        return;
    };
    let Some(protocol) = view.find::<Protocol>(protocol_id) else {
        result.push(subject.violation(format!(
            "procedure references unknown protocol {protocol_id}"
        )));
        return;
    };
    check_protocol(&subject, &protocol, &procedure.organism_ids, view, result);
}

fn check_treatment(treatment: &Treatment, view: &dyn TransactionView, result: &mut EvaluationResult) {
    let subject = Subject {
        kind: EntityType::Treatment,
        id: &treatment.base.id,
        label: "treatment",
    };
    let Some(procedure_id) = treatment.procedure_id.as_deref().filter(|p| !p.is_empty()) else {
        result.push(subject.violation("treatment is missing procedure reference".into()));
        return;
    };
    let Some(procedure) = view.find::<Procedure>(procedure_id) else {
        result.push(subject.violation(format!(
            "treatment references unknown procedure {procedure_id}"
        )));
        return;
    };
    let Some(protocol_id) = procedure.protocol_id.as_deref().filter(|p| !p.is_empty()) else {
        result.push(subject.violation(format!(
            "procedure {procedure_id} lacks protocol for treatment"
        )));
        return;
    };
    let Some(protocol) = view.find::<Protocol>(protocol_id) else {
        result.push(subject.violation(format!(
            "treatment references procedure {procedure_id} with unknown protocol {protocol_id}"
        )));
        return;
    };
    check_protocol(&subject, &protocol, &treatment.organism_ids, view, result);
}

impl Rule for ProtocolCoverageRule {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn evaluate(
        &self,
        _ctx: &Context,
        view: &dyn TransactionView,
        changes: &[Change],
    ) -> Result<EvaluationResult, RuleError> {
        let mut result = EvaluationResult::new();
        for change in changes {
            match change.entity {
                EntityType::Procedure => {
                    if let Some(procedure) = change.after_as::<Procedure>() {
                        check_procedure(procedure, view, &mut result);
                    }
                }
                EntityType::Treatment => {
                    if let Some(treatment) = change.after_as::<Treatment>() {
                        check_treatment(treatment, view, &mut result);
                    }
                }
                _ => {}
            }
        }
        Ok(result)
    }
}
