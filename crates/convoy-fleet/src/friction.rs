//! Acceptance friction gate.

use crate::error::FleetError;
use convoy::protocol::{Criticality, GateDecision, Reversibility, TaskFields, Verifiability};

/// Decide how much friction accepting a task needs. Rules are checked in
/// order and the first match wins.
pub fn evaluate_gate(fields: &TaskFields) -> GateDecision {
    let criticality = fields.criticality.unwrap_or(Criticality::Low);
    let irreversible = fields.reversibility == Some(Reversibility::Irreversible);

    if criticality == Criticality::Critical && irreversible {
        return GateDecision::RequireElevatedReview;
    }
    if criticality == Criticality::Low && fields.verifiability == Some(Verifiability::AutoTestable)
    {
        return GateDecision::AutoAccept;
    }
    if matches!(
        fields.verifiability,
        Some(Verifiability::Subjective | Verifiability::NeedsReview)
    ) {
        return GateDecision::RequireJustification;
    }
    if !irreversible && criticality < Criticality::Critical {
        return GateDecision::RequireAcceptance;
    }
    GateDecision::RequireJustification
}

/// Check an accept request against the gate decision. Returns the
/// justification to record, if one was required.
pub fn admit_acceptance(
    decision: GateDecision,
    justification: Option<&str>,
) -> Result<Option<String>, FleetError> {
    match decision {
        GateDecision::RequireElevatedReview => Err(FleetError::FrictionBlocked {
            decision,
            message: "critical irreversible work must be reviewed outside the fleet".to_string(),
        }),
        GateDecision::RequireJustification => match justification.map(str::trim) {
            Some(j) if !j.is_empty() => Ok(Some(j.to_string())),
            _ => Err(FleetError::FrictionBlocked {
                decision,
                message: "resubmit with a non-empty justification".to_string(),
            }),
        },
        GateDecision::AutoAccept | GateDecision::RequireAcceptance => Ok(justification
            .map(str::trim)
            .filter(|j| !j.is_empty())
            .map(str::to_string)),
    }
}
