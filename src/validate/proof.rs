//! Proof gate: zone-coverage facts, proof freshness, and hold derivation.
//!
//! Settlement in strict/holdback mode requires a PROOF_EVALUATED whose
//! anchor, policy hash, and facts hash all match a recomputation against the
//! stream as it stands now. Anything less is stale or missing.

use serde::Serialize;

use crate::canonical::canonical_json;
use crate::chain::{Event, sha256_hex};
use crate::model::event::{EventBody, ProofGateMode, ProofStatus, SettlementProofRef};
use crate::model::job::{Job, reduce_at_anchor};
use crate::validate::ValidationError;

/// Minimum coverage percentage for a zone to count as covered.
pub const COVERAGE_PASS_PCT: u32 = 80;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneCoverageFacts {
    pub anchor_chain_hash: String,
    pub customer_policy_hash: String,
    pub operator_policy_hash: String,
    pub required_zones: Vec<String>,
    pub reports: Vec<CoverageFact>,
    pub status: ProofStatus,
    #[serde(skip)]
    pub facts_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageFact {
    pub zone: String,
    pub coverage_pct: u32,
    pub covered_at: String,
}

/// Recompute the coverage facts for a job at its completion anchor, taking
/// every ZONE_COVERAGE_REPORTED in the stream into account (reports ingested
/// after the proof was cut change the facts hash and stale the proof).
pub fn verify_zone_coverage_proof_v1(
    events: &[Event],
    anchor_chain_hash: &str,
    customer_policy_hash: &str,
    operator_policy_hash: &str,
) -> Result<ZoneCoverageFacts, ValidationError> {
    let job_at_anchor: Job = reduce_at_anchor(events, anchor_chain_hash)?;
    let required_zones = vec![job_at_anchor.zone.clone()];

    let mut reports: Vec<CoverageFact> = events
        .iter()
        .filter_map(|e| match &e.body {
            EventBody::ZoneCoverageReported {
                zone,
                coverage_pct,
                covered_at,
            } => Some(CoverageFact {
                zone: zone.clone(),
                coverage_pct: *coverage_pct,
                covered_at: covered_at.to_rfc3339(),
            }),
            _ => None,
        })
        .collect();
    reports.sort_by(|a, b| {
        (a.covered_at.as_str(), a.zone.as_str()).cmp(&(b.covered_at.as_str(), b.zone.as_str()))
    });

    let all_required_covered = required_zones.iter().all(|z| {
        reports
            .iter()
            .any(|r| &r.zone == z && r.coverage_pct >= COVERAGE_PASS_PCT)
    });
    let no_stray_zones = reports.iter().all(|r| required_zones.contains(&r.zone));

    let status = if all_required_covered && no_stray_zones {
        ProofStatus::Pass
    } else {
        ProofStatus::InsufficientEvidence
    };

    let mut facts = ZoneCoverageFacts {
        anchor_chain_hash: anchor_chain_hash.to_string(),
        customer_policy_hash: customer_policy_hash.to_string(),
        operator_policy_hash: operator_policy_hash.to_string(),
        required_zones,
        reports,
        status,
        facts_hash: String::new(),
    };
    facts.facts_hash = sha256_hex(canonical_json(&facts)?.as_bytes());
    Ok(facts)
}

/// Deterministic hold id for a completion anchor + policy pair.
pub fn derive_hold_id(completion_chain_hash: &str, customer_policy_hash: &str) -> String {
    format!(
        "hold_{}",
        sha256_hex(format!("{completion_chain_hash}{customer_policy_hash}").as_bytes())
    )
}

/// The full settlement proof gate. In `warn` mode the gate always passes.
#[allow(clippy::too_many_arguments)]
pub fn check_settlement_proof_gate(
    job: &Job,
    events: &[Event],
    mode: ProofGateMode,
    operator_policy_hash: &str,
    hold_id: Option<&str>,
    proof_ref: Option<&SettlementProofRef>,
) -> Result<(), ValidationError> {
    if mode == ProofGateMode::Warn {
        return Ok(());
    }

    let anchor = job
        .completion_anchor
        .as_deref()
        .ok_or(ValidationError::ProofRequired)?;
    let customer_policy_hash = job
        .booking
        .as_ref()
        .map(|b| b.policy_hash.as_str())
        .unwrap_or_default();

    let facts =
        verify_zone_coverage_proof_v1(events, anchor, customer_policy_hash, operator_policy_hash)?;

    // The latest proof must have been cut against this anchor.
    let proof = job
        .proofs
        .iter()
        .rev()
        .find(|p| p.eval.evaluated_at_chain_hash == anchor)
        .ok_or(ValidationError::ProofRequired)?;

    if proof.eval.customer_policy_hash != customer_policy_hash
        || proof.eval.facts_hash != facts.facts_hash
    {
        return Err(ValidationError::ProofStale);
    }

    if proof.eval.status == ProofStatus::InsufficientEvidence {
        let forfeited = job.holds.iter().any(|h| {
            h.completion_chain_hash == anchor && job.forfeited_holds.contains(&h.hold_id)
        });
        if !forfeited {
            return Err(ValidationError::ProofInsufficient);
        }
    }

    // The settlement payload must cite exactly this proof.
    let Some(proof_ref) = proof_ref else {
        return Err(ValidationError::SettlementProofRefRequired);
    };
    if proof_ref.event_id != proof.event_id
        || proof_ref.chain_hash != proof.chain_hash
        || proof_ref.payload_hash != proof.payload_hash
        || proof_ref.facts_hash != proof.eval.facts_hash
        || proof_ref.customer_policy_hash != proof.eval.customer_policy_hash
    {
        return Err(ValidationError::SettlementProofRefRequired);
    }

    // Holdback mode settles against the active hold; the payload must name it.
    if mode == ProofGateMode::Holdback {
        let expected = derive_hold_id(anchor, customer_policy_hash);
        let active = job
            .active_hold()
            .ok_or(ValidationError::HoldMismatch {
                expected: expected.clone(),
                got: "none".to_string(),
            })?;
        match hold_id {
            Some(got) if got == active.hold_id && active.hold_id == expected => {}
            got => {
                return Err(ValidationError::HoldMismatch {
                    expected,
                    got: got.unwrap_or("none").to_string(),
                });
            }
        }
    }

    Ok(())
}
