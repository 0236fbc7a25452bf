//! Settlement records, declarative policy evaluation, milestone caps, and
//! signed dispute verdicts.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::canonical::canonical_json;
use crate::chain::{ChainError, decode_public_key};
use crate::model::agent_run::{AgentRun, RunStatus};
use crate::model::event::{
    AgreementTerms, DisputeVerdict, Milestone, VerificationMethod, VerificationStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Locked,
    Released,
    Refunded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Pending,
    AutoResolved,
    ManualReviewRequired,
    ManualResolved,
}

/// Per-run settlement projection row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub run_id: String,
    pub status: SettlementStatus,
    pub decision_status: DecisionStatus,
    pub release_cents: i64,
    pub refund_cents: i64,
    pub locked_cents: i64,
    pub payer_agent_id: String,
    pub payee_agent_id: String,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispute_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispute_window_ends_at: Option<DateTime<Utc>>,
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
}

impl SettlementRecord {
    pub fn dispute_window_open(&self, now: DateTime<Utc>) -> bool {
        self.dispute_window_ends_at.is_some_and(|end| now < end)
    }
}

/// Declarative per-tenant settlement policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementPolicy {
    pub policy_id: String,
    pub dispute_window_days: u32,
    /// Amounts above this always go to manual review.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_resolve_max_amount_cents: Option<i64>,
    pub green_release_rate_pct: u32,
    pub amber_release_rate_pct: u32,
    pub amber_auto_resolve: bool,
    pub red_release_rate_pct: u32,
}

impl Default for SettlementPolicy {
    fn default() -> Self {
        SettlementPolicy {
            policy_id: "default".into(),
            dispute_window_days: 7,
            auto_resolve_max_amount_cents: None,
            green_release_rate_pct: 100,
            amber_release_rate_pct: 50,
            amber_auto_resolve: false,
            red_release_rate_pct: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub should_auto_resolve: bool,
    pub release_rate_pct: u32,
    pub release_amount_cents: i64,
    pub refund_amount_cents: i64,
    pub settlement_status: SettlementStatus,
    pub reason_codes: Vec<String>,
}

fn split_amount(amount_cents: i64, rate_pct: u32) -> (i64, i64) {
    let rate = rate_pct.min(100) as i64;
    let release = amount_cents * rate / 100;
    (release, amount_cents - release)
}

/// Evaluate the declarative policy for a terminal run.
pub fn evaluate_settlement_policy(
    policy: &SettlementPolicy,
    verification_method: VerificationMethod,
    verification_status: VerificationStatus,
    run_status: RunStatus,
    amount_cents: i64,
) -> PolicyDecision {
    let mut reasons = Vec::new();

    if run_status == RunStatus::Failed {
        reasons.push("RUN_FAILED".to_string());
        return PolicyDecision {
            should_auto_resolve: true,
            release_rate_pct: 0,
            release_amount_cents: 0,
            refund_amount_cents: amount_cents,
            settlement_status: SettlementStatus::Refunded,
            reason_codes: reasons,
        };
    }

    // Manual verification never auto-resolves; a human recorded the status.
    if verification_method == VerificationMethod::Manual {
        reasons.push("MANUAL_VERIFICATION".to_string());
        let (release, refund) = split_amount(amount_cents, 0);
        return PolicyDecision {
            should_auto_resolve: false,
            release_rate_pct: 0,
            release_amount_cents: release,
            refund_amount_cents: refund,
            settlement_status: SettlementStatus::Locked,
            reason_codes: reasons,
        };
    }

    let (rate, mut auto) = match verification_status {
        VerificationStatus::Green => {
            reasons.push("VERIFIED_GREEN".to_string());
            (policy.green_release_rate_pct, true)
        }
        VerificationStatus::Amber => {
            reasons.push("VERIFICATION_AMBER".to_string());
            (policy.amber_release_rate_pct, policy.amber_auto_resolve)
        }
        VerificationStatus::Red => {
            reasons.push("VERIFICATION_RED".to_string());
            (policy.red_release_rate_pct, true)
        }
    };

    if let Some(cap) = policy.auto_resolve_max_amount_cents {
        if amount_cents > cap {
            reasons.push("AMOUNT_OVER_AUTO_CAP".to_string());
            auto = false;
        }
    }

    let (release, refund) = split_amount(amount_cents, rate);
    let settlement_status = if !auto {
        SettlementStatus::Locked
    } else if release == amount_cents {
        SettlementStatus::Released
    } else {
        // Partial releases settle as released with the remainder refunded.
        if release == 0 {
            SettlementStatus::Refunded
        } else {
            SettlementStatus::Released
        }
    };

    PolicyDecision {
        should_auto_resolve: auto,
        release_rate_pct: rate.min(100),
        release_amount_cents: release,
        refund_amount_cents: refund,
        settlement_status,
        reason_codes: reasons,
    }
}

#[derive(Debug, Error)]
pub enum MilestoneError {
    #[error("milestone release rates sum to {sum}, must be 100")]
    RatesDoNotSumTo100 { sum: u32 },

    #[error("duplicate milestone id {milestone_id}")]
    DuplicateMilestone { milestone_id: String },
}

pub fn validate_milestones(milestones: &[Milestone]) -> Result<(), MilestoneError> {
    if milestones.is_empty() {
        return Ok(());
    }
    let mut seen = std::collections::HashSet::new();
    for m in milestones {
        if !seen.insert(&m.milestone_id) {
            return Err(MilestoneError::DuplicateMilestone {
                milestone_id: m.milestone_id.clone(),
            });
        }
    }
    let sum: u32 = milestones.iter().map(|m| m.release_rate_pct).sum();
    if sum != 100 {
        return Err(MilestoneError::RatesDoNotSumTo100 { sum });
    }
    Ok(())
}

/// Cap the policy release rate by the completed, gate-passing milestones.
pub fn apply_milestone_release(
    decision: &PolicyDecision,
    agreement: &AgreementTerms,
    run: &AgentRun,
    verification_status: VerificationStatus,
    amount_cents: i64,
) -> PolicyDecision {
    if agreement.milestones.is_empty() {
        return decision.clone();
    }

    let applicable: u32 = agreement
        .milestones
        .iter()
        .filter(|m| run.milestone_completed(&m.milestone_id))
        .filter(|m| !m.requires_verification || verification_status == VerificationStatus::Green)
        .map(|m| m.release_rate_pct)
        .sum();

    let capped_rate = decision.release_rate_pct.min(applicable);
    if capped_rate == decision.release_rate_pct {
        return decision.clone();
    }

    let (release, refund) = split_amount(amount_cents, capped_rate);
    let mut reasons = decision.reason_codes.clone();
    reasons.push("MILESTONE_CAP".to_string());
    PolicyDecision {
        should_auto_resolve: decision.should_auto_resolve,
        release_rate_pct: capped_rate,
        release_amount_cents: release,
        refund_amount_cents: refund,
        settlement_status: if !decision.should_auto_resolve {
            SettlementStatus::Locked
        } else if release == 0 {
            SettlementStatus::Refunded
        } else {
            SettlementStatus::Released
        },
        reason_codes: reasons,
    }
}

// ── Verdict signing ─────────────────────────────────────────────────

/// Verify the arbiter signature over the canonical verdict core.
pub fn verify_verdict(verdict: &DisputeVerdict, arbiter_public_key_b64: &str) -> Result<(), ChainError> {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use ed25519_dalek::{Signature, Verifier};

    let key = decode_public_key(arbiter_public_key_b64)?;
    let core = canonical_json(&verdict.core())?;
    let sig_bytes = BASE64
        .decode(&verdict.signature)
        .map_err(|_| ChainError::SignatureInvalid {
            event_id: verdict.verdict_id.clone(),
        })?;
    let sig = Signature::from_slice(&sig_bytes).map_err(|_| ChainError::SignatureInvalid {
        event_id: verdict.verdict_id.clone(),
    })?;
    key.verify(core.as_bytes(), &sig)
        .map_err(|_| ChainError::SignatureInvalid {
            event_id: verdict.verdict_id.clone(),
        })
}

/// Sign a verdict core in place. Used by ops tooling and tests.
pub fn sign_verdict(
    verdict: &mut DisputeVerdict,
    key: &ed25519_dalek::SigningKey,
    key_id: &str,
) -> Result<(), ChainError> {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use ed25519_dalek::Signer;

    verdict.signer_key_id = key_id.to_string();
    let core = canonical_json(&verdict.core())?;
    let sig = key.sign(core.as_bytes());
    verdict.signature = BASE64.encode(sig.to_bytes());
    Ok(())
}

pub fn dispute_window_end(resolved_at: DateTime<Utc>, dispute_window_days: u32) -> DateTime<Utc> {
    resolved_at + Duration::days(dispute_window_days as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn green_full_release_auto_resolves() {
        let policy = SettlementPolicy::default();
        let d = evaluate_settlement_policy(
            &policy,
            VerificationMethod::ZoneCoverage,
            VerificationStatus::Green,
            RunStatus::Completed,
            50_000,
        );
        assert!(d.should_auto_resolve);
        assert_eq!(d.release_amount_cents, 50_000);
        assert_eq!(d.refund_amount_cents, 0);
        assert_eq!(d.settlement_status, SettlementStatus::Released);
    }

    #[test]
    fn amber_without_auto_goes_manual() {
        let policy = SettlementPolicy::default();
        let d = evaluate_settlement_policy(
            &policy,
            VerificationMethod::ZoneCoverage,
            VerificationStatus::Amber,
            RunStatus::Completed,
            50_000,
        );
        assert!(!d.should_auto_resolve);
        assert_eq!(d.settlement_status, SettlementStatus::Locked);
    }

    #[test]
    fn failed_run_refunds_everything() {
        let policy = SettlementPolicy::default();
        let d = evaluate_settlement_policy(
            &policy,
            VerificationMethod::ZoneCoverage,
            VerificationStatus::Red,
            RunStatus::Failed,
            12_345,
        );
        assert!(d.should_auto_resolve);
        assert_eq!(d.refund_amount_cents, 12_345);
        assert_eq!(d.settlement_status, SettlementStatus::Refunded);
    }

    #[test]
    fn auto_cap_forces_manual() {
        let policy = SettlementPolicy {
            auto_resolve_max_amount_cents: Some(10_000),
            ..SettlementPolicy::default()
        };
        let d = evaluate_settlement_policy(
            &policy,
            VerificationMethod::ZoneCoverage,
            VerificationStatus::Green,
            RunStatus::Completed,
            50_000,
        );
        assert!(!d.should_auto_resolve);
        assert!(d.reason_codes.iter().any(|r| r == "AMOUNT_OVER_AUTO_CAP"));
    }

    #[test]
    fn milestone_sum_must_be_100() {
        let ms = vec![
            Milestone {
                milestone_id: "m1".into(),
                release_rate_pct: 60,
                requires_verification: false,
            },
            Milestone {
                milestone_id: "m2".into(),
                release_rate_pct: 30,
                requires_verification: false,
            },
        ];
        assert!(validate_milestones(&ms).is_err());
    }
}
