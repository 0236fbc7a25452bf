//! Cross-event invariant checks applied after structural reduction, one gate
//! per new event. The HTTP layer and the workers assemble the context each
//! validator needs (robot/operator aggregates, governance, store lookups) and
//! call in before committing.

pub mod job;
pub mod proof;
pub mod run;
pub mod signature;

use thiserror::Error;

use crate::chain::ChainError;
use crate::model::ReduceError;
use crate::model::settlement::MilestoneError;

#[derive(Debug, Error)]
pub enum ValidationError {
    // ── Booking / dispatch gates ────────────────────────────────────
    #[error("booking window falls outside the contract scope")]
    WindowOutOfScope,

    #[error("booking policy hash {got} does not match compiled contract {expected}")]
    PolicyHashMismatch { expected: String, got: String },

    #[error("robot {robot_id} is not available for the window")]
    RobotUnavailable { robot_id: String },

    #[error("robot {robot_id} in zone {robot_zone} cannot serve job zone {job_zone}")]
    ZoneMismatch {
        robot_id: String,
        robot_zone: String,
        job_zone: String,
    },

    #[error("robot {robot_id} already holds an overlapping reservation")]
    OverlappingReservation { robot_id: String },

    #[error("operator {operator_id} is not on shift in zone {zone}")]
    OperatorOffShift { operator_id: String, zone: String },

    #[error("operator {operator_id} is at max concurrency ({max_concurrent})")]
    OperatorAtCapacity {
        operator_id: String,
        max_concurrent: u32,
    },

    // ── Evidence gates ──────────────────────────────────────────────
    #[error("content type {content_type} is not allowed for evidence")]
    EvidenceContentTypeForbidden { content_type: String },

    #[error("evidence of {size_bytes} bytes exceeds the {max_bytes} byte ceiling")]
    EvidenceTooLarge { size_bytes: u64, max_bytes: u64 },

    #[error("job already carries {count} evidence items (quota {quota})")]
    EvidenceQuotaExceeded { count: usize, quota: usize },

    #[error("video evidence under privacy mode `minimal` requires an incident of severity >= 4")]
    VideoRequiresIncident,

    // ── Claims / risk ───────────────────────────────────────────────
    #[error("claim refund {claim_cents} exceeds job amount {job_cents}")]
    ClaimOverAmount { claim_cents: i64, job_cents: i64 },

    #[error("claim {claim_id} of {amount_cents} is above the auto-approve threshold")]
    ClaimAboveAutoThreshold { claim_id: String, amount_cents: i64 },

    #[error("risk features do not equal the booking/quote inputs")]
    RiskFeaturesMismatch,

    #[error("risk source event {got} is not the latest quote/booking event {expected}")]
    RiskSourceMismatch { expected: String, got: String },

    // ── Settlement / proof gates ────────────────────────────────────
    #[error("settlement requires a fresh PROOF_EVALUATED for the completion anchor")]
    ProofRequired,

    #[error("latest proof no longer matches the current facts")]
    ProofStale,

    #[error("proof status is INSUFFICIENT_EVIDENCE and no matching forfeiture exists")]
    ProofInsufficient,

    #[error("settlement payload must reference the fresh proof")]
    SettlementProofRefRequired,

    #[error("hold {got} does not reference the active hold {expected}")]
    HoldMismatch { expected: String, got: String },

    #[error("settled_at falls in closed month {month}")]
    MonthClosed { month: String },

    #[error("dispute window has ended")]
    DisputeWindowClosed,

    // ── Signature policy ────────────────────────────────────────────
    #[error("event type {event_type} requires a {required} signature")]
    SignatureRequired {
        event_type: String,
        required: &'static str,
    },

    #[error("actor kind {actor} may not append {event_type}")]
    ActorNotAllowed {
        actor: &'static str,
        event_type: String,
    },

    #[error("signer key {key_id} is not the actor's registered key")]
    SignerKeyMismatch { key_id: String },

    #[error(transparent)]
    Milestone(#[from] MilestoneError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Reduce(#[from] ReduceError),

    #[error(transparent)]
    Canonical(#[from] crate::canonical::CanonicalError),
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::WindowOutOfScope => "WINDOW_OUT_OF_SCOPE",
            ValidationError::PolicyHashMismatch { .. } => "POLICY_HASH_MISMATCH",
            ValidationError::RobotUnavailable { .. } => "ROBOT_UNAVAILABLE",
            ValidationError::ZoneMismatch { .. } => "ZONE_MISMATCH",
            ValidationError::OverlappingReservation { .. } => "RESERVATION_OVERLAP",
            ValidationError::OperatorOffShift { .. } => "OPERATOR_OFF_SHIFT",
            ValidationError::OperatorAtCapacity { .. } => "OPERATOR_AT_CAPACITY",
            ValidationError::EvidenceContentTypeForbidden { .. } => {
                "EVIDENCE_CONTENT_TYPE_FORBIDDEN"
            }
            ValidationError::EvidenceTooLarge { .. } => "EVIDENCE_TOO_LARGE",
            ValidationError::EvidenceQuotaExceeded { .. } => "EVIDENCE_QUOTA_EXCEEDED",
            ValidationError::VideoRequiresIncident => "EVIDENCE_PRIVACY_FORBIDDEN",
            ValidationError::ClaimOverAmount { .. } => "CLAIM_OVER_AMOUNT",
            ValidationError::ClaimAboveAutoThreshold { .. } => "CLAIM_MANUAL_REVIEW",
            ValidationError::RiskFeaturesMismatch => "RISK_FEATURES_MISMATCH",
            ValidationError::RiskSourceMismatch { .. } => "RISK_SOURCE_MISMATCH",
            ValidationError::ProofRequired => "PROOF_REQUIRED",
            ValidationError::ProofStale => "PROOF_STALE",
            ValidationError::ProofInsufficient => "PROOF_INSUFFICIENT",
            ValidationError::SettlementProofRefRequired => "SETTLEMENT_PROOF_REF_REQUIRED",
            ValidationError::HoldMismatch { .. } => "HOLD_MISMATCH",
            ValidationError::MonthClosed { .. } => "MONTH_CLOSED",
            ValidationError::DisputeWindowClosed => "DISPUTE_WINDOW_CLOSED",
            ValidationError::SignatureRequired { .. } => "SIGNATURE_REQUIRED",
            ValidationError::ActorNotAllowed { .. } => "ACTOR_NOT_ALLOWED",
            ValidationError::SignerKeyMismatch { .. } => "SIG_INVALID",
            ValidationError::Milestone(_) => "MILESTONES_INVALID",
            ValidationError::Chain(e) => e.code(),
            ValidationError::Reduce(e) => e.code(),
            ValidationError::Canonical(_) => "CANONICALIZATION_FAILED",
        }
    }
}
