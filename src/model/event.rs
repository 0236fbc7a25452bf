//! Typed event bodies for every stream family.
//!
//! The wire form is `{"type": "JOB_BOOKED", "payload": {...}}`, produced by
//! the `tag`/`content` attributes and flattened into the event envelope by
//! `chain::Event`. Payload shapes that aggregates retain (quotes, bookings,
//! holds, agreements) get named structs; one-shot payloads are inline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Actor ───────────────────────────────────────────────────────────

/// Who appended an event. The `type` discriminates; most actors carry an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Actor {
    Requester(String),
    Robot(String),
    Operator(String),
    Agent(String),
    Ops(String),
    Finance(String),
    System,
    Pricing,
    Dispatch,
    Risk,
    Retention,
    Accounting,
}

impl Actor {
    pub fn id(&self) -> Option<&str> {
        match self {
            Actor::Requester(id)
            | Actor::Robot(id)
            | Actor::Operator(id)
            | Actor::Agent(id)
            | Actor::Ops(id)
            | Actor::Finance(id) => Some(id),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Actor::Requester(_) => "requester",
            Actor::Robot(_) => "robot",
            Actor::Operator(_) => "operator",
            Actor::Agent(_) => "agent",
            Actor::Ops(_) => "ops",
            Actor::Finance(_) => "finance",
            Actor::System => "system",
            Actor::Pricing => "pricing",
            Actor::Dispatch => "dispatch",
            Actor::Risk => "risk",
            Actor::Retention => "retention",
            Actor::Accounting => "accounting",
        }
    }
}

// ── Shared payload types ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub quote_id: String,
    pub env: String,
    pub window: TimeWindow,
    pub amount_cents: i64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub booking_id: String,
    pub quote_id: String,
    pub contract_id: String,
    /// Hash of the compiled policy snapshot; immutable for the job lifetime.
    pub policy_hash: String,
    pub window: TimeWindow,
    pub amount_cents: i64,
    pub currency: String,
    pub tier: String,
    pub coverage_required: bool,
    pub payer_agent_id: String,
    pub payee_agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credit_policy: Option<CreditPolicy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditPolicy {
    pub enabled: bool,
    /// Minutes-late thresholds to credit amounts, evaluated top-down.
    #[serde(default)]
    pub ladder: Vec<CreditRung>,
    pub default_credit_cents: i64,
    pub max_credit_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditRung {
    pub minutes_late: i64,
    pub credit_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub reservation_id: String,
    pub robot_id: String,
    pub window: TimeWindow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchCandidate {
    pub robot_id: String,
    pub trust_score: i64,
    pub zone: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchFailureReason {
    NoRobots,
    NoOperators,
    Conflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvidenceKind {
    Photo,
    Video,
    Log,
    Telemetry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub evidence_id: String,
    pub kind: EvidenceKind,
    pub content_type: String,
    pub size_bytes: u64,
    /// Object key under the tenant's evidence prefix.
    pub evidence_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incident_severity: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProofStatus {
    Pass,
    Fail,
    InsufficientEvidence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofEvaluation {
    pub proof_id: String,
    pub status: ProofStatus,
    /// Chain hash of the completion anchor this proof was evaluated against.
    pub evaluated_at_chain_hash: String,
    pub customer_policy_hash: String,
    pub operator_policy_hash: String,
    pub facts_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementProofRef {
    pub event_id: String,
    pub chain_hash: String,
    pub payload_hash: String,
    pub facts_hash: String,
    pub customer_policy_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hold {
    pub hold_id: String,
    pub completion_chain_hash: String,
    pub customer_policy_hash: String,
    pub amount_cents: i64,
    pub held_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Green,
    Amber,
    Red,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMethod {
    ZoneCoverage,
    Attestation,
    Manual,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    pub milestone_id: String,
    pub release_rate_pct: u32,
    #[serde(default)]
    pub requires_verification: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgreementTerms {
    pub amount_cents: i64,
    pub currency: String,
    pub dispute_window_days: u32,
    pub kill_fee_rate_pct: u32,
    #[serde(default)]
    pub milestones: Vec<Milestone>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictOutcome {
    Release,
    Refund,
    Partial,
}

/// Signed arbiter decision. The signature covers the canonical JSON of
/// [`DisputeVerdict::core`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisputeVerdict {
    pub verdict_id: String,
    pub dispute_id: String,
    pub outcome: VerdictOutcome,
    pub release_rate_pct: u32,
    pub rationale: String,
    pub arbiter_agent_id: String,
    pub signed_at: DateTime<Utc>,
    pub signature: String,
    pub signer_key_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DisputeVerdictCore<'a> {
    pub schema: &'static str,
    pub verdict_id: &'a str,
    pub dispute_id: &'a str,
    pub outcome: VerdictOutcome,
    pub release_rate_pct: u32,
    pub rationale: &'a str,
    pub arbiter_agent_id: &'a str,
    pub signed_at: &'a DateTime<Utc>,
}

impl DisputeVerdict {
    pub fn core(&self) -> DisputeVerdictCore<'_> {
        DisputeVerdictCore {
            schema: "DisputeVerdict.v1",
            verdict_id: &self.verdict_id,
            dispute_id: &self.dispute_id,
            outcome: self.outcome,
            release_rate_pct: self.release_rate_pct,
            rationale: &self.rationale,
            arbiter_agent_id: &self.arbiter_agent_id,
            signed_at: &self.signed_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFeatures {
    pub env: String,
    pub tier: String,
    pub amount_cents: i64,
    pub window_minutes: i64,
}

// ── Governance payload types ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignerOwnerKind {
    Server,
    Robot,
    Operator,
    Agent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldPolicy {
    BlockAnyOpenHolds,
    BlockHoldsOriginatedInPeriod,
    AllowWithDisclosure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofGateMode {
    Strict,
    Holdback,
    Warn,
}

/// Effective-dated tenant policy override; unset fields inherit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TenantPolicyOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub month_close_hold_policy: Option<HoldPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof_gate_mode: Option<ProofGateMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_retention_days: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_reproof_after_settlement_within_dispute_window: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingest_dlq_depth_limit: Option<u32>,
}

// ── Event bodies ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventBody {
    // Job lifecycle
    JobCreated {
        template_id: String,
        customer_id: String,
        site_id: String,
        zone: String,
        tier: String,
        privacy_mode: String,
        coverage_required: bool,
    },
    JobQuoted(Quote),
    JobBooked(Booking),
    DispatchEvaluated {
        candidates: Vec<DispatchCandidate>,
    },
    JobMatched {
        robot_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operator_id: Option<String>,
    },
    JobReserved(Reservation),
    OperatorCoverageReserved {
        operator_id: String,
        zone: String,
    },
    DispatchConfirmed {
        robot_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operator_id: Option<String>,
    },
    DispatchFailed {
        reason: DispatchFailureReason,
        detail: String,
    },
    JobEnRoute {
        robot_id: String,
        eta: DateTime<Utc>,
    },
    JobAccessGranted {
        robot_id: String,
        method: String,
    },
    JobExecutionStarted {
        robot_id: String,
    },
    JobHeartbeat {
        robot_id: String,
        battery_pct: u8,
    },
    JobExecutionStalled {
        last_heartbeat_at: DateTime<Utc>,
        stalled_for_ms: u64,
    },
    JobExecutionResumed {
        robot_id: String,
    },
    OperatorAssistRequested {
        reason: String,
    },
    AssistQueued {
        requested_at: DateTime<Utc>,
    },
    AssistAssigned {
        operator_id: String,
    },
    AssistTimeout {
        waited_ms: u64,
    },
    JobExecutionCompleted {
        robot_id: String,
        completed_at: DateTime<Utc>,
    },
    JobAbortStarted {
        reason: String,
    },
    JobAborted {
        reason: String,
    },
    JobCancelled {
        reason: String,
    },
    JobRescheduled {
        window: TimeWindow,
    },

    // Evidence, coverage, proofs, settlement
    EvidenceCaptured(EvidenceItem),
    EvidenceExpired {
        evidence_id: String,
    },
    IncidentReported {
        incident_id: String,
        severity: u8,
        kind: String,
    },
    ZoneCoverageReported {
        zone: String,
        coverage_pct: u32,
        covered_at: DateTime<Utc>,
    },
    ProofEvaluated(ProofEvaluation),
    SettlementHeld(Hold),
    SettlementForfeited {
        hold_id: String,
        decision_ref: String,
        reason: String,
    },
    JobSettled {
        amount_cents: i64,
        payer_agent_id: String,
        payee_agent_id: String,
        settled_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hold_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        settlement_proof_ref: Option<SettlementProofRef>,
    },
    SlaBreachDetected {
        kind: String,
        minutes_late: i64,
    },
    SlaCreditIssued {
        credit_cents: i64,
        reason: String,
    },
    OperatorCostRecorded {
        operator_id: String,
        minutes: i64,
        cost_cents: i64,
    },
    ClaimSubmitted {
        claim_id: String,
        amount_cents: i64,
        reason: String,
    },
    ClaimApproved {
        claim_id: String,
        amount_cents: i64,
        auto: bool,
    },
    ClaimDenied {
        claim_id: String,
        reason: String,
    },
    RiskScored {
        score: u32,
        features: RiskFeatures,
        source_event_id: String,
    },
    JobDisputeOpened {
        dispute_id: String,
        opened_by: String,
        reason: String,
    },
    JobDisputeClosed {
        dispute_id: String,
        verdict: DisputeVerdict,
    },

    // Robot identity
    RobotRegistered {
        robot_id: String,
        zone: String,
        signer_key_id: String,
        public_key: String,
        trust_score: i64,
    },
    RobotAvailabilitySet {
        available: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        window: Option<TimeWindow>,
    },
    RobotStatusChanged {
        status: String,
    },
    RobotQuarantined {
        reason: String,
    },
    RobotReinstated {
        note: String,
    },

    // Operator identity
    OperatorRegistered {
        operator_id: String,
        zones: Vec<String>,
        signer_key_id: String,
        public_key: String,
        max_concurrent: u32,
        hourly_rate_cents: i64,
    },
    OperatorShiftStarted {
        zone: String,
    },
    OperatorShiftEnded {},
    OperatorStatusChanged {
        status: String,
    },

    // Agent runs (marketplace tasks)
    RunCreated {
        run_id: String,
        agent_id: String,
        task_id: String,
        payer_agent_id: String,
        verification_method: VerificationMethod,
        agreement: AgreementTerms,
    },
    RunStarted {},
    RunCompleted {
        verification_status: VerificationStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_ref: Option<String>,
    },
    RunFailed {
        reason: String,
        verification_status: VerificationStatus,
    },
    RunSettlementResolved {
        resolution: VerdictOutcome,
        release_cents: i64,
        refund_cents: i64,
        resolved_by: String,
    },
    RunDisputeOpened {
        dispute_id: String,
        opened_by: String,
        reason: String,
    },
    RunDisputeEvidenceAdded {
        dispute_id: String,
        evidence_ref: String,
        note: String,
    },
    RunDisputeEscalated {
        dispute_id: String,
        level: u32,
    },
    RunDisputeClosed {
        dispute_id: String,
        verdict: DisputeVerdict,
    },
    AgreementChangeOrdered {
        change_order_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new_amount_cents: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        milestones: Option<Vec<Milestone>>,
    },
    AgreementCancelled {
        reason: String,
        kill_fee_rate_pct: u32,
    },
    MilestoneCompleted {
        milestone_id: String,
    },

    // Month close
    MonthClosed {
        month: String,
        basis: String,
        statement_hash: String,
        finance_pack_hash: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        disclosure: Option<String>,
    },
    MonthCloseReopened {
        month: String,
        basis: String,
        reason: String,
    },

    // Governance
    SignerKeyRegistered {
        key_id: String,
        public_key: String,
        owner_kind: SignerOwnerKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        owner_id: Option<String>,
    },
    SignerKeyRotated {
        key_id: String,
        public_key: String,
        replaces_key_id: String,
    },
    SignerKeyRevoked {
        key_id: String,
        reason: String,
    },
    TenantPolicyUpdated {
        effective_from: DateTime<Utc>,
        policy: TenantPolicyOverride,
    },
}

impl EventBody {
    /// Wire type tag and canonical payload value for hashing.
    pub fn parts(&self) -> Result<(String, serde_json::Value), serde_json::Error> {
        let v = serde_json::to_value(self)?;
        let type_str = v
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();
        let payload = v.get("payload").cloned().unwrap_or(serde_json::json!({}));
        Ok((type_str, payload))
    }

    pub fn type_str(&self) -> String {
        self.parts().map(|(t, _)| t).unwrap_or_default()
    }
}
