//! Job aggregate: a pure fold over a job event stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chain::Event;
use crate::model::ReduceError;
use crate::model::event::{
    Booking, DisputeVerdict, EvidenceItem, Hold, ProofEvaluation, Quote, Reservation,
    SettlementProofRef,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Created,
    Quoted,
    Booked,
    Matched,
    Reserved,
    EnRoute,
    AccessGranted,
    Executing,
    Assisted,
    Stalled,
    AbortingSafeExit,
    Completed,
    Aborted,
    Settled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "CREATED",
            JobStatus::Quoted => "QUOTED",
            JobStatus::Booked => "BOOKED",
            JobStatus::Matched => "MATCHED",
            JobStatus::Reserved => "RESERVED",
            JobStatus::EnRoute => "EN_ROUTE",
            JobStatus::AccessGranted => "ACCESS_GRANTED",
            JobStatus::Executing => "EXECUTING",
            JobStatus::Assisted => "ASSISTED",
            JobStatus::Stalled => "STALLED",
            JobStatus::AbortingSafeExit => "ABORTING_SAFE_EXIT",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Aborted => "ABORTED",
            JobStatus::Settled => "SETTLED",
        }
    }

    /// Statuses where a robot is (or should be) actively working the job.
    pub fn is_active_execution(&self) -> bool {
        matches!(self, JobStatus::Executing | JobStatus::Assisted)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageReport {
    pub zone: String,
    pub coverage_pct: u32,
    pub covered_at: DateTime<Utc>,
}

/// A proof evaluation together with the event coordinates the settlement
/// proof ref must cite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofRecord {
    pub eval: ProofEvaluation,
    pub event_id: String,
    pub chain_hash: String,
    pub payload_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    Submitted,
    Approved,
    Denied,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub claim_id: String,
    pub amount_cents: i64,
    pub status: ClaimStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDispute {
    pub dispute_id: String,
    pub opened_by: String,
    pub open: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<DisputeVerdict>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettledInfo {
    pub amount_cents: i64,
    pub payer_agent_id: String,
    pub payee_agent_id: String,
    pub settled_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settlement_proof_ref: Option<SettlementProofRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub incident_id: String,
    pub severity: u8,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub status: JobStatus,
    pub template_id: String,
    pub customer_id: String,
    pub site_id: String,
    pub zone: String,
    pub tier: String,
    pub privacy_mode: String,
    pub coverage_required: bool,
    pub quote: Option<Quote>,
    pub booking: Option<Booking>,
    pub reservation: Option<Reservation>,
    pub matched_robot: Option<String>,
    pub coverage_operator: Option<String>,
    pub assist_operator: Option<String>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub stall_count: u32,
    pub evidence: Vec<EvidenceItem>,
    pub expired_evidence: Vec<String>,
    pub incidents: Vec<Incident>,
    pub coverage_reports: Vec<CoverageReport>,
    pub proofs: Vec<ProofRecord>,
    pub holds: Vec<Hold>,
    pub forfeited_holds: Vec<String>,
    /// Chain hash of the latest JOB_EXECUTION_COMPLETED event.
    pub completion_anchor: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub settled: Option<SettledInfo>,
    pub claims: Vec<Claim>,
    pub risk_score: Option<u32>,
    pub risk_source_event_id: Option<String>,
    pub dispute: Option<JobDispute>,
    pub sla_credit_cents: i64,
    pub operator_cost_cents: i64,
}

impl Job {
    /// The latest proof evaluated against the current completion anchor.
    pub fn latest_proof(&self) -> Option<&ProofRecord> {
        self.proofs.last()
    }

    pub fn active_hold(&self) -> Option<&Hold> {
        self.holds
            .iter()
            .rev()
            .find(|h| !self.forfeited_holds.contains(&h.hold_id))
    }

    pub fn evidence_count(&self) -> usize {
        self.evidence.len()
    }
}

fn illegal(event: &Event, status: JobStatus) -> ReduceError {
    ReduceError::IllegalTransition {
        event_type: event.type_str(),
        status: status.as_str().to_string(),
    }
}

/// Fold a job stream into its aggregate. Pure; no I/O.
pub fn reduce(events: &[Event]) -> Result<Job, ReduceError> {
    use crate::model::event::EventBody as B;

    let first = events.first().ok_or(ReduceError::EmptyStream)?;
    let B::JobCreated {
        template_id,
        customer_id,
        site_id,
        zone,
        tier,
        privacy_mode,
        coverage_required,
    } = &first.body
    else {
        return Err(ReduceError::BadFirstEvent {
            expected: "JOB_CREATED",
            got: first.type_str(),
        });
    };

    let mut job = Job {
        job_id: first
            .stream_id
            .strip_prefix("job:")
            .unwrap_or(&first.stream_id)
            .to_string(),
        status: JobStatus::Created,
        template_id: template_id.clone(),
        customer_id: customer_id.clone(),
        site_id: site_id.clone(),
        zone: zone.clone(),
        tier: tier.clone(),
        privacy_mode: privacy_mode.clone(),
        coverage_required: *coverage_required,
        quote: None,
        booking: None,
        reservation: None,
        matched_robot: None,
        coverage_operator: None,
        assist_operator: None,
        last_heartbeat_at: None,
        stall_count: 0,
        evidence: Vec::new(),
        expired_evidence: Vec::new(),
        incidents: Vec::new(),
        coverage_reports: Vec::new(),
        proofs: Vec::new(),
        holds: Vec::new(),
        forfeited_holds: Vec::new(),
        completion_anchor: None,
        completed_at: None,
        settled: None,
        claims: Vec::new(),
        risk_score: None,
        risk_source_event_id: None,
        dispute: None,
        sla_credit_cents: 0,
        operator_cost_cents: 0,
    };

    for event in &events[1..] {
        apply(&mut job, event)?;
    }
    Ok(job)
}

fn apply(job: &mut Job, event: &Event) -> Result<(), ReduceError> {
    use crate::model::event::EventBody as B;
    use JobStatus as S;

    let status = job.status;
    match &event.body {
        B::JobCreated { .. } => return Err(illegal(event, status)),

        B::JobQuoted(quote) => {
            if !matches!(status, S::Created | S::Quoted) {
                return Err(illegal(event, status));
            }
            job.quote = Some(quote.clone());
            job.status = S::Quoted;
        }

        B::JobBooked(booking) => {
            if status != S::Quoted {
                return Err(illegal(event, status));
            }
            job.booking = Some(booking.clone());
            job.status = S::Booked;
        }

        B::DispatchEvaluated { .. } => {
            if status != S::Booked {
                return Err(illegal(event, status));
            }
        }

        B::JobMatched { robot_id, operator_id } => {
            if status != S::Booked {
                return Err(illegal(event, status));
            }
            job.matched_robot = Some(robot_id.clone());
            job.coverage_operator = operator_id.clone();
            job.status = S::Matched;
        }

        B::JobReserved(res) => {
            if status != S::Matched {
                return Err(illegal(event, status));
            }
            if let Some(existing) = &job.reservation {
                return Err(ReduceError::DuplicateReservation {
                    reservation_id: existing.reservation_id.clone(),
                });
            }
            job.reservation = Some(res.clone());
            job.status = S::Reserved;
        }

        B::OperatorCoverageReserved { operator_id, .. } => {
            if status != S::Reserved {
                return Err(illegal(event, status));
            }
            job.coverage_operator = Some(operator_id.clone());
        }

        B::DispatchConfirmed { .. } => {
            if status != S::Reserved {
                return Err(illegal(event, status));
            }
        }

        B::DispatchFailed { .. } => {
            if !matches!(status, S::Booked | S::Matched) {
                return Err(illegal(event, status));
            }
            job.matched_robot = None;
            job.status = S::Booked;
        }

        B::JobEnRoute { robot_id, .. } => {
            if status != S::Reserved {
                return Err(illegal(event, status));
            }
            check_robot(job, robot_id)?;
            job.status = S::EnRoute;
        }

        B::JobAccessGranted { robot_id, .. } => {
            if status != S::EnRoute {
                return Err(illegal(event, status));
            }
            check_robot(job, robot_id)?;
            job.status = S::AccessGranted;
        }

        B::JobExecutionStarted { robot_id } => {
            if !matches!(status, S::EnRoute | S::AccessGranted) {
                return Err(illegal(event, status));
            }
            check_robot(job, robot_id)?;
            job.last_heartbeat_at = Some(event.at);
            job.status = S::Executing;
        }

        B::JobHeartbeat { robot_id, .. } => {
            if !matches!(status, S::Executing | S::Assisted | S::Stalled) {
                return Err(illegal(event, status));
            }
            check_robot(job, robot_id)?;
            job.last_heartbeat_at = Some(event.at);
        }

        B::JobExecutionStalled { .. } => {
            if !status.is_active_execution() {
                return Err(illegal(event, status));
            }
            job.stall_count += 1;
            job.status = S::Stalled;
        }

        B::JobExecutionResumed { robot_id } => {
            if status != S::Stalled {
                return Err(illegal(event, status));
            }
            check_robot(job, robot_id)?;
            job.last_heartbeat_at = Some(event.at);
            job.status = S::Executing;
        }

        B::OperatorAssistRequested { .. } => {
            if !matches!(status, S::Executing | S::Stalled) {
                return Err(illegal(event, status));
            }
            job.status = S::Assisted;
        }

        B::AssistQueued { .. } => {
            if status != S::Assisted {
                return Err(illegal(event, status));
            }
        }

        B::AssistAssigned { operator_id } => {
            if status != S::Assisted {
                return Err(illegal(event, status));
            }
            job.assist_operator = Some(operator_id.clone());
        }

        B::AssistTimeout { .. } => {
            if status != S::Assisted {
                return Err(illegal(event, status));
            }
            job.assist_operator = None;
            job.status = S::Executing;
        }

        B::JobExecutionCompleted { robot_id, completed_at } => {
            if !status.is_active_execution() {
                return Err(illegal(event, status));
            }
            check_robot(job, robot_id)?;
            job.completion_anchor = Some(event.chain_hash.clone());
            job.completed_at = Some(*completed_at);
            job.status = S::Completed;
        }

        B::JobAbortStarted { .. } => {
            if !matches!(
                status,
                S::EnRoute | S::AccessGranted | S::Executing | S::Assisted | S::Stalled
            ) {
                return Err(illegal(event, status));
            }
            job.status = S::AbortingSafeExit;
        }

        B::JobAborted { .. } => {
            if !matches!(
                status,
                S::AbortingSafeExit | S::EnRoute | S::AccessGranted | S::Executing | S::Assisted | S::Stalled
            ) {
                return Err(illegal(event, status));
            }
            job.status = S::Aborted;
        }

        B::JobCancelled { .. } => {
            if !matches!(status, S::Created | S::Quoted | S::Booked | S::Matched | S::Reserved) {
                return Err(illegal(event, status));
            }
            job.status = S::Aborted;
        }

        B::JobRescheduled { window } => {
            if !matches!(status, S::Booked | S::Matched | S::Reserved) {
                return Err(illegal(event, status));
            }
            if let Some(b) = &mut job.booking {
                b.window = *window;
            }
            job.reservation = None;
            job.matched_robot = None;
            job.status = S::Booked;
        }

        B::EvidenceCaptured(item) => {
            if matches!(status, S::Created | S::Quoted | S::Aborted) {
                return Err(illegal(event, status));
            }
            job.evidence.push(item.clone());
        }

        B::EvidenceExpired { evidence_id } => {
            job.expired_evidence.push(evidence_id.clone());
        }

        B::IncidentReported { incident_id, severity, kind } => {
            job.incidents.push(Incident {
                incident_id: incident_id.clone(),
                severity: *severity,
                kind: kind.clone(),
            });
        }

        B::ZoneCoverageReported { zone, coverage_pct, covered_at } => {
            if matches!(status, S::Created | S::Quoted | S::Aborted) {
                return Err(illegal(event, status));
            }
            job.coverage_reports.push(CoverageReport {
                zone: zone.clone(),
                coverage_pct: *coverage_pct,
                covered_at: *covered_at,
            });
        }

        B::ProofEvaluated(eval) => {
            if !matches!(status, S::Completed | S::Settled) {
                return Err(illegal(event, status));
            }
            job.proofs.push(ProofRecord {
                eval: eval.clone(),
                event_id: event.id.clone(),
                chain_hash: event.chain_hash.clone(),
                payload_hash: event.payload_hash.clone(),
            });
        }

        B::SettlementHeld(hold) => {
            if status != S::Completed {
                return Err(illegal(event, status));
            }
            job.holds.push(hold.clone());
        }

        B::SettlementForfeited { hold_id, .. } => {
            if status != S::Completed {
                return Err(illegal(event, status));
            }
            if !job.holds.iter().any(|h| &h.hold_id == hold_id) {
                return Err(ReduceError::MissingPrerequisite {
                    what: "matching SETTLEMENT_HELD",
                    event_type: event.type_str(),
                });
            }
            job.forfeited_holds.push(hold_id.clone());
        }

        B::JobSettled {
            amount_cents,
            payer_agent_id,
            payee_agent_id,
            settled_at,
            hold_id,
            settlement_proof_ref,
        } => {
            if status != S::Completed {
                return Err(illegal(event, status));
            }
            job.settled = Some(SettledInfo {
                amount_cents: *amount_cents,
                payer_agent_id: payer_agent_id.clone(),
                payee_agent_id: payee_agent_id.clone(),
                settled_at: *settled_at,
                hold_id: hold_id.clone(),
                settlement_proof_ref: settlement_proof_ref.clone(),
            });
            job.status = S::Settled;
        }

        B::SlaBreachDetected { .. } => {
            if !matches!(status, S::Completed | S::Settled) {
                return Err(illegal(event, status));
            }
        }

        B::SlaCreditIssued { credit_cents, .. } => {
            if !matches!(status, S::Completed | S::Settled) {
                return Err(illegal(event, status));
            }
            job.sla_credit_cents += credit_cents;
        }

        B::OperatorCostRecorded { cost_cents, .. } => {
            if !matches!(status, S::Completed | S::Settled) {
                return Err(illegal(event, status));
            }
            job.operator_cost_cents += cost_cents;
        }

        B::ClaimSubmitted { claim_id, amount_cents, .. } => {
            if matches!(status, S::Created | S::Quoted) {
                return Err(illegal(event, status));
            }
            job.claims.push(Claim {
                claim_id: claim_id.clone(),
                amount_cents: *amount_cents,
                status: ClaimStatus::Submitted,
            });
        }

        B::ClaimApproved { claim_id, .. } => {
            let claim = job
                .claims
                .iter_mut()
                .find(|c| &c.claim_id == claim_id)
                .ok_or(ReduceError::MissingPrerequisite {
                    what: "matching CLAIM_SUBMITTED",
                    event_type: "CLAIM_APPROVED".to_string(),
                })?;
            claim.status = ClaimStatus::Approved;
        }

        B::ClaimDenied { claim_id, .. } => {
            let claim = job
                .claims
                .iter_mut()
                .find(|c| &c.claim_id == claim_id)
                .ok_or(ReduceError::MissingPrerequisite {
                    what: "matching CLAIM_SUBMITTED",
                    event_type: "CLAIM_DENIED".to_string(),
                })?;
            claim.status = ClaimStatus::Denied;
        }

        B::RiskScored { score, source_event_id, .. } => {
            if !matches!(status, S::Quoted | S::Booked) {
                return Err(illegal(event, status));
            }
            job.risk_score = Some(*score);
            job.risk_source_event_id = Some(source_event_id.clone());
        }

        B::JobDisputeOpened { dispute_id, opened_by, .. } => {
            if status != S::Settled {
                return Err(illegal(event, status));
            }
            if job.dispute.as_ref().is_some_and(|d| d.open) {
                return Err(illegal(event, status));
            }
            job.dispute = Some(JobDispute {
                dispute_id: dispute_id.clone(),
                opened_by: opened_by.clone(),
                open: true,
                verdict: None,
            });
        }

        B::JobDisputeClosed { dispute_id, verdict } => {
            let dispute = job.dispute.as_mut().filter(|d| d.open && &d.dispute_id == dispute_id);
            let Some(dispute) = dispute else {
                return Err(ReduceError::MissingPrerequisite {
                    what: "open dispute",
                    event_type: "JOB_DISPUTE_CLOSED".to_string(),
                });
            };
            dispute.open = false;
            dispute.verdict = Some(verdict.clone());
        }

        _ => {
            return Err(ReduceError::WrongAggregate {
                event_type: event.type_str(),
            });
        }
    }
    Ok(())
}

fn check_robot(job: &Job, robot_id: &str) -> Result<(), ReduceError> {
    let expected = job
        .reservation
        .as_ref()
        .map(|r| r.robot_id.as_str())
        .or(job.matched_robot.as_deref());
    match expected {
        Some(expected) if expected != robot_id => Err(ReduceError::WrongRobot {
            expected: expected.to_string(),
            got: robot_id.to_string(),
        }),
        _ => Ok(()),
    }
}

/// Reduce only the stream prefix up to and including the event whose chain
/// hash equals `anchor`. Used by the proof gate to reconstruct the job as it
/// was at its completion anchor.
pub fn reduce_at_anchor(events: &[Event], anchor: &str) -> Result<Job, ReduceError> {
    let idx = events
        .iter()
        .position(|e| e.chain_hash == anchor)
        .ok_or(ReduceError::MissingPrerequisite {
            what: "anchor event in stream",
            event_type: "PROOF_EVALUATED".to_string(),
        })?;
    reduce(&events[..=idx])
}
