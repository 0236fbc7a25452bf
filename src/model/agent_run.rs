//! AgentRun aggregate: a marketplace task execution with an escrow agreement.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chain::Event;
use crate::model::ReduceError;
use crate::model::event::{
    AgreementTerms, DisputeVerdict, VerdictOutcome, VerificationMethod, VerificationStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Started,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Created => "created",
            RunStatus::Started => "started",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDispute {
    pub dispute_id: String,
    pub opened_by: String,
    pub reason: String,
    pub open: bool,
    pub opened_at: DateTime<Utc>,
    pub evidence_refs: Vec<String>,
    pub escalation_level: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<DisputeVerdict>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub resolution: VerdictOutcome,
    pub release_cents: i64,
    pub refund_cents: i64,
    pub resolved_by: String,
    pub resolved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRun {
    pub run_id: String,
    pub agent_id: String,
    pub task_id: String,
    pub payer_agent_id: String,
    pub status: RunStatus,
    pub verification_method: VerificationMethod,
    pub verification_status: Option<VerificationStatus>,
    pub agreement: AgreementTerms,
    pub completed_milestones: Vec<String>,
    pub resolution: Option<Resolution>,
    pub dispute: Option<RunDispute>,
    pub cancelled: bool,
    pub cancel_kill_fee_rate_pct: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl AgentRun {
    pub fn milestone_completed(&self, milestone_id: &str) -> bool {
        self.completed_milestones.iter().any(|m| m == milestone_id)
    }
}

fn illegal(event: &Event, status: RunStatus) -> ReduceError {
    ReduceError::IllegalTransition {
        event_type: event.type_str(),
        status: status.as_str().to_string(),
    }
}

pub fn reduce(events: &[Event]) -> Result<AgentRun, ReduceError> {
    use crate::model::event::EventBody as B;
    use RunStatus as S;

    let first = events.first().ok_or(ReduceError::EmptyStream)?;
    let B::RunCreated {
        run_id,
        agent_id,
        task_id,
        payer_agent_id,
        verification_method,
        agreement,
    } = &first.body
    else {
        return Err(ReduceError::BadFirstEvent {
            expected: "RUN_CREATED",
            got: first.type_str(),
        });
    };

    let mut run = AgentRun {
        run_id: run_id.clone(),
        agent_id: agent_id.clone(),
        task_id: task_id.clone(),
        payer_agent_id: payer_agent_id.clone(),
        status: S::Created,
        verification_method: *verification_method,
        verification_status: None,
        agreement: agreement.clone(),
        completed_milestones: Vec::new(),
        resolution: None,
        dispute: None,
        cancelled: false,
        cancel_kill_fee_rate_pct: None,
        created_at: first.at,
        finished_at: None,
    };

    for event in &events[1..] {
        let status = run.status;
        match &event.body {
            B::RunCreated { .. } => return Err(illegal(event, status)),

            B::RunStarted {} => {
                if status != S::Created {
                    return Err(illegal(event, status));
                }
                run.status = S::Started;
            }

            B::RunCompleted { verification_status, .. } => {
                if status != S::Started {
                    return Err(illegal(event, status));
                }
                run.verification_status = Some(*verification_status);
                run.finished_at = Some(event.at);
                run.status = S::Completed;
            }

            B::RunFailed { verification_status, .. } => {
                if !matches!(status, S::Created | S::Started) {
                    return Err(illegal(event, status));
                }
                run.verification_status = Some(*verification_status);
                run.finished_at = Some(event.at);
                run.status = S::Failed;
            }

            B::MilestoneCompleted { milestone_id } => {
                if status != S::Started {
                    return Err(illegal(event, status));
                }
                if !run.agreement.milestones.iter().any(|m| &m.milestone_id == milestone_id) {
                    return Err(ReduceError::MissingPrerequisite {
                        what: "milestone in agreement",
                        event_type: event.type_str(),
                    });
                }
                if !run.milestone_completed(milestone_id) {
                    run.completed_milestones.push(milestone_id.clone());
                }
            }

            B::RunSettlementResolved {
                resolution,
                release_cents,
                refund_cents,
                resolved_by,
            } => {
                if !status.is_terminal() {
                    return Err(illegal(event, status));
                }
                run.resolution = Some(Resolution {
                    resolution: *resolution,
                    release_cents: *release_cents,
                    refund_cents: *refund_cents,
                    resolved_by: resolved_by.clone(),
                    resolved_at: event.at,
                });
            }

            B::RunDisputeOpened { dispute_id, opened_by, reason } => {
                if !status.is_terminal() {
                    return Err(illegal(event, status));
                }
                if run.dispute.as_ref().is_some_and(|d| d.open) {
                    return Err(illegal(event, status));
                }
                run.dispute = Some(RunDispute {
                    dispute_id: dispute_id.clone(),
                    opened_by: opened_by.clone(),
                    reason: reason.clone(),
                    open: true,
                    opened_at: event.at,
                    evidence_refs: Vec::new(),
                    escalation_level: 0,
                    verdict: None,
                });
            }

            B::RunDisputeEvidenceAdded { dispute_id, evidence_ref, .. } => {
                let dispute = run
                    .dispute
                    .as_mut()
                    .filter(|d| d.open && &d.dispute_id == dispute_id)
                    .ok_or(ReduceError::MissingPrerequisite {
                        what: "open dispute",
                        event_type: "RUN_DISPUTE_EVIDENCE_ADDED".to_string(),
                    })?;
                dispute.evidence_refs.push(evidence_ref.clone());
            }

            B::RunDisputeEscalated { dispute_id, level } => {
                let dispute = run
                    .dispute
                    .as_mut()
                    .filter(|d| d.open && &d.dispute_id == dispute_id)
                    .ok_or(ReduceError::MissingPrerequisite {
                        what: "open dispute",
                        event_type: "RUN_DISPUTE_ESCALATED".to_string(),
                    })?;
                dispute.escalation_level = *level;
            }

            B::RunDisputeClosed { dispute_id, verdict } => {
                let dispute = run
                    .dispute
                    .as_mut()
                    .filter(|d| d.open && &d.dispute_id == dispute_id)
                    .ok_or(ReduceError::MissingPrerequisite {
                        what: "open dispute",
                        event_type: "RUN_DISPUTE_CLOSED".to_string(),
                    })?;
                dispute.open = false;
                dispute.verdict = Some(verdict.clone());
            }

            B::AgreementChangeOrdered { new_amount_cents, milestones, .. } => {
                if status.is_terminal() {
                    return Err(illegal(event, status));
                }
                if let Some(amount) = new_amount_cents {
                    run.agreement.amount_cents = *amount;
                }
                if let Some(ms) = milestones {
                    run.agreement.milestones = ms.clone();
                }
            }

            B::AgreementCancelled { kill_fee_rate_pct, .. } => {
                if status.is_terminal() {
                    return Err(illegal(event, status));
                }
                run.cancelled = true;
                run.cancel_kill_fee_rate_pct = Some(*kill_fee_rate_pct);
                run.finished_at = Some(event.at);
                run.status = S::Failed;
            }

            _ => {
                return Err(ReduceError::WrongAggregate {
                    event_type: event.type_str(),
                });
            }
        }
    }
    Ok(run)
}
