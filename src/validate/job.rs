//! Per-event gates for the job stream.

use chrono::{DateTime, Duration, Utc};

use crate::chain::Event;
use crate::model::event::{EventBody, EvidenceKind, TimeWindow};
use crate::model::governance::{Governance, TenantPolicy};
use crate::model::job::Job;
use crate::model::operator::Operator;
use crate::model::robot::{Robot, RobotStatus};
use crate::model::settlement::verify_verdict;
use crate::validate::signature::check_signature_policy;
use crate::validate::{ValidationError, proof};

pub const EVIDENCE_ALLOWED_CONTENT_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "video/mp4",
    "text/plain",
    "application/json",
];
pub const EVIDENCE_MAX_BYTES: u64 = 100 * 1024 * 1024;
pub const EVIDENCE_QUOTA_PER_JOB: usize = 200;
pub const CLAIM_AUTO_APPROVE_THRESHOLD_CENTS: i64 = 10_000;
pub const JOB_DISPUTE_WINDOW_DAYS: i64 = 7;

/// Store-derived context for job gates. The caller looks these up before
/// validating; the gates themselves stay pure.
pub struct JobGateCtx<'a> {
    pub now: DateTime<Utc>,
    pub policy: &'a TenantPolicy,
    pub governance: &'a Governance,
    pub robot: Option<&'a Robot>,
    pub operator: Option<&'a Operator>,
    pub operator_active_coverage: u32,
    pub has_overlapping_reservation: bool,
    pub contract_policy_hash: Option<&'a str>,
    pub contract_window: Option<TimeWindow>,
    /// Set when the settlement month is CLOSED.
    pub settled_month_closed: Option<String>,
    pub operator_policy_hash: &'a str,
}

/// Validate a new job event against the aggregate as it stands before the
/// append. `prior_events` is the stream without the new event.
pub fn validate_job_event(
    job_before: &Job,
    prior_events: &[Event],
    event: &Event,
    ctx: &JobGateCtx<'_>,
) -> Result<(), ValidationError> {
    check_signature_policy(event, ctx.governance)?;

    match &event.body {
        EventBody::JobBooked(booking) => {
            if let Some(scope) = &ctx.contract_window {
                if booking.window.start < scope.start || booking.window.end > scope.end {
                    return Err(ValidationError::WindowOutOfScope);
                }
            }
            if let Some(expected) = ctx.contract_policy_hash {
                if booking.policy_hash != expected {
                    return Err(ValidationError::PolicyHashMismatch {
                        expected: expected.to_string(),
                        got: booking.policy_hash.clone(),
                    });
                }
            }
            Ok(())
        }

        EventBody::JobReserved(res) => {
            let robot = ctx.robot.ok_or(ValidationError::RobotUnavailable {
                robot_id: res.robot_id.clone(),
            })?;
            if robot.status != RobotStatus::Active || !robot.available {
                return Err(ValidationError::RobotUnavailable {
                    robot_id: res.robot_id.clone(),
                });
            }
            if let Some(window) = &robot.availability_window {
                if res.window.start < window.start || res.window.end > window.end {
                    return Err(ValidationError::RobotUnavailable {
                        robot_id: res.robot_id.clone(),
                    });
                }
            }
            if robot.zone != job_before.zone {
                return Err(ValidationError::ZoneMismatch {
                    robot_id: res.robot_id.clone(),
                    robot_zone: robot.zone.clone(),
                    job_zone: job_before.zone.clone(),
                });
            }
            if ctx.has_overlapping_reservation {
                return Err(ValidationError::OverlappingReservation {
                    robot_id: res.robot_id.clone(),
                });
            }
            Ok(())
        }

        EventBody::OperatorCoverageReserved { operator_id, zone } => {
            let op = ctx.operator.ok_or(ValidationError::OperatorOffShift {
                operator_id: operator_id.clone(),
                zone: zone.clone(),
            })?;
            if !op.covers_zone(zone) {
                return Err(ValidationError::OperatorOffShift {
                    operator_id: operator_id.clone(),
                    zone: zone.clone(),
                });
            }
            if ctx.operator_active_coverage >= op.max_concurrent {
                return Err(ValidationError::OperatorAtCapacity {
                    operator_id: operator_id.clone(),
                    max_concurrent: op.max_concurrent,
                });
            }
            Ok(())
        }

        EventBody::EvidenceCaptured(item) => {
            if !EVIDENCE_ALLOWED_CONTENT_TYPES.contains(&item.content_type.as_str()) {
                return Err(ValidationError::EvidenceContentTypeForbidden {
                    content_type: item.content_type.clone(),
                });
            }
            if item.size_bytes > EVIDENCE_MAX_BYTES {
                return Err(ValidationError::EvidenceTooLarge {
                    size_bytes: item.size_bytes,
                    max_bytes: EVIDENCE_MAX_BYTES,
                });
            }
            if job_before.evidence_count() >= EVIDENCE_QUOTA_PER_JOB {
                return Err(ValidationError::EvidenceQuotaExceeded {
                    count: job_before.evidence_count(),
                    quota: EVIDENCE_QUOTA_PER_JOB,
                });
            }
            if job_before.privacy_mode == "minimal" && item.kind == EvidenceKind::Video {
                let severe_incident = item.incident_severity.is_some_and(|s| s >= 4)
                    || job_before.incidents.iter().any(|i| i.severity >= 4);
                if !severe_incident {
                    return Err(ValidationError::VideoRequiresIncident);
                }
            }
            Ok(())
        }

        EventBody::ClaimApproved {
            claim_id,
            amount_cents,
            auto,
        } => {
            let job_cents = job_before
                .booking
                .as_ref()
                .map(|b| b.amount_cents)
                .unwrap_or(0);
            if *amount_cents > job_cents {
                return Err(ValidationError::ClaimOverAmount {
                    claim_cents: *amount_cents,
                    job_cents,
                });
            }
            if *auto && *amount_cents > CLAIM_AUTO_APPROVE_THRESHOLD_CENTS {
                return Err(ValidationError::ClaimAboveAutoThreshold {
                    claim_id: claim_id.clone(),
                    amount_cents: *amount_cents,
                });
            }
            Ok(())
        }

        EventBody::RiskScored {
            features,
            source_event_id,
            ..
        } => {
            let quote = job_before.quote.as_ref();
            let booking = job_before.booking.as_ref();
            let (expected_env, expected_amount, expected_minutes) = match (booking, quote) {
                (Some(b), Some(q)) => (q.env.as_str(), b.amount_cents, b.window.minutes()),
                (None, Some(q)) => (q.env.as_str(), q.amount_cents, q.window.minutes()),
                _ => return Err(ValidationError::RiskFeaturesMismatch),
            };
            if features.env != expected_env
                || features.tier != job_before.tier
                || features.amount_cents != expected_amount
                || features.window_minutes != expected_minutes
            {
                return Err(ValidationError::RiskFeaturesMismatch);
            }

            let expected_source = prior_events
                .iter()
                .rev()
                .find(|e| {
                    matches!(e.body, EventBody::JobQuoted(_) | EventBody::JobBooked(_))
                })
                .map(|e| e.id.clone())
                .unwrap_or_default();
            if *source_event_id != expected_source {
                return Err(ValidationError::RiskSourceMismatch {
                    expected: expected_source,
                    got: source_event_id.clone(),
                });
            }
            Ok(())
        }

        EventBody::SettlementHeld(hold) => {
            let anchor = job_before
                .completion_anchor
                .as_deref()
                .ok_or(ValidationError::ProofRequired)?;
            let policy_hash = job_before
                .booking
                .as_ref()
                .map(|b| b.policy_hash.as_str())
                .unwrap_or_default();
            let expected = proof::derive_hold_id(anchor, policy_hash);
            if hold.hold_id != expected || hold.completion_chain_hash != anchor {
                return Err(ValidationError::HoldMismatch {
                    expected,
                    got: hold.hold_id.clone(),
                });
            }
            Ok(())
        }

        EventBody::SettlementForfeited { hold_id, .. } => {
            let active = job_before.active_hold().ok_or(ValidationError::HoldMismatch {
                expected: "an active hold".to_string(),
                got: hold_id.clone(),
            })?;
            if *hold_id != active.hold_id {
                return Err(ValidationError::HoldMismatch {
                    expected: active.hold_id.clone(),
                    got: hold_id.clone(),
                });
            }
            Ok(())
        }

        EventBody::JobSettled {
            hold_id,
            settlement_proof_ref,
            ..
        } => {
            if let Some(month) = &ctx.settled_month_closed {
                return Err(ValidationError::MonthClosed {
                    month: month.clone(),
                });
            }
            proof::check_settlement_proof_gate(
                job_before,
                prior_events,
                ctx.policy.proof_gate_mode,
                ctx.operator_policy_hash,
                hold_id.as_deref(),
                settlement_proof_ref.as_ref(),
            )
        }

        EventBody::JobDisputeOpened { .. } => {
            let settled_at = job_before
                .settled
                .as_ref()
                .map(|s| s.settled_at)
                .ok_or(ValidationError::DisputeWindowClosed)?;
            if ctx.now > settled_at + Duration::days(JOB_DISPUTE_WINDOW_DAYS) {
                return Err(ValidationError::DisputeWindowClosed);
            }
            Ok(())
        }

        EventBody::JobDisputeClosed { verdict, .. } => {
            let key = ctx
                .governance
                .active_key(&verdict.signer_key_id)
                .filter(|k| k.owner_id.as_deref() == Some(verdict.arbiter_agent_id.as_str()))
                .ok_or(ValidationError::SignerKeyMismatch {
                    key_id: verdict.signer_key_id.clone(),
                })?;
            verify_verdict(verdict, &key.public_key)?;
            Ok(())
        }

        _ => Ok(()),
    }
}
