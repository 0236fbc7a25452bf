//! Signature policy: which signer kind each event type requires, and whether
//! the actor's registered key actually produced the signature.

use std::collections::HashMap;

use crate::chain::{Event, decode_public_key, verify_signature};
use crate::model::event::{Actor, SignerOwnerKind};
use crate::model::governance::Governance;
use crate::validate::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignerKind {
    Server,
    Robot,
    Operator,
    ServerOrOperator,
    ServerOrRobot,
    RobotOrOperator,
    None,
}

impl SignerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignerKind::Server => "server",
            SignerKind::Robot => "robot",
            SignerKind::Operator => "operator",
            SignerKind::ServerOrOperator => "server_or_operator",
            SignerKind::ServerOrRobot => "server_or_robot",
            SignerKind::RobotOrOperator => "robot_or_operator",
            SignerKind::None => "none",
        }
    }
}

/// Server-side actors: events they append are signed with the server key.
fn is_server_actor(actor: &Actor) -> bool {
    matches!(
        actor,
        Actor::System
            | Actor::Ops(_)
            | Actor::Finance(_)
            | Actor::Pricing
            | Actor::Dispatch
            | Actor::Risk
            | Actor::Retention
            | Actor::Accounting
    )
}

/// Required signer kind per event type.
pub fn required_signer(event_type: &str) -> SignerKind {
    match event_type {
        // Robot telemetry and execution facts come from the robot itself.
        "JOB_HEARTBEAT" | "JOB_EN_ROUTE" | "JOB_ACCESS_GRANTED" | "ZONE_COVERAGE_REPORTED" => {
            SignerKind::Robot
        }
        "JOB_EXECUTION_STARTED" | "JOB_EXECUTION_COMPLETED" | "JOB_EXECUTION_RESUMED" => {
            SignerKind::ServerOrRobot
        }
        "EVIDENCE_CAPTURED" | "INCIDENT_REPORTED" => SignerKind::RobotOrOperator,
        "OPERATOR_ASSIST_REQUESTED" | "ASSIST_ASSIGNED" => SignerKind::ServerOrOperator,
        "OPERATOR_SHIFT_STARTED" | "OPERATOR_SHIFT_ENDED" => SignerKind::Operator,

        // Money movement and governance are server-signed decisions.
        "JOB_SETTLED"
        | "SETTLEMENT_HELD"
        | "SETTLEMENT_FORFEITED"
        | "PROOF_EVALUATED"
        | "MONTH_CLOSED"
        | "MONTH_CLOSE_REOPENED"
        | "SIGNER_KEY_REGISTERED"
        | "SIGNER_KEY_ROTATED"
        | "SIGNER_KEY_REVOKED"
        | "TENANT_POLICY_UPDATED"
        | "RUN_SETTLEMENT_RESOLVED"
        | "SLA_CREDIT_ISSUED"
        | "CLAIM_APPROVED" => SignerKind::Server,

        _ => SignerKind::None,
    }
}

/// Resolve the effective requirement for the actor, then check the event's
/// key against the tenant signer-key store and verify the signature.
pub fn check_signature_policy(
    event: &Event,
    governance: &Governance,
) -> Result<(), ValidationError> {
    let event_type = event.type_str();
    let required = required_signer(&event_type);
    if required == SignerKind::None {
        return Ok(());
    }

    let actor_allowed = match required {
        SignerKind::Server => is_server_actor(&event.actor),
        SignerKind::Robot => matches!(event.actor, Actor::Robot(_)),
        SignerKind::Operator => matches!(event.actor, Actor::Operator(_)),
        SignerKind::ServerOrRobot => {
            is_server_actor(&event.actor) || matches!(event.actor, Actor::Robot(_))
        }
        SignerKind::ServerOrOperator => {
            is_server_actor(&event.actor) || matches!(event.actor, Actor::Operator(_))
        }
        SignerKind::RobotOrOperator => {
            matches!(event.actor, Actor::Robot(_) | Actor::Operator(_))
        }
        SignerKind::None => true,
    };
    if !actor_allowed {
        return Err(ValidationError::ActorNotAllowed {
            actor: event.actor.kind(),
            event_type,
        });
    }

    let Some(key_id) = event.signer_key_id.as_deref() else {
        return Err(ValidationError::SignatureRequired {
            event_type,
            required: required.as_str(),
        });
    };
    if event.signature.is_none() {
        return Err(ValidationError::SignatureRequired {
            event_type,
            required: required.as_str(),
        });
    }

    let record = governance
        .active_key(key_id)
        .ok_or(ValidationError::SignerKeyMismatch {
            key_id: key_id.to_string(),
        })?;

    // The key must belong to the actor that appended the event.
    let binding_ok = match (&event.actor, record.owner_kind) {
        (Actor::Robot(id), SignerOwnerKind::Robot) => record.owner_id.as_deref() == Some(id),
        (Actor::Operator(id), SignerOwnerKind::Operator) => record.owner_id.as_deref() == Some(id),
        (Actor::Agent(id), SignerOwnerKind::Agent) => record.owner_id.as_deref() == Some(id),
        (actor, SignerOwnerKind::Server) => is_server_actor(actor),
        _ => false,
    };
    if !binding_ok {
        return Err(ValidationError::SignerKeyMismatch {
            key_id: key_id.to_string(),
        });
    }

    let mut keys = HashMap::new();
    keys.insert(key_id.to_string(), decode_public_key(&record.public_key)?);
    verify_signature(event, &keys)?;
    Ok(())
}
