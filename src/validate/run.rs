//! Per-event gates for agent-run streams: agreements, disputes, verdicts.

use chrono::{DateTime, Utc};

use crate::chain::Event;
use crate::model::agent_run::AgentRun;
use crate::model::event::EventBody;
use crate::model::governance::Governance;
use crate::model::settlement::{SettlementRecord, validate_milestones, verify_verdict};
use crate::validate::ValidationError;
use crate::validate::signature::check_signature_policy;

pub struct RunGateCtx<'a> {
    pub now: DateTime<Utc>,
    pub governance: &'a Governance,
    pub settlement: Option<&'a SettlementRecord>,
}

pub fn validate_run_event(
    run_before: Option<&AgentRun>,
    event: &Event,
    ctx: &RunGateCtx<'_>,
) -> Result<(), ValidationError> {
    check_signature_policy(event, ctx.governance)?;

    match &event.body {
        EventBody::RunCreated { agreement, .. } => {
            validate_milestones(&agreement.milestones)?;
            Ok(())
        }

        EventBody::AgreementChangeOrdered { milestones, .. } => {
            if let Some(ms) = milestones {
                validate_milestones(ms)?;
            }
            Ok(())
        }

        EventBody::RunDisputeOpened { .. } => {
            // A dispute contests a resolved settlement; it must still be in
            // its window.
            let settlement = ctx.settlement.ok_or(ValidationError::DisputeWindowClosed)?;
            if !settlement.dispute_window_open(ctx.now) {
                return Err(ValidationError::DisputeWindowClosed);
            }
            Ok(())
        }

        EventBody::RunDisputeClosed { verdict, .. } => {
            let _ = run_before;
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
