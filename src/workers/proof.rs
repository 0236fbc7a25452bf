//! Proof worker: evaluates zone coverage against the completion anchor and
//! appends PROOF_EVALUATED. In holdback mode it also cuts the deterministic
//! hold for the anchor.

use anyhow::Result;
use chrono::Utc;
use tracing::info;

use crate::model::event::{Actor, EventBody, Hold, ProofEvaluation, ProofGateMode};
use crate::store::commit::{Op, commit_tx};
use crate::store::{self, outbox};
use crate::validate::proof::{derive_hold_id, verify_zone_coverage_proof_v1};
use crate::workers::{WorkerCtx, chain_events};

pub async fn tick(ctx: &WorkerCtx, max_messages: usize) -> Result<usize> {
    let now = Utc::now();
    let mut conn = ctx.store.db.lock().await;
    let claimed = outbox::claim(&conn, "PROOF_EVAL_ENQUEUE", max_messages, "proof", now)?;

    let mut handled = 0;
    for msg in claimed {
        let tenant_id = msg.tenant_id.clone();
        let job_id = msg.payload["job_id"].as_str().unwrap_or_default().to_string();

        let Some(job) = store::get_job(&conn, &tenant_id, &job_id)? else {
            outbox::mark_processed(&conn, &[msg.id], now)?;
            continue;
        };
        let Some(anchor) = job.completion_anchor.clone() else {
            outbox::mark_processed(&conn, &[msg.id], now)?;
            continue;
        };
        let customer_policy_hash = job
            .booking
            .as_ref()
            .map(|b| b.policy_hash.clone())
            .unwrap_or_default();

        let stream_id = format!("job:{job_id}");
        let events = store::load_stream(&conn, &tenant_id, &stream_id)?;
        let facts = match verify_zone_coverage_proof_v1(
            &events,
            &anchor,
            &customer_policy_hash,
            &ctx.config.operator_policy_hash,
        ) {
            Ok(f) => f,
            Err(e) => {
                outbox::mark_failed(&conn, msg.id, &format!("{e}"), now)?;
                continue;
            }
        };

        // Idempotent: a proof for this anchor with these facts already
        // exists, nothing to append.
        let already_current = job
            .proofs
            .iter()
            .rev()
            .find(|p| p.eval.evaluated_at_chain_hash == anchor)
            .is_some_and(|p| p.eval.facts_hash == facts.facts_hash);
        if already_current {
            outbox::mark_processed(&conn, &[msg.id], now)?;
            continue;
        }

        let eval = ProofEvaluation {
            proof_id: format!("proof_{}", &facts.facts_hash[..16]),
            status: facts.status,
            evaluated_at_chain_hash: anchor.clone(),
            customer_policy_hash: customer_policy_hash.clone(),
            operator_policy_hash: ctx.config.operator_policy_hash.clone(),
            facts_hash: facts.facts_hash.clone(),
        };

        let mut bodies = vec![(EventBody::ProofEvaluated(eval), Actor::System)];

        let governance = store::get_governance(&conn, &tenant_id)?;
        let policy = governance.policy_at(now);
        let hold_needed = policy.proof_gate_mode == ProofGateMode::Holdback
            && !job
                .holds
                .iter()
                .any(|h| h.completion_chain_hash == anchor);
        if hold_needed {
            let amount = job.booking.as_ref().map(|b| b.amount_cents).unwrap_or(0);
            bodies.push((
                EventBody::SettlementHeld(Hold {
                    hold_id: derive_hold_id(&anchor, &customer_policy_hash),
                    completion_chain_hash: anchor.clone(),
                    customer_policy_hash: customer_policy_hash.clone(),
                    amount_cents: amount,
                    held_at: now,
                }),
                Actor::System,
            ));
        }

        let head = store::stream_head(&conn, &tenant_id, &stream_id)?;
        let new_events = chain_events(&stream_id, head, bodies, now, &ctx.signer)?;
        commit_tx(
            &mut conn,
            &tenant_id,
            vec![Op::JobEventsAppend {
                job_id: job_id.clone(),
                events: new_events,
            }],
            None,
        )?;
        info!(%job_id, status = ?facts.status, "proof evaluated");
        outbox::mark_processed(&conn, &[msg.id], now)?;
        handled += 1;
    }
    Ok(handled)
}
