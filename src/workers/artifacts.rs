//! Artifact worker: turns committed job events into content-addressed
//! documents and queues them for delivery.

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tracing::info;

use crate::engine::settle::deliveries_for_artifact;
use crate::model::artifact::{
    self, PROOF_RECEIPT_V1, SETTLEMENT_STATEMENT_V1, WORK_CERTIFICATE_V1,
};
use crate::model::event::EventBody;
use crate::store::commit::{Op, commit_tx};
use crate::store::{self, outbox};
use crate::workers::WorkerCtx;

pub async fn tick(ctx: &WorkerCtx, max_messages: usize) -> Result<usize> {
    let now = Utc::now();
    let mut conn = ctx.store.db.lock().await;
    let claimed = outbox::claim(&conn, "ARTIFACT_ENQUEUE", max_messages, "artifacts", now)?;

    let mut handled = 0;
    for msg in claimed {
        let tenant_id = msg.tenant_id.clone();
        let job_id = msg.payload["job_id"].as_str().unwrap_or_default().to_string();
        let schema = msg.payload["schema"].as_str().unwrap_or_default().to_string();
        let source_event_id = msg.payload["source_event_id"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        let stream_id = format!("job:{job_id}");
        let events = store::load_stream(&conn, &tenant_id, &stream_id)?;
        let Some(source) = events.iter().find(|e| e.id == source_event_id) else {
            outbox::mark_processed(&conn, &[msg.id], now)?;
            continue;
        };
        let Some(job) = store::get_job(&conn, &tenant_id, &job_id)? else {
            outbox::mark_processed(&conn, &[msg.id], now)?;
            continue;
        };

        let payload = match schema.as_str() {
            WORK_CERTIFICATE_V1 => json!({
                "job_id": job.job_id,
                "template_id": job.template_id,
                "customer_id": job.customer_id,
                "site_id": job.site_id,
                "zone": job.zone,
                "completed_at": job.completed_at.map(|t| t.to_rfc3339()),
                "robot_id": job.reservation.as_ref().map(|r| r.robot_id.clone()),
                "evidence_count": job.evidence_count(),
            }),
            SETTLEMENT_STATEMENT_V1 => match &job.settled {
                Some(s) => json!({
                    "job_id": job.job_id,
                    "amount_cents": s.amount_cents,
                    "payer_agent_id": s.payer_agent_id,
                    "payee_agent_id": s.payee_agent_id,
                    "settled_at": s.settled_at.to_rfc3339(),
                    "hold_id": s.hold_id,
                    "sla_credit_cents": job.sla_credit_cents,
                }),
                None => {
                    outbox::mark_failed(&conn, msg.id, "job not settled yet", now)?;
                    continue;
                }
            },
            PROOF_RECEIPT_V1 => match &source.body {
                EventBody::ProofEvaluated(eval) => json!({
                    "job_id": job.job_id,
                    "proof_id": eval.proof_id,
                    "status": eval.status,
                    "facts_hash": eval.facts_hash,
                    "evaluated_at_chain_hash": eval.evaluated_at_chain_hash,
                }),
                _ => {
                    outbox::mark_processed(&conn, &[msg.id], now)?;
                    continue;
                }
            },
            other => {
                outbox::mark_failed(&conn, msg.id, &format!("unknown schema {other}"), now)?;
                continue;
            }
        };

        let built = artifact::build_artifact(&schema, &[source], payload)?;
        let mut ops = deliveries_for_artifact(
            &conn,
            &tenant_id,
            &built,
            &format!("job:{job_id}"),
            now,
        )?;
        ops.push(Op::ArtifactPut { artifact: built });
        commit_tx(&mut conn, &tenant_id, ops, None)?;
        info!(%job_id, %schema, "artifact derived");
        outbox::mark_processed(&conn, &[msg.id], now)?;
        handled += 1;
    }
    Ok(handled)
}
