//! Operator assist queue: ESCALATION_NEEDED and OPERATOR_ASSIST requests are
//! queued, then assigned to an on-shift operator with spare capacity, or
//! timed out.

use anyhow::Result;
use chrono::Utc;

use crate::model::event::{Actor, EventBody};
use crate::model::job::JobStatus;
use crate::store::commit::{Op, commit_tx};
use crate::store::{self, outbox};
use crate::workers::{WorkerCtx, chain_events};

pub async fn tick(ctx: &WorkerCtx, max_messages: usize) -> Result<usize> {
    let mut handled = 0;
    for topic in ["ESCALATION_NEEDED", "OPERATOR_ASSIST"] {
        handled += tick_topic(ctx, topic, max_messages).await?;
    }
    Ok(handled)
}

async fn tick_topic(ctx: &WorkerCtx, topic: &str, max_messages: usize) -> Result<usize> {
    let now = Utc::now();
    let mut conn = ctx.store.db.lock().await;
    let claimed = outbox::claim(&conn, topic, max_messages, "assist", now)?;

    let mut handled = 0;
    for msg in claimed {
        let job_id = msg.payload["job_id"].as_str().unwrap_or_default().to_string();
        let tenant_id = msg.tenant_id.clone();

        let Some(job) = store::get_job(&conn, &tenant_id, &job_id)? else {
            outbox::mark_processed(&conn, &[msg.id], now)?;
            continue;
        };
        if job.status != JobStatus::Assisted {
            // Job moved on before an operator picked up; nothing to assign.
            outbox::mark_processed(&conn, &[msg.id], now)?;
            continue;
        }
        if job.assist_operator.is_some() {
            outbox::mark_processed(&conn, &[msg.id], now)?;
            continue;
        }

        let mut bodies = Vec::new();
        bodies.push((EventBody::AssistQueued { requested_at: now }, Actor::System));

        let mut operator = None;
        for op in store::list_operators(&conn, &tenant_id)? {
            if op.covers_zone(&job.zone)
                && store::operator_active_coverage(&conn, &tenant_id, &op.operator_id)?
                    < op.max_concurrent
            {
                operator = Some(op);
                break;
            }
        }

        match operator {
            Some(op) => {
                bodies.push((
                    EventBody::AssistAssigned {
                        operator_id: op.operator_id.clone(),
                    },
                    Actor::System,
                ));
            }
            None => {
                let waited_ms = (msg.attempts as u64 + 1) * 2_000;
                if waited_ms < ctx.config.assist_timeout_ms {
                    // Keep waiting for a free operator.
                    outbox::mark_failed(&conn, msg.id, "no operator free", now)?;
                    continue;
                }
                bodies.push((EventBody::AssistTimeout { waited_ms }, Actor::System));
            }
        }

        let stream_id = format!("job:{job_id}");
        let head = store::stream_head(&conn, &tenant_id, &stream_id)?;
        let events = chain_events(&stream_id, head, bodies, now, &ctx.signer)?;
        commit_tx(
            &mut conn,
            &tenant_id,
            vec![Op::JobEventsAppend {
                job_id: job_id.clone(),
                events,
            }],
            None,
        )?;
        outbox::mark_processed(&conn, &[msg.id], now)?;
        handled += 1;
    }
    Ok(handled)
}
