//! Job accounting: after settlement, record operator cost, detect SLA
//! breaches, and issue ladder-based credits when the booking's credit policy
//! is on. Each figure also lands as a ledger posting.

use anyhow::Result;
use chrono::Utc;
use tracing::info;

use crate::model::event::{Actor, CreditPolicy, EventBody};
use crate::model::job::Job;
use crate::model::wallet::{LedgerEntry, LedgerOpKind, LedgerPosting};
use crate::store::commit::{Op, commit_tx};
use crate::store::{self, outbox};
use crate::workers::{WorkerCtx, chain_events};

pub const OPERATOR_COST_ACCOUNT: &str = "expense:operator_cost";
pub const OPERATOR_PAYABLE_ACCOUNT: &str = "liability:operator_payable";
pub const SLA_CREDIT_ACCOUNT: &str = "expense:sla_credits";
pub const SLA_CREDIT_PAYABLE_ACCOUNT: &str = "liability:sla_credits";

fn credit_for(policy: &CreditPolicy, minutes_late: i64) -> i64 {
    if !policy.enabled || minutes_late <= 0 {
        return 0;
    }
    let ladder_credit = policy
        .ladder
        .iter()
        .filter(|rung| minutes_late >= rung.minutes_late)
        .map(|rung| rung.credit_cents)
        .max();
    ladder_credit
        .unwrap_or(policy.default_credit_cents)
        .min(policy.max_credit_cents)
}

fn minutes_late(job: &Job) -> i64 {
    match (&job.booking, job.completed_at) {
        (Some(b), Some(done)) => (done - b.window.end).num_minutes().max(0),
        _ => 0,
    }
}

pub async fn tick(ctx: &WorkerCtx, max_messages: usize) -> Result<usize> {
    let now = Utc::now();
    let mut conn = ctx.store.db.lock().await;
    let claimed = outbox::claim(&conn, "JOB_SETTLED", max_messages, "accounting", now)?;

    let mut handled = 0;
    for msg in claimed {
        let tenant_id = msg.tenant_id.clone();
        let job_id = msg.payload["job_id"].as_str().unwrap_or_default().to_string();
        let Some(job) = store::get_job(&conn, &tenant_id, &job_id)? else {
            outbox::mark_processed(&conn, &[msg.id], now)?;
            continue;
        };
        // Already accounted (re-claim after a crash): the projection carries
        // the recorded cost.
        if job.operator_cost_cents > 0 || job.sla_credit_cents > 0 {
            outbox::mark_processed(&conn, &[msg.id], now)?;
            continue;
        }

        let mut bodies = Vec::new();
        let mut ops: Vec<Op> = Vec::new();

        if let (Some(operator_id), Some(booking)) =
            (job.coverage_operator.clone(), job.booking.as_ref())
        {
            if let Some(op) = store::get_operator(&conn, &tenant_id, &operator_id)? {
                let minutes = booking.window.minutes().max(0);
                let cost_cents = op.hourly_rate_cents * minutes / 60;
                if cost_cents > 0 {
                    bodies.push((
                        EventBody::OperatorCostRecorded {
                            operator_id: operator_id.clone(),
                            minutes,
                            cost_cents,
                        },
                        Actor::Accounting,
                    ));
                    ops.push(Op::LedgerPost {
                        posting: LedgerPosting {
                            kind: LedgerOpKind::Credit,
                            entries: vec![
                                LedgerEntry {
                                    account: OPERATOR_COST_ACCOUNT.to_string(),
                                    delta_cents: cost_cents,
                                },
                                LedgerEntry {
                                    account: OPERATOR_PAYABLE_ACCOUNT.to_string(),
                                    delta_cents: -cost_cents,
                                },
                            ],
                            at: now,
                        },
                    });
                }
            }
        }

        let late = minutes_late(&job);
        if late > 0 {
            bodies.push((
                EventBody::SlaBreachDetected {
                    kind: "completion_after_window".to_string(),
                    minutes_late: late,
                },
                Actor::Accounting,
            ));

            if let Some(policy) = job.booking.as_ref().and_then(|b| b.credit_policy.clone()) {
                let credit = credit_for(&policy, late);
                if credit > 0 {
                    bodies.push((
                        EventBody::SlaCreditIssued {
                            credit_cents: credit,
                            reason: format!("{late} minutes late"),
                        },
                        Actor::Accounting,
                    ));
                    ops.push(Op::LedgerPost {
                        posting: LedgerPosting {
                            kind: LedgerOpKind::Credit,
                            entries: vec![
                                LedgerEntry {
                                    account: SLA_CREDIT_ACCOUNT.to_string(),
                                    delta_cents: credit,
                                },
                                LedgerEntry {
                                    account: SLA_CREDIT_PAYABLE_ACCOUNT.to_string(),
                                    delta_cents: -credit,
                                },
                            ],
                            at: now,
                        },
                    });
                }
            }
        }

        if !bodies.is_empty() {
            let stream_id = format!("job:{job_id}");
            let head = store::stream_head(&conn, &tenant_id, &stream_id)?;
            let events = chain_events(&stream_id, head, bodies, now, &ctx.signer)?;
            ops.insert(
                0,
                Op::JobEventsAppend {
                    job_id: job_id.clone(),
                    events,
                },
            );
            commit_tx(&mut conn, &tenant_id, ops, None)?;
            info!(%job_id, minutes_late = late, "job accounting recorded");
        }

        outbox::mark_processed(&conn, &[msg.id], now)?;
        handled += 1;
    }
    Ok(handled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::event::CreditRung;

    fn policy() -> CreditPolicy {
        CreditPolicy {
            enabled: true,
            ladder: vec![
                CreditRung { minutes_late: 15, credit_cents: 500 },
                CreditRung { minutes_late: 60, credit_cents: 2_000 },
            ],
            default_credit_cents: 250,
            max_credit_cents: 1_500,
        }
    }

    #[test]
    fn ladder_picks_largest_matching_rung() {
        assert_eq!(credit_for(&policy(), 20), 500);
        // 90 minutes late hits the 2000 rung but is capped at 1500.
        assert_eq!(credit_for(&policy(), 90), 1_500);
    }

    #[test]
    fn below_ladder_uses_default() {
        assert_eq!(credit_for(&policy(), 5), 250);
    }

    #[test]
    fn disabled_policy_credits_nothing() {
        let mut p = policy();
        p.enabled = false;
        assert_eq!(credit_for(&p, 90), 0);
    }
}
