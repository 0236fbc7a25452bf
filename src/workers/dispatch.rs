//! Dispatch: match BOOKED jobs to the best available robot (trust score
//! descending, id ascending) plus an operator when coverage is required.
//! Reservation overlaps retry the next candidate; exhausting candidates
//! emits DISPATCH_FAILED.

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info};

use crate::model::event::{
    Actor, DispatchCandidate, DispatchFailureReason, EventBody, Reservation,
};
use crate::model::job::{Job, JobStatus};
use crate::model::robot::RobotStatus;
use crate::store::commit::{CommitError, Op, commit_tx};
use crate::store::{self, outbox};
use crate::validate::job::{JobGateCtx, validate_job_event};
use crate::workers::{WorkerCtx, chain_events};

pub async fn tick(ctx: &WorkerCtx, max_messages: usize) -> Result<usize> {
    let now = Utc::now();
    let mut conn = ctx.store.db.lock().await;
    let claimed = outbox::claim(&conn, "DISPATCH_REQUESTED", max_messages, "dispatch", now)?;

    let mut handled = 0;
    for msg in claimed {
        let job_id = msg.payload["job_id"].as_str().unwrap_or_default().to_string();
        match dispatch_one(&mut conn, ctx, &msg.tenant_id, &job_id) {
            Ok(()) => {
                outbox::mark_processed(&conn, &[msg.id], now)?;
                ctx.metrics
                    .outbox_processed_total
                    .with_label_values(&["DISPATCH_REQUESTED", "ok"])
                    .inc();
                handled += 1;
            }
            Err(e) => {
                outbox::mark_failed(&conn, msg.id, &format!("{e:#}"), now)?;
                ctx.metrics
                    .outbox_processed_total
                    .with_label_values(&["DISPATCH_REQUESTED", "retry"])
                    .inc();
            }
        }
    }
    Ok(handled)
}

fn dispatch_one(
    conn: &mut rusqlite::Connection,
    ctx: &WorkerCtx,
    tenant_id: &str,
    job_id: &str,
) -> Result<()> {
    let now = Utc::now();
    let Some(job) = store::get_job(conn, tenant_id, job_id)? else {
        debug!(%job_id, "dispatch request for unknown job, dropping");
        return Ok(());
    };
    if job.status != JobStatus::Booked {
        debug!(%job_id, status = job.status.as_str(), "job not BOOKED, dropping dispatch request");
        return Ok(());
    }
    let Some(booking) = job.booking.clone() else {
        return Ok(());
    };

    // Candidates: zone-matched, active, available; best trust first, id as
    // the tiebreak.
    let mut robots: Vec<_> = store::list_robots(conn, tenant_id)?
        .into_iter()
        .filter(|r| r.status == RobotStatus::Active && r.available && r.zone == job.zone)
        .collect();
    robots.sort_by(|a, b| {
        b.trust_score
            .cmp(&a.trust_score)
            .then(a.robot_id.cmp(&b.robot_id))
    });

    if robots.is_empty() {
        return fail_dispatch(conn, ctx, tenant_id, &job, DispatchFailureReason::NoRobots, "no active robots in zone");
    }

    let operator = if job.coverage_required {
        let mut found = None;
        for op in store::list_operators(conn, tenant_id)? {
            if op.covers_zone(&job.zone)
                && store::operator_active_coverage(conn, tenant_id, &op.operator_id)?
                    < op.max_concurrent
            {
                found = Some(op);
                break;
            }
        }
        match found {
            Some(op) => Some(op),
            None => {
                return fail_dispatch(
                    conn,
                    ctx,
                    tenant_id,
                    &job,
                    DispatchFailureReason::NoOperators,
                    "no operator coverage in zone",
                );
            }
        }
    } else {
        None
    };

    let candidates: Vec<DispatchCandidate> = robots
        .iter()
        .map(|r| DispatchCandidate {
            robot_id: r.robot_id.clone(),
            trust_score: r.trust_score,
            zone: r.zone.clone(),
        })
        .collect();

    let governance = store::get_governance(conn, tenant_id)?;
    let policy = governance.policy_at(now);

    let mut saw_conflict = false;
    for robot in &robots {
        let overlapping = store::overlapping_reservation_exists(
            conn,
            tenant_id,
            &robot.robot_id,
            booking.window.start,
            booking.window.end,
            job_id,
        )?;
        if overlapping {
            saw_conflict = true;
            continue;
        }

        let reservation = Reservation {
            reservation_id: format!("rsv_{}", uuid::Uuid::new_v4().simple()),
            robot_id: robot.robot_id.clone(),
            window: booking.window,
        };

        let mut bodies = vec![
            (
                EventBody::DispatchEvaluated {
                    candidates: candidates.clone(),
                },
                Actor::Dispatch,
            ),
            (
                EventBody::JobMatched {
                    robot_id: robot.robot_id.clone(),
                    operator_id: operator.as_ref().map(|o| o.operator_id.clone()),
                },
                Actor::Dispatch,
            ),
            (EventBody::JobReserved(reservation.clone()), Actor::Dispatch),
        ];
        if let Some(op) = &operator {
            bodies.push((
                EventBody::OperatorCoverageReserved {
                    operator_id: op.operator_id.clone(),
                    zone: job.zone.clone(),
                },
                Actor::Dispatch,
            ));
        }
        bodies.push((
            EventBody::DispatchConfirmed {
                robot_id: robot.robot_id.clone(),
                operator_id: operator.as_ref().map(|o| o.operator_id.clone()),
            },
            Actor::Dispatch,
        ));

        let stream_id = format!("job:{job_id}");
        let head = store::stream_head(conn, tenant_id, &stream_id)?;
        let events = chain_events(&stream_id, head, bodies, now, &ctx.signer)?;

        // Gate the reservation the same way the HTTP path would.
        let reserved_event = events
            .iter()
            .find(|e| matches!(e.body, EventBody::JobReserved(_)))
            .expect("batch contains reservation");
        let gate = JobGateCtx {
            now,
            policy: &policy,
            governance: &governance,
            robot: Some(robot),
            operator: operator.as_ref(),
            operator_active_coverage: operator
                .as_ref()
                .map(|o| store::operator_active_coverage(conn, tenant_id, &o.operator_id))
                .transpose()?
                .unwrap_or(0),
            has_overlapping_reservation: false,
            contract_policy_hash: None,
            contract_window: None,
            settled_month_closed: None,
            operator_policy_hash: &ctx.config.operator_policy_hash,
        };
        // Matched/Reserved land mid-batch; validate against the job as booked.
        validate_job_event(&job, &[], reserved_event, &gate)?;

        match commit_tx(
            conn,
            tenant_id,
            vec![Op::JobEventsAppend {
                job_id: job_id.to_string(),
                events,
            }],
            None,
        ) {
            Ok(()) => {
                info!(%job_id, robot = %robot.robot_id, "dispatch confirmed");
                return Ok(());
            }
            Err(CommitError::PrevChainHashMismatch { .. }) => {
                // Another writer advanced the stream; retry on next claim.
                saw_conflict = true;
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }

    if saw_conflict {
        fail_dispatch(conn, ctx, tenant_id, &job, DispatchFailureReason::Conflict, "all candidates conflicted")
    } else {
        fail_dispatch(conn, ctx, tenant_id, &job, DispatchFailureReason::NoRobots, "no reservable robot")
    }
}

fn fail_dispatch(
    conn: &mut rusqlite::Connection,
    ctx: &WorkerCtx,
    tenant_id: &str,
    job: &Job,
    reason: DispatchFailureReason,
    detail: &str,
) -> Result<()> {
    let now = Utc::now();
    let stream_id = format!("job:{}", job.job_id);
    let head = store::stream_head(conn, tenant_id, &stream_id)?;
    let events = chain_events(
        &stream_id,
        head,
        vec![(
            EventBody::DispatchFailed {
                reason,
                detail: detail.to_string(),
            },
            Actor::Dispatch,
        )],
        now,
        &ctx.signer,
    )?;
    commit_tx(
        conn,
        tenant_id,
        vec![Op::JobEventsAppend {
            job_id: job.job_id.clone(),
            events,
        }],
        None,
    )?;
    info!(job_id = %job.job_id, ?reason, "dispatch failed");
    Ok(())
}
