//! Liveness: stall detection for executing jobs and resume detection for
//! stalled ones. Stalls are mirrored onto the robot stream for the health
//! worker's rate rule.

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tracing::info;

use crate::model::event::{Actor, EventBody};
use crate::model::job::{Job, JobStatus};
use crate::store::commit::{Op, commit_tx};
use crate::store::{self};
use crate::workers::{WorkerCtx, chain_events};

fn stall_after_ms(ctx: &WorkerCtx, job: &Job) -> u64 {
    match job.tier.as_str() {
        "priority" | "premium" => ctx.config.stall_after_ms_priority,
        _ => ctx.config.stall_after_ms_standard,
    }
}

pub async fn tick(ctx: &WorkerCtx) -> Result<usize> {
    let now = Utc::now();
    let mut conn = ctx.store.db.lock().await;

    // tenant scoping: every projection row carries its tenant; walk them all.
    let tenants: Vec<String> = {
        let mut stmt = conn.prepare("SELECT DISTINCT tenant_id FROM jobs")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<_, _>>()?
    };

    let mut transitions = 0;
    for tenant_id in tenants {
        let executing =
            store::list_jobs_by_status(&conn, &tenant_id, &["EXECUTING", "ASSISTED"])?;
        for job in executing {
            let Some(last) = job.last_heartbeat_at else { continue };
            let silent_ms = (now - last).num_milliseconds().max(0) as u64;
            if silent_ms <= stall_after_ms(ctx, &job) {
                continue;
            }

            let stream_id = format!("job:{}", job.job_id);
            let head = store::stream_head(&conn, &tenant_id, &stream_id)?;
            let events = chain_events(
                &stream_id,
                head,
                vec![(
                    EventBody::JobExecutionStalled {
                        last_heartbeat_at: last,
                        stalled_for_ms: silent_ms,
                    },
                    Actor::System,
                )],
                now,
                &ctx.signer,
            )?;

            let mut ops = vec![Op::JobEventsAppend {
                job_id: job.job_id.clone(),
                events,
            }];

            // Attribute the stall to the reserved robot.
            if let Some(robot_id) = job.reservation.as_ref().map(|r| r.robot_id.clone()) {
                let robot_stream = format!("robot:{robot_id}");
                let robot_head = store::stream_head(&conn, &tenant_id, &robot_stream)?;
                let robot_events = chain_events(
                    &robot_stream,
                    robot_head,
                    vec![(
                        EventBody::JobExecutionStalled {
                            last_heartbeat_at: last,
                            stalled_for_ms: silent_ms,
                        },
                        Actor::System,
                    )],
                    now,
                    &ctx.signer,
                )?;
                ops.push(Op::RobotEventsAppend {
                    robot_id,
                    events: robot_events,
                });
            }

            ops.push(Op::OutboxEnqueue {
                topic: "JOB_STALLED".to_string(),
                payload: json!({ "job_id": job.job_id }),
            });
            ops.push(Op::OutboxEnqueue {
                topic: "NOTIFY_OPS_JOB_STALLED".to_string(),
                payload: json!({ "job_id": job.job_id }),
            });
            if job.coverage_required {
                ops.push(Op::OutboxEnqueue {
                    topic: "ESCALATION_NEEDED".to_string(),
                    payload: json!({ "job_id": job.job_id }),
                });
            }

            commit_tx(&mut conn, &tenant_id, ops, None)?;
            info!(job_id = %job.job_id, silent_ms, "job stalled");
            transitions += 1;
        }

        // Stalled jobs whose robot resumed heartbeating come back.
        let stalled = store::list_jobs_by_status(&conn, &tenant_id, &["STALLED"])?;
        for job in stalled {
            let Some(last) = job.last_heartbeat_at else { continue };
            let silent_ms = (now - last).num_milliseconds().max(0) as u64;
            if silent_ms > stall_after_ms(ctx, &job) {
                continue;
            }
            let Some(robot_id) = job.reservation.as_ref().map(|r| r.robot_id.clone()) else {
                continue;
            };
            if job.status != JobStatus::Stalled {
                continue;
            }

            let stream_id = format!("job:{}", job.job_id);
            let head = store::stream_head(&conn, &tenant_id, &stream_id)?;
            let events = chain_events(
                &stream_id,
                head,
                vec![(EventBody::JobExecutionResumed { robot_id }, Actor::System)],
                now,
                &ctx.signer,
            )?;
            commit_tx(
                &mut conn,
                &tenant_id,
                vec![Op::JobEventsAppend {
                    job_id: job.job_id.clone(),
                    events,
                }],
                None,
            )?;
            info!(job_id = %job.job_id, "job resumed");
            transitions += 1;
        }
    }
    Ok(transitions)
}
