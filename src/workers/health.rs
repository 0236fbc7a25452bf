//! Robot health: auto-quarantine on severe or repeated safety incidents, or
//! on three or more stalls within an hour.

use anyhow::Result;
use chrono::Utc;
use tracing::info;

use crate::model::event::{Actor, EventBody};
use crate::model::robot::{Robot, RobotStatus};
use crate::store::commit::{Op, commit_tx};
use crate::store::{self};
use crate::workers::{WorkerCtx, chain_events};

fn quarantine_reason(robot: &Robot, now: chrono::DateTime<Utc>) -> Option<String> {
    if robot.incident_severities.iter().any(|s| *s >= 4) {
        return Some("incident severity >= 4".to_string());
    }
    if robot.safety_incident_count >= 3 {
        return Some("3+ safety incidents".to_string());
    }
    let stalls = robot.stalls_within_hour(now);
    if stalls >= 3 {
        return Some(format!("{stalls} stalls in the last hour"));
    }
    None
}

pub async fn tick(ctx: &WorkerCtx) -> Result<usize> {
    let now = Utc::now();
    let mut conn = ctx.store.db.lock().await;

    let tenants: Vec<String> = {
        let mut stmt = conn.prepare("SELECT DISTINCT tenant_id FROM robots")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<_, _>>()?
    };

    let mut quarantined = 0;
    for tenant_id in tenants {
        for robot in store::list_robots(&conn, &tenant_id)? {
            if robot.status != RobotStatus::Active {
                continue;
            }
            let Some(reason) = quarantine_reason(&robot, now) else {
                continue;
            };

            let stream_id = format!("robot:{}", robot.robot_id);
            let head = store::stream_head(&conn, &tenant_id, &stream_id)?;
            let events = chain_events(
                &stream_id,
                head,
                vec![(
                    EventBody::RobotQuarantined {
                        reason: reason.clone(),
                    },
                    Actor::System,
                )],
                now,
                &ctx.signer,
            )?;
            commit_tx(
                &mut conn,
                &tenant_id,
                vec![Op::RobotEventsAppend {
                    robot_id: robot.robot_id.clone(),
                    events,
                }],
                None,
            )?;
            info!(robot_id = %robot.robot_id, %reason, "robot quarantined");
            quarantined += 1;
        }
    }
    Ok(quarantined)
}
