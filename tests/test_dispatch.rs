mod settld_common;

use settld_common::*;

use settld::model::job::JobStatus;
use settld::store::{self};
use settld::workers::dispatch;

#[tokio::test]
async fn dispatch_picks_highest_trust_then_lowest_id() {
    let env = env().await;
    seed_robot(&env, "r_b", 90).await;
    seed_robot(&env, "r_a", 90).await;
    seed_robot(&env, "r_low", 40).await;
    seed_booked_job(&env, "job_d1").await;

    let handled = dispatch::tick(&env.ctx, 10).await.unwrap();
    assert_eq!(handled, 1);

    let conn = env.store.db.lock().await;
    let job = store::get_job(&conn, TENANT, "job_d1").unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Reserved);
    // Equal trust breaks ties by id ascending.
    assert_eq!(job.reservation.as_ref().unwrap().robot_id, "r_a");
}

#[tokio::test]
async fn dispatch_fails_with_no_robots() {
    let env = env().await;
    seed_booked_job(&env, "job_d2").await;

    dispatch::tick(&env.ctx, 10).await.unwrap();

    let conn = env.store.db.lock().await;
    let events = store::load_stream(&conn, TENANT, "job:job_d2").unwrap();
    let failed = events
        .iter()
        .find_map(|e| match &e.body {
            settld::model::event::EventBody::DispatchFailed { reason, .. } => Some(*reason),
            _ => None,
        })
        .expect("dispatch failed event");
    assert_eq!(
        failed,
        settld::model::event::DispatchFailureReason::NoRobots
    );
    // Back in BOOKED awaiting another robot.
    let job = store::get_job(&conn, TENANT, "job_d2").unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Booked);
}

#[tokio::test]
async fn overlapping_window_conflicts_the_second_job() {
    let env = env().await;
    seed_robot(&env, "r_only", 75).await;
    seed_booked_job(&env, "job_first").await;
    seed_booked_job(&env, "job_second").await;

    // Both dispatch requests are pending; the single robot can hold exactly
    // one reservation for the window.
    dispatch::tick(&env.ctx, 10).await.unwrap();

    let conn = env.store.db.lock().await;
    let first = store::get_job(&conn, TENANT, "job_first").unwrap().unwrap();
    let second = store::get_job(&conn, TENANT, "job_second").unwrap().unwrap();

    let reserved = [&first, &second]
        .iter()
        .filter(|j| j.status == JobStatus::Reserved)
        .count();
    assert_eq!(reserved, 1, "exactly one job wins the robot");

    let loser = if first.status == JobStatus::Reserved { &second } else { &first };
    assert_eq!(loser.status, JobStatus::Booked);
    let loser_events = store::load_stream(&conn, TENANT, &format!("job:{}", loser.job_id)).unwrap();
    let conflict = loser_events.iter().any(|e| {
        matches!(
            &e.body,
            settld::model::event::EventBody::DispatchFailed {
                reason: settld::model::event::DispatchFailureReason::Conflict,
                ..
            }
        )
    });
    assert!(conflict, "loser carries DISPATCH_FAILED/CONFLICT");

    // The failure also notified ops via the outbox.
    let notify = settld::store::outbox::claim(
        &conn,
        "NOTIFY_OPS_DISPATCH_FAILED",
        10,
        "test",
        chrono::Utc::now(),
    )
    .unwrap();
    assert_eq!(notify.len(), 1);
}
