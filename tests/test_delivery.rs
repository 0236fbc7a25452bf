mod settld_common;

use settld_common::*;

use chrono::Utc;
use settld::delivery::{
    DELIVERY_MAX_ATTEMPTS, Destination, DestinationKind, DeliveryState, dedupe_key,
};
use settld::engine::settle::deliveries_for_artifact;
use settld::store::commit::{Op, commit_tx};
use settld::store::{self};
use settld::workers::delivery::MockTransport;
use settld::workers::{artifacts, delivery, proof};

async fn seed_webhook(env: &TestEnv, destination_id: &str) {
    let conn = env.store.db.lock().await;
    store::put_destination(
        &conn,
        TENANT,
        &Destination {
            destination_id: destination_id.to_string(),
            kind: DestinationKind::Webhook {
                url: "https://hooks.example.com/settld".to_string(),
                secret: "whsec_test".to_string(),
            },
            enabled: true,
        },
    )
    .unwrap();
}

async fn completed_job(env: &TestEnv, job_id: &str) {
    seed_booked_job(env, job_id).await;
    seed_robot(env, "r1", 80).await;
    drive_to_completed(env, job_id, "r1").await;
    proof::tick(&env.ctx, 10).await.unwrap();
}

#[tokio::test]
async fn work_certificate_is_derived_and_delivered_with_hmac() {
    let env = env().await;
    seed_webhook(&env, "dest_hook").await;
    completed_job(&env, "job_dl1").await;

    let derived = artifacts::tick(&env.ctx, 10).await.unwrap();
    assert!(derived >= 1);

    let shipped = delivery::tick(&env.ctx, 10).await.unwrap();
    assert!(shipped >= 1);

    let sent = env.transport.sent.lock().await;
    assert!(!sent.is_empty());
    let (url, body) = &sent[0];
    assert_eq!(url, "https://hooks.example.com/settld");
    assert_eq!(body["artifact_type"], "WorkCertificate.v1");
    assert!(body["artifact_hash"].as_str().unwrap().len() == 64);
}

#[tokio::test]
async fn dedupe_key_makes_re_enqueue_a_noop() {
    let env = env().await;
    seed_webhook(&env, "dest_hook").await;
    completed_job(&env, "job_dl2").await;
    artifacts::tick(&env.ctx, 10).await.unwrap();

    let mut conn = env.store.db.lock().await;
    let artifact_id: String = conn
        .query_row("SELECT artifact_id FROM artifacts LIMIT 1", [], |row| row.get(0))
        .unwrap();
    let artifact = store::get_artifact(&conn, TENANT, &artifact_id).unwrap().unwrap();

    // Re-deriving the same artifact produces the same dedupe key; the
    // second enqueue is ignored.
    let ops = deliveries_for_artifact(&conn, TENANT, &artifact, "job:job_dl2", Utc::now()).unwrap();
    commit_tx(&mut conn, TENANT, ops, None).unwrap();

    let expected = dedupe_key(
        TENANT,
        "dest_hook",
        &artifact.artifact_type,
        &artifact.artifact_id,
        &artifact.artifact_hash,
    );
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM deliveries WHERE dedupe_key = ?1",
            rusqlite::params![expected],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn transient_failure_retries_with_backoff_then_ships() {
    let env = env_with_transport(MockTransport::new(1)).await;
    seed_webhook(&env, "dest_hook").await;
    completed_job(&env, "job_dl3").await;
    artifacts::tick(&env.ctx, 10).await.unwrap();

    // First attempt fails; the delivery goes back to pending with attempts=1
    // and a future next_attempt_at.
    let shipped = delivery::tick(&env.ctx, 10).await.unwrap();
    assert_eq!(shipped, 0);
    let delivery_id = {
        let conn = env.store.db.lock().await;
        let (id, attempts, state): (String, u32, String) = conn
            .query_row(
                "SELECT id, attempts, state FROM deliveries LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(attempts, 1);
        assert_eq!(state, "pending");
        id
    };

    // Pull the retry forward and tick again; the mock now succeeds.
    {
        let conn = env.store.db.lock().await;
        let d = store::get_delivery(&conn, TENANT, &delivery_id).unwrap().unwrap();
        store::update_delivery_state(
            &conn, TENANT, &delivery_id, DeliveryState::Pending, d.attempts, Utc::now(), None,
        )
        .unwrap();
    }
    let shipped = delivery::tick(&env.ctx, 10).await.unwrap();
    assert_eq!(shipped, 1);
}

#[tokio::test]
async fn exhausted_attempts_dead_letter_the_delivery() {
    let env = env_with_transport(MockTransport::new(u32::MAX)).await;
    seed_webhook(&env, "dest_hook").await;
    completed_job(&env, "job_dl4").await;
    artifacts::tick(&env.ctx, 10).await.unwrap();

    for _ in 0..DELIVERY_MAX_ATTEMPTS {
        delivery::tick(&env.ctx, 10).await.unwrap();
        // Pull the next retry forward.
        let conn = env.store.db.lock().await;
        if let Ok((id, attempts, state)) = conn.query_row(
            "SELECT id, attempts, state FROM deliveries LIMIT 1",
            [],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?, row.get::<_, String>(2)?)),
        ) {
            if state == "pending" {
                store::update_delivery_state(
                    &conn,
                    TENANT,
                    &id,
                    DeliveryState::Pending,
                    attempts,
                    Utc::now(),
                    None,
                )
                .unwrap();
            }
        }
    }

    let conn = env.store.db.lock().await;
    let (state, last_error): (String, String) = conn
        .query_row(
            "SELECT state, last_error FROM deliveries LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(state, "failed");
    assert!(last_error.starts_with("DLQ:"));
}

#[tokio::test]
async fn scope_ordering_holds_back_later_deliveries() {
    let env = env().await;
    seed_webhook(&env, "dest_hook").await;

    // Two deliveries in one scope with ascending order_seq; only the head is
    // claimable.
    {
        let mut conn = env.store.db.lock().await;
        for (seq, aid) in [(0, "art_a"), (1, "art_b")] {
            commit_tx(
                &mut conn,
                TENANT,
                vec![Op::DeliveryEnqueue {
                    delivery: settld::delivery::new_delivery(
                        TENANT, "dest_hook", "WorkCertificate.v1", aid, "hash", "scope:1", seq, 0,
                        Utc::now(),
                    ),
                }],
                None,
            )
            .unwrap();
        }
        let due = store::due_deliveries(&conn, Utc::now(), 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].1.artifact_id, "art_a");
    }
}
