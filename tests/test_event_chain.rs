mod settld_common;

use std::collections::HashMap;

use settld_common::*;

use settld::chain::{decode_public_key, verify_chain};
use settld::model::event::{Actor, EventBody};
use settld::model::job::{JobStatus, reduce};
use settld::store::{self};

// ── Chain integrity across the committer ────────────────────────────

#[tokio::test]
async fn committed_streams_verify_end_to_end() {
    let env = env().await;
    seed_booked_job(&env, "job_chain").await;

    let conn = env.store.db.lock().await;
    let events = store::load_stream(&conn, TENANT, "job:job_chain").unwrap();
    assert_eq!(events.len(), 3);

    // Every event was server-signed; resolve the key from governance.
    let governance = store::get_governance(&conn, TENANT).unwrap();
    let record = governance.active_key(SERVER_KEY_ID).expect("server key");
    let mut keys = HashMap::new();
    keys.insert(
        SERVER_KEY_ID.to_string(),
        decode_public_key(&record.public_key).unwrap(),
    );
    verify_chain(&events, &keys).unwrap();

    // Links hold pairwise.
    for pair in events.windows(2) {
        assert_eq!(
            pair[1].prev_chain_hash.as_deref(),
            Some(pair[0].chain_hash.as_str())
        );
    }
    assert_eq!(events[0].prev_chain_hash, None);
}

#[tokio::test]
async fn head_precondition_rejects_stale_appends() {
    let env = env().await;
    seed_booked_job(&env, "job_occ").await;

    let mut conn = env.store.db.lock().await;
    let events = store::load_stream(&conn, TENANT, "job:job_occ").unwrap();
    // Build an event linked to the OLD head (one behind).
    let stale_prev = events[1].chain_hash.clone();
    let stale = settld::chain::create_event(
        "job:job_occ",
        EventBody::JobCancelled {
            reason: "stale writer".into(),
        },
        Actor::System,
        chrono::Utc::now(),
        Some(stale_prev),
    )
    .unwrap();

    let err = settld::store::commit::commit_tx(
        &mut conn,
        TENANT,
        vec![settld::store::commit::Op::JobEventsAppend {
            job_id: "job_occ".to_string(),
            events: vec![stale],
        }],
        None,
    )
    .unwrap_err();
    assert_eq!(err.code(), "PREV_CHAIN_HASH_MISMATCH");
}

// ── Reducer determinism ─────────────────────────────────────────────

#[tokio::test]
async fn reduce_is_pure_and_commit_interleaving_does_not_matter() {
    let env = env().await;

    // Two jobs committed with interleaved appends.
    append_job(&env, "job_a", vec![(created_body("c1"), Actor::Requester("c1".into()))]).await;
    append_job(&env, "job_b", vec![(created_body("c2"), Actor::Requester("c2".into()))]).await;
    append_job(&env, "job_a", vec![(quote_body("qa"), Actor::Pricing)]).await;
    append_job(&env, "job_b", vec![(quote_body("qb"), Actor::Pricing)]).await;
    append_job(&env, "job_a", vec![(booking_body("qa"), Actor::Requester("c1".into()))]).await;

    let conn = env.store.db.lock().await;
    let stream_a = store::load_stream(&conn, TENANT, "job:job_a").unwrap();
    let once = reduce(&stream_a).unwrap();
    let twice = reduce(&stream_a).unwrap();
    assert_eq!(once, twice);
    assert_eq!(once.status, JobStatus::Booked);

    // The projection row equals a fresh fold of the stream.
    let projected = store::get_job(&conn, TENANT, "job_a").unwrap().unwrap();
    assert_eq!(projected, once);

    let job_b = store::get_job(&conn, TENANT, "job_b").unwrap().unwrap();
    assert_eq!(job_b.status, JobStatus::Quoted);
}

#[tokio::test]
async fn illegal_transitions_are_rejected_by_the_fold() {
    let env = env().await;
    append_job(&env, "job_x", vec![(created_body("c1"), Actor::Requester("c1".into()))]).await;

    // Booking without a quote must fail inside the committer's rebuild.
    let mut conn = env.store.db.lock().await;
    let head = store::stream_head(&conn, TENANT, "job:job_x").unwrap();
    let bad = settld::workers::chain_events(
        "job:job_x",
        head,
        vec![(booking_body("q_missing"), Actor::System)],
        chrono::Utc::now(),
        &env.signer,
    )
    .unwrap();
    let err = settld::store::commit::commit_tx(
        &mut conn,
        TENANT,
        vec![settld::store::commit::Op::JobEventsAppend {
            job_id: "job_x".to_string(),
            events: bad,
        }],
        None,
    )
    .unwrap_err();
    assert!(matches!(err, settld::store::commit::CommitError::Store(_)));
}
