mod settld_common;

use settld_common::*;

use settld::model::event::{
    Actor, EventBody, ProofGateMode, ProofStatus, SettlementProofRef,
};
use settld::store::{self};
use settld::validate::ValidationError;
use settld::validate::proof::check_settlement_proof_gate;
use settld::workers::proof;

async fn completed_job_with_proof(env: &TestEnv, job_id: &str) {
    seed_booked_job(env, job_id).await;
    seed_robot(env, "r1", 80).await;
    drive_to_completed(env, job_id, "r1").await;
    // Completion derived a PROOF_EVAL_ENQUEUE; the worker cuts the proof.
    proof::tick(&env.ctx, 10).await.unwrap();
}

fn proof_ref_for(job: &settld::model::job::Job) -> SettlementProofRef {
    let p = job.latest_proof().expect("proof present");
    SettlementProofRef {
        event_id: p.event_id.clone(),
        chain_hash: p.chain_hash.clone(),
        payload_hash: p.payload_hash.clone(),
        facts_hash: p.eval.facts_hash.clone(),
        customer_policy_hash: p.eval.customer_policy_hash.clone(),
    }
}

#[tokio::test]
async fn fresh_matching_proof_passes_the_gate() {
    let env = env().await;
    completed_job_with_proof(&env, "job_p1").await;

    let conn = env.store.db.lock().await;
    let job = store::get_job(&conn, TENANT, "job_p1").unwrap().unwrap();
    let proof = job.latest_proof().unwrap();
    assert_eq!(proof.eval.status, ProofStatus::Pass);

    let events = store::load_stream(&conn, TENANT, "job:job_p1").unwrap();
    let proof_ref = proof_ref_for(&job);
    check_settlement_proof_gate(&job, &events, ProofGateMode::Strict, "", None, Some(&proof_ref))
        .unwrap();
}

#[tokio::test]
async fn missing_proof_is_proof_required() {
    let env = env().await;
    seed_booked_job(&env, "job_p2").await;
    seed_robot(&env, "r1", 80).await;
    drive_to_completed(&env, "job_p2", "r1").await;
    // No proof worker tick: the gate must demand one.

    let conn = env.store.db.lock().await;
    let job = store::get_job(&conn, TENANT, "job_p2").unwrap().unwrap();
    let events = store::load_stream(&conn, TENANT, "job:job_p2").unwrap();
    let err =
        check_settlement_proof_gate(&job, &events, ProofGateMode::Strict, "", None, None)
            .unwrap_err();
    assert!(matches!(err, ValidationError::ProofRequired));
}

#[tokio::test]
async fn late_coverage_report_stales_the_proof_and_reproof_is_insufficient() {
    let env = env().await;
    completed_job_with_proof(&env, "job_p3").await;

    // An ingest adds coverage outside the required zone set after the proof
    // was cut.
    append_job(
        &env,
        "job_p3",
        vec![(
            EventBody::ZoneCoverageReported {
                zone: "z_outside".to_string(),
                coverage_pct: 100,
                covered_at: now(),
            },
            Actor::System,
        )],
    )
    .await;

    {
        let conn = env.store.db.lock().await;
        let job = store::get_job(&conn, TENANT, "job_p3").unwrap().unwrap();
        let events = store::load_stream(&conn, TENANT, "job:job_p3").unwrap();
        let proof_ref = proof_ref_for(&job);
        let err = check_settlement_proof_gate(
            &job,
            &events,
            ProofGateMode::Strict,
            "",
            None,
            Some(&proof_ref),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::ProofStale));
    }

    // Re-evaluating over the new facts lands on INSUFFICIENT_EVIDENCE, and
    // settling without a forfeiture stays blocked.
    {
        let mut conn = env.store.db.lock().await;
        settld::store::commit::commit_tx(
            &mut conn,
            TENANT,
            vec![settld::store::commit::Op::OutboxEnqueue {
                topic: "PROOF_EVAL_ENQUEUE".to_string(),
                payload: serde_json::json!({ "job_id": "job_p3" }),
            }],
            None,
        )
        .unwrap();
    }
    proof::tick(&env.ctx, 10).await.unwrap();

    let conn = env.store.db.lock().await;
    let job = store::get_job(&conn, TENANT, "job_p3").unwrap().unwrap();
    let latest = job.latest_proof().unwrap();
    assert_eq!(latest.eval.status, ProofStatus::InsufficientEvidence);

    let events = store::load_stream(&conn, TENANT, "job:job_p3").unwrap();
    let proof_ref = proof_ref_for(&job);
    let err = check_settlement_proof_gate(
        &job,
        &events,
        ProofGateMode::Strict,
        "",
        None,
        Some(&proof_ref),
    )
    .unwrap_err();
    assert!(matches!(err, ValidationError::ProofInsufficient));
}

#[tokio::test]
async fn warn_mode_bypasses_the_gate() {
    let env = env().await;
    seed_booked_job(&env, "job_p4").await;
    seed_robot(&env, "r1", 80).await;
    drive_to_completed(&env, "job_p4", "r1").await;

    let conn = env.store.db.lock().await;
    let job = store::get_job(&conn, TENANT, "job_p4").unwrap().unwrap();
    let events = store::load_stream(&conn, TENANT, "job:job_p4").unwrap();
    check_settlement_proof_gate(&job, &events, ProofGateMode::Warn, "", None, None).unwrap();
}

#[tokio::test]
async fn settlement_proof_ref_must_cite_the_fresh_proof_exactly() {
    let env = env().await;
    completed_job_with_proof(&env, "job_p5").await;

    let conn = env.store.db.lock().await;
    let job = store::get_job(&conn, TENANT, "job_p5").unwrap().unwrap();
    let events = store::load_stream(&conn, TENANT, "job:job_p5").unwrap();

    let mut wrong = proof_ref_for(&job);
    wrong.facts_hash = "tampered".to_string();
    let err = check_settlement_proof_gate(
        &job,
        &events,
        ProofGateMode::Strict,
        "",
        None,
        Some(&wrong),
    )
    .unwrap_err();
    assert!(matches!(err, ValidationError::SettlementProofRefRequired));
}
