mod settld_common;

use settld_common::*;

use chrono::{Duration, Utc};
use serde_json::json;
use settld::model::event::{
    Actor, EventBody, HoldPolicy, ProofGateMode, TenantPolicyOverride,
};
use settld::model::month::MonthStatus;
use settld::store::commit::{Op, commit_tx};
use settld::store::{self};
use settld::workers::month_close::{self, month_of};
use settld::workers::{chain_events, proof};

async fn set_tenant_policy(env: &TestEnv, policy: TenantPolicyOverride) {
    let mut conn = env.store.db.lock().await;
    let head = store::stream_head(&conn, TENANT, "governance").unwrap();
    let events = chain_events(
        "governance",
        head,
        vec![(
            EventBody::TenantPolicyUpdated {
                effective_from: Utc::now() - Duration::days(365),
                policy,
            },
            Actor::System,
        )],
        now(),
        &env.signer,
    )
    .unwrap();
    commit_tx(&mut conn, TENANT, vec![Op::GovernanceEventsAppend { events }], None).unwrap();
}

async fn request_month_close(env: &TestEnv, month: &str) {
    let mut conn = env.store.db.lock().await;
    commit_tx(
        &mut conn,
        TENANT,
        vec![Op::OutboxEnqueue {
            topic: "MONTH_CLOSE_REQUESTED".to_string(),
            payload: json!({ "month": month, "basis": "accrual" }),
        }],
        None,
    )
    .unwrap();
}

/// A completed job whose proof pass cuts a hold (holdback mode).
async fn job_with_open_hold(env: &TestEnv, job_id: &str) {
    seed_booked_job(env, job_id).await;
    seed_robot(env, "r1", 80).await;
    drive_to_completed(env, job_id, "r1").await;
    proof::tick(&env.ctx, 10).await.unwrap();

    let conn = env.store.db.lock().await;
    let job = store::get_job(&conn, TENANT, job_id).unwrap().unwrap();
    assert!(job.active_hold().is_some(), "holdback mode cut a hold");
}

#[tokio::test]
async fn open_hold_in_period_blocks_the_close() {
    let env = env().await;
    set_tenant_policy(
        &env,
        TenantPolicyOverride {
            proof_gate_mode: Some(ProofGateMode::Holdback),
            month_close_hold_policy: Some(HoldPolicy::BlockHoldsOriginatedInPeriod),
            ..TenantPolicyOverride::default()
        },
    )
    .await;
    job_with_open_hold(&env, "job_mc1").await;

    let month = month_of(Utc::now());
    request_month_close(&env, &month).await;
    month_close::tick(&env.ctx, 10).await.unwrap();

    // Not closed; the request was processed as failed with open_holds and
    // the metric incremented.
    let conn = env.store.db.lock().await;
    assert!(!store::month_is_closed(&conn, TENANT, &month, "accrual").unwrap());
    let last_error: Option<String> = conn
        .query_row(
            "SELECT last_error FROM outbox WHERE topic = 'MONTH_CLOSE_REQUESTED'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(last_error.as_deref(), Some("open_holds"));
    assert_eq!(
        env.ctx
            .metrics
            .month_close_blocked_total
            .with_label_values(&["open_holds"])
            .get(),
        1
    );
}

#[tokio::test]
async fn disclosure_policy_closes_with_a_note() {
    let env = env().await;
    set_tenant_policy(
        &env,
        TenantPolicyOverride {
            proof_gate_mode: Some(ProofGateMode::Holdback),
            month_close_hold_policy: Some(HoldPolicy::AllowWithDisclosure),
            ..TenantPolicyOverride::default()
        },
    )
    .await;
    job_with_open_hold(&env, "job_mc2").await;

    let month = month_of(Utc::now());
    request_month_close(&env, &month).await;
    month_close::tick(&env.ctx, 10).await.unwrap();

    let conn = env.store.db.lock().await;
    let mc = store::get_month(&conn, TENANT, &month, "accrual").unwrap().unwrap();
    assert_eq!(mc.status, MonthStatus::Closed);
    assert!(mc.disclosure.as_deref().unwrap_or("").contains("open holds"));
    assert!(mc.statement_hash.is_some());
    assert!(mc.finance_pack_hash.is_some());

    // The deterministic bundle landed on disk.
    let bundle = env
        .ctx
        .config
        .data_dir
        .join("finance")
        .join(TENANT)
        .join(format!("{month}-accrual.zip"));
    assert!(bundle.exists());
}

#[tokio::test]
async fn clean_month_closes_and_reopen_allows_a_second_close() {
    let env = env().await;
    let month = month_of(Utc::now());
    request_month_close(&env, &month).await;
    month_close::tick(&env.ctx, 10).await.unwrap();

    {
        let conn = env.store.db.lock().await;
        assert!(store::month_is_closed(&conn, TENANT, &month, "accrual").unwrap());
    }

    // Reopen, then close again through a fresh request.
    {
        let mut conn = env.store.db.lock().await;
        let stream_id = settld::model::month::stream_id(&month, "accrual");
        let head = store::stream_head(&conn, TENANT, &stream_id).unwrap();
        let events = chain_events(
            &stream_id,
            head,
            vec![(
                EventBody::MonthCloseReopened {
                    month: month.clone(),
                    basis: "accrual".to_string(),
                    reason: "late invoice".to_string(),
                },
                Actor::Finance("controller".to_string()),
            )],
            now(),
            &env.signer,
        )
        .unwrap();
        commit_tx(&mut conn, TENANT, vec![Op::MonthEventsAppend { stream_id, events }], None)
            .unwrap();
        assert!(!store::month_is_closed(&conn, TENANT, &month, "accrual").unwrap());
    }

    request_month_close(&env, &month).await;
    month_close::tick(&env.ctx, 10).await.unwrap();
    let conn = env.store.db.lock().await;
    assert!(store::month_is_closed(&conn, TENANT, &month, "accrual").unwrap());
}

#[tokio::test]
async fn settling_into_a_closed_month_is_rejected() {
    let env = env().await;
    let month = month_of(Utc::now());
    request_month_close(&env, &month).await;
    month_close::tick(&env.ctx, 10).await.unwrap();

    // A settle gate assembled against the closed month must refuse.
    seed_booked_job(&env, "job_mc3").await;
    seed_robot(&env, "r1", 80).await;
    drive_to_completed(&env, "job_mc3", "r1").await;
    proof::tick(&env.ctx, 10).await.unwrap();

    let conn = env.store.db.lock().await;
    let job = store::get_job(&conn, TENANT, "job_mc3").unwrap().unwrap();
    let events = store::load_stream(&conn, TENANT, "job:job_mc3").unwrap();
    let governance = store::get_governance(&conn, TENANT).unwrap();
    let policy = governance.policy_at(now());

    let head = events.last().map(|e| e.chain_hash.clone());
    let settle_events = chain_events(
        "job:job_mc3",
        head,
        vec![(
            EventBody::JobSettled {
                amount_cents: JOB_AMOUNT_CENTS,
                payer_agent_id: "agent_payer".to_string(),
                payee_agent_id: "agent_payee".to_string(),
                settled_at: Utc::now(),
                hold_id: None,
                settlement_proof_ref: None,
            },
            Actor::System,
        )],
        now(),
        &env.signer,
    )
    .unwrap();

    let gate = settld::validate::job::JobGateCtx {
        now: now(),
        policy: &policy,
        governance: &governance,
        robot: None,
        operator: None,
        operator_active_coverage: 0,
        has_overlapping_reservation: false,
        contract_policy_hash: None,
        contract_window: None,
        settled_month_closed: Some(month),
        operator_policy_hash: "",
    };
    let err = settld::validate::job::validate_job_event(&job, &events, &settle_events[0], &gate)
        .unwrap_err();
    assert_eq!(err.code(), "MONTH_CLOSED");
}
