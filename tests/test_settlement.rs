mod settld_common;

use settld_common::*;

use chrono::Utc;
use settld::chain::generate_signing_key;
use settld::engine::settle;
use settld::model::agent_run::RunStatus;
use settld::model::event::{
    Actor, AgreementTerms, DisputeVerdict, EventBody, SignerOwnerKind, VerdictOutcome,
    VerificationMethod, VerificationStatus,
};
use settld::model::settlement::{
    DecisionStatus, SettlementStatus, sign_verdict,
};
use settld::store::commit::{Op, commit_tx};
use settld::store::{self};
use settld::workers::chain_events;

const RUN_AMOUNT: i64 = 50_000; // $500

fn agreement() -> AgreementTerms {
    AgreementTerms {
        amount_cents: RUN_AMOUNT,
        currency: "USD".to_string(),
        dispute_window_days: 7,
        kill_fee_rate_pct: 20,
        milestones: Vec::new(),
    }
}

async fn seed_run(env: &TestEnv, run_id: &str, verification: VerificationMethod) {
    let mut conn = env.store.db.lock().await;
    let stream_id = format!("run:{run_id}");
    let events = chain_events(
        &stream_id,
        None,
        vec![(
            EventBody::RunCreated {
                run_id: run_id.to_string(),
                agent_id: "agent_payee".to_string(),
                task_id: "task_1".to_string(),
                payer_agent_id: "agent_payer".to_string(),
                verification_method: verification,
                agreement: agreement(),
            },
            Actor::Agent("agent_payee".to_string()),
        )],
        now(),
        &env.signer,
    )
    .unwrap();
    commit_tx(
        &mut conn,
        TENANT,
        vec![Op::AgentRunEventsAppend {
            run_id: run_id.to_string(),
            events,
        }],
        None,
    )
    .unwrap();

    let run = store::get_agent_run(&conn, TENANT, run_id).unwrap().unwrap();
    settle::lock_for_run(&mut conn, TENANT, &run, now()).unwrap();
}

async fn finish_run(env: &TestEnv, run_id: &str, status: VerificationStatus, fail: bool) {
    let mut conn = env.store.db.lock().await;
    let stream_id = format!("run:{run_id}");
    let head = store::stream_head(&conn, TENANT, &stream_id).unwrap();
    let body = if fail {
        EventBody::RunFailed {
            reason: "agent crashed".to_string(),
            verification_status: status,
        }
    } else {
        EventBody::RunCompleted {
            verification_status: status,
            output_ref: None,
        }
    };
    let mut bodies = vec![(EventBody::RunStarted {}, Actor::Agent("agent_payee".into()))];
    bodies.push((body, Actor::Agent("agent_payee".into())));
    let events = chain_events(&stream_id, head, bodies, now(), &env.signer).unwrap();
    commit_tx(
        &mut conn,
        TENANT,
        vec![Op::AgentRunEventsAppend {
            run_id: run_id.to_string(),
            events,
        }],
        None,
    )
    .unwrap();
}

async fn wallet_totals(env: &TestEnv) -> i64 {
    let conn = env.store.db.lock().await;
    store::list_wallets(&conn, TENANT)
        .unwrap()
        .iter()
        .map(|w| w.available_cents + w.escrow_locked_cents)
        .sum()
}

// ── Lock / auto-resolve ─────────────────────────────────────────────

#[tokio::test]
async fn green_run_releases_escrow_to_the_payee() {
    let env = env().await;
    seed_wallet(&env, "agent_payer", 100_000).await;
    seed_wallet(&env, "agent_payee", 0).await;
    seed_run(&env, "run_g", VerificationMethod::Attestation).await;
    finish_run(&env, "run_g", VerificationStatus::Green, false).await;

    let mut conn = env.store.db.lock().await;
    let (settlement, decision) =
        settle::resolve_terminal_run(&mut conn, TENANT, "run_g", &env.signer, now()).unwrap();

    assert_eq!(settlement.status, SettlementStatus::Released);
    assert_eq!(settlement.decision_status, DecisionStatus::AutoResolved);
    assert_eq!(decision.release_amount_cents, RUN_AMOUNT);
    assert!(settlement.dispute_window_ends_at.is_some());

    let payer = store::get_wallet(&conn, TENANT, "agent_payer").unwrap().unwrap();
    let payee = store::get_wallet(&conn, TENANT, "agent_payee").unwrap().unwrap();
    assert_eq!(payer.available_cents, 50_000);
    assert_eq!(payer.escrow_locked_cents, 0);
    assert_eq!(payee.available_cents, RUN_AMOUNT);

    // Ledger parity held the whole way.
    settle::reconcile_wallets(&conn).unwrap();
}

#[tokio::test]
async fn failed_run_refunds_the_payer() {
    let env = env().await;
    seed_wallet(&env, "agent_payer", RUN_AMOUNT).await;
    seed_wallet(&env, "agent_payee", 0).await;
    seed_run(&env, "run_f", VerificationMethod::Attestation).await;
    finish_run(&env, "run_f", VerificationStatus::Red, true).await;

    let mut conn = env.store.db.lock().await;
    let (settlement, _) =
        settle::resolve_terminal_run(&mut conn, TENANT, "run_f", &env.signer, now()).unwrap();
    assert_eq!(settlement.status, SettlementStatus::Refunded);
    let payer = store::get_wallet(&conn, TENANT, "agent_payer").unwrap().unwrap();
    assert_eq!(payer.available_cents, RUN_AMOUNT);
    assert_eq!(payer.escrow_locked_cents, 0);
}

#[tokio::test]
async fn amber_parks_in_manual_review_then_resolves() {
    let env = env().await;
    seed_wallet(&env, "agent_payer", RUN_AMOUNT).await;
    seed_wallet(&env, "agent_payee", 0).await;
    seed_run(&env, "run_m", VerificationMethod::ZoneCoverage).await;
    finish_run(&env, "run_m", VerificationStatus::Amber, false).await;

    let mut conn = env.store.db.lock().await;
    let (settlement, _) =
        settle::resolve_terminal_run(&mut conn, TENANT, "run_m", &env.signer, now()).unwrap();
    assert_eq!(settlement.status, SettlementStatus::Locked);
    assert_eq!(settlement.decision_status, DecisionStatus::ManualReviewRequired);

    let resolved =
        settle::manual_resolve(&mut conn, TENANT, "run_m", 50, "ops@corp", &env.signer, now())
            .unwrap();
    assert_eq!(resolved.decision_status, DecisionStatus::ManualResolved);
    assert_eq!(resolved.release_cents, 25_000);
    assert_eq!(resolved.refund_cents, 25_000);
}

// ── Dispute with a signed verdict (partial outcome) ─────────────────

#[tokio::test]
async fn partial_verdict_claws_back_the_over_release() {
    let env = env().await;
    seed_wallet(&env, "agent_payer", RUN_AMOUNT).await;
    seed_wallet(&env, "agent_payee", 0).await;
    seed_run(&env, "run_v", VerificationMethod::Attestation).await;
    finish_run(&env, "run_v", VerificationStatus::Green, false).await;

    // Auto-release 100% of $500.
    {
        let mut conn = env.store.db.lock().await;
        settle::resolve_terminal_run(&mut conn, TENANT, "run_v", &env.signer, now()).unwrap();
    }

    // Register the arbiter's agent key, open the dispute, sign the verdict.
    let (arbiter_key, arbiter_public) = generate_signing_key();
    {
        let mut conn = env.store.db.lock().await;
        let head = store::stream_head(&conn, TENANT, "governance").unwrap();
        let events = chain_events(
            "governance",
            head,
            vec![(
                EventBody::SignerKeyRegistered {
                    key_id: "agentkey_arbiter".to_string(),
                    public_key: arbiter_public,
                    owner_kind: SignerOwnerKind::Agent,
                    owner_id: Some("arbiter_1".to_string()),
                },
                Actor::System,
            )],
            now(),
            &env.signer,
        )
        .unwrap();
        commit_tx(&mut conn, TENANT, vec![Op::GovernanceEventsAppend { events }], None).unwrap();

        let head = store::stream_head(&conn, TENANT, "run:run_v").unwrap();
        let events = chain_events(
            "run:run_v",
            head,
            vec![(
                EventBody::RunDisputeOpened {
                    dispute_id: "dsp_v".to_string(),
                    opened_by: "agent_payer".to_string(),
                    reason: "work incomplete".to_string(),
                },
                Actor::Agent("agent_payer".to_string()),
            )],
            now(),
            &env.signer,
        )
        .unwrap();
        commit_tx(
            &mut conn,
            TENANT,
            vec![Op::AgentRunEventsAppend {
                run_id: "run_v".to_string(),
                events,
            }],
            None,
        )
        .unwrap();
    }

    let mut verdict = DisputeVerdict {
        verdict_id: "vrd_1".to_string(),
        dispute_id: "dsp_v".to_string(),
        outcome: VerdictOutcome::Partial,
        release_rate_pct: 40,
        rationale: "partial delivery".to_string(),
        arbiter_agent_id: "arbiter_1".to_string(),
        signed_at: Utc::now(),
        signature: String::new(),
        signer_key_id: String::new(),
    };
    sign_verdict(&mut verdict, &arbiter_key, "agentkey_arbiter").unwrap();

    let mut conn = env.store.db.lock().await;
    let settlement =
        settle::close_dispute_with_verdict(&mut conn, TENANT, "run_v", verdict, &env.signer, now())
            .unwrap();

    // 40% stays with the payee; 60% claws back to the payer.
    assert_eq!(settlement.release_cents, 20_000);
    assert_eq!(settlement.refund_cents, 30_000);
    let payer = store::get_wallet(&conn, TENANT, "agent_payer").unwrap().unwrap();
    let payee = store::get_wallet(&conn, TENANT, "agent_payee").unwrap().unwrap();
    assert_eq!(payer.available_cents, 30_000);
    assert_eq!(payee.available_cents, 20_000);
    settle::reconcile_wallets(&conn).unwrap();

    // The verdict went out as a hash-addressed artifact on the rails.
    let deliveries: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM artifacts WHERE artifact_type = 'DisputeVerdict.v1'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(deliveries, 1);
}

// ── Cancellation / conservation ─────────────────────────────────────

#[tokio::test]
async fn cancel_applies_the_kill_fee() {
    let env = env().await;
    seed_wallet(&env, "agent_payer", RUN_AMOUNT).await;
    seed_wallet(&env, "agent_payee", 0).await;
    seed_run(&env, "run_c", VerificationMethod::Attestation).await;

    let mut conn = env.store.db.lock().await;
    let settlement = settle::cancel_agreement(
        &mut conn, TENANT, "run_c", "customer cancelled", 20, &env.signer, now(),
    )
    .unwrap();
    assert_eq!(settlement.release_cents, 10_000);
    assert_eq!(settlement.refund_cents, 40_000);

    let run = store::get_agent_run(&conn, TENANT, "run_c").unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.cancelled);
}

#[tokio::test]
async fn wallet_totals_are_conserved_across_the_lifecycle() {
    let env = env().await;
    seed_wallet(&env, "agent_payer", 120_000).await;
    seed_wallet(&env, "agent_payee", 5_000).await;
    let initial = wallet_totals(&env).await;

    seed_run(&env, "run_w", VerificationMethod::Attestation).await;
    assert_eq!(wallet_totals(&env).await, initial);

    finish_run(&env, "run_w", VerificationStatus::Green, false).await;
    {
        let mut conn = env.store.db.lock().await;
        settle::resolve_terminal_run(&mut conn, TENANT, "run_w", &env.signer, now()).unwrap();
    }
    assert_eq!(wallet_totals(&env).await, initial);
}
