//! Settlement engine: escrow locks on run creation, policy-driven resolution
//! on terminal runs, manual resolves, disputes with signed verdicts, change
//! orders, and kill-fee cancellation. Every mutation goes through one
//! `commit_tx` call.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use thiserror::Error;
use tracing::info;

use crate::chain::{ChainError, Event, ServerSigner, create_event};
use crate::model::agent_run::AgentRun;
use crate::model::artifact::{self, DISPUTE_VERDICT_V1};
use crate::model::event::{Actor, DisputeVerdict, EventBody, VerdictOutcome};
use crate::model::settlement::{
    DecisionStatus, PolicyDecision, SettlementPolicy, SettlementRecord, SettlementStatus,
    apply_milestone_release, dispute_window_end, evaluate_settlement_policy,
};
use crate::model::wallet::{
    self, AgentWallet, LedgerProjection, WalletError, available_account, escrow_account,
};
use crate::store::commit::{CommitError, Op, commit_tx};
use crate::store::{self, StoreError};
use crate::validate::ValidationError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("settlement is {state}, cannot {action}")]
    BadState { state: String, action: &'static str },

    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Commit(#[from] CommitError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Chain(#[from] ChainError),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::BadState { .. } => "SETTLEMENT_BAD_STATE",
            EngineError::Wallet(e) => e.code(),
            EngineError::Store(_) => "STORE_ERROR",
            EngineError::Commit(e) => e.code(),
            EngineError::Validation(e) => e.code(),
            EngineError::Chain(e) => e.code(),
        }
    }
}

/// Seed an in-memory projection with the persisted balances for the accounts
/// a wallet op will touch, so parity checks run against real history.
fn seeded_ledger(
    conn: &Connection,
    tenant_id: &str,
    accounts: &[String],
) -> Result<LedgerProjection, StoreError> {
    let mut ledger = LedgerProjection::default();
    for account in accounts {
        let balance = store::ledger_balance(conn, tenant_id, account)?;
        if balance != 0 {
            ledger.balances.insert(account.clone(), balance);
        }
    }
    Ok(ledger)
}

fn wallet_accounts(wallet: &AgentWallet) -> [String; 2] {
    [
        available_account(&wallet.agent_id),
        escrow_account(&wallet.agent_id),
    ]
}

fn ledger_ops(ledger: LedgerProjection) -> Vec<Op> {
    ledger
        .postings
        .into_iter()
        .map(|posting| Op::LedgerPost { posting })
        .collect()
}

fn load_wallet(
    conn: &Connection,
    tenant_id: &str,
    agent_id: &str,
) -> Result<AgentWallet, EngineError> {
    store::get_wallet(conn, tenant_id, agent_id)?
        .ok_or_else(|| EngineError::NotFound(format!("wallet for agent {agent_id}")))
}

fn load_settlement(
    conn: &Connection,
    tenant_id: &str,
    run_id: &str,
) -> Result<SettlementRecord, EngineError> {
    store::get_settlement(conn, tenant_id, run_id)?
        .ok_or_else(|| EngineError::NotFound(format!("settlement for run {run_id}")))
}

fn tenant_policy(conn: &Connection, tenant_id: &str) -> Result<SettlementPolicy, EngineError> {
    Ok(store::get_settlement_policy(conn, tenant_id, "default")?.unwrap_or_default())
}

/// Append a run event, server-signed, through commit_tx with extra ops.
fn append_run_event(
    conn: &mut Connection,
    tenant_id: &str,
    run_id: &str,
    body: EventBody,
    actor: Actor,
    now: DateTime<Utc>,
    signer: &ServerSigner,
    mut extra_ops: Vec<Op>,
) -> Result<Event, EngineError> {
    let stream_id = format!("run:{run_id}");
    let head = store::stream_head(conn, tenant_id, &stream_id)?;
    let mut event = create_event(&stream_id, body, actor, now, head)?;
    signer.sign(&mut event);

    let mut ops = vec![Op::AgentRunEventsAppend {
        run_id: run_id.to_string(),
        events: vec![event.clone()],
    }];
    ops.append(&mut extra_ops);
    commit_tx(conn, tenant_id, ops, None)?;
    Ok(event)
}

/// Lock the agreement amount from the payer's wallet when a run is created.
pub fn lock_for_run(
    conn: &mut Connection,
    tenant_id: &str,
    run: &AgentRun,
    now: DateTime<Utc>,
) -> Result<SettlementRecord, EngineError> {
    let mut payer = load_wallet(conn, tenant_id, &run.payer_agent_id)?;
    let mut ledger = seeded_ledger(conn, tenant_id, &wallet_accounts(&payer))?;
    wallet::lock_escrow(&mut payer, &mut ledger, run.agreement.amount_cents, now)?;

    let settlement = SettlementRecord {
        run_id: run.run_id.clone(),
        status: SettlementStatus::Locked,
        decision_status: DecisionStatus::Pending,
        release_cents: 0,
        refund_cents: 0,
        locked_cents: run.agreement.amount_cents,
        payer_agent_id: run.payer_agent_id.clone(),
        payee_agent_id: run.agent_id.clone(),
        currency: run.agreement.currency.clone(),
        dispute_id: None,
        verdict_id: None,
        resolution_event_id: None,
        dispute_window_ends_at: None,
        revision: 1,
        updated_at: now,
    };

    let mut ops = vec![Op::AgentWalletUpsert { wallet: payer }];
    ops.extend(ledger_ops(ledger));
    ops.push(Op::AgentRunSettlementUpsert {
        settlement: settlement.clone(),
    });
    commit_tx(conn, tenant_id, ops, None)?;
    Ok(settlement)
}

/// Move escrow per a decided split and update the settlement record.
/// Returns the ops; the caller owns the commit.
fn disburse_ops(
    conn: &Connection,
    tenant_id: &str,
    settlement: &mut SettlementRecord,
    release_cents: i64,
    refund_cents: i64,
    now: DateTime<Utc>,
) -> Result<Vec<Op>, EngineError> {
    let mut payer = load_wallet(conn, tenant_id, &settlement.payer_agent_id)?;
    let mut payee = load_wallet(conn, tenant_id, &settlement.payee_agent_id)?;
    let mut accounts = wallet_accounts(&payer).to_vec();
    accounts.extend(wallet_accounts(&payee));
    let mut ledger = seeded_ledger(conn, tenant_id, &accounts)?;

    if release_cents > 0 {
        wallet::release_escrow_to_payee(&mut payer, &mut payee, &mut ledger, release_cents, now)?;
    }
    if refund_cents > 0 {
        wallet::refund_escrow(&mut payer, &mut ledger, refund_cents, now)?;
    }

    settlement.release_cents = release_cents;
    settlement.refund_cents = refund_cents;
    settlement.locked_cents = 0;
    settlement.status = if release_cents > 0 {
        SettlementStatus::Released
    } else {
        SettlementStatus::Refunded
    };
    settlement.revision += 1;
    settlement.updated_at = now;

    let mut ops = vec![
        Op::AgentWalletUpsert { wallet: payer },
        Op::AgentWalletUpsert { wallet: payee },
    ];
    ops.extend(ledger_ops(ledger));
    Ok(ops)
}

/// Policy evaluation for a terminal run: auto-resolve moves escrow, anything
/// else parks the settlement in manual review.
pub fn resolve_terminal_run(
    conn: &mut Connection,
    tenant_id: &str,
    run_id: &str,
    signer: &ServerSigner,
    now: DateTime<Utc>,
) -> Result<(SettlementRecord, PolicyDecision), EngineError> {
    let run = store::get_agent_run(conn, tenant_id, run_id)?
        .ok_or_else(|| EngineError::NotFound(format!("run {run_id}")))?;
    let mut settlement = load_settlement(conn, tenant_id, run_id)?;
    if settlement.status != SettlementStatus::Locked {
        return Err(EngineError::BadState {
            state: format!("{:?}", settlement.status),
            action: "auto-resolve",
        });
    }

    let policy = tenant_policy(conn, tenant_id)?;
    let verification = run
        .verification_status
        .unwrap_or(crate::model::event::VerificationStatus::Red);
    let base = evaluate_settlement_policy(
        &policy,
        run.verification_method,
        verification,
        run.status,
        run.agreement.amount_cents,
    );
    let decision = apply_milestone_release(
        &base,
        &run.agreement,
        &run,
        verification,
        run.agreement.amount_cents,
    );

    if !decision.should_auto_resolve {
        settlement.decision_status = DecisionStatus::ManualReviewRequired;
        settlement.revision += 1;
        settlement.updated_at = now;
        commit_tx(
            conn,
            tenant_id,
            vec![Op::AgentRunSettlementUpsert {
                settlement: settlement.clone(),
            }],
            None,
        )?;
        info!(%run_id, reasons = ?decision.reason_codes, "settlement held for manual review");
        return Ok((settlement, decision));
    }

    let mut ops = disburse_ops(
        conn,
        tenant_id,
        &mut settlement,
        decision.release_amount_cents,
        decision.refund_amount_cents,
        now,
    )?;
    settlement.decision_status = DecisionStatus::AutoResolved;
    settlement.dispute_window_ends_at = Some(dispute_window_end(
        now,
        run.agreement.dispute_window_days.max(policy.dispute_window_days),
    ));
    ops.push(Op::AgentRunSettlementUpsert {
        settlement: settlement.clone(),
    });

    let resolution = if decision.release_amount_cents > 0 {
        VerdictOutcome::Release
    } else {
        VerdictOutcome::Refund
    };
    let stream_id = format!("run:{run_id}");
    let head = store::stream_head(conn, tenant_id, &stream_id)?;
    let mut event = create_event(
        &stream_id,
        EventBody::RunSettlementResolved {
            resolution,
            release_cents: decision.release_amount_cents,
            refund_cents: decision.refund_amount_cents,
            resolved_by: "policy".to_string(),
        },
        Actor::System,
        now,
        head,
    )?;
    signer.sign(&mut event);
    settlement.resolution_event_id = Some(event.id.clone());
    // Re-upsert with the resolution event id attached.
    if let Some(Op::AgentRunSettlementUpsert { settlement: s }) = ops.last_mut() {
        *s = settlement.clone();
    }
    ops.insert(
        0,
        Op::AgentRunEventsAppend {
            run_id: run_id.to_string(),
            events: vec![event],
        },
    );
    commit_tx(conn, tenant_id, ops, None)?;
    info!(%run_id, release = decision.release_amount_cents, refund = decision.refund_amount_cents, "settlement auto-resolved");
    Ok((settlement, decision))
}

/// Manual resolution of a settlement parked in review.
pub fn manual_resolve(
    conn: &mut Connection,
    tenant_id: &str,
    run_id: &str,
    release_rate_pct: u32,
    resolved_by: &str,
    signer: &ServerSigner,
    now: DateTime<Utc>,
) -> Result<SettlementRecord, EngineError> {
    let mut settlement = load_settlement(conn, tenant_id, run_id)?;
    if settlement.status != SettlementStatus::Locked {
        return Err(EngineError::BadState {
            state: format!("{:?}", settlement.status),
            action: "manually resolve",
        });
    }
    let policy = tenant_policy(conn, tenant_id)?;
    let rate = release_rate_pct.min(100) as i64;
    let amount = settlement.locked_cents;
    let release = amount * rate / 100;
    let refund = amount - release;

    let mut ops = disburse_ops(conn, tenant_id, &mut settlement, release, refund, now)?;
    settlement.decision_status = DecisionStatus::ManualResolved;
    settlement.dispute_window_ends_at =
        Some(dispute_window_end(now, policy.dispute_window_days));
    ops.push(Op::AgentRunSettlementUpsert {
        settlement: settlement.clone(),
    });

    let resolution = if release > 0 {
        VerdictOutcome::Release
    } else {
        VerdictOutcome::Refund
    };
    append_run_event(
        conn,
        tenant_id,
        run_id,
        EventBody::RunSettlementResolved {
            resolution,
            release_cents: release,
            refund_cents: refund,
            resolved_by: resolved_by.to_string(),
        },
        Actor::Ops(resolved_by.to_string()),
        now,
        signer,
        ops,
    )?;
    Ok(settlement)
}

/// Close a dispute with a signed verdict, reconciling wallets to the verdict
/// rate and delivering the verdict as an artifact.
pub fn close_dispute_with_verdict(
    conn: &mut Connection,
    tenant_id: &str,
    run_id: &str,
    verdict: DisputeVerdict,
    signer: &ServerSigner,
    now: DateTime<Utc>,
) -> Result<SettlementRecord, EngineError> {
    let mut settlement = load_settlement(conn, tenant_id, run_id)?;
    let total = settlement.release_cents + settlement.refund_cents + settlement.locked_cents;
    let target_release = total * verdict.release_rate_pct.min(100) as i64 / 100;
    let already_released = settlement.release_cents;

    let mut payer = load_wallet(conn, tenant_id, &settlement.payer_agent_id)?;
    let mut payee = load_wallet(conn, tenant_id, &settlement.payee_agent_id)?;
    let mut accounts = wallet_accounts(&payer).to_vec();
    accounts.extend(wallet_accounts(&payee));
    let mut ledger = seeded_ledger(conn, tenant_id, &accounts)?;

    // Reconcile: the verdict overrides whatever the policy decided.
    if settlement.locked_cents > 0 {
        let release = target_release;
        let refund = settlement.locked_cents - release;
        if release > 0 {
            wallet::release_escrow_to_payee(&mut payer, &mut payee, &mut ledger, release, now)?;
        }
        if refund > 0 {
            wallet::refund_escrow(&mut payer, &mut ledger, refund, now)?;
        }
        settlement.release_cents = release;
        settlement.refund_cents = refund;
        settlement.locked_cents = 0;
    } else if target_release < already_released {
        // Claw back the over-release from the payee's available balance.
        let clawback = already_released - target_release;
        wallet::transfer_available(&mut payee, &mut payer, &mut ledger, clawback, now)?;
        settlement.release_cents = target_release;
        settlement.refund_cents = total - target_release;
    } else if target_release > already_released {
        let extra = target_release - already_released;
        wallet::transfer_available(&mut payer, &mut payee, &mut ledger, extra, now)?;
        settlement.release_cents = target_release;
        settlement.refund_cents = total - target_release;
    }

    settlement.status = if settlement.release_cents > 0 {
        SettlementStatus::Released
    } else {
        SettlementStatus::Refunded
    };
    settlement.verdict_id = Some(verdict.verdict_id.clone());
    settlement.dispute_id = Some(verdict.dispute_id.clone());
    settlement.revision += 1;
    settlement.updated_at = now;

    let mut ops = vec![
        Op::AgentWalletUpsert { wallet: payer },
        Op::AgentWalletUpsert { wallet: payee },
    ];
    ops.extend(ledger_ops(ledger));
    ops.push(Op::AgentRunSettlementUpsert {
        settlement: settlement.clone(),
    });

    // The verdict itself travels the delivery rails as an artifact.
    let verdict_artifact = artifact::build_artifact(
        DISPUTE_VERDICT_V1,
        &[],
        serde_json::to_value(&verdict).map_err(|e| StoreError::Decode(e))?,
    )
    .map_err(ChainError::Canonical)?;
    ops.extend(deliveries_for_artifact(
        conn,
        tenant_id,
        &verdict_artifact,
        &format!("run:{run_id}"),
        now,
    )?);
    ops.push(Op::ArtifactPut {
        artifact: verdict_artifact,
    });

    append_run_event(
        conn,
        tenant_id,
        run_id,
        EventBody::RunDisputeClosed {
            dispute_id: verdict.dispute_id.clone(),
            verdict,
        },
        Actor::System,
        now,
        signer,
        ops,
    )?;
    Ok(settlement)
}

/// Kill-fee cancellation of an in-flight agreement.
pub fn cancel_agreement(
    conn: &mut Connection,
    tenant_id: &str,
    run_id: &str,
    reason: &str,
    kill_fee_rate_pct: u32,
    signer: &ServerSigner,
    now: DateTime<Utc>,
) -> Result<SettlementRecord, EngineError> {
    let mut settlement = load_settlement(conn, tenant_id, run_id)?;
    if settlement.status != SettlementStatus::Locked {
        return Err(EngineError::BadState {
            state: format!("{:?}", settlement.status),
            action: "cancel",
        });
    }
    let amount = settlement.locked_cents;
    let kill_fee = amount * kill_fee_rate_pct.min(100) as i64 / 100;
    let refund = amount - kill_fee;

    let mut ops = disburse_ops(conn, tenant_id, &mut settlement, kill_fee, refund, now)?;
    settlement.decision_status = DecisionStatus::AutoResolved;
    ops.push(Op::AgentRunSettlementUpsert {
        settlement: settlement.clone(),
    });

    append_run_event(
        conn,
        tenant_id,
        run_id,
        EventBody::AgreementCancelled {
            reason: reason.to_string(),
            kill_fee_rate_pct,
        },
        Actor::System,
        now,
        signer,
        ops,
    )?;
    Ok(settlement)
}

/// Verify ledger parity for every wallet of every tenant. The maintenance
/// runner treats a mismatch as fatal.
pub fn reconcile_wallets(conn: &Connection) -> Result<usize, EngineError> {
    let mut checked = 0;
    for tenant_id in store::list_tenants(conn)? {
        for wallet in store::list_wallets(conn, &tenant_id)? {
            let ledger_available =
                store::ledger_balance(conn, &tenant_id, &available_account(&wallet.agent_id))?;
            let ledger_escrow =
                store::ledger_balance(conn, &tenant_id, &escrow_account(&wallet.agent_id))?;
            if ledger_available != wallet.available_cents
                || ledger_escrow != wallet.escrow_locked_cents
            {
                return Err(EngineError::Wallet(WalletError::LedgerMismatch {
                    agent_id: wallet.agent_id.clone(),
                    snapshot_available: wallet.available_cents,
                    ledger_available,
                    snapshot_escrow: wallet.escrow_locked_cents,
                    ledger_escrow,
                }));
            }
            checked += 1;
        }
    }
    Ok(checked)
}

/// One delivery per enabled destination, ordered within the scope.
pub fn deliveries_for_artifact(
    conn: &Connection,
    tenant_id: &str,
    artifact: &crate::model::artifact::Artifact,
    scope_key: &str,
    now: DateTime<Utc>,
) -> Result<Vec<Op>, EngineError> {
    let destinations = store::list_destinations(conn, tenant_id)?;
    let order_seq: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM deliveries WHERE scope_key = ?1",
            rusqlite::params![scope_key],
            |row| row.get(0),
        )
        .map_err(StoreError::from)?;

    let mut ops = Vec::new();
    for dest in destinations.iter().filter(|d| d.enabled) {
        ops.push(Op::DeliveryEnqueue {
            delivery: crate::delivery::new_delivery(
                tenant_id,
                &dest.destination_id,
                &artifact.artifact_type,
                &artifact.artifact_id,
                &artifact.artifact_hash,
                scope_key,
                order_seq,
                0,
                now,
            ),
        });
    }
    Ok(ops)
}
