//! Agent registration, wallet funding, and agent runs.

use axum::Json;
use axum::extract::{Path, State};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::middleware::{IdempotencyKey, Tenant};
use crate::api::state::AppState;
use crate::engine::settle;
use crate::model::event::{Actor, AgreementTerms, EventBody, SignerOwnerKind, VerificationMethod, VerificationStatus};
use crate::model::wallet::{self, AgentWallet, LedgerProjection};
use crate::model::{agent_run};
use crate::store::commit::{Op, commit_tx};
use crate::store::{self};
use crate::validate::run::{RunGateCtx, validate_run_event};
use crate::workers::chain_events;

use super::{check_idempotency, idempotency_op, request_hash};

#[derive(Deserialize)]
pub struct RegisterAgentRequest {
    pub agent_id: String,
    pub public_key: String,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "USD".to_string()
}

pub async fn register(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    IdempotencyKey(idem): IdempotencyKey,
    Json(req): Json<RegisterAgentRequest>,
) -> Result<Json<Value>, ApiError> {
    let req_hash = request_hash(&json!({ "agent": req.agent_id, "key": req.public_key }))?;
    let mut conn = state.store.db.lock().await;
    if let Some((_, body)) = check_idempotency(&conn, idem.as_deref(), &req_hash)? {
        return Ok(Json(body));
    }
    if store::get_wallet(&conn, &tenant, &req.agent_id)?.is_some() {
        return Err(ApiError::conflict("AGENT_EXISTS", "agent already registered"));
    }

    let now = Utc::now();
    let key_id = format!("agentkey_{}", req.agent_id);
    let gov_head = store::stream_head(&conn, &tenant, crate::model::governance::GOVERNANCE_STREAM)?;
    let gov_events = chain_events(
        crate::model::governance::GOVERNANCE_STREAM,
        gov_head,
        vec![(
            EventBody::SignerKeyRegistered {
                key_id: key_id.clone(),
                public_key: req.public_key.clone(),
                owner_kind: SignerOwnerKind::Agent,
                owner_id: Some(req.agent_id.clone()),
            },
            Actor::System,
        )],
        now,
        &state.signer,
    )?;

    let response = json!({ "agent_id": req.agent_id, "signer_key_id": key_id });
    let mut ops = vec![
        Op::GovernanceEventsAppend { events: gov_events },
        Op::PublicKeyPut {
            key_id,
            public_key: req.public_key,
        },
        Op::AgentWalletUpsert {
            wallet: AgentWallet::new(&req.agent_id, &req.currency, now),
        },
    ];
    ops.extend(idempotency_op(idem.as_deref(), &req_hash, &response));
    commit_tx(&mut conn, &tenant, ops, None)?;
    Ok(Json(response))
}

#[derive(Deserialize)]
pub struct CreditRequest {
    pub amount_cents: i64,
}

pub async fn wallet_credit(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    IdempotencyKey(idem): IdempotencyKey,
    Path(agent_id): Path<String>,
    Json(req): Json<CreditRequest>,
) -> Result<Json<Value>, ApiError> {
    let req_hash = request_hash(&json!({ "credit": agent_id, "amount": req.amount_cents }))?;
    let mut conn = state.store.db.lock().await;
    if let Some((_, body)) = check_idempotency(&conn, idem.as_deref(), &req_hash)? {
        return Ok(Json(body));
    }

    let now = Utc::now();
    let mut w = store::get_wallet(&conn, &tenant, &agent_id)?
        .ok_or_else(|| ApiError::not_found(format!("agent {agent_id}")))?;
    let mut ledger = LedgerProjection::default();
    ledger.balances.insert(
        wallet::available_account(&agent_id),
        store::ledger_balance(&conn, &tenant, &wallet::available_account(&agent_id))?,
    );
    ledger.balances.insert(
        wallet::escrow_account(&agent_id),
        store::ledger_balance(&conn, &tenant, &wallet::escrow_account(&agent_id))?,
    );
    wallet::credit(&mut w, &mut ledger, req.amount_cents, now)?;

    let response = json!({
        "agent_id": agent_id,
        "available_cents": w.available_cents,
        "escrow_locked_cents": w.escrow_locked_cents,
        "revision": w.revision,
    });
    let mut ops = vec![Op::AgentWalletUpsert { wallet: w }];
    for posting in ledger.postings {
        ops.push(Op::LedgerPost { posting });
    }
    ops.extend(idempotency_op(idem.as_deref(), &req_hash, &response));
    commit_tx(&mut conn, &tenant, ops, None)?;
    Ok(Json(response))
}

pub async fn wallet_get(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(agent_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let conn = state.store.db.lock().await;
    let w = store::get_wallet(&conn, &tenant, &agent_id)?
        .ok_or_else(|| ApiError::not_found(format!("agent {agent_id}")))?;
    Ok(Json(serde_json::to_value(w).map_err(|e| ApiError::internal(e.to_string()))?))
}

#[derive(Deserialize)]
pub struct CreateRunRequest {
    pub task_id: String,
    pub payer_agent_id: String,
    #[serde(default = "default_method")]
    pub verification_method: VerificationMethod,
    pub agreement: AgreementTerms,
}

fn default_method() -> VerificationMethod {
    VerificationMethod::Attestation
}

/// Create a run and lock the agreement amount from the payer in escrow.
pub async fn create_run(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    IdempotencyKey(idem): IdempotencyKey,
    Path(agent_id): Path<String>,
    Json(req): Json<CreateRunRequest>,
) -> Result<Json<Value>, ApiError> {
    let req_hash = request_hash(&json!({
        "run_for": agent_id, "task": req.task_id, "payer": req.payer_agent_id,
        "amount": req.agreement.amount_cents,
    }))?;
    let mut conn = state.store.db.lock().await;
    if let Some((_, body)) = check_idempotency(&conn, idem.as_deref(), &req_hash)? {
        return Ok(Json(body));
    }

    let now = Utc::now();
    let run_id = format!("run_{}", Uuid::new_v4().simple());
    let stream_id = format!("run:{run_id}");
    let events = chain_events(
        &stream_id,
        None,
        vec![(
            EventBody::RunCreated {
                run_id: run_id.clone(),
                agent_id: agent_id.clone(),
                task_id: req.task_id,
                payer_agent_id: req.payer_agent_id,
                verification_method: req.verification_method,
                agreement: req.agreement,
            },
            Actor::Agent(agent_id.clone()),
        )],
        now,
        &state.signer,
    )?;

    let governance = store::get_governance(&conn, &tenant)?;
    let gate = RunGateCtx {
        now,
        governance: &governance,
        settlement: None,
    };
    validate_run_event(None, &events[0], &gate)?;

    let mut ops = vec![Op::AgentRunEventsAppend {
        run_id: run_id.clone(),
        events,
    }];
    let response = json!({ "run_id": run_id, "status": "created" });
    ops.extend(idempotency_op(idem.as_deref(), &req_hash, &response));
    commit_tx(&mut conn, &tenant, ops, None)?;

    // Escrow lock happens in its own commit; a failed lock leaves the run
    // visible with no settlement, which ops can retry.
    let run = store::get_agent_run(&conn, &tenant, &run_id)?
        .ok_or_else(|| ApiError::internal("run projection missing"))?;
    settle::lock_for_run(&mut conn, &tenant, &run, now)?;
    Ok(Json(response))
}

#[derive(Deserialize)]
pub struct RunEventRequest {
    pub kind: String,
    #[serde(default)]
    pub verification_status: Option<VerificationStatus>,
    #[serde(default)]
    pub output_ref: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub milestone_id: Option<String>,
}

/// Run lifecycle events. Terminal events trigger policy resolution.
pub async fn run_event(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path((_agent_id, run_id)): Path<(String, String)>,
    Json(req): Json<RunEventRequest>,
) -> Result<Json<Value>, ApiError> {
    let body = match req.kind.as_str() {
        "started" => EventBody::RunStarted {},
        "completed" => EventBody::RunCompleted {
            verification_status: req
                .verification_status
                .unwrap_or(VerificationStatus::Green),
            output_ref: req.output_ref,
        },
        "failed" => EventBody::RunFailed {
            reason: req.reason.unwrap_or_else(|| "unspecified".to_string()),
            verification_status: req
                .verification_status
                .unwrap_or(VerificationStatus::Red),
        },
        "milestone_completed" => EventBody::MilestoneCompleted {
            milestone_id: req
                .milestone_id
                .ok_or_else(|| ApiError::bad_request("MILESTONE_REQUIRED", "milestone_id required"))?,
        },
        other => {
            return Err(ApiError::bad_request(
                "RUN_EVENT_INVALID",
                format!("unknown run event kind {other}"),
            ));
        }
    };
    let terminal = matches!(req.kind.as_str(), "completed" | "failed");

    let mut conn = state.store.db.lock().await;
    let now = Utc::now();
    let stream_id = format!("run:{run_id}");
    let prior = store::load_stream(&conn, &tenant, &stream_id)?;
    if prior.is_empty() {
        return Err(ApiError::not_found(format!("run {run_id}")));
    }
    let run_before = agent_run::reduce(&prior)?;
    let head = prior.last().map(|e| e.chain_hash.clone());
    let events = chain_events(
        &stream_id,
        head,
        vec![(body, Actor::Agent(run_before.agent_id.clone()))],
        now,
        &state.signer,
    )?;

    let governance = store::get_governance(&conn, &tenant)?;
    let settlement = store::get_settlement(&conn, &tenant, &run_id)?;
    let gate = RunGateCtx {
        now,
        governance: &governance,
        settlement: settlement.as_ref(),
    };
    validate_run_event(Some(&run_before), &events[0], &gate)?;

    commit_tx(
        &mut conn,
        &tenant,
        vec![Op::AgentRunEventsAppend {
            run_id: run_id.clone(),
            events,
        }],
        None,
    )?;

    let mut resolution = None;
    if terminal {
        let (settlement, decision) =
            settle::resolve_terminal_run(&mut conn, &tenant, &run_id, &state.signer, now)?;
        resolution = Some(json!({
            "status": settlement.status,
            "decision_status": settlement.decision_status,
            "release_cents": settlement.release_cents,
            "refund_cents": settlement.refund_cents,
            "reason_codes": decision.reason_codes,
        }));
    }

    let run_after = store::get_agent_run(&conn, &tenant, &run_id)?;
    Ok(Json(json!({
        "run_id": run_id,
        "status": run_after.map(|r| r.status),
        "resolution": resolution,
    })))
}
