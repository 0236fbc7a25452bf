//! Run settlement surface: manual resolve, disputes, agreements.

use axum::Json;
use axum::extract::{Path, State};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::api::auth::{OpsAuth, SCOPE_FINANCE_WRITE};
use crate::api::error::ApiError;
use crate::api::middleware::Tenant;
use crate::api::state::AppState;
use crate::engine::settle;
use crate::model::event::{Actor, DisputeVerdict, EventBody, Milestone};
use crate::model::{agent_run};
use crate::store::commit::{Op, commit_tx};
use crate::store::{self};
use crate::validate::run::{RunGateCtx, validate_run_event};
use crate::workers::chain_events;

#[derive(Deserialize)]
pub struct ResolveRequest {
    pub release_rate_pct: u32,
    pub resolved_by: String,
}

pub async fn settlement_resolve(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    auth: OpsAuth,
    Path(run_id): Path<String>,
    Json(req): Json<ResolveRequest>,
) -> Result<Json<Value>, ApiError> {
    auth.require(SCOPE_FINANCE_WRITE)?;
    let mut conn = state.store.db.lock().await;
    let settlement = settle::manual_resolve(
        &mut conn,
        &tenant,
        &run_id,
        req.release_rate_pct,
        &req.resolved_by,
        &state.signer,
        Utc::now(),
    )?;
    Ok(Json(serde_json::to_value(settlement).map_err(|e| ApiError::internal(e.to_string()))?))
}

#[derive(Deserialize)]
pub struct DisputeOpenRequest {
    pub opened_by: String,
    pub reason: String,
}

async fn append_validated_run_event(
    state: &AppState,
    tenant: &str,
    run_id: &str,
    body: EventBody,
    actor: Actor,
) -> Result<Value, ApiError> {
    let mut conn = state.store.db.lock().await;
    let now = Utc::now();
    let stream_id = format!("run:{run_id}");
    let prior = store::load_stream(&conn, tenant, &stream_id)?;
    if prior.is_empty() {
        return Err(ApiError::not_found(format!("run {run_id}")));
    }
    let run_before = agent_run::reduce(&prior)?;
    let head = prior.last().map(|e| e.chain_hash.clone());
    let events = chain_events(&stream_id, head, vec![(body, actor)], now, &state.signer)?;

    let governance = store::get_governance(&conn, tenant)?;
    let settlement = store::get_settlement(&conn, tenant, run_id)?;
    let gate = RunGateCtx {
        now,
        governance: &governance,
        settlement: settlement.as_ref(),
    };
    validate_run_event(Some(&run_before), &events[0], &gate)?;

    commit_tx(
        &mut conn,
        tenant,
        vec![Op::AgentRunEventsAppend {
            run_id: run_id.to_string(),
            events,
        }],
        None,
    )?;
    let run_after = store::get_agent_run(&conn, tenant, run_id)?;
    Ok(json!({ "run_id": run_id, "status": run_after.map(|r| r.status) }))
}

pub async fn dispute_open(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(run_id): Path<String>,
    Json(req): Json<DisputeOpenRequest>,
) -> Result<Json<Value>, ApiError> {
    let dispute_id = format!("dsp_{}", Uuid::new_v4().simple());
    let body = append_validated_run_event(
        &state,
        &tenant,
        &run_id,
        EventBody::RunDisputeOpened {
            dispute_id: dispute_id.clone(),
            opened_by: req.opened_by,
            reason: req.reason,
        },
        Actor::System,
    )
    .await?;

    // Mark the dispute on the settlement row so ops queries see it.
    {
        let mut conn = state.store.db.lock().await;
        if let Some(mut settlement) = store::get_settlement(&conn, &tenant, &run_id)? {
            settlement.dispute_id = Some(dispute_id.clone());
            settlement.revision += 1;
            settlement.updated_at = Utc::now();
            commit_tx(
                &mut conn,
                &tenant,
                vec![Op::AgentRunSettlementUpsert { settlement }],
                None,
            )?;
        }
    }
    Ok(Json(json!({ "dispute_id": dispute_id, "append": body })))
}

#[derive(Deserialize)]
pub struct DisputeEvidenceRequest {
    pub dispute_id: String,
    pub evidence_ref: String,
    #[serde(default)]
    pub note: String,
}

pub async fn dispute_evidence(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(run_id): Path<String>,
    Json(req): Json<DisputeEvidenceRequest>,
) -> Result<Json<Value>, ApiError> {
    let body = append_validated_run_event(
        &state,
        &tenant,
        &run_id,
        EventBody::RunDisputeEvidenceAdded {
            dispute_id: req.dispute_id,
            evidence_ref: req.evidence_ref,
            note: req.note,
        },
        Actor::System,
    )
    .await?;
    Ok(Json(body))
}

#[derive(Deserialize)]
pub struct DisputeEscalateRequest {
    pub dispute_id: String,
    pub level: u32,
}

pub async fn dispute_escalate(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(run_id): Path<String>,
    Json(req): Json<DisputeEscalateRequest>,
) -> Result<Json<Value>, ApiError> {
    let body = append_validated_run_event(
        &state,
        &tenant,
        &run_id,
        EventBody::RunDisputeEscalated {
            dispute_id: req.dispute_id,
            level: req.level,
        },
        Actor::System,
    )
    .await?;
    Ok(Json(body))
}

#[derive(Deserialize)]
pub struct DisputeCloseRequest {
    pub verdict: DisputeVerdict,
}

/// Close with a signed verdict: verify the arbiter key, reconcile wallets,
/// deliver the verdict artifact.
pub async fn dispute_close(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(run_id): Path<String>,
    Json(req): Json<DisputeCloseRequest>,
) -> Result<Json<Value>, ApiError> {
    let now = Utc::now();
    let mut conn = state.store.db.lock().await;

    // Verdict signature must check out before any money moves.
    let governance = store::get_governance(&conn, &tenant)?;
    let key = governance
        .active_key(&req.verdict.signer_key_id)
        .filter(|k| k.owner_id.as_deref() == Some(req.verdict.arbiter_agent_id.as_str()))
        .ok_or_else(|| {
            ApiError::forbidden("SIG_INVALID", "verdict signer is not the arbiter's active key")
        })?;
    crate::model::settlement::verify_verdict(&req.verdict, &key.public_key)
        .map_err(|_| ApiError::forbidden("SIG_INVALID", "verdict signature invalid"))?;

    let settlement = settle::close_dispute_with_verdict(
        &mut conn,
        &tenant,
        &run_id,
        req.verdict,
        &state.signer,
        now,
    )?;
    Ok(Json(serde_json::to_value(settlement).map_err(|e| ApiError::internal(e.to_string()))?))
}

#[derive(Deserialize)]
pub struct ChangeOrderRequest {
    #[serde(default)]
    pub new_amount_cents: Option<i64>,
    #[serde(default)]
    pub milestones: Option<Vec<Milestone>>,
}

pub async fn change_order(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(run_id): Path<String>,
    Json(req): Json<ChangeOrderRequest>,
) -> Result<Json<Value>, ApiError> {
    let body = append_validated_run_event(
        &state,
        &tenant,
        &run_id,
        EventBody::AgreementChangeOrdered {
            change_order_id: format!("co_{}", Uuid::new_v4().simple()),
            new_amount_cents: req.new_amount_cents,
            milestones: req.milestones,
        },
        Actor::System,
    )
    .await?;
    Ok(Json(body))
}

#[derive(Deserialize)]
pub struct CancelRequest {
    pub reason: String,
    #[serde(default)]
    pub kill_fee_rate_pct: Option<u32>,
}

pub async fn agreement_cancel(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(run_id): Path<String>,
    Json(req): Json<CancelRequest>,
) -> Result<Json<Value>, ApiError> {
    let mut conn = state.store.db.lock().await;
    let run = store::get_agent_run(&conn, &tenant, &run_id)?
        .ok_or_else(|| ApiError::not_found(format!("run {run_id}")))?;
    let kill_fee = req
        .kill_fee_rate_pct
        .unwrap_or(run.agreement.kill_fee_rate_pct);
    let settlement = settle::cancel_agreement(
        &mut conn,
        &tenant,
        &run_id,
        &req.reason,
        kill_fee,
        &state.signer,
        Utc::now(),
    )?;
    Ok(Json(serde_json::to_value(settlement).map_err(|e| ApiError::internal(e.to_string()))?))
}
