//! Job lifecycle endpoints.

use axum::Json;
use axum::extract::{Path, State};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::middleware::{ExpectedPrevHash, IdempotencyKey, Tenant};
use crate::api::state::AppState;
use crate::canonical::canonical_json;
use crate::chain::{Event, sha256_hex, verify_chain};
use crate::model::event::{
    Actor, Booking, CreditPolicy, DisputeVerdict, EventBody, Quote, RiskFeatures,
    SettlementProofRef, TimeWindow,
};
use crate::store::commit::Op;
use crate::store::{self};

use super::{append_job_events, request_hash};

// ── DTOs ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateJobRequest {
    pub template_id: String,
    pub customer_id: String,
    pub site_id: String,
    pub zone: String,
    #[serde(default = "default_tier")]
    pub tier: String,
    #[serde(default = "default_privacy")]
    pub privacy_mode: String,
    #[serde(default)]
    pub coverage_required: bool,
}

fn default_tier() -> String {
    "standard".to_string()
}
fn default_privacy() -> String {
    "standard".to_string()
}

#[derive(Deserialize)]
pub struct QuoteRequest {
    pub env: String,
    pub window: TimeWindow,
    pub amount_cents: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "USD".to_string()
}

#[derive(Deserialize)]
pub struct BookRequest {
    pub quote_id: String,
    pub contract_id: String,
    pub policy_hash: String,
    pub payer_agent_id: String,
    pub payee_agent_id: String,
    #[serde(default)]
    pub credit_policy: Option<CreditPolicy>,
}

#[derive(Deserialize)]
pub struct RescheduleRequest {
    pub window: TimeWindow,
}

#[derive(Deserialize)]
pub struct ReasonRequest {
    pub reason: String,
}

#[derive(Deserialize)]
pub struct SettleRequest {
    pub settled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub hold_id: Option<String>,
    #[serde(default)]
    pub settlement_proof_ref: Option<SettlementProofRef>,
}

#[derive(Deserialize)]
pub struct DisputeOpenRequest {
    pub opened_by: String,
    pub reason: String,
}

#[derive(Deserialize)]
pub struct DisputeCloseRequest {
    pub verdict: DisputeVerdict,
}

#[derive(Deserialize)]
pub struct SlaCreditRequest {
    pub credit_cents: i64,
    pub reason: String,
}

#[derive(Deserialize)]
pub struct AppendEventsRequest {
    pub events: Vec<Event>,
}

// ── Handlers ────────────────────────────────────────────────────────

pub async fn create(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    IdempotencyKey(idem): IdempotencyKey,
    Json(req): Json<CreateJobRequest>,
) -> Result<Json<Value>, ApiError> {
    let job_id = format!("job_{}", Uuid::new_v4().simple());
    let req_hash = request_hash(&json!({
        "template_id": req.template_id,
        "customer_id": req.customer_id,
        "site_id": req.site_id,
    }))?;
    let body = append_job_events(
        &state,
        &tenant,
        &job_id,
        vec![(
            EventBody::JobCreated {
                template_id: req.template_id,
                customer_id: req.customer_id.clone(),
                site_id: req.site_id,
                zone: req.zone,
                tier: req.tier,
                privacy_mode: req.privacy_mode,
                coverage_required: req.coverage_required,
            },
            Actor::Requester(req.customer_id),
        )],
        None,
        false,
        idem.as_deref(),
        &req_hash,
        Vec::new(),
    )
    .await?;
    Ok(Json(body))
}

pub async fn get_one(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let conn = state.store.db.lock().await;
    let job = store::get_job(&conn, &tenant, &job_id)?
        .ok_or_else(|| ApiError::not_found(format!("job {job_id}")))?;
    Ok(Json(serde_json::to_value(job).map_err(|e| ApiError::internal(e.to_string()))?))
}

/// Quote a job. The deterministic risk stub scores the same features to the
/// same number, so RISK_SCORED rides along with the quote.
pub async fn quote(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    IdempotencyKey(idem): IdempotencyKey,
    ExpectedPrevHash(prev): ExpectedPrevHash,
    Path(job_id): Path<String>,
    Json(req): Json<QuoteRequest>,
) -> Result<Json<Value>, ApiError> {
    let req_hash = request_hash(&json!({
        "env": req.env, "amount_cents": req.amount_cents,
        "window": req.window,
    }))?;

    let tier = {
        let conn = state.store.db.lock().await;
        let job = store::get_job(&conn, &tenant, &job_id)?
            .ok_or_else(|| ApiError::not_found(format!("job {job_id}")))?;
        job.tier
    };

    let quote = Quote {
        quote_id: format!("qt_{}", Uuid::new_v4().simple()),
        env: req.env.clone(),
        window: req.window,
        amount_cents: req.amount_cents,
        currency: req.currency,
    };
    let body = append_job_events(
        &state,
        &tenant,
        &job_id,
        vec![(EventBody::JobQuoted(quote.clone()), Actor::Pricing)],
        prev.as_deref(),
        true,
        idem.as_deref(),
        &req_hash,
        Vec::new(),
    )
    .await?;

    // Risk scoring is a second append anchored on the quote event just
    // committed; conflicts simply surface to the caller.
    let quote_event_id = body["event_ids"][0].as_str().unwrap_or_default().to_string();
    let features = RiskFeatures {
        env: req.env,
        tier,
        amount_cents: req.amount_cents,
        window_minutes: req.window.minutes(),
    };
    let score = deterministic_risk_score(&features)?;
    let risk_hash = request_hash(&json!({ "risk_for": quote_event_id }))?;
    let _ = append_job_events(
        &state,
        &tenant,
        &job_id,
        vec![(
            EventBody::RiskScored {
                score,
                features,
                source_event_id: quote_event_id,
            },
            Actor::Risk,
        )],
        None,
        false,
        None,
        &risk_hash,
        Vec::new(),
    )
    .await?;

    Ok(Json(json!({ "quote": quote, "risk_score": score, "append": body })))
}

/// Deterministic scoring stub: a stable hash of the features, 0..=100.
fn deterministic_risk_score(features: &RiskFeatures) -> Result<u32, ApiError> {
    let digest = sha256_hex(
        canonical_json(features)
            .map_err(|e| ApiError::internal(e.to_string()))?
            .as_bytes(),
    );
    let nibble = u32::from_str_radix(&digest[..8], 16).unwrap_or(0);
    Ok(nibble % 101)
}

pub async fn book(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    IdempotencyKey(idem): IdempotencyKey,
    ExpectedPrevHash(prev): ExpectedPrevHash,
    Path(job_id): Path<String>,
    Json(req): Json<BookRequest>,
) -> Result<Json<Value>, ApiError> {
    let req_hash = request_hash(&json!({
        "quote_id": req.quote_id, "contract_id": req.contract_id,
        "policy_hash": req.policy_hash,
    }))?;

    let (quote, job) = {
        let conn = state.store.db.lock().await;
        let job = store::get_job(&conn, &tenant, &job_id)?
            .ok_or_else(|| ApiError::not_found(format!("job {job_id}")))?;
        let quote = job
            .quote
            .clone()
            .filter(|q| q.quote_id == req.quote_id)
            .ok_or_else(|| ApiError::bad_request("QUOTE_UNKNOWN", "quote does not match"))?;
        (quote, job)
    };

    let booking = Booking {
        booking_id: format!("bkg_{}", Uuid::new_v4().simple()),
        quote_id: req.quote_id,
        contract_id: req.contract_id,
        policy_hash: req.policy_hash,
        window: quote.window,
        amount_cents: quote.amount_cents,
        currency: quote.currency.clone(),
        tier: job.tier.clone(),
        coverage_required: job.coverage_required,
        payer_agent_id: req.payer_agent_id,
        payee_agent_id: req.payee_agent_id,
        credit_policy: req.credit_policy,
    };
    let body = append_job_events(
        &state,
        &tenant,
        &job_id,
        vec![(EventBody::JobBooked(booking), Actor::Requester(job.customer_id.clone()))],
        prev.as_deref(),
        true,
        idem.as_deref(),
        &req_hash,
        Vec::new(),
    )
    .await?;
    Ok(Json(body))
}

/// Explicit re-dispatch request (booking already enqueues one).
pub async fn dispatch(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let mut conn = state.store.db.lock().await;
    store::get_job(&conn, &tenant, &job_id)?
        .ok_or_else(|| ApiError::not_found(format!("job {job_id}")))?;
    crate::store::commit::commit_tx(
        &mut conn,
        &tenant,
        vec![Op::OutboxEnqueue {
            topic: "DISPATCH_REQUESTED".to_string(),
            payload: json!({ "job_id": job_id }),
        }],
        None,
    )?;
    Ok(Json(json!({ "job_id": job_id, "dispatch": "requested" })))
}

pub async fn reschedule(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    IdempotencyKey(idem): IdempotencyKey,
    ExpectedPrevHash(prev): ExpectedPrevHash,
    Path(job_id): Path<String>,
    Json(req): Json<RescheduleRequest>,
) -> Result<Json<Value>, ApiError> {
    let req_hash = request_hash(&json!({ "window": req.window }))?;
    let body = append_job_events(
        &state,
        &tenant,
        &job_id,
        vec![(EventBody::JobRescheduled { window: req.window }, Actor::System)],
        prev.as_deref(),
        true,
        idem.as_deref(),
        &req_hash,
        vec![Op::OutboxEnqueue {
            topic: "DISPATCH_REQUESTED".to_string(),
            payload: json!({ "job_id": job_id }),
        }],
    )
    .await?;
    Ok(Json(body))
}

pub async fn cancel(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    IdempotencyKey(idem): IdempotencyKey,
    ExpectedPrevHash(prev): ExpectedPrevHash,
    Path(job_id): Path<String>,
    Json(req): Json<ReasonRequest>,
) -> Result<Json<Value>, ApiError> {
    let req_hash = request_hash(&json!({ "cancel": req.reason }))?;
    let body = append_job_events(
        &state,
        &tenant,
        &job_id,
        vec![(EventBody::JobCancelled { reason: req.reason }, Actor::System)],
        prev.as_deref(),
        true,
        idem.as_deref(),
        &req_hash,
        Vec::new(),
    )
    .await?;
    Ok(Json(body))
}

pub async fn abort(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    IdempotencyKey(idem): IdempotencyKey,
    ExpectedPrevHash(prev): ExpectedPrevHash,
    Path(job_id): Path<String>,
    Json(req): Json<ReasonRequest>,
) -> Result<Json<Value>, ApiError> {
    let req_hash = request_hash(&json!({ "abort": req.reason }))?;
    let body = append_job_events(
        &state,
        &tenant,
        &job_id,
        vec![(EventBody::JobAbortStarted { reason: req.reason }, Actor::System)],
        prev.as_deref(),
        true,
        idem.as_deref(),
        &req_hash,
        Vec::new(),
    )
    .await?;
    Ok(Json(body))
}

pub async fn settle(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    IdempotencyKey(idem): IdempotencyKey,
    ExpectedPrevHash(prev): ExpectedPrevHash,
    Path(job_id): Path<String>,
    Json(req): Json<SettleRequest>,
) -> Result<Json<Value>, ApiError> {
    let settled_at = req.settled_at.unwrap_or_else(Utc::now);
    let req_hash = request_hash(&json!({
        "settle": job_id, "hold_id": req.hold_id,
        "proof": req.settlement_proof_ref,
    }))?;

    let (booking, payer, payee) = {
        let conn = state.store.db.lock().await;
        let job = store::get_job(&conn, &tenant, &job_id)?
            .ok_or_else(|| ApiError::not_found(format!("job {job_id}")))?;
        let booking = job
            .booking
            .clone()
            .ok_or_else(|| ApiError::bad_request("NOT_BOOKED", "job carries no booking"))?;
        (booking.clone(), booking.payer_agent_id, booking.payee_agent_id)
    };

    let body = append_job_events(
        &state,
        &tenant,
        &job_id,
        vec![(
            EventBody::JobSettled {
                amount_cents: booking.amount_cents,
                payer_agent_id: payer,
                payee_agent_id: payee,
                settled_at,
                hold_id: req.hold_id,
                settlement_proof_ref: req.settlement_proof_ref,
            },
            Actor::System,
        )],
        prev.as_deref(),
        true,
        idem.as_deref(),
        &req_hash,
        Vec::new(),
    )
    .await?;
    Ok(Json(body))
}

pub async fn dispute_open(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    IdempotencyKey(idem): IdempotencyKey,
    ExpectedPrevHash(prev): ExpectedPrevHash,
    Path(job_id): Path<String>,
    Json(req): Json<DisputeOpenRequest>,
) -> Result<Json<Value>, ApiError> {
    let req_hash = request_hash(&json!({ "dispute_open": req.reason, "by": req.opened_by }))?;
    let dispute_id = format!("dsp_{}", Uuid::new_v4().simple());

    // Re-proof after settlement is tenant-gated and only within the window;
    // the dispute-open validator already enforces the window itself.
    let mut extra_ops = Vec::new();
    {
        let conn = state.store.db.lock().await;
        let governance = store::get_governance(&conn, &tenant)?;
        if governance
            .policy_at(Utc::now())
            .allow_reproof_after_settlement_within_dispute_window
        {
            extra_ops.push(Op::OutboxEnqueue {
                topic: "PROOF_EVAL_ENQUEUE".to_string(),
                payload: json!({ "job_id": job_id }),
            });
        }
    }

    let body = append_job_events(
        &state,
        &tenant,
        &job_id,
        vec![(
            EventBody::JobDisputeOpened {
                dispute_id: dispute_id.clone(),
                opened_by: req.opened_by,
                reason: req.reason,
            },
            Actor::System,
        )],
        prev.as_deref(),
        true,
        idem.as_deref(),
        &req_hash,
        extra_ops,
    )
    .await?;
    Ok(Json(json!({ "dispute_id": dispute_id, "append": body })))
}

pub async fn dispute_close(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    IdempotencyKey(idem): IdempotencyKey,
    ExpectedPrevHash(prev): ExpectedPrevHash,
    Path(job_id): Path<String>,
    Json(req): Json<DisputeCloseRequest>,
) -> Result<Json<Value>, ApiError> {
    let req_hash = request_hash(&json!({ "dispute_close": req.verdict.verdict_id }))?;
    let body = append_job_events(
        &state,
        &tenant,
        &job_id,
        vec![(
            EventBody::JobDisputeClosed {
                dispute_id: req.verdict.dispute_id.clone(),
                verdict: req.verdict,
            },
            Actor::System,
        )],
        prev.as_deref(),
        true,
        idem.as_deref(),
        &req_hash,
        Vec::new(),
    )
    .await?;
    Ok(Json(body))
}

pub async fn sla_credit(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    IdempotencyKey(idem): IdempotencyKey,
    ExpectedPrevHash(prev): ExpectedPrevHash,
    Path(job_id): Path<String>,
    Json(req): Json<SlaCreditRequest>,
) -> Result<Json<Value>, ApiError> {
    let req_hash = request_hash(&json!({ "sla_credit": req.credit_cents, "reason": req.reason }))?;
    let body = append_job_events(
        &state,
        &tenant,
        &job_id,
        vec![(
            EventBody::SlaCreditIssued {
                credit_cents: req.credit_cents,
                reason: req.reason,
            },
            Actor::Accounting,
        )],
        prev.as_deref(),
        true,
        idem.as_deref(),
        &req_hash,
        Vec::new(),
    )
    .await?;
    Ok(Json(body))
}

/// Client-constructed events (robot/operator signed). The batch must verify
/// against the stream head and every signature checks out before commit.
pub async fn append_events(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    IdempotencyKey(idem): IdempotencyKey,
    ExpectedPrevHash(prev): ExpectedPrevHash,
    Path(job_id): Path<String>,
    Json(req): Json<AppendEventsRequest>,
) -> Result<Json<Value>, ApiError> {
    if req.events.is_empty() {
        return Err(ApiError::bad_request("EMPTY_BATCH", "no events"));
    }
    let req_hash = request_hash(&json!({
        "events": req.events.iter().map(|e| e.id.clone()).collect::<Vec<_>>()
    }))?;

    let mut conn = state.store.db.lock().await;
    if let Some((_, body)) = super::check_idempotency(&conn, idem.as_deref(), &req_hash)? {
        return Ok(Json(body));
    }

    let now = Utc::now();
    let stream_id = format!("job:{job_id}");
    let prior = store::load_stream(&conn, &tenant, &stream_id)?;
    let head = prior.last().map(|e| e.chain_hash.clone());
    super::check_precondition(head.as_deref(), prev.as_deref(), true)?;

    // Recompute hashes and verify signatures over the whole prospective
    // stream; client-supplied events get no benefit of the doubt.
    let mut full = prior.clone();
    full.extend(req.events.iter().cloned());
    let governance = store::get_governance(&conn, &tenant)?;
    let mut keys = std::collections::HashMap::new();
    for record in governance.signer_keys.values() {
        if let Ok(key) = crate::chain::decode_public_key(&record.public_key) {
            keys.insert(record.key_id.clone(), key);
        }
    }
    verify_chain(&full, &keys)?;

    let mut working = prior.clone();
    for event in &req.events {
        if event.stream_id != stream_id {
            return Err(ApiError::bad_request("STREAM_MISMATCH", "event targets another stream"));
        }
        let job_before = crate::model::job::reduce(&working)?;
        let inputs = super::build_job_gate_inputs(&conn, &tenant, &job_before, event)?;
        let policy = inputs.governance.policy_at(now);
        let gate = crate::validate::job::JobGateCtx {
            now,
            policy: &policy,
            governance: &inputs.governance,
            robot: inputs.robot.as_ref(),
            operator: inputs.operator.as_ref(),
            operator_active_coverage: inputs.operator_active_coverage,
            has_overlapping_reservation: inputs.has_overlapping_reservation,
            contract_policy_hash: inputs.contract_policy_hash.as_deref(),
            contract_window: inputs.contract_window,
            settled_month_closed: inputs.settled_month_closed.clone(),
            operator_policy_hash: &state.config.worker.operator_policy_hash,
        };
        crate::validate::job::validate_job_event(&job_before, &working, event, &gate)?;
        working.push(event.clone());
    }
    let job_after = crate::model::job::reduce(&working)?;

    let response = json!({
        "job_id": job_id,
        "status": job_after.status,
        "event_ids": req.events.iter().map(|e| e.id.clone()).collect::<Vec<_>>(),
        "chain_head": req.events.last().map(|e| e.chain_hash.clone()),
    });
    let mut ops = vec![Op::JobEventsAppend {
        job_id: job_id.clone(),
        events: req.events,
    }];
    ops.extend(super::idempotency_op(idem.as_deref(), &req_hash, &response));
    crate::store::commit::commit_tx(&mut conn, &tenant, ops, None)?;
    Ok(Json(response))
}
