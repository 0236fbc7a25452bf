//! Operator identity and shift endpoints.

use axum::Json;
use axum::extract::{Path, State};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::api::error::ApiError;
use crate::api::middleware::{IdempotencyKey, Tenant};
use crate::api::state::AppState;
use crate::model::event::{Actor, EventBody, SignerOwnerKind};
use crate::store::commit::{Op, commit_tx};
use crate::store::{self};
use crate::workers::chain_events;

use super::{check_idempotency, idempotency_op, request_hash};

#[derive(Deserialize)]
pub struct RegisterOperatorRequest {
    pub operator_id: String,
    pub zones: Vec<String>,
    pub public_key: String,
    #[serde(default = "default_concurrency")]
    pub max_concurrent: u32,
    #[serde(default = "default_rate")]
    pub hourly_rate_cents: i64,
}

fn default_concurrency() -> u32 {
    3
}
fn default_rate() -> i64 {
    4_500
}

pub async fn register(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    IdempotencyKey(idem): IdempotencyKey,
    Json(req): Json<RegisterOperatorRequest>,
) -> Result<Json<Value>, ApiError> {
    let req_hash = request_hash(&json!({ "operator": req.operator_id, "key": req.public_key }))?;
    let mut conn = state.store.db.lock().await;
    if let Some((_, body)) = check_idempotency(&conn, idem.as_deref(), &req_hash)? {
        return Ok(Json(body));
    }
    if store::get_operator(&conn, &tenant, &req.operator_id)?.is_some() {
        return Err(ApiError::conflict("OPERATOR_EXISTS", "operator already registered"));
    }

    let now = Utc::now();
    let key_id = format!("opkey_{}", req.operator_id);
    let stream_id = format!("operator:{}", req.operator_id);
    let operator_events = chain_events(
        &stream_id,
        None,
        vec![(
            EventBody::OperatorRegistered {
                operator_id: req.operator_id.clone(),
                zones: req.zones,
                signer_key_id: key_id.clone(),
                public_key: req.public_key.clone(),
                max_concurrent: req.max_concurrent,
                hourly_rate_cents: req.hourly_rate_cents,
            },
            Actor::System,
        )],
        now,
        &state.signer,
    )?;
    let gov_head = store::stream_head(&conn, &tenant, crate::model::governance::GOVERNANCE_STREAM)?;
    let gov_events = chain_events(
        crate::model::governance::GOVERNANCE_STREAM,
        gov_head,
        vec![(
            EventBody::SignerKeyRegistered {
                key_id: key_id.clone(),
                public_key: req.public_key.clone(),
                owner_kind: SignerOwnerKind::Operator,
                owner_id: Some(req.operator_id.clone()),
            },
            Actor::System,
        )],
        now,
        &state.signer,
    )?;

    let response = json!({ "operator_id": req.operator_id, "signer_key_id": key_id });
    let mut ops = vec![
        Op::OperatorEventsAppend {
            operator_id: req.operator_id.clone(),
            events: operator_events,
        },
        Op::GovernanceEventsAppend { events: gov_events },
        Op::PublicKeyPut {
            key_id,
            public_key: req.public_key,
        },
    ];
    ops.extend(idempotency_op(idem.as_deref(), &req_hash, &response));
    commit_tx(&mut conn, &tenant, ops, None)?;
    Ok(Json(response))
}

#[derive(Deserialize)]
pub struct ShiftRequest {
    pub action: String,
    #[serde(default)]
    pub zone: Option<String>,
}

/// Shift events come from the operator's own signed client in production;
/// the ops surface uses this server-signed convenience.
pub async fn shift(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(operator_id): Path<String>,
    Json(req): Json<ShiftRequest>,
) -> Result<Json<Value>, ApiError> {
    let body = match req.action.as_str() {
        "start" => EventBody::OperatorShiftStarted {
            zone: req
                .zone
                .ok_or_else(|| ApiError::bad_request("ZONE_REQUIRED", "zone required"))?,
        },
        "end" => EventBody::OperatorShiftEnded {},
        other => {
            return Err(ApiError::bad_request(
                "ACTION_INVALID",
                format!("unknown shift action {other}"),
            ));
        }
    };
    append_operator_event(&state, &tenant, &operator_id, body, Actor::Operator(operator_id.clone())).await
}

#[derive(Deserialize)]
pub struct StatusRequest {
    pub status: String,
}

pub async fn status(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(operator_id): Path<String>,
    Json(req): Json<StatusRequest>,
) -> Result<Json<Value>, ApiError> {
    append_operator_event(
        &state,
        &tenant,
        &operator_id,
        EventBody::OperatorStatusChanged { status: req.status },
        Actor::System,
    )
    .await
}

async fn append_operator_event(
    state: &AppState,
    tenant: &str,
    operator_id: &str,
    body: EventBody,
    actor: Actor,
) -> Result<Json<Value>, ApiError> {
    let mut conn = state.store.db.lock().await;
    store::get_operator(&conn, tenant, operator_id)?
        .ok_or_else(|| ApiError::not_found(format!("operator {operator_id}")))?;

    let stream_id = format!("operator:{operator_id}");
    let head = store::stream_head(&conn, tenant, &stream_id)?;
    let events = chain_events(&stream_id, head, vec![(body, actor)], Utc::now(), &state.signer)?;
    commit_tx(
        &mut conn,
        tenant,
        vec![Op::OperatorEventsAppend {
            operator_id: operator_id.to_string(),
            events,
        }],
        None,
    )?;
    let operator = store::get_operator(&conn, tenant, operator_id)?;
    Ok(Json(serde_json::to_value(operator).map_err(|e| ApiError::internal(e.to_string()))?))
}
