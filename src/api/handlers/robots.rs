//! Robot identity endpoints. Registration binds the robot's signer key into
//! the tenant governance stream in the same commit.

use axum::Json;
use axum::extract::{Path, State};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::api::error::ApiError;
use crate::api::middleware::{ExpectedPrevHash, IdempotencyKey, Tenant};
use crate::api::state::AppState;
use crate::chain::Event;
use crate::model::event::{Actor, EventBody, SignerOwnerKind, TimeWindow};
use crate::model::robot;
use crate::store::commit::{Op, commit_tx};
use crate::store::{self};
use crate::workers::chain_events;

use super::{check_idempotency, check_precondition, idempotency_op, request_hash};

#[derive(Deserialize)]
pub struct RegisterRobotRequest {
    pub robot_id: String,
    pub zone: String,
    pub public_key: String,
    #[serde(default = "default_trust")]
    pub trust_score: i64,
}

fn default_trust() -> i64 {
    50
}

pub async fn register(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    IdempotencyKey(idem): IdempotencyKey,
    Json(req): Json<RegisterRobotRequest>,
) -> Result<Json<Value>, ApiError> {
    let req_hash = request_hash(&json!({ "robot": req.robot_id, "key": req.public_key }))?;
    let mut conn = state.store.db.lock().await;
    if let Some((_, body)) = check_idempotency(&conn, idem.as_deref(), &req_hash)? {
        return Ok(Json(body));
    }
    if store::get_robot(&conn, &tenant, &req.robot_id)?.is_some() {
        return Err(ApiError::conflict("ROBOT_EXISTS", "robot already registered"));
    }

    let now = Utc::now();
    let key_id = format!("robokey_{}", req.robot_id);
    let stream_id = format!("robot:{}", req.robot_id);
    let robot_events = chain_events(
        &stream_id,
        None,
        vec![(
            EventBody::RobotRegistered {
                robot_id: req.robot_id.clone(),
                zone: req.zone,
                signer_key_id: key_id.clone(),
                public_key: req.public_key.clone(),
                trust_score: req.trust_score,
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
                owner_kind: SignerOwnerKind::Robot,
                owner_id: Some(req.robot_id.clone()),
            },
            Actor::System,
        )],
        now,
        &state.signer,
    )?;

    let response = json!({ "robot_id": req.robot_id, "signer_key_id": key_id });
    let mut ops = vec![
        Op::RobotEventsAppend {
            robot_id: req.robot_id.clone(),
            events: robot_events,
        },
        Op::GovernanceEventsAppend { events: gov_events },
        Op::PublicKeyPut {
            key_id: key_id.clone(),
            public_key: req.public_key,
        },
    ];
    ops.extend(idempotency_op(idem.as_deref(), &req_hash, &response));
    commit_tx(&mut conn, &tenant, ops, None)?;
    Ok(Json(response))
}

#[derive(Deserialize)]
pub struct AvailabilityRequest {
    pub available: bool,
    #[serde(default)]
    pub window: Option<TimeWindow>,
}

pub async fn availability(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(robot_id): Path<String>,
    Json(req): Json<AvailabilityRequest>,
) -> Result<Json<Value>, ApiError> {
    append_robot_event(
        &state,
        &tenant,
        &robot_id,
        EventBody::RobotAvailabilitySet {
            available: req.available,
            window: req.window,
        },
    )
    .await
}

#[derive(Deserialize)]
pub struct StatusRequest {
    pub status: String,
}

pub async fn status(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(robot_id): Path<String>,
    Json(req): Json<StatusRequest>,
) -> Result<Json<Value>, ApiError> {
    append_robot_event(
        &state,
        &tenant,
        &robot_id,
        EventBody::RobotStatusChanged { status: req.status },
    )
    .await
}

async fn append_robot_event(
    state: &AppState,
    tenant: &str,
    robot_id: &str,
    body: EventBody,
) -> Result<Json<Value>, ApiError> {
    let mut conn = state.store.db.lock().await;
    store::get_robot(&conn, tenant, robot_id)?
        .ok_or_else(|| ApiError::not_found(format!("robot {robot_id}")))?;

    let stream_id = format!("robot:{robot_id}");
    let head = store::stream_head(&conn, tenant, &stream_id)?;
    let events = chain_events(
        &stream_id,
        head,
        vec![(body, Actor::System)],
        Utc::now(),
        &state.signer,
    )?;
    commit_tx(
        &mut conn,
        tenant,
        vec![Op::RobotEventsAppend {
            robot_id: robot_id.to_string(),
            events,
        }],
        None,
    )?;
    let robot = store::get_robot(&conn, tenant, robot_id)?;
    Ok(Json(serde_json::to_value(robot).map_err(|e| ApiError::internal(e.to_string()))?))
}

#[derive(Deserialize)]
pub struct AppendEventsRequest {
    pub events: Vec<Event>,
}

/// Client-signed robot events (status reports etc.).
pub async fn append_events(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    ExpectedPrevHash(prev): ExpectedPrevHash,
    Path(robot_id): Path<String>,
    Json(req): Json<AppendEventsRequest>,
) -> Result<Json<Value>, ApiError> {
    if req.events.is_empty() {
        return Err(ApiError::bad_request("EMPTY_BATCH", "no events"));
    }
    let mut conn = state.store.db.lock().await;
    let stream_id = format!("robot:{robot_id}");
    let prior = store::load_stream(&conn, &tenant, &stream_id)?;
    let head = prior.last().map(|e| e.chain_hash.clone());
    check_precondition(head.as_deref(), prev.as_deref(), true)?;

    let mut full = prior;
    full.extend(req.events.iter().cloned());
    let governance = store::get_governance(&conn, &tenant)?;
    let mut keys = std::collections::HashMap::new();
    for record in governance.signer_keys.values() {
        if let Ok(key) = crate::chain::decode_public_key(&record.public_key) {
            keys.insert(record.key_id.clone(), key);
        }
    }
    crate::chain::verify_chain(&full, &keys)?;
    robot::reduce(&full)?;

    commit_tx(
        &mut conn,
        &tenant,
        vec![Op::RobotEventsAppend {
            robot_id: robot_id.clone(),
            events: req.events,
        }],
        None,
    )?;
    Ok(Json(json!({ "robot_id": robot_id, "accepted": true })))
}
