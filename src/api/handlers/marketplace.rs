//! Marketplace tasks, bids with counter-offers, and tenant settlement
//! policies.

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::middleware::{IdempotencyKey, Tenant};
use crate::api::state::AppState;
use crate::model::settlement::SettlementPolicy;
use crate::store::commit::{Op, commit_tx};
use crate::store::{self, BidStatus, MarketplaceTask, TaskBid, TaskStatus};

use super::{check_idempotency, idempotency_op, request_hash};

#[derive(Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,
    pub description: String,
    pub amount_cents: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub created_by: String,
}

fn default_currency() -> String {
    "USD".to_string()
}

pub async fn create_task(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    IdempotencyKey(idem): IdempotencyKey,
    Json(req): Json<CreateTaskRequest>,
) -> Result<Json<Value>, ApiError> {
    let req_hash = request_hash(&json!({ "task": req.title, "by": req.created_by }))?;
    let mut conn = state.store.db.lock().await;
    if let Some((_, body)) = check_idempotency(&conn, idem.as_deref(), &req_hash)? {
        return Ok(Json(body));
    }

    let task = MarketplaceTask {
        task_id: format!("task_{}", Uuid::new_v4().simple()),
        title: req.title,
        description: req.description,
        amount_cents: req.amount_cents,
        currency: req.currency,
        status: TaskStatus::Open,
        created_by: req.created_by,
        run_id: None,
    };
    let response = serde_json::to_value(&task).map_err(|e| ApiError::internal(e.to_string()))?;
    let mut ops = vec![Op::MarketplaceTaskUpsert { task }];
    ops.extend(idempotency_op(idem.as_deref(), &req_hash, &response));
    commit_tx(&mut conn, &tenant, ops, None)?;
    Ok(Json(response))
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
) -> Result<Json<Value>, ApiError> {
    let conn = state.store.db.lock().await;
    let tasks = store::list_marketplace_tasks(&conn, &tenant)?;
    Ok(Json(serde_json::to_value(tasks).map_err(|e| ApiError::internal(e.to_string()))?))
}

#[derive(Deserialize)]
pub struct BidRequest {
    pub agent_id: String,
    pub amount_cents: i64,
}

pub async fn place_bid(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(task_id): Path<String>,
    Json(req): Json<BidRequest>,
) -> Result<Json<Value>, ApiError> {
    let mut conn = state.store.db.lock().await;
    let task = store::get_marketplace_task(&conn, &tenant, &task_id)?
        .ok_or_else(|| ApiError::not_found(format!("task {task_id}")))?;
    if task.status != TaskStatus::Open {
        return Err(ApiError::conflict("TASK_NOT_OPEN", "task is not open for bids"));
    }

    let mut bids = store::get_task_bids(&conn, &tenant, &task_id)?;
    let bid = TaskBid {
        bid_id: format!("bid_{}", Uuid::new_v4().simple()),
        agent_id: req.agent_id,
        amount_cents: req.amount_cents,
        status: BidStatus::Open,
        counter_amount_cents: None,
    };
    bids.push(bid.clone());
    commit_tx(
        &mut conn,
        &tenant,
        vec![Op::MarketplaceTaskBidsSet {
            task_id: task_id.clone(),
            bids,
        }],
        None,
    )?;
    Ok(Json(serde_json::to_value(bid).map_err(|e| ApiError::internal(e.to_string()))?))
}

#[derive(Deserialize)]
pub struct CounterOfferRequest {
    pub counter_amount_cents: i64,
}

pub async fn counter_offer(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path((task_id, bid_id)): Path<(String, String)>,
    Json(req): Json<CounterOfferRequest>,
) -> Result<Json<Value>, ApiError> {
    let mut conn = state.store.db.lock().await;
    let mut bids = store::get_task_bids(&conn, &tenant, &task_id)?;
    let bid = bids
        .iter_mut()
        .find(|b| b.bid_id == bid_id)
        .ok_or_else(|| ApiError::not_found(format!("bid {bid_id}")))?;
    if bid.status != BidStatus::Open {
        return Err(ApiError::conflict("BID_NOT_OPEN", "bid is not open"));
    }
    bid.status = BidStatus::Countered;
    bid.counter_amount_cents = Some(req.counter_amount_cents);
    let updated = bid.clone();
    commit_tx(
        &mut conn,
        &tenant,
        vec![Op::MarketplaceTaskBidsSet { task_id, bids }],
        None,
    )?;
    Ok(Json(serde_json::to_value(updated).map_err(|e| ApiError::internal(e.to_string()))?))
}

/// Accepting a bid assigns the task; run creation (and the escrow lock)
/// happens via the agent runs endpoint with the accepted amount.
pub async fn accept_bid(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path((task_id, bid_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let mut conn = state.store.db.lock().await;
    let mut task = store::get_marketplace_task(&conn, &tenant, &task_id)?
        .ok_or_else(|| ApiError::not_found(format!("task {task_id}")))?;
    let mut bids = store::get_task_bids(&conn, &tenant, &task_id)?;
    let accepted_amount;
    let agent_id;
    {
        let bid = bids
            .iter_mut()
            .find(|b| b.bid_id == bid_id)
            .ok_or_else(|| ApiError::not_found(format!("bid {bid_id}")))?;
        if !matches!(bid.status, BidStatus::Open | BidStatus::Countered) {
            return Err(ApiError::conflict("BID_NOT_OPEN", "bid is not open"));
        }
        bid.status = BidStatus::Accepted;
        accepted_amount = bid.counter_amount_cents.unwrap_or(bid.amount_cents);
        agent_id = bid.agent_id.clone();
    }
    for b in bids.iter_mut().filter(|b| b.bid_id != bid_id) {
        if b.status == BidStatus::Open || b.status == BidStatus::Countered {
            b.status = BidStatus::Rejected;
        }
    }
    task.status = TaskStatus::Assigned;
    commit_tx(
        &mut conn,
        &tenant,
        vec![
            Op::MarketplaceTaskUpsert { task },
            Op::MarketplaceTaskBidsSet {
                task_id: task_id.clone(),
                bids,
            },
        ],
        None,
    )?;
    Ok(Json(json!({
        "task_id": task_id,
        "bid_id": bid_id,
        "agent_id": agent_id,
        "accepted_amount_cents": accepted_amount,
    })))
}

pub async fn put_settlement_policy(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Json(policy): Json<SettlementPolicy>,
) -> Result<Json<Value>, ApiError> {
    let mut conn = state.store.db.lock().await;
    let response = serde_json::to_value(&policy).map_err(|e| ApiError::internal(e.to_string()))?;
    commit_tx(
        &mut conn,
        &tenant,
        vec![Op::TenantSettlementPolicyUpsert { policy }],
        None,
    )?;
    Ok(Json(response))
}

pub async fn get_settlement_policies(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
) -> Result<Json<Value>, ApiError> {
    let conn = state.store.db.lock().await;
    let policy = store::get_settlement_policy(&conn, &tenant, "default")?
        .unwrap_or_default();
    Ok(Json(serde_json::to_value(vec![policy]).map_err(|e| ApiError::internal(e.to_string()))?))
}
