//! Ops surface: month close, signer keys, governance events, destinations,
//! delivery requeue, maintenance, contracts.

use axum::Json;
use axum::extract::{Path, State};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::api::auth::{
    OpsAuth, SCOPE_FINANCE_WRITE, SCOPE_GOV_GLOBAL_WRITE, SCOPE_GOV_TENANT_WRITE, SCOPE_OPS_WRITE,
};
use crate::api::error::ApiError;
use crate::api::middleware::Tenant;
use crate::api::state::AppState;
use crate::canonical::canonical_json;
use crate::chain::sha256_hex;
use crate::delivery::{Destination, DeliveryState};
use crate::model::event::{Actor, EventBody, SignerOwnerKind, TenantPolicyOverride};
use crate::model::governance::DEFAULT_TENANT_ID;
use crate::model::month;
use crate::store::commit::{Op, commit_tx};
use crate::store::{self, AuditEntry, ContractRecord, ContractStatus};
use crate::workers::chain_events;
use crate::workers::retention::RETENTION_CLEANUP_FLAG;

fn audit(auth: &OpsAuth, action: &str, detail: String) -> Option<AuditEntry> {
    Some(AuditEntry {
        actor: auth.label.clone(),
        action: action.to_string(),
        detail,
    })
}

// ── Month close ─────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct MonthCloseRequest {
    pub month: String,
    #[serde(default = "default_basis")]
    pub basis: String,
}

fn default_basis() -> String {
    "accrual".to_string()
}

pub async fn month_close(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    auth: OpsAuth,
    Json(req): Json<MonthCloseRequest>,
) -> Result<Json<Value>, ApiError> {
    auth.require(SCOPE_FINANCE_WRITE)?;
    let mut conn = state.store.db.lock().await;
    commit_tx(
        &mut conn,
        &tenant,
        vec![Op::OutboxEnqueue {
            topic: "MONTH_CLOSE_REQUESTED".to_string(),
            payload: json!({ "month": req.month, "basis": req.basis }),
        }],
        audit(&auth, "month_close_requested", format!("{}:{}", req.month, req.basis)),
    )?;
    Ok(Json(json!({ "month": req.month, "basis": req.basis, "status": "requested" })))
}

#[derive(Deserialize)]
pub struct MonthReopenRequest {
    pub month: String,
    #[serde(default = "default_basis")]
    pub basis: String,
    pub reason: String,
}

pub async fn month_reopen(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    auth: OpsAuth,
    Json(req): Json<MonthReopenRequest>,
) -> Result<Json<Value>, ApiError> {
    auth.require(SCOPE_FINANCE_WRITE)?;
    let mut conn = state.store.db.lock().await;
    let stream_id = month::stream_id(&req.month, &req.basis);
    let head = store::stream_head(&conn, &tenant, &stream_id)?;
    if head.is_none() {
        return Err(ApiError::not_found(format!("month close {}", req.month)));
    }
    let events = chain_events(
        &stream_id,
        head,
        vec![(
            EventBody::MonthCloseReopened {
                month: req.month.clone(),
                basis: req.basis.clone(),
                reason: req.reason.clone(),
            },
            Actor::Finance(auth.label.clone()),
        )],
        Utc::now(),
        &state.signer,
    )?;
    commit_tx(
        &mut conn,
        &tenant,
        vec![Op::MonthEventsAppend { stream_id, events }],
        audit(&auth, "month_close_reopened", req.reason),
    )?;
    Ok(Json(json!({ "month": req.month, "basis": req.basis, "status": "REOPENED" })))
}

// ── Signer keys (global governance) ─────────────────────────────────

#[derive(Deserialize)]
pub struct SignerKeyRequest {
    pub action: String,
    pub key_id: String,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub replaces_key_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn signer_keys(
    State(state): State<AppState>,
    auth: OpsAuth,
    Json(req): Json<SignerKeyRequest>,
) -> Result<Json<Value>, ApiError> {
    auth.require(SCOPE_GOV_GLOBAL_WRITE)?;
    let body = match req.action.as_str() {
        "register" => EventBody::SignerKeyRegistered {
            key_id: req.key_id.clone(),
            public_key: req
                .public_key
                .clone()
                .ok_or_else(|| ApiError::bad_request("KEY_REQUIRED", "public_key required"))?,
            owner_kind: SignerOwnerKind::Server,
            owner_id: None,
        },
        "rotate" => EventBody::SignerKeyRotated {
            key_id: req.key_id.clone(),
            public_key: req
                .public_key
                .clone()
                .ok_or_else(|| ApiError::bad_request("KEY_REQUIRED", "public_key required"))?,
            replaces_key_id: req.replaces_key_id.clone().ok_or_else(|| {
                ApiError::bad_request("KEY_REQUIRED", "replaces_key_id required")
            })?,
        },
        "revoke" => EventBody::SignerKeyRevoked {
            key_id: req.key_id.clone(),
            reason: req.reason.clone().unwrap_or_else(|| "ops".to_string()),
        },
        other => {
            return Err(ApiError::bad_request(
                "ACTION_INVALID",
                format!("unknown signer key action {other}"),
            ));
        }
    };

    let mut conn = state.store.db.lock().await;
    // Server signer keys live in the global governance stream.
    let head = store::stream_head(
        &conn,
        DEFAULT_TENANT_ID,
        crate::model::governance::GOVERNANCE_STREAM,
    )?;
    let events = chain_events(
        crate::model::governance::GOVERNANCE_STREAM,
        head,
        vec![(body, Actor::Ops(auth.label.clone()))],
        Utc::now(),
        &state.signer,
    )?;
    commit_tx(
        &mut conn,
        DEFAULT_TENANT_ID,
        vec![Op::GovernanceEventsAppend { events }],
        audit(&auth, "signer_key", format!("{}:{}", req.action, req.key_id)),
    )?;
    Ok(Json(json!({ "key_id": req.key_id, "action": req.action })))
}

// ── Tenant governance events ────────────────────────────────────────

#[derive(Deserialize)]
pub struct GovernanceEventRequest {
    pub effective_from: DateTime<Utc>,
    pub policy: TenantPolicyOverride,
}

pub async fn governance_events(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    auth: OpsAuth,
    Json(req): Json<GovernanceEventRequest>,
) -> Result<Json<Value>, ApiError> {
    auth.require(SCOPE_GOV_TENANT_WRITE)?;
    let mut conn = state.store.db.lock().await;
    let head = store::stream_head(&conn, &tenant, crate::model::governance::GOVERNANCE_STREAM)?;
    let events = chain_events(
        crate::model::governance::GOVERNANCE_STREAM,
        head,
        vec![(
            EventBody::TenantPolicyUpdated {
                effective_from: req.effective_from,
                policy: req.policy.clone(),
            },
            Actor::Ops(auth.label.clone()),
        )],
        Utc::now(),
        &state.signer,
    )?;
    commit_tx(
        &mut conn,
        &tenant,
        vec![Op::GovernanceEventsAppend { events }],
        audit(&auth, "tenant_policy_updated", req.effective_from.to_rfc3339()),
    )?;
    Ok(Json(json!({ "status": "committed", "effective_from": req.effective_from })))
}

// ── Destinations / deliveries ───────────────────────────────────────

pub async fn put_destination(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    auth: OpsAuth,
    Json(destination): Json<Destination>,
) -> Result<Json<Value>, ApiError> {
    auth.require(SCOPE_OPS_WRITE)?;
    let conn = state.store.db.lock().await;
    store::put_destination(&conn, &tenant, &destination)?;
    Ok(Json(json!({ "destination_id": destination.destination_id })))
}

pub async fn requeue_delivery(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    auth: OpsAuth,
    Path(delivery_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    auth.require(SCOPE_OPS_WRITE)?;
    let conn = state.store.db.lock().await;
    let delivery = store::get_delivery(&conn, &tenant, &delivery_id)?
        .ok_or_else(|| ApiError::not_found(format!("delivery {delivery_id}")))?;
    store::update_delivery_state(
        &conn,
        &tenant,
        &delivery_id,
        DeliveryState::Pending,
        delivery.attempts,
        Utc::now(),
        None,
    )?;
    Ok(Json(json!({ "delivery_id": delivery_id, "state": "pending" })))
}

// ── Maintenance ─────────────────────────────────────────────────────

pub async fn maintenance(
    State(state): State<AppState>,
    auth: OpsAuth,
) -> Result<Json<Value>, ApiError> {
    auth.require(SCOPE_OPS_WRITE)?;
    let conn = state.store.db.lock().await;
    let held: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM maintenance_flags WHERE name = ?1",
            rusqlite::params![RETENTION_CLEANUP_FLAG],
            |row| row.get(0),
        )
        .map_err(|e| ApiError::internal(e.to_string()))?;
    if held > 0 {
        return Err(ApiError::conflict(
            "MAINTENANCE_ALREADY_RUNNING",
            "a maintenance pass holds the retention flag",
        ));
    }
    Ok(Json(json!({ "status": "idle" })))
}

// ── Contracts ───────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ContractRequest {
    pub action: String,
    pub contract_id: String,
    #[serde(default)]
    pub doc: Option<Value>,
    #[serde(default)]
    pub contract_hash: Option<String>,
    #[serde(default)]
    pub signer: Option<String>,
}

/// Contracts-as-code lifecycle: draft → publish (hash must match) → sign →
/// activate (compiles the policy snapshot hash).
pub async fn contracts(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    auth: OpsAuth,
    Json(req): Json<ContractRequest>,
) -> Result<Json<Value>, ApiError> {
    auth.require(SCOPE_OPS_WRITE)?;
    let mut conn = state.store.db.lock().await;
    let existing = store::get_contract(&conn, &tenant, &req.contract_id)?;

    let contract = match req.action.as_str() {
        "create" => {
            if existing.is_some() {
                return Err(ApiError::conflict("CONTRACT_EXISTS", "contract exists"));
            }
            let doc = req
                .doc
                .ok_or_else(|| ApiError::bad_request("DOC_REQUIRED", "doc required"))?;
            let hash = sha256_hex(
                canonical_json(&doc)
                    .map_err(|e| ApiError::internal(e.to_string()))?
                    .as_bytes(),
            );
            ContractRecord {
                contract_id: req.contract_id.clone(),
                status: ContractStatus::Draft,
                doc,
                contract_hash: hash,
                policy_hash: None,
                compiler_id: None,
                required_signers: vec!["customer".to_string(), "platform".to_string()],
                signatures: Vec::new(),
            }
        }
        "publish" => {
            let mut contract = existing
                .ok_or_else(|| ApiError::not_found(format!("contract {}", req.contract_id)))?;
            let claimed = req.contract_hash.ok_or_else(|| {
                ApiError::bad_request("HASH_REQUIRED", "contract_hash required to publish")
            })?;
            if claimed != contract.contract_hash {
                return Err(ApiError::conflict(
                    "CONTRACT_HASH_MISMATCH",
                    "published hash does not match the stored document",
                ));
            }
            contract.status = ContractStatus::Published;
            contract
        }
        "sign" => {
            let mut contract = existing
                .ok_or_else(|| ApiError::not_found(format!("contract {}", req.contract_id)))?;
            let signer = req
                .signer
                .ok_or_else(|| ApiError::bad_request("SIGNER_REQUIRED", "signer required"))?;
            if !contract.signatures.contains(&signer) {
                contract.signatures.push(signer);
            }
            if contract
                .required_signers
                .iter()
                .all(|s| contract.signatures.contains(s))
            {
                contract.status = ContractStatus::Signed;
            }
            contract
        }
        "activate" => {
            let mut contract = existing
                .ok_or_else(|| ApiError::not_found(format!("contract {}", req.contract_id)))?;
            if contract.status != ContractStatus::Signed {
                return Err(ApiError::conflict(
                    "CONTRACT_NOT_SIGNED",
                    "all required parties must sign before activation",
                ));
            }
            // Compile: the policy snapshot hash is derived from the doc and
            // the compiler id, so bookings can pin it immutably.
            let compiler_id = "settld-policy-compiler/1";
            contract.policy_hash = Some(sha256_hex(
                format!("{}:{}", compiler_id, contract.contract_hash).as_bytes(),
            ));
            contract.compiler_id = Some(compiler_id.to_string());
            contract.status = ContractStatus::Active;
            contract
        }
        other => {
            return Err(ApiError::bad_request(
                "ACTION_INVALID",
                format!("unknown contract action {other}"),
            ));
        }
    };

    let response = serde_json::to_value(&contract).map_err(|e| ApiError::internal(e.to_string()))?;
    commit_tx(
        &mut conn,
        &tenant,
        vec![Op::ContractUpsert { contract }],
        audit(&auth, "contract", format!("{}:{}", req.action, req.contract_id)),
    )?;
    Ok(Json(response))
}
