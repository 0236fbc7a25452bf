//! Request handlers. The shared append flow lives here: idempotency lookup,
//! stream-head precondition, reduce, validate, sign, commit, respond.

pub mod agents;
pub mod exports;
pub mod ingest;
pub mod jobs;
pub mod marketplace;
pub mod operators;
pub mod ops;
pub mod robots;
pub mod runs;

use chrono::Utc;
use rusqlite::Connection;
use serde_json::{Value, json};

use crate::canonical::canonical_json;
use crate::chain::{Event, sha256_hex};
use crate::model::event::{Actor, EventBody};
use crate::model::job::Job;
use crate::model::{job as job_reduce};
use crate::store::commit::{Op, commit_tx};
use crate::store::{self};
use crate::validate::job::{JobGateCtx, validate_job_event};
use crate::workers::chain_events;
use crate::workers::month_close::month_of;

use super::error::ApiError;
use super::state::AppState;

pub fn request_hash(body: &Value) -> Result<String, ApiError> {
    Ok(sha256_hex(
        canonical_json(body)
            .map_err(|e| ApiError::bad_request("BODY_INVALID", e.to_string()))?
            .as_bytes(),
    ))
}

/// Replay or conflict per stored receipt. `Ok(Some(..))` short-circuits the
/// handler with the stored response.
pub fn check_idempotency(
    conn: &Connection,
    key: Option<&str>,
    request_hash: &str,
) -> Result<Option<(u16, Value)>, ApiError> {
    let Some(key) = key else { return Ok(None) };
    match store::get_idempotency(conn, key)? {
        None => Ok(None),
        Some(receipt) if receipt.request_hash == request_hash => {
            Ok(Some((receipt.status_code, receipt.body)))
        }
        Some(_) => Err(ApiError::conflict(
            "IDEMPOTENCY_CONFLICT",
            "idempotency key was used with a different request body",
        )),
    }
}

pub fn idempotency_op(key: Option<&str>, request_hash: &str, body: &Value) -> Vec<Op> {
    match key {
        Some(key) => vec![Op::IdempotencyPut {
            key: key.to_string(),
            request_hash: request_hash.to_string(),
            status_code: 200,
            body: body.clone(),
        }],
        None => Vec::new(),
    }
}

/// Resolve the precondition header against the stored head. The literal
/// `"null"` asserts an empty stream.
pub fn check_precondition(
    head: Option<&str>,
    expected: Option<&str>,
    required: bool,
) -> Result<(), ApiError> {
    let Some(raw) = expected else {
        if required {
            return Err(ApiError::precondition_required(
                "x-proxy-expected-prev-chain-hash header is required for event writes",
            ));
        }
        return Ok(());
    };
    let expected_head = if raw == "null" { None } else { Some(raw) };
    if expected_head != head {
        return Err(ApiError::conflict(
            "PREV_CHAIN_HASH_MISMATCH",
            "event append conflict",
        )
        .with_details(json!({ "expected": expected_head, "current": head })));
    }
    Ok(())
}

/// Assemble the store-derived gate context for one new job event.
pub fn build_job_gate_inputs(
    conn: &Connection,
    tenant_id: &str,
    job_before: &Job,
    event: &Event,
) -> Result<GateInputs, ApiError> {
    let governance = store::get_governance(conn, tenant_id)?;
    let mut inputs = GateInputs {
        governance,
        robot: None,
        operator: None,
        operator_active_coverage: 0,
        has_overlapping_reservation: false,
        contract_policy_hash: None,
        contract_window: None,
        settled_month_closed: None,
    };

    match &event.body {
        EventBody::JobBooked(booking) => {
            if let Some(contract) = store::get_contract(conn, tenant_id, &booking.contract_id)? {
                inputs.contract_policy_hash = contract.policy_hash.clone();
                inputs.contract_window = contract
                    .doc
                    .get("scope_window")
                    .and_then(|w| serde_json::from_value(w.clone()).ok());
            }
        }
        EventBody::JobReserved(res) => {
            inputs.robot = store::get_robot(conn, tenant_id, &res.robot_id)?;
            inputs.has_overlapping_reservation = store::overlapping_reservation_exists(
                conn,
                tenant_id,
                &res.robot_id,
                res.window.start,
                res.window.end,
                &job_before.job_id,
            )?;
        }
        EventBody::OperatorCoverageReserved { operator_id, .. } => {
            inputs.operator = store::get_operator(conn, tenant_id, operator_id)?;
            inputs.operator_active_coverage =
                store::operator_active_coverage(conn, tenant_id, operator_id)?;
        }
        EventBody::JobSettled { settled_at, .. } => {
            let month = month_of(*settled_at);
            if store::month_is_closed(conn, tenant_id, &month, "accrual")? {
                inputs.settled_month_closed = Some(month);
            }
        }
        _ => {}
    }
    Ok(inputs)
}

pub struct GateInputs {
    pub governance: crate::model::governance::Governance,
    pub robot: Option<crate::model::robot::Robot>,
    pub operator: Option<crate::model::operator::Operator>,
    pub operator_active_coverage: u32,
    pub has_overlapping_reservation: bool,
    pub contract_policy_hash: Option<String>,
    pub contract_window: Option<crate::model::event::TimeWindow>,
    pub settled_month_closed: Option<String>,
}

/// The standard write path for server-constructed job events.
#[allow(clippy::too_many_arguments)]
pub async fn append_job_events(
    state: &AppState,
    tenant_id: &str,
    job_id: &str,
    bodies: Vec<(EventBody, Actor)>,
    expected_prev: Option<&str>,
    precondition_required: bool,
    idempotency_key: Option<&str>,
    req_hash: &str,
    extra_ops: Vec<Op>,
) -> Result<Value, ApiError> {
    let mut conn = state.store.db.lock().await;
    if let Some((_, body)) = check_idempotency(&conn, idempotency_key, req_hash)? {
        return Ok(body);
    }

    let now = Utc::now();
    let stream_id = format!("job:{job_id}");
    let prior = store::load_stream(&conn, tenant_id, &stream_id)?;
    let head = prior.last().map(|e| e.chain_hash.clone());
    check_precondition(head.as_deref(), expected_prev, precondition_required)?;

    let events = chain_events(&stream_id, head, bodies, now, &state.signer)?;

    // Validate each new event against the stream as it stands before it.
    let mut working = prior.clone();
    for event in &events {
        let job_before = if working.is_empty() {
            None
        } else {
            Some(job_reduce::reduce(&working)?)
        };
        if let Some(job_before) = &job_before {
            let inputs = build_job_gate_inputs(&conn, tenant_id, job_before, event)?;
            let policy = inputs.governance.policy_at(now);
            let gate = JobGateCtx {
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
            validate_job_event(job_before, &working, event, &gate)?;
        }
        working.push(event.clone());
    }
    let job_after = job_reduce::reduce(&working)?;

    let response = json!({
        "job_id": job_id,
        "status": job_after.status,
        "event_ids": events.iter().map(|e| e.id.clone()).collect::<Vec<_>>(),
        "chain_head": events.last().map(|e| e.chain_hash.clone()),
    });

    let mut ops = vec![Op::JobEventsAppend {
        job_id: job_id.to_string(),
        events,
    }];
    ops.extend(extra_ops);
    ops.extend(idempotency_op(idempotency_key, req_hash, &response));
    commit_tx(&mut conn, tenant_id, ops, None)?;
    state
        .metrics
        .events_committed_total
        .with_label_values(&["job"])
        .inc();
    Ok(response)
}
