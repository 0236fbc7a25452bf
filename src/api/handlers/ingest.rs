//! Batched external-event ingest with per-event dedupe and an envelope-level
//! DLQ-depth quota.

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::api::error::ApiError;
use crate::api::middleware::{IdempotencyKey, Tenant};
use crate::api::state::AppState;
use crate::chain::Event;
use crate::store::commit::{Op, commit_tx};
use crate::store::{self, IngestRecord, outbox};

use super::{check_idempotency, idempotency_op, request_hash};

pub const INGEST_TOKEN_HEADER: &str = "x-settld-ingest-token";

#[derive(Deserialize)]
pub struct IngestEnvelope {
    pub source: String,
    pub events: Vec<IngestItem>,
}

#[derive(Deserialize)]
pub struct IngestItem {
    pub external_event_id: String,
    pub job_id: String,
    pub event: Event,
}

pub async fn proxy(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    IdempotencyKey(idem): IdempotencyKey,
    headers: HeaderMap,
    Json(envelope): Json<IngestEnvelope>,
) -> Result<Json<Value>, ApiError> {
    if let Some(expected) = &state.config.ingest_token {
        let provided = headers
            .get(INGEST_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if provided != expected {
            return Err(ApiError::forbidden("INGEST_TOKEN_INVALID", "bad ingest token"));
        }
    }

    let req_hash = request_hash(&json!({
        "source": envelope.source,
        "ids": envelope
            .events
            .iter()
            .map(|e| e.external_event_id.clone())
            .collect::<Vec<_>>(),
    }))?;

    let mut conn = state.store.db.lock().await;
    if let Some((_, body)) = check_idempotency(&conn, idem.as_deref(), &req_hash)? {
        return Ok(Json(body));
    }

    // Envelope-level quota: a deep dead-letter queue rejects the whole batch
    // rather than admitting more work that will also rot.
    let governance = store::get_governance(&conn, &tenant)?;
    let policy = governance.policy_at(Utc::now());
    let dlq = outbox::dlq_depth(&conn)?;
    if dlq as u32 > policy.ingest_dlq_depth_limit {
        return Err(ApiError::new(
            axum::http::StatusCode::TOO_MANY_REQUESTS,
            "TENANT_QUOTA_EXCEEDED",
            "ingest rejected: dead-letter depth over limit",
        )
        .with_details(json!({ "kind": "ingest_dlq_depth", "depth": dlq })));
    }

    let now = Utc::now();
    let expires_at = now + Duration::days(state.config.worker.ingest_retention_days as i64);
    let mut results = Vec::new();
    let mut records = Vec::new();

    for item in &envelope.events {
        if store::ingest_seen(&conn, &tenant, &envelope.source, &item.external_event_id)? {
            results.push(json!({
                "external_event_id": item.external_event_id,
                "status": "duplicate",
            }));
            continue;
        }

        // Each accepted event appends to its job stream; a bad one fails its
        // own entry, not the envelope.
        let stream_id = format!("job:{}", item.job_id);
        let head = store::stream_head(&conn, &tenant, &stream_id)?;
        let append = if item.event.prev_chain_hash != head {
            Err(ApiError::conflict("PREV_CHAIN_HASH_MISMATCH", "event append conflict"))
        } else if item.event.stream_id != stream_id {
            Err(ApiError::bad_request("STREAM_MISMATCH", "event targets another stream"))
        } else if let Err(e) = crate::chain::verify_event_integrity(&item.event) {
            Err(ApiError::from(e))
        } else {
            commit_tx(
                &mut conn,
                &tenant,
                vec![Op::JobEventsAppend {
                    job_id: item.job_id.clone(),
                    events: vec![item.event.clone()],
                }],
                None,
            )
            .map_err(ApiError::from)
        };

        match append {
            Ok(()) => {
                records.push(IngestRecord {
                    source: envelope.source.clone(),
                    external_event_id: item.external_event_id.clone(),
                    job_id: item.job_id.clone(),
                    received_at: now,
                    expires_at,
                });
                results.push(json!({
                    "external_event_id": item.external_event_id,
                    "status": "accepted",
                }));
            }
            Err(e) => {
                results.push(json!({
                    "external_event_id": item.external_event_id,
                    "status": "rejected",
                    "code": e.code,
                }));
            }
        }
    }

    let response = json!({ "source": envelope.source, "results": results });
    let mut ops = vec![Op::IngestRecordsPut { records }];
    ops.extend(idempotency_op(idem.as_deref(), &req_hash, &response));
    commit_tx(&mut conn, &tenant, ops, None)?;
    Ok(Json(response))
}
