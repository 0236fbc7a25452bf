//! Export side of the delivery rails: destination acks and presigned
//! evidence downloads.

use axum::Json;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::api::error::ApiError;
use crate::api::middleware::Tenant;
use crate::api::state::AppState;
use crate::delivery::DestinationKind;
use crate::delivery::sign::{presign_valid, verify_webhook_signature};
use crate::store::{self};

#[derive(Deserialize)]
pub struct AckRequest {
    pub delivery_id: String,
    pub receipt: Value,
}

/// Destination acknowledges a delivery. The request is HMAC-signed with the
/// destination secret over the same timestamp scheme used on the way out.
pub async fn ack(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    headers: HeaderMap,
    Json(req): Json<AckRequest>,
) -> Result<Json<Value>, ApiError> {
    let conn = state.store.db.lock().await;
    let delivery = store::get_delivery(&conn, &tenant, &req.delivery_id)?
        .ok_or_else(|| ApiError::not_found(format!("delivery {}", req.delivery_id)))?;
    let destination = store::get_destination(&conn, &tenant, &delivery.destination_id)?
        .ok_or_else(|| ApiError::not_found(format!("destination {}", delivery.destination_id)))?;

    let DestinationKind::Webhook { secret, .. } = &destination.kind else {
        return Err(ApiError::bad_request("ACK_UNSUPPORTED", "s3 destinations do not ack"));
    };
    let timestamp = headers
        .get("x-settld-timestamp")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::bad_request("SIGNATURE_REQUIRED", "missing timestamp header"))?;
    let signature = headers
        .get("x-settld-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::bad_request("SIGNATURE_REQUIRED", "missing signature header"))?;

    let signed_body = json!({ "delivery_id": req.delivery_id, "receipt": req.receipt });
    let ok = verify_webhook_signature(secret, timestamp, &signed_body, signature)
        .map_err(|e| ApiError::internal(e.to_string()))?;
    if !ok {
        return Err(ApiError::forbidden("SIG_INVALID", "ack signature invalid"));
    }

    store::put_delivery_receipt(&conn, &tenant, &req.delivery_id, &req.receipt, Utc::now())?;
    Ok(Json(json!({ "delivery_id": req.delivery_id, "acked": true })))
}

#[derive(Deserialize)]
pub struct EvidenceDownloadQuery {
    pub job_id: String,
    pub evidence_id: String,
    pub evidence_ref: String,
    pub expires_at: DateTime<Utc>,
    pub token: String,
}

/// Presigned redirect to the evidence object.
pub async fn evidence_download(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Query(q): Query<EvidenceDownloadQuery>,
) -> Result<Response, ApiError> {
    let valid = presign_valid(
        &state.config.presign_secret,
        &tenant,
        &q.job_id,
        &q.evidence_id,
        &q.evidence_ref,
        q.expires_at,
        &q.token,
        Utc::now(),
    );
    if !valid {
        return Err(ApiError::forbidden("PRESIGN_INVALID", "presign expired or invalid"));
    }

    {
        let conn = state.store.db.lock().await;
        let job = store::get_job(&conn, &tenant, &q.job_id)?
            .ok_or_else(|| ApiError::not_found(format!("job {}", q.job_id)))?;
        if job.expired_evidence.contains(&q.evidence_id) {
            return Err(ApiError::new(
                StatusCode::GONE,
                "EVIDENCE_EXPIRED",
                "evidence was removed by retention",
            ));
        }
        if !job.evidence.iter().any(|e| e.evidence_id == q.evidence_id) {
            return Err(ApiError::not_found(format!("evidence {}", q.evidence_id)));
        }
    }

    let location = format!("/evidence-objects/{tenant}/{}", q.evidence_ref);
    let mut resp = StatusCode::FOUND.into_response();
    if let Ok(v) = location.parse() {
        resp.headers_mut().insert("location", v);
    }
    Ok(resp)
}
