mod settld_common;

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use chrono::Utc;
use serde_json::json;

use settld_common::*;

use settld::api::handlers::ingest::{self, IngestEnvelope, IngestItem};
use settld::api::middleware::{IdempotencyKey, Tenant};
use settld::api::rate_limit::RateLimiter;
use settld::api::state::{AppState, ServerConfig};
use settld::chain::create_event;
use settld::model::event::{Actor, EventBody};
use settld::store::{self};

fn app_state(env: &TestEnv) -> AppState {
    AppState {
        store: env.store.clone(),
        signer: env.signer.clone(),
        metrics: env.ctx.metrics.clone(),
        limiter: Arc::new(RateLimiter::new(600, 60)),
        config: Arc::new(ServerConfig {
            worker: (*env.ctx.config).clone(),
            ..ServerConfig::default()
        }),
    }
}

fn coverage_item(env_head: Option<String>, job_id: &str, external_id: &str) -> IngestItem {
    let event = create_event(
        &format!("job:{job_id}"),
        EventBody::ZoneCoverageReported {
            zone: "z1".to_string(),
            coverage_pct: 95,
            covered_at: Utc::now(),
        },
        Actor::Robot("r1".to_string()),
        Utc::now(),
        env_head,
    )
    .unwrap();
    IngestItem {
        external_event_id: external_id.to_string(),
        job_id: job_id.to_string(),
        event,
    }
}

#[tokio::test]
async fn duplicate_external_event_ids_are_reported_as_duplicates() {
    let env = env().await;
    seed_booked_job(&env, "job_in1").await;
    seed_robot(&env, "r1", 80).await;
    drive_to_completed(&env, "job_in1", "r1").await;
    let state = app_state(&env);

    let head = {
        let conn = env.store.db.lock().await;
        store::stream_head(&conn, TENANT, "job:job_in1").unwrap()
    };

    let Json(first) = ingest::proxy(
        State(state.clone()),
        Tenant(TENANT.to_string()),
        IdempotencyKey(None),
        HeaderMap::new(),
        Json(IngestEnvelope {
            source: "sensorhub".to_string(),
            events: vec![coverage_item(head.clone(), "job_in1", "ext_1")],
        }),
    )
    .await
    .unwrap();
    assert_eq!(first["results"][0]["status"], "accepted");

    // Same external id again: deduped regardless of payload.
    let head2 = {
        let conn = env.store.db.lock().await;
        store::stream_head(&conn, TENANT, "job:job_in1").unwrap()
    };
    let Json(second) = ingest::proxy(
        State(state.clone()),
        Tenant(TENANT.to_string()),
        IdempotencyKey(None),
        HeaderMap::new(),
        Json(IngestEnvelope {
            source: "sensorhub".to_string(),
            events: vec![coverage_item(head2, "job_in1", "ext_1")],
        }),
    )
    .await
    .unwrap();
    assert_eq!(second["results"][0]["status"], "duplicate");
}

#[tokio::test]
async fn idempotency_key_replays_the_stored_envelope_body() {
    let env = env().await;
    seed_booked_job(&env, "job_in2").await;
    seed_robot(&env, "r1", 80).await;
    drive_to_completed(&env, "job_in2", "r1").await;
    let state = app_state(&env);

    let head = {
        let conn = env.store.db.lock().await;
        store::stream_head(&conn, TENANT, "job:job_in2").unwrap()
    };
    let envelope = |head: Option<String>| IngestEnvelope {
        source: "sensorhub".to_string(),
        events: vec![coverage_item(head, "job_in2", "ext_A")],
    };

    let Json(first) = ingest::proxy(
        State(state.clone()),
        Tenant(TENANT.to_string()),
        IdempotencyKey(Some("ing-key-1".to_string())),
        HeaderMap::new(),
        Json(envelope(head.clone())),
    )
    .await
    .unwrap();

    // Replay with the same key and the same request: the stored envelope
    // comes back verbatim.
    let Json(replayed) = ingest::proxy(
        State(state.clone()),
        Tenant(TENANT.to_string()),
        IdempotencyKey(Some("ing-key-1".to_string())),
        HeaderMap::new(),
        Json(envelope(head)),
    )
    .await
    .unwrap();
    assert_eq!(first, replayed);
}

#[tokio::test]
async fn stale_head_rejects_the_event_but_not_the_envelope() {
    let env = env().await;
    seed_booked_job(&env, "job_in3").await;
    seed_robot(&env, "r1", 80).await;
    drive_to_completed(&env, "job_in3", "r1").await;
    let state = app_state(&env);

    let Json(body) = ingest::proxy(
        State(state.clone()),
        Tenant(TENANT.to_string()),
        IdempotencyKey(None),
        HeaderMap::new(),
        Json(IngestEnvelope {
            source: "sensorhub".to_string(),
            events: vec![coverage_item(Some("stale_head".to_string()), "job_in3", "ext_B")],
        }),
    )
    .await
    .unwrap();
    assert_eq!(body["results"][0]["status"], "rejected");
    assert_eq!(body["results"][0]["code"], "PREV_CHAIN_HASH_MISMATCH");
    assert_eq!(body["source"], json!("sensorhub"));
}
