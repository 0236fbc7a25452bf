//! Delivery worker: claims due deliveries in `(scope_key, order_seq,
//! priority, artifact_id)` order, signs and ships them, and records the
//! outcome. External I/O happens with the store lock released.

use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::delivery::sign::{url_is_safe, webhook_signature};
use crate::delivery::{
    DELIVERY_BACKOFF_BASE_MS, DELIVERY_BACKOFF_MAX_MS, DELIVERY_MAX_ATTEMPTS, Delivery,
    DeliveryState, Destination, DestinationKind, backoff_ms,
};
use crate::store::{self};
use crate::workers::WorkerCtx;

/// Transport seam so tests ship deliveries without a network.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn post_webhook(
        &self,
        url: &str,
        timestamp: &str,
        signature: &str,
        body: &Value,
    ) -> Result<()>;

    async fn put_object(&self, destination: &Destination, key: &str, body: &[u8]) -> Result<()>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        HttpTransport {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("reqwest client"),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        HttpTransport::new()
    }
}

#[async_trait]
impl DeliveryTransport for HttpTransport {
    async fn post_webhook(
        &self,
        url: &str,
        timestamp: &str,
        signature: &str,
        body: &Value,
    ) -> Result<()> {
        let resp = self
            .client
            .post(url)
            .header("x-settld-timestamp", timestamp)
            .header("x-settld-signature", signature)
            .json(body)
            .send()
            .await?;
        if !resp.status().is_success() {
            bail!("webhook returned {}", resp.status());
        }
        Ok(())
    }

    async fn put_object(&self, destination: &Destination, key: &str, body: &[u8]) -> Result<()> {
        let DestinationKind::S3 { endpoint, bucket, prefix, .. } = &destination.kind else {
            bail!("destination is not s3");
        };
        let url = format!("{endpoint}/{bucket}/{prefix}{key}");
        let resp = self
            .client
            .put(&url)
            .header("content-type", "application/json")
            .body(body.to_vec())
            .send()
            .await?;
        if !resp.status().is_success() {
            bail!("s3 put returned {}", resp.status());
        }
        Ok(())
    }
}

struct Attempt {
    tenant_id: String,
    delivery: Delivery,
    destination: Destination,
    body: Value,
}

pub async fn tick(ctx: &WorkerCtx, max: usize) -> Result<usize> {
    let now = Utc::now();

    // Phase 1: gather work under the lock.
    let attempts: Vec<Attempt> = {
        let conn = ctx.store.db.lock().await;
        let due = store::due_deliveries(&conn, now, max)?;
        let mut attempts = Vec::new();
        for (tenant_id, delivery) in due {
            let Some(destination) =
                store::get_destination(&conn, &tenant_id, &delivery.destination_id)?
            else {
                store::update_delivery_state(
                    &conn,
                    &tenant_id,
                    &delivery.id,
                    DeliveryState::Failed,
                    delivery.attempts,
                    now,
                    Some("destination missing"),
                )?;
                continue;
            };
            if !destination.enabled {
                continue;
            }
            let Some(artifact) = store::get_artifact(&conn, &tenant_id, &delivery.artifact_id)?
            else {
                store::update_delivery_state(
                    &conn,
                    &tenant_id,
                    &delivery.id,
                    DeliveryState::Failed,
                    delivery.attempts,
                    now,
                    Some("artifact missing"),
                )?;
                continue;
            };
            attempts.push(Attempt {
                tenant_id,
                body: json!({
                    "artifact_id": artifact.artifact_id,
                    "artifact_type": artifact.artifact_type,
                    "artifact_hash": artifact.artifact_hash,
                    "body": artifact.body,
                    "delivery_id": delivery.id,
                }),
                delivery,
                destination,
            });
        }
        attempts
    };

    // Phase 2: ship with the lock released.
    let mut outcomes = Vec::with_capacity(attempts.len());
    for attempt in attempts {
        let result = ship(ctx, &attempt).await;
        outcomes.push((attempt, result));
    }

    // Phase 3: record outcomes.
    let now = Utc::now();
    let conn = ctx.store.db.lock().await;
    let mut delivered = 0;
    for (attempt, result) in outcomes {
        match result {
            Ok(()) => {
                store::update_delivery_state(
                    &conn,
                    &attempt.tenant_id,
                    &attempt.delivery.id,
                    DeliveryState::Acked,
                    attempt.delivery.attempts + 1,
                    now,
                    None,
                )?;
                ctx.metrics
                    .deliveries_attempted_total
                    .with_label_values(&["ok"])
                    .inc();
                info!(delivery_id = %attempt.delivery.id, "delivery shipped");
                delivered += 1;
            }
            Err(e) => {
                let attempts_now = attempt.delivery.attempts + 1;
                if attempts_now >= DELIVERY_MAX_ATTEMPTS {
                    store::update_delivery_state(
                        &conn,
                        &attempt.tenant_id,
                        &attempt.delivery.id,
                        DeliveryState::Failed,
                        attempts_now,
                        now,
                        Some(&format!("DLQ:{e:#}")),
                    )?;
                    ctx.metrics
                        .deliveries_attempted_total
                        .with_label_values(&["dlq"])
                        .inc();
                    warn!(delivery_id = %attempt.delivery.id, error = %format!("{e:#}"), "delivery dead-lettered");
                } else {
                    let backoff = backoff_ms(
                        attempts_now,
                        DELIVERY_BACKOFF_BASE_MS,
                        DELIVERY_BACKOFF_MAX_MS,
                    );
                    store::update_delivery_state(
                        &conn,
                        &attempt.tenant_id,
                        &attempt.delivery.id,
                        DeliveryState::Pending,
                        attempts_now,
                        now + Duration::milliseconds(backoff as i64),
                        Some(&format!("{e:#}")),
                    )?;
                    ctx.metrics
                        .deliveries_attempted_total
                        .with_label_values(&["retry"])
                        .inc();
                }
            }
        }
    }
    Ok(delivered)
}

async fn ship(ctx: &WorkerCtx, attempt: &Attempt) -> Result<()> {
    match &attempt.destination.kind {
        DestinationKind::Webhook { url, secret } => {
            if !url_is_safe(url, ctx.config.allow_private_urls) {
                return Err(anyhow!("destination url resolves to a private range"));
            }
            let timestamp = Utc::now().timestamp().to_string();
            let signature = webhook_signature(secret, &timestamp, &attempt.body)
                .map_err(|e| anyhow!("signing delivery: {e}"))?;
            ctx.transport
                .post_webhook(url, &timestamp, &signature, &attempt.body)
                .await
        }
        DestinationKind::S3 { .. } => {
            let key = format!(
                "{}/{}.json",
                attempt.delivery.artifact_type, attempt.delivery.artifact_id
            );
            let bytes = serde_json::to_vec(&attempt.body)?;
            ctx.transport
                .put_object(&attempt.destination, &key, &bytes)
                .await
        }
    }
}

/// A mock transport for tests: records everything, optionally failing the
/// first N attempts.
pub struct MockTransport {
    pub sent: tokio::sync::Mutex<Vec<(String, Value)>>,
    pub fail_first: std::sync::atomic::AtomicU32,
}

impl MockTransport {
    pub fn new(fail_first: u32) -> Arc<Self> {
        Arc::new(MockTransport {
            sent: tokio::sync::Mutex::new(Vec::new()),
            fail_first: std::sync::atomic::AtomicU32::new(fail_first),
        })
    }
}

#[async_trait]
impl DeliveryTransport for MockTransport {
    async fn post_webhook(
        &self,
        url: &str,
        _timestamp: &str,
        _signature: &str,
        body: &Value,
    ) -> Result<()> {
        if self
            .fail_first
            .fetch_update(
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
                |n| if n > 0 { Some(n - 1) } else { None },
            )
            .is_ok()
        {
            bail!("mock transport transient failure");
        }
        self.sent.lock().await.push((url.to_string(), body.clone()));
        Ok(())
    }

    async fn put_object(&self, destination: &Destination, key: &str, body: &[u8]) -> Result<()> {
        self.sent.lock().await.push((
            format!("s3:{}:{}", destination.destination_id, key),
            serde_json::from_slice(body).unwrap_or(Value::Null),
        ));
        Ok(())
    }
}
