//! Delivery rails: destinations, dedupe keys, per-scope ordering, backoff.

pub mod sign;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DELIVERY_MAX_ATTEMPTS: u32 = 8;
pub const DELIVERY_BACKOFF_BASE_MS: u64 = 1_000;
pub const DELIVERY_BACKOFF_MAX_MS: u64 = 5 * 60 * 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Failed,
    Acked,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Pending => "pending",
            DeliveryState::Failed => "failed",
            DeliveryState::Acked => "acked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeliveryState::Pending),
            "failed" => Some(DeliveryState::Failed),
            "acked" => Some(DeliveryState::Acked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: String,
    pub destination_id: String,
    pub artifact_type: String,
    pub artifact_id: String,
    pub artifact_hash: String,
    pub dedupe_key: String,
    pub scope_key: String,
    pub order_seq: i64,
    pub priority: i64,
    pub order_key: String,
    pub state: DeliveryState,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// `{tenantId}:{destinationId}:{artifactType}:{artifactId}:{artifactHash}` —
/// UNIQUE in storage; the same artifact is never queued twice for a
/// destination.
pub fn dedupe_key(
    tenant_id: &str,
    destination_id: &str,
    artifact_type: &str,
    artifact_id: &str,
    artifact_hash: &str,
) -> String {
    format!("{tenant_id}:{destination_id}:{artifact_type}:{artifact_id}:{artifact_hash}")
}

/// Stable per-scope ordering key.
pub fn order_key(scope_key: &str, order_seq: i64, priority: i64, artifact_id: &str) -> String {
    format!("{scope_key}\n{order_seq}\n{priority}\n{artifact_id}")
}

pub fn new_delivery(
    tenant_id: &str,
    destination_id: &str,
    artifact_type: &str,
    artifact_id: &str,
    artifact_hash: &str,
    scope_key: &str,
    order_seq: i64,
    priority: i64,
    now: DateTime<Utc>,
) -> Delivery {
    Delivery {
        id: format!("dlv_{}", uuid::Uuid::new_v4().simple()),
        destination_id: destination_id.to_string(),
        artifact_type: artifact_type.to_string(),
        artifact_id: artifact_id.to_string(),
        artifact_hash: artifact_hash.to_string(),
        dedupe_key: dedupe_key(tenant_id, destination_id, artifact_type, artifact_id, artifact_hash),
        scope_key: scope_key.to_string(),
        order_seq,
        priority,
        order_key: order_key(scope_key, order_seq, priority, artifact_id),
        state: DeliveryState::Pending,
        attempts: 0,
        next_attempt_at: now,
        last_error: None,
    }
}

// ── Destinations ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DestinationKind {
    Webhook {
        url: String,
        secret: String,
    },
    S3 {
        endpoint: String,
        bucket: String,
        prefix: String,
        access_key: String,
        secret_key: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    pub destination_id: String,
    #[serde(flatten)]
    pub kind: DestinationKind,
    pub enabled: bool,
}

// ── Backoff ─────────────────────────────────────────────────────────

/// Capped exponential backoff with jitter: `base * 2^attempt`, capped, with
/// up to 20% random spread so retries from a burst don't re-align.
pub fn backoff_ms(attempt: u32, base_ms: u64, max_ms: u64) -> u64 {
    use rand::Rng;
    let exp = base_ms.saturating_mul(1u64 << attempt.min(20));
    let capped = exp.min(max_ms);
    let jitter = rand::rng().random_range(0..=capped / 5);
    capped + jitter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_key_format() {
        assert_eq!(
            dedupe_key("t1", "d1", "WorkCertificate.v1", "art_x", "abc"),
            "t1:d1:WorkCertificate.v1:art_x:abc"
        );
    }

    #[test]
    fn order_key_sorts_by_scope_then_seq() {
        let a = order_key("job:1", 1, 0, "art_a");
        let b = order_key("job:1", 2, 0, "art_a");
        let c = order_key("job:2", 0, 0, "art_a");
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn backoff_is_capped() {
        for attempt in 0..30 {
            let ms = backoff_ms(attempt, 1_000, 60_000);
            assert!(ms <= 60_000 + 12_000);
        }
    }
}
