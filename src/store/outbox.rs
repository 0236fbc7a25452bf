//! Outbox claim/ack. At-least-once: a claim takes a lease; success marks the
//! row processed; failure schedules a retry; rows that exhaust their attempts
//! are dead-lettered in place with a `DLQ:` prefixed last_error.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, params};
use serde_json::Value;

use crate::store::StoreError;

pub const OUTBOX_MAX_ATTEMPTS: u32 = 5;
pub const OUTBOX_LEASE_SECS: i64 = 60;

#[derive(Debug, Clone)]
pub struct OutboxMessage {
    pub id: i64,
    pub tenant_id: String,
    pub topic: String,
    pub payload: Value,
    pub attempts: u32,
}

pub fn enqueue(
    conn: &Connection,
    tenant_id: &str,
    topic: &str,
    payload: &Value,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO outbox (tenant_id, topic, payload, enqueued_at) VALUES (?1, ?2, ?3, ?4)",
        params![tenant_id, topic, serde_json::to_string(payload)?, now.to_rfc3339()],
    )?;
    Ok(())
}

/// Claim up to `max_messages` unprocessed rows for `topic`. Rows past
/// `OUTBOX_MAX_ATTEMPTS` are dead-lettered instead of returned.
pub fn claim(
    conn: &Connection,
    topic: &str,
    max_messages: usize,
    worker: &str,
    now: DateTime<Utc>,
) -> Result<Vec<OutboxMessage>, StoreError> {
    let now_str = now.to_rfc3339();
    let lease_until = (now + Duration::seconds(OUTBOX_LEASE_SECS)).to_rfc3339();

    let mut stmt = conn.prepare(
        "SELECT id, tenant_id, payload, attempts, last_error FROM outbox
         WHERE topic = ?1 AND processed_at IS NULL
           AND (lease_until IS NULL OR lease_until < ?2)
         ORDER BY id LIMIT ?3",
    )?;
    let rows: Vec<(i64, String, String, u32, Option<String>)> = stmt
        .query_map(params![topic, now_str, max_messages as i64], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
            ))
        })?
        .collect::<Result<_, _>>()?;

    let mut claimed = Vec::new();
    for (id, tenant_id, payload, attempts, last_error) in rows {
        if attempts >= OUTBOX_MAX_ATTEMPTS {
            let dlq = format!("DLQ:{}", last_error.unwrap_or_default());
            conn.execute(
                "UPDATE outbox SET processed_at = ?2, last_error = ?3 WHERE id = ?1",
                params![id, now_str, dlq],
            )?;
            continue;
        }
        conn.execute(
            "UPDATE outbox SET claimed_by = ?2, lease_until = ?3 WHERE id = ?1",
            params![id, worker, lease_until],
        )?;
        claimed.push(OutboxMessage {
            id,
            tenant_id,
            topic: topic.to_string(),
            payload: serde_json::from_str(&payload)?,
            attempts,
        });
    }
    Ok(claimed)
}

pub fn mark_processed(
    conn: &Connection,
    ids: &[i64],
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    mark_processed_with_error(conn, ids, now, None)
}

/// Processed-with-note: terminal outcome that should not retry but carries a
/// reason (e.g. a blocked month close).
pub fn mark_processed_with_error(
    conn: &Connection,
    ids: &[i64],
    now: DateTime<Utc>,
    last_error: Option<&str>,
) -> Result<(), StoreError> {
    let now_str = now.to_rfc3339();
    for id in ids {
        match last_error {
            Some(err) => conn.execute(
                "UPDATE outbox SET processed_at = ?2, last_error = ?3,
                 claimed_by = NULL, lease_until = NULL WHERE id = ?1",
                params![id, now_str, err],
            )?,
            None => conn.execute(
                "UPDATE outbox SET processed_at = ?2, claimed_by = NULL, lease_until = NULL
                 WHERE id = ?1",
                params![id, now_str],
            )?,
        };
    }
    Ok(())
}

/// Record a failure and release the lease after a linear backoff.
pub fn mark_failed(
    conn: &Connection,
    id: i64,
    error: &str,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let attempts: u32 = conn.query_row(
        "SELECT attempts FROM outbox WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )?;
    let retry_at = (now + Duration::seconds(5 * (attempts as i64 + 1))).to_rfc3339();
    conn.execute(
        "UPDATE outbox SET attempts = attempts + 1, last_error = ?2,
         claimed_by = NULL, lease_until = ?3 WHERE id = ?1",
        params![id, error, retry_at],
    )?;
    Ok(())
}

/// Unprocessed depth, for health checks and quota gates.
pub fn backlog(conn: &Connection) -> Result<i64, StoreError> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM outbox WHERE processed_at IS NULL",
        [],
        |row| row.get(0),
    )?)
}

/// Dead-lettered row count (processed with a DLQ-tagged error).
pub fn dlq_depth(conn: &Connection) -> Result<i64, StoreError> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM outbox WHERE last_error LIKE 'DLQ:%'",
        [],
        |row| row.get(0),
    )?)
}

/// Purge processed rows older than the retention horizon. Returns rows
/// deleted; callers run this in bounded batches.
pub fn purge_processed(
    conn: &Connection,
    older_than: DateTime<Utc>,
    batch: usize,
) -> Result<usize, StoreError> {
    let n = conn.execute(
        "DELETE FROM outbox WHERE id IN (
            SELECT id FROM outbox WHERE processed_at IS NOT NULL AND processed_at < ?1 LIMIT ?2
         )",
        params![older_than.to_rfc3339(), batch as i64],
    )?;
    Ok(n)
}
