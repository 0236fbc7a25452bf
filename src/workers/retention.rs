//! Retention: evidence expiry per tenant policy, plus the cleanup pass that
//! purges expired ingest records, processed outbox rows, and acked
//! deliveries under a single-flight flag, in bounded batches.

use anyhow::Result;
use chrono::{Duration, Utc};
use rusqlite::params;
use tracing::{debug, info};

use crate::model::event::{Actor, EventBody};
use crate::store::commit::{Op, commit_tx};
use crate::store::{self, outbox};
use crate::workers::{WorkerCtx, chain_events};

pub const RETENTION_CLEANUP_FLAG: &str = "retention_cleanup";
pub const PURGE_BATCH: usize = 500;

pub async fn tick(ctx: &WorkerCtx) -> Result<usize> {
    let expired = expire_evidence(ctx).await?;
    let purged = cleanup(ctx).await?;
    Ok(expired + purged)
}

/// Append EVIDENCE_EXPIRED for evidence past the tenant's retention horizon
/// and delete the underlying object.
async fn expire_evidence(ctx: &WorkerCtx) -> Result<usize> {
    let now = Utc::now();
    let mut conn = ctx.store.db.lock().await;

    let tenants: Vec<String> = {
        let mut stmt = conn.prepare("SELECT DISTINCT tenant_id FROM jobs")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<_, _>>()?
    };

    let mut expired = 0;
    let epoch = chrono::TimeZone::with_ymd_and_hms(&Utc, 1970, 1, 1, 0, 0, 0).unwrap();
    for tenant_id in tenants {
        let governance = store::get_governance(&conn, &tenant_id)?;
        let retention_days = governance.policy_at(now).evidence_retention_days;
        let cutoff = now - Duration::days(retention_days as i64);

        let captured =
            store::events_by_type_in_period(&conn, &tenant_id, "EVIDENCE_CAPTURED", epoch, cutoff)?;
        for event in captured {
            let EventBody::EvidenceCaptured(item) = &event.body else { continue };
            let job_id = event
                .stream_id
                .strip_prefix("job:")
                .unwrap_or(&event.stream_id)
                .to_string();
            let Some(job) = store::get_job(&conn, &tenant_id, &job_id)? else { continue };
            if job.expired_evidence.contains(&item.evidence_id) {
                continue;
            }

            let object = ctx
                .config
                .data_dir
                .join("evidence")
                .join(&tenant_id)
                .join(&item.evidence_ref);
            if object.exists() {
                let _ = std::fs::remove_file(&object);
            }

            let stream_id = format!("job:{job_id}");
            let head = store::stream_head(&conn, &tenant_id, &stream_id)?;
            let events = chain_events(
                &stream_id,
                head,
                vec![(
                    EventBody::EvidenceExpired {
                        evidence_id: item.evidence_id.clone(),
                    },
                    Actor::Retention,
                )],
                now,
                &ctx.signer,
            )?;
            commit_tx(
                &mut conn,
                &tenant_id,
                vec![Op::JobEventsAppend {
                    job_id: job_id.clone(),
                    events,
                }],
                None,
            )?;
            debug!(%job_id, evidence_id = %item.evidence_id, "evidence expired");
            expired += 1;
        }
    }
    Ok(expired)
}

/// Purge pass. Serialized across processes by the maintenance flag; each
/// table gets a bounded batch so a tick never runs unbounded.
async fn cleanup(ctx: &WorkerCtx) -> Result<usize> {
    let now = Utc::now();
    let conn = ctx.store.db.lock().await;

    if !store::try_acquire_flag(&conn, RETENTION_CLEANUP_FLAG, now)? {
        return Ok(0);
    }
    let result = (|| -> Result<usize> {
        let mut purged = 0usize;

        let n = conn.execute(
            "DELETE FROM ingest_records WHERE rowid IN (
                SELECT rowid FROM ingest_records WHERE expires_at < ?1 LIMIT ?2
             )",
            params![now.to_rfc3339(), PURGE_BATCH as i64],
        )?;
        ctx.metrics
            .retention_purged_total
            .with_label_values(&["ingest_records"])
            .inc_by(n as u64);
        purged += n;

        let outbox_horizon = now - Duration::days(7);
        let n = outbox::purge_processed(&conn, outbox_horizon, PURGE_BATCH)?;
        ctx.metrics
            .retention_purged_total
            .with_label_values(&["outbox"])
            .inc_by(n as u64);
        purged += n;

        let delivery_horizon = (now - Duration::days(30)).to_rfc3339();
        let n = conn.execute(
            "DELETE FROM deliveries WHERE rowid IN (
                SELECT rowid FROM deliveries
                WHERE state = 'acked' AND created_at < ?1 LIMIT ?2
             )",
            params![delivery_horizon, PURGE_BATCH as i64],
        )?;
        ctx.metrics
            .retention_purged_total
            .with_label_values(&["deliveries"])
            .inc_by(n as u64);
        purged += n;

        let n = conn.execute(
            "DELETE FROM delivery_receipts WHERE rowid IN (
                SELECT rowid FROM delivery_receipts WHERE acked_at < ?1 LIMIT ?2
             )",
            params![delivery_horizon, PURGE_BATCH as i64],
        )?;
        ctx.metrics
            .retention_purged_total
            .with_label_values(&["delivery_receipts"])
            .inc_by(n as u64);
        purged += n;

        Ok(purged)
    })();

    store::release_flag(&conn, RETENTION_CLEANUP_FLAG)?;
    ctx.metrics.maintenance_runs_total.inc();

    let purged = result?;
    if purged > 0 {
        info!(purged, "retention cleanup pass");
    }
    Ok(purged)
}
