//! Persistence. One sqlite database (file-backed with WAL, or in-memory for
//! tests) holds streams, projections, outbox, deliveries, and control-plane
//! rows. All writes go through `commit::commit_tx`; everything here is the
//! read/query surface plus migrations.

pub mod commit;
pub mod outbox;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::chain::Event;
use crate::delivery::{Delivery, DeliveryState, Destination};
use crate::model::agent_run::AgentRun;
use crate::model::governance::{DEFAULT_TENANT_ID, Governance};
use crate::model::job::Job;
use crate::model::month::{MonthClose, MonthStatus};
use crate::model::operator::Operator;
use crate::model::robot::Robot;
use crate::model::settlement::{SettlementPolicy, SettlementRecord};
use crate::model::wallet::AgentWallet;
use crate::model::{ReduceError, governance};

pub type Db = Arc<Mutex<Connection>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("row decode: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Reduce(#[from] ReduceError),
}

#[derive(Clone)]
pub struct Store {
    pub db: Db,
}

impl Store {
    pub fn open(path: &Path) -> Result<Store> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("creating db directory")?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening sqlite at {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
        migrate(&conn)?;
        Ok(Store {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Store> {
        let conn = Connection::open_in_memory().context("opening in-memory sqlite")?;
        migrate(&conn)?;
        Ok(Store {
            db: Arc::new(Mutex::new(conn)),
        })
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS events (
            tenant_id        TEXT NOT NULL,
            stream_id        TEXT NOT NULL,
            seq              INTEGER NOT NULL,
            event_id         TEXT NOT NULL,
            event_type       TEXT NOT NULL,
            chain_hash       TEXT NOT NULL,
            prev_chain_hash  TEXT,
            at               TEXT NOT NULL,
            body             TEXT NOT NULL,
            PRIMARY KEY (tenant_id, stream_id, seq),
            UNIQUE (tenant_id, event_id)
        );

        CREATE TABLE IF NOT EXISTS jobs (
            tenant_id  TEXT NOT NULL,
            job_id     TEXT NOT NULL,
            status     TEXT NOT NULL,
            body       TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (tenant_id, job_id)
        );

        CREATE TABLE IF NOT EXISTS robots (
            tenant_id  TEXT NOT NULL,
            robot_id   TEXT NOT NULL,
            status     TEXT NOT NULL,
            body       TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (tenant_id, robot_id)
        );

        CREATE TABLE IF NOT EXISTS operators (
            tenant_id   TEXT NOT NULL,
            operator_id TEXT NOT NULL,
            status      TEXT NOT NULL,
            body        TEXT NOT NULL,
            updated_at  TEXT NOT NULL,
            PRIMARY KEY (tenant_id, operator_id)
        );

        CREATE TABLE IF NOT EXISTS months (
            tenant_id TEXT NOT NULL,
            month     TEXT NOT NULL,
            basis     TEXT NOT NULL,
            status    TEXT NOT NULL,
            body      TEXT NOT NULL,
            PRIMARY KEY (tenant_id, month, basis)
        );

        CREATE TABLE IF NOT EXISTS agent_runs (
            tenant_id  TEXT NOT NULL,
            run_id     TEXT NOT NULL,
            status     TEXT NOT NULL,
            body       TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (tenant_id, run_id)
        );

        CREATE TABLE IF NOT EXISTS outbox (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id    TEXT NOT NULL,
            topic        TEXT NOT NULL,
            payload      TEXT NOT NULL,
            enqueued_at  TEXT NOT NULL,
            processed_at TEXT,
            attempts     INTEGER NOT NULL DEFAULT 0,
            last_error   TEXT,
            claimed_by   TEXT,
            lease_until  TEXT
        );
        CREATE INDEX IF NOT EXISTS outbox_topic_idx ON outbox (topic, processed_at, id);

        CREATE TABLE IF NOT EXISTS idempotency (
            key          TEXT PRIMARY KEY,
            request_hash TEXT NOT NULL,
            status_code  INTEGER NOT NULL,
            body         TEXT NOT NULL,
            created_at   TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS ingest_records (
            tenant_id         TEXT NOT NULL,
            source            TEXT NOT NULL,
            external_event_id TEXT NOT NULL,
            job_id            TEXT NOT NULL,
            received_at       TEXT NOT NULL,
            expires_at        TEXT NOT NULL,
            PRIMARY KEY (tenant_id, source, external_event_id)
        );

        CREATE TABLE IF NOT EXISTS agent_wallets (
            tenant_id TEXT NOT NULL,
            agent_id  TEXT NOT NULL,
            revision  INTEGER NOT NULL,
            body      TEXT NOT NULL,
            PRIMARY KEY (tenant_id, agent_id)
        );

        CREATE TABLE IF NOT EXISTS agent_run_settlements (
            tenant_id TEXT NOT NULL,
            run_id    TEXT NOT NULL,
            revision  INTEGER NOT NULL,
            body      TEXT NOT NULL,
            PRIMARY KEY (tenant_id, run_id)
        );

        CREATE TABLE IF NOT EXISTS ledger_postings (
            id        INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id TEXT NOT NULL,
            kind      TEXT NOT NULL,
            entries   TEXT NOT NULL,
            at        TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS ledger_balances (
            tenant_id     TEXT NOT NULL,
            account       TEXT NOT NULL,
            balance_cents INTEGER NOT NULL,
            PRIMARY KEY (tenant_id, account)
        );

        CREATE TABLE IF NOT EXISTS marketplace_tasks (
            tenant_id TEXT NOT NULL,
            task_id   TEXT NOT NULL,
            status    TEXT NOT NULL,
            body      TEXT NOT NULL,
            PRIMARY KEY (tenant_id, task_id)
        );

        CREATE TABLE IF NOT EXISTS marketplace_task_bids (
            tenant_id TEXT NOT NULL,
            task_id   TEXT NOT NULL,
            bids      TEXT NOT NULL,
            PRIMARY KEY (tenant_id, task_id)
        );

        CREATE TABLE IF NOT EXISTS tenant_settlement_policies (
            tenant_id TEXT NOT NULL,
            policy_id TEXT NOT NULL,
            body      TEXT NOT NULL,
            PRIMARY KEY (tenant_id, policy_id)
        );

        CREATE TABLE IF NOT EXISTS signer_keys (
            tenant_id TEXT NOT NULL,
            key_id    TEXT NOT NULL,
            body      TEXT NOT NULL,
            PRIMARY KEY (tenant_id, key_id)
        );

        CREATE TABLE IF NOT EXISTS public_keys (
            tenant_id  TEXT NOT NULL,
            key_id     TEXT NOT NULL,
            public_key TEXT NOT NULL,
            PRIMARY KEY (tenant_id, key_id)
        );

        CREATE TABLE IF NOT EXISTS auth_keys (
            token_hash TEXT PRIMARY KEY,
            tenant_id  TEXT NOT NULL,
            scopes     TEXT NOT NULL,
            label      TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS contracts (
            tenant_id     TEXT NOT NULL,
            contract_id   TEXT NOT NULL,
            status        TEXT NOT NULL,
            contract_hash TEXT NOT NULL,
            policy_hash   TEXT,
            body          TEXT NOT NULL,
            PRIMARY KEY (tenant_id, contract_id)
        );

        CREATE TABLE IF NOT EXISTS artifacts (
            tenant_id     TEXT NOT NULL,
            artifact_id   TEXT NOT NULL,
            artifact_type TEXT NOT NULL,
            artifact_hash TEXT NOT NULL,
            body          TEXT NOT NULL,
            created_at    TEXT NOT NULL,
            PRIMARY KEY (tenant_id, artifact_id)
        );

        CREATE TABLE IF NOT EXISTS destinations (
            tenant_id      TEXT NOT NULL,
            destination_id TEXT NOT NULL,
            body           TEXT NOT NULL,
            PRIMARY KEY (tenant_id, destination_id)
        );

        CREATE TABLE IF NOT EXISTS deliveries (
            tenant_id       TEXT NOT NULL,
            id              TEXT NOT NULL,
            destination_id  TEXT NOT NULL,
            artifact_type   TEXT NOT NULL,
            artifact_id     TEXT NOT NULL,
            artifact_hash   TEXT NOT NULL,
            dedupe_key      TEXT NOT NULL UNIQUE,
            scope_key       TEXT NOT NULL,
            order_seq       INTEGER NOT NULL,
            priority        INTEGER NOT NULL,
            order_key       TEXT NOT NULL,
            state           TEXT NOT NULL,
            attempts        INTEGER NOT NULL DEFAULT 0,
            next_attempt_at TEXT NOT NULL,
            last_error      TEXT,
            created_at      TEXT NOT NULL,
            PRIMARY KEY (tenant_id, id)
        );
        CREATE INDEX IF NOT EXISTS deliveries_order_idx
            ON deliveries (state, scope_key, order_seq, priority, artifact_id);

        CREATE TABLE IF NOT EXISTS delivery_receipts (
            tenant_id   TEXT NOT NULL,
            delivery_id TEXT NOT NULL,
            receipt     TEXT NOT NULL,
            acked_at    TEXT NOT NULL,
            PRIMARY KEY (tenant_id, delivery_id)
        );

        CREATE TABLE IF NOT EXISTS robot_reservations (
            tenant_id    TEXT NOT NULL,
            robot_id     TEXT NOT NULL,
            job_id       TEXT NOT NULL,
            window_start TEXT NOT NULL,
            window_end   TEXT NOT NULL,
            PRIMARY KEY (tenant_id, robot_id, job_id)
        );

        CREATE TABLE IF NOT EXISTS party_statements (
            tenant_id TEXT NOT NULL,
            month     TEXT NOT NULL,
            party_id  TEXT NOT NULL,
            body      TEXT NOT NULL,
            PRIMARY KEY (tenant_id, month, party_id)
        );

        CREATE TABLE IF NOT EXISTS ops_audit (
            id        INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id TEXT NOT NULL,
            actor     TEXT NOT NULL,
            action    TEXT NOT NULL,
            detail    TEXT NOT NULL,
            at        TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS maintenance_flags (
            name      TEXT PRIMARY KEY,
            locked_at TEXT NOT NULL
        );
        ",
    )
    .context("running migrations")?;
    Ok(())
}

// ── Row types that are projections, not event-sourced ───────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRecord {
    pub source: String,
    pub external_event_id: String,
    pub job_id: String,
    pub received_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    Draft,
    Published,
    Signed,
    Active,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractRecord {
    pub contract_id: String,
    pub status: ContractStatus,
    pub doc: serde_json::Value,
    pub contract_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiler_id: Option<String>,
    #[serde(default)]
    pub required_signers: Vec<String>,
    #[serde(default)]
    pub signatures: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    Assigned,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketplaceTask {
    pub task_id: String,
    pub title: String,
    pub description: String,
    pub amount_cents: i64,
    pub currency: String,
    pub status: TaskStatus,
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BidStatus {
    Open,
    Countered,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskBid {
    pub bid_id: String,
    pub agent_id: String,
    pub amount_cents: i64,
    pub status: BidStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counter_amount_cents: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub actor: String,
    pub action: String,
    pub detail: String,
}

// ── Stream reads ────────────────────────────────────────────────────

pub fn load_stream(
    conn: &Connection,
    tenant_id: &str,
    stream_id: &str,
) -> Result<Vec<Event>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT body FROM events WHERE tenant_id = ?1 AND stream_id = ?2 ORDER BY seq",
    )?;
    let rows = stmt.query_map(params![tenant_id, stream_id], |row| {
        row.get::<_, String>(0)
    })?;
    let mut events = Vec::new();
    for row in rows {
        events.push(serde_json::from_str(&row?)?);
    }
    Ok(events)
}

pub fn stream_head(
    conn: &Connection,
    tenant_id: &str,
    stream_id: &str,
) -> Result<Option<String>, StoreError> {
    let head = conn
        .query_row(
            "SELECT chain_hash FROM events WHERE tenant_id = ?1 AND stream_id = ?2
             ORDER BY seq DESC LIMIT 1",
            params![tenant_id, stream_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(head)
}

fn get_projection<T: serde::de::DeserializeOwned>(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Option<T>, StoreError> {
    let body: Option<String> = conn.query_row(sql, params, |row| row.get(0)).optional()?;
    match body {
        Some(b) => Ok(Some(serde_json::from_str(&b)?)),
        None => Ok(None),
    }
}

pub fn get_job(conn: &Connection, tenant_id: &str, job_id: &str) -> Result<Option<Job>, StoreError> {
    get_projection(
        conn,
        "SELECT body FROM jobs WHERE tenant_id = ?1 AND job_id = ?2",
        &[&tenant_id, &job_id],
    )
}

pub fn list_jobs_by_status(
    conn: &Connection,
    tenant_id: &str,
    statuses: &[&str],
) -> Result<Vec<Job>, StoreError> {
    let mut jobs = Vec::new();
    let mut stmt =
        conn.prepare("SELECT body FROM jobs WHERE tenant_id = ?1 AND status = ?2")?;
    for status in statuses {
        let rows = stmt.query_map(params![tenant_id, status], |row| row.get::<_, String>(0))?;
        for row in rows {
            jobs.push(serde_json::from_str(&row?)?);
        }
    }
    Ok(jobs)
}

pub fn get_robot(
    conn: &Connection,
    tenant_id: &str,
    robot_id: &str,
) -> Result<Option<Robot>, StoreError> {
    get_projection(
        conn,
        "SELECT body FROM robots WHERE tenant_id = ?1 AND robot_id = ?2",
        &[&tenant_id, &robot_id],
    )
}

pub fn list_robots(conn: &Connection, tenant_id: &str) -> Result<Vec<Robot>, StoreError> {
    let mut stmt = conn.prepare("SELECT body FROM robots WHERE tenant_id = ?1")?;
    let rows = stmt.query_map(params![tenant_id], |row| row.get::<_, String>(0))?;
    let mut robots = Vec::new();
    for row in rows {
        robots.push(serde_json::from_str(&row?)?);
    }
    Ok(robots)
}

pub fn get_operator(
    conn: &Connection,
    tenant_id: &str,
    operator_id: &str,
) -> Result<Option<Operator>, StoreError> {
    get_projection(
        conn,
        "SELECT body FROM operators WHERE tenant_id = ?1 AND operator_id = ?2",
        &[&tenant_id, &operator_id],
    )
}

pub fn list_operators(conn: &Connection, tenant_id: &str) -> Result<Vec<Operator>, StoreError> {
    let mut stmt = conn.prepare("SELECT body FROM operators WHERE tenant_id = ?1")?;
    let rows = stmt.query_map(params![tenant_id], |row| row.get::<_, String>(0))?;
    let mut operators = Vec::new();
    for row in rows {
        operators.push(serde_json::from_str(&row?)?);
    }
    Ok(operators)
}

pub fn get_agent_run(
    conn: &Connection,
    tenant_id: &str,
    run_id: &str,
) -> Result<Option<AgentRun>, StoreError> {
    get_projection(
        conn,
        "SELECT body FROM agent_runs WHERE tenant_id = ?1 AND run_id = ?2",
        &[&tenant_id, &run_id],
    )
}

pub fn get_month(
    conn: &Connection,
    tenant_id: &str,
    month: &str,
    basis: &str,
) -> Result<Option<MonthClose>, StoreError> {
    get_projection(
        conn,
        "SELECT body FROM months WHERE tenant_id = ?1 AND month = ?2 AND basis = ?3",
        &[&tenant_id, &month, &basis],
    )
}

pub fn month_is_closed(
    conn: &Connection,
    tenant_id: &str,
    month: &str,
    basis: &str,
) -> Result<bool, StoreError> {
    Ok(get_month(conn, tenant_id, month, basis)?
        .is_some_and(|m| m.status == MonthStatus::Closed))
}

pub fn get_wallet(
    conn: &Connection,
    tenant_id: &str,
    agent_id: &str,
) -> Result<Option<AgentWallet>, StoreError> {
    get_projection(
        conn,
        "SELECT body FROM agent_wallets WHERE tenant_id = ?1 AND agent_id = ?2",
        &[&tenant_id, &agent_id],
    )
}

pub fn list_wallets(conn: &Connection, tenant_id: &str) -> Result<Vec<AgentWallet>, StoreError> {
    let mut stmt = conn.prepare("SELECT body FROM agent_wallets WHERE tenant_id = ?1")?;
    let rows = stmt.query_map(params![tenant_id], |row| row.get::<_, String>(0))?;
    let mut wallets = Vec::new();
    for row in rows {
        wallets.push(serde_json::from_str(&row?)?);
    }
    Ok(wallets)
}

pub fn list_tenants(conn: &Connection) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT tenant_id FROM agent_wallets
         UNION SELECT DISTINCT tenant_id FROM jobs",
    )?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut tenants = Vec::new();
    for row in rows {
        tenants.push(row?);
    }
    Ok(tenants)
}

pub fn get_settlement(
    conn: &Connection,
    tenant_id: &str,
    run_id: &str,
) -> Result<Option<SettlementRecord>, StoreError> {
    get_projection(
        conn,
        "SELECT body FROM agent_run_settlements WHERE tenant_id = ?1 AND run_id = ?2",
        &[&tenant_id, &run_id],
    )
}

pub fn get_settlement_policy(
    conn: &Connection,
    tenant_id: &str,
    policy_id: &str,
) -> Result<Option<SettlementPolicy>, StoreError> {
    get_projection(
        conn,
        "SELECT body FROM tenant_settlement_policies WHERE tenant_id = ?1 AND policy_id = ?2",
        &[&tenant_id, &policy_id],
    )
}

pub fn get_marketplace_task(
    conn: &Connection,
    tenant_id: &str,
    task_id: &str,
) -> Result<Option<MarketplaceTask>, StoreError> {
    get_projection(
        conn,
        "SELECT body FROM marketplace_tasks WHERE tenant_id = ?1 AND task_id = ?2",
        &[&tenant_id, &task_id],
    )
}

pub fn list_marketplace_tasks(
    conn: &Connection,
    tenant_id: &str,
) -> Result<Vec<MarketplaceTask>, StoreError> {
    let mut stmt = conn.prepare("SELECT body FROM marketplace_tasks WHERE tenant_id = ?1")?;
    let rows = stmt.query_map(params![tenant_id], |row| row.get::<_, String>(0))?;
    let mut tasks = Vec::new();
    for row in rows {
        tasks.push(serde_json::from_str(&row?)?);
    }
    Ok(tasks)
}

pub fn get_task_bids(
    conn: &Connection,
    tenant_id: &str,
    task_id: &str,
) -> Result<Vec<TaskBid>, StoreError> {
    Ok(get_projection(
        conn,
        "SELECT bids FROM marketplace_task_bids WHERE tenant_id = ?1 AND task_id = ?2",
        &[&tenant_id, &task_id],
    )?
    .unwrap_or_default())
}

pub fn get_contract(
    conn: &Connection,
    tenant_id: &str,
    contract_id: &str,
) -> Result<Option<ContractRecord>, StoreError> {
    get_projection(
        conn,
        "SELECT body FROM contracts WHERE tenant_id = ?1 AND contract_id = ?2",
        &[&tenant_id, &contract_id],
    )
}

/// Reduce the tenant governance stream; server signer keys live in the
/// global (default-tenant) governance stream and are merged in.
pub fn get_governance(conn: &Connection, tenant_id: &str) -> Result<Governance, StoreError> {
    let mut gov = governance::reduce(&load_stream(
        conn,
        DEFAULT_TENANT_ID,
        governance::GOVERNANCE_STREAM,
    )?)?;
    if tenant_id != DEFAULT_TENANT_ID {
        let tenant_gov = governance::reduce(&load_stream(
            conn,
            tenant_id,
            governance::GOVERNANCE_STREAM,
        )?)?;
        gov.signer_keys.extend(tenant_gov.signer_keys);
        gov.overrides.extend(tenant_gov.overrides);
    }
    Ok(gov)
}

/// Events of one type across all streams of a tenant within [start, end).
/// The stored `at` strings share one format, so range compares are textual.
pub fn events_by_type_in_period(
    conn: &Connection,
    tenant_id: &str,
    event_type: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<Event>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT body FROM events
         WHERE tenant_id = ?1 AND event_type = ?2 AND at >= ?3 AND at < ?4
         ORDER BY at",
    )?;
    let rows = stmt.query_map(
        params![
            tenant_id,
            event_type,
            start.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            end.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
        ],
        |row| row.get::<_, String>(0),
    )?;
    let mut events = Vec::new();
    for row in rows {
        events.push(serde_json::from_str(&row?)?);
    }
    Ok(events)
}

pub fn ledger_postings_in_period(
    conn: &Connection,
    tenant_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<crate::model::wallet::LedgerPosting>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT kind, entries, at FROM ledger_postings
         WHERE tenant_id = ?1 AND at >= ?2 AND at < ?3 ORDER BY id",
    )?;
    let rows = stmt.query_map(
        params![tenant_id, start.to_rfc3339(), end.to_rfc3339()],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        },
    )?;
    let mut postings = Vec::new();
    for row in rows {
        let (kind, entries, at) = row?;
        postings.push(crate::model::wallet::LedgerPosting {
            kind: serde_json::from_value(serde_json::Value::String(kind))?,
            entries: serde_json::from_str(&entries)?,
            at: DateTime::parse_from_rfc3339(&at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        });
    }
    Ok(postings)
}

// ── Idempotency / ingest ────────────────────────────────────────────

pub struct IdempotencyReceipt {
    pub request_hash: String,
    pub status_code: u16,
    pub body: serde_json::Value,
}

pub fn get_idempotency(
    conn: &Connection,
    key: &str,
) -> Result<Option<IdempotencyReceipt>, StoreError> {
    let row = conn
        .query_row(
            "SELECT request_hash, status_code, body FROM idempotency WHERE key = ?1",
            params![key],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u16>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;
    match row {
        Some((request_hash, status_code, body)) => Ok(Some(IdempotencyReceipt {
            request_hash,
            status_code,
            body: serde_json::from_str(&body)?,
        })),
        None => Ok(None),
    }
}

pub fn ingest_seen(
    conn: &Connection,
    tenant_id: &str,
    source: &str,
    external_event_id: &str,
) -> Result<bool, StoreError> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM ingest_records
         WHERE tenant_id = ?1 AND source = ?2 AND external_event_id = ?3",
        params![tenant_id, source, external_event_id],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

// ── Reservations / coverage ─────────────────────────────────────────

pub fn overlapping_reservation_exists(
    conn: &Connection,
    tenant_id: &str,
    robot_id: &str,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    exclude_job_id: &str,
) -> Result<bool, StoreError> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM robot_reservations
         WHERE tenant_id = ?1 AND robot_id = ?2 AND job_id != ?3
           AND window_start < ?5 AND ?4 < window_end",
        params![
            tenant_id,
            robot_id,
            exclude_job_id,
            window_start.to_rfc3339(),
            window_end.to_rfc3339()
        ],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

pub fn operator_active_coverage(
    conn: &Connection,
    tenant_id: &str,
    operator_id: &str,
) -> Result<u32, StoreError> {
    let active = [
        "RESERVED",
        "EN_ROUTE",
        "ACCESS_GRANTED",
        "EXECUTING",
        "ASSISTED",
        "STALLED",
    ];
    let jobs = list_jobs_by_status(conn, tenant_id, &active)?;
    Ok(jobs
        .iter()
        .filter(|j| j.coverage_operator.as_deref() == Some(operator_id))
        .count() as u32)
}

// ── Deliveries ──────────────────────────────────────────────────────

fn delivery_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, Delivery)> {
    let tenant_id: String = row.get(0)?;
    let state: String = row.get(12)?;
    let next_attempt_at: String = row.get(14)?;
    Ok((
        tenant_id,
        Delivery {
            id: row.get(1)?,
            destination_id: row.get(2)?,
            artifact_type: row.get(3)?,
            artifact_id: row.get(4)?,
            artifact_hash: row.get(5)?,
            dedupe_key: row.get(6)?,
            scope_key: row.get(7)?,
            order_seq: row.get(8)?,
            priority: row.get(9)?,
            order_key: row.get(10)?,
            attempts: row.get(11)?,
            state: DeliveryState::parse(&state).unwrap_or(DeliveryState::Pending),
            last_error: row.get(13)?,
            next_attempt_at: DateTime::parse_from_rfc3339(&next_attempt_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        },
    ))
}

const DELIVERY_COLS: &str = "tenant_id, id, destination_id, artifact_type, artifact_id, \
     artifact_hash, dedupe_key, scope_key, order_seq, priority, order_key, attempts, state, \
     last_error, next_attempt_at";

/// Pending deliveries that are due, in `(scope_key, order_seq, priority,
/// artifact_id)` order. Only the head of each scope's queue is claimable, so
/// a backoff on an earlier delivery holds back its scope (DLQ rows no longer
/// block).
pub fn due_deliveries(
    conn: &Connection,
    now: DateTime<Utc>,
    max: usize,
) -> Result<Vec<(String, Delivery)>, StoreError> {
    let sql = format!(
        "SELECT {DELIVERY_COLS} FROM deliveries AS d
         WHERE d.state = 'pending' AND d.next_attempt_at <= ?1
           AND NOT EXISTS (
             SELECT 1 FROM deliveries AS e
             WHERE e.scope_key = d.scope_key AND e.state = 'pending'
               AND (e.order_seq < d.order_seq
                    OR (e.order_seq = d.order_seq AND e.priority < d.priority)
                    OR (e.order_seq = d.order_seq AND e.priority = d.priority
                        AND e.artifact_id < d.artifact_id))
           )
         ORDER BY d.scope_key, d.order_seq, d.priority, d.artifact_id LIMIT ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![now.to_rfc3339(), max as i64], delivery_from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn get_delivery(
    conn: &Connection,
    tenant_id: &str,
    delivery_id: &str,
) -> Result<Option<Delivery>, StoreError> {
    let sql = format!(
        "SELECT {DELIVERY_COLS} FROM deliveries WHERE tenant_id = ?1 AND id = ?2"
    );
    let row = conn
        .query_row(&sql, params![tenant_id, delivery_id], delivery_from_row)
        .optional()?;
    Ok(row.map(|(_, d)| d))
}

pub fn update_delivery_state(
    conn: &Connection,
    tenant_id: &str,
    delivery_id: &str,
    state: DeliveryState,
    attempts: u32,
    next_attempt_at: DateTime<Utc>,
    last_error: Option<&str>,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE deliveries SET state = ?3, attempts = ?4, next_attempt_at = ?5, last_error = ?6
         WHERE tenant_id = ?1 AND id = ?2",
        params![
            tenant_id,
            delivery_id,
            state.as_str(),
            attempts,
            next_attempt_at.to_rfc3339(),
            last_error
        ],
    )?;
    Ok(())
}

pub fn put_delivery_receipt(
    conn: &Connection,
    tenant_id: &str,
    delivery_id: &str,
    receipt: &serde_json::Value,
    acked_at: DateTime<Utc>,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR REPLACE INTO delivery_receipts (tenant_id, delivery_id, receipt, acked_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            tenant_id,
            delivery_id,
            serde_json::to_string(receipt)?,
            acked_at.to_rfc3339()
        ],
    )?;
    Ok(())
}

pub fn get_destination(
    conn: &Connection,
    tenant_id: &str,
    destination_id: &str,
) -> Result<Option<Destination>, StoreError> {
    get_projection(
        conn,
        "SELECT body FROM destinations WHERE tenant_id = ?1 AND destination_id = ?2",
        &[&tenant_id, &destination_id],
    )
}

pub fn put_destination(
    conn: &Connection,
    tenant_id: &str,
    destination: &Destination,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR REPLACE INTO destinations (tenant_id, destination_id, body) VALUES (?1, ?2, ?3)",
        params![
            tenant_id,
            destination.destination_id,
            serde_json::to_string(destination)?
        ],
    )?;
    Ok(())
}

pub fn list_destinations(
    conn: &Connection,
    tenant_id: &str,
) -> Result<Vec<Destination>, StoreError> {
    let mut stmt = conn.prepare("SELECT body FROM destinations WHERE tenant_id = ?1")?;
    let rows = stmt.query_map(params![tenant_id], |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(serde_json::from_str(&row?)?);
    }
    Ok(out)
}

// ── Artifacts / ledger / auth ───────────────────────────────────────

pub fn get_artifact(
    conn: &Connection,
    tenant_id: &str,
    artifact_id: &str,
) -> Result<Option<crate::model::artifact::Artifact>, StoreError> {
    get_projection(
        conn,
        "SELECT body FROM artifacts WHERE tenant_id = ?1 AND artifact_id = ?2",
        &[&tenant_id, &artifact_id],
    )
}

pub fn ledger_balance(
    conn: &Connection,
    tenant_id: &str,
    account: &str,
) -> Result<i64, StoreError> {
    let balance: Option<i64> = conn
        .query_row(
            "SELECT balance_cents FROM ledger_balances WHERE tenant_id = ?1 AND account = ?2",
            params![tenant_id, account],
            |row| row.get(0),
        )
        .optional()?;
    Ok(balance.unwrap_or(0))
}

pub fn get_auth_scopes(
    conn: &Connection,
    token_hash: &str,
) -> Result<Option<(String, Vec<String>)>, StoreError> {
    let row = conn
        .query_row(
            "SELECT tenant_id, scopes FROM auth_keys WHERE token_hash = ?1",
            params![token_hash],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;
    Ok(row.map(|(tenant, scopes)| {
        (
            tenant,
            scopes.split(',').map(|s| s.trim().to_string()).collect(),
        )
    }))
}

pub fn put_auth_key(
    conn: &Connection,
    token_hash: &str,
    tenant_id: &str,
    scopes: &[&str],
    label: &str,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR REPLACE INTO auth_keys (token_hash, tenant_id, scopes, label, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![token_hash, tenant_id, scopes.join(","), label, now.to_rfc3339()],
    )?;
    Ok(())
}

// ── Maintenance single-flight ───────────────────────────────────────

/// Advisory-lock equivalent: at most one holder per flag name.
pub fn try_acquire_flag(conn: &Connection, name: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
    let n = conn.execute(
        "INSERT OR IGNORE INTO maintenance_flags (name, locked_at) VALUES (?1, ?2)",
        params![name, now.to_rfc3339()],
    )?;
    Ok(n == 1)
}

pub fn release_flag(conn: &Connection, name: &str) -> Result<(), StoreError> {
    conn.execute("DELETE FROM maintenance_flags WHERE name = ?1", params![name])?;
    Ok(())
}
