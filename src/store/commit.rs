//! The single write path. `commit_tx` applies an ordered op list inside one
//! transaction: stream appends with OCC on the head chain hash, projection
//! rebuilds, outbox enqueues (including the ones derived from job events),
//! idempotency receipts, and audit rows.

use chrono::Utc;
use rusqlite::{Connection, params};
use serde_json::{Value, json};
use thiserror::Error;

use crate::chain::Event;
use crate::delivery::Delivery;
use crate::model::artifact::Artifact;
use crate::model::event::EventBody;
use crate::model::governance::SignerKeyRecord;
use crate::model::settlement::{SettlementPolicy, SettlementRecord};
use crate::model::wallet::{AgentWallet, LedgerPosting};
use crate::model::{agent_run, governance, job, month, operator, robot};
use crate::store::{
    AuditEntry, ContractRecord, IngestRecord, MarketplaceTask, StoreError, TaskBid, load_stream,
    stream_head,
};

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("event append conflict on {stream_id}: expected head {expected:?}, current {current:?}")]
    PrevChainHashMismatch {
        stream_id: String,
        expected: Option<String>,
        current: Option<String>,
    },

    #[error("batch for {stream_id} is not chain-contiguous")]
    ChainDiscontinuity { stream_id: String },

    #[error("artifact {artifact_id} already exists with a different hash")]
    ArtifactHashConflict { artifact_id: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
}

impl CommitError {
    pub fn code(&self) -> &'static str {
        match self {
            CommitError::PrevChainHashMismatch { .. } => "PREV_CHAIN_HASH_MISMATCH",
            CommitError::ChainDiscontinuity { .. } => "CHAIN_DISCONTINUITY",
            CommitError::ArtifactHashConflict { .. } => "ARTIFACT_HASH_CONFLICT",
            CommitError::Store(_) | CommitError::Sqlite(_) | CommitError::Serde(_) => {
                "STORE_ERROR"
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Job,
    Robot,
    Operator,
    Month,
    AgentRun,
    Governance,
}

/// One unit of atomically committed work.
#[derive(Debug, Clone)]
pub enum Op {
    JobEventsAppend { job_id: String, events: Vec<Event> },
    RobotEventsAppend { robot_id: String, events: Vec<Event> },
    OperatorEventsAppend { operator_id: String, events: Vec<Event> },
    MonthEventsAppend { stream_id: String, events: Vec<Event> },
    AgentRunEventsAppend { run_id: String, events: Vec<Event> },
    GovernanceEventsAppend { events: Vec<Event> },
    OutboxEnqueue { topic: String, payload: Value },
    IngestRecordsPut { records: Vec<IngestRecord> },
    IdempotencyPut {
        key: String,
        request_hash: String,
        status_code: u16,
        body: Value,
    },
    ContractUpsert { contract: ContractRecord },
    AgentWalletUpsert { wallet: AgentWallet },
    AgentRunSettlementUpsert { settlement: SettlementRecord },
    MarketplaceTaskUpsert { task: MarketplaceTask },
    MarketplaceTaskBidsSet { task_id: String, bids: Vec<TaskBid> },
    TenantSettlementPolicyUpsert { policy: SettlementPolicy },
    PublicKeyPut { key_id: String, public_key: String },
    SignerKeyUpsert { record: SignerKeyRecord },
    LedgerPost { posting: LedgerPosting },
    ArtifactPut { artifact: Artifact },
    DeliveryEnqueue { delivery: Delivery },
    PartyStatementPut {
        month: String,
        party_id: String,
        body: Value,
    },
}

/// Apply the op list atomically. Derived outbox rows (dispatch, proof eval,
/// artifact enqueues) are appended inside the same transaction.
pub fn commit_tx(
    conn: &mut Connection,
    tenant_id: &str,
    ops: Vec<Op>,
    audit: Option<AuditEntry>,
) -> Result<(), CommitError> {
    let tx = conn.transaction()?;
    let mut derived: Vec<(String, Value)> = Vec::new();

    for op in ops {
        apply_op(&tx, tenant_id, op, &mut derived)?;
    }

    let now = Utc::now().to_rfc3339();
    for (topic, payload) in derived {
        tx.execute(
            "INSERT INTO outbox (tenant_id, topic, payload, enqueued_at) VALUES (?1, ?2, ?3, ?4)",
            params![tenant_id, topic, serde_json::to_string(&payload)?, now],
        )?;
    }

    if let Some(audit) = audit {
        tx.execute(
            "INSERT INTO ops_audit (tenant_id, actor, action, detail, at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![tenant_id, audit.actor, audit.action, audit.detail, now],
        )?;
    }

    tx.commit()?;
    Ok(())
}

fn apply_op(
    tx: &rusqlite::Transaction<'_>,
    tenant_id: &str,
    op: Op,
    derived: &mut Vec<(String, Value)>,
) -> Result<(), CommitError> {
    match op {
        Op::JobEventsAppend { job_id, events } => {
            let stream_id = format!("job:{job_id}");
            append_stream(tx, tenant_id, &stream_id, StreamKind::Job, &events)?;
            for event in &events {
                derive_job_triggers(&job_id, event, derived);
            }
            Ok(())
        }
        Op::RobotEventsAppend { robot_id, events } => {
            let stream_id = format!("robot:{robot_id}");
            append_stream(tx, tenant_id, &stream_id, StreamKind::Robot, &events)
        }
        Op::OperatorEventsAppend { operator_id, events } => {
            let stream_id = format!("operator:{operator_id}");
            append_stream(tx, tenant_id, &stream_id, StreamKind::Operator, &events)
        }
        Op::MonthEventsAppend { stream_id, events } => {
            append_stream(tx, tenant_id, &stream_id, StreamKind::Month, &events)
        }
        Op::AgentRunEventsAppend { run_id, events } => {
            let stream_id = format!("run:{run_id}");
            append_stream(tx, tenant_id, &stream_id, StreamKind::AgentRun, &events)
        }
        Op::GovernanceEventsAppend { events } => append_stream(
            tx,
            tenant_id,
            governance::GOVERNANCE_STREAM,
            StreamKind::Governance,
            &events,
        ),

        Op::OutboxEnqueue { topic, payload } => {
            derived.push((topic, payload));
            Ok(())
        }

        Op::IngestRecordsPut { records } => {
            for r in records {
                tx.execute(
                    "INSERT OR IGNORE INTO ingest_records
                     (tenant_id, source, external_event_id, job_id, received_at, expires_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        tenant_id,
                        r.source,
                        r.external_event_id,
                        r.job_id,
                        r.received_at.to_rfc3339(),
                        r.expires_at.to_rfc3339()
                    ],
                )?;
            }
            Ok(())
        }

        Op::IdempotencyPut {
            key,
            request_hash,
            status_code,
            body,
        } => {
            tx.execute(
                "INSERT OR REPLACE INTO idempotency (key, request_hash, status_code, body, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    key,
                    request_hash,
                    status_code,
                    serde_json::to_string(&body)?,
                    Utc::now().to_rfc3339()
                ],
            )?;
            Ok(())
        }

        Op::ContractUpsert { contract } => {
            tx.execute(
                "INSERT OR REPLACE INTO contracts
                 (tenant_id, contract_id, status, contract_hash, policy_hash, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    tenant_id,
                    contract.contract_id,
                    serde_json::to_value(contract.status)?.as_str().unwrap_or("draft"),
                    contract.contract_hash,
                    contract.policy_hash,
                    serde_json::to_string(&contract)?
                ],
            )?;
            Ok(())
        }

        Op::AgentWalletUpsert { wallet } => {
            tx.execute(
                "INSERT OR REPLACE INTO agent_wallets (tenant_id, agent_id, revision, body)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    tenant_id,
                    wallet.agent_id,
                    wallet.revision as i64,
                    serde_json::to_string(&wallet)?
                ],
            )?;
            Ok(())
        }

        Op::AgentRunSettlementUpsert { settlement } => {
            tx.execute(
                "INSERT OR REPLACE INTO agent_run_settlements (tenant_id, run_id, revision, body)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    tenant_id,
                    settlement.run_id,
                    settlement.revision as i64,
                    serde_json::to_string(&settlement)?
                ],
            )?;
            Ok(())
        }

        Op::MarketplaceTaskUpsert { task } => {
            tx.execute(
                "INSERT OR REPLACE INTO marketplace_tasks (tenant_id, task_id, status, body)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    tenant_id,
                    task.task_id,
                    serde_json::to_value(task.status)?.as_str().unwrap_or("open"),
                    serde_json::to_string(&task)?
                ],
            )?;
            Ok(())
        }

        Op::MarketplaceTaskBidsSet { task_id, bids } => {
            tx.execute(
                "INSERT OR REPLACE INTO marketplace_task_bids (tenant_id, task_id, bids)
                 VALUES (?1, ?2, ?3)",
                params![tenant_id, task_id, serde_json::to_string(&bids)?],
            )?;
            Ok(())
        }

        Op::TenantSettlementPolicyUpsert { policy } => {
            tx.execute(
                "INSERT OR REPLACE INTO tenant_settlement_policies (tenant_id, policy_id, body)
                 VALUES (?1, ?2, ?3)",
                params![tenant_id, policy.policy_id, serde_json::to_string(&policy)?],
            )?;
            Ok(())
        }

        Op::PublicKeyPut { key_id, public_key } => {
            tx.execute(
                "INSERT OR REPLACE INTO public_keys (tenant_id, key_id, public_key)
                 VALUES (?1, ?2, ?3)",
                params![tenant_id, key_id, public_key],
            )?;
            Ok(())
        }

        Op::SignerKeyUpsert { record } => {
            tx.execute(
                "INSERT OR REPLACE INTO signer_keys (tenant_id, key_id, body) VALUES (?1, ?2, ?3)",
                params![tenant_id, record.key_id, serde_json::to_string(&record)?],
            )?;
            Ok(())
        }

        Op::LedgerPost { posting } => {
            tx.execute(
                "INSERT INTO ledger_postings (tenant_id, kind, entries, at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    tenant_id,
                    serde_json::to_value(posting.kind)?.as_str().unwrap_or(""),
                    serde_json::to_string(&posting.entries)?,
                    posting.at.to_rfc3339()
                ],
            )?;
            for entry in &posting.entries {
                tx.execute(
                    "INSERT INTO ledger_balances (tenant_id, account, balance_cents)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT (tenant_id, account)
                     DO UPDATE SET balance_cents = balance_cents + ?3",
                    params![tenant_id, entry.account, entry.delta_cents],
                )?;
            }
            Ok(())
        }

        Op::ArtifactPut { artifact } => {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT artifact_hash FROM artifacts WHERE tenant_id = ?1 AND artifact_id = ?2",
                    params![tenant_id, artifact.artifact_id],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    e => Err(e),
                })?;
            if let Some(hash) = existing {
                if hash != artifact.artifact_hash {
                    return Err(CommitError::ArtifactHashConflict {
                        artifact_id: artifact.artifact_id,
                    });
                }
                return Ok(());
            }
            tx.execute(
                "INSERT INTO artifacts (tenant_id, artifact_id, artifact_type, artifact_hash, body, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    tenant_id,
                    artifact.artifact_id,
                    artifact.artifact_type,
                    artifact.artifact_hash,
                    serde_json::to_string(&artifact)?,
                    Utc::now().to_rfc3339()
                ],
            )?;
            Ok(())
        }

        Op::DeliveryEnqueue { delivery } => {
            // Dedupe key is UNIQUE: re-deriving the same artifact for the
            // same destination is a no-op.
            tx.execute(
                "INSERT OR IGNORE INTO deliveries
                 (tenant_id, id, destination_id, artifact_type, artifact_id, artifact_hash,
                  dedupe_key, scope_key, order_seq, priority, order_key, state, attempts,
                  next_attempt_at, last_error, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    tenant_id,
                    delivery.id,
                    delivery.destination_id,
                    delivery.artifact_type,
                    delivery.artifact_id,
                    delivery.artifact_hash,
                    delivery.dedupe_key,
                    delivery.scope_key,
                    delivery.order_seq,
                    delivery.priority,
                    delivery.order_key,
                    delivery.state.as_str(),
                    delivery.attempts,
                    delivery.next_attempt_at.to_rfc3339(),
                    delivery.last_error,
                    Utc::now().to_rfc3339()
                ],
            )?;
            Ok(())
        }

        Op::PartyStatementPut { month, party_id, body } => {
            tx.execute(
                "INSERT OR REPLACE INTO party_statements (tenant_id, month, party_id, body)
                 VALUES (?1, ?2, ?3, ?4)",
                params![tenant_id, month, party_id, serde_json::to_string(&body)?],
            )?;
            Ok(())
        }
    }
}

/// OCC append: the first event must link to the current head and the batch
/// must be internally contiguous. Rebuilds the projection row afterwards.
fn append_stream(
    tx: &rusqlite::Transaction<'_>,
    tenant_id: &str,
    stream_id: &str,
    kind: StreamKind,
    events: &[Event],
) -> Result<(), CommitError> {
    if events.is_empty() {
        return Ok(());
    }

    let head = stream_head(tx, tenant_id, stream_id)?;
    if events[0].prev_chain_hash != head {
        return Err(CommitError::PrevChainHashMismatch {
            stream_id: stream_id.to_string(),
            expected: events[0].prev_chain_hash.clone(),
            current: head,
        });
    }
    for pair in events.windows(2) {
        if pair[1].prev_chain_hash.as_deref() != Some(pair[0].chain_hash.as_str()) {
            return Err(CommitError::ChainDiscontinuity {
                stream_id: stream_id.to_string(),
            });
        }
    }

    let next_seq: i64 = tx.query_row(
        "SELECT COUNT(*) FROM events WHERE tenant_id = ?1 AND stream_id = ?2",
        params![tenant_id, stream_id],
        |row| row.get(0),
    )?;

    for (i, event) in events.iter().enumerate() {
        tx.execute(
            "INSERT INTO events
             (tenant_id, stream_id, seq, event_id, event_type, chain_hash, prev_chain_hash, at, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                tenant_id,
                stream_id,
                next_seq + i as i64,
                event.id,
                event.type_str(),
                event.chain_hash,
                event.prev_chain_hash,
                event.at_str(),
                serde_json::to_string(event)?
            ],
        )?;
    }

    rebuild_projection(tx, tenant_id, stream_id, kind)
}

fn rebuild_projection(
    tx: &rusqlite::Transaction<'_>,
    tenant_id: &str,
    stream_id: &str,
    kind: StreamKind,
) -> Result<(), CommitError> {
    let events = load_stream(tx, tenant_id, stream_id)?;
    let now = Utc::now().to_rfc3339();

    match kind {
        StreamKind::Job => {
            let job = job::reduce(&events).map_err(StoreError::from)?;
            tx.execute(
                "INSERT OR REPLACE INTO jobs (tenant_id, job_id, status, body, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    tenant_id,
                    job.job_id,
                    job.status.as_str(),
                    serde_json::to_string(&job)?,
                    now
                ],
            )?;

            // Keep the reservation projection in step for overlap checks.
            tx.execute(
                "DELETE FROM robot_reservations WHERE tenant_id = ?1 AND job_id = ?2",
                params![tenant_id, job.job_id],
            )?;
            let reservation_live = matches!(
                job.status,
                crate::model::job::JobStatus::Reserved
                    | crate::model::job::JobStatus::EnRoute
                    | crate::model::job::JobStatus::AccessGranted
                    | crate::model::job::JobStatus::Executing
                    | crate::model::job::JobStatus::Assisted
                    | crate::model::job::JobStatus::Stalled
            );
            if reservation_live {
                if let Some(res) = &job.reservation {
                    tx.execute(
                        "INSERT OR REPLACE INTO robot_reservations
                         (tenant_id, robot_id, job_id, window_start, window_end)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            tenant_id,
                            res.robot_id,
                            job.job_id,
                            res.window.start.to_rfc3339(),
                            res.window.end.to_rfc3339()
                        ],
                    )?;
                }
            }
        }
        StreamKind::Robot => {
            let robot = robot::reduce(&events).map_err(StoreError::from)?;
            tx.execute(
                "INSERT OR REPLACE INTO robots (tenant_id, robot_id, status, body, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    tenant_id,
                    robot.robot_id,
                    serde_json::to_value(robot.status)?.as_str().unwrap_or(""),
                    serde_json::to_string(&robot)?,
                    now
                ],
            )?;
        }
        StreamKind::Operator => {
            let op = operator::reduce(&events).map_err(StoreError::from)?;
            tx.execute(
                "INSERT OR REPLACE INTO operators (tenant_id, operator_id, status, body, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    tenant_id,
                    op.operator_id,
                    serde_json::to_value(op.status)?.as_str().unwrap_or(""),
                    serde_json::to_string(&op)?,
                    now
                ],
            )?;
        }
        StreamKind::Month => {
            let mc = month::reduce(&events).map_err(StoreError::from)?;
            tx.execute(
                "INSERT OR REPLACE INTO months (tenant_id, month, basis, status, body)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    tenant_id,
                    mc.month,
                    mc.basis,
                    serde_json::to_value(mc.status)?.as_str().unwrap_or(""),
                    serde_json::to_string(&mc)?
                ],
            )?;
        }
        StreamKind::AgentRun => {
            let run = agent_run::reduce(&events).map_err(StoreError::from)?;
            tx.execute(
                "INSERT OR REPLACE INTO agent_runs (tenant_id, run_id, status, body, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    tenant_id,
                    run.run_id,
                    run.status.as_str(),
                    serde_json::to_string(&run)?,
                    now
                ],
            )?;
        }
        StreamKind::Governance => {
            let gov = governance::reduce(&events).map_err(StoreError::from)?;
            for record in gov.signer_keys.values() {
                tx.execute(
                    "INSERT OR REPLACE INTO signer_keys (tenant_id, key_id, body) VALUES (?1, ?2, ?3)",
                    params![tenant_id, record.key_id, serde_json::to_string(record)?],
                )?;
            }
        }
    }
    Ok(())
}

/// Side effects implied by committed job events, enqueued atomically.
fn derive_job_triggers(job_id: &str, event: &Event, derived: &mut Vec<(String, Value)>) {
    match &event.body {
        EventBody::JobBooked(_) => {
            derived.push((
                "DISPATCH_REQUESTED".to_string(),
                json!({ "job_id": job_id }),
            ));
        }
        EventBody::JobExecutionCompleted { .. } => {
            derived.push((
                "PROOF_EVAL_ENQUEUE".to_string(),
                json!({ "job_id": job_id, "anchor_chain_hash": event.chain_hash }),
            ));
            derived.push((
                "ARTIFACT_ENQUEUE".to_string(),
                json!({
                    "job_id": job_id,
                    "schema": crate::model::artifact::WORK_CERTIFICATE_V1,
                    "source_event_id": event.id,
                }),
            ));
        }
        EventBody::ProofEvaluated(_) => {
            derived.push((
                "ARTIFACT_ENQUEUE".to_string(),
                json!({
                    "job_id": job_id,
                    "schema": crate::model::artifact::PROOF_RECEIPT_V1,
                    "source_event_id": event.id,
                }),
            ));
        }
        EventBody::JobSettled { .. } => {
            derived.push(("JOB_SETTLED".to_string(), json!({ "job_id": job_id })));
            derived.push((
                "ARTIFACT_ENQUEUE".to_string(),
                json!({
                    "job_id": job_id,
                    "schema": crate::model::artifact::SETTLEMENT_STATEMENT_V1,
                    "source_event_id": event.id,
                }),
            ));
        }
        EventBody::DispatchFailed { reason, .. } => {
            derived.push((
                "NOTIFY_OPS_DISPATCH_FAILED".to_string(),
                json!({ "job_id": job_id, "reason": reason }),
            ));
        }
        _ => {}
    }
}
