//! Month close: hold-policy gate, monthly statement with held-exposure
//! rollforward, party statements and payout instructions, GLBatch.v1,
//! JournalCsv.v1, and the FinancePackBundle.v1 zip.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde_json::json;
use tracing::{info, warn};

use crate::finance::{
    self, AccountMap, AccountMapGate, HeldExposureRollforward, MonthlyStatement, PartyStatement,
    PayoutInstruction,
};
use crate::model::event::{Actor, EventBody, HoldPolicy};
use crate::model::month;
use crate::store::commit::{Op, commit_tx};
use crate::store::{self, outbox};
use crate::workers::{WorkerCtx, chain_events};

/// `"2025-01"` → [month start, next month start).
pub fn month_bounds(month: &str) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let (y, m) = month.split_once('-')?;
    let year: i32 = y.parse().ok()?;
    let mon: u32 = m.parse().ok()?;
    let start = Utc.with_ymd_and_hms(year, mon, 1, 0, 0, 0).single()?;
    let (ny, nm) = if mon == 12 { (year + 1, 1) } else { (year, mon + 1) };
    let end = Utc.with_ymd_and_hms(ny, nm, 1, 0, 0, 0).single()?;
    Some((start, end))
}

pub fn month_of(at: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", at.year(), at.month())
}

fn load_account_map(ctx: &WorkerCtx, tenant_id: &str) -> Option<AccountMap> {
    let path = ctx
        .config
        .data_dir
        .join("account_maps")
        .join(format!("{tenant_id}.json"));
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

pub async fn tick(ctx: &WorkerCtx, max_messages: usize) -> Result<usize> {
    let now = Utc::now();
    let mut conn = ctx.store.db.lock().await;
    let claimed = outbox::claim(&conn, "MONTH_CLOSE_REQUESTED", max_messages, "month-close", now)?;

    let mut handled = 0;
    for msg in claimed {
        let tenant_id = msg.tenant_id.clone();
        let month_str = msg.payload["month"].as_str().unwrap_or_default().to_string();
        let basis = msg.payload["basis"].as_str().unwrap_or("accrual").to_string();

        let Some((start, end)) = month_bounds(&month_str) else {
            outbox::mark_processed_with_error(&conn, &[msg.id], now, Some("bad_month"))?;
            continue;
        };

        if store::month_is_closed(&conn, &tenant_id, &month_str, &basis)? {
            outbox::mark_processed(&conn, &[msg.id], now)?;
            continue;
        }

        // Hold policy gate, effective-dated against the period end.
        let governance = store::get_governance(&conn, &tenant_id)?;
        let policy = governance.policy_at(end);
        let open_holds = collect_open_holds(&conn, &tenant_id)?;
        let blocking: Vec<&OpenHold> = match policy.month_close_hold_policy {
            HoldPolicy::BlockAnyOpenHolds => open_holds.iter().collect(),
            HoldPolicy::BlockHoldsOriginatedInPeriod => open_holds
                .iter()
                .filter(|h| h.held_at >= start && h.held_at < end)
                .collect(),
            HoldPolicy::AllowWithDisclosure => Vec::new(),
        };
        if !blocking.is_empty() {
            ctx.metrics
                .month_close_blocked_total
                .with_label_values(&["open_holds"])
                .inc();
            warn!(month = %month_str, holds = blocking.len(), "month close blocked by open holds");
            outbox::mark_processed_with_error(&conn, &[msg.id], now, Some("open_holds"))?;
            handled += 1;
            continue;
        }
        let disclosure = if policy.month_close_hold_policy == HoldPolicy::AllowWithDisclosure
            && !open_holds.is_empty()
        {
            Some(format!("{} open holds disclosed at close", open_holds.len()))
        } else {
            None
        };

        // Account map gate.
        let account_map = match load_account_map(ctx, &tenant_id) {
            Some(map) => map,
            None if ctx.config.account_map_gate == AccountMapGate::Strict => {
                ctx.metrics
                    .month_close_blocked_total
                    .with_label_values(&["missing_account_map"])
                    .inc();
                outbox::mark_processed_with_error(
                    &conn,
                    &[msg.id],
                    now,
                    Some("missing_account_map"),
                )?;
                handled += 1;
                continue;
            }
            None => AccountMap::default(),
        };

        match close_month(
            &mut conn,
            ctx,
            &tenant_id,
            &month_str,
            &basis,
            start,
            end,
            &account_map,
            disclosure,
            now,
        ) {
            Ok(()) => {
                outbox::mark_processed(&conn, &[msg.id], now)?;
                handled += 1;
            }
            Err(e) => {
                outbox::mark_failed(&conn, msg.id, &format!("{e:#}"), now)?;
            }
        }
    }
    Ok(handled)
}

struct OpenHold {
    held_at: DateTime<Utc>,
    amount_cents: i64,
}

fn collect_open_holds(
    conn: &rusqlite::Connection,
    tenant_id: &str,
) -> Result<Vec<OpenHold>> {
    let mut open = Vec::new();
    for job in store::list_jobs_by_status(conn, tenant_id, &["COMPLETED"])? {
        if let Some(hold) = job.active_hold() {
            open.push(OpenHold {
                held_at: hold.held_at,
                amount_cents: hold.amount_cents,
            });
        }
    }
    Ok(open)
}

fn sum_held(events: &[crate::chain::Event]) -> i64 {
    events
        .iter()
        .filter_map(|e| match &e.body {
            EventBody::SettlementHeld(h) => Some(h.amount_cents),
            _ => None,
        })
        .sum()
}

#[allow(clippy::too_many_arguments)]
fn close_month(
    conn: &mut rusqlite::Connection,
    ctx: &WorkerCtx,
    tenant_id: &str,
    month_str: &str,
    basis: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    account_map: &AccountMap,
    disclosure: Option<String>,
    now: DateTime<Utc>,
) -> Result<()> {
    // Rollforward from the event log; `at` comparisons are period-bounded.
    let epoch = Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap();
    let held_before = sum_held(&store::events_by_type_in_period(
        conn, tenant_id, "SETTLEMENT_HELD", epoch, start,
    )?);
    let newly_held = sum_held(&store::events_by_type_in_period(
        conn, tenant_id, "SETTLEMENT_HELD", start, end,
    )?);

    let settled_events =
        store::events_by_type_in_period(conn, tenant_id, "JOB_SETTLED", start, end)?;
    let mut settled_cents = 0i64;
    let mut released_held = 0i64;
    let mut by_payee: BTreeMap<String, i64> = BTreeMap::new();
    for e in &settled_events {
        if let EventBody::JobSettled {
            amount_cents,
            payee_agent_id,
            hold_id,
            ..
        } = &e.body
        {
            settled_cents += amount_cents;
            *by_payee.entry(payee_agent_id.clone()).or_insert(0) += amount_cents;
            if hold_id.is_some() {
                released_held += amount_cents;
            }
        }
    }

    let forfeit_events =
        store::events_by_type_in_period(conn, tenant_id, "SETTLEMENT_FORFEITED", start, end)?;
    let mut forfeited_cents = 0i64;
    let all_holds = store::events_by_type_in_period(
        conn, tenant_id, "SETTLEMENT_HELD", epoch, end,
    )?;
    for e in &forfeit_events {
        if let EventBody::SettlementForfeited { hold_id, .. } = &e.body {
            forfeited_cents += all_holds
                .iter()
                .find_map(|h| match &h.body {
                    EventBody::SettlementHeld(hold) if &hold.hold_id == hold_id => {
                        Some(hold.amount_cents)
                    }
                    _ => None,
                })
                .unwrap_or(0);
        }
    }

    let released_before = {
        let earlier =
            store::events_by_type_in_period(conn, tenant_id, "JOB_SETTLED", epoch, start)?;
        earlier
            .iter()
            .filter_map(|e| match &e.body {
                EventBody::JobSettled {
                    amount_cents,
                    hold_id: Some(_),
                    ..
                } => Some(*amount_cents),
                _ => None,
            })
            .sum::<i64>()
    };
    let opening = (held_before - released_before).max(0);
    let rollforward = HeldExposureRollforward {
        opening_cents: opening,
        newly_held_cents: newly_held,
        released_cents: released_held,
        forfeited_cents,
        closing_cents: opening + newly_held - released_held - forfeited_cents,
    };

    let credit_events =
        store::events_by_type_in_period(conn, tenant_id, "SLA_CREDIT_ISSUED", start, end)?;
    let sla_credit_cents: i64 = credit_events
        .iter()
        .filter_map(|e| match &e.body {
            EventBody::SlaCreditIssued { credit_cents, .. } => Some(*credit_cents),
            _ => None,
        })
        .sum();
    let cost_events =
        store::events_by_type_in_period(conn, tenant_id, "OPERATOR_COST_RECORDED", start, end)?;
    let operator_cost_cents: i64 = cost_events
        .iter()
        .filter_map(|e| match &e.body {
            EventBody::OperatorCostRecorded { cost_cents, .. } => Some(*cost_cents),
            _ => None,
        })
        .sum();

    let statement = MonthlyStatement {
        schema_version: "MonthlyStatement.v1".to_string(),
        month: month_str.to_string(),
        basis: basis.to_string(),
        settled_jobs: settled_events.len() as u64,
        settled_cents,
        sla_credit_cents,
        operator_cost_cents,
        held_exposure: rollforward,
        disclosure: disclosure.clone(),
    };

    let mut party_statements = Vec::new();
    let mut payouts = Vec::new();
    for (party_id, released) in &by_payee {
        party_statements.push(PartyStatement {
            party_id: party_id.clone(),
            month: month_str.to_string(),
            released_cents: *released,
            refunded_cents: 0,
            sla_credit_cents: 0,
        });
        payouts.push(PayoutInstruction {
            party_id: party_id.clone(),
            amount_cents: *released,
            currency: "USD".to_string(),
        });
    }

    let postings = store::ledger_postings_in_period(conn, tenant_id, start, end)?;
    let gl_batch = finance::build_gl_batch(
        month_str,
        basis,
        &postings,
        account_map,
        ctx.config.account_map_gate,
    )?;
    let journal = finance::journal_csv(&postings)?;
    let month_proof = json!({
        "schema_version": "MonthProof.v1",
        "month": month_str,
        "basis": basis,
        "settled_events": settled_events.iter().map(|e| e.chain_hash.clone()).collect::<Vec<_>>(),
    });
    let pack = finance::build_finance_pack(
        &statement,
        &party_statements,
        &payouts,
        &gl_batch,
        &journal,
        &month_proof,
    )?;

    let out_dir = ctx.config.data_dir.join("finance").join(tenant_id);
    std::fs::create_dir_all(&out_dir).context("creating finance dir")?;
    let bundle_path = out_dir.join(format!("{month_str}-{basis}.zip"));
    std::fs::write(&bundle_path, &pack.bundle).context("writing finance pack")?;

    let stream_id = month::stream_id(month_str, basis);
    let head = store::stream_head(conn, tenant_id, &stream_id)?;
    let events = chain_events(
        &stream_id,
        head,
        vec![(
            EventBody::MonthClosed {
                month: month_str.to_string(),
                basis: basis.to_string(),
                statement_hash: pack.statement_hash.clone(),
                finance_pack_hash: pack.bundle_hash.clone(),
                disclosure,
            },
            Actor::Finance("month-close".to_string()),
        )],
        now,
        &ctx.signer,
    )?;

    let mut ops = vec![Op::MonthEventsAppend {
        stream_id: stream_id.clone(),
        events,
    }];
    for ps in &party_statements {
        ops.push(Op::PartyStatementPut {
            month: month_str.to_string(),
            party_id: ps.party_id.clone(),
            body: serde_json::to_value(ps)?,
        });
    }
    commit_tx(conn, tenant_id, ops, None)?;
    info!(month = %month_str, %basis, settled = statement.settled_jobs, "month closed");
    Ok(())
}
