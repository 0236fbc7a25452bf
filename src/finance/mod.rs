//! Month-close finance outputs: GLBatch.v1, JournalCsv.v1, party statements,
//! payout instructions, and the deterministic FinancePackBundle.v1 zip.

pub mod zip;

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::canonical::{CanonicalError, canonical_json};
use crate::chain::sha256_hex;
use crate::model::wallet::LedgerPosting;

#[derive(Debug, Error)]
pub enum FinanceError {
    #[error("no GL mapping for account {account}")]
    MissingAccountMapping { account: String },

    #[error("journal csv: {0}")]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Canonical(#[from] CanonicalError),

    #[error("csv utf8: {0}")]
    CsvUtf8(#[from] std::string::FromUtf8Error),
}

impl FinanceError {
    pub fn code(&self) -> &'static str {
        match self {
            FinanceError::MissingAccountMapping { .. } => "FINANCE_EXPORT_BLOCKED",
            _ => "FINANCE_EXPORT_FAILED",
        }
    }
}

/// Internal account → GL code. Loaded from a tenant-provided JSON document;
/// the file format itself is the caller's concern.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountMap {
    pub accounts: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountMapGate {
    Strict,
    Warn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlEntry {
    pub gl_account: String,
    pub debit_cents: i64,
    pub credit_cents: i64,
    pub memo: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlBatch {
    pub schema_version: String,
    pub batch_id: String,
    pub month: String,
    pub basis: String,
    pub entries: Vec<GlEntry>,
}

/// Fold the month's postings into a GL batch. Unmapped accounts fail the
/// export in strict mode and are skipped with a marker entry in warn mode.
pub fn build_gl_batch(
    month: &str,
    basis: &str,
    postings: &[LedgerPosting],
    map: &AccountMap,
    gate: AccountMapGate,
) -> Result<GlBatch, FinanceError> {
    let mut totals: BTreeMap<String, i64> = BTreeMap::new();
    for posting in postings {
        for entry in &posting.entries {
            *totals.entry(entry.account.clone()).or_insert(0) += entry.delta_cents;
        }
    }

    let mut entries = Vec::new();
    for (account, delta) in totals {
        let gl_account = match map.accounts.get(&account) {
            Some(code) => code.clone(),
            None if gate == AccountMapGate::Strict => {
                return Err(FinanceError::MissingAccountMapping { account });
            }
            None => format!("UNMAPPED:{account}"),
        };
        let (debit, credit) = if delta >= 0 { (delta, 0) } else { (0, -delta) };
        entries.push(GlEntry {
            gl_account,
            debit_cents: debit,
            credit_cents: credit,
            memo: account,
        });
    }

    Ok(GlBatch {
        schema_version: "GLBatch.v1".to_string(),
        batch_id: format!("glb_{month}_{basis}"),
        month: month.to_string(),
        basis: basis.to_string(),
        entries,
    })
}

/// JournalCsv.v1: one row per posting entry, in posting order.
pub fn journal_csv(postings: &[LedgerPosting]) -> Result<String, FinanceError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(["at", "kind", "account", "delta_cents"])?;
    for posting in postings {
        let kind = serde_json::to_value(posting.kind)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        for entry in &posting.entries {
            writer.write_record([
                posting.at.to_rfc3339(),
                kind.clone(),
                entry.account.clone(),
                entry.delta_cents.to_string(),
            ])?;
        }
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| FinanceError::Csv(csv::Error::from(e.into_error())))?;
    Ok(String::from_utf8(bytes)?)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartyStatement {
    pub party_id: String,
    pub month: String,
    pub released_cents: i64,
    pub refunded_cents: i64,
    pub sla_credit_cents: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutInstruction {
    pub party_id: String,
    pub amount_cents: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeldExposureRollforward {
    pub opening_cents: i64,
    pub newly_held_cents: i64,
    pub released_cents: i64,
    pub forfeited_cents: i64,
    pub closing_cents: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonthlyStatement {
    pub schema_version: String,
    pub month: String,
    pub basis: String,
    pub settled_jobs: u64,
    pub settled_cents: i64,
    pub sla_credit_cents: i64,
    pub operator_cost_cents: i64,
    pub held_exposure: HeldExposureRollforward,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disclosure: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FinancePack {
    pub bundle: Vec<u8>,
    pub bundle_hash: String,
    pub statement_hash: String,
}

/// Assemble the deterministic bundle. The bundle hash is over the zip bytes;
/// the statement hash is over the canonical statement JSON.
pub fn build_finance_pack(
    statement: &MonthlyStatement,
    party_statements: &[PartyStatement],
    payouts: &[PayoutInstruction],
    gl_batch: &GlBatch,
    journal: &str,
    month_proof: &serde_json::Value,
) -> Result<FinancePack, FinanceError> {
    let statement_json = canonical_json(statement)?;
    let entries = vec![
        ("statement.json".to_string(), statement_json.clone().into_bytes()),
        (
            "party_statements.json".to_string(),
            canonical_json(&party_statements)?.into_bytes(),
        ),
        (
            "payout_instructions.json".to_string(),
            canonical_json(&payouts)?.into_bytes(),
        ),
        (
            "gl_batch.json".to_string(),
            canonical_json(gl_batch)?.into_bytes(),
        ),
        ("journal.csv".to_string(), journal.as_bytes().to_vec()),
        (
            "month_proof.json".to_string(),
            canonical_json(month_proof)?.into_bytes(),
        ),
    ];
    let bundle = zip::deterministic_zip(&entries);
    Ok(FinancePack {
        bundle_hash: sha256_hex(&bundle),
        statement_hash: sha256_hex(statement_json.as_bytes()),
        bundle,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::wallet::{LedgerEntry, LedgerOpKind};
    use chrono::{TimeZone, Utc};

    fn posting(account: &str, delta: i64) -> LedgerPosting {
        LedgerPosting {
            kind: LedgerOpKind::Release,
            entries: vec![
                LedgerEntry {
                    account: account.to_string(),
                    delta_cents: delta,
                },
                LedgerEntry {
                    account: "external:funding".to_string(),
                    delta_cents: -delta,
                },
            ],
            at: Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn strict_gate_blocks_unmapped_accounts() {
        let err = build_gl_batch(
            "2025-01",
            "accrual",
            &[posting("wallet_available:a1", 100)],
            &AccountMap::default(),
            AccountMapGate::Strict,
        )
        .unwrap_err();
        assert_eq!(err.code(), "FINANCE_EXPORT_BLOCKED");
    }

    #[test]
    fn warn_gate_marks_unmapped_accounts() {
        let batch = build_gl_batch(
            "2025-01",
            "accrual",
            &[posting("wallet_available:a1", 100)],
            &AccountMap::default(),
            AccountMapGate::Warn,
        )
        .unwrap();
        assert!(batch.entries.iter().any(|e| e.gl_account.starts_with("UNMAPPED:")));
    }

    #[test]
    fn finance_pack_is_deterministic() {
        let statement = MonthlyStatement {
            schema_version: "MonthlyStatement.v1".into(),
            month: "2025-01".into(),
            basis: "accrual".into(),
            settled_jobs: 2,
            settled_cents: 100_000,
            sla_credit_cents: 0,
            operator_cost_cents: 1_500,
            held_exposure: HeldExposureRollforward::default(),
            disclosure: None,
        };
        let batch = build_gl_batch(
            "2025-01",
            "accrual",
            &[],
            &AccountMap::default(),
            AccountMapGate::Warn,
        )
        .unwrap();
        let a = build_finance_pack(&statement, &[], &[], &batch, "at,kind\n", &serde_json::json!({}))
            .unwrap();
        let b = build_finance_pack(&statement, &[], &[], &batch, "at,kind\n", &serde_json::json!({}))
            .unwrap();
        assert_eq!(a.bundle_hash, b.bundle_hash);
    }
}
