//! Agent wallets and the double-entry escrow ledger projection.
//!
//! Wallet operations are pure transformations over snapshots. Every
//! transition posts to the projected ledger and the caller asserts parity
//! between the projection and the wallet snapshot after each op.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("amount must be positive, got {amount}")]
    NonPositiveAmount { amount: i64 },

    #[error("insufficient available funds: need {needed}, have {available}")]
    InsufficientAvailable { needed: i64, available: i64 },

    #[error("insufficient escrow: need {needed}, locked {locked}")]
    InsufficientEscrow { needed: i64, locked: i64 },

    #[error("currency mismatch: {payer} vs {payee}")]
    CurrencyMismatch { payer: String, payee: String },

    #[error(
        "ledger parity broken for {agent_id}: available {snapshot_available}/{ledger_available}, escrow {snapshot_escrow}/{ledger_escrow}"
    )]
    LedgerMismatch {
        agent_id: String,
        snapshot_available: i64,
        ledger_available: i64,
        snapshot_escrow: i64,
        ledger_escrow: i64,
    },
}

impl WalletError {
    pub fn code(&self) -> &'static str {
        match self {
            WalletError::NonPositiveAmount { .. } => "WALLET_AMOUNT_INVALID",
            WalletError::InsufficientAvailable { .. } => "WALLET_INSUFFICIENT_AVAILABLE",
            WalletError::InsufficientEscrow { .. } => "WALLET_INSUFFICIENT_ESCROW",
            WalletError::CurrencyMismatch { .. } => "WALLET_CURRENCY_MISMATCH",
            WalletError::LedgerMismatch { .. } => "ESCROW_LEDGER_MISMATCH",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentWallet {
    pub agent_id: String,
    pub currency: String,
    pub available_cents: i64,
    pub escrow_locked_cents: i64,
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
}

impl AgentWallet {
    pub fn new(agent_id: &str, currency: &str, at: DateTime<Utc>) -> Self {
        AgentWallet {
            agent_id: agent_id.to_string(),
            currency: currency.to_string(),
            available_cents: 0,
            escrow_locked_cents: 0,
            revision: 0,
            updated_at: at,
        }
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.revision += 1;
        self.updated_at = at;
    }
}

// ── Ledger projection ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerOpKind {
    Credit,
    Hold,
    Release,
    Refund,
    Forfeit,
}

pub fn available_account(agent_id: &str) -> String {
    format!("wallet_available:{agent_id}")
}

pub fn escrow_account(agent_id: &str) -> String {
    format!("wallet_escrow:{agent_id}")
}

pub const FUNDING_ACCOUNT: &str = "external:funding";
pub const FORFEITURE_ACCOUNT: &str = "platform:forfeitures";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub account: String,
    pub delta_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerPosting {
    pub kind: LedgerOpKind,
    pub entries: Vec<LedgerEntry>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerProjection {
    pub balances: BTreeMap<String, i64>,
    pub postings: Vec<LedgerPosting>,
}

impl LedgerProjection {
    pub fn balance(&self, account: &str) -> i64 {
        self.balances.get(account).copied().unwrap_or(0)
    }

    fn post(&mut self, kind: LedgerOpKind, entries: Vec<(String, i64)>, at: DateTime<Utc>) {
        debug_assert_eq!(entries.iter().map(|(_, d)| d).sum::<i64>(), 0);
        for (account, delta) in &entries {
            *self.balances.entry(account.clone()).or_insert(0) += delta;
        }
        self.postings.push(LedgerPosting {
            kind,
            entries: entries
                .into_iter()
                .map(|(account, delta_cents)| LedgerEntry { account, delta_cents })
                .collect(),
            at,
        });
    }

    /// Projected balances must equal the wallet snapshot after every op.
    pub fn check_parity(&self, wallet: &AgentWallet) -> Result<(), WalletError> {
        let ledger_available = self.balance(&available_account(&wallet.agent_id));
        let ledger_escrow = self.balance(&escrow_account(&wallet.agent_id));
        if ledger_available != wallet.available_cents || ledger_escrow != wallet.escrow_locked_cents
        {
            return Err(WalletError::LedgerMismatch {
                agent_id: wallet.agent_id.clone(),
                snapshot_available: wallet.available_cents,
                ledger_available,
                snapshot_escrow: wallet.escrow_locked_cents,
                ledger_escrow,
            });
        }
        Ok(())
    }
}

// ── Wallet operations ───────────────────────────────────────────────

fn require_positive(cents: i64) -> Result<(), WalletError> {
    if cents <= 0 {
        return Err(WalletError::NonPositiveAmount { amount: cents });
    }
    Ok(())
}

pub fn credit(
    wallet: &mut AgentWallet,
    ledger: &mut LedgerProjection,
    cents: i64,
    at: DateTime<Utc>,
) -> Result<(), WalletError> {
    require_positive(cents)?;
    wallet.available_cents += cents;
    wallet.touch(at);
    ledger.post(
        LedgerOpKind::Credit,
        vec![
            (FUNDING_ACCOUNT.to_string(), -cents),
            (available_account(&wallet.agent_id), cents),
        ],
        at,
    );
    ledger.check_parity(wallet)
}

pub fn lock_escrow(
    wallet: &mut AgentWallet,
    ledger: &mut LedgerProjection,
    cents: i64,
    at: DateTime<Utc>,
) -> Result<(), WalletError> {
    require_positive(cents)?;
    if wallet.available_cents < cents {
        return Err(WalletError::InsufficientAvailable {
            needed: cents,
            available: wallet.available_cents,
        });
    }
    wallet.available_cents -= cents;
    wallet.escrow_locked_cents += cents;
    wallet.touch(at);
    ledger.post(
        LedgerOpKind::Hold,
        vec![
            (available_account(&wallet.agent_id), -cents),
            (escrow_account(&wallet.agent_id), cents),
        ],
        at,
    );
    ledger.check_parity(wallet)
}

pub fn release_escrow_to_payee(
    payer: &mut AgentWallet,
    payee: &mut AgentWallet,
    ledger: &mut LedgerProjection,
    cents: i64,
    at: DateTime<Utc>,
) -> Result<(), WalletError> {
    require_positive(cents)?;
    if payer.currency != payee.currency {
        return Err(WalletError::CurrencyMismatch {
            payer: payer.currency.clone(),
            payee: payee.currency.clone(),
        });
    }
    if payer.escrow_locked_cents < cents {
        return Err(WalletError::InsufficientEscrow {
            needed: cents,
            locked: payer.escrow_locked_cents,
        });
    }
    payer.escrow_locked_cents -= cents;
    payee.available_cents += cents;
    payer.touch(at);
    payee.touch(at);
    ledger.post(
        LedgerOpKind::Release,
        vec![
            (escrow_account(&payer.agent_id), -cents),
            (available_account(&payee.agent_id), cents),
        ],
        at,
    );
    ledger.check_parity(payer)?;
    ledger.check_parity(payee)
}

pub fn refund_escrow(
    wallet: &mut AgentWallet,
    ledger: &mut LedgerProjection,
    cents: i64,
    at: DateTime<Utc>,
) -> Result<(), WalletError> {
    require_positive(cents)?;
    if wallet.escrow_locked_cents < cents {
        return Err(WalletError::InsufficientEscrow {
            needed: cents,
            locked: wallet.escrow_locked_cents,
        });
    }
    wallet.escrow_locked_cents -= cents;
    wallet.available_cents += cents;
    wallet.touch(at);
    ledger.post(
        LedgerOpKind::Refund,
        vec![
            (escrow_account(&wallet.agent_id), -cents),
            (available_account(&wallet.agent_id), cents),
        ],
        at,
    );
    ledger.check_parity(wallet)
}

/// Available-to-available transfer, used when a verdict reconciles an
/// already-disbursed settlement.
pub fn transfer_available(
    from: &mut AgentWallet,
    to: &mut AgentWallet,
    ledger: &mut LedgerProjection,
    cents: i64,
    at: DateTime<Utc>,
) -> Result<(), WalletError> {
    require_positive(cents)?;
    if from.currency != to.currency {
        return Err(WalletError::CurrencyMismatch {
            payer: from.currency.clone(),
            payee: to.currency.clone(),
        });
    }
    if from.available_cents < cents {
        return Err(WalletError::InsufficientAvailable {
            needed: cents,
            available: from.available_cents,
        });
    }
    from.available_cents -= cents;
    to.available_cents += cents;
    from.touch(at);
    to.touch(at);
    ledger.post(
        LedgerOpKind::Release,
        vec![
            (available_account(&from.agent_id), -cents),
            (available_account(&to.agent_id), cents),
        ],
        at,
    );
    ledger.check_parity(from)?;
    ledger.check_parity(to)
}

pub fn forfeit_escrow(
    wallet: &mut AgentWallet,
    ledger: &mut LedgerProjection,
    cents: i64,
    at: DateTime<Utc>,
) -> Result<(), WalletError> {
    require_positive(cents)?;
    if wallet.escrow_locked_cents < cents {
        return Err(WalletError::InsufficientEscrow {
            needed: cents,
            locked: wallet.escrow_locked_cents,
        });
    }
    wallet.escrow_locked_cents -= cents;
    wallet.touch(at);
    ledger.post(
        LedgerOpKind::Forfeit,
        vec![
            (escrow_account(&wallet.agent_id), -cents),
            (FORFEITURE_ACCOUNT.to_string(), cents),
        ],
        at,
    );
    ledger.check_parity(wallet)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn lock_then_release_conserves_total() {
        let at = now();
        let mut payer = AgentWallet::new("a1", "USD", at);
        let mut payee = AgentWallet::new("a2", "USD", at);
        let mut ledger = LedgerProjection::default();

        credit(&mut payer, &mut ledger, 50_000, at).unwrap();
        lock_escrow(&mut payer, &mut ledger, 50_000, at).unwrap();
        release_escrow_to_payee(&mut payer, &mut payee, &mut ledger, 50_000, at).unwrap();

        assert_eq!(payer.available_cents, 0);
        assert_eq!(payer.escrow_locked_cents, 0);
        assert_eq!(payee.available_cents, 50_000);
        assert_eq!(
            payer.available_cents
                + payer.escrow_locked_cents
                + payee.available_cents
                + payee.escrow_locked_cents,
            50_000
        );
    }

    #[test]
    fn overdraw_is_rejected() {
        let at = now();
        let mut w = AgentWallet::new("a1", "USD", at);
        let mut ledger = LedgerProjection::default();
        let err = lock_escrow(&mut w, &mut ledger, 100, at).unwrap_err();
        assert_eq!(err.code(), "WALLET_INSUFFICIENT_AVAILABLE");
        assert_eq!(w.revision, 0);
    }

    #[test]
    fn refund_returns_escrow_to_available() {
        let at = now();
        let mut w = AgentWallet::new("a1", "USD", at);
        let mut ledger = LedgerProjection::default();
        credit(&mut w, &mut ledger, 1_000, at).unwrap();
        lock_escrow(&mut w, &mut ledger, 600, at).unwrap();
        refund_escrow(&mut w, &mut ledger, 600, at).unwrap();
        assert_eq!(w.available_cents, 1_000);
        assert_eq!(w.escrow_locked_cents, 0);
        assert_eq!(w.revision, 3);
    }
}
