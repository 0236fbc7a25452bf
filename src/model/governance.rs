//! Governance stream: server/robot/operator/agent signer keys and
//! effective-dated tenant policy overrides.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chain::Event;
use crate::model::ReduceError;
use crate::model::event::{HoldPolicy, ProofGateMode, SignerOwnerKind, TenantPolicyOverride};

pub const DEFAULT_TENANT_ID: &str = "default";
pub const GOVERNANCE_STREAM: &str = "governance";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignerKeyStatus {
    Active,
    Revoked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignerKeyRecord {
    pub key_id: String,
    pub public_key: String,
    pub owner_kind: SignerOwnerKind,
    pub owner_id: Option<String>,
    pub status: SignerKeyStatus,
}

/// A policy override with the order it was committed in, for tie-breaking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyOverride {
    pub effective_from: DateTime<Utc>,
    pub policy: TenantPolicyOverride,
}

/// Fully resolved tenant policy after folding overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantPolicy {
    pub month_close_hold_policy: HoldPolicy,
    pub proof_gate_mode: ProofGateMode,
    pub evidence_retention_days: u32,
    pub allow_reproof_after_settlement_within_dispute_window: bool,
    pub ingest_dlq_depth_limit: u32,
}

impl Default for TenantPolicy {
    fn default() -> Self {
        TenantPolicy {
            month_close_hold_policy: HoldPolicy::BlockAnyOpenHolds,
            proof_gate_mode: ProofGateMode::Strict,
            evidence_retention_days: 90,
            allow_reproof_after_settlement_within_dispute_window: false,
            ingest_dlq_depth_limit: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Governance {
    pub signer_keys: HashMap<String, SignerKeyRecord>,
    /// Overrides in committed order.
    pub overrides: Vec<PolicyOverride>,
}

impl Governance {
    pub fn active_key(&self, key_id: &str) -> Option<&SignerKeyRecord> {
        self.signer_keys
            .get(key_id)
            .filter(|k| k.status == SignerKeyStatus::Active)
    }

    /// Resolve the policy in force just before `cutoff`. Overrides apply
    /// field-wise in committed order; for each field the latest override with
    /// `effective_from < cutoff` that sets it wins (ties break by committed
    /// order, later wins).
    pub fn policy_at(&self, cutoff: DateTime<Utc>) -> TenantPolicy {
        let mut applicable: Vec<&PolicyOverride> = self
            .overrides
            .iter()
            .filter(|o| o.effective_from < cutoff)
            .collect();
        applicable.sort_by_key(|o| o.effective_from);

        let mut policy = TenantPolicy::default();
        for o in applicable {
            let p = &o.policy;
            if let Some(hp) = p.month_close_hold_policy {
                policy.month_close_hold_policy = hp;
            }
            if let Some(gm) = p.proof_gate_mode {
                policy.proof_gate_mode = gm;
            }
            if let Some(days) = p.evidence_retention_days {
                policy.evidence_retention_days = days;
            }
            if let Some(allow) = p.allow_reproof_after_settlement_within_dispute_window {
                policy.allow_reproof_after_settlement_within_dispute_window = allow;
            }
            if let Some(limit) = p.ingest_dlq_depth_limit {
                policy.ingest_dlq_depth_limit = limit;
            }
        }
        policy
    }
}

pub fn reduce(events: &[Event]) -> Result<Governance, ReduceError> {
    use crate::model::event::EventBody as B;

    let mut gov = Governance::default();
    for event in events {
        match &event.body {
            B::SignerKeyRegistered {
                key_id,
                public_key,
                owner_kind,
                owner_id,
            } => {
                gov.signer_keys.insert(
                    key_id.clone(),
                    SignerKeyRecord {
                        key_id: key_id.clone(),
                        public_key: public_key.clone(),
                        owner_kind: *owner_kind,
                        owner_id: owner_id.clone(),
                        status: SignerKeyStatus::Active,
                    },
                );
            }
            B::SignerKeyRotated {
                key_id,
                public_key,
                replaces_key_id,
            } => {
                let old = gov.signer_keys.get_mut(replaces_key_id).ok_or(
                    ReduceError::MissingPrerequisite {
                        what: "key being rotated",
                        event_type: "SIGNER_KEY_ROTATED".to_string(),
                    },
                )?;
                old.status = SignerKeyStatus::Revoked;
                let (owner_kind, owner_id) = (old.owner_kind, old.owner_id.clone());
                gov.signer_keys.insert(
                    key_id.clone(),
                    SignerKeyRecord {
                        key_id: key_id.clone(),
                        public_key: public_key.clone(),
                        owner_kind,
                        owner_id,
                        status: SignerKeyStatus::Active,
                    },
                );
            }
            B::SignerKeyRevoked { key_id, .. } => {
                let key = gov.signer_keys.get_mut(key_id).ok_or(
                    ReduceError::MissingPrerequisite {
                        what: "key being revoked",
                        event_type: "SIGNER_KEY_REVOKED".to_string(),
                    },
                )?;
                key.status = SignerKeyStatus::Revoked;
            }
            B::TenantPolicyUpdated { effective_from, policy } => {
                gov.overrides.push(PolicyOverride {
                    effective_from: *effective_from,
                    policy: policy.clone(),
                });
            }
            _ => {
                return Err(ReduceError::WrongAggregate {
                    event_type: event.type_str(),
                });
            }
        }
    }
    Ok(gov)
}
