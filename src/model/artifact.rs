//! Content-addressed artifacts. The hash covers the canonical core body, so
//! the same source events and payload always produce the same artifact hash.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::{CanonicalError, canonical_json};
use crate::chain::{Event, sha256_hex};

pub const WORK_CERTIFICATE_V1: &str = "WorkCertificate.v1";
pub const SETTLEMENT_STATEMENT_V1: &str = "SettlementStatement.v1";
pub const PROOF_RECEIPT_V1: &str = "ProofReceipt.v1";
pub const DISPUTE_VERDICT_V1: &str = "DisputeVerdict.v1";
pub const GL_BATCH_V1: &str = "GLBatch.v1";
pub const JOURNAL_CSV_V1: &str = "JournalCsv.v1";
pub const FINANCE_PACK_BUNDLE_V1: &str = "FinancePackBundle.v1";

/// Pointer from an artifact back to the event(s) it attests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventProof {
    pub event_id: String,
    pub chain_hash: String,
    pub payload_hash: String,
}

impl EventProof {
    pub fn of(event: &Event) -> Self {
        EventProof {
            event_id: event.id.clone(),
            chain_hash: event.chain_hash.clone(),
            payload_hash: event.payload_hash.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactBody {
    pub schema_version: String,
    pub source_event_proofs: Vec<EventProof>,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_id: String,
    pub artifact_type: String,
    pub artifact_hash: String,
    pub body: ArtifactBody,
}

/// Build an artifact. `artifact_id` is derived from the source anchor so the
/// worker stays idempotent: re-deriving from the same events yields the same
/// id and hash.
pub fn build_artifact(
    schema_version: &str,
    source_events: &[&Event],
    payload: Value,
) -> Result<Artifact, CanonicalError> {
    let body = ArtifactBody {
        schema_version: schema_version.to_string(),
        source_event_proofs: source_events.iter().map(|e| EventProof::of(e)).collect(),
        payload,
    };
    let artifact_hash = sha256_hex(canonical_json(&body)?.as_bytes());
    let anchor = source_events
        .first()
        .map(|e| e.id.as_str())
        .unwrap_or("detached");
    let artifact_id = format!(
        "art_{}",
        sha256_hex(format!("{schema_version}:{anchor}").as_bytes())
            .chars()
            .take(24)
            .collect::<String>()
    );
    Ok(Artifact {
        artifact_id,
        artifact_type: schema_version.to_string(),
        artifact_hash,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::event::{Actor, EventBody};
    use chrono::Utc;

    #[test]
    fn same_inputs_same_hash() {
        let e = crate::chain::create_event(
            "job:j1",
            EventBody::JobCancelled {
                reason: "x".into(),
            },
            Actor::System,
            Utc::now(),
            None,
        )
        .unwrap();
        let a = build_artifact(WORK_CERTIFICATE_V1, &[&e], serde_json::json!({"ok": true})).unwrap();
        let b = build_artifact(WORK_CERTIFICATE_V1, &[&e], serde_json::json!({"ok": true})).unwrap();
        assert_eq!(a.artifact_hash, b.artifact_hash);
        assert_eq!(a.artifact_id, b.artifact_id);
    }
}
