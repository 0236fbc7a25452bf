//! Hash-chained event envelopes.
//!
//! Every event carries `payload_hash = sha256(canonical_json(payload))` and
//! `chain_hash = sha256(prev_chain_hash || payload_hash || id || at || type)`.
//! Within a stream, event N's `prev_chain_hash` must equal event N-1's
//! `chain_hash`; the first event links from nothing. Server-side events are
//! signed over the chain hash with Ed25519.

use std::collections::HashMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, SecondsFormat, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::canonical::{CanonicalError, canonical_json};
use crate::model::event::{Actor, EventBody};

pub const EVENT_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("chain break at index {index}: prev link does not match")]
    ChainBreak { index: usize },

    #[error("payload hash mismatch on event {event_id}")]
    PayloadHashMismatch { event_id: String },

    #[error("invalid signature on event {event_id}")]
    SignatureInvalid { event_id: String },

    #[error("no registered key for signer {key_id}")]
    UnknownSignerKey { key_id: String },

    #[error("event {event_id} is signed but carries no signer_key_id")]
    SignerKeyIdMissing { event_id: String },

    #[error("bad public key encoding: {0}")]
    BadPublicKey(String),

    #[error(transparent)]
    Canonical(#[from] CanonicalError),

    #[error("serializing event body: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl ChainError {
    pub fn code(&self) -> &'static str {
        match self {
            ChainError::ChainBreak { .. } => "CHAIN_BREAK",
            ChainError::PayloadHashMismatch { .. } => "PAYLOAD_HASH_MISMATCH",
            ChainError::SignatureInvalid { .. } => "SIGNATURE_INVALID",
            ChainError::UnknownSignerKey { .. } => "UNKNOWN_SIGNER_KEY",
            ChainError::SignerKeyIdMissing { .. } => "SIGNATURE_INVALID",
            ChainError::BadPublicKey(_) => "UNKNOWN_SIGNER_KEY",
            ChainError::Canonical(_) | ChainError::Serialize(_) => "CANONICALIZATION_FAILED",
        }
    }
}

mod rfc3339_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub v: u8,
    pub id: String,
    pub stream_id: String,
    #[serde(flatten)]
    pub body: EventBody,
    #[serde(with = "rfc3339_millis")]
    pub at: DateTime<Utc>,
    pub actor: Actor,
    pub payload_hash: String,
    pub prev_chain_hash: Option<String>,
    pub chain_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer_key_id: Option<String>,
}

impl Event {
    /// The exact `at` string that fed the chain hash.
    pub fn at_str(&self) -> String {
        self.at.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn type_str(&self) -> String {
        self.body.type_str()
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn compute_chain_hash(
    prev_chain_hash: Option<&str>,
    payload_hash: &str,
    id: &str,
    at: &str,
    event_type: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_chain_hash.unwrap_or("").as_bytes());
    hasher.update(payload_hash.as_bytes());
    hasher.update(id.as_bytes());
    hasher.update(at.as_bytes());
    hasher.update(event_type.as_bytes());
    hex::encode(hasher.finalize())
}

/// Build an unsigned event linked to the current stream head.
pub fn create_event(
    stream_id: &str,
    body: EventBody,
    actor: Actor,
    at: DateTime<Utc>,
    prev_chain_hash: Option<String>,
) -> Result<Event, ChainError> {
    let (event_type, payload) = body.parts()?;
    let payload_hash = sha256_hex(canonical_json(&payload)?.as_bytes());
    let id = format!("evt_{}", Uuid::new_v4().simple());
    let at_str = at.to_rfc3339_opts(SecondsFormat::Millis, true);
    let chain_hash = compute_chain_hash(
        prev_chain_hash.as_deref(),
        &payload_hash,
        &id,
        &at_str,
        &event_type,
    );

    Ok(Event {
        v: EVENT_VERSION,
        id,
        stream_id: stream_id.to_string(),
        body,
        at,
        actor,
        payload_hash,
        prev_chain_hash,
        chain_hash,
        signature: None,
        signer_key_id: None,
    })
}

/// Sign the chain hash; signature is base64 Ed25519.
pub fn sign_event(event: &mut Event, key: &SigningKey, key_id: &str) {
    let sig = key.sign(event.chain_hash.as_bytes());
    event.signature = Some(BASE64.encode(sig.to_bytes()));
    event.signer_key_id = Some(key_id.to_string());
}

/// Verify a single event's signature against a registered key set.
pub fn verify_signature(
    event: &Event,
    keys: &HashMap<String, VerifyingKey>,
) -> Result<(), ChainError> {
    let Some(sig_b64) = &event.signature else {
        return Ok(());
    };
    let key_id = event
        .signer_key_id
        .as_deref()
        .ok_or_else(|| ChainError::SignerKeyIdMissing {
            event_id: event.id.clone(),
        })?;
    let key = keys.get(key_id).ok_or_else(|| ChainError::UnknownSignerKey {
        key_id: key_id.to_string(),
    })?;
    let sig_bytes = BASE64
        .decode(sig_b64)
        .map_err(|_| ChainError::SignatureInvalid {
            event_id: event.id.clone(),
        })?;
    let sig = Signature::from_slice(&sig_bytes).map_err(|_| ChainError::SignatureInvalid {
        event_id: event.id.clone(),
    })?;
    key.verify(event.chain_hash.as_bytes(), &sig)
        .map_err(|_| ChainError::SignatureInvalid {
            event_id: event.id.clone(),
        })
}

/// Recompute one event's payload and chain hashes. Used on client-supplied
/// events before they are considered for append.
pub fn verify_event_integrity(event: &Event) -> Result<(), ChainError> {
    let (event_type, payload) = event.body.parts()?;
    let payload_hash = sha256_hex(canonical_json(&payload)?.as_bytes());
    if payload_hash != event.payload_hash {
        return Err(ChainError::PayloadHashMismatch {
            event_id: event.id.clone(),
        });
    }
    let chain_hash = compute_chain_hash(
        event.prev_chain_hash.as_deref(),
        &payload_hash,
        &event.id,
        &event.at_str(),
        &event_type,
    );
    if chain_hash != event.chain_hash {
        return Err(ChainError::ChainBreak { index: 0 });
    }
    Ok(())
}

/// Recompute every payload hash, every chain link, and every signature.
pub fn verify_chain(
    events: &[Event],
    keys: &HashMap<String, VerifyingKey>,
) -> Result<(), ChainError> {
    for (i, event) in events.iter().enumerate() {
        let (event_type, payload) = event.body.parts()?;
        let payload_hash = sha256_hex(canonical_json(&payload)?.as_bytes());
        if payload_hash != event.payload_hash {
            return Err(ChainError::PayloadHashMismatch {
                event_id: event.id.clone(),
            });
        }

        let expected_prev = if i == 0 {
            None
        } else {
            Some(events[i - 1].chain_hash.as_str())
        };
        if event.prev_chain_hash.as_deref() != expected_prev {
            return Err(ChainError::ChainBreak { index: i });
        }

        let chain_hash = compute_chain_hash(
            event.prev_chain_hash.as_deref(),
            &payload_hash,
            &event.id,
            &event.at_str(),
            &event_type,
        );
        if chain_hash != event.chain_hash {
            return Err(ChainError::ChainBreak { index: i });
        }

        verify_signature(event, keys)?;
    }
    Ok(())
}

/// The server's active signing identity, injected into handlers and workers.
pub struct ServerSigner {
    pub key_id: String,
    pub key: SigningKey,
}

impl ServerSigner {
    pub fn sign(&self, event: &mut Event) {
        sign_event(event, &self.key, &self.key_id);
    }
}

// ── Key helpers ─────────────────────────────────────────────────────

/// Mint a fresh Ed25519 keypair; returns the key and its base64 public half.
pub fn generate_signing_key() -> (SigningKey, String) {
    use rand::Rng;
    let seed: [u8; 32] = rand::rng().random();
    let key = SigningKey::from_bytes(&seed);
    let public = BASE64.encode(key.verifying_key().to_bytes());
    (key, public)
}

pub fn encode_public_key(key: &VerifyingKey) -> String {
    BASE64.encode(key.to_bytes())
}

pub fn decode_public_key(b64: &str) -> Result<VerifyingKey, ChainError> {
    let bytes = BASE64
        .decode(b64)
        .map_err(|e| ChainError::BadPublicKey(e.to_string()))?;
    let arr: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| ChainError::BadPublicKey("expected 32 bytes".into()))?;
    VerifyingKey::from_bytes(&arr).map_err(|e| ChainError::BadPublicKey(e.to_string()))
}

pub fn decode_signing_key(b64: &str) -> Result<SigningKey, ChainError> {
    let bytes = BASE64
        .decode(b64)
        .map_err(|e| ChainError::BadPublicKey(e.to_string()))?;
    let arr: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| ChainError::BadPublicKey("expected 32 bytes".into()))?;
    Ok(SigningKey::from_bytes(&arr))
}

pub fn encode_signing_key(key: &SigningKey) -> String {
    BASE64.encode(key.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::event::EventBody;

    fn sample_body() -> EventBody {
        EventBody::JobCreated {
            template_id: "tmpl_patrol".into(),
            customer_id: "cust_1".into(),
            site_id: "site_1".into(),
            zone: "z1".into(),
            tier: "standard".into(),
            privacy_mode: "minimal".into(),
            coverage_required: false,
        }
    }

    #[test]
    fn chain_links_and_verifies() {
        let at = Utc::now();
        let e0 = create_event("job:j1", sample_body(), Actor::System, at, None).unwrap();
        let e1 = create_event(
            "job:j1",
            EventBody::JobCancelled {
                reason: "test".into(),
            },
            Actor::System,
            at,
            Some(e0.chain_hash.clone()),
        )
        .unwrap();
        verify_chain(&[e0, e1], &HashMap::new()).unwrap();
    }

    #[test]
    fn tampered_payload_is_detected() {
        let at = Utc::now();
        let mut e0 = create_event("job:j1", sample_body(), Actor::System, at, None).unwrap();
        e0.body = EventBody::JobCancelled {
            reason: "tamper".into(),
        };
        let err = verify_chain(std::slice::from_ref(&e0), &HashMap::new()).unwrap_err();
        assert_eq!(err.code(), "PAYLOAD_HASH_MISMATCH");
    }

    #[test]
    fn broken_link_is_detected() {
        let at = Utc::now();
        let e0 = create_event("job:j1", sample_body(), Actor::System, at, None).unwrap();
        let e1 = create_event(
            "job:j1",
            EventBody::JobCancelled {
                reason: "x".into(),
            },
            Actor::System,
            at,
            Some("deadbeef".into()),
        )
        .unwrap();
        let err = verify_chain(&[e0, e1], &HashMap::new()).unwrap_err();
        assert_eq!(err.code(), "CHAIN_BREAK");
    }

    #[test]
    fn signature_round_trip() {
        let (key, public_b64) = generate_signing_key();
        let at = Utc::now();
        let mut e0 = create_event("job:j1", sample_body(), Actor::System, at, None).unwrap();
        sign_event(&mut e0, &key, "srvkey_1");

        let mut keys = HashMap::new();
        keys.insert("srvkey_1".to_string(), decode_public_key(&public_b64).unwrap());
        verify_chain(std::slice::from_ref(&e0), &keys).unwrap();

        keys.clear();
        let err = verify_chain(std::slice::from_ref(&e0), &keys).unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_SIGNER_KEY");
    }
}
