//! HMAC webhook signatures, evidence presigning, and URL safety checks.

use std::net::{IpAddr, ToSocketAddrs};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::canonical::{CanonicalError, canonical_json};

type HmacSha256 = Hmac<Sha256>;

pub const PRESIGN_DEFAULT_TTL_SECS: u64 = 300;
pub const PRESIGN_MAX_TTL_SECS: u64 = 3_600;

/// `base64(HMAC-SHA256(secret, timestamp || "." || canonicalJson(body)))`.
/// The receiver recomputes over the same timestamp header and raw body.
pub fn webhook_signature<T: serde::Serialize>(
    secret: &str,
    timestamp: &str,
    body: &T,
) -> Result<String, CanonicalError> {
    let canonical = canonical_json(body)?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(canonical.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

pub fn verify_webhook_signature<T: serde::Serialize>(
    secret: &str,
    timestamp: &str,
    body: &T,
    signature: &str,
) -> Result<bool, CanonicalError> {
    Ok(webhook_signature(secret, timestamp, body)? == signature)
}

/// Hex presign token for evidence downloads.
pub fn evidence_presign(
    secret: &str,
    tenant_id: &str,
    job_id: &str,
    evidence_id: &str,
    evidence_ref: &str,
    expires_at: DateTime<Utc>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(tenant_id.as_bytes());
    hasher.update(job_id.as_bytes());
    hasher.update(evidence_id.as_bytes());
    hasher.update(evidence_ref.as_bytes());
    hasher.update(expires_at.timestamp().to_string().as_bytes());
    hex::encode(hasher.finalize())
}

pub fn clamp_presign_ttl(requested_secs: Option<u64>) -> u64 {
    requested_secs
        .unwrap_or(PRESIGN_DEFAULT_TTL_SECS)
        .min(PRESIGN_MAX_TTL_SECS)
}

pub fn presign_valid(
    secret: &str,
    tenant_id: &str,
    job_id: &str,
    evidence_id: &str,
    evidence_ref: &str,
    expires_at: DateTime<Utc>,
    token: &str,
    now: DateTime<Utc>,
) -> bool {
    if now > expires_at {
        return false;
    }
    evidence_presign(secret, tenant_id, job_id, evidence_id, evidence_ref, expires_at) == token
}

// ── URL safety ──────────────────────────────────────────────────────

fn ip_is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

/// Resolve the destination host and reject private/loopback ranges unless
/// `allow_private` (dev-only env flag) is set.
pub fn url_is_safe(url: &str, allow_private: bool) -> bool {
    if allow_private {
        return true;
    }
    let Some(rest) = url.strip_prefix("https://").or_else(|| url.strip_prefix("http://")) else {
        return false;
    };
    let authority = rest.split(['/', '?']).next().unwrap_or("");
    let host_port = if let Some(stripped) = authority.strip_prefix('[') {
        // [::1]:8080 style v6 literal
        stripped.split(']').next().unwrap_or("").to_string()
    } else {
        authority.split(':').next().unwrap_or("").to_string()
    };
    if host_port.is_empty() {
        return false;
    }

    if let Ok(ip) = host_port.parse::<IpAddr>() {
        return !ip_is_private(ip);
    }

    match (host_port.as_str(), 443u16).to_socket_addrs() {
        Ok(addrs) => {
            let mut any = false;
            for addr in addrs {
                any = true;
                if ip_is_private(addr.ip()) {
                    return false;
                }
            }
            any
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signature_is_stable_across_key_order() {
        let a = webhook_signature("s3cret", "1700000000", &json!({"a": 1, "b": 2})).unwrap();
        let b = webhook_signature("s3cret", "1700000000", &json!({"b": 2, "a": 1})).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn signature_changes_with_timestamp() {
        let a = webhook_signature("s3cret", "1", &json!({"a": 1})).unwrap();
        let b = webhook_signature("s3cret", "2", &json!({"a": 1})).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn presign_expires() {
        let now = Utc::now();
        let expired = now - chrono::Duration::seconds(1);
        let token = evidence_presign("k", "t", "j", "e", "ref", expired);
        assert!(!presign_valid("k", "t", "j", "e", "ref", expired, &token, now));
    }

    #[test]
    fn ttl_is_clamped() {
        assert_eq!(clamp_presign_ttl(None), 300);
        assert_eq!(clamp_presign_ttl(Some(10_000)), 3_600);
    }

    #[test]
    fn loopback_urls_are_unsafe() {
        assert!(!url_is_safe("http://127.0.0.1:9000/hook", false));
        assert!(!url_is_safe("http://10.0.0.8/hook", false));
        assert!(url_is_safe("http://127.0.0.1:9000/hook", true));
    }
}
