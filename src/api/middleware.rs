//! Cross-cutting request plumbing: tenancy, protocol negotiation, rate
//! limiting, request ids, idempotency and precondition headers.

use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use super::error::ApiError;
use super::state::{AppState, PROTOCOL_CURRENT, PROTOCOL_MIN};

pub const TENANT_HEADER: &str = "x-settld-tenant-id";
pub const PROTOCOL_HEADER: &str = "x-settld-protocol";
pub const IDEMPOTENCY_HEADER: &str = "x-idempotency-key";
pub const EXPECTED_PREV_HEADER: &str = "x-proxy-expected-prev-chain-hash";

// ── Extractors ──────────────────────────────────────────────────────

pub struct Tenant(pub String);

impl FromRequestParts<AppState> for Tenant {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let tenant = parts
            .headers
            .get(TENANT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| state.config.default_tenant.clone());
        if tenant.is_empty() {
            return Err(ApiError::bad_request("TENANT_INVALID", "empty tenant id"));
        }
        Ok(Tenant(tenant))
    }
}

fn idempotency_key_valid(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 128
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-')
}

pub struct IdempotencyKey(pub Option<String>);

impl FromRequestParts<AppState> for IdempotencyKey {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        match parts.headers.get(IDEMPOTENCY_HEADER) {
            None => Ok(IdempotencyKey(None)),
            Some(v) => {
                let key = v
                    .to_str()
                    .map_err(|_| ApiError::bad_request("IDEMPOTENCY_KEY_INVALID", "bad header"))?;
                if !idempotency_key_valid(key) {
                    return Err(ApiError::bad_request(
                        "IDEMPOTENCY_KEY_INVALID",
                        "key must be <= 128 bytes of [a-zA-Z0-9._-]",
                    ));
                }
                Ok(IdempotencyKey(Some(key.to_string())))
            }
        }
    }
}

/// `x-proxy-expected-prev-chain-hash`: stream-head precondition on event
/// writes. `"null"` means "expect an empty stream".
pub struct ExpectedPrevHash(pub Option<String>);

impl FromRequestParts<AppState> for ExpectedPrevHash {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        Ok(ExpectedPrevHash(
            parts
                .headers
                .get(EXPECTED_PREV_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        ))
    }
}

// ── Protocol negotiation ────────────────────────────────────────────

fn parse_semver(s: &str) -> Option<(u64, u64, u64)> {
    let mut parts = s.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

fn check_protocol(state: &AppState, header: Option<&str>) -> Result<(), ApiError> {
    let Some(raw) = header else {
        if state.config.protocol_required {
            return Err(ApiError::bad_request(
                "PROTOCOL_REQUIRED",
                "x-settld-protocol header is required",
            ));
        }
        return Ok(());
    };
    let Some(requested) = parse_semver(raw) else {
        return Err(ApiError::bad_request("PROTOCOL_INVALID", "bad semver"));
    };
    let min = parse_semver(PROTOCOL_MIN).expect("const semver");
    let current = parse_semver(PROTOCOL_CURRENT).expect("const semver");

    if let Some(cutoff) = &state.config.protocol_deprecated_before {
        if let Some(cutoff) = parse_semver(cutoff) {
            if requested < cutoff {
                return Err(ApiError::bad_request(
                    "PROTOCOL_DEPRECATED",
                    format!("protocol {raw} is past its deprecation cutoff"),
                ));
            }
        }
    }
    if requested < min {
        return Err(ApiError::new(
            axum::http::StatusCode::UPGRADE_REQUIRED,
            "PROTOCOL_TOO_OLD",
            format!("protocol {raw} is older than {PROTOCOL_MIN}"),
        ));
    }
    if requested > current {
        return Err(ApiError::bad_request(
            "PROTOCOL_TOO_NEW",
            format!("protocol {raw} is newer than {PROTOCOL_CURRENT}"),
        ));
    }
    Ok(())
}

// ── Control-plane layer ─────────────────────────────────────────────

/// Request id, protocol negotiation, per-tenant rate limit, response
/// headers, request metrics.
pub async fn control_plane(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let request_id = format!("req_{}", Uuid::new_v4().simple());
    let method = req.method().to_string();

    let protocol = req
        .headers()
        .get(PROTOCOL_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let tenant = req
        .headers()
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| state.config.default_tenant.clone());

    let mut response = if let Err(e) = check_protocol(&state, protocol.as_deref()) {
        e.into_response()
    } else if let Err(retry_after) = state.limiter.check(&tenant).await {
        state.metrics.rate_limited_total.inc();
        ApiError::rate_limited(retry_after).into_response()
    } else {
        next.run(req).await
    };

    state
        .metrics
        .http_requests_total
        .with_label_values(&[&method, response.status().as_str()])
        .inc();

    let headers = response.headers_mut();
    let build = state.config.build.clone();
    if let Ok(v) = request_id.parse() {
        headers.insert("x-request-id", v);
    }
    if let Ok(v) = PROTOCOL_CURRENT.parse() {
        headers.insert("x-settld-protocol", v);
    }
    if let Ok(v) = format!("{PROTOCOL_MIN}..{PROTOCOL_CURRENT}").parse() {
        headers.insert("x-settld-supported-protocols", v);
    }
    if let Ok(v) = build.parse() {
        headers.insert("x-settld-build", v);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semver_parses() {
        assert_eq!(parse_semver("1.2.3"), Some((1, 2, 3)));
        assert_eq!(parse_semver("1.2"), None);
        assert_eq!(parse_semver("x.y.z"), None);
    }

    #[test]
    fn idempotency_charset() {
        assert!(idempotency_key_valid("abc.DEF_123-xyz"));
        assert!(!idempotency_key_valid(""));
        assert!(!idempotency_key_valid("has space"));
        assert!(!idempotency_key_valid(&"k".repeat(129)));
    }
}
